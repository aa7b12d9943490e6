mod engine;
mod error;
mod model;
mod rig_backend;
mod worker;

pub use engine::{
    BoxFuture, CancelFlag, ChatCompletionChunk, ChatCompletionRequest, ChunkSender, ChunkStream,
    EngineConfig, EngineFactory, EngineMessage, FinishReason, InferenceEngine,
    InitProgressCallback, InitProgressReport, Role, chunk_channel,
};
pub use error::{EngineError, EngineResult};
pub use model::{
    AppConfig, CacheBackend, DEFAULT_MODEL_ID, ModelCache, ModelDescriptor, ModelRegistry,
    builtin_models, get_model_cache, model_cache_for,
};
pub use rig_backend::{DEFAULT_ENDPOINT, ProviderConfig, RigBackend};
pub use worker::{
    DeltaSink, EngineBackend, GenerationStats, NO_STATS_TEXT, ProgressSink, WorkerEngine,
    WorkerEngineFactory,
};

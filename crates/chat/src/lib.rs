mod error;
/// Chat entities and the generation phase state machine.
pub mod message;
mod orchestrator;
pub mod render;
mod settings;
mod store;

pub use error::{ChatError, ChatResult, SettingsError};
pub use message::{
    ChatMessage, ContentPart, GenerationId, GenerationPhase, MessageContent, PhaseRejection,
    PhaseTransition, Role,
};
pub use orchestrator::{
    ChatOrchestrator, GENERATION_FAILED_MESSAGE, GenerationOptions, LOAD_FAILED_PREFIX,
    SendOutcome,
};
pub use render::{MarkdownBlock, RenderedBody, RenderedMessage, RoleIcon, render_message};
pub use settings::{ChatSettings, SettingsStore, ThemeChoice};
pub use store::{ChatState, ChatStore};

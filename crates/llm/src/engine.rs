use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::mpsc;

use super::error::EngineResult;
use super::model::AppConfig;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Speaker role as the engine sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineMessage {
    pub role: Role,
    pub content: String,
}

impl EngineMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChatCompletionRequest {
    pub messages: Vec<EngineMessage>,
    pub stream: bool,
    pub temperature: Option<f64>,
    pub max_gen_len: Option<u64>,
}

impl ChatCompletionRequest {
    pub fn streaming(messages: Vec<EngineMessage>) -> Self {
        Self {
            messages,
            stream: true,
            temperature: None,
            max_gen_len: None,
        }
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_gen_len(mut self, max_gen_len: u64) -> Self {
        self.max_gen_len = Some(max_gen_len);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    Stop,
    Abort,
}

/// One streamed fragment of a chat completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatCompletionChunk {
    pub delta: Option<String>,
    pub finish_reason: Option<FinishReason>,
}

impl ChatCompletionChunk {
    pub fn delta(text: impl Into<String>) -> Self {
        Self {
            delta: Some(text.into()),
            finish_reason: None,
        }
    }

    pub fn finished(reason: FinishReason) -> Self {
        Self {
            delta: None,
            finish_reason: Some(reason),
        }
    }
}

/// Human-readable model loading progress.
#[derive(Debug, Clone, PartialEq)]
pub struct InitProgressReport {
    /// Fraction in `[0, 1]`.
    pub progress: f64,
    /// Seconds since loading started.
    pub time_elapsed: f64,
    pub text: String,
}

pub type InitProgressCallback = Arc<dyn Fn(InitProgressReport) + Send + Sync>;

#[derive(Clone)]
pub struct EngineConfig {
    pub init_progress_callback: Option<InitProgressCallback>,
    pub app_config: AppConfig,
}

impl EngineConfig {
    pub fn new(app_config: AppConfig) -> Self {
        Self {
            init_progress_callback: None,
            app_config,
        }
    }

    pub fn with_progress_callback(mut self, callback: InitProgressCallback) -> Self {
        self.init_progress_callback = Some(callback);
        self
    }

    pub(crate) fn report_progress(&self, report: InitProgressReport) {
        if let Some(callback) = &self.init_progress_callback {
            callback(report);
        }
    }
}

/// Shared cooperative cancellation signal, checked between chunks.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub type ChunkSender = mpsc::UnboundedSender<EngineResult<ChatCompletionChunk>>;

/// Consumer side of a streaming chat completion.
///
/// Chunks arrive in generation order. The stream ends after the final chunk or an error item.
pub struct ChunkStream {
    chunks: mpsc::UnboundedReceiver<EngineResult<ChatCompletionChunk>>,
}

impl ChunkStream {
    pub async fn next_chunk(&mut self) -> Option<EngineResult<ChatCompletionChunk>> {
        self.chunks.recv().await
    }
}

impl Stream for ChunkStream {
    type Item = EngineResult<ChatCompletionChunk>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.chunks.poll_recv(cx)
    }
}

pub fn chunk_channel() -> (ChunkSender, ChunkStream) {
    let (chunk_tx, chunk_rx) = mpsc::unbounded_channel();
    (chunk_tx, ChunkStream { chunks: chunk_rx })
}

/// Handle to a loaded inference engine.
pub trait InferenceEngine: Send + Sync {
    fn model_id(&self) -> &str;
    fn chat_completions_create<'a>(
        &'a self,
        request: ChatCompletionRequest,
    ) -> BoxFuture<'a, EngineResult<ChunkStream>>;
    fn reset_chat<'a>(&'a self) -> BoxFuture<'a, EngineResult<()>>;
    fn unload<'a>(&'a self) -> BoxFuture<'a, EngineResult<()>>;
    /// Fire-and-forget request to stop the current generation.
    fn interrupt_generate(&self);
    fn runtime_stats_text<'a>(&'a self) -> BoxFuture<'a, EngineResult<String>>;
}

pub trait EngineFactory: Send + Sync {
    fn create_engine<'a>(
        &'a self,
        model_id: &'a str,
        config: EngineConfig,
    ) -> BoxFuture<'a, EngineResult<Arc<dyn InferenceEngine>>>;
}

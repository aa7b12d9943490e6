use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot};

use super::engine::{
    BoxFuture, CancelFlag, ChatCompletionChunk, ChatCompletionRequest, ChunkSender, ChunkStream,
    EngineConfig, EngineFactory, FinishReason, InferenceEngine, InitProgressReport, chunk_channel,
};
use super::error::{
    EmptyMessageSetSnafu, EngineError, EngineResult, UnknownModelSnafu, WorkerUnavailableSnafu,
};
use super::model::{CacheBackend, ModelDescriptor};

/// Loading progress channel handed to a backend.
pub struct ProgressSink {
    events: mpsc::UnboundedSender<InitProgressReport>,
    started_at: Instant,
}

impl ProgressSink {
    fn new(events: mpsc::UnboundedSender<InitProgressReport>) -> Self {
        Self {
            events,
            started_at: Instant::now(),
        }
    }

    pub fn report(&self, progress: f64, text: impl Into<String>) {
        let _ = self.events.send(InitProgressReport {
            progress: progress.clamp(0.0, 1.0),
            time_elapsed: self.started_at.elapsed().as_secs_f64(),
            text: text.into(),
        });
    }
}

/// Delta channel handed to a backend for one generation.
pub struct DeltaSink {
    chunks: ChunkSender,
    delta_count: AtomicUsize,
    first_delta_at: OnceLock<Instant>,
}

impl DeltaSink {
    fn new(chunks: ChunkSender) -> Self {
        Self {
            chunks,
            delta_count: AtomicUsize::new(0),
            first_delta_at: OnceLock::new(),
        }
    }

    /// Forwards one delta. Returns false once the consumer has gone away.
    pub fn push(&self, text: impl Into<String>) -> bool {
        let text = text.into();
        if text.is_empty() {
            return !self.chunks.is_closed();
        }

        self.first_delta_at.get_or_init(Instant::now);
        self.delta_count.fetch_add(1, Ordering::Relaxed);
        self.chunks.send(Ok(ChatCompletionChunk::delta(text))).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.chunks.is_closed()
    }

    fn stats(&self, started_at: Instant, prompt_messages: usize) -> GenerationStats {
        let finished_at = Instant::now();
        let first_delta_at = self.first_delta_at.get().copied().unwrap_or(finished_at);

        GenerationStats {
            prompt_messages,
            deltas: self.delta_count.load(Ordering::Relaxed),
            prefill: first_delta_at.saturating_duration_since(started_at),
            decode: finished_at.saturating_duration_since(first_delta_at),
        }
    }
}

/// Timing for the most recent completed generation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GenerationStats {
    pub prompt_messages: usize,
    pub deltas: usize,
    pub prefill: Duration,
    pub decode: Duration,
}

impl GenerationStats {
    pub fn summary(&self) -> String {
        let decode_secs = self.decode.as_secs_f64();
        let rate = if decode_secs > 0.0 {
            self.deltas as f64 / decode_secs
        } else {
            0.0
        };

        format!(
            "prefill: {:.2}s for {} messages, decoding: {:.1} deltas/sec ({} deltas)",
            self.prefill.as_secs_f64(),
            self.prompt_messages,
            rate,
            self.deltas
        )
    }
}

pub const NO_STATS_TEXT: &str = "no generation has completed yet";

/// The piece that actually loads a model and produces text, hosted on the worker task.
pub trait EngineBackend: Send + 'static {
    fn load<'a>(
        &'a mut self,
        model: &'a ModelDescriptor,
        cache: CacheBackend,
        progress: &'a ProgressSink,
    ) -> BoxFuture<'a, EngineResult<()>>;

    /// Streams deltas into `deltas` until done, checking `interrupt` between fragments.
    fn generate<'a>(
        &'a mut self,
        request: ChatCompletionRequest,
        deltas: &'a DeltaSink,
        interrupt: &'a CancelFlag,
    ) -> BoxFuture<'a, EngineResult<()>>;

    fn reset<'a>(&'a mut self) -> BoxFuture<'a, EngineResult<()>>;

    fn unload<'a>(&'a mut self) -> BoxFuture<'a, EngineResult<()>>;
}

enum WorkerRequest {
    Load {
        model: ModelDescriptor,
        cache: CacheBackend,
        progress: ProgressSink,
        reply: oneshot::Sender<EngineResult<()>>,
    },
    ChatCompletion {
        request: ChatCompletionRequest,
        chunks: ChunkSender,
    },
    ResetChat {
        reply: oneshot::Sender<EngineResult<()>>,
    },
    Unload {
        reply: oneshot::Sender<EngineResult<()>>,
    },
    RuntimeStats {
        reply: oneshot::Sender<String>,
    },
}

async fn run_worker<B: EngineBackend>(
    mut backend: B,
    mut requests: mpsc::UnboundedReceiver<WorkerRequest>,
    interrupt: CancelFlag,
) {
    let mut loaded_model: Option<String> = None;
    let mut last_stats: Option<GenerationStats> = None;

    while let Some(request) = requests.recv().await {
        match request {
            WorkerRequest::Load {
                model,
                cache,
                progress,
                reply,
            } => {
                tracing::debug!(model_id = %model.id, ?cache, "worker loading model");
                let result = backend.load(&model, cache, &progress).await;
                if result.is_ok() {
                    loaded_model = Some(model.id.clone());
                }
                let _ = reply.send(result);
            }
            WorkerRequest::ChatCompletion { request, chunks } => {
                let Some(model_id) = loaded_model.as_deref() else {
                    let _ = chunks.send(Err(EngineError::NotLoaded {
                        stage: "worker-chat-completion",
                    }));
                    continue;
                };

                interrupt.reset();
                let prompt_messages = request.messages.len();
                let sink = DeltaSink::new(chunks.clone());
                let started_at = Instant::now();

                match backend.generate(request, &sink, &interrupt).await {
                    Ok(()) => {
                        let stats = sink.stats(started_at, prompt_messages);
                        let reason = if interrupt.is_cancelled() {
                            FinishReason::Abort
                        } else {
                            FinishReason::Stop
                        };
                        tracing::debug!(
                            model_id = %model_id,
                            deltas = stats.deltas,
                            ?reason,
                            "worker generation finished"
                        );
                        last_stats = Some(stats);
                        let _ = chunks.send(Ok(ChatCompletionChunk::finished(reason)));
                    }
                    Err(error) => {
                        tracing::warn!(model_id = %model_id, error = %error, "worker generation failed");
                        let _ = chunks.send(Err(error));
                    }
                }
            }
            WorkerRequest::ResetChat { reply } => {
                let result = backend.reset().await;
                last_stats = None;
                let _ = reply.send(result);
            }
            WorkerRequest::Unload { reply } => {
                let result = backend.unload().await;
                // Close before replying so callers racing the shutdown see a dead worker.
                requests.close();
                let _ = reply.send(result);
                break;
            }
            WorkerRequest::RuntimeStats { reply } => {
                let text = last_stats
                    .as_ref()
                    .map(GenerationStats::summary)
                    .unwrap_or_else(|| NO_STATS_TEXT.to_string());
                let _ = reply.send(text);
            }
        }
    }

    tracing::debug!("engine worker stopped");
}

/// Engine handle that talks to a dedicated worker task over channels.
pub struct WorkerEngine {
    model_id: String,
    requests: mpsc::UnboundedSender<WorkerRequest>,
    interrupt: CancelFlag,
}

impl WorkerEngine {
    /// Spawns the worker task and waits for the model to load, forwarding progress reports.
    pub async fn spawn<B: EngineBackend>(
        backend: B,
        model: ModelDescriptor,
        config: &EngineConfig,
    ) -> EngineResult<Self> {
        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let interrupt = CancelFlag::new();
        tokio::spawn(run_worker(backend, request_rx, interrupt.clone()));

        let engine = Self {
            model_id: model.id.clone(),
            requests: request_tx,
            interrupt,
        };
        engine.load(model, config).await?;
        Ok(engine)
    }

    async fn load(&self, model: ModelDescriptor, config: &EngineConfig) -> EngineResult<()> {
        let (progress_tx, mut progress_rx) = mpsc::unbounded_channel();
        let (reply_tx, mut reply_rx) = oneshot::channel();

        self.send(
            WorkerRequest::Load {
                model,
                cache: config.app_config.cache_backend(),
                progress: ProgressSink::new(progress_tx),
                reply: reply_tx,
            },
            "send-load",
        )?;

        let result = loop {
            tokio::select! {
                biased;
                Some(report) = progress_rx.recv() => config.report_progress(report),
                reply = &mut reply_rx => {
                    break match reply {
                        Ok(result) => result,
                        Err(_) => WorkerUnavailableSnafu { stage: "load-reply" }.fail(),
                    };
                }
            }
        };

        // Reports sent right before the reply may still be queued.
        while let Ok(report) = progress_rx.try_recv() {
            config.report_progress(report);
        }

        result
    }

    fn send(&self, request: WorkerRequest, stage: &'static str) -> EngineResult<()> {
        self.requests
            .send(request)
            .map_err(|_| EngineError::WorkerUnavailable { stage })
    }

    async fn round_trip<T>(
        &self,
        request: impl FnOnce(oneshot::Sender<T>) -> WorkerRequest,
        stage: &'static str,
    ) -> EngineResult<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(request(reply_tx), stage)?;
        reply_rx
            .await
            .map_err(|_| EngineError::WorkerUnavailable { stage })
    }
}

impl Drop for WorkerEngine {
    fn drop(&mut self) {
        self.interrupt.cancel();
    }
}

impl InferenceEngine for WorkerEngine {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn chat_completions_create<'a>(
        &'a self,
        request: ChatCompletionRequest,
    ) -> BoxFuture<'a, EngineResult<ChunkStream>> {
        Box::pin(async move {
            if request.messages.is_empty() {
                return EmptyMessageSetSnafu {
                    stage: "chat-completions-create",
                }
                .fail();
            }

            let (chunk_tx, stream) = chunk_channel();
            self.send(
                WorkerRequest::ChatCompletion {
                    request,
                    chunks: chunk_tx,
                },
                "chat-completions-create",
            )?;
            Ok(stream)
        })
    }

    fn reset_chat<'a>(&'a self) -> BoxFuture<'a, EngineResult<()>> {
        Box::pin(async move {
            self.round_trip(|reply| WorkerRequest::ResetChat { reply }, "reset-chat")
                .await?
        })
    }

    fn unload<'a>(&'a self) -> BoxFuture<'a, EngineResult<()>> {
        Box::pin(async move {
            self.interrupt.cancel();
            self.round_trip(|reply| WorkerRequest::Unload { reply }, "unload")
                .await?
        })
    }

    fn interrupt_generate(&self) {
        self.interrupt.cancel();
    }

    fn runtime_stats_text<'a>(&'a self) -> BoxFuture<'a, EngineResult<String>> {
        Box::pin(async move {
            self.round_trip(|reply| WorkerRequest::RuntimeStats { reply }, "runtime-stats")
                .await
        })
    }
}

type BackendBuilder<B> = dyn Fn() -> EngineResult<B> + Send + Sync;

/// Creates one worker-hosted engine per call, each with a fresh backend.
pub struct WorkerEngineFactory<B> {
    make_backend: Arc<BackendBuilder<B>>,
}

impl<B: EngineBackend> WorkerEngineFactory<B> {
    pub fn new<F>(make_backend: F) -> Self
    where
        F: Fn() -> EngineResult<B> + Send + Sync + 'static,
    {
        Self {
            make_backend: Arc::new(make_backend),
        }
    }
}

impl<B: EngineBackend> EngineFactory for WorkerEngineFactory<B> {
    fn create_engine<'a>(
        &'a self,
        model_id: &'a str,
        config: EngineConfig,
    ) -> BoxFuture<'a, EngineResult<Arc<dyn InferenceEngine>>> {
        Box::pin(async move {
            let Some(model) = config.app_config.find_model(model_id).cloned() else {
                return UnknownModelSnafu {
                    stage: "create-engine",
                    model_id: model_id.to_string(),
                }
                .fail();
            };

            let backend = (self.make_backend)()?;
            let engine = WorkerEngine::spawn(backend, model, &config).await?;
            Ok(Arc::new(engine) as Arc<dyn InferenceEngine>)
        })
    }
}

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use arc_swap::ArcSwap;
use nook_llm::{
    AppConfig, CancelFlag, ChatCompletionRequest, EngineConfig, EngineFactory, EngineMessage,
    FinishReason, InferenceEngine, InitProgressCallback, InitProgressReport, ModelRegistry,
};
use snafu::{ResultExt, ensure};
use tokio::sync::watch;

use crate::error::{
    ChatError, ChatResult, EmptyInputSnafu, EngineNotLoadedSnafu, EngineSnafu,
    GenerationInFlightSnafu, LoadAbortedSnafu, ResetPendingSnafu, UnknownModelSnafu,
};
use crate::message::{ChatMessage, GenerationId, GenerationPhase, PhaseTransition};
use crate::store::{ChatState, ChatStore};

pub const LOAD_FAILED_PREFIX: &str = "Failed to load model";
pub const GENERATION_FAILED_MESSAGE: &str = "Error. Try again.";

/// Per-request generation parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationOptions {
    pub system_prompt: Option<String>,
    pub temperature: f64,
    pub max_gen_len: u64,
}

impl Default for GenerationOptions {
    fn default() -> Self {
        Self {
            system_prompt: None,
            temperature: 0.7,
            max_gen_len: 1024,
        }
    }
}

/// How an accepted send ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Completed,
    Cancelled,
    LoadFailed,
    GenerationFailed,
}

enum StreamEnd {
    Exhausted,
    Cancelled,
}

struct ActiveGeneration {
    id: GenerationId,
    cancel: CancelFlag,
}

/// Counts a reset as pending until dropped.
struct PendingReset<'a>(&'a AtomicUsize);

impl Drop for PendingReset<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

struct PreparedSend {
    id: GenerationId,
    cancel: CancelFlag,
    messages: Vec<EngineMessage>,
}

/// Owns the engine handle and drives the chat state through load, stream, stop and reset.
///
/// Lock order is `active` before the store lock. Neither is held across an await.
/// Sends are refused while a reset is pending, and a reset aborts any load in flight.
pub struct ChatOrchestrator {
    store: ChatStore,
    registry: ModelRegistry,
    factory: Arc<dyn EngineFactory>,
    options: ArcSwap<GenerationOptions>,
    use_persistent_cache: bool,
    engine: Mutex<Option<Arc<dyn InferenceEngine>>>,
    load_gate: tokio::sync::Mutex<()>,
    active: Mutex<Option<ActiveGeneration>>,
    next_generation_id: AtomicU64,
    pending_resets: AtomicUsize,
    load_epoch: watch::Sender<u64>,
}

impl ChatOrchestrator {
    pub fn new(factory: Arc<dyn EngineFactory>, registry: ModelRegistry) -> Self {
        let store = ChatStore::new(ChatState::new(registry.default_model_id()));
        let (load_epoch, _) = watch::channel(0);
        Self {
            store,
            registry,
            factory,
            options: ArcSwap::from_pointee(GenerationOptions::default()),
            use_persistent_cache: true,
            engine: Mutex::new(None),
            load_gate: tokio::sync::Mutex::new(()),
            active: Mutex::new(None),
            next_generation_id: AtomicU64::new(1),
            pending_resets: AtomicUsize::new(0),
            load_epoch,
        }
    }

    pub fn with_options(self, options: GenerationOptions) -> Self {
        self.options.store(Arc::new(options));
        self
    }

    pub fn with_persistent_cache(mut self, use_persistent_cache: bool) -> Self {
        self.use_persistent_cache = use_persistent_cache;
        self
    }

    /// Starts with `model_id` selected when it is registered.
    pub fn with_selected_model(self, model_id: &str) -> Self {
        if self.registry.contains(model_id) {
            self.store.set_selected_model(model_id);
        } else {
            tracing::warn!(model_id = %model_id, "ignoring unregistered initial model");
        }
        self
    }

    pub fn store(&self) -> &ChatStore {
        &self.store
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    pub fn set_generation_options(&self, options: GenerationOptions) {
        self.options.store(Arc::new(options));
    }

    pub fn set_input(&self, input: impl Into<String>) {
        self.store.set_input(input);
    }

    pub fn is_engine_loaded(&self) -> bool {
        self.engine_slot().is_some()
    }

    /// Returns the loaded engine, creating it for the selected model when absent.
    ///
    /// Loading progress is mirrored into the trailing assistant entry. A reset issued while
    /// the load runs aborts it with [`ChatError::LoadAborted`].
    pub async fn load_engine(&self) -> ChatResult<Arc<dyn InferenceEngine>> {
        self.load_engine_for(None).await
    }

    /// Loads on behalf of `owner`, writing status only while that generation is still loading.
    async fn load_engine_for(
        &self,
        owner: Option<GenerationId>,
    ) -> ChatResult<Arc<dyn InferenceEngine>> {
        let mut resets = self.load_epoch.subscribe();
        let _gate = self.load_gate.lock().await;
        if let Some(engine) = self.current_engine() {
            return Ok(engine);
        }

        let superseded = matches!(resets.has_changed(), Ok(true))
            || !self.store.select(|state| owns_load_status(state, owner));
        ensure!(!superseded, LoadAbortedSnafu { stage: "load-engine" });

        let model_id = self.store.select(|state| state.selected_model_id.clone());
        let display_name = self.registry.display_name(&model_id).to_string();
        self.store.update(|state| {
            if owns_load_status(state, owner) {
                state.upsert_status(format!("Loading {display_name}..."));
            }
        });

        let store = self.store.clone();
        let progress: InitProgressCallback = Arc::new(move |report: InitProgressReport| {
            tracing::debug!(
                progress = report.progress,
                elapsed = report.time_elapsed,
                text = %report.text,
                "engine load progress"
            );
            store.update(|state| {
                if owns_load_status(state, owner) {
                    state.upsert_status(report.text);
                }
            });
        });
        let config = EngineConfig::new(AppConfig::new(&self.registry, self.use_persistent_cache))
            .with_progress_callback(progress);

        tracing::info!(model_id = %model_id, "loading engine");
        let created = tokio::select! {
            created = self.factory.create_engine(&model_id, config) => created,
            _ = resets.changed() => {
                tracing::info!(model_id = %model_id, "engine load aborted by reset");
                return LoadAbortedSnafu { stage: "load-engine" }.fail();
            }
        };
        let engine = created.context(EngineSnafu {
            stage: "load-engine",
        })?;

        *self.engine_slot() = Some(engine.clone());
        tracing::info!(model_id = %model_id, "engine ready");
        Ok(engine)
    }

    /// Sends the current input and streams the reply into history.
    ///
    /// Returns `Err` only when the send is refused up front. Load and generation failures
    /// are written into history and reported through the outcome.
    pub async fn on_send(&self) -> ChatResult<SendOutcome> {
        let PreparedSend {
            id,
            cancel,
            messages,
        } = self.begin_generation()?;
        tracing::info!(generation = ?id, message_count = messages.len(), "send accepted");

        let engine = match self.current_engine() {
            Some(engine) => engine,
            None => match self.load_engine_for(Some(id)).await {
                Ok(engine) => engine,
                Err(ChatError::LoadAborted { .. }) => {
                    tracing::info!(generation = ?id, "load abandoned after reset");
                    self.finish_active(id);
                    return Ok(SendOutcome::Cancelled);
                }
                Err(error) => {
                    self.fail_load(id, &error);
                    return Ok(SendOutcome::LoadFailed);
                }
            },
        };

        if !self.mark_engine_ready(id) {
            self.finish_active(id);
            return Ok(SendOutcome::Cancelled);
        }

        let options = self.options.load_full();
        let request = ChatCompletionRequest::streaming(messages)
            .with_temperature(options.temperature)
            .with_max_gen_len(options.max_gen_len);

        let outcome = match self
            .stream_into_history(id, &cancel, engine.as_ref(), request)
            .await
        {
            Ok(StreamEnd::Exhausted) => {
                let completed = self.store.update(|state| {
                    apply_transition(state, PhaseTransition::Complete(id))
                });
                if completed {
                    tracing::info!(generation = ?id, "generation completed");
                    SendOutcome::Completed
                } else {
                    SendOutcome::Cancelled
                }
            }
            Ok(StreamEnd::Cancelled) => {
                self.store
                    .update(|state| apply_transition(state, PhaseTransition::Cancel(id)));
                tracing::info!(generation = ?id, "generation cancelled");
                SendOutcome::Cancelled
            }
            Err(error) => {
                tracing::error!(generation = ?id, error = %error, "generation failed");
                self.store.update(|state| {
                    let failed = apply_transition(
                        state,
                        PhaseTransition::Fail {
                            id,
                            message: error.to_string(),
                        },
                    );
                    if failed {
                        state
                            .history
                            .push(ChatMessage::assistant(GENERATION_FAILED_MESSAGE));
                    }
                });
                SendOutcome::GenerationFailed
            }
        };

        self.finish_active(id);
        Ok(outcome)
    }

    /// Requests interruption and marks the generation as stopped without waiting for the worker.
    pub fn on_stop(&self) -> ChatResult<()> {
        let Some(engine) = self.current_engine() else {
            tracing::error!("stop requested but no engine is loaded");
            return EngineNotLoadedSnafu { stage: "on-stop" }.fail();
        };

        engine.interrupt_generate();
        if let Some(id) = self.cancel_active() {
            tracing::info!(generation = ?id, "stop requested");
        }
        Ok(())
    }

    /// Clears the conversation on both sides. In-flight generation is cancelled first.
    pub async fn reset_chat(&self) -> ChatResult<()> {
        let Some(engine) = self.current_engine() else {
            tracing::error!("chat reset requested but no engine is loaded");
            return EngineNotLoadedSnafu {
                stage: "reset-chat",
            }
            .fail();
        };

        let _pending = self.begin_reset();
        if let Some(id) = self.cancel_active() {
            engine.interrupt_generate();
            tracing::info!(generation = ?id, "cancelled generation for chat reset");
        }

        engine.reset_chat().await.context(EngineSnafu {
            stage: "reset-chat",
        })?;

        self.store.update(|state| {
            state.clear_conversation();
            apply_transition(state, PhaseTransition::ResetToIdle);
        });
        Ok(())
    }

    /// Drops the engine and the conversation. Unload failures are logged, never returned.
    pub async fn reset_engine_and_chat_history(&self) {
        self.teardown(None).await;
    }

    /// Switches the selected model, tearing down the current engine when it changes.
    pub async fn select_model(&self, model_id: &str) -> ChatResult<()> {
        ensure!(
            self.registry.contains(model_id),
            UnknownModelSnafu {
                stage: "select-model",
                model_id: model_id.to_string(),
            }
        );

        let current = self.store.select(|state| state.selected_model_id.clone());
        if current == model_id {
            return Ok(());
        }

        tracing::info!(from = %current, to = %model_id, "switching model");
        self.teardown(Some(model_id.to_string())).await;
        Ok(())
    }

    pub async fn runtime_stats_text(&self) -> ChatResult<String> {
        let Some(engine) = self.current_engine() else {
            return EngineNotLoadedSnafu {
                stage: "runtime-stats",
            }
            .fail();
        };

        engine.runtime_stats_text().await.context(EngineSnafu {
            stage: "runtime-stats",
        })
    }

    fn begin_generation(&self) -> ChatResult<PreparedSend> {
        let id = GenerationId::new(self.next_generation_id.fetch_add(1, Ordering::Relaxed));
        let system_prompt = self.options.load().system_prompt.clone();

        let mut active = self.active_slot();
        if self.pending_resets.load(Ordering::SeqCst) > 0 {
            tracing::warn!("send refused while a reset is pending");
            return ResetPendingSnafu { stage: "on-send" }.fail();
        }
        let messages = self.store.update(|state| -> ChatResult<Vec<EngineMessage>> {
            let text = state.input.trim().to_string();
            ensure!(!text.is_empty(), EmptyInputSnafu { stage: "on-send" });

            match state.phase.apply(PhaseTransition::Start(id)) {
                Ok(next) => state.phase = next,
                Err(rejection) => {
                    tracing::warn!(?rejection, "send refused while a generation is running");
                    return GenerationInFlightSnafu {
                        stage: "on-send",
                        active: state.phase.active_id().unwrap_or(id),
                    }
                    .fail();
                }
            }

            let mut messages = Vec::with_capacity(state.history.len() + 2);
            if let Some(prompt) = system_prompt {
                messages.push(EngineMessage::system(prompt));
            }
            messages.extend(
                state
                    .history
                    .iter()
                    .filter_map(ChatMessage::to_engine_message),
            );
            messages.push(EngineMessage::user(text.clone()));

            state.history.push(ChatMessage::user(text));
            state.history.push(ChatMessage::assistant(String::new()));
            state.input.clear();
            Ok(messages)
        })?;

        let cancel = CancelFlag::new();
        *active = Some(ActiveGeneration {
            id,
            cancel: cancel.clone(),
        });

        Ok(PreparedSend {
            id,
            cancel,
            messages,
        })
    }

    fn fail_load(&self, id: GenerationId, error: &ChatError) {
        tracing::error!(generation = ?id, error = %error, "engine load failed");
        let message = format!("{LOAD_FAILED_PREFIX}: {error}");
        self.store.update(|state| {
            let failed = apply_transition(
                state,
                PhaseTransition::Fail {
                    id,
                    message: message.clone(),
                },
            );
            if failed {
                state.upsert_status(message);
            }
        });
        self.finish_active(id);
    }

    /// Moves to streaming and clears the loading status from the placeholder.
    fn mark_engine_ready(&self, id: GenerationId) -> bool {
        self.store.update(|state| {
            let ready = apply_transition(state, PhaseTransition::EngineReady(id));
            if ready || state.phase == GenerationPhase::Cancelled(id) {
                state.replace_last_content(String::new());
            }
            ready
        })
    }

    async fn stream_into_history(
        &self,
        id: GenerationId,
        cancel: &CancelFlag,
        engine: &dyn InferenceEngine,
        request: ChatCompletionRequest,
    ) -> ChatResult<StreamEnd> {
        let mut stream = engine
            .chat_completions_create(request)
            .await
            .context(EngineSnafu {
                stage: "chat-completions-create",
            })?;
        let mut accumulated = String::new();

        loop {
            if cancel.is_cancelled() {
                return Ok(StreamEnd::Cancelled);
            }

            let Some(item) = stream.next_chunk().await else {
                return Ok(StreamEnd::Exhausted);
            };

            if cancel.is_cancelled() {
                return Ok(StreamEnd::Cancelled);
            }

            let chunk = item.context(EngineSnafu {
                stage: "stream-chunk",
            })?;
            if chunk.finish_reason == Some(FinishReason::Abort) {
                return Ok(StreamEnd::Cancelled);
            }
            let Some(delta) = chunk.delta else {
                continue;
            };

            accumulated.push_str(&delta);
            let applied = self.store.update(|state| {
                state.phase.accepts_content(id) && state.replace_last_content(accumulated.clone())
            });
            if !applied {
                return Ok(StreamEnd::Cancelled);
            }
        }
    }

    async fn teardown(&self, next_model: Option<String>) {
        let _pending = self.begin_reset();
        if let Some(id) = self.cancel_active() {
            if let Some(engine) = self.current_engine() {
                engine.interrupt_generate();
            }
            tracing::info!(generation = ?id, "cancelled generation for engine reset");
        }
        self.load_epoch.send_modify(|epoch| *epoch += 1);

        let _gate = self.load_gate.lock().await;
        if let Some(model_id) = next_model {
            self.store.set_selected_model(model_id);
        }

        let engine = self.engine_slot().take();
        if let Some(engine) = engine {
            tracing::info!(model_id = %engine.model_id(), "unloading engine");
            if let Err(error) = engine.unload().await {
                tracing::warn!(
                    model_id = %engine.model_id(),
                    error = %error,
                    "engine unload failed"
                );
            }
        }

        self.store.update(|state| {
            state.clear_conversation();
            apply_transition(state, PhaseTransition::ResetToIdle);
        });
    }

    /// Refuses new sends until the returned guard drops.
    fn begin_reset(&self) -> PendingReset<'_> {
        self.pending_resets.fetch_add(1, Ordering::SeqCst);
        PendingReset(&self.pending_resets)
    }

    /// Trips the active generation's flag and moves the phase to cancelled.
    fn cancel_active(&self) -> Option<GenerationId> {
        let mut active = self.active_slot();
        let taken = active.take();
        if let Some(generation) = &taken {
            generation.cancel.cancel();
        }

        self.store.update(|state| {
            if let Some(id) = state.phase.active_id() {
                apply_transition(state, PhaseTransition::Cancel(id));
            }
        });
        taken.map(|generation| generation.id)
    }

    fn finish_active(&self, id: GenerationId) {
        let mut active = self.active_slot();
        if active.as_ref().is_some_and(|generation| generation.id == id) {
            *active = None;
        }
    }

    fn current_engine(&self) -> Option<Arc<dyn InferenceEngine>> {
        self.engine_slot().clone()
    }

    fn engine_slot(&self) -> MutexGuard<'_, Option<Arc<dyn InferenceEngine>>> {
        self.engine.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn active_slot(&self) -> MutexGuard<'_, Option<ActiveGeneration>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A load started outside a send may always report. One started by a send only while that
/// send is still loading.
fn owns_load_status(state: &ChatState, owner: Option<GenerationId>) -> bool {
    owner.is_none_or(|id| state.phase == GenerationPhase::LoadingEngine(id))
}

/// Applies `transition` when legal. Returns whether the phase changed.
fn apply_transition(state: &mut ChatState, transition: PhaseTransition) -> bool {
    match state.phase.apply(transition) {
        Ok(next) => {
            state.phase = next;
            true
        }
        Err(rejection) => {
            tracing::debug!(?rejection, "ignored stale phase transition");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use nook_llm::{
        BoxFuture, ChatCompletionChunk, ChunkSender, ChunkStream, EngineError, EngineResult,
        chunk_channel,
    };
    use tokio::sync::Notify;

    use super::*;
    use crate::message::MessageContent;

    const SYSTEM_PROMPT: &str = "You are a test assistant.";

    #[derive(Default)]
    struct FakeEngine {
        model_id: String,
        manual: bool,
        scripts: Mutex<VecDeque<Vec<EngineResult<ChatCompletionChunk>>>>,
        live_sender: Mutex<Option<ChunkSender>>,
        request_seen: Notify,
        requests: Mutex<Vec<ChatCompletionRequest>>,
        interrupts: AtomicUsize,
        resets: AtomicUsize,
        unloads: AtomicUsize,
        hold_unload: Option<Arc<Notify>>,
        unload_started: Notify,
    }

    impl FakeEngine {
        fn scripted(scripts: Vec<Vec<EngineResult<ChatCompletionChunk>>>) -> Arc<Self> {
            Arc::new(Self {
                model_id: ModelRegistry::builtin().default_model_id().to_string(),
                scripts: Mutex::new(scripts.into()),
                ..Self::default()
            })
        }

        fn manual() -> Arc<Self> {
            Arc::new(Self {
                model_id: ModelRegistry::builtin().default_model_id().to_string(),
                manual: true,
                ..Self::default()
            })
        }

        async fn wait_for_request(&self) {
            tokio::time::timeout(Duration::from_secs(5), self.request_seen.notified())
                .await
                .expect("request issued in time");
        }

        fn send_delta(&self, text: &str) {
            let sender = self.live_sender.lock().unwrap();
            sender
                .as_ref()
                .expect("stream open")
                .send(Ok(ChatCompletionChunk::delta(text)))
                .expect("consumer alive");
        }

        fn close_stream(&self) {
            self.live_sender.lock().unwrap().take();
        }

        fn requests(&self) -> Vec<ChatCompletionRequest> {
            self.requests.lock().unwrap().clone()
        }
    }

    impl InferenceEngine for FakeEngine {
        fn model_id(&self) -> &str {
            &self.model_id
        }

        fn chat_completions_create<'a>(
            &'a self,
            request: ChatCompletionRequest,
        ) -> BoxFuture<'a, EngineResult<ChunkStream>> {
            Box::pin(async move {
                self.requests.lock().unwrap().push(request);
                let (chunk_tx, stream) = chunk_channel();
                if self.manual {
                    *self.live_sender.lock().unwrap() = Some(chunk_tx);
                    self.request_seen.notify_one();
                } else {
                    let script = self.scripts.lock().unwrap().pop_front().unwrap_or_default();
                    for item in script {
                        let _ = chunk_tx.send(item);
                    }
                }
                Ok(stream)
            })
        }

        fn reset_chat<'a>(&'a self) -> BoxFuture<'a, EngineResult<()>> {
            Box::pin(async move {
                self.resets.fetch_add(1, Ordering::SeqCst);
                self.close_stream();
                Ok(())
            })
        }

        fn unload<'a>(&'a self) -> BoxFuture<'a, EngineResult<()>> {
            Box::pin(async move {
                self.unloads.fetch_add(1, Ordering::SeqCst);
                self.unload_started.notify_one();
                if let Some(hold) = &self.hold_unload {
                    hold.notified().await;
                }
                self.close_stream();
                Ok(())
            })
        }

        fn interrupt_generate(&self) {
            self.interrupts.fetch_add(1, Ordering::SeqCst);
        }

        fn runtime_stats_text<'a>(&'a self) -> BoxFuture<'a, EngineResult<String>> {
            Box::pin(async move { Ok("decoding: 1.0 deltas/sec".to_string()) })
        }
    }

    #[derive(Default)]
    struct FakeFactory {
        engine: Option<Arc<FakeEngine>>,
        progress: Vec<&'static str>,
        hold_load: Option<Arc<Notify>>,
        calls: AtomicUsize,
        requested_models: Mutex<Vec<String>>,
    }

    impl FakeFactory {
        fn serving(engine: Arc<FakeEngine>) -> Arc<Self> {
            Arc::new(Self {
                engine: Some(engine),
                ..Self::default()
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self::default())
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl EngineFactory for FakeFactory {
        fn create_engine<'a>(
            &'a self,
            model_id: &'a str,
            config: EngineConfig,
        ) -> BoxFuture<'a, EngineResult<Arc<dyn InferenceEngine>>> {
            Box::pin(async move {
                self.calls.fetch_add(1, Ordering::SeqCst);
                self.requested_models
                    .lock()
                    .unwrap()
                    .push(model_id.to_string());

                if let Some(callback) = &config.init_progress_callback {
                    for (index, text) in self.progress.iter().enumerate() {
                        callback(InitProgressReport {
                            progress: (index + 1) as f64 / self.progress.len() as f64,
                            time_elapsed: 0.0,
                            text: text.to_string(),
                        });
                    }
                }
                if let Some(hold) = &self.hold_load {
                    hold.notified().await;
                }

                match &self.engine {
                    Some(engine) => Ok(engine.clone() as Arc<dyn InferenceEngine>),
                    None => Err(EngineError::ModelNotServed {
                        stage: "fake-create-engine",
                        model_id: model_id.to_string(),
                        endpoint: "http://offline.invalid".to_string(),
                    }),
                }
            })
        }
    }

    fn orchestrator(factory: Arc<FakeFactory>) -> Arc<ChatOrchestrator> {
        Arc::new(
            ChatOrchestrator::new(factory, ModelRegistry::builtin()).with_options(
                GenerationOptions {
                    system_prompt: Some(SYSTEM_PROMPT.to_string()),
                    temperature: 0.3,
                    max_gen_len: 256,
                },
            ),
        )
    }

    fn deltas(parts: &[&str]) -> Vec<EngineResult<ChatCompletionChunk>> {
        parts
            .iter()
            .map(|part| Ok(ChatCompletionChunk::delta(*part)))
            .collect()
    }

    fn last_text(state: &ChatState) -> Option<String> {
        state
            .history
            .last()
            .and_then(|message| message.content.as_text())
            .map(str::to_string)
    }

    async fn wait_for(store: &ChatStore, predicate: impl Fn(&ChatState) -> bool) -> ChatState {
        let mut changes = store.subscribe();
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                {
                    let state = changes.borrow_and_update();
                    if predicate(&state) {
                        return state.clone();
                    }
                }
                changes.changed().await.expect("store alive");
            }
        })
        .await
        .expect("state reached in time")
    }

    #[tokio::test]
    async fn first_send_loads_once_and_streams_the_full_reply() {
        let engine = FakeEngine::scripted(vec![deltas(&["Hel", "lo!"])]);
        let factory = FakeFactory::serving(engine.clone());
        let chat = orchestrator(factory.clone());

        chat.set_input("Hi");
        let outcome = chat.on_send().await.expect("send accepted");

        assert_eq!(outcome, SendOutcome::Completed);
        assert_eq!(factory.calls(), 1);

        let requests = engine.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(
            requests[0].messages,
            vec![EngineMessage::system(SYSTEM_PROMPT), EngineMessage::user("Hi")]
        );
        assert!(requests[0].stream);
        assert_eq!(requests[0].temperature, Some(0.3));
        assert_eq!(requests[0].max_gen_len, Some(256));

        let state = chat.store().snapshot();
        assert_eq!(
            state.history,
            vec![ChatMessage::user("Hi"), ChatMessage::assistant("Hello!")]
        );
        assert!(state.input.is_empty());
        assert!(!state.is_generating());
        assert!(matches!(state.phase, GenerationPhase::Done(_)));
    }

    #[tokio::test]
    async fn each_delta_shows_the_accumulated_text() {
        let engine = FakeEngine::manual();
        let chat = orchestrator(FakeFactory::serving(engine.clone()));

        chat.set_input("Hi");
        let sending = tokio::spawn({
            let chat = chat.clone();
            async move { chat.on_send().await }
        });

        engine.wait_for_request().await;
        let state = chat.store().snapshot();
        assert_eq!(
            state.history,
            vec![ChatMessage::user("Hi"), ChatMessage::assistant("")]
        );
        assert!(state.is_generating());

        engine.send_delta("Hel");
        wait_for(chat.store(), |state| last_text(state).as_deref() == Some("Hel")).await;
        engine.send_delta("lo");
        wait_for(chat.store(), |state| last_text(state).as_deref() == Some("Hello")).await;
        engine.send_delta("!");
        wait_for(chat.store(), |state| last_text(state).as_deref() == Some("Hello!")).await;
        engine.close_stream();

        let outcome = sending.await.expect("task joins").expect("send accepted");
        assert_eq!(outcome, SendOutcome::Completed);
        assert!(!chat.store().snapshot().is_generating());
    }

    #[tokio::test]
    async fn loaded_engine_is_reused_and_history_is_sent_back() {
        let engine = FakeEngine::scripted(vec![deltas(&["Hello!"]), deltas(&["Fine."])]);
        let factory = FakeFactory::serving(engine.clone());
        let chat = orchestrator(factory.clone());

        chat.set_input("Hi");
        chat.on_send().await.expect("first send");
        chat.set_input("How are you?");
        chat.on_send().await.expect("second send");

        assert_eq!(factory.calls(), 1);
        let requests = engine.requests();
        assert_eq!(
            requests[1].messages,
            vec![
                EngineMessage::system(SYSTEM_PROMPT),
                EngineMessage::user("Hi"),
                EngineMessage::assistant("Hello!"),
                EngineMessage::user("How are you?"),
            ]
        );
        assert_eq!(
            last_text(&chat.store().snapshot()).as_deref(),
            Some("Fine.")
        );
    }

    #[tokio::test]
    async fn load_failure_becomes_the_assistant_reply() {
        let factory = FakeFactory::failing();
        let chat = orchestrator(factory.clone());

        chat.set_input("Hi");
        let outcome = chat.on_send().await.expect("send accepted");

        assert_eq!(outcome, SendOutcome::LoadFailed);
        assert_eq!(factory.calls(), 1);
        assert!(!chat.is_engine_loaded());

        let state = chat.store().snapshot();
        assert_eq!(state.history.len(), 2);
        let reply = last_text(&state).expect("text reply");
        assert!(reply.starts_with(LOAD_FAILED_PREFIX), "reply: {reply}");
        assert!(reply.contains("http://offline.invalid"), "reply: {reply}");
        assert!(!state.is_generating());
        assert!(matches!(state.phase, GenerationPhase::Failed { .. }));
    }

    #[tokio::test]
    async fn progress_reports_show_in_the_placeholder_until_ready() {
        let engine = FakeEngine::scripted(vec![deltas(&["ok"])]);
        let hold = Arc::new(Notify::new());
        let factory = Arc::new(FakeFactory {
            engine: Some(engine),
            progress: vec!["Fetching catalog", "Weights 50%"],
            hold_load: Some(hold.clone()),
            ..FakeFactory::default()
        });
        let chat = orchestrator(factory);

        chat.set_input("Hi");
        let sending = tokio::spawn({
            let chat = chat.clone();
            async move { chat.on_send().await }
        });

        let loading = wait_for(chat.store(), |state| {
            last_text(state).as_deref() == Some("Weights 50%")
        })
        .await;
        assert_eq!(loading.history.len(), 2);
        assert!(matches!(loading.phase, GenerationPhase::LoadingEngine(_)));

        hold.notify_one();
        let outcome = sending.await.expect("task joins").expect("send accepted");
        assert_eq!(outcome, SendOutcome::Completed);
        assert_eq!(last_text(&chat.store().snapshot()).as_deref(), Some("ok"));
    }

    #[tokio::test]
    async fn mid_stream_error_keeps_partial_reply_and_appends_failure() {
        let engine = FakeEngine::scripted(vec![vec![
            Ok(ChatCompletionChunk::delta("Par")),
            Err(EngineError::GenerationFailed {
                stage: "fake-stream",
                message: "device lost".to_string(),
            }),
        ]]);
        let chat = orchestrator(FakeFactory::serving(engine));

        chat.set_input("Hi");
        let outcome = chat.on_send().await.expect("send accepted");

        assert_eq!(outcome, SendOutcome::GenerationFailed);
        let state = chat.store().snapshot();
        assert_eq!(
            state.history,
            vec![
                ChatMessage::user("Hi"),
                ChatMessage::assistant("Par"),
                ChatMessage::assistant(GENERATION_FAILED_MESSAGE),
            ]
        );
        assert!(!state.is_generating());
    }

    #[tokio::test]
    async fn stop_keeps_partial_reply_and_ignores_late_deltas() {
        let engine = FakeEngine::manual();
        let chat = orchestrator(FakeFactory::serving(engine.clone()));

        chat.set_input("Hi");
        let sending = tokio::spawn({
            let chat = chat.clone();
            async move { chat.on_send().await }
        });

        engine.wait_for_request().await;
        engine.send_delta("Par");
        wait_for(chat.store(), |state| last_text(state).as_deref() == Some("Par")).await;

        chat.on_stop().expect("engine loaded");
        assert_eq!(engine.interrupts.load(Ordering::SeqCst), 1);
        assert!(!chat.store().snapshot().is_generating());

        engine.send_delta("tial");
        engine.close_stream();
        let outcome = sending.await.expect("task joins").expect("send accepted");

        assert_eq!(outcome, SendOutcome::Cancelled);
        let state = chat.store().snapshot();
        assert_eq!(last_text(&state).as_deref(), Some("Par"));
        assert!(matches!(state.phase, GenerationPhase::Cancelled(_)));
    }

    #[tokio::test]
    async fn stop_without_engine_is_an_error_and_changes_nothing() {
        let chat = orchestrator(FakeFactory::failing());
        let before = chat.store().snapshot();

        let result = chat.on_stop();

        assert!(matches!(result, Err(ChatError::EngineNotLoaded { .. })));
        assert_eq!(chat.store().snapshot(), before);
        assert!(!chat.store().snapshot().is_generating());
    }

    #[tokio::test]
    async fn overlapping_send_is_refused() {
        let engine = FakeEngine::manual();
        let chat = orchestrator(FakeFactory::serving(engine.clone()));

        chat.set_input("Hi");
        let sending = tokio::spawn({
            let chat = chat.clone();
            async move { chat.on_send().await }
        });
        engine.wait_for_request().await;

        chat.set_input("Again");
        let second = chat.on_send().await;

        assert!(matches!(second, Err(ChatError::GenerationInFlight { .. })));
        let state = chat.store().snapshot();
        assert_eq!(state.history.len(), 2);
        assert_eq!(state.input, "Again");

        engine.close_stream();
        sending.await.expect("task joins").expect("send accepted");
        assert_eq!(engine.requests().len(), 1);
    }

    #[tokio::test]
    async fn blank_input_is_refused() {
        let factory = FakeFactory::failing();
        let chat = orchestrator(factory.clone());

        chat.set_input("   ");
        let result = chat.on_send().await;

        assert!(matches!(result, Err(ChatError::EmptyInput { .. })));
        assert_eq!(factory.calls(), 0);
        assert!(chat.store().snapshot().history.is_empty());
    }

    #[tokio::test]
    async fn reset_chat_requires_an_engine() {
        let chat = orchestrator(FakeFactory::failing());
        chat.set_input("draft");

        let result = chat.reset_chat().await;

        assert!(matches!(result, Err(ChatError::EngineNotLoaded { .. })));
        assert_eq!(chat.store().snapshot().input, "draft");
    }

    #[tokio::test]
    async fn reset_chat_cancels_the_running_generation() {
        let engine = FakeEngine::manual();
        let chat = orchestrator(FakeFactory::serving(engine.clone()));

        chat.set_input("Hi");
        let sending = tokio::spawn({
            let chat = chat.clone();
            async move { chat.on_send().await }
        });
        engine.wait_for_request().await;
        engine.send_delta("Par");
        wait_for(chat.store(), |state| last_text(state).as_deref() == Some("Par")).await;

        chat.reset_chat().await.expect("reset succeeds");

        assert_eq!(engine.resets.load(Ordering::SeqCst), 1);
        assert!(engine.interrupts.load(Ordering::SeqCst) >= 1);
        let state = chat.store().snapshot();
        assert!(state.history.is_empty());
        assert!(!state.is_generating());

        let outcome = sending.await.expect("task joins").expect("send accepted");
        assert_eq!(outcome, SendOutcome::Cancelled);
        assert!(chat.store().snapshot().history.is_empty());
        assert!(chat.is_engine_loaded());
    }

    #[tokio::test]
    async fn engine_reset_clears_history_and_handle() {
        let engine = FakeEngine::scripted(vec![deltas(&["Hello!"])]);
        let factory = FakeFactory::serving(engine.clone());
        let chat = orchestrator(factory.clone());

        chat.set_input("Hi");
        chat.on_send().await.expect("send accepted");
        chat.set_input("unsent");
        chat.reset_engine_and_chat_history().await;

        let state = chat.store().snapshot();
        assert!(state.history.is_empty());
        assert!(state.input.is_empty());
        assert_eq!(state.phase, GenerationPhase::Idle);
        assert!(!chat.is_engine_loaded());
        assert_eq!(engine.unloads.load(Ordering::SeqCst), 1);

        chat.reset_engine_and_chat_history().await;
        assert!(chat.store().snapshot().history.is_empty());
        assert_eq!(engine.unloads.load(Ordering::SeqCst), 1);

        chat.set_input("Hi again");
        chat.on_send().await.expect("send accepted");
        assert_eq!(factory.calls(), 2);
    }

    #[tokio::test]
    async fn selecting_a_model_switches_engines() {
        let engine = FakeEngine::scripted(vec![deltas(&["one"]), deltas(&["two"])]);
        let factory = FakeFactory::serving(engine.clone());
        let chat = orchestrator(factory.clone());
        let other = ModelRegistry::builtin().models()[1].id.clone();

        chat.set_input("Hi");
        chat.on_send().await.expect("send accepted");

        let unknown = chat.select_model("not-registered").await;
        assert!(matches!(unknown, Err(ChatError::UnknownModel { .. })));
        assert!(chat.is_engine_loaded());

        chat.select_model(&other).await.expect("known model");
        let state = chat.store().snapshot();
        assert_eq!(state.selected_model_id, other);
        assert!(state.history.is_empty());
        assert!(!chat.is_engine_loaded());

        chat.set_input("Hi");
        chat.on_send().await.expect("send accepted");
        let requested = factory.requested_models.lock().unwrap().clone();
        assert_eq!(requested.len(), 2);
        assert_eq!(requested[1], other);
    }

    #[tokio::test]
    async fn runtime_stats_come_from_the_loaded_engine() {
        let chat = orchestrator(FakeFactory::serving(FakeEngine::scripted(Vec::new())));
        assert!(matches!(
            chat.runtime_stats_text().await,
            Err(ChatError::EngineNotLoaded { .. })
        ));

        chat.load_engine().await.expect("engine loads");
        let stats = chat.runtime_stats_text().await.expect("stats");
        assert!(stats.contains("deltas/sec"));

        let history = chat.store().snapshot().history;
        assert_eq!(history.len(), 1);
        assert!(matches!(
            &history[0].content,
            MessageContent::Text(text) if text.starts_with("Loading ")
        ));
    }

    fn is_loading_status(message: &ChatMessage) -> bool {
        matches!(&message.content, MessageContent::Text(text) if text.starts_with("Loading "))
    }

    #[tokio::test]
    async fn model_switch_during_load_aborts_it_and_next_send_uses_the_new_model() {
        let engine = FakeEngine::scripted(vec![deltas(&["Hello again"])]);
        let hold = Arc::new(Notify::new());
        let factory = Arc::new(FakeFactory {
            engine: Some(engine.clone()),
            hold_load: Some(hold.clone()),
            ..FakeFactory::default()
        });
        let chat = orchestrator(factory.clone());
        let other = ModelRegistry::builtin().models()[1].id.clone();

        chat.set_input("Hi");
        let first = tokio::spawn({
            let chat = chat.clone();
            async move { chat.on_send().await }
        });
        wait_for(chat.store(), |state| {
            matches!(state.phase, GenerationPhase::LoadingEngine(_))
                && state.history.last().is_some_and(is_loading_status)
        })
        .await;

        tokio::time::timeout(Duration::from_secs(5), chat.select_model(&other))
            .await
            .expect("switch is not queued behind the load")
            .expect("known model");

        let first = first.await.expect("task joins").expect("send accepted");
        assert_eq!(first, SendOutcome::Cancelled);
        let state = chat.store().snapshot();
        assert!(state.history.is_empty());
        assert_eq!(state.phase, GenerationPhase::Idle);
        assert_eq!(state.selected_model_id, other);
        assert!(!chat.is_engine_loaded());

        hold.notify_one();
        chat.set_input("Again");
        let second = chat.on_send().await.expect("send accepted");

        assert_eq!(second, SendOutcome::Completed);
        let state = chat.store().snapshot();
        assert_eq!(
            state.history,
            vec![
                ChatMessage::user("Again"),
                ChatMessage::assistant("Hello again"),
            ]
        );
        assert!(matches!(state.phase, GenerationPhase::Done(_)));
        assert!(!state.history.iter().any(is_loading_status));

        let requests = engine.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(
            requests[0].messages.last(),
            Some(&EngineMessage::user("Again"))
        );
        let requested = factory.requested_models.lock().unwrap().clone();
        assert_eq!(requested.last(), Some(&other));
    }

    #[tokio::test]
    async fn engine_reset_during_a_stuck_load_recovers() {
        let factory = Arc::new(FakeFactory {
            engine: Some(FakeEngine::scripted(Vec::new())),
            hold_load: Some(Arc::new(Notify::new())),
            ..FakeFactory::default()
        });
        let chat = orchestrator(factory.clone());

        chat.set_input("Hi");
        let sending = tokio::spawn({
            let chat = chat.clone();
            async move { chat.on_send().await }
        });
        wait_for(chat.store(), |state| {
            matches!(state.phase, GenerationPhase::LoadingEngine(_))
        })
        .await;

        tokio::time::timeout(
            Duration::from_secs(5),
            chat.reset_engine_and_chat_history(),
        )
        .await
        .expect("reset is not queued behind the load");

        let outcome = sending.await.expect("task joins").expect("send accepted");
        assert_eq!(outcome, SendOutcome::Cancelled);
        let state = chat.store().snapshot();
        assert!(state.history.is_empty());
        assert_eq!(state.phase, GenerationPhase::Idle);
        assert!(!chat.is_engine_loaded());
        assert_eq!(factory.calls(), 1);
    }

    #[tokio::test]
    async fn send_is_refused_while_an_engine_reset_is_pending() {
        let hold = Arc::new(Notify::new());
        let engine = Arc::new(FakeEngine {
            model_id: ModelRegistry::builtin().default_model_id().to_string(),
            scripts: Mutex::new(vec![deltas(&["Hello!"]), deltas(&["Fresh."])].into()),
            hold_unload: Some(hold.clone()),
            ..FakeEngine::default()
        });
        let factory = FakeFactory::serving(engine.clone());
        let chat = orchestrator(factory.clone());

        chat.set_input("Hi");
        chat.on_send().await.expect("send accepted");

        let resetting = tokio::spawn({
            let chat = chat.clone();
            async move { chat.reset_engine_and_chat_history().await }
        });
        tokio::time::timeout(Duration::from_secs(5), engine.unload_started.notified())
            .await
            .expect("unload started");

        chat.set_input("Again");
        let refused = chat.on_send().await;
        assert!(matches!(refused, Err(ChatError::ResetPending { .. })));
        assert_eq!(chat.store().snapshot().history.len(), 2);

        hold.notify_one();
        resetting.await.expect("reset joins");
        let state = chat.store().snapshot();
        assert!(state.history.is_empty());
        assert_eq!(state.phase, GenerationPhase::Idle);

        chat.set_input("Again");
        let outcome = chat.on_send().await.expect("send accepted");
        assert_eq!(outcome, SendOutcome::Completed);
        assert_eq!(
            chat.store().snapshot().history,
            vec![ChatMessage::user("Again"), ChatMessage::assistant("Fresh.")]
        );
        assert_eq!(factory.calls(), 2);
    }
}

use std::sync::Arc;
use std::time::Duration;

use gpui::prelude::FluentBuilder;
use gpui::*;
use gpui_component::{ActiveTheme, label::Label, v_flex};
use gpui_tokio_bridge::Tokio;
use nook_chat::{ChatOrchestrator, ChatState, GenerationPhase, SendOutcome};

use crate::chat::events::{DraftChanged, ModelSelected, Stop, Submit};
use crate::chat::{MessageInput, MessageList};
use crate::model_selector::ModelSelector;

/// Minimum spacing between two store snapshots applied to the view.
pub const STATE_DEBOUNCE_MS: u64 = 50;

/// Binds the chat components to a [`ChatOrchestrator`].
///
/// The orchestrator's store is the only source of truth: user actions go to the orchestrator
/// on the tokio runtime, and the view re-renders from store snapshots.
pub struct ChatView {
    orchestrator: Arc<ChatOrchestrator>,
    message_list: Entity<MessageList>,
    message_input: Entity<MessageInput>,
    model_selector: Entity<ModelSelector>,
    phase: GenerationPhase,
    runtime_stats: Option<String>,
    _state_watch: Task<()>,
}

impl ChatView {
    pub fn new(orchestrator: Arc<ChatOrchestrator>, window: &mut Window, cx: &mut Context<Self>) -> Self {
        let initial = orchestrator.store().snapshot();
        let message_list = cx.new(MessageList::new);
        let message_input = cx.new(|cx| MessageInput::new(window, cx));
        let model_selector =
            cx.new(|_| ModelSelector::new(orchestrator.registry(), &initial.selected_model_id));

        cx.subscribe(&message_input, |this, _, event: &Submit, cx| {
            this.handle_submit(event, cx);
        })
        .detach();

        cx.subscribe(&message_input, |this, _, _event: &Stop, _cx| {
            this.handle_stop();
        })
        .detach();

        cx.subscribe(&message_input, |this, _, event: &DraftChanged, _cx| {
            this.orchestrator.set_input(event.text.clone());
        })
        .detach();

        cx.subscribe(&model_selector, |this, _, event: &ModelSelected, cx| {
            this.handle_model_selected(event, cx);
        })
        .detach();

        let mut changes = orchestrator.store().subscribe();
        let state_watch = cx.spawn_in(window, async move |this, cx| {
            while changes.changed().await.is_ok() {
                let state = changes.borrow_and_update().clone();
                if this
                    .update_in(cx, |this, window, cx| this.apply_state(&state, window, cx))
                    .is_err()
                {
                    break;
                }
                // Coalesce bursts of streamed deltas into one repaint.
                cx.background_executor()
                    .timer(Duration::from_millis(STATE_DEBOUNCE_MS))
                    .await;
            }
        });

        let mut this = Self {
            orchestrator,
            message_list,
            message_input,
            model_selector,
            phase: GenerationPhase::Idle,
            runtime_stats: None,
            _state_watch: state_watch,
        };
        this.apply_state(&initial, window, cx);
        this
    }

    pub fn model_selector(&self) -> &Entity<ModelSelector> {
        &self.model_selector
    }

    pub fn orchestrator(&self) -> &Arc<ChatOrchestrator> {
        &self.orchestrator
    }

    /// Clears the conversation. With an engine loaded only its chat context is reset;
    /// otherwise, or when that reset fails, the whole engine is torn down.
    pub fn new_chat(&mut self, cx: &mut Context<Self>) {
        self.runtime_stats = None;
        self.message_list
            .update(cx, |list, cx| list.scroll_to_bottom(cx));
        let orchestrator = self.orchestrator.clone();
        let reset = Tokio::spawn(cx, async move {
            if orchestrator.is_engine_loaded() {
                match orchestrator.reset_chat().await {
                    Ok(()) => return,
                    Err(err) => {
                        tracing::warn!(error = %err, "chat reset failed, resetting engine");
                    }
                }
            }
            orchestrator.reset_engine_and_chat_history().await;
        });
        cx.spawn(async move |_, _| {
            if let Err(err) = reset.await {
                tracing::error!(error = %err, "chat reset task failed");
            }
        })
        .detach();
        cx.notify();
    }

    fn apply_state(&mut self, state: &ChatState, window: &mut Window, cx: &mut Context<Self>) {
        let generating = state.is_generating();
        self.phase = state.phase.clone();

        self.message_list
            .update(cx, |list, cx| list.set_messages(&state.history, generating, cx));
        self.message_input.update(cx, |input, cx| {
            input.set_generating(generating, cx);
            input.sync_text(&state.input, window, cx);
        });
        self.model_selector.update(cx, |selector, cx| {
            selector.set_model_id(&state.selected_model_id, cx);
            selector.set_locked(generating, cx);
        });
        cx.notify();
    }

    fn handle_submit(&mut self, event: &Submit, cx: &mut Context<Self>) {
        self.orchestrator.set_input(event.content.clone());
        self.message_list
            .update(cx, |list, cx| list.scroll_to_bottom(cx));

        let orchestrator = self.orchestrator.clone();
        let send = Tokio::spawn(cx, async move { orchestrator.on_send().await });
        cx.spawn(async move |this, cx| {
            let outcome = match send.await {
                Ok(outcome) => outcome,
                Err(err) => {
                    tracing::error!(error = %err, "send task failed");
                    return;
                }
            };

            match outcome {
                Ok(SendOutcome::Completed) => {
                    let _ = this.update(cx, |this, cx| this.refresh_runtime_stats(cx));
                }
                Ok(outcome) => tracing::debug!(?outcome, "send finished"),
                Err(err) => tracing::warn!(error = %err, "send refused"),
            }
        })
        .detach();
    }

    fn handle_stop(&mut self) {
        if let Err(err) = self.orchestrator.on_stop() {
            tracing::warn!(error = %err, "stop ignored");
        }
    }

    fn handle_model_selected(&mut self, event: &ModelSelected, cx: &mut Context<Self>) {
        self.runtime_stats = None;
        let orchestrator = self.orchestrator.clone();
        let model_id = event.model_id.clone();
        let select = Tokio::spawn(cx, async move { orchestrator.select_model(&model_id).await });
        cx.spawn(async move |_, _| match select.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => tracing::warn!(error = %err, "model selection refused"),
            Err(err) => tracing::error!(error = %err, "model selection task failed"),
        })
        .detach();
        cx.notify();
    }

    fn refresh_runtime_stats(&mut self, cx: &mut Context<Self>) {
        let orchestrator = self.orchestrator.clone();
        let stats = Tokio::spawn(cx, async move { orchestrator.runtime_stats_text().await });
        cx.spawn(async move |this, cx| {
            let text = match stats.await {
                Ok(Ok(text)) => text,
                Ok(Err(err)) => {
                    tracing::debug!(error = %err, "runtime stats unavailable");
                    return;
                }
                Err(err) => {
                    tracing::error!(error = %err, "runtime stats task failed");
                    return;
                }
            };
            let _ = this.update(cx, |this, cx| {
                this.runtime_stats = Some(text);
                cx.notify();
            });
        })
        .detach();
    }

    fn status_text(&self) -> Option<String> {
        match &self.phase {
            GenerationPhase::LoadingEngine(_) => Some("Loading model...".to_string()),
            GenerationPhase::Streaming(_) => Some("Generating...".to_string()),
            GenerationPhase::Cancelled(_) => Some("Stopped.".to_string()),
            _ => self.runtime_stats.clone(),
        }
    }
}

impl Render for ChatView {
    fn render(&mut self, _window: &mut Window, cx: &mut Context<Self>) -> impl IntoElement {
        let theme = cx.theme();
        let status = self.status_text();

        v_flex()
            .id("chat-view")
            .relative()
            .size_full()
            .min_h_0()
            .overflow_hidden()
            .bg(theme.background)
            .child(
                div()
                    .id("chat-view-message-list")
                    .flex_1()
                    .min_h_0()
                    .child(self.message_list.clone()),
            )
            .when_some(status, |view, status| {
                view.child(
                    div().px_4().pb_1().child(
                        Label::new(status)
                            .text_xs()
                            .text_color(theme.muted_foreground),
                    ),
                )
            })
            .child(
                div()
                    .id("chat-view-message-input")
                    .flex_shrink_0()
                    .w_full()
                    .border_t_1()
                    .border_color(theme.border)
                    .child(self.message_input.clone()),
            )
    }
}

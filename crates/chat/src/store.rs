use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::watch;

use crate::message::{ChatMessage, GenerationPhase, MessageContent, Role};

/// Everything the chat screen renders.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ChatState {
    pub history: Vec<ChatMessage>,
    pub input: String,
    pub selected_model_id: String,
    pub phase: GenerationPhase,
}

impl ChatState {
    pub fn new(selected_model_id: impl Into<String>) -> Self {
        Self {
            selected_model_id: selected_model_id.into(),
            ..Self::default()
        }
    }

    pub fn is_generating(&self) -> bool {
        self.phase.is_generating()
    }

    /// Writes `text` into the trailing assistant entry, appending one if the last entry is
    /// not an assistant message.
    pub fn upsert_status(&mut self, text: impl Into<String>) {
        let text = text.into();
        match self.history.last_mut() {
            Some(last) if last.role == Role::Assistant => {
                last.content = MessageContent::Text(text);
            }
            _ => self.history.push(ChatMessage::assistant(text)),
        }
    }

    /// Replaces the last entry's content in place.
    pub fn replace_last_content(&mut self, text: impl Into<String>) -> bool {
        let Some(last) = self.history.last_mut() else {
            return false;
        };
        last.content = MessageContent::Text(text.into());
        true
    }

    pub fn clear_conversation(&mut self) {
        self.history.clear();
        self.input.clear();
    }
}

struct StoreInner {
    state: Mutex<ChatState>,
    notify: watch::Sender<ChatState>,
}

/// Shared chat state with whole-value change notification.
///
/// Each `update` runs under one lock and publishes the resulting snapshot, so observers
/// never see a half-applied change.
#[derive(Clone)]
pub struct ChatStore {
    inner: Arc<StoreInner>,
}

impl ChatStore {
    pub fn new(initial: ChatState) -> Self {
        let (notify, _) = watch::channel(initial.clone());
        Self {
            inner: Arc::new(StoreInner {
                state: Mutex::new(initial),
                notify,
            }),
        }
    }

    pub fn update<R>(&self, apply: impl FnOnce(&mut ChatState) -> R) -> R {
        let mut state = self
            .inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let result = apply(&mut state);
        self.inner.notify.send_replace(state.clone());
        result
    }

    pub fn select<R>(&self, read: impl FnOnce(&ChatState) -> R) -> R {
        let state = self
            .inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        read(&state)
    }

    pub fn snapshot(&self) -> ChatState {
        self.select(ChatState::clone)
    }

    /// Receiver that always holds the latest snapshot.
    pub fn subscribe(&self) -> watch::Receiver<ChatState> {
        self.inner.notify.subscribe()
    }

    pub fn set_input(&self, input: impl Into<String>) {
        let input = input.into();
        self.update(|state| state.input = input);
    }

    pub fn set_selected_model(&self, model_id: impl Into<String>) {
        let model_id = model_id.into();
        self.update(|state| state.selected_model_id = model_id);
    }

    pub fn clear_conversation(&self) {
        self.update(ChatState::clear_conversation);
    }
}

/// Emitted when the user submits the input text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submit {
    pub content: String,
}

impl Submit {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
        }
    }
}

/// Emitted when the user asks to stop the running generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Stop;

/// Emitted when the model selector picks a different model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSelected {
    pub model_id: String,
}

/// Emitted whenever the input text changes, so the store mirrors the draft.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DraftChanged {
    pub text: String,
}

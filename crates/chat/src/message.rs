use nook_llm::{EngineMessage, Role as EngineRole};

/// Chat speaker role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    System,
    User,
    Assistant,
}

impl From<Role> for EngineRole {
    fn from(role: Role) -> Self {
        match role {
            Role::System => EngineRole::System,
            Role::User => EngineRole::User,
            Role::Assistant => EngineRole::Assistant,
        }
    }
}

/// One piece of a multi-part message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentPart {
    Text(String),
    ImageUrl(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl MessageContent {
    /// Returns the text when the content is plain text, `None` for multi-part content.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            Self::Parts(_) => None,
        }
    }
}

impl Default for MessageContent {
    fn default() -> Self {
        Self::Text(String::new())
    }
}

/// One conversation entry. History is chronological.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub role: Role,
    pub content: MessageContent,
}

impl ChatMessage {
    pub fn text(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: MessageContent::Text(content.into()),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::text(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::text(Role::Assistant, content)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::text(Role::System, content)
    }

    /// Converts to the engine wire shape. Multi-part and blank entries are skipped.
    pub fn to_engine_message(&self) -> Option<EngineMessage> {
        let text = self.content.as_text()?;
        if text.trim().is_empty() {
            return None;
        }
        Some(EngineMessage::new(self.role.into(), text))
    }
}

/// Identifier for one send, fresh on every accepted submit.
///
/// Late updates carrying an old id are dropped instead of touching history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GenerationId(pub u64);

impl GenerationId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }
}

/// Lifecycle of the current send.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum GenerationPhase {
    #[default]
    Idle,
    LoadingEngine(GenerationId),
    Streaming(GenerationId),
    Done(GenerationId),
    Failed {
        id: GenerationId,
        message: String,
    },
    Cancelled(GenerationId),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PhaseTransition {
    Start(GenerationId),
    EngineReady(GenerationId),
    Complete(GenerationId),
    Fail { id: GenerationId, message: String },
    Cancel(GenerationId),
    ResetToIdle,
}

/// Why a transition was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PhaseRejection {
    AlreadyGenerating {
        active: GenerationId,
        attempted: GenerationId,
    },
    NoActiveGeneration,
    GenerationMismatch {
        active: GenerationId,
        attempted: GenerationId,
    },
}

pub type PhaseTransitionResult = Result<GenerationPhase, PhaseRejection>;

impl GenerationPhase {
    /// The id of the generation in flight, if any.
    pub fn active_id(&self) -> Option<GenerationId> {
        match self {
            Self::LoadingEngine(id) | Self::Streaming(id) => Some(*id),
            Self::Idle | Self::Done(_) | Self::Failed { .. } | Self::Cancelled(_) => None,
        }
    }

    pub fn is_generating(&self) -> bool {
        self.active_id().is_some()
    }

    /// True when streamed content for `id` may still be written to history.
    pub fn accepts_content(&self, id: GenerationId) -> bool {
        matches!(self, Self::Streaming(active) if *active == id)
    }

    /// Applies one transition deterministically.
    ///
    /// A new generation may start from any inactive phase. Every other transition must
    /// name the generation currently in flight.
    pub fn apply(&self, transition: PhaseTransition) -> PhaseTransitionResult {
        match transition {
            PhaseTransition::Start(id) => self.apply_start(id),
            PhaseTransition::EngineReady(id) => self.apply_engine_ready(id),
            PhaseTransition::Complete(id) => {
                self.finish(id, |phase| matches!(phase, Self::Streaming(_)), Self::Done(id))
            }
            PhaseTransition::Fail { id, message } => {
                self.finish(id, Self::is_generating, Self::Failed { id, message })
            }
            PhaseTransition::Cancel(id) => {
                self.finish(id, Self::is_generating, Self::Cancelled(id))
            }
            PhaseTransition::ResetToIdle => Ok(Self::Idle),
        }
    }

    fn apply_start(&self, id: GenerationId) -> PhaseTransitionResult {
        match self.active_id() {
            Some(active) if active == id => Ok(self.clone()),
            Some(active) => Err(PhaseRejection::AlreadyGenerating {
                active,
                attempted: id,
            }),
            None => Ok(Self::LoadingEngine(id)),
        }
    }

    fn apply_engine_ready(&self, id: GenerationId) -> PhaseTransitionResult {
        match self {
            Self::LoadingEngine(active) if *active == id => Ok(Self::Streaming(id)),
            Self::LoadingEngine(active) | Self::Streaming(active) => {
                Err(PhaseRejection::GenerationMismatch {
                    active: *active,
                    attempted: id,
                })
            }
            Self::Idle | Self::Done(_) | Self::Failed { .. } | Self::Cancelled(_) => {
                Err(PhaseRejection::NoActiveGeneration)
            }
        }
    }

    fn finish(
        &self,
        id: GenerationId,
        allowed: impl Fn(&Self) -> bool,
        next: Self,
    ) -> PhaseTransitionResult {
        match self.active_id() {
            Some(active) if active != id => Err(PhaseRejection::GenerationMismatch {
                active,
                attempted: id,
            }),
            Some(_) if allowed(self) => Ok(next),
            Some(_) | None => Err(PhaseRejection::NoActiveGeneration),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FIRST: GenerationId = GenerationId::new(1);
    const SECOND: GenerationId = GenerationId::new(2);

    #[test]
    fn happy_path_walks_loading_streaming_done() {
        let phase = GenerationPhase::Idle
            .apply(PhaseTransition::Start(FIRST))
            .expect("start");
        assert_eq!(phase, GenerationPhase::LoadingEngine(FIRST));
        assert!(phase.is_generating());
        assert!(!phase.accepts_content(FIRST));

        let phase = phase
            .apply(PhaseTransition::EngineReady(FIRST))
            .expect("ready");
        assert!(phase.accepts_content(FIRST));
        assert!(!phase.accepts_content(SECOND));

        let phase = phase
            .apply(PhaseTransition::Complete(FIRST))
            .expect("complete");
        assert_eq!(phase, GenerationPhase::Done(FIRST));
        assert!(!phase.is_generating());
    }

    #[test]
    fn second_start_while_active_is_rejected() {
        let phase = GenerationPhase::Streaming(FIRST);

        assert_eq!(
            phase.apply(PhaseTransition::Start(SECOND)),
            Err(PhaseRejection::AlreadyGenerating {
                active: FIRST,
                attempted: SECOND,
            })
        );
        assert_eq!(phase.apply(PhaseTransition::Start(FIRST)), Ok(phase.clone()));
    }

    #[test]
    fn terminal_transitions_require_the_active_generation() {
        let streaming = GenerationPhase::Streaming(FIRST);

        assert_eq!(
            streaming.apply(PhaseTransition::Cancel(SECOND)),
            Err(PhaseRejection::GenerationMismatch {
                active: FIRST,
                attempted: SECOND,
            })
        );
        assert_eq!(
            GenerationPhase::Done(FIRST).apply(PhaseTransition::Complete(FIRST)),
            Err(PhaseRejection::NoActiveGeneration)
        );
        assert_eq!(
            GenerationPhase::LoadingEngine(FIRST).apply(PhaseTransition::Complete(FIRST)),
            Err(PhaseRejection::NoActiveGeneration)
        );
    }

    #[test]
    fn loading_can_fail_or_be_cancelled() {
        let loading = GenerationPhase::LoadingEngine(FIRST);

        assert_eq!(
            loading.apply(PhaseTransition::Fail {
                id: FIRST,
                message: "offline".to_string(),
            }),
            Ok(GenerationPhase::Failed {
                id: FIRST,
                message: "offline".to_string(),
            })
        );
        assert_eq!(
            loading.apply(PhaseTransition::Cancel(FIRST)),
            Ok(GenerationPhase::Cancelled(FIRST))
        );
    }

    #[test]
    fn engine_messages_skip_blank_and_multi_part_entries() {
        assert_eq!(
            ChatMessage::user("Hi").to_engine_message(),
            Some(EngineMessage::user("Hi"))
        );
        assert_eq!(ChatMessage::assistant("  ").to_engine_message(), None);

        let parts = ChatMessage {
            role: Role::User,
            content: MessageContent::Parts(vec![ContentPart::ImageUrl(
                "https://example.invalid/cat.png".to_string(),
            )]),
        };
        assert_eq!(parts.to_engine_message(), None);
    }
}

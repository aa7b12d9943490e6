#![deny(unsafe_code)]

/// Application shell and orchestrator wiring.
pub mod app;
/// Chat view, transcript and prompt input.
pub mod chat;
pub mod model_selector;

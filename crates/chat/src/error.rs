use std::path::PathBuf;

use nook_llm::EngineError;
use snafu::Snafu;

use crate::message::GenerationId;

pub type ChatResult<T> = Result<T, ChatError>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ChatError {
    #[snafu(display("engine is not loaded on `{stage}`"))]
    EngineNotLoaded { stage: &'static str },
    #[snafu(display("generation {active:?} is still running"))]
    GenerationInFlight {
        stage: &'static str,
        active: GenerationId,
    },
    #[snafu(display("input is empty"))]
    EmptyInput { stage: &'static str },
    #[snafu(display("a chat reset is still in progress"))]
    ResetPending { stage: &'static str },
    #[snafu(display("engine load was aborted by a reset"))]
    LoadAborted { stage: &'static str },
    #[snafu(display("model '{model_id}' is not registered"))]
    UnknownModel {
        stage: &'static str,
        model_id: String,
    },
    #[snafu(display("{source}"))]
    Engine {
        stage: &'static str,
        source: EngineError,
    },
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SettingsError {
    #[snafu(display("failed to create settings directory at {path:?} on `{stage}`: {source}"))]
    CreateDir {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("failed to serialize settings on `{stage}`: {source}"))]
    SerializeConfig {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("failed to write settings file at {path:?} on `{stage}`: {source}"))]
    WriteFile {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("failed to move {from:?} over {to:?} on `{stage}`: {source}"))]
    RenameTempFile {
        stage: &'static str,
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },
}

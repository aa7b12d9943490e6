use snafu::Snafu;

pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum EngineError {
    #[snafu(display("model '{model_id}' is not in the app config model list"))]
    UnknownModel {
        stage: &'static str,
        model_id: String,
    },
    #[snafu(display("missing API key for endpoint '{endpoint}'"))]
    MissingApiKey {
        stage: &'static str,
        endpoint: String,
    },
    #[snafu(display("http client failed on `{stage}`, {source}"))]
    HttpClient {
        stage: &'static str,
        source: rig::http_client::Error,
    },
    #[snafu(display("failed to finalize HTTP request body: {message}"))]
    BuildHttpRequestBody {
        stage: &'static str,
        message: String,
    },
    #[snafu(display("model endpoint returned status {status}: {body}"))]
    ModelFetchStatus {
        stage: &'static str,
        status: u16,
        body: String,
    },
    #[snafu(display("failed to parse served model list: {details}"))]
    ModelPayloadParse {
        stage: &'static str,
        details: String,
    },
    #[snafu(display("model '{model_id}' is not served by '{endpoint}'"))]
    ModelNotServed {
        stage: &'static str,
        model_id: String,
        endpoint: String,
    },
    #[snafu(display("chat completion request has no user or assistant messages"))]
    EmptyMessageSet { stage: &'static str },
    #[snafu(display("completions failed on `{stage}`, {source}"))]
    CompletionsFailed {
        stage: &'static str,
        source: rig::completion::CompletionError,
    },
    #[snafu(display("no model is loaded on `{stage}`"))]
    NotLoaded { stage: &'static str },
    #[snafu(display("engine worker is no longer running on `{stage}`"))]
    WorkerUnavailable { stage: &'static str },
    #[snafu(display("generation failed on `{stage}`: {message}"))]
    GenerationFailed {
        stage: &'static str,
        message: String,
    },
}

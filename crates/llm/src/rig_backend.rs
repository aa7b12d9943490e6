use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use rig::completion::{CompletionModel, Message as RigMessage};
use rig::http_client::{self, HttpClientExt, NoBody};
use rig::prelude::CompletionClient;
use rig::providers::openai;
use rig::streaming::StreamedAssistantContent;
use serde::Deserialize;
use snafu::{ResultExt, ensure};

use super::engine::{BoxFuture, CancelFlag, ChatCompletionRequest, EngineMessage, Role};
use super::error::{
    CompletionsFailedSnafu, EmptyMessageSetSnafu, EngineError, EngineResult, HttpClientSnafu,
    MissingApiKeySnafu, ModelFetchStatusSnafu, ModelNotServedSnafu, ModelPayloadParseSnafu,
    NotLoadedSnafu,
};
use super::model::{CacheBackend, ModelCache, ModelDescriptor, model_cache_for};
use super::worker::{DeltaSink, EngineBackend, ProgressSink};

pub const DEFAULT_ENDPOINT: &str = "http://127.0.0.1:8000/v1";

/// How often a pending upstream read is abandoned to look at the interrupt flag.
const INTERRUPT_POLL_INTERVAL: Duration = Duration::from_millis(50);

type RigStreamingResponse = rig::streaming::StreamingCompletionResponse<
    rig::providers::openai::responses_api::streaming::StreamingCompletionResponse,
>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderConfig {
    pub endpoint: String,
    pub api_key: String,
}

impl ProviderConfig {
    pub fn new(endpoint: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            api_key: api_key.into(),
        }
    }
}

/// Engine backend for an OpenAI-compatible server such as `mlc_llm serve`.
///
/// Loading does not move weights around; it confirms the server actually serves the
/// requested model so that failures show up at load time instead of on the first send.
pub struct RigBackend {
    config: ProviderConfig,
    model_cache: Option<Arc<ModelCache>>,
    loaded_model: Option<String>,
}

impl RigBackend {
    pub fn new(config: ProviderConfig) -> EngineResult<Self> {
        ensure!(
            !config.api_key.trim().is_empty(),
            MissingApiKeySnafu {
                stage: "rig-backend-new",
                endpoint: config.endpoint.clone(),
            }
        );

        Ok(Self {
            config,
            model_cache: None,
            loaded_model: None,
        })
    }

    fn build_client(config: &ProviderConfig) -> EngineResult<openai::Client> {
        let mut builder = openai::Client::builder().api_key(config.api_key.as_str());
        if !config.endpoint.is_empty() {
            builder = builder.base_url(config.endpoint.as_str());
        }
        builder.build().context(HttpClientSnafu {
            stage: "build-client",
        })
    }

    async fn fetch_served_model_ids(&self) -> EngineResult<Vec<String>> {
        let client = Self::build_client(&self.config)?;
        let request = client
            .get("/models")
            .context(HttpClientSnafu {
                stage: "build-model-request",
            })?
            .body(NoBody)
            .map_err(|source| EngineError::BuildHttpRequestBody {
                stage: "build-model-request-body",
                message: source.to_string(),
            })?;

        let response = client.send(request).await.context(HttpClientSnafu {
            stage: "send-model-request",
        })?;
        let status = response.status();
        let payload = http_client::text(response).await.context(HttpClientSnafu {
            stage: "read-model-response",
        })?;

        if !status.is_success() {
            return ModelFetchStatusSnafu {
                stage: "model-http-status",
                status: status.as_u16(),
                body: payload,
            }
            .fail();
        }

        parse_model_ids(&payload)
    }

    async fn served_model_ids(
        &mut self,
        cache: CacheBackend,
        progress: &ProgressSink,
    ) -> EngineResult<Vec<String>> {
        let model_cache = self
            .model_cache
            .get_or_insert_with(|| model_cache_for(cache))
            .clone();

        if let Some(model_ids) = model_cache.get_fresh(&self.config.endpoint).await {
            progress.report(0.5, "Using cached model catalog");
            return Ok(model_ids);
        }

        progress.report(
            0.2,
            format!("Fetching model catalog from {}", self.config.endpoint),
        );
        let model_ids = self.fetch_served_model_ids().await?;
        model_cache
            .set(&self.config.endpoint, model_ids.clone())
            .await;
        progress.report(0.6, format!("Found {} served models", model_ids.len()));
        Ok(model_ids)
    }

    async fn open_stream(
        config: &ProviderConfig,
        model_id: &str,
        request: &ChatCompletionRequest,
    ) -> EngineResult<RigStreamingResponse> {
        let client = Self::build_client(config)?;
        let model = client.completion_model(model_id.to_string());

        let mut messages = request
            .messages
            .iter()
            .filter_map(to_rig_message)
            .collect::<Vec<_>>();

        let Some(prompt) = messages.pop() else {
            tracing::warn!(
                model_id = %model_id,
                total_message_count = request.messages.len(),
                "cannot open stream because no user/assistant messages remain after filtering"
            );
            return EmptyMessageSetSnafu {
                stage: "open-stream-filter-messages",
            }
            .fail();
        };
        let mut builder = model.completion_request(prompt).messages(messages);

        if let Some(preamble) = merged_preamble(&request.messages) {
            builder = builder.preamble(preamble);
        }

        if let Some(temperature) = request.temperature {
            builder = builder.temperature(temperature);
        }

        if let Some(max_gen_len) = request.max_gen_len {
            builder = builder.max_tokens(max_gen_len);
        }

        builder.stream().await.context(CompletionsFailedSnafu {
            stage: "open-stream",
        })
    }

    async fn stream_deltas(
        &self,
        model_id: &str,
        request: ChatCompletionRequest,
        deltas: &DeltaSink,
        interrupt: &CancelFlag,
    ) -> EngineResult<()> {
        let mut stream = Self::open_stream(&self.config, model_id, &request).await?;

        loop {
            if interrupt.is_cancelled() || deltas.is_closed() {
                // Cancel the upstream stream so server-side decoding stops promptly.
                tracing::debug!(model_id = %model_id, "rig stream interrupted");
                stream.cancel();
                return Ok(());
            }

            tokio::select! {
                next_item = stream.next() => {
                    match next_item {
                        Some(Ok(StreamedAssistantContent::Text(text))) => {
                            if !deltas.push(text.text) {
                                stream.cancel();
                                return Ok(());
                            }
                        }
                        Some(Ok(_)) => {}
                        Some(Err(source)) => {
                            tracing::warn!(
                                model_id = %model_id,
                                error = %source,
                                "rig stream emitted an error chunk"
                            );
                            return Err(EngineError::CompletionsFailed {
                                stage: "stream-chunk",
                                source,
                            });
                        }
                        None => return Ok(()),
                    }
                }
                _ = tokio::time::sleep(INTERRUPT_POLL_INTERVAL) => {}
            }
        }
    }
}

impl EngineBackend for RigBackend {
    fn load<'a>(
        &'a mut self,
        model: &'a ModelDescriptor,
        cache: CacheBackend,
        progress: &'a ProgressSink,
    ) -> BoxFuture<'a, EngineResult<()>> {
        Box::pin(async move {
            progress.report(0.0, format!("Connecting to {}", self.config.endpoint));
            let served = self.served_model_ids(cache, progress).await?;

            if !served.iter().any(|id| id == &model.id) {
                return ModelNotServedSnafu {
                    stage: "load-check-served",
                    model_id: model.id.clone(),
                    endpoint: self.config.endpoint.clone(),
                }
                .fail();
            }

            self.loaded_model = Some(model.id.clone());
            progress.report(1.0, format!("{} is ready", model.display_name));
            tracing::info!(
                model_id = %model.id,
                endpoint = %self.config.endpoint,
                "rig backend loaded model"
            );
            Ok(())
        })
    }

    fn generate<'a>(
        &'a mut self,
        request: ChatCompletionRequest,
        deltas: &'a DeltaSink,
        interrupt: &'a CancelFlag,
    ) -> BoxFuture<'a, EngineResult<()>> {
        Box::pin(async move {
            let Some(model_id) = self.loaded_model.clone() else {
                return NotLoadedSnafu {
                    stage: "rig-generate",
                }
                .fail();
            };

            self.stream_deltas(&model_id, request, deltas, interrupt)
                .await
        })
    }

    fn reset<'a>(&'a mut self) -> BoxFuture<'a, EngineResult<()>> {
        // Every request carries the full history, so there is no server-side session to drop.
        Box::pin(async move { Ok(()) })
    }

    fn unload<'a>(&'a mut self) -> BoxFuture<'a, EngineResult<()>> {
        Box::pin(async move {
            self.loaded_model = None;
            Ok(())
        })
    }
}

#[derive(Deserialize)]
struct ServedModelList {
    #[serde(default)]
    data: Vec<ServedModel>,
}

#[derive(Deserialize)]
struct ServedModel {
    id: String,
}

/// Reads the `data[].id` entries of an OpenAI-style `/models` payload.
fn parse_model_ids(payload: &str) -> EngineResult<Vec<String>> {
    let list: ServedModelList =
        serde_json::from_str(payload).map_err(|source| EngineError::ModelPayloadParse {
            stage: "parse-model-response",
            details: source.to_string(),
        })?;

    let mut ids = list
        .data
        .into_iter()
        .map(|model| model.id.trim().to_string())
        .filter(|id| !id.is_empty())
        .collect::<Vec<_>>();
    ids.sort();
    ids.dedup();

    ensure!(
        !ids.is_empty(),
        ModelPayloadParseSnafu {
            stage: "parse-model-response",
            details: "no model identifiers found in /models response".to_string(),
        }
    );
    Ok(ids)
}

fn to_rig_message(message: &EngineMessage) -> Option<RigMessage> {
    match message.role {
        Role::System => None,
        Role::User => Some(RigMessage::user(message.content.clone())),
        Role::Assistant => Some(RigMessage::assistant(message.content.clone())),
    }
}

/// rig has a single preamble slot, so system messages are joined into it.
fn merged_preamble(messages: &[EngineMessage]) -> Option<String> {
    let parts = messages
        .iter()
        .filter(|message| matches!(message.role, Role::System))
        .map(|message| message.content.trim())
        .filter(|content| !content.is_empty())
        .collect::<Vec<_>>();

    if parts.is_empty() {
        None
    } else {
        Some(parts.join("\n\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_sorted_unique_ids_from_models_payload() {
        let payload = r#"{"object": "list", "data": [
            {"id": "Phi-3.5-mini-instruct-q4f16_1-MLC", "object": "model"},
            {"id": "Llama-3.2-1B-Instruct-q4f16_1-MLC", "object": "model"},
            {"id": "Phi-3.5-mini-instruct-q4f16_1-MLC", "object": "model"},
            {"id": " ", "object": "model"}
        ]}"#;

        assert_eq!(
            parse_model_ids(payload).expect("valid payload"),
            vec![
                "Llama-3.2-1B-Instruct-q4f16_1-MLC".to_string(),
                "Phi-3.5-mini-instruct-q4f16_1-MLC".to_string(),
            ]
        );
    }

    #[test]
    fn empty_or_malformed_model_lists_are_parse_errors() {
        assert!(matches!(
            parse_model_ids(r#"{"data": []}"#),
            Err(EngineError::ModelPayloadParse { .. })
        ));
        assert!(matches!(
            parse_model_ids("<html>not json</html>"),
            Err(EngineError::ModelPayloadParse { .. })
        ));
    }

    #[test]
    fn system_messages_fold_into_preamble() {
        let messages = vec![
            EngineMessage::system("You are terse."),
            EngineMessage::user("Hi"),
            EngineMessage::system("  "),
            EngineMessage::system("Answer in English."),
        ];

        assert_eq!(
            merged_preamble(&messages).as_deref(),
            Some("You are terse.\n\nAnswer in English.")
        );
        assert_eq!(merged_preamble(&[EngineMessage::user("Hi")]), None);
    }

    #[test]
    fn only_user_and_assistant_turns_become_rig_messages() {
        assert!(to_rig_message(&EngineMessage::system("rules")).is_none());
        assert!(to_rig_message(&EngineMessage::user("Hi")).is_some());
        assert!(to_rig_message(&EngineMessage::assistant("Hello")).is_some());
    }

    #[test]
    fn backend_requires_an_api_key() {
        let result = RigBackend::new(ProviderConfig::new(DEFAULT_ENDPOINT, "  "));

        assert!(matches!(result, Err(EngineError::MissingApiKey { .. })));
        assert!(RigBackend::new(ProviderConfig::new(DEFAULT_ENDPOINT, "local")).is_ok());
    }
}

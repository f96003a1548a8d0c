//! HTTP transport for `real` mode.
//!
//! Speaks the OpenAI chat-completion dialect served by LiteLLM proxies,
//! OpenRouter and llama.cpp's server. Stages never use this directly: they
//! go through [`super::backend::ProviderBackend`], which turns one stage
//! prompt into one single-choice request.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};

use crate::error::LlmError;

const DEFAULT_MODEL: &str = "qwen2.5-coder-7b-instruct";
const OPENROUTER_API_BASE: &str = "https://openrouter.ai/api/v1";
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(600);
/// Longest error body carried into an `LlmError`.
const MAX_ERROR_BODY: usize = 512;

/// Speaker of a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// One chat-completion call. An empty `model` means the client default.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub model: String,
    pub messages: Vec<Message>,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u32>,
    pub top_p: Option<f64>,
}

impl GenerationRequest {
    pub fn new(model: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            model: model.into(),
            messages,
            temperature: None,
            max_tokens: None,
            top_p: None,
        }
    }

    pub fn with_sampling(mut self, temperature: f64, max_tokens: u32, top_p: f64) -> Self {
        self.temperature = Some(temperature);
        self.max_tokens = Some(max_tokens);
        self.top_p = Some(top_p);
        self
    }
}

/// Why the model stopped producing text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    /// Cut off by `max_tokens`; code output is likely incomplete.
    Length,
    ContentFilter,
    Unknown,
}

impl FinishReason {
    fn parse(reason: Option<&str>) -> Self {
        match reason {
            None | Some("stop") | Some("eos") => FinishReason::Stop,
            Some("length") => FinishReason::Length,
            Some("content_filter") => FinishReason::ContentFilter,
            Some(_) => FinishReason::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u32,
    #[serde(default)]
    pub completion_tokens: u32,
    #[serde(default)]
    pub total_tokens: u32,
}

/// The first choice of a completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationResponse {
    /// Model that answered, as reported by the server.
    pub model: String,
    pub content: String,
    pub finish_reason: FinishReason,
    pub usage: Usage,
}

impl GenerationResponse {
    pub fn is_truncated(&self) -> bool {
        self.finish_reason == FinishReason::Length
    }
}

/// A chat-completion service.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    async fn generate(&self, request: &GenerationRequest) -> Result<GenerationResponse, LlmError>;
}

/// Where and how the client connects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSettings {
    pub api_base: String,
    pub api_key: Option<String>,
    pub default_model: String,
    pub request_timeout: Duration,
}

impl ClientSettings {
    pub fn new(api_base: impl Into<String>) -> Self {
        Self {
            api_base: api_base.into(),
            api_key: None,
            default_model: DEFAULT_MODEL.to_string(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// OpenRouter with the default model.
    pub fn openrouter(api_key: impl Into<String>) -> Self {
        Self::new(OPENROUTER_API_BASE).with_api_key(api_key)
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = model.into();
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Reads settings from the environment.
    ///
    /// # Environment Variables
    ///
    /// - `LITELLM_API_BASE`: endpoint; OpenRouter is used when unset
    /// - `LITELLM_API_KEY`: bearer token for `LITELLM_API_BASE`
    /// - `OPENROUTER_API_KEY`: bearer token for OpenRouter
    /// - `LITELLM_DEFAULT_MODEL` (default: qwen2.5-coder-7b-instruct)
    /// - `FORGE_LLM_TIMEOUT_SECS` (default: 600)
    pub fn from_env() -> Result<Self, LlmError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same keys as [`ClientSettings::from_env`].
    ///
    /// # Errors
    ///
    /// `MissingApiBase` when neither an endpoint nor an OpenRouter key is
    /// set; `RequestFailed` for an unparseable timeout.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, LlmError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut settings = match lookup("LITELLM_API_BASE") {
            Some(base) => {
                let settings = Self::new(base);
                match lookup("LITELLM_API_KEY") {
                    Some(key) => settings.with_api_key(key),
                    None => settings,
                }
            }
            None => Self::openrouter(lookup("OPENROUTER_API_KEY").ok_or(LlmError::MissingApiBase)?),
        };

        if let Some(model) = lookup("LITELLM_DEFAULT_MODEL") {
            settings.default_model = model;
        }
        if let Some(secs) = lookup("FORGE_LLM_TIMEOUT_SECS") {
            let secs: u64 = secs.trim().parse().map_err(|_| {
                LlmError::RequestFailed(format!("FORGE_LLM_TIMEOUT_SECS is not a number: {}", secs))
            })?;
            settings.request_timeout = Duration::from_secs(secs);
        }
        Ok(settings)
    }
}

/// Client for OpenAI-compatible chat-completion endpoints.
pub struct LiteLlmClient {
    settings: ClientSettings,
    http_client: Client,
}

impl std::fmt::Debug for LiteLlmClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiteLlmClient")
            .field("api_base", &self.settings.api_base)
            .field("has_api_key", &self.settings.api_key.is_some())
            .field("default_model", &self.settings.default_model)
            .finish()
    }
}

impl LiteLlmClient {
    /// # Errors
    ///
    /// Returns `LlmError::RequestFailed` if the HTTP client cannot be built.
    pub fn new(mut settings: ClientSettings) -> Result<Self, LlmError> {
        settings.api_base = settings.api_base.trim_end_matches('/').to_string();
        let http_client = Client::builder()
            .timeout(settings.request_timeout)
            .build()
            .map_err(|e| LlmError::RequestFailed(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            settings,
            http_client,
        })
    }

    pub fn from_env() -> Result<Self, LlmError> {
        Self::new(ClientSettings::from_env()?)
    }

    pub fn settings(&self) -> &ClientSettings {
        &self.settings
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.settings.api_base)
    }
}

#[derive(Serialize)]
struct WireRequest<'a> {
    model: &'a str,
    messages: &'a [Message],
    /// Stages consume exactly one answer.
    n: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f64>,
}

#[derive(Deserialize)]
struct WireResponse {
    #[serde(default)]
    model: String,
    #[serde(default)]
    choices: Vec<WireChoice>,
    #[serde(default)]
    usage: Usage,
}

#[derive(Deserialize)]
struct WireChoice {
    message: WireMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct WireMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct WireError {
    error: WireErrorDetail,
}

#[derive(Deserialize)]
struct WireErrorDetail {
    message: String,
}

fn transport_error(e: reqwest::Error) -> LlmError {
    if e.is_timeout() {
        LlmError::Timeout(e.to_string())
    } else if e.is_connect() {
        LlmError::Unavailable(e.to_string())
    } else {
        LlmError::RequestFailed(e.to_string())
    }
}

/// Maps a non-success status and body to the error the stages classify.
fn status_error(status: StatusCode, body: &str) -> LlmError {
    let message = serde_json::from_str::<WireError>(body)
        .map(|e| e.error.message)
        .unwrap_or_else(|_| body.chars().take(MAX_ERROR_BODY).collect());

    match status {
        StatusCode::TOO_MANY_REQUESTS => LlmError::RateLimited(message),
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => LlmError::Timeout(message),
        StatusCode::BAD_GATEWAY | StatusCode::SERVICE_UNAVAILABLE => LlmError::Unavailable(message),
        _ => LlmError::ApiError {
            code: status.as_u16(),
            message,
        },
    }
}

fn into_response(wire: WireResponse, requested_model: &str) -> Result<GenerationResponse, LlmError> {
    let choice = wire
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| LlmError::ParseError("response has no choices".to_string()))?;

    Ok(GenerationResponse {
        model: if wire.model.is_empty() {
            requested_model.to_string()
        } else {
            wire.model
        },
        content: choice.message.content.unwrap_or_default(),
        finish_reason: FinishReason::parse(choice.finish_reason.as_deref()),
        usage: wire.usage,
    })
}

#[async_trait]
impl LlmProvider for LiteLlmClient {
    async fn generate(&self, request: &GenerationRequest) -> Result<GenerationResponse, LlmError> {
        let model = if request.model.is_empty() {
            self.settings.default_model.as_str()
        } else {
            request.model.as_str()
        };

        let body = WireRequest {
            model,
            messages: &request.messages,
            n: 1,
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            top_p: request.top_p,
        };

        let mut http_request = self
            .http_client
            .post(self.endpoint())
            .header("X-Title", "legacy-forge")
            .json(&body);
        if let Some(key) = &self.settings.api_key {
            http_request = http_request.bearer_auth(key);
        }

        let http_response = http_request.send().await.map_err(transport_error)?;
        let status = http_response.status();
        if !status.is_success() {
            let text = http_response.text().await.unwrap_or_default();
            return Err(status_error(status, &text));
        }

        let wire: WireResponse = http_response
            .json()
            .await
            .map_err(|e| LlmError::ParseError(format!("Failed to parse API response: {}", e)))?;
        into_response(wire, model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_settings_prefer_explicit_endpoint() {
        let settings = ClientSettings::from_lookup(lookup(&[
            ("LITELLM_API_BASE", "http://localhost:4000/"),
            ("OPENROUTER_API_KEY", "or-key"),
            ("LITELLM_DEFAULT_MODEL", "deepseek-coder"),
        ]))
        .unwrap();
        assert_eq!(settings.api_base, "http://localhost:4000/");
        assert_eq!(settings.api_key, None);
        assert_eq!(settings.default_model, "deepseek-coder");

        let client = LiteLlmClient::new(settings).unwrap();
        assert_eq!(client.endpoint(), "http://localhost:4000/chat/completions");
    }

    #[test]
    fn test_settings_fall_back_to_openrouter() {
        let settings = ClientSettings::from_lookup(lookup(&[
            ("OPENROUTER_API_KEY", "or-key"),
            ("FORGE_LLM_TIMEOUT_SECS", "30"),
        ]))
        .unwrap();
        assert_eq!(settings.api_base, OPENROUTER_API_BASE);
        assert_eq!(settings.api_key.as_deref(), Some("or-key"));
        assert_eq!(settings.request_timeout, Duration::from_secs(30));

        assert!(matches!(
            ClientSettings::from_lookup(lookup(&[])),
            Err(LlmError::MissingApiBase)
        ));
        assert!(ClientSettings::from_lookup(lookup(&[
            ("OPENROUTER_API_KEY", "k"),
            ("FORGE_LLM_TIMEOUT_SECS", "soon"),
        ]))
        .is_err());
    }

    #[test]
    fn test_wire_request_shape() {
        let messages = vec![Message::system("analyze"), Message::user("class A {};")];
        let body = WireRequest {
            model: "qwen",
            messages: &messages,
            n: 1,
            temperature: Some(0.1),
            max_tokens: None,
            top_p: None,
        };
        let json: serde_json::Value = serde_json::to_value(&body).unwrap();
        assert_eq!(json["messages"][0]["role"], "system");
        assert_eq!(json["n"], 1);
        assert!(json.get("max_tokens").is_none());
    }

    #[test]
    fn test_status_errors_map_to_categories() {
        let body = r#"{"error":{"message":"slow down"}}"#;
        assert!(matches!(
            status_error(StatusCode::TOO_MANY_REQUESTS, body),
            LlmError::RateLimited(m) if m == "slow down"
        ));
        assert!(matches!(
            status_error(StatusCode::GATEWAY_TIMEOUT, "upstream"),
            LlmError::Timeout(_)
        ));
        assert!(matches!(
            status_error(StatusCode::SERVICE_UNAVAILABLE, "loading model"),
            LlmError::Unavailable(m) if m == "loading model"
        ));
        let long = "x".repeat(2_000);
        match status_error(StatusCode::BAD_REQUEST, &long) {
            LlmError::ApiError { code, message } => {
                assert_eq!(code, 400);
                assert_eq!(message.len(), MAX_ERROR_BODY);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_response_takes_first_choice() {
        let wire: WireResponse = serde_json::from_str(
            r#"{"model":"","choices":[{"message":{"role":"assistant","content":"def f(): ..."},"finish_reason":"length"}],"usage":{"prompt_tokens":12,"completion_tokens":4,"total_tokens":16}}"#,
        )
        .unwrap();
        let response = into_response(wire, "qwen").unwrap();
        assert_eq!(response.model, "qwen");
        assert_eq!(response.content, "def f(): ...");
        assert!(response.is_truncated());
        assert_eq!(response.usage.total_tokens, 16);

        let empty: WireResponse = serde_json::from_str(r#"{"choices":[]}"#).unwrap();
        assert!(matches!(into_response(empty, "qwen"), Err(LlmError::ParseError(_))));
    }

    #[tokio::test]
    async fn test_generate_connection_error() {
        let client = LiteLlmClient::new(
            ClientSettings::new("http://127.0.0.1:1").with_request_timeout(Duration::from_secs(2)),
        )
        .unwrap();

        let result = client
            .generate(&GenerationRequest::new("", vec![Message::user("hi")]))
            .await;
        assert!(matches!(
            result,
            Err(LlmError::Unavailable(_)) | Err(LlmError::RequestFailed(_)) | Err(LlmError::Timeout(_))
        ));
    }
}

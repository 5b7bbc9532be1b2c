pub mod classify;
pub mod limiter;
pub mod retry;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::LlmConfig;
use crate::error::{CallError, CallResult};

pub use classify::{classify, is_retryable, suggested_backoff, ErrorCategory};
pub use limiter::{CallSlot, ConcurrencyLimiter};
pub use retry::{call_with_retry, Attempted, RetryPolicy};

/// A single text-in, text-out model request.
#[derive(Debug, Clone, Serialize)]
pub struct CompletionRequest {
    pub model: String,
    pub system: String,
    pub prompt: String,
    pub max_tokens: u32,
    pub temperature: f32,
}

/// Anything that can answer a prompt. Implementations perform exactly one
/// request per call; retries and slot accounting live in [`retry`].
#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn complete(&self, request: &CompletionRequest) -> CallResult<String>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmProvider {
    Anthropic,
    #[serde(rename = "openai")]
    OpenAi,
}

impl LlmProvider {
    pub fn from_str(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "openai" | "open_ai" | "openai-compatible" => LlmProvider::OpenAi,
            _ => LlmProvider::Anthropic,
        }
    }

    pub fn api_key_name(&self) -> &'static str {
        match self {
            LlmProvider::Anthropic => "ANTHROPIC_API_KEY",
            LlmProvider::OpenAi => "OPENAI_API_KEY",
        }
    }

    pub fn default_base_url(&self) -> &'static str {
        match self {
            LlmProvider::Anthropic => "https://api.anthropic.com/v1",
            LlmProvider::OpenAi => "https://api.openai.com/v1",
        }
    }
}

// Anthropic Messages API response structures
#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    content: Vec<AnthropicContentBlock>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum AnthropicContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(other)]
    Unknown,
}

// OpenAI chat completions response structures
#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

/// HTTP client for hosted chat models.
pub struct HttpLanguageModel {
    provider: LlmProvider,
    api_key: String,
    base_url: String,
    client: reqwest::Client,
}

impl HttpLanguageModel {
    pub fn new(config: &LlmConfig) -> CallResult<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(30))
            .timeout(config.request_timeout)
            .build()?;

        let base_url = config
            .base_url
            .clone()
            .unwrap_or_else(|| config.provider.default_base_url().to_string());

        Ok(Self {
            provider: config.provider,
            api_key: config.api_key.clone().unwrap_or_default(),
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    async fn call_anthropic(&self, request: &CompletionRequest) -> CallResult<String> {
        let body = serde_json::json!({
            "model": request.model,
            "max_tokens": request.max_tokens,
            "temperature": request.temperature,
            "system": request.system,
            "messages": [{"role": "user", "content": request.prompt}]
        });

        let response = self
            .client
            .post(format!("{}/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            return Err(CallError::status(status.as_u16(), error_body));
        }

        let api_response: AnthropicResponse = response.json().await?;
        let text: String = api_response
            .content
            .into_iter()
            .filter_map(|block| match block {
                AnthropicContentBlock::Text { text } => Some(text),
                AnthropicContentBlock::Unknown => None,
            })
            .collect();

        if text.trim().is_empty() {
            return Err(CallError::EmptyResponse);
        }
        Ok(text)
    }

    async fn call_openai(&self, request: &CompletionRequest) -> CallResult<String> {
        let body = serde_json::json!({
            "model": request.model,
            "max_tokens": request.max_tokens,
            "temperature": request.temperature,
            "messages": [
                {"role": "system", "content": request.system},
                {"role": "user", "content": request.prompt}
            ]
        });

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            return Err(CallError::status(status.as_u16(), error_body));
        }

        let api_response: ChatResponse = response.json().await?;
        api_response
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .filter(|text| !text.trim().is_empty())
            .ok_or(CallError::EmptyResponse)
    }
}

#[async_trait]
impl LanguageModel for HttpLanguageModel {
    async fn complete(&self, request: &CompletionRequest) -> CallResult<String> {
        debug!(
            provider = ?self.provider,
            model = %request.model,
            prompt_chars = request.prompt.len(),
            "Sending model request"
        );
        match self.provider {
            LlmProvider::Anthropic => self.call_anthropic(request).await,
            LlmProvider::OpenAi => self.call_openai(request).await,
        }
    }
}

/// In-process model double for unit tests.
#[cfg(test)]
pub(crate) mod scripted {
    use std::sync::Mutex;

    use super::*;

    type Responder = Box<dyn Fn(&CompletionRequest) -> CallResult<String> + Send + Sync>;

    pub(crate) struct ScriptedModel {
        responder: Responder,
        requests: Mutex<Vec<CompletionRequest>>,
    }

    impl ScriptedModel {
        pub(crate) fn new(
            responder: impl Fn(&CompletionRequest) -> CallResult<String> + Send + Sync + 'static,
        ) -> Self {
            Self {
                responder: Box::new(responder),
                requests: Mutex::new(Vec::new()),
            }
        }

        pub(crate) fn replying(text: &str) -> Self {
            let text = text.to_string();
            Self::new(move |_| Ok(text.clone()))
        }

        pub(crate) fn calls(&self) -> usize {
            self.requests.lock().unwrap().len()
        }

        pub(crate) fn requests(&self) -> Vec<CompletionRequest> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl LanguageModel for ScriptedModel {
        async fn complete(&self, request: &CompletionRequest) -> CallResult<String> {
            self.requests.lock().unwrap().push(request.clone());
            (self.responder)(request)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_from_str() {
        assert_eq!(LlmProvider::from_str("openai"), LlmProvider::OpenAi);
        assert_eq!(LlmProvider::from_str(" OpenAI "), LlmProvider::OpenAi);
        assert_eq!(LlmProvider::from_str("anthropic"), LlmProvider::Anthropic);
        assert_eq!(LlmProvider::from_str("anything"), LlmProvider::Anthropic);
    }

    #[test]
    fn test_provider_key_names() {
        assert_eq!(LlmProvider::Anthropic.api_key_name(), "ANTHROPIC_API_KEY");
        assert_eq!(LlmProvider::OpenAi.api_key_name(), "OPENAI_API_KEY");
    }

    #[test]
    fn test_anthropic_text_blocks_deserialize() {
        let raw = r#"{"content":[{"type":"thinking","thinking":"hm"},{"type":"text","text":"{\"ad_segments\":[]}"}]}"#;
        let parsed: AnthropicResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.content.len(), 2);
        assert!(matches!(
            &parsed.content[1],
            AnthropicContentBlock::Text { text } if text.contains("ad_segments")
        ));
    }

    #[test]
    fn test_client_uses_default_base_url() {
        let config = LlmConfig::default();
        let model = HttpLanguageModel::new(&config).unwrap();
        assert_eq!(model.base_url, "https://api.anthropic.com/v1");
    }
}

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use std::time::Duration;

use crate::{NaturalLanguageTools, Prompt, PromptResult, Timing, Usage};
use pipemark_types::{ModelVariant, PipemarkError, Result};

const PROVIDER: &str = "openai";
const DEFAULT_BASE_URL: &str = "https://api.openai.com";
const DEFAULT_MODEL: &str = "gpt-4o-mini";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

// ---------------------------------------------------------------------------
// OpenAiTools
// ---------------------------------------------------------------------------

/// Natural-language tools backed by an OpenAI-compatible HTTP API.
#[derive(Debug)]
pub struct OpenAiTools {
    api_key: String,
    client: reqwest::Client,
    base_url: String,
    default_model: String,
    timeout: Duration,
}

impl OpenAiTools {
    pub fn new(api_key: String) -> Self {
        Self {
            api_key,
            client: build_client(DEFAULT_TIMEOUT),
            base_url: DEFAULT_BASE_URL.to_string(),
            default_model: DEFAULT_MODEL.to_string(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Read `OPENAI_API_KEY`, plus the optional `OPENAI_BASE_URL` and
    /// `PIPEMARK_MODEL` overrides.
    pub fn from_env() -> Result<Self> {
        let key = std::env::var("OPENAI_API_KEY").map_err(|_| PipemarkError::Auth {
            provider: PROVIDER.into(),
        })?;
        let mut tools = Self::new(key);
        if let Ok(url) = std::env::var("OPENAI_BASE_URL") {
            tools = tools.with_base_url(url);
        }
        if let Ok(model) = std::env::var("PIPEMARK_MODEL") {
            tools = tools.with_default_model(model);
        }
        Ok(tools)
    }

    pub fn with_base_url(mut self, url: String) -> Self {
        self.base_url = url.trim_end_matches('/').to_string();
        self
    }

    pub fn with_default_model(mut self, model: String) -> Self {
        self.default_model = model;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self.client = build_client(timeout);
        self
    }

    pub fn default_model(&self) -> &str {
        &self.default_model
    }

    fn model_for(&self, prompt: &Prompt) -> String {
        prompt
            .model_requirements
            .model_name
            .clone()
            .unwrap_or_else(|| self.default_model.clone())
    }

    fn build_request_body(&self, prompt: &Prompt) -> serde_json::Value {
        let requirements = &prompt.model_requirements;
        let mut body = match requirements.model_variant {
            ModelVariant::Chat => json!({
                "model": self.model_for(prompt),
                "messages": [{ "role": "user", "content": prompt.content }],
            }),
            ModelVariant::Completion => json!({
                "model": self.model_for(prompt),
                "prompt": prompt.content,
            }),
        };

        if let Some(temperature) = requirements.temperature {
            body["temperature"] = json!(temperature);
        }
        if let Some(max_tokens) = requirements.max_tokens {
            body["max_tokens"] = json!(max_tokens);
        }

        body
    }

    async fn send(&self, path: &str, prompt: &Prompt) -> Result<PromptResult> {
        let started_at = Utc::now();
        let body = self.build_request_body(prompt);
        tracing::debug!(prompt = %prompt.id(), path, "sending request");

        let resp = self
            .client
            .post(format!("{}{path}", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        let status = resp.status();
        let response_body = resp.text().await.map_err(|e| self.transport_error(e))?;

        if !status.is_success() {
            return Err(map_error(status, &response_body));
        }

        let json: serde_json::Value =
            serde_json::from_str(&response_body).map_err(|e| PipemarkError::Provider {
                provider: PROVIDER.into(),
                status: status.as_u16(),
                message: format!("Failed to parse response JSON: {e}"),
                retryable: false,
            })?;

        let mut result = parse_response(prompt.model_requirements.model_variant, &json)?;
        if result.model_name.is_empty() {
            result.model_name = self.model_for(prompt);
        }
        result.timing = Timing::since(started_at);
        tracing::debug!(
            prompt = %prompt.id(),
            model = %result.model_name,
            output_tokens = result.usage.output_tokens,
            "received response"
        );
        Ok(result)
    }

    fn transport_error(&self, e: reqwest::Error) -> PipemarkError {
        if e.is_timeout() {
            PipemarkError::RequestTimeout {
                provider: PROVIDER.into(),
                timeout_ms: self.timeout.as_millis() as u64,
            }
        } else {
            PipemarkError::Provider {
                provider: PROVIDER.into(),
                status: 0,
                message: e.to_string(),
                retryable: true,
            }
        }
    }
}

fn build_client(timeout: Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .unwrap_or_default()
}

// ---------------------------------------------------------------------------
// Response parsing
// ---------------------------------------------------------------------------

fn parse_response(variant: ModelVariant, body: &serde_json::Value) -> Result<PromptResult> {
    let choice = &body["choices"][0];
    let content = match variant {
        ModelVariant::Chat => choice["message"]["content"].as_str(),
        ModelVariant::Completion => choice["text"].as_str(),
    };
    let Some(content) = content else {
        return Err(PipemarkError::Provider {
            provider: PROVIDER.into(),
            status: 200,
            message: "Response contains no choices".into(),
            retryable: false,
        });
    };

    let usage = Usage {
        input_tokens: body["usage"]["prompt_tokens"].as_u64().unwrap_or(0),
        output_tokens: body["usage"]["completion_tokens"].as_u64().unwrap_or(0),
    };
    let now = Utc::now();

    Ok(PromptResult {
        content: content.to_string(),
        model_name: body["model"].as_str().unwrap_or("").to_string(),
        usage,
        timing: Timing {
            started_at: now,
            completed_at: now,
        },
    })
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

fn map_error(status: reqwest::StatusCode, body: &str) -> PipemarkError {
    let status_u16 = status.as_u16();
    match status_u16 {
        401 | 403 => PipemarkError::Auth {
            provider: PROVIDER.into(),
        },
        408 => PipemarkError::RequestTimeout {
            provider: PROVIDER.into(),
            timeout_ms: 0,
        },
        429 | 500 | 502 | 503 | 504 => PipemarkError::Provider {
            provider: PROVIDER.into(),
            status: status_u16,
            message: extract_error_message(body),
            retryable: true,
        },
        _ => PipemarkError::Provider {
            provider: PROVIDER.into(),
            status: status_u16,
            message: extract_error_message(body),
            retryable: false,
        },
    }
}

fn extract_error_message(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v["error"]["message"].as_str().map(String::from))
        .unwrap_or_else(|| body.to_string())
}

// ---------------------------------------------------------------------------
// NaturalLanguageTools implementation
// ---------------------------------------------------------------------------

#[async_trait]
impl NaturalLanguageTools for OpenAiTools {
    fn name(&self) -> &str {
        PROVIDER
    }

    async fn chat(&self, prompt: &Prompt) -> Result<PromptResult> {
        self.send("/v1/chat/completions", prompt).await
    }

    async fn complete(&self, prompt: &Prompt) -> Result<PromptResult> {
        self.send("/v1/completions", prompt).await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use pipemark_types::{ModelRequirements, Parameters};

    fn prompt(variant: ModelVariant) -> Prompt {
        Prompt {
            title: "Summarize".into(),
            content: "Summarize this text".into(),
            model_requirements: ModelRequirements {
                model_variant: variant,
                model_name: None,
                temperature: Some(0.5),
                max_tokens: Some(256),
            },
            pipeline_url: None,
            step_name: "summarize".into(),
            parameters: Parameters::new(),
        }
    }

    #[test]
    fn chat_body_uses_messages() {
        let tools = OpenAiTools::new("key".into());
        let body = tools.build_request_body(&prompt(ModelVariant::Chat));
        assert_eq!(body["model"], DEFAULT_MODEL);
        assert_eq!(body["messages"][0]["role"], "user");
        assert_eq!(body["messages"][0]["content"], "Summarize this text");
        assert_eq!(body["temperature"], 0.5);
        assert_eq!(body["max_tokens"], 256);
        assert!(body.get("prompt").is_none());
    }

    #[test]
    fn completion_body_uses_prompt() {
        let tools = OpenAiTools::new("key".into()).with_default_model("davinci-002".into());
        let body = tools.build_request_body(&prompt(ModelVariant::Completion));
        assert_eq!(body["model"], "davinci-002");
        assert_eq!(body["prompt"], "Summarize this text");
        assert!(body.get("messages").is_none());
    }

    #[test]
    fn requested_model_wins_over_default() {
        let tools = OpenAiTools::new("key".into());
        let mut p = prompt(ModelVariant::Chat);
        p.model_requirements.model_name = Some("gpt-4o".into());
        assert_eq!(tools.build_request_body(&p)["model"], "gpt-4o");
    }

    #[test]
    fn base_url_trailing_slash_is_trimmed() {
        let tools = OpenAiTools::new("key".into()).with_base_url("http://localhost:8080/".into());
        assert_eq!(tools.base_url, "http://localhost:8080");
    }

    #[test]
    fn parse_chat_response() {
        let body = json!({
            "model": "gpt-4o-mini-2024",
            "choices": [{ "message": { "role": "assistant", "content": "A summary." } }],
            "usage": { "prompt_tokens": 12, "completion_tokens": 3 }
        });
        let result = parse_response(ModelVariant::Chat, &body).unwrap();
        assert_eq!(result.content, "A summary.");
        assert_eq!(result.model_name, "gpt-4o-mini-2024");
        assert_eq!(result.usage.input_tokens, 12);
        assert_eq!(result.usage.output_tokens, 3);
    }

    #[test]
    fn parse_completion_response() {
        let body = json!({ "choices": [{ "text": " continued" }] });
        let result = parse_response(ModelVariant::Completion, &body).unwrap();
        assert_eq!(result.content, " continued");
        assert_eq!(result.usage, Usage::default());
    }

    #[test]
    fn empty_choices_is_provider_error() {
        let err = parse_response(ModelVariant::Chat, &json!({ "choices": [] })).unwrap_err();
        assert!(matches!(err, PipemarkError::Provider { retryable: false, .. }));
    }

    #[test]
    fn map_error_statuses() {
        let auth = map_error(reqwest::StatusCode::UNAUTHORIZED, "");
        assert!(matches!(auth, PipemarkError::Auth { .. }));

        let limited = map_error(
            reqwest::StatusCode::TOO_MANY_REQUESTS,
            r#"{"error": {"message": "slow down"}}"#,
        );
        match limited {
            PipemarkError::Provider {
                status,
                message,
                retryable,
                ..
            } => {
                assert_eq!(status, 429);
                assert_eq!(message, "slow down");
                assert!(retryable);
            }
            other => panic!("Expected Provider, got: {other:?}"),
        }

        let bad = map_error(reqwest::StatusCode::BAD_REQUEST, "plain text");
        match bad {
            PipemarkError::Provider {
                message, retryable, ..
            } => {
                assert_eq!(message, "plain text");
                assert!(!retryable);
            }
            other => panic!("Expected Provider, got: {other:?}"),
        }
    }
}

use std::io::BufReader;

use anyhow::{anyhow, bail, Context, Result};
use quill_contracts::providers::ProviderKind;
use quill_contracts::settings::non_empty_env;
use reqwest::blocking::{Client as HttpClient, RequestBuilder};
use serde_json::{json, Map, Value};

use super::sse::text_chunks;
use super::{ChatRequest, TextChunks, TextProvider};
use crate::cancel::CancelToken;
use crate::http::{ensure_success, merge_object, response_json_or_error};

/// Chat-completions client shared by the routing gateway and OpenAI.
#[derive(Debug, Clone)]
pub struct OpenAiCompatibleProvider {
    kind: ProviderKind,
    api_base: String,
    api_key: String,
    http: HttpClient,
}

impl OpenAiCompatibleProvider {
    pub fn new(kind: ProviderKind, api_base: String, api_key: String, http: HttpClient) -> Self {
        Self {
            kind,
            api_base,
            api_key,
            http,
        }
    }

    fn label(&self) -> &'static str {
        match self.kind {
            ProviderKind::OpenAi => "OpenAI",
            _ => "OpenRouter",
        }
    }

    fn payload(&self, request: &ChatRequest, stream: bool) -> Value {
        let mut messages = Vec::new();
        if !request.system.trim().is_empty() {
            messages.push(json!({"role": "system", "content": request.system}));
        }
        messages.push(json!({"role": "user", "content": request.prompt}));

        let mut payload = Map::new();
        payload.insert("model".to_string(), Value::String(request.model.clone()));
        payload.insert("messages".to_string(), Value::Array(messages));
        payload.insert("temperature".to_string(), json!(request.temperature));
        let limit_key = if self.kind == ProviderKind::OpenAi {
            "max_completion_tokens"
        } else {
            "max_tokens"
        };
        payload.insert(limit_key.to_string(), json!(request.max_tokens));
        payload.insert("stream".to_string(), Value::Bool(stream));
        if let Some(schema) = &request.response_schema {
            payload.insert(
                "response_format".to_string(),
                json!({
                    "type": "json_schema",
                    "json_schema": {"name": "output", "strict": false, "schema": schema},
                }),
            );
        }
        if let Some(options) = &request.provider_options {
            merge_object(&mut payload, &options.body);
        }
        Value::Object(payload)
    }

    fn post(&self, payload: &Value) -> RequestBuilder {
        let request = self
            .http
            .post(format!("{}/chat/completions", self.api_base))
            .bearer_auth(&self.api_key)
            .json(payload);
        if self.kind == ProviderKind::RoutingGateway {
            apply_gateway_headers(request)
        } else {
            request
        }
    }
}

impl TextProvider for OpenAiCompatibleProvider {
    fn kind(&self) -> ProviderKind {
        self.kind
    }

    fn complete(&self, request: &ChatRequest, cancel: Option<&CancelToken>) -> Result<String> {
        let label = self.label();
        let response = self
            .post(&self.payload(request, false))
            .send()
            .with_context(|| format!("{label} request failed"))?;
        let body = response_json_or_error(label, response, cancel)?;
        let text = message_text(&body)
            .ok_or_else(|| anyhow!("{label} response contained no message text"))?;
        if text.trim().is_empty() {
            bail!("{label} returned an empty completion");
        }
        Ok(text)
    }

    fn stream(&self, request: &ChatRequest) -> Result<TextChunks> {
        let label = self.label();
        let response = self
            .post(&self.payload(request, true))
            .send()
            .with_context(|| format!("{label} stream request failed"))?;
        let response = ensure_success(label, response)?;
        Ok(text_chunks(BufReader::new(response), label, delta_text))
    }
}

fn apply_gateway_headers(mut request: RequestBuilder) -> RequestBuilder {
    if let Some(referer) = non_empty_env("OPENROUTER_HTTP_REFERER")
        .or_else(|| non_empty_env("QUILL_OPENROUTER_HTTP_REFERER"))
    {
        request = request.header("HTTP-Referer", referer);
    }
    let title = non_empty_env("OPENROUTER_X_TITLE")
        .or_else(|| non_empty_env("QUILL_OPENROUTER_X_TITLE"))
        .unwrap_or_else(|| "Quill".to_string());
    request.header("X-Title", title)
}

fn message_text(body: &Value) -> Option<String> {
    let content = body
        .get("choices")?
        .as_array()?
        .first()?
        .get("message")?
        .get("content")?;
    content_text(content)
}

fn content_text(content: &Value) -> Option<String> {
    match content {
        Value::String(text) => Some(text.clone()),
        // Some gateways return content as typed parts.
        Value::Array(parts) => {
            let joined = parts
                .iter()
                .filter_map(|part| part.get("text").and_then(Value::as_str))
                .collect::<String>();
            Some(joined)
        }
        _ => None,
    }
}

fn delta_text(event: &Value) -> Result<Option<String>> {
    if let Some(error) = event.get("error") {
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| error.to_string());
        bail!("stream error: {message}");
    }
    let text = event
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|choices| choices.first())
        .and_then(|choice| choice.get("delta"))
        .and_then(|delta| delta.get("content"))
        .and_then(content_text)
        .filter(|text| !text.is_empty());
    Ok(text)
}

#[cfg(test)]
mod tests {
    use quill_contracts::providers::build_provider_options;
    use quill_contracts::settings::{GenerationPreset, ReasoningEffort};

    use super::*;

    fn provider(kind: ProviderKind) -> OpenAiCompatibleProvider {
        OpenAiCompatibleProvider::new(
            kind,
            "http://127.0.0.1:9".to_string(),
            "key".to_string(),
            HttpClient::new(),
        )
    }

    fn request() -> ChatRequest {
        ChatRequest {
            model: "openai/gpt-4o-mini".to_string(),
            system: "Be brief.".to_string(),
            prompt: "Describe the tavern.".to_string(),
            temperature: 0.5,
            max_tokens: 256,
            provider_options: None,
            response_schema: None,
        }
    }

    #[test]
    fn gateway_payload_carries_options_at_top_level() {
        let mut preset = GenerationPreset::new("writer", "openai/gpt-4o-mini");
        preset.reasoning_effort = ReasoningEffort::High;
        preset.provider_only = vec!["openai".to_string()];
        let mut chat = request();
        chat.provider_options = build_provider_options(&preset, ProviderKind::RoutingGateway);

        let payload = provider(ProviderKind::RoutingGateway).payload(&chat, false);
        assert_eq!(payload["reasoning"], json!({"effort": "high"}));
        assert_eq!(payload["provider"], json!({"only": ["openai"]}));
        assert_eq!(payload["max_tokens"], json!(256));
        assert_eq!(payload["messages"][0]["role"], json!("system"));
        assert_eq!(payload["messages"][1]["content"], json!("Describe the tavern."));
        assert_eq!(payload["stream"], json!(false));
    }

    #[test]
    fn openai_payload_uses_completion_token_limit_and_schema() {
        let mut chat = request();
        chat.system.clear();
        chat.response_schema = Some(json!({"type": "array"}));
        let payload = provider(ProviderKind::OpenAi).payload(&chat, true);
        assert_eq!(payload["max_completion_tokens"], json!(256));
        assert!(payload.get("max_tokens").is_none());
        assert_eq!(payload["messages"].as_array().map(Vec::len), Some(1));
        assert_eq!(payload["response_format"]["type"], json!("json_schema"));
        assert_eq!(
            payload["response_format"]["json_schema"]["schema"],
            json!({"type": "array"})
        );
        assert_eq!(payload["stream"], json!(true));
    }

    #[test]
    fn temperature_is_sent_as_written() -> anyhow::Result<()> {
        let mut chat = request();
        chat.temperature = 0.7;
        let payload = provider(ProviderKind::RoutingGateway).payload(&chat, false);
        assert_eq!(payload["temperature"], json!(0.7));
        assert_eq!(serde_json::to_string(&payload["temperature"])?, "0.7");
        Ok(())
    }

    #[test]
    fn tripped_token_drops_the_reply() -> anyhow::Result<()> {
        let base = crate::testing::serve_once(
            std::time::Duration::ZERO,
            200,
            r#"{"choices":[{"message":{"content":"too late"}}]}"#,
        )?;
        let provider = OpenAiCompatibleProvider::new(
            ProviderKind::OpenAi,
            base,
            "key".to_string(),
            HttpClient::new(),
        );
        let cancel = CancelToken::new();
        cancel.cancel();
        assert!(provider.complete(&request(), Some(&cancel)).is_err());
        Ok(())
    }

    #[test]
    fn message_text_handles_string_and_parts() {
        let plain = json!({"choices": [{"message": {"content": "Hello"}}]});
        assert_eq!(message_text(&plain).as_deref(), Some("Hello"));
        let parts = json!({"choices": [{"message": {"content": [
            {"type": "text", "text": "Hel"},
            {"type": "text", "text": "lo"}
        ]}}]});
        assert_eq!(message_text(&parts).as_deref(), Some("Hello"));
        assert_eq!(message_text(&json!({"choices": []})), None);
    }

    #[test]
    fn delta_text_skips_role_only_chunks_and_raises_errors() -> anyhow::Result<()> {
        let role_only = json!({"choices": [{"delta": {"role": "assistant"}}]});
        assert_eq!(delta_text(&role_only)?, None);
        let text = json!({"choices": [{"delta": {"content": "Once"}}]});
        assert_eq!(delta_text(&text)?.as_deref(), Some("Once"));
        let error = json!({"error": {"message": "rate limited"}});
        assert!(delta_text(&error).is_err());
        Ok(())
    }
}

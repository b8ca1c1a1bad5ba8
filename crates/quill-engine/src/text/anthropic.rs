use std::io::BufReader;

use anyhow::{bail, Context, Result};
use quill_contracts::providers::ProviderKind;
use reqwest::blocking::{Client as HttpClient, RequestBuilder};
use serde_json::{json, Map, Value};

use super::sse::text_chunks;
use super::{system_with_schema, ChatRequest, TextChunks, TextProvider};
use crate::cancel::CancelToken;
use crate::http::{ensure_success, merge_object, response_json_or_error};

const ANTHROPIC_VERSION: &str = "2023-06-01";

#[derive(Debug, Clone)]
pub struct AnthropicProvider {
    api_base: String,
    api_key: String,
    http: HttpClient,
}

impl AnthropicProvider {
    pub fn new(api_base: String, api_key: String, http: HttpClient) -> Self {
        Self {
            api_base,
            api_key,
            http,
        }
    }

    fn payload(&self, request: &ChatRequest, stream: bool) -> Value {
        let mut payload = Map::new();
        payload.insert("model".to_string(), Value::String(request.model.clone()));
        payload.insert("max_tokens".to_string(), json!(request.max_tokens));
        let system = system_with_schema(&request.system, request.response_schema.as_ref());
        if !system.trim().is_empty() {
            payload.insert("system".to_string(), Value::String(system));
        }
        payload.insert(
            "messages".to_string(),
            json!([{"role": "user", "content": request.prompt}]),
        );
        payload.insert("temperature".to_string(), json!(request.temperature));
        payload.insert("stream".to_string(), Value::Bool(stream));
        if let Some(options) = &request.provider_options {
            merge_object(&mut payload, &options.body);
        }

        // Extended thinking needs temperature 1 and room beyond the budget.
        let budget = payload
            .get("thinking")
            .and_then(|thinking| thinking.get("budget_tokens"))
            .and_then(Value::as_u64);
        if let Some(budget) = budget {
            payload.remove("temperature");
            if u64::from(request.max_tokens) <= budget {
                payload.insert(
                    "max_tokens".to_string(),
                    json!(budget + u64::from(request.max_tokens)),
                );
            }
        }
        Value::Object(payload)
    }

    fn post(&self, payload: &Value) -> RequestBuilder {
        self.http
            .post(format!("{}/messages", self.api_base))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(payload)
    }
}

impl TextProvider for AnthropicProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Anthropic
    }

    fn complete(&self, request: &ChatRequest, cancel: Option<&CancelToken>) -> Result<String> {
        let response = self
            .post(&self.payload(request, false))
            .send()
            .context("Anthropic request failed")?;
        let body = response_json_or_error("Anthropic", response, cancel)?;
        let text = content_text(&body);
        if text.trim().is_empty() {
            bail!("Anthropic response contained no text blocks");
        }
        Ok(text)
    }

    fn stream(&self, request: &ChatRequest) -> Result<TextChunks> {
        let response = self
            .post(&self.payload(request, true))
            .send()
            .context("Anthropic stream request failed")?;
        let response = ensure_success("Anthropic", response)?;
        Ok(text_chunks(BufReader::new(response), "Anthropic", delta_text))
    }
}

fn content_text(body: &Value) -> String {
    body.get("content")
        .and_then(Value::as_array)
        .map(|blocks| {
            blocks
                .iter()
                .filter(|block| block.get("type").and_then(Value::as_str) == Some("text"))
                .filter_map(|block| block.get("text").and_then(Value::as_str))
                .collect::<String>()
        })
        .unwrap_or_default()
}

fn delta_text(event: &Value) -> Result<Option<String>> {
    match event.get("type").and_then(Value::as_str) {
        Some("content_block_delta") => {
            let delta = event.get("delta");
            let is_text = delta
                .and_then(|delta| delta.get("type"))
                .and_then(Value::as_str)
                == Some("text_delta");
            if !is_text {
                return Ok(None);
            }
            Ok(delta
                .and_then(|delta| delta.get("text"))
                .and_then(Value::as_str)
                .filter(|text| !text.is_empty())
                .map(str::to_string))
        }
        Some("error") => {
            let message = event
                .get("error")
                .and_then(|error| error.get("message"))
                .and_then(Value::as_str)
                .unwrap_or("unknown stream error");
            bail!("Anthropic stream error: {message}");
        }
        _ => Ok(None),
    }
}

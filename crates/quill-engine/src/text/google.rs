use std::io::BufReader;

use anyhow::{bail, Context, Result};
use quill_contracts::providers::ProviderKind;
use reqwest::blocking::{Client as HttpClient, RequestBuilder};
use serde_json::{json, Map, Value};

use super::sse::text_chunks;
use super::{system_with_schema, ChatRequest, TextChunks, TextProvider};
use crate::cancel::CancelToken;
use crate::http::{ensure_success, merge_object, response_json_or_error};

/// Gemini `generateContent` client.
#[derive(Debug, Clone)]
pub struct GoogleProvider {
    api_base: String,
    api_key: String,
    http: HttpClient,
}

impl GoogleProvider {
    pub fn new(api_base: String, api_key: String, http: HttpClient) -> Self {
        Self {
            api_base,
            api_key,
            http,
        }
    }

    fn payload(&self, request: &ChatRequest) -> Value {
        let mut generation_config = Map::new();
        generation_config.insert("temperature".to_string(), json!(request.temperature));
        generation_config.insert("maxOutputTokens".to_string(), json!(request.max_tokens));
        if request.response_schema.is_some() {
            generation_config.insert(
                "responseMimeType".to_string(),
                Value::String("application/json".to_string()),
            );
        }
        if let Some(options) = &request.provider_options {
            merge_object(&mut generation_config, &options.body);
        }

        let mut payload = Map::new();
        payload.insert(
            "contents".to_string(),
            json!([{"role": "user", "parts": [{"text": request.prompt}]}]),
        );
        let system = system_with_schema(&request.system, request.response_schema.as_ref());
        if !system.trim().is_empty() {
            payload.insert(
                "systemInstruction".to_string(),
                json!({"parts": [{"text": system}]}),
            );
        }
        payload.insert(
            "generationConfig".to_string(),
            Value::Object(generation_config),
        );
        Value::Object(payload)
    }

    fn post(&self, request: &ChatRequest, method: &str) -> RequestBuilder {
        let model = request
            .model
            .trim()
            .trim_start_matches("models/")
            .trim_start_matches("google/");
        self.http
            .post(format!("{}/models/{model}:{method}", self.api_base))
            .header("x-goog-api-key", &self.api_key)
            .json(&self.payload(request))
    }
}

impl TextProvider for GoogleProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Google
    }

    fn complete(&self, request: &ChatRequest, cancel: Option<&CancelToken>) -> Result<String> {
        let response = self
            .post(request, "generateContent")
            .send()
            .context("Gemini request failed")?;
        let body = response_json_or_error("Gemini", response, cancel)?;
        let text = candidate_text(&body);
        if text.trim().is_empty() {
            let reason = body
                .get("promptFeedback")
                .and_then(|feedback| feedback.get("blockReason"))
                .and_then(Value::as_str)
                .unwrap_or("no candidates");
            bail!("Gemini response contained no text ({reason})");
        }
        Ok(text)
    }

    fn stream(&self, request: &ChatRequest) -> Result<TextChunks> {
        let response = self
            .post(request, "streamGenerateContent?alt=sse")
            .send()
            .context("Gemini stream request failed")?;
        let response = ensure_success("Gemini", response)?;
        Ok(text_chunks(BufReader::new(response), "Gemini", delta_text))
    }
}

fn candidate_text(body: &Value) -> String {
    body.get("candidates")
        .and_then(Value::as_array)
        .and_then(|candidates| candidates.first())
        .and_then(|candidate| candidate.get("content"))
        .and_then(|content| content.get("parts"))
        .and_then(Value::as_array)
        .map(|parts| {
            parts
                .iter()
                .filter(|part| !part.get("thought").and_then(Value::as_bool).unwrap_or(false))
                .filter_map(|part| part.get("text").and_then(Value::as_str))
                .collect::<String>()
        })
        .unwrap_or_default()
}

fn delta_text(event: &Value) -> Result<Option<String>> {
    if let Some(error) = event.get("error") {
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("unknown stream error");
        bail!("Gemini stream error: {message}");
    }
    let text = candidate_text(event);
    Ok(if text.is_empty() { None } else { Some(text) })
}

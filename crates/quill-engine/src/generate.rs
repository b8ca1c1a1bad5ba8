use std::marker::PhantomData;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::thread;

use quill_contracts::settings::{Settings, SettingsSource};
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::cancel::{run_cancellable, CancelToken, CANCEL_POLL_INTERVAL};
use crate::error::{GenerationError, GenerationResult};
use crate::http::truncate_text;
use crate::resolve::{resolve_narrative, resolve_preset, ResolvedConfig};
use crate::text::{ChatRequest, TextChunks, TextProviderFactory};

/// A typed reply shape with its JSON schema and semantic checks.
pub trait StructuredOutput: DeserializeOwned + Send + 'static {
    fn schema() -> Value;

    fn validate(&self) -> Result<(), String> {
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct GenerateRequest {
    pub preset_id: String,
    pub system: String,
    pub prompt: String,
    pub cancel: Option<CancelToken>,
}

impl GenerateRequest {
    pub fn new(
        preset_id: impl Into<String>,
        system: impl Into<String>,
        prompt: impl Into<String>,
    ) -> Self {
        Self {
            preset_id: preset_id.into(),
            system: system.into(),
            prompt: prompt.into(),
            cancel: None,
        }
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = Some(cancel);
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct NarrativeRequest {
    pub system: String,
    pub prompt: String,
    pub cancel: Option<CancelToken>,
}

impl NarrativeRequest {
    pub fn new(system: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            prompt: prompt.into(),
            cancel: None,
        }
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = Some(cancel);
        self
    }
}

/// Uniform text generation over every configured provider.
///
/// Settings are loaded and resolved again on every call so edits take effect
/// immediately.
#[derive(Clone)]
pub struct Generator {
    settings: Arc<dyn SettingsSource>,
    providers: Arc<dyn TextProviderFactory>,
}

impl Generator {
    pub fn new(settings: Arc<dyn SettingsSource>, providers: Arc<dyn TextProviderFactory>) -> Self {
        Self {
            settings,
            providers,
        }
    }

    pub fn settings_source(&self) -> Arc<dyn SettingsSource> {
        self.settings.clone()
    }

    pub fn settings(&self) -> GenerationResult<Settings> {
        self.settings.load().map_err(GenerationError::Settings)
    }

    pub fn resolve(&self, preset_id: &str) -> GenerationResult<ResolvedConfig> {
        resolve_preset(&self.settings()?, self.providers.as_ref(), preset_id)
    }

    pub fn generate_structured<T: StructuredOutput>(
        &self,
        request: &GenerateRequest,
    ) -> GenerationResult<T> {
        let config = self.resolve(&request.preset_id)?;
        log_call("generate_structured", &config);
        let chat = config.chat_request(&request.system, &request.prompt, Some(T::schema()));
        let text = complete(&config, chat, request.cancel.as_ref())?;
        parse_structured(&text)
    }

    pub fn generate_plain_text(&self, request: &GenerateRequest) -> GenerationResult<String> {
        let config = self.resolve(&request.preset_id)?;
        log_call("generate_plain_text", &config);
        let chat = config.chat_request(&request.system, &request.prompt, None);
        complete(&config, chat, request.cancel.as_ref())
    }

    pub fn stream_plain_text(&self, request: &GenerateRequest) -> GenerationResult<TextStream> {
        let config = self.resolve(&request.preset_id)?;
        log_call("stream_plain_text", &config);
        let chat = config.chat_request(&request.system, &request.prompt, None);
        open_stream(&config, chat, request.cancel.clone())
    }

    pub fn stream_structured<T: StructuredOutput>(
        &self,
        request: &GenerateRequest,
    ) -> GenerationResult<StructuredStream<T>> {
        let config = self.resolve(&request.preset_id)?;
        log_call("stream_structured", &config);
        let chat = config.chat_request(&request.system, &request.prompt, Some(T::schema()));
        let text = open_stream(&config, chat, request.cancel.clone())?;
        Ok(StructuredStream::new(text))
    }

    pub fn generate_narrative(&self, request: &NarrativeRequest) -> GenerationResult<String> {
        let config = resolve_narrative(&self.settings()?, self.providers.as_ref())?;
        log_call("generate_narrative", &config);
        let chat = config.chat_request(&request.system, &request.prompt, None);
        complete(&config, chat, request.cancel.as_ref())
    }

    pub fn stream_narrative(&self, request: &NarrativeRequest) -> GenerationResult<TextStream> {
        let config = resolve_narrative(&self.settings()?, self.providers.as_ref())?;
        log_call("stream_narrative", &config);
        let chat = config.chat_request(&request.system, &request.prompt, None);
        open_stream(&config, chat, request.cancel.clone())
    }
}

fn log_call(operation: &str, config: &ResolvedConfig) {
    log::debug!(
        "{operation}: preset={} model={} provider={}",
        config.preset.id,
        config.model.model_id,
        config.kind
    );
}

fn complete(
    config: &ResolvedConfig,
    chat: ChatRequest,
    cancel: Option<&CancelToken>,
) -> GenerationResult<String> {
    let provider = config.model.provider.clone();
    let token = cancel.cloned();
    run_cancellable(cancel, "complete", move || {
        provider.complete(&chat, token.as_ref())
    })
}

fn open_stream(
    config: &ResolvedConfig,
    chat: ChatRequest,
    cancel: Option<CancelToken>,
) -> GenerationResult<TextStream> {
    let provider = config.model.provider.clone();
    let chunks = run_cancellable(cancel.as_ref(), "stream-open", move || {
        provider.stream(&chat)
    })?;
    Ok(TextStream::new(chunks, cancel))
}

const STREAM_READ_AHEAD: usize = 16;

/// Lazy, single-pass text deltas.
///
/// The body is read on a helper thread, so a tripped token is noticed within
/// one poll interval even while the server is stalled. After the token trips
/// the stream yields one `Cancelled` error, discards anything already read and
/// drops the connection once the reader wakes up.
pub struct TextStream {
    chunks: Option<Receiver<anyhow::Result<String>>>,
    cancel: Option<CancelToken>,
}

impl TextStream {
    pub fn new(chunks: TextChunks, cancel: Option<CancelToken>) -> Self {
        let (tx, rx) = mpsc::sync_channel(STREAM_READ_AHEAD);
        let spawn_failure = tx.clone();
        let reader_cancel = cancel.clone();
        let spawned = thread::Builder::new()
            .name("quill-stream".to_string())
            .spawn(move || {
                for chunk in chunks {
                    if CancelToken::tripped(reader_cancel.as_ref()) {
                        break;
                    }
                    let failed = chunk.is_err();
                    if tx.send(chunk).is_err() || failed {
                        break;
                    }
                }
            });
        if let Err(err) = spawned {
            let _ = spawn_failure.send(Err(anyhow::anyhow!("stream reader spawn failed: {err}")));
        }
        Self {
            chunks: Some(rx),
            cancel,
        }
    }

    /// Drains the stream into one string.
    pub fn collect_text(self) -> GenerationResult<String> {
        let mut text = String::new();
        for chunk in self {
            text.push_str(&chunk?);
        }
        Ok(text)
    }

    fn cancelled(&self) -> bool {
        CancelToken::tripped(self.cancel.as_ref())
    }
}

impl Iterator for TextStream {
    type Item = GenerationResult<String>;

    fn next(&mut self) -> Option<Self::Item> {
        let chunks = self.chunks.take()?;
        loop {
            if self.cancelled() {
                return Some(Err(GenerationError::Cancelled));
            }
            match chunks.recv_timeout(CANCEL_POLL_INTERVAL) {
                Ok(Ok(text)) => {
                    if self.cancelled() {
                        return Some(Err(GenerationError::Cancelled));
                    }
                    self.chunks = Some(chunks);
                    return Some(Ok(text));
                }
                Ok(Err(err)) => return Some(Err(GenerationError::Transport(err))),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return None,
            }
        }
    }
}

/// Text deltas of a structured reply; `finish` validates the whole reply.
pub struct StructuredStream<T> {
    inner: TextStream,
    buffer: String,
    _output: PhantomData<fn() -> T>,
}

impl<T: StructuredOutput> StructuredStream<T> {
    fn new(inner: TextStream) -> Self {
        Self {
            inner,
            buffer: String::new(),
            _output: PhantomData,
        }
    }

    /// Text received so far.
    pub fn partial_text(&self) -> &str {
        &self.buffer
    }

    /// Consumes the rest of the stream and returns the validated value.
    pub fn finish(mut self) -> GenerationResult<T> {
        while let Some(chunk) = self.inner.next() {
            self.buffer.push_str(&chunk?);
        }
        parse_structured(&self.buffer)
    }
}

impl<T: StructuredOutput> Iterator for StructuredStream<T> {
    type Item = GenerationResult<String>;

    fn next(&mut self) -> Option<Self::Item> {
        let chunk = self.inner.next()?;
        if let Ok(text) = &chunk {
            self.buffer.push_str(text);
        }
        Some(chunk)
    }
}

/// Parses and validates a structured reply, tolerating code fences and prose.
pub fn parse_structured<T: StructuredOutput>(text: &str) -> GenerationResult<T> {
    let Some(json) = extract_json_from_text(text) else {
        return Err(GenerationError::Validation(format!(
            "reply contained no JSON: {}",
            truncate_text(text.trim(), 200)
        )));
    };
    let value = serde_json::from_value::<T>(json)
        .map_err(|err| GenerationError::Validation(err.to_string()))?;
    value.validate().map_err(GenerationError::Validation)?;
    Ok(value)
}

/// Body of a fenced reply (```` ```json ... ``` ````), or the trimmed text.
fn unfence(text: &str) -> &str {
    let raw = text.trim();
    let Some(inner) = raw
        .strip_prefix("```")
        .and_then(|rest| rest.strip_suffix("```"))
    else {
        return raw;
    };
    let body = match inner.split_once('\n') {
        Some((tag, rest)) if tag.trim().chars().all(|c| c.is_ascii_alphanumeric()) => rest,
        _ => inner,
    };
    let body = body.trim();
    match body.get(..4) {
        Some(tag) if tag.eq_ignore_ascii_case("json") => body[4..].trim(),
        _ => body,
    }
}

/// First JSON object or array found in `text`.
pub fn extract_json_from_text(text: &str) -> Option<Value> {
    let raw = unfence(text);
    if raw.is_empty() {
        return None;
    }
    let mut candidates = vec![raw.to_string()];
    for (open, close) in [('{', '}'), ('[', ']')] {
        if let (Some(start), Some(end)) = (raw.find(open), raw.rfind(close)) {
            if end > start {
                candidates.push(raw[start..=end].to_string());
            }
        }
    }
    candidates
        .into_iter()
        .filter_map(|candidate| serde_json::from_str::<Value>(&candidate).ok())
        .find(|parsed| parsed.is_object() || parsed.is_array())
}

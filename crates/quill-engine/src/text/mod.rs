mod anthropic;
mod google;
mod openai;
mod sse;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use quill_contracts::providers::{ProviderKind, ProviderOptions};
use quill_contracts::settings::ApiProfile;
use serde_json::Value;

use crate::cancel::CancelToken;
use crate::error::{GenerationError, GenerationResult};
use crate::http::{api_base, SharedClient};

pub use anthropic::AnthropicProvider;
pub use google::GoogleProvider;
pub use openai::OpenAiCompatibleProvider;

/// One system + user exchange against a concrete model.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatRequest {
    pub model: String,
    pub system: String,
    pub prompt: String,
    pub temperature: f64,
    pub max_tokens: u32,
    pub provider_options: Option<ProviderOptions>,
    /// JSON schema the reply must satisfy, when structured output is wanted.
    pub response_schema: Option<Value>,
}

/// Lazy, single-pass text deltas.
pub type TextChunks = Box<dyn Iterator<Item = Result<String>> + Send>;

pub trait TextProvider: Send + Sync {
    fn kind(&self) -> ProviderKind;
    /// Blocking completion. Implementations drop the connection at their next
    /// checkpoint once `cancel` trips.
    fn complete(&self, request: &ChatRequest, cancel: Option<&CancelToken>) -> Result<String>;
    fn stream(&self, request: &ChatRequest) -> Result<TextChunks>;
}

/// Builds a provider client from a configured profile.
pub trait TextProviderFactory: Send + Sync {
    fn create(&self, profile: &ApiProfile) -> GenerationResult<Arc<dyn TextProvider>>;
}

#[derive(Debug, Clone, Default)]
pub struct HttpProviderFactory {
    http: SharedClient,
}

impl HttpProviderFactory {
    /// Clients without a transport deadline; bound calls with a `CancelToken`.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            http: SharedClient::with_timeout(Some(timeout)),
        }
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.http.timeout()
    }
}

impl TextProviderFactory for HttpProviderFactory {
    fn create(&self, profile: &ApiProfile) -> GenerationResult<Arc<dyn TextProvider>> {
        let kind = profile.provider_type;
        let api_key = profile.credential().ok_or_else(|| {
            GenerationError::MissingCredential(format!(
                "No API key for profile '{}' ({kind}); set it in Settings or export {}",
                profile.id,
                kind.credential_env()
            ))
        })?;
        let base = api_base(profile.base_url.as_deref(), kind.default_api_base());
        let http = self.http.get()?;
        let provider: Arc<dyn TextProvider> = match kind {
            ProviderKind::RoutingGateway | ProviderKind::OpenAi => {
                Arc::new(OpenAiCompatibleProvider::new(kind, base, api_key, http))
            }
            ProviderKind::Anthropic => Arc::new(AnthropicProvider::new(base, api_key, http)),
            ProviderKind::Google => Arc::new(GoogleProvider::new(base, api_key, http)),
        };
        Ok(provider)
    }
}

/// System prompt extended with schema instructions for providers without a
/// native structured-output field.
pub(crate) fn system_with_schema(system: &str, schema: Option<&Value>) -> String {
    let Some(schema) = schema else {
        return system.to_string();
    };
    let schema_text = serde_json::to_string_pretty(schema).unwrap_or_else(|_| "{}".to_string());
    let instruction = format!(
        "Respond with a single JSON value that matches this JSON schema. Output JSON only, without prose or code fences.\n{schema_text}"
    );
    if system.trim().is_empty() {
        return instruction;
    }
    format!("{}\n\n{instruction}", system.trim_end())
}

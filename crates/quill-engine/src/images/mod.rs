mod dryrun;
mod nanogpt;

use std::time::Duration;

use anyhow::{bail, Result};
use quill_contracts::settings::ImageGenerationSettings;
use serde::{Deserialize, Serialize};

use crate::http::{api_base, SharedClient};

pub use dryrun::DryrunImageProvider;
pub use nanogpt::NanoGptImageProvider;

pub const NANOGPT_API_BASE: &str = "https://nano-gpt.com/api/v1";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImageGenerationRequest {
    pub prompt: String,
    pub model: String,
    pub size: String,
    pub response_format: String,
}

impl ImageGenerationRequest {
    pub fn b64(
        prompt: impl Into<String>,
        model: impl Into<String>,
        size: impl Into<String>,
    ) -> Self {
        Self {
            prompt: prompt.into(),
            model: model.into(),
            size: size.into(),
            response_format: "b64_json".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedImage {
    #[serde(default)]
    pub b64_json: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub revised_prompt: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImageGenerationResponse {
    pub images: Vec<GeneratedImage>,
}

impl ImageGenerationResponse {
    /// Encoded payload of the first image; its absence is a failure.
    pub fn first_payload(&self) -> Result<&str> {
        match self
            .images
            .first()
            .and_then(|image| image.b64_json.as_deref())
        {
            Some(payload) if !payload.trim().is_empty() => Ok(payload),
            _ => bail!("No image data returned"),
        }
    }
}

pub trait ImageProvider: Send + Sync {
    fn name(&self) -> &str;
    fn generate(&self, request: &ImageGenerationRequest) -> Result<ImageGenerationResponse>;
}

/// Builds the adapter for one artifact; a credential is always required.
pub trait ImageProviderFactory: Send + Sync {
    fn create(
        &self,
        settings: &ImageGenerationSettings,
        api_key: &str,
    ) -> Result<Box<dyn ImageProvider>>;
}

/// Image models can take minutes; no transport deadline unless one is given.
#[derive(Debug, Clone, Default)]
pub struct HttpImageProviderFactory {
    http: SharedClient,
}

impl HttpImageProviderFactory {
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

impl ImageProviderFactory for HttpImageProviderFactory {
    fn create(
        &self,
        settings: &ImageGenerationSettings,
        api_key: &str,
    ) -> Result<Box<dyn ImageProvider>> {
        if api_key.trim().is_empty() {
            bail!("No NanoGPT API key configured for image generation");
        }
        if settings.model.trim().starts_with("dryrun") {
            return Ok(Box::new(DryrunImageProvider));
        }
        let base = api_base(settings.api_base.as_deref(), NANOGPT_API_BASE);
        Ok(Box::new(NanoGptImageProvider::new(
            base,
            api_key.trim().to_string(),
            self.http.get()?,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::error_chain_text;
    use crate::testing::serve_once;

    const ONE_IMAGE: &str = r#"{"data":[{"b64_json":"aGk="}]}"#;

    fn settings_for(base: String) -> ImageGenerationSettings {
        ImageGenerationSettings {
            api_base: Some(base),
            ..ImageGenerationSettings::default()
        }
    }

    #[test]
    fn slow_image_model_is_waited_for() -> anyhow::Result<()> {
        let base = serve_once(Duration::from_millis(1200), 200, ONE_IMAGE)?;
        let factory = HttpImageProviderFactory::new();
        assert_eq!(factory.timeout(), None);
        let provider = factory.create(&settings_for(base), "key")?;
        let request = ImageGenerationRequest::b64("a harbour at dusk", "z-image-turbo", "512x512");
        let response = provider.generate(&request)?;
        assert_eq!(response.first_payload()?, "aGk=");
        Ok(())
    }

    #[test]
    fn explicit_timeout_bounds_the_call() -> anyhow::Result<()> {
        let base = serve_once(Duration::from_secs(1), 200, ONE_IMAGE)?;
        let factory = HttpImageProviderFactory::with_timeout(Duration::from_millis(100));
        assert_eq!(factory.timeout(), Some(Duration::from_millis(100)));
        let provider = factory.create(&settings_for(base), "key")?;
        let request = ImageGenerationRequest::b64("a harbour at dusk", "z-image-turbo", "512x512");
        let err = provider
            .generate(&request)
            .err()
            .ok_or_else(|| anyhow::anyhow!("expected a timeout"))?;
        let timed_out = err
            .chain()
            .filter_map(|cause| cause.downcast_ref::<reqwest::Error>())
            .any(reqwest::Error::is_timeout);
        assert!(timed_out, "{}", error_chain_text(&err, 1000));
        Ok(())
    }

    #[test]
    fn first_payload_requires_data_in_first_entry() {
        let empty = ImageGenerationResponse::default();
        assert!(empty.first_payload().is_err());

        let url_only = ImageGenerationResponse {
            images: vec![
                GeneratedImage {
                    url: Some("https://cdn.example/1.png".to_string()),
                    ..GeneratedImage::default()
                },
                GeneratedImage {
                    b64_json: Some("aGk=".to_string()),
                    ..GeneratedImage::default()
                },
            ],
        };
        let err = url_only.first_payload().err().map(|err| err.to_string());
        assert_eq!(err.as_deref(), Some("No image data returned"));

        let ok = ImageGenerationResponse {
            images: vec![GeneratedImage {
                b64_json: Some("aGk=".to_string()),
                ..GeneratedImage::default()
            }],
        };
        assert_eq!(ok.first_payload().ok(), Some("aGk="));
    }

    #[test]
    fn factory_selects_adapter_by_model() -> anyhow::Result<()> {
        let factory = HttpImageProviderFactory::new();
        let mut settings = ImageGenerationSettings::default();
        assert_eq!(factory.create(&settings, "key")?.name(), "nanogpt");
        settings.model = "dryrun-flat".to_string();
        assert_eq!(factory.create(&settings, "key")?.name(), "dryrun");
        assert!(factory.create(&settings, "  ").is_err());
        Ok(())
    }
}

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use reqwest::blocking::Client as HttpClient;
use serde_json::Value;

use super::{GeneratedImage, ImageGenerationRequest, ImageGenerationResponse, ImageProvider};
use crate::http::{read_body, response_json_or_error, truncate_text};

/// OpenAI-images-compatible `/images/generations` endpoint (NanoGPT by default).
#[derive(Debug, Clone)]
pub struct NanoGptImageProvider {
    api_base: String,
    api_key: String,
    http: HttpClient,
}

impl NanoGptImageProvider {
    pub fn new(api_base: String, api_key: String, http: HttpClient) -> Self {
        Self {
            api_base,
            api_key,
            http,
        }
    }

    fn download_image(&self, url: &str) -> Result<String> {
        let response = self
            .http
            .get(url)
            .send()
            .with_context(|| format!("failed downloading provider image ({url})"))?;
        let status = response.status();
        let bytes = read_body(response, None).context("failed reading provider image bytes")?;
        if !status.is_success() {
            bail!(
                "provider image download failed ({}): {}",
                status.as_u16(),
                truncate_text(&String::from_utf8_lossy(&bytes), 512)
            );
        }
        Ok(BASE64.encode(bytes))
    }
}

impl ImageProvider for NanoGptImageProvider {
    fn name(&self) -> &str {
        "nanogpt"
    }

    fn generate(&self, request: &ImageGenerationRequest) -> Result<ImageGenerationResponse> {
        let endpoint = format!("{}/images/generations", self.api_base);
        let response = self
            .http
            .post(&endpoint)
            .bearer_auth(&self.api_key)
            .json(request)
            .send()
            .with_context(|| format!("NanoGPT request failed ({endpoint})"))?;
        let payload = response_json_or_error("NanoGPT", response, None)?;

        let mut images = parse_images(&payload)?;
        for image in &mut images {
            if image.b64_json.is_some() {
                continue;
            }
            if let Some(url) = image.url.clone() {
                image.b64_json = Some(self.download_image(&url)?);
            }
        }
        Ok(ImageGenerationResponse { images })
    }
}

fn parse_images(payload: &Value) -> Result<Vec<GeneratedImage>> {
    let rows = payload
        .get("data")
        .or_else(|| payload.get("images"))
        .cloned()
        .unwrap_or(Value::Array(Vec::new()));
    serde_json::from_value(rows).context("NanoGPT returned malformed image entries")
}

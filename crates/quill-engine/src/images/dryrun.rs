use std::io::Cursor;

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use image::{ImageFormat, Rgb, RgbImage};
use sha2::{Digest, Sha256};

use super::{GeneratedImage, ImageGenerationRequest, ImageGenerationResponse, ImageProvider};

/// Offline adapter: a solid PNG whose colour is derived from the prompt.
#[derive(Debug, Clone, Copy, Default)]
pub struct DryrunImageProvider;

impl ImageProvider for DryrunImageProvider {
    fn name(&self) -> &str {
        "dryrun"
    }

    fn generate(&self, request: &ImageGenerationRequest) -> Result<ImageGenerationResponse> {
        let (width, height) = parse_dims(&request.size);
        let (r, g, b) = color_from_prompt(&request.prompt);
        let mut image = RgbImage::new(width, height);
        for pixel in image.pixels_mut() {
            *pixel = Rgb([r, g, b]);
        }
        let mut png = Cursor::new(Vec::new());
        image
            .write_to(&mut png, ImageFormat::Png)
            .context("dryrun PNG encode failed")?;
        Ok(ImageGenerationResponse {
            images: vec![GeneratedImage {
                b64_json: Some(BASE64.encode(png.into_inner())),
                url: None,
                revised_prompt: Some(request.prompt.clone()),
            }],
        })
    }
}

fn parse_dims(size: &str) -> (u32, u32) {
    let mut parts = size.trim().split(['x', 'X']);
    let width = parts.next().and_then(|value| value.trim().parse::<u32>().ok());
    let height = parts.next().and_then(|value| value.trim().parse::<u32>().ok());
    match (width, height) {
        (Some(width), Some(height)) if width > 0 && height > 0 => {
            (width.min(2048), height.min(2048))
        }
        _ => (512, 512),
    }
}

fn color_from_prompt(prompt: &str) -> (u8, u8, u8) {
    let mut hasher = Sha256::new();
    hasher.update(prompt.as_bytes());
    let digest = hasher.finalize();
    (digest[0], digest[1], digest[2])
}

use std::sync::Arc;

use anyhow::Result;
use quill_contracts::settings::SettingsSource;

pub const DEFAULT_STYLE_ID: &str = "image-style-soft-anime";

pub const DEFAULT_STYLES: [(&str, &str); 3] = [
    (
        "image-style-soft-anime",
        "Soft cel-shaded anime illustration. Muted pastel color palette with low saturation. Diffused ambient lighting, subtle linework blending into colors. Smooth gradients, slight bloom effect on highlights. Dreamy, airy atmosphere. Studio Ghibli-inspired. Soft shadows, watercolor texture hints in background.",
    ),
    (
        "image-style-semi-realistic",
        "Semi-realistic anime art with refined, detailed rendering. Realistic proportions with anime influence. Detailed hair strands, subtle skin tones, fabric folds. Naturalistic lighting with clear direction and soft falloff. Cinematic composition with depth of field. Rich, slightly desaturated colors with intentional color grading. Painterly quality with polished edges. Atmospheric and grounded mood.",
    ),
    (
        "image-style-photorealistic",
        "Photorealistic digital art. True-to-life rendering with natural lighting. Detailed textures, accurate proportions. Professional photography aesthetic. Cinematic depth of field. High dynamic range. Realistic materials and surfaces.",
    ),
];

/// Looks up user-customized style text.
pub trait StyleSource: Send + Sync {
    fn style_prompt(&self, style_id: &str) -> Result<Option<String>>;
}

/// Style overrides from the live settings' `style_templates`.
#[derive(Clone)]
pub struct SettingsStyleSource {
    settings: Arc<dyn SettingsSource>,
}

impl SettingsStyleSource {
    pub fn new(settings: Arc<dyn SettingsSource>) -> Self {
        Self { settings }
    }
}

impl StyleSource for SettingsStyleSource {
    fn style_prompt(&self, style_id: &str) -> Result<Option<String>> {
        Ok(self.settings.load()?.style_templates.get(style_id).cloned())
    }
}

pub fn default_style_prompt(style_id: &str) -> &'static str {
    let fallback = DEFAULT_STYLES[0].1;
    DEFAULT_STYLES
        .iter()
        .find(|(id, _)| *id == style_id)
        .map(|(_, text)| *text)
        .unwrap_or(fallback)
}

/// Customized text when present, else the built-in style (soft anime for unknown ids).
pub fn resolve_style_prompt(source: &dyn StyleSource, style_id: &str) -> String {
    match source.style_prompt(style_id) {
        Ok(Some(text)) if !text.trim().is_empty() => text,
        Ok(_) => default_style_prompt(style_id).to_string(),
        Err(err) => {
            log::debug!("style lookup for {style_id} failed, using default: {err:#}");
            default_style_prompt(style_id).to_string()
        }
    }
}

mod source;

use std::fmt;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::providers::ProviderKind;

pub use source::{SettingsFile, SettingsSource, SharedSettings};

pub const DEFAULT_IMAGE_PROMPT_PRESET: &str = "image-prompt";
pub const DEFAULT_TRANSLATION_PRESET: &str = "translation";

/// Qualitative thinking budget requested from a provider.
///
/// Unknown labels are kept verbatim so providers that forward labels can pass
/// them through and budget-based providers can apply their default.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ReasoningEffort {
    #[default]
    Off,
    Low,
    Medium,
    High,
    Other(String),
}

impl ReasoningEffort {
    pub fn is_off(&self) -> bool {
        matches!(self, Self::Off)
    }

    pub fn label(&self) -> &str {
        match self {
            Self::Off => "off",
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Other(raw) => raw.as_str(),
        }
    }
}

impl From<String> for ReasoningEffort {
    fn from(raw: String) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "" | "off" => Self::Off,
            "low" => Self::Low,
            "medium" => Self::Medium,
            "high" => Self::High,
            _ => Self::Other(raw.trim().to_string()),
        }
    }
}

impl From<&str> for ReasoningEffort {
    fn from(raw: &str) -> Self {
        Self::from(raw.to_string())
    }
}

impl From<ReasoningEffort> for String {
    fn from(effort: ReasoningEffort) -> Self {
        effort.label().to_string()
    }
}

impl fmt::Display for ReasoningEffort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationPreset {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub profile_id: Option<String>,
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default)]
    pub reasoning_effort: ReasoningEffort,
    #[serde(default)]
    pub provider_only: Vec<String>,
    #[serde(default)]
    pub manual_body: String,
}

impl GenerationPreset {
    pub fn new(id: impl Into<String>, model: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            description: String::new(),
            profile_id: None,
            model: model.into(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            reasoning_effort: ReasoningEffort::Off,
            provider_only: Vec::new(),
            manual_body: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiProfile {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub provider_type: ProviderKind,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
}

impl ApiProfile {
    /// Profile key first, then the provider's conventional environment variable.
    pub fn credential(&self) -> Option<String> {
        self.api_key
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string)
            .or_else(|| non_empty_env(self.provider_type.credential_env()))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiSettings {
    #[serde(default)]
    pub profiles: Vec<ApiProfile>,
    #[serde(default)]
    pub main_narrative_profile_id: Option<String>,
    #[serde(default)]
    pub default_model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default = "default_narrative_max_tokens")]
    pub max_tokens: u32,
    #[serde(default)]
    pub reasoning_effort: ReasoningEffort,
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self {
            profiles: Vec::new(),
            main_narrative_profile_id: None,
            default_model: String::new(),
            temperature: default_temperature(),
            max_tokens: default_narrative_max_tokens(),
            reasoning_effort: ReasoningEffort::Off,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageGenerationSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_image_model")]
    pub model: String,
    #[serde(default = "default_style_id")]
    pub style_id: String,
    #[serde(default = "default_image_size")]
    pub size: String,
    #[serde(default = "default_max_images")]
    pub max_images_per_message: u32,
    #[serde(default = "default_prompt_preset")]
    pub prompt_preset: String,
    #[serde(default)]
    pub api_base: Option<String>,
}

impl Default for ImageGenerationSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            api_key: None,
            model: default_image_model(),
            style_id: default_style_id(),
            size: default_image_size(),
            max_images_per_message: default_max_images(),
            prompt_preset: default_prompt_preset(),
            api_base: None,
        }
    }
}

impl ImageGenerationSettings {
    pub fn credential(&self) -> Option<String> {
        self.api_key
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string)
            .or_else(|| non_empty_env("NANOGPT_API_KEY"))
    }

    /// Enabled and holding an image credential.
    pub fn is_ready(&self) -> bool {
        self.enabled && self.credential().is_some()
    }

    /// Pixel dimensions from a `WxH` size string; unparsable sizes fall back to 512x512.
    pub fn dimensions(&self) -> (u32, u32) {
        let mut parts = self.size.trim().split(['x', 'X']);
        let width = parts.next().and_then(|value| value.trim().parse::<u32>().ok());
        let height = parts.next().and_then(|value| value.trim().parse::<u32>().ok());
        match (width, height, parts.next()) {
            (Some(width), Some(height), None) if width > 0 && height > 0 => (width, height),
            _ => (512, 512),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranslationSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_target_language")]
    pub target_language: String,
    #[serde(default = "default_source_language")]
    pub source_language: String,
    #[serde(default = "default_true")]
    pub translate_user_input: bool,
    #[serde(default = "default_true")]
    pub translate_narration: bool,
    #[serde(default)]
    pub translate_world_state: bool,
    #[serde(default = "default_translation_preset")]
    pub preset: String,
}

impl Default for TranslationSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            target_language: default_target_language(),
            source_language: default_source_language(),
            translate_user_input: true,
            translate_narration: true,
            translate_world_state: false,
            preset: default_translation_preset(),
        }
    }
}

impl TranslationSettings {
    pub fn should_translate(&self) -> bool {
        self.enabled && self.target_language != "en"
    }

    pub fn should_translate_input(&self) -> bool {
        self.enabled && self.translate_user_input
    }

    pub fn should_translate_narration(&self) -> bool {
        self.enabled && self.translate_narration && self.target_language != "en"
    }

    pub fn should_translate_world_state(&self) -> bool {
        self.enabled && self.translate_world_state && self.target_language != "en"
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub api: ApiSettings,
    #[serde(default)]
    pub presets: IndexMap<String, GenerationPreset>,
    #[serde(default)]
    pub image_generation: ImageGenerationSettings,
    #[serde(default)]
    pub translation: TranslationSettings,
    #[serde(default)]
    pub style_templates: IndexMap<String, String>,
}

impl Settings {
    /// Preset by id; the map key doubles as the preset id when the body omits it.
    pub fn preset(&self, id: &str) -> Option<GenerationPreset> {
        self.presets.get(id).map(|preset| {
            let mut preset = preset.clone();
            if preset.id.is_empty() {
                preset.id = id.to_string();
            }
            preset
        })
    }

    pub fn profile(&self, id: &str) -> Option<&ApiProfile> {
        self.api.profiles.iter().find(|profile| profile.id == id)
    }

    pub fn main_narrative_profile(&self) -> Option<&ApiProfile> {
        let id = self.api.main_narrative_profile_id.as_deref()?;
        self.profile(id)
    }
}

pub fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn default_temperature() -> f64 {
    0.7
}

fn default_max_tokens() -> u32 {
    1024
}

fn default_narrative_max_tokens() -> u32 {
    4096
}

fn default_image_model() -> String {
    "z-image-turbo".to_string()
}

fn default_style_id() -> String {
    "image-style-soft-anime".to_string()
}

fn default_image_size() -> String {
    "1024x1024".to_string()
}

fn default_max_images() -> u32 {
    3
}

fn default_prompt_preset() -> String {
    DEFAULT_IMAGE_PROMPT_PRESET.to_string()
}

fn default_translation_preset() -> String {
    DEFAULT_TRANSLATION_PRESET.to_string()
}

fn default_target_language() -> String {
    "en".to_string()
}

fn default_source_language() -> String {
    "auto".to_string()
}

fn default_true() -> bool {
    true
}

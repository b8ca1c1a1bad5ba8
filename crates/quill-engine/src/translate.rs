use serde::{Deserialize, Serialize};

use crate::cancel::CancelToken;
use crate::error::GenerationResult;
use crate::generate::{extract_json_from_text, GenerateRequest, Generator};

const SUPPORTED_LANGUAGES: [(&str, &str); 40] = [
    ("en", "English"),
    ("es", "Spanish"),
    ("fr", "French"),
    ("de", "German"),
    ("it", "Italian"),
    ("pt", "Portuguese"),
    ("ja", "Japanese"),
    ("ko", "Korean"),
    ("zh", "Chinese"),
    ("ru", "Russian"),
    ("ar", "Arabic"),
    ("hi", "Hindi"),
    ("nl", "Dutch"),
    ("pl", "Polish"),
    ("tr", "Turkish"),
    ("vi", "Vietnamese"),
    ("th", "Thai"),
    ("id", "Indonesian"),
    ("sv", "Swedish"),
    ("da", "Danish"),
    ("no", "Norwegian"),
    ("fi", "Finnish"),
    ("cs", "Czech"),
    ("el", "Greek"),
    ("he", "Hebrew"),
    ("uk", "Ukrainian"),
    ("ro", "Romanian"),
    ("hu", "Hungarian"),
    ("bg", "Bulgarian"),
    ("hr", "Croatian"),
    ("sk", "Slovak"),
    ("sl", "Slovenian"),
    ("et", "Estonian"),
    ("lv", "Latvian"),
    ("lt", "Lithuanian"),
    ("ms", "Malay"),
    ("fil", "Filipino"),
    ("bn", "Bangla"),
    ("ta", "Tamil"),
    ("te", "Telugu"),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Language {
    pub code: &'static str,
    pub name: &'static str,
}

/// Supported languages sorted by display name.
pub fn supported_languages() -> Vec<Language> {
    let mut languages = SUPPORTED_LANGUAGES
        .iter()
        .map(|(code, name)| Language { code, name })
        .collect::<Vec<Language>>();
    languages.sort_by(|a, b| a.name.cmp(b.name));
    languages
}

/// Display name for a language code; unknown codes are returned as-is.
pub fn language_display_name(code: &str) -> String {
    if code == "auto" {
        return "Auto-detect".to_string();
    }
    SUPPORTED_LANGUAGES
        .iter()
        .find(|(known, _)| *known == code)
        .map(|(_, name)| name.to_string())
        .unwrap_or_else(|| code.to_string())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UiItemKind {
    Name,
    Description,
    Title,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UiTranslationItem {
    pub id: String,
    pub text: String,
    #[serde(rename = "type")]
    pub kind: UiItemKind,
}

/// Translation through a preset of the generation façade.
#[derive(Clone)]
pub struct TranslationService {
    generator: Generator,
    preset_id: String,
}

impl TranslationService {
    pub fn new(generator: Generator, preset_id: impl Into<String>) -> Self {
        Self {
            generator,
            preset_id: preset_id.into(),
        }
    }

    /// Story text into `target_language`; English targets are returned untouched.
    pub fn translate_narration(
        &self,
        content: &str,
        target_language: &str,
        cancel: Option<CancelToken>,
    ) -> GenerationResult<String> {
        if target_language == "en" {
            return Ok(content.to_string());
        }
        log::debug!(
            "translating narration ({} chars) to {target_language}",
            content.chars().count()
        );
        let system = format!(
            "Translate the story text you are given into {}. Keep paragraph breaks, names, \
             markup and tone. Reply with the translation only.",
            language_display_name(target_language)
        );
        self.translate(system, content, cancel)
    }

    /// Player input into English before it reaches the narrator.
    pub fn translate_input(
        &self,
        content: &str,
        source_language: &str,
        cancel: Option<CancelToken>,
    ) -> GenerationResult<String> {
        log::debug!(
            "translating input ({} chars) from {source_language}",
            content.chars().count()
        );
        let source = if source_language == "auto" {
            "the detected language".to_string()
        } else {
            language_display_name(source_language)
        };
        let system = format!(
            "Translate the player's message from {source} into English. Keep names and intent. \
             Reply with the translation only."
        );
        self.translate(system, content, cancel)
    }

    /// Batch translation of UI strings. Any failure returns `items` unchanged.
    pub fn translate_ui_elements(
        &self,
        items: &[UiTranslationItem],
        target_language: &str,
    ) -> Vec<UiTranslationItem> {
        if items.is_empty() || target_language == "en" {
            return items.to_vec();
        }
        let elements = match serde_json::to_string_pretty(items) {
            Ok(elements) => elements,
            Err(err) => {
                log::warn!("UI translation skipped: {err}");
                return items.to_vec();
            }
        };
        let system = format!(
            "Translate the `text` of every element into {}. Keep each `id` and `type`. \
             Reply with the JSON array only.",
            language_display_name(target_language)
        );
        let request = GenerateRequest::new(&self.preset_id, system, elements);
        let reply = match self.generator.generate_plain_text(&request) {
            Ok(reply) => reply,
            Err(err) => {
                log::warn!("UI translation failed: {err}");
                return items.to_vec();
            }
        };
        let parsed = extract_json_from_text(&reply)
            .and_then(|json| serde_json::from_value::<Vec<UiTranslationItem>>(json).ok());
        match parsed {
            Some(translated) => {
                log::debug!(
                    "UI elements translated ({} in, {} out)",
                    items.len(),
                    translated.len()
                );
                translated
            }
            None => {
                log::warn!("failed to parse UI translation response");
                items.to_vec()
            }
        }
    }

    fn translate(
        &self,
        system: String,
        content: &str,
        cancel: Option<CancelToken>,
    ) -> GenerationResult<String> {
        let mut request = GenerateRequest::new(&self.preset_id, system, content);
        request.cancel = cancel;
        let translated = self.generator.generate_plain_text(&request)?;
        Ok(translated.trim().to_string())
    }
}

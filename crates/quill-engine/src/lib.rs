mod cancel;
mod error;
mod generate;
mod http;
pub mod images;
mod pipeline;
mod resolve;
mod scenes;
mod styles;
pub mod text;
mod translate;

#[cfg(test)]
mod testing;

pub use cancel::CancelToken;
pub use error::{ErrorClass, GenerationError, GenerationResult};
pub use generate::{
    extract_json_from_text, parse_structured, GenerateRequest, Generator, NarrativeRequest,
    StructuredOutput, StructuredStream, TextStream,
};
pub use http::error_chain_text;
pub use pipeline::{ImageGenerationContext, ImageGenerationService};
pub use resolve::{resolve_narrative, resolve_preset, ChatModel, ResolvedConfig, NARRATIVE_PRESET_ID};
pub use scenes::{
    select_scenes, CharacterDescriptor, ImagePromptContext, ImageableScene, SceneSelector,
};
pub use styles::{
    default_style_prompt, resolve_style_prompt, SettingsStyleSource, StyleSource,
    DEFAULT_STYLES, DEFAULT_STYLE_ID,
};
pub use text::{HttpProviderFactory, TextProvider, TextProviderFactory};
pub use translate::{
    language_display_name, supported_languages, Language, TranslationService, UiItemKind,
    UiTranslationItem,
};

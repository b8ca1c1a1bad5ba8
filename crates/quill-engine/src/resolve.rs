use std::sync::Arc;

use quill_contracts::providers::{build_provider_options, ProviderKind, ProviderOptions};
use quill_contracts::settings::{ApiProfile, GenerationPreset, Settings};
use serde_json::Value;

use crate::error::{GenerationError, GenerationResult};
use crate::text::{ChatRequest, TextProvider, TextProviderFactory};

/// Id of the preset synthesized for main narrative calls.
pub const NARRATIVE_PRESET_ID: &str = "_narrative";

/// A provider client bound to one model id.
#[derive(Clone)]
pub struct ChatModel {
    pub provider: Arc<dyn TextProvider>,
    pub model_id: String,
}

/// Everything one call needs. Built per call and never cached.
#[derive(Clone)]
pub struct ResolvedConfig {
    pub preset: GenerationPreset,
    pub profile: ApiProfile,
    pub kind: ProviderKind,
    pub model: ChatModel,
    pub provider_options: Option<ProviderOptions>,
}

impl ResolvedConfig {
    pub fn chat_request(
        &self,
        system: &str,
        prompt: &str,
        response_schema: Option<Value>,
    ) -> ChatRequest {
        ChatRequest {
            model: self.model.model_id.clone(),
            system: system.to_string(),
            prompt: prompt.to_string(),
            temperature: self.preset.temperature,
            max_tokens: self.preset.max_tokens,
            provider_options: self.provider_options.clone(),
            response_schema,
        }
    }
}

/// Preset id -> preset -> profile (explicit, else main narrative) -> client.
pub fn resolve_preset(
    settings: &Settings,
    providers: &dyn TextProviderFactory,
    preset_id: &str,
) -> GenerationResult<ResolvedConfig> {
    let preset = settings
        .preset(preset_id)
        .ok_or_else(|| GenerationError::PresetNotFound(preset_id.to_string()))?;
    let profile_id = preset
        .profile_id
        .as_deref()
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .or(settings.api.main_narrative_profile_id.as_deref())
        .ok_or(GenerationError::MainProfileMissing)?;
    let profile = settings
        .profile(profile_id)
        .cloned()
        .ok_or_else(|| GenerationError::ProfileNotFound(profile_id.to_string()))?;
    bind(preset, profile, providers)
}

/// Main narrative profile with the top-level model and sampling settings.
pub fn resolve_narrative(
    settings: &Settings,
    providers: &dyn TextProviderFactory,
) -> GenerationResult<ResolvedConfig> {
    let profile = settings
        .main_narrative_profile()
        .cloned()
        .ok_or(GenerationError::MainProfileMissing)?;
    let api = &settings.api;
    let preset = GenerationPreset {
        id: NARRATIVE_PRESET_ID.to_string(),
        name: "Narrative".to_string(),
        description: "Main narrative generation".to_string(),
        profile_id: Some(profile.id.clone()),
        model: api.default_model.clone(),
        temperature: api.temperature,
        max_tokens: api.max_tokens,
        reasoning_effort: api.reasoning_effort.clone(),
        provider_only: Vec::new(),
        manual_body: String::new(),
    };
    bind(preset, profile, providers)
}

fn bind(
    preset: GenerationPreset,
    profile: ApiProfile,
    providers: &dyn TextProviderFactory,
) -> GenerationResult<ResolvedConfig> {
    let kind = profile.provider_type;
    let provider = providers.create(&profile)?;
    let provider_options = build_provider_options(&preset, kind);
    Ok(ResolvedConfig {
        model: ChatModel {
            provider,
            model_id: preset.model.clone(),
        },
        preset,
        profile,
        kind,
        provider_options,
    })
}

#[cfg(test)]
mod tests {
    use quill_contracts::settings::ReasoningEffort;
    use serde_json::json;

    use super::*;
    use crate::testing::{profile, settings_with_profiles, FakeProviderFactory};

    #[test]
    fn preset_falls_back_to_main_profile() -> anyhow::Result<()> {
        let mut settings = settings_with_profiles();
        let mut preset = GenerationPreset::new("suggestions", "anthropic/claude-3.5-haiku");
        preset.reasoning_effort = ReasoningEffort::Medium;
        settings.presets.insert("suggestions".to_string(), preset);
        let factory = FakeProviderFactory::replying("ok");

        let config = resolve_preset(&settings, &factory, "suggestions")?;
        assert_eq!(config.profile.id, "main");
        assert_eq!(config.kind, ProviderKind::RoutingGateway);
        assert_eq!(config.model.model_id, "anthropic/claude-3.5-haiku");
        let options = config.provider_options.map(|options| options.to_value());
        assert_eq!(
            options,
            Some(json!({"openrouter": {"reasoning": {"effort": "medium"}}}))
        );
        assert_eq!(factory.created_profiles(), vec!["main"]);
        Ok(())
    }

    #[test]
    fn explicit_profile_wins() -> anyhow::Result<()> {
        let mut settings = settings_with_profiles();
        let mut preset = GenerationPreset::new("classifier", "claude-haiku");
        preset.profile_id = Some("claude".to_string());
        preset.reasoning_effort = ReasoningEffort::High;
        settings.presets.insert("classifier".to_string(), preset);

        let config = resolve_preset(&settings, &FakeProviderFactory::replying("ok"), "classifier")?;
        assert_eq!(config.kind, ProviderKind::Anthropic);
        let request = config.chat_request("sys", "prompt", None);
        assert_eq!(
            request.provider_options.map(|options| options.body),
            json!({"thinking": {"type": "enabled", "budget_tokens": 16000}})
                .as_object()
                .cloned()
        );
        Ok(())
    }

    #[test]
    fn missing_profile_is_named() {
        let mut settings = settings_with_profiles();
        let mut preset = GenerationPreset::new("memory", "m");
        preset.profile_id = Some("gone".to_string());
        settings.presets.insert("memory".to_string(), preset);

        let result = resolve_preset(&settings, &FakeProviderFactory::replying("ok"), "memory");
        match result {
            Err(GenerationError::ProfileNotFound(id)) => assert_eq!(id, "gone"),
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("expected a missing profile"),
        }
    }

    #[test]
    fn unknown_preset_and_missing_main_profile_are_configuration_errors() {
        let factory = FakeProviderFactory::replying("ok");
        let settings = settings_with_profiles();
        assert!(matches!(
            resolve_preset(&settings, &factory, "nope"),
            Err(GenerationError::PresetNotFound(_))
        ));

        let mut bare = Settings::default();
        bare.api.profiles.push(profile("orphan", ProviderKind::OpenAi));
        assert!(matches!(
            resolve_narrative(&bare, &factory),
            Err(GenerationError::MainProfileMissing)
        ));
        bare.presets
            .insert("p".to_string(), GenerationPreset::new("p", "gpt-4o"));
        assert!(matches!(
            resolve_preset(&bare, &factory, "p"),
            Err(GenerationError::MainProfileMissing)
        ));
        assert!(factory.created_profiles().is_empty());
    }

    #[test]
    fn narrative_uses_top_level_settings() -> anyhow::Result<()> {
        let mut settings = settings_with_profiles();
        settings.api.default_model = "deepseek/deepseek-chat".to_string();
        settings.api.temperature = 0.9;
        settings.api.max_tokens = 2048;

        let config = resolve_narrative(&settings, &FakeProviderFactory::replying("ok"))?;
        assert_eq!(config.preset.id, NARRATIVE_PRESET_ID);
        assert_eq!(config.preset.profile_id.as_deref(), Some("main"));
        assert_eq!(config.model.model_id, "deepseek/deepseek-chat");
        let request = config.chat_request("", "go", None);
        assert_eq!(request.temperature, 0.9);
        assert_eq!(request.max_tokens, 2048);
        assert!(request.provider_options.is_none());
        Ok(())
    }
}

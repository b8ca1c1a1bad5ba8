use serde_json::{json, Map, Value};

use super::ProviderKind;
use crate::settings::GenerationPreset;

/// Manual override keys that would change the request shape.
pub const RESERVED_BODY_KEYS: [&str; 5] = ["messages", "tools", "tool_choice", "stream", "model"];

/// Provider-specific request fields, merged verbatim into the request body.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderOptions {
    pub provider_key: &'static str,
    pub body: Map<String, Value>,
}

impl ProviderOptions {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.body.get(key)
    }

    /// Namespaced form, e.g. `{"anthropic": {"thinking": {...}}}`.
    pub fn to_value(&self) -> Value {
        let mut root = Map::new();
        root.insert(
            self.provider_key.to_string(),
            Value::Object(self.body.clone()),
        );
        Value::Object(root)
    }
}

pub fn build_provider_options(
    preset: &GenerationPreset,
    provider: ProviderKind,
) -> Option<ProviderOptions> {
    let dialect = provider.dialect();
    let mut body = Map::new();

    if !preset.reasoning_effort.is_off() {
        dialect.apply_reasoning(&preset.reasoning_effort, &mut body);
    }

    if dialect.supports_provider_routing() && !preset.provider_only.is_empty() {
        body.insert(
            "provider".to_string(),
            json!({ "only": preset.provider_only }),
        );
    }

    if let Some(manual) = parse_manual_body(&preset.manual_body, &preset.id) {
        for (key, value) in manual {
            if RESERVED_BODY_KEYS.contains(&key.as_str()) {
                continue;
            }
            body.insert(key, value);
        }
    }

    if body.is_empty() {
        return None;
    }
    Some(ProviderOptions {
        provider_key: dialect.options_key(),
        body,
    })
}

fn parse_manual_body(raw: &str, preset_id: &str) -> Option<Map<String, Value>> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    match serde_json::from_str::<Value>(trimmed) {
        Ok(Value::Object(map)) => Some(map),
        Ok(_) => {
            log::warn!("manual body for preset '{preset_id}' is not a JSON object, skipping");
            None
        }
        Err(err) => {
            log::warn!("invalid manual body JSON for preset '{preset_id}', skipping: {err}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::settings::ReasoningEffort;

    fn preset(effort: &str) -> GenerationPreset {
        let mut preset = GenerationPreset::new("suggestions", "some-model");
        preset.reasoning_effort = ReasoningEffort::from(effort);
        preset
    }

    #[test]
    fn reasoning_off_adds_nothing_for_any_provider() {
        for kind in ProviderKind::ALL {
            assert_eq!(build_provider_options(&preset("off"), kind), None);
        }
    }

    #[test]
    fn reasoning_is_spelled_per_provider() {
        let gateway = build_provider_options(&preset("high"), ProviderKind::RoutingGateway);
        assert_eq!(
            gateway.map(|options| options.to_value()),
            Some(json!({"openrouter": {"reasoning": {"effort": "high"}}}))
        );

        let openai = build_provider_options(&preset("low"), ProviderKind::OpenAi);
        assert_eq!(
            openai.map(|options| options.to_value()),
            Some(json!({"openai": {"reasoning_effort": "low"}}))
        );

        let anthropic = build_provider_options(&preset("medium"), ProviderKind::Anthropic);
        assert_eq!(
            anthropic.map(|options| options.to_value()),
            Some(json!({"anthropic": {"thinking": {"type": "enabled", "budget_tokens": 8000}}}))
        );

        assert_eq!(
            build_provider_options(&preset("high"), ProviderKind::Google),
            None
        );
    }

    #[test]
    fn unknown_effort_uses_medium_budget() {
        let options = build_provider_options(&preset("extreme"), ProviderKind::Anthropic);
        let budget = options
            .as_ref()
            .and_then(|options| options.get("thinking"))
            .and_then(|thinking| thinking.get("budget_tokens"))
            .and_then(Value::as_u64);
        assert_eq!(budget, Some(8000));
    }

    #[test]
    fn provider_routing_only_for_gateway() {
        let mut routed = preset("off");
        routed.provider_only = vec!["deepinfra".to_string(), "fireworks".to_string()];

        let gateway = build_provider_options(&routed, ProviderKind::RoutingGateway);
        assert_eq!(
            gateway.as_ref().and_then(|options| options.get("provider")),
            Some(&json!({"only": ["deepinfra", "fireworks"]}))
        );

        for kind in [ProviderKind::OpenAi, ProviderKind::Anthropic, ProviderKind::Google] {
            let options = build_provider_options(&routed, kind);
            assert!(options
                .as_ref()
                .and_then(|options| options.get("provider"))
                .is_none());
        }
    }

    #[test]
    fn manual_body_drops_reserved_keys() {
        let mut manual = preset("off");
        manual.manual_body = json!({
            "top_p": 0.9,
            "messages": [],
            "tools": [],
            "tool_choice": "auto",
            "stream": true,
            "model": "other",
            "min_p": 0.05
        })
        .to_string();

        for kind in ProviderKind::ALL {
            let body = build_provider_options(&manual, kind)
                .map(|options| options.body)
                .unwrap_or_default();
            for key in RESERVED_BODY_KEYS {
                assert!(!body.contains_key(key), "{key} leaked for {kind}");
            }
            assert_eq!(body.get("top_p"), Some(&json!(0.9)));
            assert_eq!(body.get("min_p"), Some(&json!(0.05)));
        }
    }

    #[test]
    fn malformed_manual_body_is_ignored() {
        let mut broken = preset("low");
        broken.manual_body = "{top_p: 0.9".to_string();
        let options = build_provider_options(&broken, ProviderKind::OpenAi);
        assert_eq!(
            options.map(|options| options.body),
            Some(
                json!({"reasoning_effort": "low"})
                    .as_object()
                    .cloned()
                    .unwrap_or_default()
            )
        );

        broken.manual_body = "[1, 2]".to_string();
        broken.reasoning_effort = ReasoningEffort::Off;
        assert_eq!(build_provider_options(&broken, ProviderKind::OpenAi), None);
    }

    #[test]
    fn manual_body_is_merged_after_reasoning() {
        let mut manual = preset("high");
        manual.manual_body = json!({"reasoning": {"effort": "low", "exclude": true}}).to_string();
        let options = build_provider_options(&manual, ProviderKind::RoutingGateway);
        assert_eq!(
            options.as_ref().and_then(|options| options.get("reasoning")),
            Some(&json!({"effort": "low", "exclude": true}))
        );
    }
}

mod options;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::settings::ReasoningEffort;

pub use options::{build_provider_options, ProviderOptions, RESERVED_BODY_KEYS};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    #[serde(rename = "openrouter")]
    RoutingGateway,
    OpenAi,
    Anthropic,
    Google,
}

impl ProviderKind {
    pub const ALL: [ProviderKind; 4] = [
        ProviderKind::RoutingGateway,
        ProviderKind::OpenAi,
        ProviderKind::Anthropic,
        ProviderKind::Google,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::RoutingGateway => "openrouter",
            Self::OpenAi => "openai",
            Self::Anthropic => "anthropic",
            Self::Google => "google",
        }
    }

    pub fn credential_env(self) -> &'static str {
        match self {
            Self::RoutingGateway => "OPENROUTER_API_KEY",
            Self::OpenAi => "OPENAI_API_KEY",
            Self::Anthropic => "ANTHROPIC_API_KEY",
            Self::Google => "GEMINI_API_KEY",
        }
    }

    pub fn default_api_base(self) -> &'static str {
        match self {
            Self::RoutingGateway => "https://openrouter.ai/api/v1",
            Self::OpenAi => "https://api.openai.com/v1",
            Self::Anthropic => "https://api.anthropic.com/v1",
            Self::Google => "https://generativelanguage.googleapis.com/v1beta",
        }
    }

    pub fn dialect(self) -> &'static dyn ProviderDialect {
        PROVIDER_DIALECTS
            .iter()
            .find(|(kind, _)| *kind == self)
            .map(|(_, dialect)| *dialect)
            .unwrap_or(&NoReasoning)
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let wanted = raw.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == wanted)
            .ok_or_else(|| format!("unknown provider kind '{}'", raw.trim()))
    }
}

/// How one provider wants request options spelled.
pub trait ProviderDialect: Sync {
    /// Options namespace for this provider.
    fn options_key(&self) -> &'static str;

    /// Only called when the effort is not `off`.
    fn apply_reasoning(&self, effort: &ReasoningEffort, options: &mut Map<String, Value>);

    fn supports_provider_routing(&self) -> bool {
        false
    }
}

struct EffortObject;
struct EffortField;
struct ThinkingBudget;
struct NoReasoning;

impl ProviderDialect for EffortObject {
    fn options_key(&self) -> &'static str {
        "openrouter"
    }

    fn apply_reasoning(&self, effort: &ReasoningEffort, options: &mut Map<String, Value>) {
        options.insert("reasoning".to_string(), json!({ "effort": effort.label() }));
    }

    fn supports_provider_routing(&self) -> bool {
        true
    }
}

impl ProviderDialect for EffortField {
    fn options_key(&self) -> &'static str {
        "openai"
    }

    fn apply_reasoning(&self, effort: &ReasoningEffort, options: &mut Map<String, Value>) {
        options.insert(
            "reasoning_effort".to_string(),
            Value::String(effort.label().to_string()),
        );
    }
}

impl ProviderDialect for ThinkingBudget {
    fn options_key(&self) -> &'static str {
        "anthropic"
    }

    fn apply_reasoning(&self, effort: &ReasoningEffort, options: &mut Map<String, Value>) {
        options.insert(
            "thinking".to_string(),
            json!({
                "type": "enabled",
                "budget_tokens": effort_to_budget(effort),
            }),
        );
    }
}

impl ProviderDialect for NoReasoning {
    fn options_key(&self) -> &'static str {
        "google"
    }

    fn apply_reasoning(&self, _effort: &ReasoningEffort, _options: &mut Map<String, Value>) {}
}

const PROVIDER_DIALECTS: &[(ProviderKind, &dyn ProviderDialect)] = &[
    (ProviderKind::RoutingGateway, &EffortObject),
    (ProviderKind::OpenAi, &EffortField),
    (ProviderKind::Anthropic, &ThinkingBudget),
    (ProviderKind::Google, &NoReasoning),
];

pub fn effort_to_budget(effort: &ReasoningEffort) -> u64 {
    match effort {
        ReasoningEffort::Off => 0,
        ReasoningEffort::Low => 4000,
        ReasoningEffort::Medium => 8000,
        ReasoningEffort::High => 16000,
        ReasoningEffort::Other(_) => 8000,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budget_table_matches_expected_values() {
        assert_eq!(effort_to_budget(&ReasoningEffort::Off), 0);
        assert_eq!(effort_to_budget(&ReasoningEffort::Low), 4000);
        assert_eq!(effort_to_budget(&ReasoningEffort::Medium), 8000);
        assert_eq!(effort_to_budget(&ReasoningEffort::High), 16000);
        assert_eq!(effort_to_budget(&ReasoningEffort::from("turbo")), 8000);
    }

    #[test]
    fn every_kind_has_a_dialect() {
        let keys = ProviderKind::ALL
            .iter()
            .map(|kind| kind.dialect().options_key())
            .collect::<Vec<&str>>();
        assert_eq!(keys, vec!["openrouter", "openai", "anthropic", "google"]);
    }

    #[test]
    fn provider_kind_round_trips_through_names() {
        for kind in ProviderKind::ALL {
            assert_eq!(kind.as_str().parse::<ProviderKind>(), Ok(kind));
        }
        assert!("nanogpt".parse::<ProviderKind>().is_err());
    }
}

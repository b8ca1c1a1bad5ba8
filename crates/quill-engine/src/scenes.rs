use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::GenerationResult;
use crate::generate::{GenerateRequest, Generator, StructuredOutput};

/// A passage worth illustrating, with the prompt to render it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageableScene {
    pub source_text: String,
    pub prompt: String,
    #[serde(default)]
    pub scene_type: String,
    #[serde(default)]
    pub priority: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CharacterDescriptor {
    pub name: String,
    #[serde(default)]
    pub visual_descriptors: Vec<String>,
}

impl CharacterDescriptor {
    pub fn is_visual(&self) -> bool {
        self.visual_descriptors
            .iter()
            .any(|descriptor| !descriptor.trim().is_empty())
    }
}

#[derive(Debug, Clone, Default)]
pub struct ImagePromptContext {
    pub narrative_response: String,
    pub user_action: String,
    /// Only characters carrying visual descriptors.
    pub present_characters: Vec<CharacterDescriptor>,
    pub current_location: Option<String>,
    pub style_prompt: String,
    /// 0 = unlimited.
    pub max_images: u32,
    pub chat_history: Option<String>,
    pub lorebook_context: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct SceneList {
    #[serde(default)]
    scenes: Vec<ImageableScene>,
}

impl StructuredOutput for SceneList {
    fn schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "scenes": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "source_text": {"type": "string"},
                            "prompt": {"type": "string"},
                            "scene_type": {"type": "string"},
                            "priority": {"type": "number"}
                        },
                        "required": ["source_text", "prompt", "scene_type", "priority"]
                    }
                }
            },
            "required": ["scenes"]
        })
    }
}

const SCENE_SYSTEM_PROMPT: &str = "You pick moments from interactive fiction that deserve an illustration. \
For each moment return the exact source_text excerpt it comes from, a self-contained image prompt, \
a short scene_type (character, action, location, item or atmosphere) and a priority from 1 to 10. \
Every prompt must begin with the art style text you are given and must describe named characters by their visual traits.";

/// Asks the configured image-prompt preset which scenes to illustrate.
#[derive(Clone)]
pub struct SceneSelector {
    generator: Generator,
}

impl SceneSelector {
    pub fn new(generator: Generator) -> Self {
        Self { generator }
    }

    /// Scenes in the order the model returned them; blank prompts are dropped.
    pub fn identify_scenes(
        &self,
        preset_id: &str,
        context: &ImagePromptContext,
    ) -> GenerationResult<Vec<ImageableScene>> {
        let request = GenerateRequest::new(preset_id, SCENE_SYSTEM_PROMPT, scene_prompt(context));
        let list: SceneList = self.generator.generate_structured(&request)?;
        Ok(list
            .scenes
            .into_iter()
            .filter(|scene| !scene.prompt.trim().is_empty())
            .collect())
    }
}

fn scene_prompt(context: &ImagePromptContext) -> String {
    let mut sections = vec![format!("Art style:\n{}", context.style_prompt.trim())];
    if context.max_images > 0 {
        sections.push(format!(
            "Return at most {} scenes, best first.",
            context.max_images
        ));
    }
    if !context.present_characters.is_empty() {
        let roster = context
            .present_characters
            .iter()
            .map(|character| {
                format!(
                    "- {}: {}",
                    character.name,
                    character.visual_descriptors.join(", ")
                )
            })
            .collect::<Vec<String>>()
            .join("\n");
        sections.push(format!("Characters present:\n{roster}"));
    }
    if let Some(location) = non_blank(context.current_location.as_deref()) {
        sections.push(format!("Current location: {location}"));
    }
    if let Some(lore) = non_blank(context.lorebook_context.as_deref()) {
        sections.push(format!("World notes:\n{lore}"));
    }
    if let Some(history) = non_blank(context.chat_history.as_deref()) {
        sections.push(format!("Story so far:\n{history}"));
    }
    if !context.user_action.trim().is_empty() {
        sections.push(format!("Player action:\n{}", context.user_action.trim()));
    }
    sections.push(format!(
        "Narrative to illustrate:\n{}",
        context.narrative_response.trim()
    ));
    sections.join("\n\n")
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|value| !value.is_empty())
}

/// Highest priority first (ties keep input order), truncated to `max` when nonzero.
pub fn select_scenes(mut scenes: Vec<ImageableScene>, max: u32) -> Vec<ImageableScene> {
    scenes.sort_by(|a, b| b.priority.total_cmp(&a.priority));
    if max > 0 {
        scenes.truncate(max as usize);
    }
    scenes
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use quill_contracts::settings::{GenerationPreset, SharedSettings};

    use super::*;
    use crate::testing::{settings_with_profiles, FakeProviderFactory};

    fn scene(name: &str, priority: f64) -> ImageableScene {
        ImageableScene {
            source_text: name.to_string(),
            prompt: format!("prompt for {name}"),
            scene_type: "action".to_string(),
            priority,
        }
    }

    fn names(scenes: &[ImageableScene]) -> Vec<&str> {
        scenes
            .iter()
            .map(|scene| scene.source_text.as_str())
            .collect()
    }

    #[test]
    fn selection_is_stable_by_priority() {
        let scenes = vec![
            scene("a", 3.0),
            scene("b", 9.0),
            scene("c", 3.0),
            scene("d", 9.0),
            scene("e", 1.0),
        ];
        assert_eq!(names(&select_scenes(scenes.clone(), 3)), vec!["b", "d", "a"]);
        assert_eq!(
            names(&select_scenes(scenes, 0)),
            vec!["b", "d", "a", "c", "e"]
        );
    }

    #[test]
    fn truncation_keeps_everything_when_under_limit() {
        let scenes = vec![scene("a", 1.0), scene("b", 2.0)];
        assert_eq!(names(&select_scenes(scenes, 5)), vec!["b", "a"]);
        assert!(select_scenes(Vec::new(), 2).is_empty());
    }

    #[test]
    fn identify_scenes_uses_the_prompt_preset() -> anyhow::Result<()> {
        let factory = Arc::new(FakeProviderFactory::replying(
            r#"{"scenes": [
                {"source_text": "The gate opens.", "prompt": "Soft cel-shaded... a vast gate", "scene_type": "location", "priority": 6},
                {"source_text": "Nothing", "prompt": "  ", "scene_type": "atmosphere", "priority": 2}
            ]}"#,
        ));
        let mut settings = settings_with_profiles();
        settings.presets.insert(
            "image-prompt".to_string(),
            GenerationPreset::new("image-prompt", "deepseek/deepseek-v3.2"),
        );
        let generator = Generator::new(Arc::new(SharedSettings::new(settings)), factory.clone());
        let context = ImagePromptContext {
            narrative_response: "The gate opens.".to_string(),
            user_action: "I push the gate.".to_string(),
            present_characters: vec![CharacterDescriptor {
                name: "Mira".to_string(),
                visual_descriptors: vec!["silver braid".to_string(), "green cloak".to_string()],
            }],
            current_location: Some("Old Keep".to_string()),
            style_prompt: "Soft cel-shaded anime illustration.".to_string(),
            max_images: 2,
            ..ImagePromptContext::default()
        };

        let scenes = SceneSelector::new(generator).identify_scenes("image-prompt", &context)?;
        assert_eq!(scenes.len(), 1);
        assert_eq!(scenes[0].scene_type, "location");
        assert_eq!(scenes[0].priority, 6.0);

        let sent = factory.requests();
        assert_eq!(sent[0].model, "deepseek/deepseek-v3.2");
        assert!(sent[0].prompt.contains("- Mira: silver braid, green cloak"));
        assert!(sent[0].prompt.contains("Return at most 2 scenes"));
        assert!(sent[0].prompt.contains("Current location: Old Keep"));
        assert!(sent[0].prompt.ends_with("Narrative to illustrate:\nThe gate opens."));
        Ok(())
    }

    #[test]
    fn visual_filter_ignores_blank_descriptors() {
        let blank = CharacterDescriptor {
            name: "Ghost".to_string(),
            visual_descriptors: vec![" ".to_string()],
        };
        assert!(!blank.is_visual());
        assert!(!CharacterDescriptor::default().is_visual());
    }
}

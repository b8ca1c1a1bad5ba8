use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;

use anyhow::{anyhow, Result};
use chrono::Utc;
use quill_contracts::events::{EventSink, ImageEvent};
use quill_contracts::records::{EmbeddedImage, ImageStatus, ImageStore, ImageUpdate};
use quill_contracts::settings::ImageGenerationSettings;
use uuid::Uuid;

use crate::error::GenerationResult;
use crate::generate::Generator;
use crate::http::error_chain_text;
use crate::images::{HttpImageProviderFactory, ImageGenerationRequest, ImageProviderFactory};
use crate::scenes::{
    select_scenes, CharacterDescriptor, ImagePromptContext, ImageableScene, SceneSelector,
};
use crate::styles::{resolve_style_prompt, SettingsStyleSource, StyleSource};

const ERROR_MESSAGE_MAX_CHARS: usize = 500;

/// The record reached a terminal state before this task picked it up.
#[derive(Debug, thiserror::Error)]
#[error("image {0} already settled")]
struct AlreadySettled(String);

/// One narrative turn to illustrate.
#[derive(Debug, Clone, Default)]
pub struct ImageGenerationContext {
    pub story_id: String,
    pub entry_id: String,
    pub narrative_response: String,
    pub user_action: String,
    pub present_characters: Vec<CharacterDescriptor>,
    pub current_location: Option<String>,
    pub chat_history: Option<String>,
    pub lorebook_context: Option<String>,
}

/// Turns narrative passages into image records, one background task per image.
///
/// Records go `pending -> generating -> complete | failed`. `image_queued` is
/// published once the pending record exists and `image_ready` once the task
/// reaches a terminal state. Task failures stay inside the task.
#[derive(Clone)]
pub struct ImageGenerationService {
    generator: Generator,
    selector: SceneSelector,
    styles: Arc<dyn StyleSource>,
    store: Arc<dyn ImageStore>,
    events: Arc<dyn EventSink>,
    images: Arc<dyn ImageProviderFactory>,
}

impl ImageGenerationService {
    pub fn new(
        generator: Generator,
        store: Arc<dyn ImageStore>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        let styles = Arc::new(SettingsStyleSource::new(generator.settings_source()));
        Self {
            selector: SceneSelector::new(generator.clone()),
            generator,
            styles,
            store,
            events,
            images: Arc::new(HttpImageProviderFactory::new()),
        }
    }

    pub fn with_styles(mut self, styles: Arc<dyn StyleSource>) -> Self {
        self.styles = styles;
        self
    }

    pub fn with_image_providers(mut self, images: Arc<dyn ImageProviderFactory>) -> Self {
        self.images = images;
        self
    }

    /// Best-effort illustration of one narrative turn.
    ///
    /// Returns the ids of the queued images as soon as their records exist;
    /// never fails and never waits for an image.
    pub fn generate_for_narrative(&self, context: &ImageGenerationContext) -> Vec<String> {
        let image_settings = match self.generator.settings() {
            Ok(settings) => settings.image_generation,
            Err(err) => {
                log::warn!("image generation skipped: {err}");
                return Vec::new();
            }
        };
        if !image_settings.enabled {
            log::debug!("image generation disabled");
            return Vec::new();
        }

        log::info!(
            "starting image generation for entry {} ({} chars, {} characters present)",
            context.entry_id,
            context.narrative_response.chars().count(),
            context.present_characters.len()
        );
        match self.queue_scenes(context, &image_settings) {
            Ok(queued) => queued,
            Err(err) => {
                log::warn!(
                    "image generation for entry {} failed: {err}",
                    context.entry_id
                );
                Vec::new()
            }
        }
    }

    fn queue_scenes(
        &self,
        context: &ImageGenerationContext,
        image_settings: &ImageGenerationSettings,
    ) -> GenerationResult<Vec<String>> {
        let prompt_context = ImagePromptContext {
            narrative_response: context.narrative_response.clone(),
            user_action: context.user_action.clone(),
            present_characters: context
                .present_characters
                .iter()
                .filter(|character| character.is_visual())
                .cloned()
                .collect(),
            current_location: context.current_location.clone(),
            style_prompt: resolve_style_prompt(self.styles.as_ref(), &image_settings.style_id),
            max_images: image_settings.max_images_per_message,
            chat_history: context.chat_history.clone(),
            lorebook_context: context.lorebook_context.clone(),
        };

        let scenes = self
            .selector
            .identify_scenes(&image_settings.prompt_preset, &prompt_context)?;
        log::debug!(
            "{} scenes identified for entry {}: {:?}",
            scenes.len(),
            context.entry_id,
            scenes
                .iter()
                .map(|scene| scene.scene_type.as_str())
                .collect::<Vec<&str>>()
        );
        if scenes.is_empty() {
            return Ok(Vec::new());
        }

        let total = scenes.len();
        let selected = select_scenes(scenes, image_settings.max_images_per_message);
        log::debug!(
            "processing {} of {total} scenes (max {})",
            selected.len(),
            image_settings.max_images_per_message
        );

        let mut queued = Vec::with_capacity(selected.len());
        for scene in &selected {
            match self.enqueue(&context.story_id, &context.entry_id, scene, image_settings) {
                Ok(image_id) => queued.push(image_id),
                Err(err) => log::warn!(
                    "failed to queue image for entry {}: {err:#}",
                    context.entry_id
                ),
            }
        }
        Ok(queued)
    }

    /// Creates the pending record, publishes `image_queued` and starts the
    /// background task without waiting for it.
    pub fn enqueue(
        &self,
        story_id: &str,
        entry_id: &str,
        scene: &ImageableScene,
        image_settings: &ImageGenerationSettings,
    ) -> Result<String> {
        let image_id = Uuid::new_v4().to_string();
        let (width, height) = image_settings.dimensions();
        self.store.create(EmbeddedImage {
            id: image_id.clone(),
            story_id: story_id.to_string(),
            entry_id: entry_id.to_string(),
            source_text: scene.source_text.clone(),
            prompt: scene.prompt.clone(),
            style_id: image_settings.style_id.clone(),
            model: image_settings.model.clone(),
            image_data: String::new(),
            width,
            height,
            status: ImageStatus::Pending,
            error_message: None,
            created_at: Utc::now().timestamp_millis(),
        })?;
        log::debug!("created pending image {image_id} for entry {entry_id}");
        self.events.publish(&ImageEvent::Queued {
            image_id: image_id.clone(),
            entry_id: entry_id.to_string(),
        });

        let service = self.clone();
        let task_id = image_id.clone();
        let task_entry = entry_id.to_string();
        let prompt = scene.prompt.clone();
        let task_settings = image_settings.clone();
        let spawned = thread::Builder::new()
            .name(format!("quill-image-{}", short_id(&image_id)))
            .spawn(move || {
                service.execute(&task_id, &prompt, &task_settings, &task_entry);
            });
        if let Err(err) = spawned {
            let err = anyhow!("image task spawn failed: {err}");
            self.fail(&image_id, &err);
            self.publish_ready(&image_id, entry_id, false);
        }
        Ok(image_id)
    }

    /// Runs one image to a terminal state and publishes `image_ready`.
    /// Returns whether the image completed. A record that is already terminal
    /// is left alone and nothing is published.
    pub fn execute(
        &self,
        image_id: &str,
        prompt: &str,
        image_settings: &ImageGenerationSettings,
        entry_id: &str,
    ) -> bool {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            self.render(image_id, prompt, image_settings)
        }));
        let result = outcome.unwrap_or_else(|payload| {
            Err(anyhow!(
                "image task panicked: {}",
                panic_message(payload.as_ref())
            ))
        });

        let success = match result {
            Ok(image_data) => match self
                .store
                .update(image_id, ImageUpdate::complete(image_data))
            {
                Ok(_) => {
                    log::info!("image {image_id} complete");
                    true
                }
                Err(err) => {
                    self.fail(image_id, &err);
                    false
                }
            },
            Err(err) if err.downcast_ref::<AlreadySettled>().is_some() => {
                log::debug!("{err}; skipping");
                return false;
            }
            Err(err) => {
                self.fail(image_id, &err);
                false
            }
        };
        self.publish_ready(image_id, entry_id, success);
        success
    }

    fn render(
        &self,
        image_id: &str,
        prompt: &str,
        image_settings: &ImageGenerationSettings,
    ) -> Result<String> {
        if let Err(err) = self.store.update(image_id, ImageUpdate::generating()) {
            let settled = self
                .store
                .get(image_id)
                .ok()
                .flatten()
                .is_some_and(|record| record.status.is_terminal());
            if settled {
                return Err(AlreadySettled(image_id.to_string()).into());
            }
            return Err(err);
        }
        log::debug!("image {image_id} generating with {}", image_settings.model);

        let api_key = image_settings
            .credential()
            .ok_or_else(|| anyhow!("No NanoGPT API key configured for image generation"))?;
        let provider = self.images.create(image_settings, &api_key)?;
        let response = provider.generate(&ImageGenerationRequest::b64(
            prompt,
            &image_settings.model,
            &image_settings.size,
        ))?;
        Ok(response.first_payload()?.to_string())
    }

    fn fail(&self, image_id: &str, err: &anyhow::Error) {
        let mut message = error_chain_text(err, ERROR_MESSAGE_MAX_CHARS);
        if message.trim().is_empty() {
            message = "Unknown error".to_string();
        }
        log::warn!("image {image_id} failed: {message}");
        if let Err(update_err) = self.store.update(image_id, ImageUpdate::failed(message)) {
            log::warn!("image {image_id} could not be marked failed: {update_err:#}");
        }
    }

    fn publish_ready(&self, image_id: &str, entry_id: &str, success: bool) {
        self.events.publish(&ImageEvent::Ready {
            image_id: image_id.to_string(),
            entry_id: entry_id.to_string(),
            success,
        });
    }
}

fn short_id(image_id: &str) -> &str {
    image_id.get(..8).unwrap_or(image_id)
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        return (*text).to_string();
    }
    if let Some(text) = payload.downcast_ref::<String>() {
        return text.clone();
    }
    "unknown panic".to_string()
}

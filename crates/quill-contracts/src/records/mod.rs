mod file_store;

use std::fmt;
use std::sync::Mutex;

use anyhow::{bail, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

pub use file_store::JsonFileImageStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageStatus {
    Pending,
    Generating,
    Complete,
    Failed,
}

impl ImageStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Generating => "generating",
            Self::Complete => "complete",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }

    /// `pending -> generating -> {complete | failed}`; a pending record may
    /// also fail directly when its task never starts.
    pub fn can_transition_to(self, next: ImageStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Generating)
                | (Self::Pending, Self::Failed)
                | (Self::Generating, Self::Complete)
                | (Self::Generating, Self::Failed)
        )
    }
}

impl fmt::Display for ImageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted image artifact attached to a story entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddedImage {
    pub id: String,
    pub story_id: String,
    pub entry_id: String,
    pub source_text: String,
    pub prompt: String,
    pub style_id: String,
    pub model: String,
    #[serde(default)]
    pub image_data: String,
    pub width: u32,
    pub height: u32,
    pub status: ImageStatus,
    #[serde(default)]
    pub error_message: Option<String>,
    pub created_at: i64,
}

impl EmbeddedImage {
    pub fn has_payload(&self) -> bool {
        !self.image_data.is_empty()
    }

    /// Applies `update`, rejecting anything that would break the lifecycle.
    pub fn apply(&mut self, update: ImageUpdate) -> Result<()> {
        if self.status.is_terminal() {
            bail!(
                "image {} is already {} and cannot be updated",
                self.id,
                self.status
            );
        }

        let mut next = self.clone();
        if let Some(status) = update.status {
            if !self.status.can_transition_to(status) {
                bail!(
                    "image {} cannot move from {} to {}",
                    self.id,
                    self.status,
                    status
                );
            }
            next.status = status;
        }
        if let Some(image_data) = update.image_data {
            next.image_data = image_data;
        }
        if let Some(message) = update.error_message {
            next.error_message = Some(message);
        }

        match next.status {
            ImageStatus::Complete => {
                if next.image_data.is_empty() {
                    bail!("image {} cannot complete without image data", self.id);
                }
                next.error_message = None;
            }
            ImageStatus::Failed => {
                let has_message = next
                    .error_message
                    .as_deref()
                    .map(|message| !message.trim().is_empty())
                    .unwrap_or(false);
                if !has_message {
                    bail!("image {} cannot fail without an error message", self.id);
                }
                next.image_data.clear();
            }
            ImageStatus::Pending | ImageStatus::Generating => {}
        }

        *self = next;
        Ok(())
    }
}

/// Partial record update; `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ImageUpdate {
    pub status: Option<ImageStatus>,
    pub image_data: Option<String>,
    pub error_message: Option<String>,
}

impl ImageUpdate {
    pub fn generating() -> Self {
        Self {
            status: Some(ImageStatus::Generating),
            ..Self::default()
        }
    }

    pub fn complete(image_data: impl Into<String>) -> Self {
        Self {
            status: Some(ImageStatus::Complete),
            image_data: Some(image_data.into()),
            error_message: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            status: Some(ImageStatus::Failed),
            image_data: None,
            error_message: Some(message.into()),
        }
    }
}

/// Record persistence addressed by image id.
pub trait ImageStore: Send + Sync {
    fn create(&self, record: EmbeddedImage) -> Result<()>;
    fn update(&self, id: &str, update: ImageUpdate) -> Result<EmbeddedImage>;
    fn get(&self, id: &str) -> Result<Option<EmbeddedImage>>;
    fn list_for_entry(&self, entry_id: &str) -> Result<Vec<EmbeddedImage>>;
}

fn check_new_record(record: &EmbeddedImage) -> Result<()> {
    if record.id.trim().is_empty() {
        bail!("image record id must not be empty");
    }
    if record.status != ImageStatus::Pending {
        bail!(
            "image {} must be created pending, got {}",
            record.id,
            record.status
        );
    }
    Ok(())
}

#[derive(Debug, Default)]
pub struct MemoryImageStore {
    records: Mutex<IndexMap<String, EmbeddedImage>>,
}

impl MemoryImageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn all(&self) -> Result<Vec<EmbeddedImage>> {
        let records = self
            .records
            .lock()
            .map_err(|_| anyhow::anyhow!("image store lock poisoned"))?;
        Ok(records.values().cloned().collect())
    }
}

impl ImageStore for MemoryImageStore {
    fn create(&self, record: EmbeddedImage) -> Result<()> {
        check_new_record(&record)?;
        let mut records = self
            .records
            .lock()
            .map_err(|_| anyhow::anyhow!("image store lock poisoned"))?;
        if records.contains_key(&record.id) {
            bail!("image {} already exists", record.id);
        }
        records.insert(record.id.clone(), record);
        Ok(())
    }

    fn update(&self, id: &str, update: ImageUpdate) -> Result<EmbeddedImage> {
        let mut records = self
            .records
            .lock()
            .map_err(|_| anyhow::anyhow!("image store lock poisoned"))?;
        let Some(record) = records.get_mut(id) else {
            bail!("image {id} not found");
        };
        record.apply(update)?;
        Ok(record.clone())
    }

    fn get(&self, id: &str) -> Result<Option<EmbeddedImage>> {
        let records = self
            .records
            .lock()
            .map_err(|_| anyhow::anyhow!("image store lock poisoned"))?;
        Ok(records.get(id).cloned())
    }

    fn list_for_entry(&self, entry_id: &str) -> Result<Vec<EmbeddedImage>> {
        let records = self
            .records
            .lock()
            .map_err(|_| anyhow::anyhow!("image store lock poisoned"))?;
        Ok(records
            .values()
            .filter(|record| record.entry_id == entry_id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
pub(crate) fn pending_record_for_test(id: &str, entry_id: &str) -> EmbeddedImage {
    EmbeddedImage {
        id: id.to_string(),
        story_id: "story-1".to_string(),
        entry_id: entry_id.to_string(),
        source_text: "The dragon landed on the tower.".to_string(),
        prompt: "a dragon perched on a stone tower at dusk".to_string(),
        style_id: "image-style-soft-anime".to_string(),
        model: "z-image-turbo".to_string(),
        image_data: String::new(),
        width: 1024,
        height: 1024,
        status: ImageStatus::Pending,
        error_message: None,
        created_at: 1,
    }
}

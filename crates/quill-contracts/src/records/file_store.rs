use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};

use anyhow::{bail, Context, Result};
use serde_json::{Map, Value};

use super::{check_new_record, EmbeddedImage, ImageStore, ImageUpdate};

/// Image records kept in one JSON object keyed by image id.
///
/// Every operation re-reads the file and writes back only the record it
/// touched. Stores on the same path within one process share a lock, and the
/// file is replaced by rename so readers never see half a write. Separate
/// processes writing one file are not coordinated.
#[derive(Debug)]
pub struct JsonFileImageStore {
    path: PathBuf,
    lock: Arc<Mutex<()>>,
}

impl JsonFileImageStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let lock = path_lock(&path);
        Self { path, lock }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_record(&self, record: &EmbeddedImage) -> Result<()> {
        let mut on_disk = read_json_object(&self.path)?;
        on_disk.insert(record.id.clone(), serde_json::to_value(record)?);
        write_json_object(&self.path, &on_disk)
    }

    fn read_record(&self, id: &str) -> Result<Option<EmbeddedImage>> {
        let on_disk = read_json_object(&self.path)?;
        let Some(value) = on_disk.get(id) else {
            return Ok(None);
        };
        let record = serde_json::from_value(value.clone())
            .with_context(|| format!("corrupt image record {id} in {}", self.path.display()))?;
        Ok(Some(record))
    }
}

impl ImageStore for JsonFileImageStore {
    fn create(&self, record: EmbeddedImage) -> Result<()> {
        check_new_record(&record)?;
        let _guard = self
            .lock
            .lock()
            .map_err(|_| anyhow::anyhow!("image store lock poisoned"))?;
        if self.read_record(&record.id)?.is_some() {
            bail!("image {} already exists", record.id);
        }
        self.write_record(&record)
    }

    fn update(&self, id: &str, update: ImageUpdate) -> Result<EmbeddedImage> {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| anyhow::anyhow!("image store lock poisoned"))?;
        let Some(mut record) = self.read_record(id)? else {
            bail!("image {id} not found");
        };
        record.apply(update)?;
        self.write_record(&record)?;
        Ok(record)
    }

    fn get(&self, id: &str) -> Result<Option<EmbeddedImage>> {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| anyhow::anyhow!("image store lock poisoned"))?;
        self.read_record(id)
    }

    fn list_for_entry(&self, entry_id: &str) -> Result<Vec<EmbeddedImage>> {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| anyhow::anyhow!("image store lock poisoned"))?;
        let mut records = Vec::new();
        for (id, value) in read_json_object(&self.path)? {
            let record: EmbeddedImage = serde_json::from_value(value)
                .with_context(|| format!("corrupt image record {id} in {}", self.path.display()))?;
            if record.entry_id == entry_id {
                records.push(record);
            }
        }
        records.sort_by_key(|record| record.created_at);
        Ok(records)
    }
}

fn path_lock(path: &Path) -> Arc<Mutex<()>> {
    static LOCKS: OnceLock<Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>> = OnceLock::new();
    let key = std::env::current_dir()
        .map(|cwd| cwd.join(path))
        .unwrap_or_else(|_| path.to_path_buf());
    let mut locks = match LOCKS.get_or_init(Default::default).lock() {
        Ok(locks) => locks,
        Err(poisoned) => poisoned.into_inner(),
    };
    locks.entry(key).or_default().clone()
}

fn read_json_object(path: &Path) -> Result<Map<String, Value>> {
    if !path.exists() {
        return Ok(Map::new());
    }
    let raw =
        std::fs::read_to_string(path).with_context(|| format!("failed reading {}", path.display()))?;
    if raw.trim().is_empty() {
        return Ok(Map::new());
    }
    let parsed: Value = serde_json::from_str(&raw)
        .with_context(|| format!("invalid image store JSON in {}", path.display()))?;
    match parsed {
        Value::Object(map) => Ok(map),
        _ => bail!("image store {} is not a JSON object", path.display()),
    }
}

fn write_json_object(path: &Path, payload: &Map<String, Value>) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut staging = path.as_os_str().to_owned();
    staging.push(format!(".{}.tmp", std::process::id()));
    let staging = PathBuf::from(staging);
    std::fs::write(
        &staging,
        serde_json::to_string_pretty(&Value::Object(payload.clone()))?,
    )
    .with_context(|| format!("failed to write {}", staging.display()))?;
    std::fs::rename(&staging, path)
        .with_context(|| format!("failed to replace {}", path.display()))?;
    Ok(())
}

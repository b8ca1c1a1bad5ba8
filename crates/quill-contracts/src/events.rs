use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};

use anyhow::{anyhow, Context};
use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};

pub type EventPayload = Map<String, Value>;

/// Image lifecycle notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageEvent {
    Queued {
        image_id: String,
        entry_id: String,
    },
    Ready {
        image_id: String,
        entry_id: String,
        success: bool,
    },
}

impl ImageEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Queued { .. } => "image_queued",
            Self::Ready { .. } => "image_ready",
        }
    }

    pub fn image_id(&self) -> &str {
        match self {
            Self::Queued { image_id, .. } | Self::Ready { image_id, .. } => image_id,
        }
    }

    pub fn entry_id(&self) -> &str {
        match self {
            Self::Queued { entry_id, .. } | Self::Ready { entry_id, .. } => entry_id,
        }
    }

    pub fn payload(&self) -> EventPayload {
        let mut payload = EventPayload::new();
        payload.insert(
            "image_id".to_string(),
            Value::String(self.image_id().to_string()),
        );
        payload.insert(
            "entry_id".to_string(),
            Value::String(self.entry_id().to_string()),
        );
        if let Self::Ready { success, .. } = self {
            payload.insert("success".to_string(), Value::Bool(*success));
        }
        payload
    }
}

/// Fire-and-forget event delivery. Sinks swallow their own failures.
pub trait EventSink: Send + Sync {
    fn publish(&self, event: &ImageEvent);
}

/// Append-only `events.jsonl` log shared by every clone.
///
/// Each line carries `type`, `session_id` and `ts`; payload keys win on
/// conflict. The file is opened on first use and kept open.
#[derive(Debug, Clone)]
pub struct EventWriter {
    session_id: Arc<str>,
    log: Arc<Mutex<EventLog>>,
}

#[derive(Debug)]
struct EventLog {
    path: PathBuf,
    file: Option<File>,
}

impl EventLog {
    fn append(&mut self, line: &[u8]) -> anyhow::Result<()> {
        let file = match &mut self.file {
            Some(file) => file,
            slot => {
                if let Some(parent) = self.path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                let opened = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&self.path)
                    .with_context(|| format!("failed opening {}", self.path.display()))?;
                slot.insert(opened)
            }
        };
        file.write_all(line)?;
        Ok(())
    }
}

impl EventWriter {
    pub fn new(path: impl Into<PathBuf>, session_id: impl Into<String>) -> Self {
        Self {
            session_id: Arc::from(session_id.into()),
            log: Arc::new(Mutex::new(EventLog {
                path: path.into(),
                file: None,
            })),
        }
    }

    pub fn path(&self) -> PathBuf {
        self.log
            .lock()
            .map(|log| log.path.clone())
            .unwrap_or_default()
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Appends one line and returns the object written.
    pub fn emit(&self, event_type: &str, payload: EventPayload) -> anyhow::Result<Value> {
        let mut event = Map::from_iter([
            ("type".to_string(), Value::from(event_type)),
            ("session_id".to_string(), Value::from(&*self.session_id)),
            ("ts".to_string(), Value::from(now_utc_iso())),
        ]);
        event.extend(payload);
        let event = Value::Object(event);

        let mut line = serde_json::to_vec(&event)?;
        line.push(b'\n');
        self.log
            .lock()
            .map_err(|_| anyhow!("event log lock poisoned"))?
            .append(&line)?;
        Ok(event)
    }
}

impl EventSink for EventWriter {
    fn publish(&self, event: &ImageEvent) {
        if let Err(err) = self.emit(event.event_type(), event.payload()) {
            log::warn!(
                "failed to write {} event for image {}: {err:#}",
                event.event_type(),
                event.image_id()
            );
        }
    }
}

type Subscriber = Box<dyn Fn(&ImageEvent) + Send + Sync>;

/// In-process callback registry.
#[derive(Default)]
pub struct EventBus {
    subscribers: RwLock<Vec<Subscriber>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, callback: impl Fn(&ImageEvent) + Send + Sync + 'static) {
        match self.subscribers.write() {
            Ok(mut subscribers) => subscribers.push(Box::new(callback)),
            Err(_) => log::warn!("event bus lock poisoned; subscriber dropped"),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .read()
            .map(|subscribers| subscribers.len())
            .unwrap_or(0)
    }
}

impl EventSink for EventBus {
    fn publish(&self, event: &ImageEvent) {
        let Ok(subscribers) = self.subscribers.read() else {
            log::warn!("event bus lock poisoned; {} dropped", event.event_type());
            return;
        };
        for subscriber in subscribers.iter() {
            subscriber(event);
        }
    }
}

/// Broadcasts every event to each inner sink in order.
#[derive(Default, Clone)]
pub struct Fanout {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl Fanout {
    pub fn new(sinks: Vec<Arc<dyn EventSink>>) -> Self {
        Self { sinks }
    }
}

impl EventSink for Fanout {
    fn publish(&self, event: &ImageEvent) {
        for sink in &self.sinks {
            sink.publish(event);
        }
    }
}

fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}

use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::Path;
use std::sync::{PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tracing::info;
use ulid::Ulid;

use crate::model::{Actor, Ms, Role};

/// One compliance record: who did what to which target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelineEvent {
    pub id: Ulid,
    pub actor_id: Ulid,
    pub actor_role: Role,
    pub target_id: Option<String>,
    pub target_type: String,
    pub event_type: String,
    pub description: String,
    pub metadata: Map<String, Value>,
    pub timestamp: Ms,
}

impl TimelineEvent {
    pub fn new(
        actor: &Actor,
        target_id: impl Into<String>,
        target_type: &str,
        event_type: &str,
        description: impl Into<String>,
    ) -> Self {
        Self {
            id: Ulid::new(),
            actor_id: actor.id,
            actor_role: actor.role,
            target_id: Some(target_id.into()),
            target_type: target_type.to_string(),
            event_type: event_type.to_string(),
            description: description.into(),
            metadata: Map::new(),
            timestamp: crate::engine::now_ms(),
        }
    }

    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }
}

/// Fire-and-forget sink for lifecycle events. Must not block or fail the caller.
pub trait AuditSink: Send + Sync {
    fn log_event(&self, event: TimelineEvent);
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TimelineFilter {
    pub target_id: Option<String>,
    pub event_type: Option<String>,
    pub limit: usize,
}

/// In-process timeline. Optionally mirrored to a JSON-lines file by a background writer.
pub struct Timeline {
    events: RwLock<Vec<TimelineEvent>>,
    writer: Option<mpsc::UnboundedSender<TimelineEvent>>,
}

impl Default for Timeline {
    fn default() -> Self {
        Self::in_memory()
    }
}

impl Timeline {
    pub fn in_memory() -> Self {
        Self {
            events: RwLock::new(Vec::new()),
            writer: None,
        }
    }

    /// Load existing events from `path` and append new ones to it.
    /// Must be called inside a tokio runtime (spawns the writer task).
    pub fn open(path: &Path) -> io::Result<Self> {
        let events = Self::replay(path)?;
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(timeline_writer_loop(BufWriter::new(file), rx));
        Ok(Self {
            events: RwLock::new(events),
            writer: Some(tx),
        })
    }

    /// Read a JSON-lines timeline. A torn last line is discarded.
    fn replay(path: &Path) -> io::Result<Vec<TimelineEvent>> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut events = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<TimelineEvent>(&line) {
                Ok(event) => events.push(event),
                Err(_) => break,
            }
        }
        Ok(events)
    }

    /// Newest first.
    pub fn query(&self, filter: &TimelineFilter) -> Vec<TimelineEvent> {
        let events = self.events.read().unwrap_or_else(PoisonError::into_inner);
        events
            .iter()
            .rev()
            .filter(|e| {
                filter
                    .target_id
                    .as_ref()
                    .is_none_or(|t| e.target_id.as_ref() == Some(t))
            })
            .filter(|e| filter.event_type.as_ref().is_none_or(|t| &e.event_type == t))
            .take(filter.limit)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.events.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl AuditSink for Timeline {
    fn log_event(&self, event: TimelineEvent) {
        info!(
            event_type = %event.event_type,
            actor = %event.actor_id,
            target = event.target_id.as_deref().unwrap_or("-"),
            "{}",
            event.description
        );
        if let Some(tx) = &self.writer {
            let _ = tx.send(event.clone());
        }
        self.events
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }
}

async fn timeline_writer_loop(mut out: BufWriter<File>, mut rx: mpsc::UnboundedReceiver<TimelineEvent>) {
    while let Some(event) = rx.recv().await {
        let mut batch = vec![event];
        while let Ok(more) = rx.try_recv() {
            batch.push(more);
        }
        for event in &batch {
            if let Err(e) = write_line(&mut out, event) {
                tracing::error!("timeline write failed: {e}");
            }
        }
        if let Err(e) = out.flush() {
            tracing::error!("timeline flush failed: {e}");
        }
    }
}

fn write_line(out: &mut impl Write, event: &TimelineEvent) -> io::Result<()> {
    serde_json::to_writer(&mut *out, event).map_err(io::Error::other)?;
    out.write_all(b"\n")
}

//! Best-effort activity feed.
//!
//! One JSON object per line in `<root>/.events.jsonl`. Writes never fail the
//! caller: a charge that lands but can't be journaled is still a charge.

use std::io::Write;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde_json::Value;

pub const FEED_FILE: &str = ".events.jsonl";

#[derive(Debug, Serialize)]
struct FeedEvent<'a> {
    ts: String,
    #[serde(rename = "type")]
    event_type: &'a str,
    actor: &'a str,
    payload: Value,
}

/// Append-only writer over the encampment's event feed.
#[derive(Debug, Clone)]
pub struct FeedWriter {
    path: PathBuf,
}

impl FeedWriter {
    pub fn new(encampment_root: &Path) -> Self {
        Self {
            path: encampment_root.join(FEED_FILE),
        }
    }

    /// Emit one event. Errors are traced and swallowed.
    pub fn emit(&self, event_type: &str, actor: &str, payload: Value) {
        let event = FeedEvent {
            ts: chrono::Utc::now().to_rfc3339(),
            event_type,
            actor,
            payload,
        };
        if let Err(e) = self.append(&event) {
            tracing::debug!(error = %e, event_type, "feed write failed");
        }
    }

    fn append(&self, event: &FeedEvent) -> anyhow::Result<()> {
        let line = serde_json::to_string(event)?;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{line}")?;
        Ok(())
    }
}

//! Per-identity mailboxes.
//!
//! One append-only JSON-lines file per address under `<root>/.mail/`.
//! Append assigns id, timestamp, and thread id; read/archive rewrite the
//! file through a temp-and-rename so concurrent readers always see a
//! consistent snapshot.

use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::config::{EncampmentConfig, WarbandRegistry};
use crate::error::HordeError;

pub const MAIL_DIR: &str = ".mail";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    #[default]
    Notification,
    Reply,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
            Priority::Urgent => "urgent",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for Priority {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "low" => Ok(Priority::Low),
            "normal" => Ok(Priority::Normal),
            "high" => Ok(Priority::High),
            "urgent" => Ok(Priority::Urgent),
            other => anyhow::bail!("unknown priority {other:?}"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub from: String,
    pub to: String,
    #[serde(default)]
    pub cc: Vec<String>,
    pub subject: String,
    pub body: String,
    #[serde(default, rename = "type")]
    pub msg_type: MessageType,
    #[serde(default)]
    pub priority: Priority,
    pub thread_id: String,
    #[serde(default)]
    pub reply_to: Option<String>,
    #[serde(default)]
    pub pinned: bool,
    /// Ephemeral: safe to drop on cleanup sweeps.
    #[serde(default)]
    pub wisp: bool,
    #[serde(default)]
    pub read: bool,
    pub timestamp: DateTime<Utc>,
}

/// Everything the sender controls; the store fills in the rest.
#[derive(Debug, Clone, Default)]
pub struct Draft {
    pub from: String,
    pub to: String,
    pub cc: Vec<String>,
    pub subject: String,
    pub body: String,
    pub msg_type: MessageType,
    pub priority: Priority,
    pub thread_id: Option<String>,
    pub reply_to: Option<String>,
    pub pinned: bool,
    pub wisp: bool,
}

/// Search filters; all present filters must match.
#[derive(Debug, Clone, Default)]
pub struct SearchOpts {
    pub query: String,
    pub from_filter: Option<String>,
    pub subject_only: bool,
    pub body_only: bool,
}

/// One physical mailbox.
#[derive(Debug, Clone)]
pub struct Mailbox {
    address: String,
    path: PathBuf,
}

impl Mailbox {
    /// Open (without creating) the mailbox for an address.
    pub fn open(encampment_root: &Path, address: &str) -> Self {
        let mut dir = encampment_root.join(MAIL_DIR);
        for part in address.split('/') {
            dir = dir.join(part);
        }
        Self {
            address: address.to_string(),
            path: dir.join("inbox.jsonl"),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Append a message: assigns id + timestamp, mints or inherits the
    /// thread id, writes one line.
    pub fn append(&self, draft: Draft) -> anyhow::Result<Message> {
        let existing = self.load()?;

        let mut id = mint_id("msg");
        while existing.iter().any(|m| m.id == id) {
            id = mint_id("msg");
        }

        let thread_id = draft.thread_id.clone().unwrap_or_else(|| {
            // A reply joins the original's thread when we can find it.
            draft
                .reply_to
                .as_ref()
                .and_then(|orig| existing.iter().find(|m| &m.id == orig))
                .map(|m| m.thread_id.clone())
                .unwrap_or_else(|| mint_id("th"))
        });

        let message = Message {
            id,
            from: draft.from,
            to: draft.to,
            cc: draft.cc,
            subject: draft.subject,
            body: draft.body,
            msg_type: draft.msg_type,
            priority: draft.priority,
            thread_id,
            reply_to: draft.reply_to,
            pinned: draft.pinned,
            wisp: draft.wisp,
            read: false,
            timestamp: Utc::now(),
        };

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating mailbox dir {}", parent.display()))?;
        }
        let line = serde_json::to_string(&message)?;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("opening {}", self.path.display()))?;
        writeln!(file, "{line}")?;
        Ok(message)
    }

    /// All messages in arrival order.
    pub fn list_all(&self) -> anyhow::Result<Vec<Message>> {
        self.load()
    }

    pub fn list_unread(&self) -> anyhow::Result<Vec<Message>> {
        Ok(self.load()?.into_iter().filter(|m| !m.read).collect())
    }

    pub fn get(&self, id: &str) -> anyhow::Result<Message> {
        self.load()?
            .into_iter()
            .find(|m| m.id == id)
            .ok_or_else(|| {
                HordeError::NotFound {
                    what: "message",
                    id: id.to_string(),
                }
                .into()
            })
    }

    pub fn mark_read(&self, id: &str) -> anyhow::Result<()> {
        let mut messages = self.load()?;
        let Some(msg) = messages.iter_mut().find(|m| m.id == id) else {
            return Err(HordeError::NotFound {
                what: "message",
                id: id.to_string(),
            }
            .into());
        };
        msg.read = true;
        self.store(&messages)
    }

    /// Remove a message; returns false when it was already gone.
    pub fn delete(&self, id: &str) -> anyhow::Result<bool> {
        let messages = self.load()?;
        let before = messages.len();
        let remaining: Vec<Message> =
            messages.into_iter().filter(|m| m.id != id).collect();
        if remaining.len() == before {
            return Ok(false);
        }
        self.store(&remaining)?;
        Ok(true)
    }

    /// Pure filter over the log; ordering stays arrival order.
    pub fn search(&self, opts: &SearchOpts) -> anyhow::Result<Vec<Message>> {
        let needle = opts.query.to_lowercase();
        Ok(self
            .load()?
            .into_iter()
            .filter(|m| {
                if let Some(ref from) = opts.from_filter {
                    if &m.from != from {
                        return false;
                    }
                }
                if needle.is_empty() {
                    return true;
                }
                let in_subject = m.subject.to_lowercase().contains(&needle);
                let in_body = m.body.to_lowercase().contains(&needle);
                if opts.subject_only {
                    in_subject
                } else if opts.body_only {
                    in_body
                } else {
                    in_subject || in_body
                }
            })
            .collect())
    }

    /// (total, unread)
    pub fn count(&self) -> anyhow::Result<(usize, usize)> {
        let messages = self.load()?;
        let unread = messages.iter().filter(|m| !m.read).count();
        Ok((messages.len(), unread))
    }

    fn load(&self) -> anyhow::Result<Vec<Message>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let text = std::fs::read_to_string(&self.path)
            .with_context(|| format!("reading {}", self.path.display()))?;
        let mut messages = Vec::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<Message>(line) {
                Ok(m) => messages.push(m),
                Err(e) => {
                    tracing::warn!(mailbox = %self.address, error = %e, "skipping bad line");
                }
            }
        }
        Ok(messages)
    }

    fn store(&self, messages: &[Message]) -> anyhow::Result<()> {
        let mut body = String::new();
        for m in messages {
            body.push_str(&serde_json::to_string(m)?);
            body.push('\n');
        }
        let tmp = self.path.with_extension("jsonl.tmp");
        std::fs::write(&tmp, body)
            .with_context(|| format!("writing {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("replacing {}", self.path.display()))?;
        Ok(())
    }
}

fn mint_id(prefix: &str) -> String {
    let n: u32 = rand::rng().random();
    format!("{prefix}-{n:08x}")
}

// ---------------------------------------------------------------------------
// Address resolution
// ---------------------------------------------------------------------------

/// Where a logical address actually lands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// One identity, one mailbox.
    Single(String),
    /// Fan-in: one physical mailbox that several workers claim from.
    Queue(String),
    /// Fan-out: a distinct copy per recipient.
    Fanout(Vec<String>),
}

/// Translate one address into physical mailbox addresses.
pub fn resolve_address(
    address: &str,
    encampment: &EncampmentConfig,
    registry: &WarbandRegistry,
) -> Delivery {
    if let Some(recipients) = encampment.channels.get(address) {
        return Delivery::Fanout(recipients.clone());
    }
    // `W/raiders` with no worker segment is the warband's shared queue.
    if let Some((warband, rest)) = address.split_once('/') {
        if rest == "raiders" && registry.contains(warband) {
            return Delivery::Queue(address.to_string());
        }
    }
    Delivery::Single(address.to_string())
}

/// Deliver a draft to its logical address, fanning out as needed. Returns
/// one stored message per physical mailbox.
pub fn deliver(
    encampment_root: &Path,
    encampment: &EncampmentConfig,
    registry: &WarbandRegistry,
    draft: &Draft,
) -> anyhow::Result<Vec<Message>> {
    let targets = match resolve_address(&draft.to, encampment, registry) {
        Delivery::Single(addr) | Delivery::Queue(addr) => vec![addr],
        Delivery::Fanout(list) => list,
    };
    let mut stored = Vec::new();
    for target in targets {
        let mailbox = Mailbox::open(encampment_root, &target);
        let mut copy = draft.clone();
        copy.to = target;
        stored.push(mailbox.append(copy)?);
    }
    Ok(stored)
}

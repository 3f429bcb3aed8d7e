//! Callback routing for the warchief's inbox.
//!
//! Agents report back by mail with a small closed set of subject shapes.
//! Each handled message is archived (deleted) only after its handler
//! succeeds, so a crashed run re-processes and the whole thing stays
//! idempotent: a drained inbox is a no-op.

use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;

use crate::beads::{BeadStore, BANNER_SLOT};
use crate::config::WarbandConfig;
use crate::feed::FeedWriter;
use crate::identity::{Identity, OVERSEER_ADDRESS};
use crate::mailbox::{Draft, Mailbox, Message, Priority};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackKind {
    RaiderDone,
    MergeCompleted,
    MergeRejected,
    Help,
    Escalation,
    Charge,
    Unknown,
}

#[derive(Debug, Clone)]
pub struct Classified {
    pub kind: CallbackKind,
    /// The subject's capture group (branch, raider, request id, ...).
    pub capture: String,
}

struct Taxonomy {
    raider_done: Regex,
    merge_completed: Regex,
    merge_rejected: Regex,
    help: Regex,
    escalation: Regex,
    charge: Regex,
}

fn taxonomy() -> &'static Taxonomy {
    static TAXONOMY: OnceLock<Taxonomy> = OnceLock::new();
    TAXONOMY.get_or_init(|| Taxonomy {
        raider_done: Regex::new(r"^RAIDER_DONE\s+(\S+)").expect("raider_done regex"),
        merge_completed: Regex::new(r"^Merge Request Completed:\s+(.+)")
            .expect("merge_completed regex"),
        merge_rejected: Regex::new(r"^Merge Request Rejected:\s+(.+)")
            .expect("merge_rejected regex"),
        help: Regex::new(r"^HELP:\s+(.+)").expect("help regex"),
        escalation: Regex::new(r"^ESCALATION:\s+(.+)").expect("escalation regex"),
        charge: Regex::new(r"^SLING_REQUEST:\s+(\S+)").expect("charge regex"),
    })
}

/// Classify a message subject. The taxonomy is closed; anything else is
/// `Unknown` and left in the inbox untouched.
pub fn classify(subject: &str) -> Classified {
    let t = taxonomy();
    let checks: [(&Regex, CallbackKind); 6] = [
        (&t.raider_done, CallbackKind::RaiderDone),
        (&t.merge_completed, CallbackKind::MergeCompleted),
        (&t.merge_rejected, CallbackKind::MergeRejected),
        (&t.help, CallbackKind::Help),
        (&t.escalation, CallbackKind::Escalation),
        (&t.charge, CallbackKind::Charge),
    ];
    for (regex, kind) in checks {
        if let Some(captures) = regex.captures(subject) {
            return Classified {
                kind,
                capture: captures
                    .get(1)
                    .map(|m| m.as_str().trim().to_string())
                    .unwrap_or_default(),
            };
        }
    }
    Classified {
        kind: CallbackKind::Unknown,
        capture: String::new(),
    }
}

/// Pull a `Key: value` field out of a message body.
pub fn body_field<'a>(body: &'a str, key: &str) -> Option<&'a str> {
    let prefix = format!("{key}:");
    body.lines()
        .find_map(|line| line.strip_prefix(&prefix))
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// Resolves which bead database to use for a given bead; the router never
/// assumes everything lives in one `.relics`.
pub trait Stores {
    fn for_bead(&self, bead_id: &str) -> anyhow::Result<Box<dyn BeadStore>>;
}

pub struct Router<'a> {
    pub root: &'a Path,
    pub inbox: &'a Mailbox,
    pub stores: &'a dyn Stores,
    pub feed: &'a FeedWriter,
    pub actor: String,
}

#[derive(Debug, Default)]
pub struct ProcessOutcome {
    pub processed: usize,
    pub archived: usize,
    pub failures: usize,
    pub lines: Vec<String>,
}

impl Router<'_> {
    /// Drain the inbox in arrival order.
    pub fn process(&self, dry_run: bool, verbose: bool) -> anyhow::Result<ProcessOutcome> {
        let mut outcome = ProcessOutcome::default();

        for message in self.inbox.list_all()? {
            let class = classify(&message.subject);
            if class.kind == CallbackKind::Unknown {
                if verbose {
                    outcome
                        .lines
                        .push(format!("skip {} ({})", message.id, message.subject));
                }
                continue;
            }
            outcome.processed += 1;

            match self.handle(&class, &message, dry_run) {
                Ok(line) => {
                    outcome.lines.push(line);
                    if !dry_run && self.inbox.delete(&message.id)? {
                        outcome.archived += 1;
                    }
                }
                Err(e) => {
                    outcome.failures += 1;
                    outcome
                        .lines
                        .push(format!("✗ {} failed: {e:#}", message.id));
                    tracing::warn!(message = %message.id, error = %e, "callback failed");
                }
            }
        }
        Ok(outcome)
    }

    fn handle(
        &self,
        class: &Classified,
        message: &Message,
        dry_run: bool,
    ) -> anyhow::Result<String> {
        match class.kind {
            CallbackKind::RaiderDone => {
                let exit = body_field(&message.body, "Exit").unwrap_or("?");
                let issue = body_field(&message.body, "Issue").unwrap_or("-");
                tracing::info!(raider = %class.capture, exit, issue, "raider done");
                Ok(format!(
                    "raider_done {} exit={exit} issue={issue}",
                    class.capture
                ))
            }
            CallbackKind::MergeCompleted => self.handle_merge_completed(class, message, dry_run),
            CallbackKind::MergeRejected => {
                let reason = body_field(&message.body, "Reason").unwrap_or("unspecified");
                tracing::info!(branch = %class.capture, reason, "merge rejected");
                Ok(format!("merge_rejected {} ({reason})", class.capture))
            }
            CallbackKind::Help => {
                if !dry_run {
                    self.forward_to_overseer(message, Priority::High)?;
                }
                Ok(format!("help → overseer: {}", class.capture))
            }
            CallbackKind::Escalation => {
                if !dry_run {
                    self.forward_to_overseer(message, Priority::Urgent)?;
                }
                Ok(format!("escalation → overseer: {}", class.capture))
            }
            CallbackKind::Charge => {
                let warband = body_field(&message.body, "Warband").unwrap_or("?");
                // Execution is delegated; we only journal the request.
                tracing::info!(bead = %class.capture, warband, "sling request noted");
                Ok(format!("charge request {} → {warband}", class.capture))
            }
            CallbackKind::Unknown => Ok(String::new()),
        }
    }

    fn handle_merge_completed(
        &self,
        class: &Classified,
        message: &Message,
        dry_run: bool,
    ) -> anyhow::Result<String> {
        let source = body_field(&message.body, "Source")
            .ok_or_else(|| anyhow::anyhow!("merge-completed callback missing Source"))?;
        let commit = body_field(&message.body, "Commit").unwrap_or("unknown");
        let mr = body_field(&message.body, "MR").unwrap_or("-");

        if dry_run {
            return Ok(format!(
                "would close {source} (MR {mr}, merged in {commit})"
            ));
        }

        let store = self.stores.for_bead(source)?;
        let bead = store.show(source)?;
        store.close(source, &format!("Merged in {commit}"))?;

        // Complete transition: the assignee's banner comes down too.
        if !bead.assignee.is_empty() {
            if let Some(agent_bead) = agent_bead_for(self.root, &bead.assignee) {
                if let Err(e) = store.set_slot(&agent_bead, BANNER_SLOT, None) {
                    tracing::warn!(agent_bead = %agent_bead, error = %e, "banner clear failed");
                }
            }
        }

        self.feed.emit(
            "merge",
            &self.actor,
            serde_json::json!({"source": source, "commit": commit, "mr": mr}),
        );
        Ok(format!(
            "merge_completed {}: closed {source} (merged in {commit})",
            class.capture
        ))
    }

    fn forward_to_overseer(&self, message: &Message, priority: Priority) -> anyhow::Result<()> {
        let overseer = Mailbox::open(self.root, OVERSEER_ADDRESS);
        overseer.append(Draft {
            from: message.from.clone(),
            to: OVERSEER_ADDRESS.to_string(),
            subject: message.subject.clone(),
            body: message.body.clone(),
            priority,
            thread_id: Some(message.thread_id.clone()),
            ..Draft::default()
        })?;
        self.feed.emit(
            "mail",
            &self.actor,
            serde_json::json!({"to": OVERSEER_ADDRESS, "subject": message.subject}),
        );
        Ok(())
    }
}

/// Agent-bead id for an assignee address, using the warband's configured
/// prefix. Addresses outside the role grammar (queues, dogs) have none.
fn agent_bead_for(root: &Path, address: &str) -> Option<String> {
    let identity = Identity::parse(address).ok()?;
    let prefix = identity
        .warband()
        .map(|w| {
            WarbandConfig::load(root, w)
                .map(|c| c.prefix)
                .unwrap_or_else(|_| crate::identity::DEFAULT_WARBAND_PREFIX.to_string())
        })
        .unwrap_or_else(|| crate::identity::DEFAULT_WARBAND_PREFIX.to_string());
    Some(identity.agent_bead_id(&prefix))
}

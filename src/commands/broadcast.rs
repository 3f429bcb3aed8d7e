use std::collections::BTreeMap;

use clap::Args;

use crate::context::Ctx;
use crate::mux::{signal_session, Mux};

#[derive(Debug, Args)]
pub struct BroadcastArgs {
    /// Message delivered to each live pane
    pub message: String,
    /// Restrict to one warband's workers
    #[arg(long)]
    pub warband: Option<String>,
    /// Include encampment- and warband-level agents, not just workers
    #[arg(long)]
    pub all: bool,
    #[arg(long)]
    pub dry_run: bool,
}

impl BroadcastArgs {
    pub fn execute(&self) -> anyhow::Result<()> {
        let ctx = Ctx::from_process(None)?;

        // Session-name prefixes per warband; `hq-` covers encampment level.
        let mut prefixes: BTreeMap<String, String> = BTreeMap::new();
        for warband in ctx.registry.names() {
            prefixes.insert(warband.clone(), ctx.prefix_for(&warband));
        }

        let sessions = ctx.mux.list_sessions()?;
        let mut targets = Vec::new();
        for session in sessions {
            let Some(warband) = owning_warband(&session, &prefixes) else {
                if self.all && session.starts_with("hq-") {
                    targets.push(session);
                }
                continue;
            };
            if let Some(ref only) = self.warband {
                if &warband != only {
                    continue;
                }
            }
            // Without --all, warband-level agents are left alone.
            if !self.all {
                let prefix = &prefixes[&warband];
                let rest = &session[prefix.len() + warband.len() + 2..];
                if rest == "witness" || rest == "forge" {
                    continue;
                }
            }
            targets.push(session);
        }

        if targets.is_empty() {
            eprintln!("no live sessions match");
            return Ok(());
        }

        for session in &targets {
            if self.dry_run {
                eprintln!("would signal {session}");
                continue;
            }
            match signal_session(&ctx.mux, session, &self.message) {
                Ok(()) => eprintln!("✓ {session}"),
                Err(e) => eprintln!("✗ {session}: {e:#}"),
            }
        }
        if !self.dry_run {
            ctx.feed.emit(
                "nudge",
                &ctx.actor(),
                serde_json::json!({"kind": "broadcast", "count": targets.len()}),
            );
        }
        Ok(())
    }
}

/// Which warband does a session name belong to, if any?
fn owning_warband(session: &str, prefixes: &BTreeMap<String, String>) -> Option<String> {
    for (warband, prefix) in prefixes {
        if session.starts_with(&format!("{prefix}-{warband}-")) {
            return Some(warband.clone());
        }
    }
    None
}

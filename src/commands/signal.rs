use clap::Args;

use crate::beads::{BeadStore, NOTIFICATION_LEVEL_KEY};
use crate::commands::parse_target;
use crate::context::Ctx;
use crate::error::HordeError;
use crate::mux::{accept_bypass_permissions_warning, signal_session, Mux};

#[derive(Debug, Args)]
pub struct SignalArgs {
    /// Identity address, or `.` for the caller
    pub target: String,
    /// Message text (or use -m)
    pub text: Option<String>,
    #[arg(short, long)]
    pub message: Option<String>,
    /// Ignore the recipient's do-not-disturb setting
    #[arg(long)]
    pub force: bool,
}

impl SignalArgs {
    pub fn execute(&self) -> anyhow::Result<()> {
        let ctx = Ctx::from_process(None)?;
        let identity = parse_target(&ctx, &self.target)?;
        let prefix = ctx.prefix_of(&identity);
        let session = identity.session_name(&prefix);

        let text = self
            .message
            .clone()
            .or_else(|| self.text.clone())
            .ok_or_else(|| anyhow::anyhow!("no message given"))?;

        if !ctx.mux.has_session(&session)? {
            return Err(HordeError::NotFound {
                what: "session",
                id: session,
            }
            .into());
        }

        if !self.force {
            let agent_store = ctx.agent_store_of(&identity);
            let muted = agent_store
                .show(&identity.agent_bead_id(&prefix))
                .ok()
                .and_then(|b| {
                    b.description_field(NOTIFICATION_LEVEL_KEY)
                        .map(ToString::to_string)
                })
                .is_some_and(|level| level == "muted");
            if muted {
                eprintln!("{} is muted; use --force to signal anyway", identity.address());
                return Ok(());
            }
        }

        accept_bypass_permissions_warning(&ctx.mux, &session);
        signal_session(&ctx.mux, &session, &text)?;
        ctx.feed.emit(
            "nudge",
            &ctx.actor(),
            serde_json::json!({"session": session, "kind": "signal"}),
        );
        eprintln!("✓ signaled {session}");
        Ok(())
    }
}

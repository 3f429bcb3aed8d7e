use std::process::{Command, Stdio};

use clap::Args;

use crate::context::Ctx;
use crate::dispatch::{ChargeOpts, Dispatcher};

#[cfg(unix)]
use std::os::unix::process::CommandExt as _;

#[derive(Debug, Args)]
pub struct HandoffArgs {
    /// Bead to carry over to the successor session
    pub bead: String,
    #[arg(long)]
    pub force: bool,
}

impl HandoffArgs {
    /// Attach the bead to the caller's own hook, then restart the caller's
    /// session so the successor picks it up with a handoff nudge.
    pub fn execute(&self) -> anyhow::Result<()> {
        let ctx = Ctx::from_process(None)?;
        let identity = ctx.info.identity.clone();
        let prefix = ctx.prefix_of(&identity);
        let session = identity.session_name(&prefix);

        let bead_store = ctx.store_for_bead(&self.bead)?;
        let agent_store = ctx.agent_store_of(&identity);
        let dispatcher = Dispatcher::new(
            ctx.root(),
            &ctx.mux,
            &ctx.feed,
            &ctx.encampment,
            &ctx.registry,
            ctx.actor(),
            &bead_store,
            &agent_store,
        );
        dispatcher.charge(
            &self.bead,
            Some("."),
            &identity,
            &[],
            None,
            &ChargeOpts {
                force: self.force,
                no_signal: true,
                ..ChargeOpts::default()
            },
        )?;
        eprintln!("✓ {} hooked to {}", self.bead, identity.address());

        // The restart kills the very pane this process lives in, so hand
        // the work to a detached child that survives the session teardown.
        let mut cmd = Command::new(ctx.bin());
        cmd.args([
            "start",
            &identity.address(),
            "--kill-existing",
            "--predecessor",
            &session,
        ])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
        #[cfg(unix)]
        cmd.process_group(0);
        cmd.spawn()?;

        eprintln!("restarting {session} for handoff");
        Ok(())
    }
}

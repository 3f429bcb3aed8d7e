use clap::Args;

use crate::commands::parse_target;
use crate::context::Ctx;
use crate::session::{SessionManager, StartOpts};

#[derive(Debug, Args)]
pub struct StartArgs {
    /// Identity address, or `.` for the caller
    pub target: String,
    /// Kill a live session instead of refusing
    #[arg(long)]
    pub kill_existing: bool,
    /// Account config directory under warchief/accounts/
    #[arg(long)]
    pub account: Option<String>,
    /// Agent program override
    #[arg(long)]
    pub agent: Option<String>,
    /// Predecessor session name, surfaced in the startup nudge
    #[arg(long, hide = true)]
    pub predecessor: Option<String>,
}

impl StartArgs {
    pub fn execute(&self) -> anyhow::Result<()> {
        let ctx = Ctx::from_process(None)?;
        let identity = parse_target(&ctx, &self.target)?;
        let prefix = ctx.prefix_of(&identity);
        let store = ctx.agent_store_of(&identity);
        let manager =
            SessionManager::new(&ctx.mux, &store, &ctx.feed, ctx.root(), &ctx.encampment);
        let session = manager.start(
            &identity,
            &prefix,
            &StartOpts {
                kill_existing: self.kill_existing,
                predecessor: self.predecessor.clone(),
                account: self.account.clone(),
                program: self.agent.clone(),
            },
        )?;
        eprintln!("✓ started {session}");
        Ok(())
    }
}

#[derive(Debug, Args)]
pub struct StopArgs {
    /// Identity address, or `.` for the caller
    pub target: String,
}

impl StopArgs {
    pub fn execute(&self) -> anyhow::Result<()> {
        let ctx = Ctx::from_process(None)?;
        let identity = parse_target(&ctx, &self.target)?;
        let prefix = ctx.prefix_of(&identity);
        let store = ctx.agent_store_of(&identity);
        let manager =
            SessionManager::new(&ctx.mux, &store, &ctx.feed, ctx.root(), &ctx.encampment);
        if manager.stop(&identity, &prefix)? {
            eprintln!("✓ stopped {}", identity.session_name(&prefix));
        } else {
            eprintln!("{} was not running", identity.session_name(&prefix));
        }
        Ok(())
    }
}

#[derive(Debug, Args)]
pub struct AttachArgs {
    /// Identity address, or `.` for the caller
    pub target: String,
    /// Account config directory, used if the session must be started
    #[arg(long)]
    pub account: Option<String>,
}

impl AttachArgs {
    pub fn execute(&self) -> anyhow::Result<()> {
        let ctx = Ctx::from_process(None)?;
        let identity = parse_target(&ctx, &self.target)?;
        let prefix = ctx.prefix_of(&identity);
        let store = ctx.agent_store_of(&identity);
        let manager =
            SessionManager::new(&ctx.mux, &store, &ctx.feed, ctx.root(), &ctx.encampment);
        manager.attach(
            &identity,
            &prefix,
            &StartOpts {
                account: self.account.clone(),
                ..StartOpts::default()
            },
        )?;
        Ok(())
    }
}

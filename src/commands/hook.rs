use clap::Args;

use crate::beads::BeadStore;
use crate::context::Ctx;
use crate::dispatch::{ChargeOpts, Dispatcher};

#[derive(Debug, Args)]
pub struct HookArgs {
    /// Bead to attach; omit to show the current hook
    pub bead: Option<String>,
    /// Replace an incumbent hooked bead
    #[arg(long)]
    pub force: bool,
}

impl HookArgs {
    pub fn execute(&self) -> anyhow::Result<()> {
        let ctx = Ctx::from_process(None)?;
        match &self.bead {
            Some(bead) => attach(&ctx, bead, self.force),
            None => show(&ctx),
        }
    }
}

/// `hd hook` with no argument: report what's on the caller's hook.
fn show(ctx: &Ctx) -> anyhow::Result<()> {
    let identity = &ctx.info.identity;
    let prefix = ctx.prefix_of(identity);
    let agent_bead_id = identity.agent_bead_id(&prefix);
    let agent_store = ctx.agent_store_of(identity);

    println!("Identity: {}", identity.address());
    let banner = match agent_store.show(&agent_bead_id) {
        Ok(agent) => agent.banner_bead().map(ToString::to_string),
        Err(_) => None,
    };
    let Some(banner) = banner else {
        println!("Hook:     empty");
        return Ok(());
    };

    println!("Hook:     {banner}");
    match ctx.store_for_bead(&banner).and_then(|s| s.show(&banner)) {
        Ok(bead) => {
            println!("Title:    {}", bead.title);
            println!("Status:   {}", bead.status);
            if let Some(dispatcher) = bead.description_field(crate::beads::DISPATCHED_BY_KEY) {
                println!("From:     {dispatcher}");
            }
            if let Some(args) = bead.description_field(crate::beads::ATTACHED_ARGS_KEY) {
                println!("Args:     {args}");
            }
        }
        Err(e) => println!("Title:    (unresolvable: {e:#})"),
    }
    Ok(())
}

/// `hd hook <bead>`: attach to the caller's own hook. No session is
/// started and no signal is sent; the caller is the agent.
fn attach(ctx: &Ctx, bead: &str, force: bool) -> anyhow::Result<()> {
    let bead_store = ctx.store_for_bead(bead)?;
    let agent_store = ctx.agent_store_of(&ctx.info.identity);
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
    let report = dispatcher.charge(
        bead,
        Some("."),
        &ctx.info.identity,
        &[],
        None,
        &ChargeOpts {
            force,
            no_signal: true,
            ..ChargeOpts::default()
        },
    )?;
    eprintln!("✓ {} hooked to {}", report.bead, report.target);
    Ok(())
}

use clap::Subcommand;

use crate::callbacks::Router;
use crate::context::Ctx;

#[derive(Debug, Subcommand)]
pub enum CallbacksCommand {
    /// Drain the warchief inbox, dispatching each callback to its handler
    Process {
        #[arg(long)]
        dry_run: bool,
        #[arg(long, short)]
        verbose: bool,
    },
}

impl CallbacksCommand {
    pub fn execute(&self) -> anyhow::Result<()> {
        let CallbacksCommand::Process { dry_run, verbose } = self;
        let ctx = Ctx::from_process(None)?;

        let inbox = ctx.mailbox("warchief");
        let router = Router {
            root: ctx.root(),
            inbox: &inbox,
            stores: &ctx,
            feed: &ctx.feed,
            actor: ctx.actor(),
        };
        let outcome = router.process(*dry_run, *verbose)?;

        for line in &outcome.lines {
            println!("{line}");
        }
        println!(
            "{} processed, {} archived, {} failed{}",
            outcome.processed,
            outcome.archived,
            outcome.failures,
            if *dry_run { " (dry run)" } else { "" }
        );
        if outcome.failures > 0 {
            anyhow::bail!("{} callback(s) failed", outcome.failures);
        }
        Ok(())
    }
}

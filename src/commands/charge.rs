use clap::Args;

use crate::beads::{looks_like_bead_id, BeadStore, CreateBead, RlStore};
use crate::context::Ctx;
use crate::dispatch::{ChargeOpts, ChargeReport, Dispatcher};
use crate::identity::Identity;

#[derive(Debug, Args)]
pub struct ChargeArgs {
    /// Bead id or ritual name, optionally followed by a target (identity
    /// address, warband name, or `.`). Several bead ids followed by a
    /// warband name dispatch as a batch, one fresh raider per bead.
    #[arg(required = true)]
    pub spec: Vec<String>,
    /// Subject line carried in the work-start signal
    #[arg(long)]
    pub subject: Option<String>,
    /// Freeform message appended to the work-start signal
    #[arg(short, long)]
    pub message: Option<String>,
    /// Arguments persisted on the bead under attached_args
    #[arg(long)]
    pub args: Option<String>,
    /// Treat the first argument as a ritual and run it on this bead
    /// (wisp + bond)
    #[arg(long)]
    pub on: Option<String>,
    /// Ritual variables (k=v), repeatable
    #[arg(long = "var", value_name = "K=V")]
    pub vars: Vec<String>,
    /// Create a task bead with the given title, then dispatch it
    #[arg(long)]
    pub create: bool,
    /// Replace an incumbent hooked bead
    #[arg(long)]
    pub force: bool,
    /// Account config directory for auto-provisioned sessions
    #[arg(long)]
    pub account: Option<String>,
    /// Agent program alias for auto-provisioned sessions
    #[arg(long)]
    pub agent: Option<String>,
    /// Skip the tracking-raid creation
    #[arg(long)]
    pub no_raid: bool,
    #[arg(long)]
    pub dry_run: bool,
}

impl ChargeArgs {
    pub fn execute(&self) -> anyhow::Result<()> {
        let ctx = Ctx::from_process(None)?;
        let opts = ChargeOpts {
            subject: self.subject.clone(),
            message: self.message.clone(),
            args: self.args.clone(),
            force: self.force,
            no_raid: self.no_raid,
            dry_run: self.dry_run,
            no_signal: false,
            account: self.account.clone(),
            program: self.agent.clone(),
        };
        let vars = parse_vars(&self.vars)?;

        // Batch shape: N>=2 bead ids with a trailing warband name.
        if self.spec.len() >= 3 {
            let (beads, last) = self.spec.split_at(self.spec.len() - 1);
            if ctx.registry.contains(&last[0]) && beads.iter().all(|b| looks_like_bead_id(b)) {
                return run_batch(&ctx, beads, &last[0], &opts);
            }
        }

        let mut spec = self.spec[0].clone();
        let target = self.spec.get(1).map(String::as_str);

        if self.create {
            // New beads land in the target's database.
            let store = agent_store_for_target(&ctx, target)?;
            let bead = store.create(&CreateBead {
                title: spec.clone(),
                bead_type: "task".to_string(),
                ..CreateBead::default()
            })?;
            eprintln!("Created {}: {}", bead.id, spec);
            spec = bead.id;
        }

        let bead_store = ctx.store_for_bead(&spec)?;
        let agent_store = agent_store_for_target(&ctx, target)?;
        let dispatcher = dispatcher(&ctx, &bead_store, &agent_store);

        let report = dispatcher.charge(
            &spec,
            target,
            &ctx.info.identity,
            &vars,
            self.on.as_deref(),
            &opts,
        )?;
        print_report(&report);
        Ok(())
    }
}

fn run_batch(
    ctx: &Ctx,
    beads: &[String],
    warband: &str,
    opts: &ChargeOpts,
) -> anyhow::Result<()> {
    let bead_store = RlStore::new(&ctx.warband_clone(warband));
    let agent_store = RlStore::new(&ctx.warband_clone(warband));
    let dispatcher = dispatcher(ctx, &bead_store, &agent_store);

    let results = dispatcher.charge_batch(beads, warband, &ctx.info.identity, opts);
    let mut failures = 0;
    for (bead, result) in &results {
        match result {
            Ok(report) => print_report(report),
            Err(e) => {
                failures += 1;
                eprintln!("✗ {bead}: {e:#}");
            }
        }
    }
    if failures > 0 {
        anyhow::bail!("{failures} of {} dispatches failed", results.len());
    }
    Ok(())
}

fn dispatcher<'a>(
    ctx: &'a Ctx,
    bead_store: &'a RlStore,
    agent_store: &'a RlStore,
) -> Dispatcher<'a> {
    Dispatcher::new(
        ctx.root(),
        &ctx.mux,
        &ctx.feed,
        &ctx.encampment,
        &ctx.registry,
        ctx.actor(),
        bead_store,
        agent_store,
    )
}

/// The store holding the eventual target's agent-bead.
fn agent_store_for_target(ctx: &Ctx, target: Option<&str>) -> anyhow::Result<RlStore> {
    match target {
        None | Some(".") => Ok(ctx.agent_store_of(&ctx.info.identity)),
        Some(t) if ctx.registry.contains(t) => Ok(RlStore::new(&ctx.warband_clone(t))),
        Some(t) if t.starts_with("shaman/") => Ok(RlStore::new(ctx.root())),
        Some(t) => match Identity::parse(t) {
            Ok(identity) => Ok(ctx.agent_store_of(&identity)),
            Err(_) => Ok(RlStore::new(ctx.root())),
        },
    }
}

fn parse_vars(raw: &[String]) -> anyhow::Result<Vec<(String, String)>> {
    raw.iter()
        .map(|pair| {
            pair.split_once('=')
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .ok_or_else(|| anyhow::anyhow!("--var expects K=V, got {pair:?}"))
        })
        .collect()
}

fn print_report(report: &ChargeReport) {
    if report.dry_run {
        eprintln!("would charge {} → {}", report.bead, report.target);
        return;
    }
    let mut line = format!("✓ {} → {}", report.bead, report.target);
    if let Some(ref worker) = report.provisioned_worker {
        line.push_str(&format!(" (new raider {worker})"));
    }
    if report.signaled {
        line.push_str(" signaled");
    } else {
        line.push_str(" (no signal; agent will find it via inbox)");
    }
    if let Some(ref raid) = report.raid {
        line.push_str(&format!(", raid {raid}"));
    }
    eprintln!("{line}");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vars_parse() {
        let vars = parse_vars(&["a=1".into(), "b=two=2".into()]).unwrap();
        assert_eq!(vars[0], ("a".into(), "1".into()));
        assert_eq!(vars[1], ("b".into(), "two=2".into()));
        assert!(parse_vars(&["novalue".into()]).is_err());
    }
}

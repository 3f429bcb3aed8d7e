use std::collections::HashMap;

use clap::Args;

use crate::beads::{BeadFilter, BeadStatus, BeadStore, RlStore, BANNER_SLOT};
use crate::context::Ctx;
use crate::locks;
use crate::subprocess::Tool;

#[derive(Debug, Args)]
pub struct DoctorArgs {
    /// Repair what can be repaired: stale locks, dangling banners
    #[arg(long)]
    pub fix: bool,
    #[arg(long, short)]
    pub verbose: bool,
    /// Restrict hook checks to one warband
    #[arg(long)]
    pub warband: Option<String>,
}

impl DoctorArgs {
    pub fn execute(&self) -> anyhow::Result<()> {
        let ctx = Ctx::from_process(None)?;
        let mut issues: Vec<String> = Vec::new();

        println!("=== Horde Doctor ===\n");
        println!("Encampment: {}", ctx.encampment.name);
        println!("Root:       {}", ctx.root().display());
        println!("Identity:   {}", ctx.actor());
        println!();

        self.check_tools(&mut issues);
        self.check_warbands(&ctx, &mut issues);
        self.check_locks(&ctx, &mut issues);
        self.check_hooks(&ctx, &mut issues);

        if issues.is_empty() {
            println!("\n✓ no issues found");
            return Ok(());
        }
        println!("\nIssues ({}):", issues.len());
        for issue in &issues {
            println!("  • {issue}");
        }
        anyhow::bail!("{} issue(s) found", issues.len())
    }

    fn check_tools(&self, issues: &mut Vec<String>) {
        println!("Tools:");
        for (label, binary) in [("rl (bead store)", "rl"), ("tmux", "tmux"), ("git", "git")] {
            match Tool::new(binary).arg("--version").run() {
                Ok(output) if output.success() => {
                    let version = output.stdout.lines().next().unwrap_or("").trim().to_string();
                    println!("  ✓ {label}: {version}");
                }
                _ => {
                    println!("  ✗ {label}: NOT FOUND");
                    issues.push(format!("tool not found: {binary}"));
                }
            }
        }
    }

    fn check_warbands(&self, ctx: &Ctx, issues: &mut Vec<String>) {
        println!("\nWarbands:");
        let names = ctx.registry.names();
        if names.is_empty() {
            println!("  (none registered)");
        }
        for warband in names {
            if let Some(ref only) = self.warband {
                if &warband != only {
                    continue;
                }
            }
            let dir = ctx.root().join(&warband);
            let clone = ctx.warband_clone(&warband);
            let relics = clone.join(crate::beads::RELICS_DIR);
            if !dir.is_dir() {
                println!("  ✗ {warband}: directory missing");
                issues.push(format!("warband {warband}: directory missing"));
                continue;
            }
            if !clone.is_dir() {
                println!("  ✗ {warband}: shared clone missing");
                issues.push(format!("warband {warband}: shared clone missing"));
                continue;
            }
            if !relics.is_dir() {
                println!("  ✗ {warband}: no .relics database in shared clone");
                issues.push(format!("warband {warband}: missing bead database"));
                continue;
            }
            println!("  ✓ {warband} (prefix {})", ctx.prefix_for(&warband));
        }
    }

    fn check_locks(&self, ctx: &Ctx, issues: &mut Vec<String>) {
        println!("\nLocks:");
        let all = locks::find_all(ctx.root());
        let stale: Vec<_> = all
            .iter()
            .filter(|(_, info)| info.pid == 0 || info.is_stale())
            .collect();
        println!("  {} lock(s), {} stale", all.len(), stale.len());
        if self.verbose {
            for (dir, info) in &all {
                println!("    {} pid={} ({})", dir.display(), info.pid, info.session_id);
            }
        }
        if stale.is_empty() {
            return;
        }
        if self.fix {
            let removed = locks::clean_stale_locks(ctx.root());
            println!("  ✓ removed {removed} stale lock(s)");
        } else {
            issues.push(format!(
                "{} stale lock(s); rerun with --fix",
                stale.len()
            ));
        }
    }

    /// Hook invariants: at most one hooked bead per assignee, and every
    /// banner slot pointing at a bead that is hooked to that agent.
    fn check_hooks(&self, ctx: &Ctx, issues: &mut Vec<String>) {
        println!("\nHooks:");
        let mut stores: Vec<(String, RlStore)> =
            vec![("hq".to_string(), RlStore::new(ctx.root()))];
        for warband in ctx.registry.names() {
            if let Some(ref only) = self.warband {
                if &warband != only {
                    continue;
                }
            }
            stores.push((warband.clone(), RlStore::new(&ctx.warband_clone(&warband))));
        }

        for (scope, store) in &stores {
            let hooked = match store.list(&BeadFilter {
                status: Some(BeadStatus::Hooked),
                ..BeadFilter::default()
            }) {
                Ok(beads) => beads,
                Err(e) => {
                    if self.verbose {
                        println!("  - {scope}: unscannable ({e:#})");
                    }
                    continue;
                }
            };

            let mut per_assignee: HashMap<String, Vec<String>> = HashMap::new();
            for bead in &hooked {
                per_assignee
                    .entry(bead.assignee.clone())
                    .or_default()
                    .push(bead.id.clone());
            }
            for (assignee, beads) in &per_assignee {
                if beads.len() > 1 {
                    println!("  ✗ {scope}: {assignee} has {} hooked beads", beads.len());
                    issues.push(format!(
                        "{assignee} hooked to {} beads ({})",
                        beads.len(),
                        beads.join(", ")
                    ));
                }
            }

            let agents = match store.list(&BeadFilter {
                bead_type: Some("agent".to_string()),
                ..BeadFilter::default()
            }) {
                Ok(agents) => agents,
                Err(_) => continue,
            };
            for agent in agents {
                let Some(banner) = agent.banner_bead() else {
                    continue;
                };
                let ok = store
                    .show(banner)
                    .map(|b| b.status == BeadStatus::Hooked && b.assignee == agent.title)
                    .unwrap_or(false);
                if ok {
                    continue;
                }
                if self.fix {
                    let _ = store.set_slot(&agent.id, BANNER_SLOT, None);
                    println!("  ✓ cleared dangling banner on {}", agent.id);
                } else {
                    println!("  ✗ {}: banner {} is dangling", agent.id, banner);
                    issues.push(format!("{}: banner {} dangling", agent.id, banner));
                }
            }
            println!("  ✓ {scope}: {} hooked bead(s) checked", hooked.len());
        }
    }
}

use clap::Subcommand;

use crate::context::Ctx;
use crate::locks;
use crate::mux::Mux;
use crate::resolve::ENV_STALE_WARNED;

#[derive(Debug, Default, Subcommand)]
pub enum AgentsCommand {
    /// List live agent sessions with their locks
    #[default]
    List,
    /// Report collisions between sessions and locks
    Check,
    /// Remove stale locks
    Fix,
}

impl AgentsCommand {
    pub fn execute(&self) -> anyhow::Result<()> {
        let ctx = Ctx::from_process(None)?;
        match self {
            AgentsCommand::List => list(&ctx),
            AgentsCommand::Check => check(&ctx),
            AgentsCommand::Fix => fix(&ctx),
        }
    }
}

fn list(ctx: &Ctx) -> anyhow::Result<()> {
    let sessions = agent_sessions(ctx)?;
    let all_locks = locks::find_all(ctx.root());

    if sessions.is_empty() {
        println!("no live agent sessions");
    }
    for session in &sessions {
        let lock = all_locks.iter().find(|(_, info)| &info.session_id == session);
        match lock {
            Some((dir, info)) => {
                println!("{session}  pid={}  {}", info.pid, dir.display());
            }
            None => println!("{session}  (no lock)"),
        }
    }

    let stale = all_locks
        .iter()
        .filter(|(_, info)| info.pid == 0 || info.is_stale())
        .count();
    // One-shot warning; the latch env suppresses repeats.
    if stale > 0 && std::env::var(ENV_STALE_WARNED).is_err() {
        eprintln!("warning: {stale} stale lock(s) found; run `{} agents fix`", ctx.bin());
    }
    Ok(())
}

fn check(ctx: &Ctx) -> anyhow::Result<()> {
    let sessions = agent_sessions(ctx)?;
    let all_locks = locks::find_all(ctx.root());
    let mut issues = 0;

    for (dir, info) in &all_locks {
        if info.pid == 0 || info.is_stale() {
            issues += 1;
            println!("stale lock: {} (pid {})", dir.display(), info.pid);
        } else if !sessions.contains(&info.session_id) {
            issues += 1;
            println!(
                "lock without session: {} claims {}",
                dir.display(),
                info.session_id
            );
        }
    }
    for session in &sessions {
        if !all_locks.iter().any(|(_, info)| &info.session_id == session) {
            issues += 1;
            println!("session without lock: {session}");
        }
    }

    if issues == 0 {
        println!("✓ sessions and locks agree");
    } else {
        println!("{issues} issue(s); `{} agents fix` clears stale locks", ctx.bin());
    }
    Ok(())
}

fn fix(ctx: &Ctx) -> anyhow::Result<()> {
    let removed = locks::clean_stale_locks(ctx.root());
    println!("removed {removed} stale lock(s)");
    Ok(())
}

/// Sessions that look like ours: `hq-*` plus every warband prefix.
fn agent_sessions(ctx: &Ctx) -> anyhow::Result<Vec<String>> {
    let mut prefixes = vec!["hq-".to_string()];
    for warband in ctx.registry.names() {
        prefixes.push(format!("{}-{warband}-", ctx.prefix_for(&warband)));
    }
    Ok(ctx
        .mux
        .list_sessions()?
        .into_iter()
        .filter(|s| prefixes.iter().any(|p| s.starts_with(p.as_str())))
        .collect())
}

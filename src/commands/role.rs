use clap::Subcommand;

use crate::context::Ctx;
use crate::resolve::{self, EnvSnapshot, IdentitySource};

#[derive(Debug, Default, Subcommand)]
pub enum RoleCommand {
    /// Resolved identity with provenance
    #[default]
    Show,
    /// The identity's working directory
    Home,
    /// What the directory layout alone says
    Detect,
    /// The role taxonomy
    List,
    /// Relevant environment variables as seen by the resolver
    Env,
}

impl RoleCommand {
    pub fn execute(&self) -> anyhow::Result<()> {
        let ctx = Ctx::from_process(None)?;
        match self {
            RoleCommand::Show => show(&ctx),
            RoleCommand::Home => {
                println!("{}", ctx.info.home.display());
                Ok(())
            }
            RoleCommand::Detect => detect(&ctx),
            RoleCommand::List => list(),
            RoleCommand::Env => env(),
        }
    }
}

fn show(ctx: &Ctx) -> anyhow::Result<()> {
    let info = &ctx.info;
    println!("role:      {}", info.identity.role());
    if let Some(warband) = info.identity.warband() {
        println!("warband:   {warband}");
    }
    if let Some(worker) = info.identity.worker() {
        println!("worker:    {worker}");
    }
    println!("address:   {}", info.address());
    println!(
        "session:   {}",
        info.identity.session_name(&ctx.prefix_of(&info.identity))
    );
    let source = match info.source {
        IdentitySource::Explicit => "explicit",
        IdentitySource::Env => "env",
        IdentitySource::Cwd => "cwd",
    };
    println!("source:    {source}");
    if let Some(ref raw) = info.env_role_raw {
        println!("env role:  {raw}");
    }
    if let Some(ref cwd_identity) = info.cwd_identity {
        println!("cwd role:  {}", cwd_identity.role());
    }
    if info.mismatch {
        println!("mismatch:  true (environment wins)");
    }
    if info.env_incomplete {
        println!("env:       incomplete, filled from cwd");
    }
    if let Some(ref forge_worker) = info.forge_worker {
        println!("forge id:  {forge_worker}");
    }
    println!("home:      {}", info.home.display());
    println!("root:      {}", info.encampment_root.display());
    Ok(())
}

fn detect(ctx: &Ctx) -> anyhow::Result<()> {
    match resolve::detect_from_cwd(ctx.root(), &ctx.info.workdir) {
        Some(identity) => println!("{}", identity.address()),
        None => println!("(no role directory above cwd)"),
    }
    Ok(())
}

fn list() -> anyhow::Result<()> {
    println!("warchief   encampment-level, one per workspace");
    println!("shaman     encampment-level, one per workspace");
    println!("witness    warband-level, one per warband");
    println!("forge      warband-level, one per warband");
    println!("raider     worker-level, ephemeral, own worktree");
    println!("clan       worker-level, persistent, own worktree");
    Ok(())
}

fn env() -> anyhow::Result<()> {
    let snapshot = EnvSnapshot::from_process();
    for key in [
        resolve::ENV_ROLE,
        resolve::ENV_WARBAND,
        resolve::ENV_RAIDER,
        resolve::ENV_CLAN,
        resolve::ENV_ENCAMPMENT,
        resolve::ENV_ROLE_HOME,
        resolve::ENV_FORGE_WORKER,
    ] {
        match snapshot.get(key) {
            Some(value) => println!("{key}={value}"),
            None => println!("{key} (unset)"),
        }
    }
    Ok(())
}

/// `hd whoami`: the effective sender address.
pub fn run_whoami() -> anyhow::Result<()> {
    let ctx = Ctx::from_process(None)?;
    println!("{}", ctx.actor());
    Ok(())
}

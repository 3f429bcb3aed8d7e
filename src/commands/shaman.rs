use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Subcommand;

use crate::beads::{BeadFilter, BeadStatus, BeadStore, RlStore, BANNER_SLOT};
use crate::commands::parse_target;
use crate::context::Ctx;
use crate::error::HordeError;
use crate::identity::{Identity, DEFAULT_WARBAND_PREFIX};
use crate::locks;
use crate::mux::{signal_session, Mux};
use crate::nudge;
use crate::session::{SessionManager, SessionState, StartOpts};

/// Marker file that pauses all scout actions.
const PAUSE_FILE: &str = ".paused";

/// How long a hooked bead may sit untouched before the stale-hooks scan
/// considers unhooking it (days).
const DEFAULT_STALE_AGE_DAYS: i64 = 3;

#[derive(Debug, Subcommand)]
pub enum ShamanCommand {
    /// Start the shaman session
    Start {
        #[arg(long)]
        kill_existing: bool,
        #[arg(long)]
        account: Option<String>,
    },
    /// Stop the shaman session
    Stop,
    /// Restart the shaman session
    Restart,
    /// Start if absent, then attach
    Summon,
    /// Session and pause state
    Status,
    /// Ping the shaman pane; --interval keeps pinging until interrupted
    Heartbeat {
        #[arg(long)]
        interval: Option<u64>,
    },
    /// Pause scout actions (heartbeat, health-check, stale-hooks)
    Pause,
    /// Resume scout actions
    Resume,
    /// Ping an agent and wait for its health reply; exit 2 recommends
    /// force-kill
    HealthCheck {
        agent: String,
        #[arg(long, default_value_t = 30)]
        timeout: u64,
    },
    /// Kill an agent's session and release its lock
    ForceKill {
        agent: String,
        /// Skip the confirmation prompt
        #[arg(long)]
        yes: bool,
    },
    /// Unhook beads whose workers are long gone
    StaleHooks {
        #[arg(long, default_value_t = DEFAULT_STALE_AGE_DAYS)]
        max_age: i64,
        #[arg(long)]
        dry_run: bool,
    },
}

impl ShamanCommand {
    pub fn execute(&self) -> anyhow::Result<()> {
        let ctx = Ctx::from_process(None)?;
        match self {
            ShamanCommand::Start {
                kill_existing,
                account,
            } => with_manager(&ctx, |manager| {
                let session = manager.start(
                    &Identity::shaman(),
                    DEFAULT_WARBAND_PREFIX,
                    &StartOpts {
                        kill_existing: *kill_existing,
                        account: account.clone(),
                        ..StartOpts::default()
                    },
                )?;
                eprintln!("✓ started {session}");
                Ok(())
            }),
            ShamanCommand::Stop => with_manager(&ctx, |manager| {
                if manager.stop(&Identity::shaman(), DEFAULT_WARBAND_PREFIX)? {
                    eprintln!("✓ stopped hq-shaman");
                } else {
                    eprintln!("hq-shaman was not running");
                }
                Ok(())
            }),
            ShamanCommand::Restart => with_manager(&ctx, |manager| {
                manager.restart(
                    &Identity::shaman(),
                    DEFAULT_WARBAND_PREFIX,
                    &StartOpts::default(),
                )?;
                eprintln!("✓ restarted hq-shaman");
                Ok(())
            }),
            ShamanCommand::Summon => with_manager(&ctx, |manager| {
                manager.attach(
                    &Identity::shaman(),
                    DEFAULT_WARBAND_PREFIX,
                    &StartOpts::default(),
                )?;
                Ok(())
            }),
            ShamanCommand::Status => status(&ctx),
            ShamanCommand::Heartbeat { interval } => heartbeat(&ctx, *interval),
            ShamanCommand::Pause => {
                std::fs::create_dir_all(ctx.root().join("shaman"))?;
                std::fs::write(pause_path(&ctx), chrono::Utc::now().to_rfc3339())?;
                eprintln!("✓ shaman paused");
                Ok(())
            }
            ShamanCommand::Resume => {
                let _ = std::fs::remove_file(pause_path(&ctx));
                eprintln!("✓ shaman resumed");
                Ok(())
            }
            ShamanCommand::HealthCheck { agent, timeout } => {
                health_check(&ctx, agent, Duration::from_secs(*timeout))
            }
            ShamanCommand::ForceKill { agent, yes } => force_kill(&ctx, agent, *yes),
            ShamanCommand::StaleHooks { max_age, dry_run } => {
                stale_hooks(&ctx, *max_age, *dry_run)
            }
        }
    }
}

/// The shaman's agent-bead lives in the encampment-level database.
fn with_manager<R>(
    ctx: &Ctx,
    f: impl FnOnce(&SessionManager) -> anyhow::Result<R>,
) -> anyhow::Result<R> {
    let store = RlStore::new(ctx.root());
    let manager = SessionManager::new(&ctx.mux, &store, &ctx.feed, ctx.root(), &ctx.encampment);
    f(&manager)
}

fn pause_path(ctx: &Ctx) -> PathBuf {
    ctx.root().join("shaman").join(PAUSE_FILE)
}

pub fn is_paused(ctx: &Ctx) -> bool {
    pause_path(ctx).exists()
}

fn require_unpaused(ctx: &Ctx) -> anyhow::Result<()> {
    if is_paused(ctx) {
        return Err(HordeError::Paused.into());
    }
    Ok(())
}

fn status(ctx: &Ctx) -> anyhow::Result<()> {
    let state = with_manager(ctx, |manager| {
        manager.status(&Identity::shaman(), DEFAULT_WARBAND_PREFIX)
    })?;
    match state {
        SessionState::Running { pid } => println!("hq-shaman running (pid {pid})"),
        SessionState::LockedNoSession { pid } => {
            println!("hq-shaman locked by pid {pid} but no session");
        }
        SessionState::Absent => println!("hq-shaman absent"),
    }
    println!("paused: {}", is_paused(ctx));
    Ok(())
}

fn heartbeat(ctx: &Ctx, interval: Option<u64>) -> anyhow::Result<()> {
    require_unpaused(ctx)?;

    let ping = |ctx: &Ctx| -> anyhow::Result<()> {
        if !ctx.mux.has_session("hq-shaman")? {
            anyhow::bail!("hq-shaman is not running");
        }
        signal_session(&ctx.mux, "hq-shaman", "Heartbeat: report patrol status by mail.")?;
        ctx.feed.emit(
            "patrol",
            &ctx.actor(),
            serde_json::json!({"kind": "heartbeat"}),
        );
        Ok(())
    };

    let Some(every) = interval else {
        ping(ctx)?;
        eprintln!("✓ heartbeat sent");
        return Ok(());
    };

    // Tick once a second against a deadline instead of one long sleep, so
    // interrupts land promptly and wall-clock jumps don't stretch waits.
    let stop = Arc::new(AtomicBool::new(false));
    let handler_flag = stop.clone();
    ctrlc::set_handler(move || handler_flag.store(true, Ordering::SeqCst))?;

    while !stop.load(Ordering::SeqCst) {
        if is_paused(ctx) {
            eprintln!("shaman paused; heartbeat loop exiting");
            break;
        }
        if let Err(e) = ping(ctx) {
            eprintln!("heartbeat failed: {e:#}");
        }
        let deadline = Instant::now() + Duration::from_secs(every);
        while Instant::now() < deadline && !stop.load(Ordering::SeqCst) {
            std::thread::sleep(Duration::from_secs(1));
        }
    }
    Ok(())
}

fn health_check(ctx: &Ctx, agent: &str, timeout: Duration) -> anyhow::Result<()> {
    require_unpaused(ctx)?;

    let identity = parse_target(ctx, agent)?;
    let prefix = ctx.prefix_of(&identity);
    let session = identity.session_name(&prefix);

    if !ctx.mux.has_session(&session)? {
        return Err(HordeError::NotFound {
            what: "session",
            id: session,
        }
        .into());
    }

    let prompt = nudge::health_check(ctx.bin(), &session)?;
    signal_session(&ctx.mux, &session, &prompt)?;

    let shaman_inbox = ctx.mailbox("shaman");
    let expected = format!("HEALTH_OK {session}");
    let deadline = Instant::now() + timeout;
    loop {
        for message in shaman_inbox.list_all()? {
            if message.subject.trim() == expected {
                shaman_inbox.delete(&message.id)?;
                println!("✓ {session} healthy");
                ctx.feed.emit(
                    "patrol",
                    &ctx.actor(),
                    serde_json::json!({"kind": "health_check", "session": session, "healthy": true}),
                );
                return Ok(());
            }
        }
        if Instant::now() >= deadline {
            break;
        }
        std::thread::sleep(Duration::from_secs(1));
    }

    ctx.feed.emit(
        "patrol",
        &ctx.actor(),
        serde_json::json!({"kind": "health_check", "session": session, "healthy": false}),
    );
    Err(HordeError::HealthKillRecommended {
        agent: identity.address(),
    }
    .into())
}

fn force_kill(ctx: &Ctx, agent: &str, yes: bool) -> anyhow::Result<()> {
    let identity = parse_target(ctx, agent)?;
    let prefix = ctx.prefix_of(&identity);
    let session = identity.session_name(&prefix);

    if !yes {
        let confirmed = dialoguer::Confirm::new()
            .with_prompt(format!("Kill {session} and release its lock?"))
            .default(false)
            .interact()?;
        if !confirmed {
            eprintln!("aborted");
            return Ok(());
        }
    }

    let store = ctx.agent_store_of(&identity);
    let manager = SessionManager::new(&ctx.mux, &store, &ctx.feed, ctx.root(), &ctx.encampment);
    manager.stop(&identity, &prefix)?;
    let _ = store.agent_state(&identity.agent_bead_id(&prefix), "killed");
    ctx.feed.emit(
        "patrol",
        &ctx.actor(),
        serde_json::json!({"kind": "force_kill", "session": session}),
    );
    eprintln!("✓ killed {session}");
    Ok(())
}

/// Unhook beads whose assignee has neither a live lock nor a pane.
fn stale_hooks(ctx: &Ctx, max_age_days: i64, dry_run: bool) -> anyhow::Result<()> {
    require_unpaused(ctx)?;

    let cutoff = chrono::Utc::now() - chrono::Duration::days(max_age_days);
    let mut unhooked = 0;
    let mut scanned = 0;

    let mut stores: Vec<(String, RlStore)> = vec![("hq".to_string(), RlStore::new(ctx.root()))];
    for warband in ctx.registry.names() {
        stores.push((warband.clone(), RlStore::new(&ctx.warband_clone(&warband))));
    }

    for (scope, store) in &stores {
        let hooked = match store.list(&BeadFilter {
            status: Some(BeadStatus::Hooked),
            ..BeadFilter::default()
        }) {
            Ok(beads) => beads,
            Err(e) => {
                tracing::warn!(scope = %scope, error = %e, "stale-hooks scan skipped");
                continue;
            }
        };

        for bead in hooked {
            scanned += 1;
            let Some(updated_at) = bead.updated_at else {
                continue;
            };
            if updated_at > cutoff {
                continue;
            }
            let Ok(identity) = Identity::parse(&bead.assignee) else {
                continue;
            };

            // Only unhook when the owning worker is demonstrably absent.
            let home = identity.home_dir(ctx.root());
            if let Ok(Some(lock)) = locks::read(&home) {
                if !lock.is_stale() {
                    continue;
                }
            }
            let prefix = ctx.prefix_of(&identity);
            if ctx.mux.has_session(&identity.session_name(&prefix))? {
                continue;
            }

            if dry_run {
                println!("would unhook {} (assignee {})", bead.id, bead.assignee);
                unhooked += 1;
                continue;
            }

            store.update(
                &bead.id,
                &crate::beads::BeadPatch {
                    status: Some(BeadStatus::Open),
                    ..crate::beads::BeadPatch::default()
                },
            )?;
            let _ = store.set_slot(&identity.agent_bead_id(&prefix), BANNER_SLOT, None);
            println!("unhooked {} (assignee {})", bead.id, bead.assignee);
            unhooked += 1;
        }
    }

    ctx.feed.emit(
        "patrol",
        &ctx.actor(),
        serde_json::json!({"kind": "stale_hooks", "scanned": scanned, "unhooked": unhooked, "dry_run": dry_run}),
    );
    println!(
        "{unhooked} stale hook(s) {} of {scanned} hooked",
        if dry_run { "found" } else { "unhooked" }
    );
    Ok(())
}

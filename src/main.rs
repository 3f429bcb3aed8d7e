use std::process::ExitCode;

use clap::{Parser, Subcommand};

use horde::commands::activity::ActivityCommand;
use horde::commands::agents::AgentsCommand;
use horde::commands::broadcast::BroadcastArgs;
use horde::commands::callbacks::CallbacksCommand;
use horde::commands::charge::ChargeArgs;
use horde::commands::doctor::DoctorArgs;
use horde::commands::handoff::HandoffArgs;
use horde::commands::hook::HookArgs;
use horde::commands::mail::MailCommand;
use horde::commands::role::RoleCommand;
use horde::commands::sessions::{AttachArgs, StartArgs, StopArgs};
use horde::commands::shaman::ShamanCommand;
use horde::commands::signal::SignalArgs;
use horde::{error, telemetry};

#[derive(Debug, Parser)]
#[command(name = "hd", version, about = "Multi-agent workspace orchestrator")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Attach a bead (or ritual) to an agent's hook and signal work-start
    Charge(ChargeArgs),
    /// Show the caller's hook, or attach a bead to it
    Hook(HookArgs),
    /// Attach a bead and restart this identity's session for handoff
    Handoff(HandoffArgs),
    /// Deliver a message to a pane via the reliable paste protocol
    Signal(SignalArgs),
    /// Signal every live worker (or every agent with --all)
    Broadcast(BroadcastArgs),
    /// List live agent sessions, report collisions, clean stale locks
    Agents {
        #[command(subcommand)]
        command: Option<AgentsCommand>,
    },
    /// Identity introspection
    Role {
        #[command(subcommand)]
        command: Option<RoleCommand>,
    },
    /// Print the effective sender address
    Whoami,
    /// Process inbound callback messages
    Callbacks {
        #[command(subcommand)]
        command: CallbacksCommand,
    },
    /// Shaman lifecycle and patrol operations
    Shaman {
        #[command(subcommand)]
        command: ShamanCommand,
    },
    /// Workspace health checks
    Doctor(DoctorArgs),
    /// Emit an event into the telemetry feed
    Activity {
        #[command(subcommand)]
        command: ActivityCommand,
    },
    /// Send, read, and search mailbox messages
    Mail {
        #[command(subcommand)]
        command: MailCommand,
    },
    /// Start an agent session
    Start(StartArgs),
    /// Stop an agent session
    Stop(StopArgs),
    /// Attach to an agent session, starting it if needed
    Attach(AttachArgs),
}

impl Commands {
    const fn name(&self) -> &'static str {
        match self {
            Self::Charge(_) => "charge",
            Self::Hook(_) => "hook",
            Self::Handoff(_) => "handoff",
            Self::Signal(_) => "signal",
            Self::Broadcast(_) => "broadcast",
            Self::Agents { .. } => "agents",
            Self::Role { .. } => "role",
            Self::Whoami => "whoami",
            Self::Callbacks { .. } => "callbacks",
            Self::Shaman { .. } => "shaman",
            Self::Doctor(_) => "doctor",
            Self::Activity { .. } => "activity",
            Self::Mail { .. } => "mail",
            Self::Start(_) => "start",
            Self::Stop(_) => "stop",
            Self::Attach(_) => "attach",
        }
    }
}

fn main() -> ExitCode {
    let _telemetry = telemetry::init();

    let cli = Cli::parse();

    let _span = tracing::info_span!("command", name = cli.command.name()).entered();

    let result = match cli.command {
        Commands::Charge(args) => args.execute(),
        Commands::Hook(args) => args.execute(),
        Commands::Handoff(args) => args.execute(),
        Commands::Signal(args) => args.execute(),
        Commands::Broadcast(args) => args.execute(),
        Commands::Agents { command } => command.unwrap_or_default().execute(),
        Commands::Role { command } => command.unwrap_or_default().execute(),
        Commands::Whoami => horde::commands::role::run_whoami(),
        Commands::Callbacks { command } => command.execute(),
        Commands::Shaman { command } => command.execute(),
        Commands::Doctor(args) => args.execute(),
        Commands::Activity { command } => command.execute(),
        Commands::Mail { command } => command.execute(),
        Commands::Start(args) => args.execute(),
        Commands::Stop(args) => args.execute(),
        Commands::Attach(args) => args.execute(),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("✗ {e:#}");
            if let Some(horde_err) = e.downcast_ref::<error::HordeError>() {
                ExitCode::from(horde_err.exit_code())
            } else {
                ExitCode::FAILURE
            }
        }
    }
}

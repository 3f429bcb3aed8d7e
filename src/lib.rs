//! Horde — multi-agent workspace orchestrator.
//!
//! The `hd` binary steers a fleet of interactive AI agents hosted in tmux
//! panes across three planes: sessions (tmux), work (an external bead store
//! driven through the `rl` tool), and messaging (per-identity mailboxes).

pub mod beads;
pub mod callbacks;
pub mod commands;
pub mod config;
pub mod context;
pub mod dispatch;
pub mod error;
pub mod feed;
pub mod identity;
pub mod locks;
pub mod mailbox;
pub mod mux;
pub mod nudge;
pub mod pool;
pub mod provision;
pub mod resolve;
pub mod session;
pub mod subprocess;
pub mod telemetry;

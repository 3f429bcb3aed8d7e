pub mod activity;
pub mod agents;
pub mod broadcast;
pub mod callbacks;
pub mod charge;
pub mod doctor;
pub mod handoff;
pub mod hook;
pub mod mail;
pub mod role;
pub mod sessions;
pub mod shaman;
pub mod signal;

use crate::context::Ctx;
use crate::identity::Identity;

/// Parse a CLI target: `.` means the caller's own identity.
pub fn parse_target(ctx: &Ctx, target: &str) -> anyhow::Result<Identity> {
    if target == "." {
        Ok(ctx.info.identity.clone())
    } else {
        Identity::parse(target)
    }
}

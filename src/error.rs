/// Errors the orchestrator core recognizes.
///
/// Every fallible path in the crate bottoms out in one of these kinds; the
/// command layer downcasts from `anyhow::Error` to pick the process exit
/// code and the one-line `✗` message printed to stderr.
#[derive(Debug, thiserror::Error)]
pub enum HordeError {
    #[error("not inside an encampment (no warchief/encampment.json above {dir})")]
    NotInWorkspace { dir: String },

    #[error("{what} not found: {id}")]
    NotFound { what: &'static str, id: String },

    #[error("session {session} already running (pid {pid})")]
    SessionRunning { session: String, pid: u32 },

    #[error("{agent} already has hooked bead {bead}; pass --force to replace it")]
    HookOccupied { agent: String, bead: String },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("transient failure: {0}")]
    Transient(String),

    #[error("bead {bead} did not resolve through redirect: {detail}")]
    BeadRouting { bead: String, detail: String },

    #[error("slot update for {agent_bead} crossed databases: {detail}")]
    CrossDatabase { agent_bead: String, detail: String },

    #[error("shaman is paused")]
    Paused,

    #[error("health check for {agent} recommends force-kill")]
    HealthKillRecommended { agent: String },

    #[error("tool not found: {tool}")]
    ToolNotFound { tool: String },

    #[error("{tool} failed (exit {code}): {message}")]
    ToolFailed {
        tool: String,
        code: i32,
        message: String,
    },

    #[error("{tool} timed out after {timeout_secs}s")]
    Timeout { tool: String, timeout_secs: u64 },
}

impl HordeError {
    /// Process exit code: 2 means "health check recommends force-kill",
    /// everything else is the generic failure code.
    pub fn exit_code(&self) -> u8 {
        match self {
            HordeError::HealthKillRecommended { .. } => 2,
            _ => 1,
        }
    }

    /// True for kinds worth one automatic retry in long-poll loops.
    pub fn is_transient(&self) -> bool {
        matches!(self, HordeError::Transient(_) | HordeError::Timeout { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn health_kill_exits_two() {
        let err = HordeError::HealthKillRecommended {
            agent: "horde/raiders/Toast".into(),
        };
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn generic_errors_exit_one() {
        let err = HordeError::NotFound {
            what: "bead",
            id: "gp-123".into(),
        };
        assert_eq!(err.exit_code(), 1);
    }

    #[test]
    fn transient_kinds() {
        assert!(HordeError::Transient("io".into()).is_transient());
        assert!(
            HordeError::Timeout {
                tool: "rl".into(),
                timeout_secs: 5
            }
            .is_transient()
        );
        assert!(!HordeError::Paused.is_transient());
    }
}

//! Agent session lifecycle.
//!
//! One identity, one pane, at most one live process. The lock is acquired
//! before the session exists and handed to the pane's pid once it does, so
//! liveness outlasts the `hd` invocation that did the starting.
//!
//! Lifecycle: absent → starting → running → stopped, with any startup
//! failure tearing down both the half-made session and the lock.

use std::path::Path;
use std::time::Duration;

use crate::beads::{description_set, BeadStore, CreateBead};
use crate::config::EncampmentConfig;
use crate::error::HordeError;
use crate::feed::FeedWriter;
use crate::identity::Identity;
use crate::locks;
use crate::mux::{
    accept_bypass_permissions_warning, signal_session_with_debounce, wait_for_command, Mux,
    PASTE_DEBOUNCE, READY_TIMEOUT,
};
use crate::nudge;

/// Pause between interrupt and kill during stop.
const STOP_GRACE: Duration = Duration::from_millis(300);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Absent,
    Running { pid: u32 },
    /// A live lock with no pane behind it: the owner is still setting up,
    /// or something died half way. Start refuses until it clears.
    LockedNoSession { pid: u32 },
}

#[derive(Debug, Clone, Default)]
pub struct StartOpts {
    pub kill_existing: bool,
    /// Previous session name, surfaced in the startup nudge for handoff
    /// discovery.
    pub predecessor: Option<String>,
    /// Account subdirectory under `warchief/accounts/`.
    pub account: Option<String>,
    /// Override the configured agent program.
    pub program: Option<String>,
}

pub struct SessionManager<'a> {
    pub mux: &'a dyn Mux,
    pub store: &'a dyn BeadStore,
    pub feed: &'a FeedWriter,
    pub root: &'a Path,
    pub encampment: &'a EncampmentConfig,
    /// Overridable for tests; production uses the protocol constants.
    pub paste_debounce: Duration,
    pub ready_timeout: Duration,
}

impl<'a> SessionManager<'a> {
    pub fn new(
        mux: &'a dyn Mux,
        store: &'a dyn BeadStore,
        feed: &'a FeedWriter,
        root: &'a Path,
        encampment: &'a EncampmentConfig,
    ) -> Self {
        Self {
            mux,
            store,
            feed,
            root,
            encampment,
            paste_debounce: PASTE_DEBOUNCE,
            ready_timeout: READY_TIMEOUT,
        }
    }

    pub fn status(&self, identity: &Identity, prefix: &str) -> anyhow::Result<SessionState> {
        let session = identity.session_name(prefix);
        let home = identity.home_dir(self.root);
        let lock = locks::read(&home)?;
        if self.mux.has_session(&session)? {
            let pid = lock.map_or(0, |l| l.pid);
            return Ok(SessionState::Running { pid });
        }
        match lock {
            Some(info) if !info.is_stale() => {
                Ok(SessionState::LockedNoSession { pid: info.pid })
            }
            _ => Ok(SessionState::Absent),
        }
    }

    /// Start the identity's session. Returns the session name.
    pub fn start(
        &self,
        identity: &Identity,
        prefix: &str,
        opts: &StartOpts,
    ) -> anyhow::Result<String> {
        let session = identity.session_name(prefix);

        if self.mux.has_session(&session)? {
            if opts.kill_existing {
                self.stop(identity, prefix)?;
            } else {
                let home = identity.home_dir(self.root);
                let pid = locks::read(&home)?.map_or(0, |l| l.pid);
                return Err(HordeError::SessionRunning {
                    session,
                    pid,
                }
                .into());
            }
        }

        let home = identity.home_dir(self.root);
        std::fs::create_dir_all(&home)?;

        // Lock before session creation, always.
        let mut lock = locks::acquire(&home, &session)?;

        match self.start_locked(identity, prefix, &session, &home, &mut lock, opts) {
            Ok(()) => Ok(session),
            Err(e) => {
                // Startup aborted: no half-made session, no orphaned lock.
                if self.mux.has_session(&session).unwrap_or(false) {
                    let _ = self.mux.kill_session(&session);
                }
                let _ = locks::release(lock);
                Err(e)
            }
        }
    }

    fn start_locked(
        &self,
        identity: &Identity,
        prefix: &str,
        session: &str,
        home: &Path,
        lock: &mut locks::Lock,
        opts: &StartOpts,
    ) -> anyhow::Result<()> {
        let runtime = &self.encampment.runtime;
        let program = opts
            .program
            .clone()
            .unwrap_or_else(|| runtime.program.clone());
        let mut argv = vec![program];
        argv.extend(runtime.args.iter().cloned());

        self.mux.new_session_with_command(session, home, &argv)?;

        self.mux
            .set_environment(session, crate::resolve::ENV_ROLE, &identity.address())?;
        self.mux.set_environment(
            session,
            crate::resolve::ENV_ENCAMPMENT,
            &self.root.display().to_string(),
        )?;
        if let Some(account) = opts.account.as_deref().or(runtime.account_dir.as_deref()) {
            let dir = self
                .root
                .join("warchief")
                .join("accounts")
                .join(account);
            self.mux
                .set_environment(session, "CLAUDE_CONFIG_DIR", &dir.display().to_string())?;
        }

        wait_for_command(self.mux, session, &runtime.shells, self.ready_timeout)?;
        accept_bypass_permissions_warning(self.mux, session);

        // The pane owns the lock from here on.
        let pid = self.mux.pane_pid(session)?;
        locks::transfer_to(lock, pid)?;

        self.ensure_agent_bead(identity, prefix)?;

        let bin = &self.encampment.binary_name;
        let startup = nudge::startup(
            bin,
            identity,
            &self.encampment.name,
            &home.display().to_string(),
            opts.predecessor.as_deref(),
        )?;
        signal_session_with_debounce(self.mux, session, &startup, self.paste_debounce)?;
        self.feed.emit(
            "nudge",
            &identity.address(),
            serde_json::json!({"session": session, "kind": "startup"}),
        );

        let propulsion = nudge::propulsion(bin, identity)?;
        signal_session_with_debounce(self.mux, session, &propulsion, self.paste_debounce)?;
        self.feed.emit(
            "nudge",
            &identity.address(),
            serde_json::json!({"session": session, "kind": "propulsion"}),
        );

        self.feed.emit(
            "spawn",
            &identity.address(),
            serde_json::json!({"session": session, "pid": pid}),
        );
        Ok(())
    }

    /// Best-effort interrupt, short grace, then kill and release.
    /// Returns false when there was nothing to stop.
    pub fn stop(&self, identity: &Identity, prefix: &str) -> anyhow::Result<bool> {
        let session = identity.session_name(prefix);
        let home = identity.home_dir(self.root);

        if !self.mux.has_session(&session)? {
            // Clear any leftover lock so the next start isn't blocked.
            locks::force_release(&home);
            return Ok(false);
        }

        let _ = self.mux.send_keys_raw(&session, "C-c");
        std::thread::sleep(STOP_GRACE);
        self.mux.kill_session(&session)?;
        locks::force_release(&home);

        let _ = self
            .store
            .agent_state(&identity.agent_bead_id(prefix), "stopped");
        Ok(true)
    }

    pub fn restart(
        &self,
        identity: &Identity,
        prefix: &str,
        opts: &StartOpts,
    ) -> anyhow::Result<String> {
        self.stop(identity, prefix)?;
        self.start(identity, prefix, opts)
    }

    /// Attach the caller's terminal, starting the session first if needed.
    pub fn attach(
        &self,
        identity: &Identity,
        prefix: &str,
        opts: &StartOpts,
    ) -> anyhow::Result<String> {
        let session = identity.session_name(prefix);
        if !self.mux.has_session(&session)? {
            self.start(identity, prefix, opts)?;
        }
        self.mux.attach(&session)?;
        Ok(session)
    }

    /// The agent-bead is opened on first session start; later starts reuse
    /// it and just flip its state.
    fn ensure_agent_bead(&self, identity: &Identity, prefix: &str) -> anyhow::Result<()> {
        let bead_id = identity.agent_bead_id(prefix);
        if !self.store.exists(&bead_id)? {
            let mut description = description_set("", "role", identity.role().as_str());
            if let Some(warband) = identity.warband() {
                description = description_set(&description, "warband", warband);
            }
            self.store.create(&CreateBead {
                id: Some(bead_id.clone()),
                title: identity.address(),
                bead_type: "agent".to_string(),
                description,
                ..CreateBead::default()
            })?;
        }
        let _ = self.store.agent_state(&bead_id, "active");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::beads::testing::MemoryStore;
    use crate::locks::LOCK_FILE;
    use crate::mux::testing::{Call, FakeMux};

    struct Fixture {
        root: tempfile::TempDir,
        encampment: EncampmentConfig,
        feed: FeedWriter,
    }

    impl Fixture {
        fn new() -> Self {
            let root = tempfile::tempdir().unwrap();
            let feed = FeedWriter::new(root.path());
            Self {
                root,
                encampment: EncampmentConfig::default(),
                feed,
            }
        }

        fn manager<'a>(
            &'a self,
            mux: &'a FakeMux,
            store: &'a MemoryStore,
        ) -> SessionManager<'a> {
            let mut mgr =
                SessionManager::new(mux, store, &self.feed, self.root.path(), &self.encampment);
            mgr.paste_debounce = Duration::from_millis(1);
            mgr.ready_timeout = Duration::from_millis(100);
            mgr
        }
    }

    fn toast() -> Identity {
        Identity::raider("horde", "Toast").unwrap()
    }

    #[test]
    fn start_creates_session_lock_and_nudges() {
        let fx = Fixture::new();
        let mux = FakeMux::new();
        let store = MemoryStore::new();
        let mgr = fx.manager(&mux, &store);

        let session = mgr.start(&toast(), "hd", &StartOpts::default()).unwrap();
        assert_eq!(session, "hd-horde-Toast");

        let home = toast().home_dir(fx.root.path());
        assert!(home.join(LOCK_FILE).exists());
        let lock = locks::read(&home).unwrap().unwrap();
        assert_eq!(lock.session_id, "hd-horde-Toast");
        assert_eq!(lock.pid, std::process::id());

        // Agent-bead opened on first start.
        assert!(store.get("hd-horde-Toast").is_some());

        // Two nudges, each literal-then-Enter.
        let calls = mux.calls();
        let literal_count = calls
            .iter()
            .filter(|c| matches!(c, Call::SendLiteral(..)))
            .count();
        let enter_count = calls
            .iter()
            .filter(|c| matches!(c, Call::SendRaw(_, k) if k == "Enter"))
            .count();
        assert_eq!(literal_count, 2);
        assert_eq!(enter_count, 2);
    }

    #[test]
    fn second_start_reports_running() {
        let fx = Fixture::new();
        let mux = FakeMux::new();
        let store = MemoryStore::new();
        let mgr = fx.manager(&mux, &store);

        mgr.start(&toast(), "hd", &StartOpts::default()).unwrap();
        let err = mgr
            .start(&toast(), "hd", &StartOpts::default())
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<HordeError>(),
            Some(HordeError::SessionRunning { .. })
        ));
    }

    #[test]
    fn kill_existing_replaces_session() {
        let fx = Fixture::new();
        let mux = FakeMux::new();
        let store = MemoryStore::new();
        let mgr = fx.manager(&mux, &store);

        mgr.start(&toast(), "hd", &StartOpts::default()).unwrap();
        let opts = StartOpts {
            kill_existing: true,
            ..StartOpts::default()
        };
        mgr.start(&toast(), "hd", &opts).unwrap();
        assert!(mux
            .calls()
            .contains(&Call::KillSession("hd-horde-Toast".into())));
        assert_eq!(
            mgr.status(&toast(), "hd").unwrap(),
            SessionState::Running {
                pid: std::process::id()
            }
        );
    }

    #[test]
    fn stop_kills_and_releases() {
        let fx = Fixture::new();
        let mux = FakeMux::new();
        let store = MemoryStore::new();
        let mgr = fx.manager(&mux, &store);

        mgr.start(&toast(), "hd", &StartOpts::default()).unwrap();
        assert!(mgr.stop(&toast(), "hd").unwrap());

        let home = toast().home_dir(fx.root.path());
        assert!(!home.join(LOCK_FILE).exists());
        assert_eq!(mgr.status(&toast(), "hd").unwrap(), SessionState::Absent);
    }

    #[test]
    fn stop_absent_is_noop() {
        let fx = Fixture::new();
        let mux = FakeMux::new();
        let store = MemoryStore::new();
        let mgr = fx.manager(&mux, &store);
        assert!(!mgr.stop(&toast(), "hd").unwrap());
    }

    #[test]
    fn failed_readiness_releases_lock_and_session() {
        let fx = Fixture::new();
        let mux = FakeMux::new();
        // Pane never leaves the shell.
        *mux.foreground.lock().unwrap() = "bash".to_string();
        let store = MemoryStore::new();
        let mgr = fx.manager(&mux, &store);

        let err = mgr
            .start(&toast(), "hd", &StartOpts::default())
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<HordeError>(),
            Some(HordeError::Timeout { .. })
        ));

        let home = toast().home_dir(fx.root.path());
        assert!(!home.join(LOCK_FILE).exists());
        assert!(!mux.has_session("hd-horde-Toast").unwrap());

        // Recovery: a later start succeeds.
        *mux.foreground.lock().unwrap() = "claude".to_string();
        mgr.start(&toast(), "hd", &StartOpts::default()).unwrap();
    }

    #[test]
    fn startup_nudge_names_predecessor() {
        let fx = Fixture::new();
        let mux = FakeMux::new();
        let store = MemoryStore::new();
        let mgr = fx.manager(&mux, &store);

        let opts = StartOpts {
            predecessor: Some("hd-horde-Toast".into()),
            ..StartOpts::default()
        };
        mgr.start(&toast(), "hd", &opts).unwrap();
        let found = mux.calls().iter().any(|c| {
            matches!(c, Call::SendLiteral(_, text) if text.contains("hd-horde-Toast") && text.contains("previous session"))
        });
        assert!(found);
    }

    #[test]
    fn session_env_carries_identity_and_root() {
        let fx = Fixture::new();
        let mux = FakeMux::new();
        let store = MemoryStore::new();
        let mgr = fx.manager(&mux, &store);
        mgr.start(&toast(), "hd", &StartOpts::default()).unwrap();

        let calls = mux.calls();
        assert!(calls.contains(&Call::SetEnv(
            "hd-horde-Toast".into(),
            "HD_ROLE".into(),
            "horde/raiders/Toast".into()
        )));
        assert!(calls.iter().any(|c| matches!(
            c,
            Call::SetEnv(_, key, _) if key == "HD_ENCAMPMENT"
        )));
    }
}

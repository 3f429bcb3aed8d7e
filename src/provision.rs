//! Worker provisioning: name allocation, worktree materialization, repair.
//!
//! The provisioner only prepares a worker directory and its agent-bead; it
//! never touches the multiplexer beyond asking which names are live. The
//! session manager starts the pane afterwards.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::Context;
use rand::seq::SliceRandom;

use crate::beads::{
    description_set, BeadStatus, BeadStore, CreateBead, BANNER_SLOT, REDIRECT_FILE, RELICS_DIR,
};
use crate::config::WarbandConfig;
use crate::identity::{Identity, Role};
use crate::mux::Mux;
use crate::subprocess::run_command;

/// Serializes name allocation within one `hd` process. Cross-process
/// exclusion comes from the bead store: a name is taken iff its agent-bead
/// is open.
static ALLOC_GUARD: Mutex<()> = Mutex::new(());

/// Serializes worktree surgery against one shared clone; git does not take
/// kindly to concurrent `worktree add` on the same repository.
static GIT_GUARD: Mutex<()> = Mutex::new(());

#[derive(Debug, Clone, Default)]
pub struct MaterializeOpts {
    pub banner_bead: Option<String>,
    /// Branch to base the worktree on; defaults to the warband's
    /// `default_branch`.
    pub base_branch: Option<String>,
}

pub struct Provisioner<'a> {
    pub store: &'a dyn BeadStore,
    pub mux: &'a dyn Mux,
    pub root: &'a Path,
}

impl Provisioner<'_> {
    /// Pick an unused worker name from the warband's pool.
    ///
    /// The chosen name's agent-bead is opened before the guard drops, so
    /// concurrent allocators (in this process or another) see it as taken.
    pub fn allocate(
        &self,
        warband: &str,
        role: Role,
        config: &WarbandConfig,
    ) -> anyhow::Result<String> {
        let _guard = ALLOC_GUARD.lock().unwrap();

        let mut pool = config.name_pool.clone();
        pool.shuffle(&mut rand::rng());

        for name in &pool {
            let identity = worker_identity(warband, name, role)?;
            if self.mux.has_session(&identity.session_name(&config.prefix))? {
                continue;
            }
            let bead_id = identity.agent_bead_id(&config.prefix);
            match self.store.show(&bead_id) {
                // Closed agent-bead means the worker was removed; reusable.
                Ok(bead) if bead.status != BeadStatus::Closed => continue,
                _ => {}
            }
            self.open_agent_bead(&identity, &config.prefix, &MaterializeOpts::default())?;
            return Ok(name.clone());
        }
        anyhow::bail!("name pool for warband {warband} is exhausted")
    }

    /// Create the worker's worktree, install the relics redirect, and open
    /// its agent-bead. Returns the worker directory. An already-present
    /// directory means a stale worker; it goes through [`Self::repair`].
    pub fn materialize(
        &self,
        warband: &str,
        name: &str,
        role: Role,
        config: &WarbandConfig,
        opts: &MaterializeOpts,
    ) -> anyhow::Result<PathBuf> {
        let identity = worker_identity(warband, name, role)?;
        if identity.home_dir(self.root).exists() {
            return self.repair(warband, name, role, config, false);
        }
        self.materialize_fresh(warband, name, role, config, opts)
    }

    fn materialize_fresh(
        &self,
        warband: &str,
        name: &str,
        role: Role,
        config: &WarbandConfig,
        opts: &MaterializeOpts,
    ) -> anyhow::Result<PathBuf> {
        let identity = worker_identity(warband, name, role)?;
        let worker_dir = identity.home_dir(self.root);
        let main_clone = self.root.join(warband).join("warchief").join("warband");

        if let Some(parent) = worker_dir.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }

        let branch = format!("{}/{name}", role_segment(role));
        let base = opts
            .base_branch
            .clone()
            .unwrap_or_else(|| config.default_branch.clone());
        {
            let _git = GIT_GUARD.lock().unwrap();
            run_command(
                "git",
                &[
                    "worktree",
                    "add",
                    "-B",
                    &branch,
                    &worker_dir.display().to_string(),
                    &base,
                ],
                Some(&main_clone),
            )
            .with_context(|| format!("materializing worktree for {}", identity.address()))?;
        }

        self.install_redirect(&worker_dir)?;
        self.open_agent_bead(&identity, &config.prefix, opts)?;

        Ok(worker_dir)
    }

    /// Replace a worker whose worktree went stale: remove the old worktree
    /// (forcibly if asked) and materialize again.
    pub fn repair(
        &self,
        warband: &str,
        name: &str,
        role: Role,
        config: &WarbandConfig,
        force: bool,
    ) -> anyhow::Result<PathBuf> {
        let identity = worker_identity(warband, name, role)?;
        let worker_dir = identity.home_dir(self.root);
        let main_clone = self.root.join(warband).join("warchief").join("warband");

        if worker_dir.exists() {
            let _git = GIT_GUARD.lock().unwrap();
            let dir = worker_dir.display().to_string();
            let mut args = vec!["worktree", "remove"];
            if force {
                args.push("--force");
            }
            args.push(&dir);
            if let Err(e) = run_command("git", &args, Some(&main_clone)) {
                tracing::warn!(error = %e, "worktree remove failed, pruning");
                let _ = std::fs::remove_dir_all(&worker_dir);
                let _ = run_command("git", &["worktree", "prune"], Some(&main_clone));
            }
        }

        self.materialize_fresh(warband, name, role, config, &MaterializeOpts::default())
    }

    /// Worker databases are redirects into the warband's shared `.relics`.
    fn install_redirect(&self, worker_dir: &Path) -> anyhow::Result<()> {
        let relics = worker_dir.join(RELICS_DIR);
        std::fs::create_dir_all(&relics)
            .with_context(|| format!("creating {}", relics.display()))?;
        // worker_dir is <warband>/<kind>/<name>/warband, so the shared
        // database sits four levels up from .relics.
        std::fs::write(
            relics.join(REDIRECT_FILE),
            "../../../../warchief/warband/.relics\n",
        )?;
        Ok(())
    }

    fn open_agent_bead(
        &self,
        identity: &Identity,
        prefix: &str,
        opts: &MaterializeOpts,
    ) -> anyhow::Result<()> {
        let bead_id = identity.agent_bead_id(prefix);
        match self.store.show(&bead_id) {
            // Reclaiming a removed worker's name reopens its bead.
            Ok(bead) if bead.status == BeadStatus::Closed => {
                self.store.update(
                    &bead_id,
                    &crate::beads::BeadPatch {
                        status: Some(BeadStatus::Open),
                        ..crate::beads::BeadPatch::default()
                    },
                )?;
            }
            Ok(_) => {}
            Err(_) => {
                let mut description = description_set("", "role", identity.role().as_str());
                description = description_set(
                    &description,
                    "warband",
                    identity.warband().unwrap_or_default(),
                );
                self.store.create(&CreateBead {
                    id: Some(bead_id.clone()),
                    title: identity.address(),
                    bead_type: "agent".to_string(),
                    description,
                    ..CreateBead::default()
                })?;
            }
        }
        let _ = self.store.agent_state(&bead_id, "idle");
        if let Some(ref banner) = opts.banner_bead {
            self.store.set_slot(&bead_id, BANNER_SLOT, Some(banner))?;
        }
        Ok(())
    }
}

fn worker_identity(warband: &str, name: &str, role: Role) -> anyhow::Result<Identity> {
    match role {
        Role::Raider => Identity::raider(warband, name),
        Role::Clan => Identity::clan(warband, name),
        other => anyhow::bail!("cannot provision workers for role {other}"),
    }
}

fn role_segment(role: Role) -> &'static str {
    match role {
        Role::Clan => "clan",
        _ => "raiders",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::beads::testing::MemoryStore;
    use crate::beads::Bead;
    use crate::mux::testing::FakeMux;

    fn config() -> WarbandConfig {
        WarbandConfig {
            name_pool: vec!["Toast".into(), "Nux".into()],
            ..WarbandConfig::default()
        }
    }

    #[test]
    fn allocate_skips_open_agent_beads() {
        let root = tempfile::tempdir().unwrap();
        let mux = FakeMux::new();
        let store = MemoryStore::new();
        // Toast's agent-bead is open, so only Nux is free.
        store.seed(Bead {
            bead_type: "agent".into(),
            ..Bead::new("hd-horde-Toast")
        });

        let prov = Provisioner {
            store: &store,
            mux: &mux,
            root: root.path(),
        };
        let name = prov.allocate("horde", Role::Raider, &config()).unwrap();
        assert_eq!(name, "Nux");
    }

    #[test]
    fn allocate_skips_live_sessions() {
        let root = tempfile::tempdir().unwrap();
        let mux = FakeMux::new().with_session("hd-horde-Nux");
        let store = MemoryStore::new();
        let prov = Provisioner {
            store: &store,
            mux: &mux,
            root: root.path(),
        };
        let name = prov.allocate("horde", Role::Raider, &config()).unwrap();
        assert_eq!(name, "Toast");
    }

    #[test]
    fn allocate_reuses_closed_agent_beads() {
        let root = tempfile::tempdir().unwrap();
        let mux = FakeMux::new().with_session("hd-horde-Nux");
        let store = MemoryStore::new();
        store.seed(Bead {
            bead_type: "agent".into(),
            status: BeadStatus::Closed,
            ..Bead::new("hd-horde-Toast")
        });
        let prov = Provisioner {
            store: &store,
            mux: &mux,
            root: root.path(),
        };
        assert_eq!(
            prov.allocate("horde", Role::Raider, &config()).unwrap(),
            "Toast"
        );
    }

    #[test]
    fn exhausted_pool_errors() {
        let root = tempfile::tempdir().unwrap();
        let mux = FakeMux::new()
            .with_session("hd-horde-Toast")
            .with_session("hd-horde-Nux");
        let store = MemoryStore::new();
        let prov = Provisioner {
            store: &store,
            mux: &mux,
            root: root.path(),
        };
        let err = prov
            .allocate("horde", Role::Raider, &config())
            .unwrap_err();
        assert!(err.to_string().contains("exhausted"));
    }

    #[test]
    fn open_agent_bead_records_role_state_and_banner() {
        let root = tempfile::tempdir().unwrap();
        let mux = FakeMux::new();
        let store = MemoryStore::new();
        let prov = Provisioner {
            store: &store,
            mux: &mux,
            root: root.path(),
        };
        let identity = Identity::raider("horde", "Toast").unwrap();
        prov.open_agent_bead(
            &identity,
            "hd",
            &MaterializeOpts {
                banner_bead: Some("gp-123".into()),
                base_branch: None,
            },
        )
        .unwrap();

        let bead = store.get("hd-horde-Toast").unwrap();
        assert_eq!(bead.bead_type, "agent");
        assert_eq!(bead.description_field("role"), Some("raider"));
        assert_eq!(bead.description_field("warband"), Some("horde"));
        assert_eq!(bead.banner_bead(), Some("gp-123"));
        assert!(store
            .agent_states
            .lock()
            .unwrap()
            .contains(&("hd-horde-Toast".into(), "idle".into())));
    }

    #[test]
    fn materialize_repairs_stale_worker_dir() {
        let root = tempfile::tempdir().unwrap();
        let clone = root.path().join("horde/warchief/warband");
        std::fs::create_dir_all(&clone).unwrap();
        run_command("git", &["init", "-b", "main", "."], Some(&clone)).unwrap();
        run_command(
            "git",
            &[
                "-c",
                "user.email=hd@test",
                "-c",
                "user.name=hd",
                "commit",
                "--allow-empty",
                "-m",
                "init",
            ],
            Some(&clone),
        )
        .unwrap();

        // Leftovers from a dead worker that git no longer knows about.
        let stale = root.path().join("horde/raiders/Toast/warband");
        std::fs::create_dir_all(&stale).unwrap();
        std::fs::write(stale.join("junk.txt"), "old").unwrap();

        let mux = FakeMux::new();
        let store = MemoryStore::new();
        let prov = Provisioner {
            store: &store,
            mux: &mux,
            root: root.path(),
        };
        let dir = prov
            .materialize(
                "horde",
                "Toast",
                Role::Raider,
                &config(),
                &MaterializeOpts::default(),
            )
            .unwrap();
        assert!(dir.join(".git").exists());
        assert!(!dir.join("junk.txt").exists());
        assert!(dir.join(RELICS_DIR).join(REDIRECT_FILE).exists());
    }

    #[test]
    fn redirect_points_at_shared_database() {
        let root = tempfile::tempdir().unwrap();
        let mux = FakeMux::new();
        let store = MemoryStore::new();
        let prov = Provisioner {
            store: &store,
            mux: &mux,
            root: root.path(),
        };
        let worker_dir = root.path().join("horde/raiders/Toast/warband");
        std::fs::create_dir_all(&worker_dir).unwrap();
        prov.install_redirect(&worker_dir).unwrap();

        let shared = root.path().join("horde/warchief/warband");
        std::fs::create_dir_all(shared.join(RELICS_DIR)).unwrap();
        let resolved = crate::beads::resolve_hook_dir("gp-1", &worker_dir, root.path());
        assert_eq!(resolved, shared);
    }
}

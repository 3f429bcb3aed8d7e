//! Explicit command context.
//!
//! Everything a command needs — encampment root, resolved identity, config,
//! the tmux driver, the feed writer — is assembled once here and threaded
//! through, never read from ambient globals.

use std::path::Path;

use crate::beads::{resolve_hook_dir, BeadStore, RlStore};
use crate::callbacks::Stores;
use crate::config::{EncampmentConfig, WarbandConfig, WarbandRegistry};
use crate::identity::{Identity, DEFAULT_WARBAND_PREFIX};
use crate::feed::FeedWriter;
use crate::mailbox::Mailbox;
use crate::mux::TmuxDriver;
use crate::resolve::{resolve, EnvSnapshot, IdentityInfo};

pub struct Ctx {
    pub info: IdentityInfo,
    pub encampment: EncampmentConfig,
    pub registry: WarbandRegistry,
    pub feed: FeedWriter,
    pub mux: TmuxDriver,
}

impl Ctx {
    /// Build the context for this invocation from cwd and environment.
    pub fn from_process(explicit_identity: Option<&str>) -> anyhow::Result<Self> {
        let cwd = std::env::current_dir()?;
        let env = EnvSnapshot::from_process();
        let info = resolve(&cwd, &env, explicit_identity)?;
        let encampment = EncampmentConfig::load(&info.encampment_root)?;
        let registry = WarbandRegistry::load(&info.encampment_root)?;
        let feed = FeedWriter::new(&info.encampment_root);
        Ok(Self {
            info,
            encampment,
            registry,
            feed,
            mux: TmuxDriver::new(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.info.encampment_root
    }

    /// Effective sender address for mail and dispatch metadata.
    pub fn actor(&self) -> String {
        self.info.identity.address()
    }

    pub fn bin(&self) -> &str {
        &self.encampment.binary_name
    }

    pub fn prefix_for(&self, warband: &str) -> String {
        WarbandConfig::load(self.root(), warband)
            .map(|c| c.prefix)
            .unwrap_or_else(|_| DEFAULT_WARBAND_PREFIX.to_string())
    }

    pub fn prefix_of(&self, identity: &Identity) -> String {
        identity
            .warband()
            .map_or_else(|| DEFAULT_WARBAND_PREFIX.to_string(), |w| self.prefix_for(w))
    }

    pub fn mailbox(&self, address: &str) -> Mailbox {
        Mailbox::open(self.root(), address)
    }

    /// The store holding a target's agent-bead: the warband's shared clone,
    /// or the encampment root for hq agents.
    pub fn agent_store_of(&self, identity: &Identity) -> RlStore {
        match identity.warband() {
            Some(warband) => RlStore::new(&self.warband_clone(warband)),
            None => RlStore::new(self.root()),
        }
    }

    pub fn warband_clone(&self, warband: &str) -> std::path::PathBuf {
        self.root().join(warband).join("warchief").join("warband")
    }

    /// Resolve the store that owns a bead: redirect resolution from the
    /// caller's directory first, then the warband-root fallback sweep.
    pub fn store_for_bead(&self, bead_id: &str) -> anyhow::Result<RlStore> {
        let dir = resolve_hook_dir(bead_id, &self.info.workdir, self.root());
        let store = RlStore::new(&dir);
        match store.exists(bead_id) {
            Ok(true) => return Ok(store),
            Ok(false) => {}
            Err(e) => {
                tracing::debug!(bead = bead_id, error = %e, "hook dir probe failed");
            }
        }

        let routing_err = crate::error::HordeError::BeadRouting {
            bead: bead_id.to_string(),
            detail: format!("not in {}", dir.display()),
        };
        tracing::warn!(error = %routing_err, "trying warband roots");
        for warband in self.registry.names() {
            let candidate = RlStore::new(&self.warband_clone(&warband));
            if candidate.exists(bead_id).unwrap_or(false) {
                return Ok(candidate);
            }
        }
        let root_store = RlStore::new(self.root());
        if root_store.exists(bead_id).unwrap_or(false) {
            return Ok(root_store);
        }
        // Unverifiable bead (provisional dispatch): keep the resolved dir.
        Ok(store)
    }
}

impl Stores for Ctx {
    fn for_bead(&self, bead_id: &str) -> anyhow::Result<Box<dyn BeadStore>> {
        Ok(Box::new(self.store_for_bead(bead_id)?))
    }
}

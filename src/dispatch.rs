//! The charge engine: attach a bead to an agent's hook and signal work-start.
//!
//! One dispatch is: validate the specifier, resolve the target, guard the
//! hook, attach, set the banner slot, and signal — strictly in that order.
//! A dispatch that attaches but fails to signal is complete; the agent
//! finds the work through its inbox and `hd hook` on next startup.

use std::path::Path;
use std::time::Duration;

use crate::beads::{
    description_set, looks_like_bead_id, BeadPatch, BeadStatus, BeadStore, CreateBead,
    ATTACHED_ARGS_KEY, BANNER_SLOT, DISPATCHED_BY_KEY, NOTIFICATION_LEVEL_KEY,
};
use crate::config::{EncampmentConfig, WarbandConfig, WarbandRegistry};
use crate::error::HordeError;
use crate::feed::FeedWriter;
use crate::identity::{Identity, Role, DEFAULT_WARBAND_PREFIX};
use crate::mux::{
    accept_bypass_permissions_warning, signal_session_with_debounce, wait_for_command, Mux,
    PASTE_DEBOUNCE, READY_TIMEOUT,
};
use crate::nudge;
use crate::pool::run_parallel;
use crate::provision::{MaterializeOpts, Provisioner};
use crate::session::{SessionManager, StartOpts};

/// Ritual cooked for every raider so their agent-bead carries the standard
/// work loop.
pub const RAIDER_WORK_RITUAL: &str = "raider-work";

/// Description key linking a bead to the raid that tracks it.
pub const TRACKED_BY_KEY: &str = "tracked_by";

#[derive(Debug, Clone, Default)]
pub struct ChargeOpts {
    pub subject: Option<String>,
    pub message: Option<String>,
    pub args: Option<String>,
    pub force: bool,
    pub no_raid: bool,
    pub dry_run: bool,
    /// Attach without signaling; used by `hd hook` where the agent is the
    /// caller.
    pub no_signal: bool,
    pub account: Option<String>,
    pub program: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ChargeReport {
    pub bead: String,
    pub target: String,
    pub session: Option<String>,
    pub signaled: bool,
    pub raid: Option<String>,
    pub provisioned_worker: Option<String>,
    pub dry_run: bool,
}

/// Where a dispatch is headed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Identity(Identity),
    /// Group: auto-provision a fresh raider in this warband.
    Warband(String),
    /// The shaman's dog pool; attach records the address, execution is the
    /// shaman's business.
    ShamanDogs(Option<String>),
}

pub struct Dispatcher<'a> {
    pub root: &'a Path,
    pub mux: &'a dyn Mux,
    pub feed: &'a FeedWriter,
    pub encampment: &'a EncampmentConfig,
    pub registry: &'a WarbandRegistry,
    /// Address of whoever is dispatching; recorded on the bead.
    pub actor: String,
    /// Store resolved for the bead's hook directory.
    pub bead_store: &'a dyn BeadStore,
    /// Store holding the target's agent-bead; usually the same database.
    pub agent_store: &'a dyn BeadStore,
    pub paste_debounce: Duration,
    pub ready_timeout: Duration,
}

impl<'a> Dispatcher<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        root: &'a Path,
        mux: &'a dyn Mux,
        feed: &'a FeedWriter,
        encampment: &'a EncampmentConfig,
        registry: &'a WarbandRegistry,
        actor: String,
        bead_store: &'a dyn BeadStore,
        agent_store: &'a dyn BeadStore,
    ) -> Self {
        Self {
            root,
            mux,
            feed,
            encampment,
            registry,
            actor,
            bead_store,
            agent_store,
            paste_debounce: PASTE_DEBOUNCE,
            ready_timeout: READY_TIMEOUT,
        }
    }

    /// Entry point for `hd charge`: bead, provisional bead, or ritual.
    pub fn charge(
        &self,
        spec: &str,
        target: Option<&str>,
        self_identity: &Identity,
        vars: &[(String, String)],
        on: Option<&str>,
        opts: &ChargeOpts,
    ) -> anyhow::Result<ChargeReport> {
        // Ritual-on-bead: the post-bond root replaces the original bead.
        if let Some(on_bead) = on {
            let root_id = self.ritual_on_bead(spec, on_bead, vars)?;
            return self.charge_resolved(&root_id, false, target, self_identity, opts);
        }

        if self.bead_store.exists(spec)? {
            return self.charge_resolved(spec, false, target, self_identity, opts);
        }

        if looks_like_bead_id(spec) {
            // Cross-warband dispatch: the bead may live in a database this
            // process can't see. Accept provisionally; the attach decides.
            tracing::info!(bead = spec, "accepting unverified bead id");
            return self.charge_resolved(spec, true, target, self_identity, opts);
        }

        // Not a bead: treat as a ritual name.
        self.charge_ritual(spec, target, self_identity, vars, opts)
    }

    /// Ritual-only dispatch: invoke, wisp, then dispatch the wisp root with
    /// auto-raid off.
    pub fn charge_ritual(
        &self,
        ritual: &str,
        target: Option<&str>,
        self_identity: &Identity,
        vars: &[(String, String)],
        opts: &ChargeOpts,
    ) -> anyhow::Result<ChargeReport> {
        self.bead_store.invoke(ritual)?;
        let root_id = self.bead_store.wisp(ritual, vars)?;
        let mut opts = opts.clone();
        opts.no_raid = true;
        self.charge_resolved(&root_id, false, target, self_identity, &opts)
    }

    /// Batch dispatch: each bead goes to a freshly provisioned raider in
    /// `warband`, independently and concurrently.
    pub fn charge_batch(
        &self,
        beads: &[String],
        warband: &str,
        self_identity: &Identity,
        opts: &ChargeOpts,
    ) -> Vec<(String, anyhow::Result<ChargeReport>)> {
        let results = run_parallel(
            beads.to_vec(),
            self.encampment.effective_pool_size(),
            |bead| {
                self.charge_resolved(&bead, false, Some(warband), self_identity, opts)
            },
        );
        beads.iter().cloned().zip(results).collect()
    }

    /// Resolve a target string against self, the warband registry, and the
    /// session plane.
    pub fn resolve_target(
        &self,
        target: Option<&str>,
        self_identity: &Identity,
    ) -> anyhow::Result<Target> {
        let Some(raw) = target else {
            return Ok(Target::Identity(self_identity.clone()));
        };
        match raw {
            "." => Ok(Target::Identity(self_identity.clone())),
            "shaman/dogs" => Ok(Target::ShamanDogs(None)),
            t if t.starts_with("shaman/dogs/") => Ok(Target::ShamanDogs(Some(
                t.trim_start_matches("shaman/dogs/").to_string(),
            ))),
            t if self.registry.contains(t) => Ok(Target::Warband(t.to_string())),
            t => {
                let identity = Identity::parse(t)?;
                // A named raider with no live pane means "give this warband
                // a fresh raider" rather than signaling into the void.
                if identity.role() == Role::Raider {
                    let prefix = self.prefix_for(identity.warband().unwrap_or_default());
                    if !self.mux.has_session(&identity.session_name(&prefix))? {
                        return Ok(Target::Warband(
                            identity.warband().unwrap_or_default().to_string(),
                        ));
                    }
                }
                Ok(Target::Identity(identity))
            }
        }
    }

    fn charge_resolved(
        &self,
        bead_id: &str,
        provisional: bool,
        target: Option<&str>,
        self_identity: &Identity,
        opts: &ChargeOpts,
    ) -> anyhow::Result<ChargeReport> {
        match self.resolve_target(target, self_identity)? {
            Target::Identity(identity) => {
                self.charge_identity(bead_id, provisional, &identity, None, opts)
            }
            Target::Warband(warband) => self.charge_group(bead_id, provisional, &warband, opts),
            Target::ShamanDogs(dog) => self.charge_dogs(bead_id, dog.as_deref(), opts),
        }
    }

    /// Group dispatch: provision a fresh raider, start its session, then
    /// run the normal identity path.
    fn charge_group(
        &self,
        bead_id: &str,
        provisional: bool,
        warband: &str,
        opts: &ChargeOpts,
    ) -> anyhow::Result<ChargeReport> {
        let config = WarbandConfig::load(self.root, warband)?;
        if opts.dry_run {
            return Ok(ChargeReport {
                bead: bead_id.to_string(),
                target: format!("{warband}/raiders/?"),
                session: None,
                signaled: false,
                raid: None,
                provisioned_worker: None,
                dry_run: true,
            });
        }

        let provisioner = Provisioner {
            store: self.agent_store,
            mux: self.mux,
            root: self.root,
        };
        let name = provisioner.allocate(warband, Role::Raider, &config)?;
        provisioner.materialize(
            warband,
            &name,
            Role::Raider,
            &config,
            &MaterializeOpts::default(),
        )?;
        let identity = Identity::raider(warband, &name)?;

        let manager = self.session_manager();
        manager.start(
            &identity,
            &config.prefix,
            &StartOpts {
                account: opts.account.clone(),
                program: opts.program.clone(),
                ..StartOpts::default()
            },
        )?;

        self.charge_identity(bead_id, provisional, &identity, Some(name), opts)
    }

    /// The ten-step core, steps 3 through 10.
    fn charge_identity(
        &self,
        bead_id: &str,
        provisional: bool,
        identity: &Identity,
        provisioned_worker: Option<String>,
        opts: &ChargeOpts,
    ) -> anyhow::Result<ChargeReport> {
        let address = identity.address();
        let prefix = self.prefix_for(identity.warband().unwrap_or_default());
        let agent_bead = identity.agent_bead_id(&prefix);
        let session = identity.session_name(&prefix);

        if !provisional {
            self.guard_hook(bead_id, &address, &agent_bead, opts.force)?;
        }

        if opts.dry_run {
            return Ok(ChargeReport {
                bead: bead_id.to_string(),
                target: address,
                session: Some(session),
                signaled: false,
                raid: None,
                provisioned_worker,
                dry_run: true,
            });
        }

        // Auto-raid is best-effort bookkeeping; never blocks the dispatch.
        let raid = if opts.no_raid || provisional {
            None
        } else {
            match self.ensure_raid(bead_id) {
                Ok(raid) => raid,
                Err(e) => {
                    tracing::warn!(bead = bead_id, error = %e, "auto-raid failed");
                    None
                }
            }
        };

        // Attach. This is the authoritative transition.
        self.bead_store.update(
            bead_id,
            &BeadPatch {
                status: Some(BeadStatus::Hooked),
                assignee: Some(address.clone()),
                ..BeadPatch::default()
            },
        )?;

        // Banner slot. Cross-database failures don't unwind the attach.
        if let Err(e) = self
            .agent_store
            .set_slot(&agent_bead, BANNER_SLOT, Some(bead_id))
        {
            let cross_db = HordeError::CrossDatabase {
                agent_bead: agent_bead.clone(),
                detail: format!("{e:#}"),
            };
            tracing::warn!(error = %cross_db, "attachment stands");
        }

        if identity.role() == Role::Raider {
            self.ensure_raider_ritual(&agent_bead);
        }

        self.record_dispatch_meta(bead_id, opts);

        let signaled = if opts.no_signal {
            false
        } else {
            self.signal_target(bead_id, &agent_bead, &session, opts)
        };

        self.feed.emit(
            "charge",
            &self.actor,
            serde_json::json!({
                "bead": bead_id,
                "target": address,
                "session": session,
                "signaled": signaled,
            }),
        );

        Ok(ChargeReport {
            bead: bead_id.to_string(),
            target: address,
            session: Some(session),
            signaled,
            raid,
            provisioned_worker,
            dry_run: false,
        })
    }

    /// Dog dispatch: record the attachment; the shaman runs its own pack.
    fn charge_dogs(
        &self,
        bead_id: &str,
        dog: Option<&str>,
        opts: &ChargeOpts,
    ) -> anyhow::Result<ChargeReport> {
        let address = match dog {
            Some(name) => format!("shaman/dogs/{name}"),
            None => "shaman/dogs".to_string(),
        };
        if opts.dry_run {
            return Ok(ChargeReport {
                bead: bead_id.to_string(),
                target: address,
                session: None,
                signaled: false,
                raid: None,
                provisioned_worker: None,
                dry_run: true,
            });
        }
        self.bead_store.update(
            bead_id,
            &BeadPatch {
                status: Some(BeadStatus::Hooked),
                assignee: Some(address.clone()),
                ..BeadPatch::default()
            },
        )?;
        self.record_dispatch_meta(bead_id, opts);

        let shaman_session = Identity::shaman().session_name(DEFAULT_WARBAND_PREFIX);
        let signaled = if self.mux.has_session(&shaman_session).unwrap_or(false) {
            self.signal_target(bead_id, "hq-shaman", &shaman_session, opts)
        } else {
            false
        };

        self.feed.emit(
            "charge",
            &self.actor,
            serde_json::json!({"bead": bead_id, "target": address, "signaled": signaled}),
        );
        Ok(ChargeReport {
            bead: bead_id.to_string(),
            target: address,
            session: Some(shaman_session),
            signaled,
            raid: None,
            provisioned_worker: None,
            dry_run: false,
        })
    }

    /// Hook guard, both sides.
    ///
    /// The bead must not be hooked to someone else, and the target's banner
    /// must be free. A banner pointing at finished (closed or vanished)
    /// work is cleared and replaced without force; an incumbent still in
    /// flight requires `--force`, which detaches it back to open first.
    fn guard_hook(
        &self,
        bead_id: &str,
        address: &str,
        agent_bead: &str,
        force: bool,
    ) -> anyhow::Result<()> {
        let bead = self.bead_store.show(bead_id)?;
        if bead.status == BeadStatus::Hooked && bead.assignee != address && !force {
            return Err(HordeError::HookOccupied {
                agent: bead.assignee,
                bead: bead_id.to_string(),
            }
            .into());
        }

        let Ok(agent) = self.agent_store.show(agent_bead) else {
            return Ok(());
        };
        let Some(banner) = agent.banner_bead().map(ToString::to_string) else {
            return Ok(());
        };
        if banner == bead_id {
            return Ok(());
        }

        let incumbent_active = match self.bead_store.show(&banner) {
            Ok(b) => matches!(b.status, BeadStatus::Hooked | BeadStatus::InProgress),
            // Unreachable incumbent counts as complete.
            Err(_) => false,
        };

        if incumbent_active {
            if !force {
                return Err(HordeError::HookOccupied {
                    agent: address.to_string(),
                    bead: banner,
                }
                .into());
            }
            // Detach the prior bead before the new attach.
            let _ = self.bead_store.update(
                &banner,
                &BeadPatch {
                    status: Some(BeadStatus::Open),
                    assignee: Some(String::new()),
                    ..BeadPatch::default()
                },
            );
        }
        let _ = self.agent_store.set_slot(agent_bead, BANNER_SLOT, None);
        Ok(())
    }

    /// Create the tracking raid for a bead unless one already tracks it.
    fn ensure_raid(&self, bead_id: &str) -> anyhow::Result<Option<String>> {
        let bead = self.bead_store.show(bead_id)?;
        if bead.bead_type == "raid" || bead.description_field(TRACKED_BY_KEY).is_some() {
            return Ok(None);
        }
        let raid = self.bead_store.create(&CreateBead {
            title: format!("Work: {}", bead.title),
            bead_type: "raid".to_string(),
            ..CreateBead::default()
        })?;
        self.bead_store.add_dep(&raid.id, bead_id, "tracks")?;
        let description = description_set(&bead.description, TRACKED_BY_KEY, &raid.id);
        self.bead_store.update(
            bead_id,
            &BeadPatch {
                description: Some(description),
                ..BeadPatch::default()
            },
        )?;
        Ok(Some(raid.id))
    }

    /// Cook the standard raider ritual and hang it on the agent-bead if no
    /// ritual is attached yet. Best-effort.
    fn ensure_raider_ritual(&self, agent_bead: &str) {
        let result: anyhow::Result<()> = (|| {
            self.agent_store.invoke(RAIDER_WORK_RITUAL)?;
            let agent = self.agent_store.show(agent_bead)?;
            if agent.description_field("ritual").is_some() {
                return Ok(());
            }
            let root = self.agent_store.wisp(RAIDER_WORK_RITUAL, &[])?;
            self.agent_store.bond(&root, agent_bead)?;
            let description =
                description_set(&agent.description, "ritual", RAIDER_WORK_RITUAL);
            self.agent_store.update(
                agent_bead,
                &BeadPatch {
                    description: Some(description),
                    ..BeadPatch::default()
                },
            )?;
            Ok(())
        })();
        if let Err(e) = result {
            tracing::warn!(agent_bead, error = %e, "raider ritual setup failed");
        }
    }

    /// Persist `dispatched_by` (always) and `attached_args` (when given) in
    /// the bead description. Best-effort for provisional beads.
    fn record_dispatch_meta(&self, bead_id: &str, opts: &ChargeOpts) {
        let result: anyhow::Result<()> = (|| {
            let bead = self.bead_store.show(bead_id)?;
            let mut description =
                description_set(&bead.description, DISPATCHED_BY_KEY, &self.actor);
            if let Some(ref args) = opts.args {
                description = description_set(&description, ATTACHED_ARGS_KEY, args);
            }
            self.bead_store.update(
                bead_id,
                &BeadPatch {
                    description: Some(description),
                    ..BeadPatch::default()
                },
            )?;
            Ok(())
        })();
        if let Err(e) = result {
            tracing::warn!(bead = bead_id, error = %e, "recording dispatch metadata failed");
        }
    }

    /// Deliver the work-start signal if there is a live pane and the
    /// recipient isn't muted. A failed signal does not fail the dispatch.
    fn signal_target(
        &self,
        bead_id: &str,
        agent_bead: &str,
        session: &str,
        opts: &ChargeOpts,
    ) -> bool {
        match self.mux.has_session(session) {
            Ok(true) => {}
            // No pane: the agent discovers the work on next startup.
            _ => return false,
        }

        if !opts.force && self.dnd_muted(agent_bead) {
            tracing::debug!(session, "recipient muted; skipping signal");
            return false;
        }

        self.ensure_agent_ready(session);
        let prompt = match nudge::charge(
            &self.encampment.binary_name,
            bead_id,
            opts.subject.as_deref(),
            opts.message.as_deref(),
            opts.args.as_deref(),
            &self.actor,
        ) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(error = %e, "rendering charge prompt failed");
                return false;
            }
        };
        match signal_session_with_debounce(self.mux, session, &prompt, self.paste_debounce) {
            Ok(()) => {
                self.feed.emit(
                    "nudge",
                    &self.actor,
                    serde_json::json!({"session": session, "kind": "charge"}),
                );
                true
            }
            Err(e) => {
                // Attach already happened; the dispatch stands.
                tracing::warn!(session, error = %e, "signal failed after attach");
                false
            }
        }
    }

    fn dnd_muted(&self, agent_bead: &str) -> bool {
        self.agent_store
            .show(agent_bead)
            .ok()
            .and_then(|b| b.description_field(NOTIFICATION_LEVEL_KEY).map(ToString::to_string))
            .is_some_and(|level| level == "muted")
    }

    /// Re-check the pane right before signaling: agent still up, warning
    /// dismissed, then a fixed settling delay.
    fn ensure_agent_ready(&self, session: &str) {
        let _ = wait_for_command(
            self.mux,
            session,
            &self.encampment.runtime.shells,
            Duration::from_secs(2).min(self.ready_timeout),
        );
        accept_bypass_permissions_warning(self.mux, session);
        std::thread::sleep(self.paste_debounce);
    }

    fn session_manager(&self) -> SessionManager<'_> {
        let mut manager = SessionManager::new(
            self.mux,
            self.agent_store,
            self.feed,
            self.root,
            self.encampment,
        );
        manager.paste_debounce = self.paste_debounce;
        manager.ready_timeout = self.ready_timeout;
        manager
    }

    fn ritual_on_bead(
        &self,
        ritual: &str,
        bead_id: &str,
        vars: &[(String, String)],
    ) -> anyhow::Result<String> {
        self.bead_store.invoke(ritual)?;
        let bead = self.bead_store.show(bead_id)?;
        let mut all_vars = vars.to_vec();
        all_vars.push(("feature".to_string(), bead.title.clone()));
        all_vars.push(("issue".to_string(), bead.id.clone()));
        let wisp_root = self.bead_store.wisp(ritual, &all_vars)?;
        // The tool's post-bond root id is authoritative.
        self.bead_store.bond(&wisp_root, bead_id)
    }

    fn prefix_for(&self, warband: &str) -> String {
        if warband.is_empty() {
            return DEFAULT_WARBAND_PREFIX.to_string();
        }
        WarbandConfig::load(self.root, warband)
            .map(|c| c.prefix)
            .unwrap_or_else(|_| DEFAULT_WARBAND_PREFIX.to_string())
    }
}

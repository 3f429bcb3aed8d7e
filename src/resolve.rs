//! Identity resolution: who is the caller?
//!
//! The answer comes from three places with a fixed precedence: explicit
//! argument > environment > working directory. Environment can be partial
//! (a bare `HD_ROLE=raider` inside a raider worktree); missing pieces are
//! filled from cwd detection and flagged. When environment and cwd disagree
//! outright, the environment wins and the mismatch is flagged — `hd role
//! show` surfaces it, nothing auto-corrects.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context};
use serde::Serialize;

use crate::config::find_encampment_root;
use crate::identity::{Identity, Role};

pub const ENV_ROLE: &str = "HD_ROLE";
pub const ENV_WARBAND: &str = "HD_WARBAND";
pub const ENV_RAIDER: &str = "HD_RAIDER";
pub const ENV_CLAN: &str = "HD_CLAN";
pub const ENV_ENCAMPMENT: &str = "HD_ENCAMPMENT";
pub const ENV_ROLE_HOME: &str = "HD_ROLE_HOME";
pub const ENV_FORGE_WORKER: &str = "HD_FORGE_WORKER";
pub const ENV_NO_NUDGE: &str = "HD_TEST_NO_NUDGE";
pub const ENV_STALE_WARNED: &str = "GT_STALE_WARNED";

/// Immutable snapshot of the relevant process environment.
///
/// Captured once so the resolver stays a pure function of its inputs.
#[derive(Debug, Clone, Default)]
pub struct EnvSnapshot {
    vars: HashMap<String, String>,
}

impl EnvSnapshot {
    const KEYS: &'static [&'static str] = &[
        ENV_ROLE,
        ENV_WARBAND,
        ENV_RAIDER,
        ENV_CLAN,
        ENV_ENCAMPMENT,
        ENV_ROLE_HOME,
        ENV_FORGE_WORKER,
        ENV_NO_NUDGE,
        ENV_STALE_WARNED,
    ];

    pub fn from_process() -> Self {
        let mut vars = HashMap::new();
        for key in Self::KEYS {
            if let Ok(value) = std::env::var(key) {
                if !value.trim().is_empty() {
                    vars.insert((*key).to_string(), value);
                }
            }
        }
        Self { vars }
    }

    pub fn from_pairs(pairs: &[(&str, &str)]) -> Self {
        Self {
            vars: pairs
                .iter()
                .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                .collect(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IdentitySource {
    Explicit,
    Env,
    Cwd,
}

/// Fully resolved caller identity plus the provenance detail `hd role show`
/// reports.
#[derive(Debug, Clone)]
pub struct IdentityInfo {
    pub identity: Identity,
    pub source: IdentitySource,
    pub warband: Option<String>,
    pub worker: Option<String>,
    pub env_role_raw: Option<String>,
    pub cwd_identity: Option<Identity>,
    pub mismatch: bool,
    pub env_incomplete: bool,
    pub home: PathBuf,
    pub encampment_root: PathBuf,
    pub workdir: PathBuf,
    /// Worker id for parallel merge workers; lock-path disambiguation only.
    pub forge_worker: Option<String>,
}

impl IdentityInfo {
    pub fn address(&self) -> String {
        self.identity.address()
    }
}

/// Resolve the caller's identity. Deterministic and side-effect free for a
/// given (cwd, env, explicit) triple.
pub fn resolve(
    cwd: &Path,
    env: &EnvSnapshot,
    explicit: Option<&str>,
) -> anyhow::Result<IdentityInfo> {
    let encampment_root = match env.get(ENV_ENCAMPMENT) {
        Some(root) => PathBuf::from(root),
        None => find_encampment_root(cwd)?,
    };

    let cwd_identity = detect_from_cwd(&encampment_root, cwd);
    let env_role_raw = env.get(ENV_ROLE).map(ToString::to_string);

    let env_resolution = match env_role_raw.as_deref() {
        Some(raw) => match identity_from_env(raw, env, cwd_identity.as_ref()) {
            Ok(pair) => Some(pair),
            // An explicit identity outranks the environment; a broken env
            // shouldn't sink the call it was going to lose anyway.
            Err(e) if explicit.is_some() => {
                tracing::debug!(error = %e, "ignoring unusable {ENV_ROLE}");
                None
            }
            Err(e) => return Err(e),
        },
        None => None,
    };

    let (identity, source, env_incomplete) = if let Some(spec) = explicit {
        let identity = Identity::parse(spec)
            .with_context(|| format!("parsing explicit identity {spec:?}"))?;
        (identity, IdentitySource::Explicit, false)
    } else if let Some((identity, incomplete)) = env_resolution.clone() {
        (identity, IdentitySource::Env, incomplete)
    } else if let Some(identity) = cwd_identity.clone() {
        (identity, IdentitySource::Cwd, false)
    } else {
        // Operator running from the encampment root (or any non-role dir):
        // they act as the warchief.
        (Identity::warchief(), IdentitySource::Cwd, false)
    };

    let mismatch = match (&env_resolution, &cwd_identity) {
        (Some((env_id, _)), Some(cwd_id)) => env_id != cwd_id,
        _ => false,
    };

    let home = match env.get(ENV_ROLE_HOME) {
        Some(home) => PathBuf::from(home),
        None => identity.home_dir(&encampment_root),
    };

    Ok(IdentityInfo {
        warband: identity.warband().map(ToString::to_string),
        worker: identity.worker().map(ToString::to_string),
        identity,
        source,
        env_role_raw,
        cwd_identity,
        mismatch,
        env_incomplete,
        home,
        encampment_root,
        workdir: cwd.to_path_buf(),
        forge_worker: env.get(ENV_FORGE_WORKER).map(ToString::to_string),
    })
}

/// Structural detection from the directory layout: which role dir is `cwd`
/// under?
pub fn detect_from_cwd(encampment_root: &Path, cwd: &Path) -> Option<Identity> {
    let rel = cwd.strip_prefix(encampment_root).ok()?;
    let parts: Vec<&str> = rel
        .components()
        .filter_map(|c| c.as_os_str().to_str())
        .collect();

    match parts.as_slice() {
        ["warchief", ..] => Some(Identity::warchief()),
        ["shaman", ..] => Some(Identity::shaman()),
        [warband, "witness", ..] => Identity::witness(warband).ok(),
        [warband, "forge", ..] => Identity::forge(warband).ok(),
        [warband, "raiders", name, ..] => Identity::raider(warband, name).ok(),
        [warband, "clan", name, ..] => Identity::clan(warband, name).ok(),
        _ => None,
    }
}

/// Interpret `HD_ROLE`, filling gaps from companion vars then from cwd
/// detection. Returns the identity and whether cwd had to supply anything.
fn identity_from_env(
    raw: &str,
    env: &EnvSnapshot,
    cwd_identity: Option<&Identity>,
) -> anyhow::Result<(Identity, bool)> {
    // Compound form carries everything: WARBAND/witness, WARBAND/raiders/NAME, ...
    if raw.contains('/') {
        return Ok((Identity::parse(raw)?, false));
    }

    let mut incomplete = false;
    let warband_from = |env_key: &str| -> Option<(String, bool)> {
        if let Some(w) = env.get(env_key) {
            return Some((w.to_string(), false));
        }
        let w = cwd_identity.and_then(Identity::warband)?;
        Some((w.to_string(), true))
    };

    let identity = match raw {
        "warchief" => Identity::warchief(),
        "shaman" => Identity::shaman(),
        "witness" | "forge" => {
            let (warband, from_cwd) = warband_from(ENV_WARBAND)
                .ok_or_else(|| anyhow!("{ENV_ROLE}={raw} requires {ENV_WARBAND}"))?;
            incomplete |= from_cwd;
            if raw == "witness" {
                Identity::witness(&warband)?
            } else {
                Identity::forge(&warband)?
            }
        }
        "raider" | "clan" => {
            let (warband, warband_from_cwd) = warband_from(ENV_WARBAND)
                .ok_or_else(|| anyhow!("{ENV_ROLE}={raw} requires {ENV_WARBAND}"))?;
            incomplete |= warband_from_cwd;
            let name_key = if raw == "raider" { ENV_RAIDER } else { ENV_CLAN };
            let (name, name_from_cwd) = match env.get(name_key) {
                Some(n) => (n.to_string(), false),
                None => {
                    let n = cwd_identity
                        .filter(|id| id.role() == if raw == "raider" { Role::Raider } else { Role::Clan })
                        .and_then(Identity::worker)
                        .ok_or_else(|| anyhow!("{ENV_ROLE}={raw} requires {name_key}"))?;
                    (n.to_string(), true)
                }
            };
            incomplete |= name_from_cwd;
            if raw == "raider" {
                Identity::raider(&warband, &name)?
            } else {
                Identity::clan(&warband, &name)?
            }
        }
        other => return Err(anyhow!("unrecognized {ENV_ROLE}: {other:?}")),
    };

    Ok((identity, incomplete))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ENCAMPMENT_MARKER;

    fn scaffold() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("warchief")).unwrap();
        std::fs::write(dir.path().join(ENCAMPMENT_MARKER), r#"{"name": "camp"}"#).unwrap();
        std::fs::create_dir_all(dir.path().join("horde/raiders/Toast/warband")).unwrap();
        dir
    }

    #[test]
    fn cwd_detection_wins_without_env() {
        let dir = scaffold();
        let cwd = dir.path().join("horde/raiders/Toast/warband");
        let info = resolve(&cwd, &EnvSnapshot::default(), None).unwrap();
        assert_eq!(info.source, IdentitySource::Cwd);
        assert_eq!(info.address(), "horde/raiders/Toast");
        assert!(!info.mismatch);
        assert_eq!(info.encampment_root, dir.path());
        assert_eq!(info.home, cwd);
    }

    #[test]
    fn env_beats_cwd_and_flags_mismatch() {
        let dir = scaffold();
        let cwd = dir.path().join("horde/raiders/Toast/warband");
        let env = EnvSnapshot::from_pairs(&[(ENV_ROLE, "warchief")]);
        let info = resolve(&cwd, &env, None).unwrap();
        assert_eq!(info.source, IdentitySource::Env);
        assert_eq!(info.identity, Identity::warchief());
        assert!(info.mismatch);
        assert_eq!(
            info.cwd_identity,
            Some(Identity::raider("horde", "Toast").unwrap())
        );
    }

    #[test]
    fn explicit_beats_everything() {
        let dir = scaffold();
        let cwd = dir.path().join("horde/raiders/Toast/warband");
        let env = EnvSnapshot::from_pairs(&[(ENV_ROLE, "warchief")]);
        let info = resolve(&cwd, &env, Some("horde/witness")).unwrap();
        assert_eq!(info.source, IdentitySource::Explicit);
        assert_eq!(info.address(), "horde/witness");
        // env vs cwd mismatch is still reported.
        assert!(info.mismatch);
    }

    #[test]
    fn incomplete_env_fills_from_cwd() {
        let dir = scaffold();
        let cwd = dir.path().join("horde/raiders/Toast/warband");
        let env = EnvSnapshot::from_pairs(&[(ENV_ROLE, "raider")]);
        let info = resolve(&cwd, &env, None).unwrap();
        assert_eq!(info.source, IdentitySource::Env);
        assert_eq!(info.address(), "horde/raiders/Toast");
        assert!(info.env_incomplete);
        assert!(!info.mismatch);
    }

    #[test]
    fn compound_env_role() {
        let dir = scaffold();
        let env = EnvSnapshot::from_pairs(&[(ENV_ROLE, "horde/clan/Nux")]);
        let info = resolve(dir.path(), &env, None).unwrap();
        assert_eq!(info.address(), "horde/clan/Nux");
        assert!(!info.env_incomplete);
    }

    #[test]
    fn shorthand_env_role_is_raider() {
        let dir = scaffold();
        let env = EnvSnapshot::from_pairs(&[(ENV_ROLE, "horde/Toast")]);
        let info = resolve(dir.path(), &env, None).unwrap();
        assert_eq!(info.address(), "horde/raiders/Toast");
    }

    #[test]
    fn incomplete_env_without_cwd_fails() {
        let dir = scaffold();
        let env = EnvSnapshot::from_pairs(&[(ENV_ROLE, "raider")]);
        let err = resolve(dir.path(), &env, None).unwrap_err();
        assert!(err.to_string().contains(ENV_WARBAND));
    }

    #[test]
    fn operator_at_root_is_warchief() {
        let dir = scaffold();
        let info = resolve(dir.path(), &EnvSnapshot::default(), None).unwrap();
        assert_eq!(info.identity, Identity::warchief());
        assert_eq!(info.source, IdentitySource::Cwd);
    }

    #[test]
    fn role_home_override() {
        let dir = scaffold();
        let env = EnvSnapshot::from_pairs(&[
            (ENV_ROLE, "shaman"),
            (ENV_ROLE_HOME, "/tmp/elsewhere"),
        ]);
        let info = resolve(dir.path(), &env, None).unwrap();
        assert_eq!(info.home, PathBuf::from("/tmp/elsewhere"));
    }

    #[test]
    fn resolution_is_deterministic() {
        let dir = scaffold();
        let cwd = dir.path().join("horde/raiders/Toast/warband");
        let env = EnvSnapshot::from_pairs(&[(ENV_ROLE, "raider")]);
        let a = resolve(&cwd, &env, None).unwrap();
        let b = resolve(&cwd, &env, None).unwrap();
        assert_eq!(a.identity, b.identity);
        assert_eq!(a.source, b.source);
        assert_eq!(a.home, b.home);
    }

    #[test]
    fn encampment_env_override() {
        let dir = scaffold();
        let env = EnvSnapshot::from_pairs(&[(
            ENV_ENCAMPMENT,
            dir.path().to_str().unwrap(),
        )]);
        let elsewhere = tempfile::tempdir().unwrap();
        let info = resolve(elsewhere.path(), &env, None).unwrap();
        assert_eq!(info.encampment_root, dir.path());
    }
}

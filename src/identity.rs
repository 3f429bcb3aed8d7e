//! Roles, identities, and their canonical renderings.
//!
//! An identity is `(role, warband?, worker?)`. It renders three ways: the
//! mailbox/assignee address, the multiplexer session name, and the
//! agent-bead id. All three are pure functions of the identity (plus the
//! warband's session prefix), and injective over valid identities — which
//! is why warband and worker names are validated to contain no separators
//! and to avoid the role keywords.

use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail};
use serde::Serialize;

/// Prefix for encampment-level session names and bead ids.
pub const HQ_PREFIX: &str = "hq";

/// Default per-warband session prefix; `config.json` may override it.
pub const DEFAULT_WARBAND_PREFIX: &str = "hd";

/// Address of the human operator's mailbox.
pub const OVERSEER_ADDRESS: &str = "overseer";

/// Worker names that would collide with role segments in session names.
const RESERVED_WORKER_NAMES: &[&str] = &["witness", "forge", "clan", "raiders", "warchief", "shaman"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Warchief,
    Shaman,
    Witness,
    Forge,
    Raider,
    Clan,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Warchief => "warchief",
            Role::Shaman => "shaman",
            Role::Witness => "witness",
            Role::Forge => "forge",
            Role::Raider => "raider",
            Role::Clan => "clan",
        }
    }

    /// One per encampment: warchief, shaman.
    pub fn is_encampment_level(self) -> bool {
        matches!(self, Role::Warchief | Role::Shaman)
    }

    /// One per warband: witness, forge.
    pub fn is_warband_level(self) -> bool {
        matches!(self, Role::Witness | Role::Forge)
    }

    /// Many per warband, each with its own worktree: raider, clan.
    pub fn is_worker_level(self) -> bool {
        matches!(self, Role::Raider | Role::Clan)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A fully resolved agent identity.
///
/// Invariant: `warband` is present iff the role is warband- or worker-level;
/// `worker` is present iff the role is worker-level. Constructors enforce
/// name validity so the canonical renderings stay injective.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identity {
    role: Role,
    warband: Option<String>,
    worker: Option<String>,
}

impl Identity {
    pub fn warchief() -> Self {
        Self {
            role: Role::Warchief,
            warband: None,
            worker: None,
        }
    }

    pub fn shaman() -> Self {
        Self {
            role: Role::Shaman,
            warband: None,
            worker: None,
        }
    }

    pub fn witness(warband: &str) -> anyhow::Result<Self> {
        validate_warband(warband)?;
        Ok(Self {
            role: Role::Witness,
            warband: Some(warband.to_string()),
            worker: None,
        })
    }

    pub fn forge(warband: &str) -> anyhow::Result<Self> {
        validate_warband(warband)?;
        Ok(Self {
            role: Role::Forge,
            warband: Some(warband.to_string()),
            worker: None,
        })
    }

    pub fn raider(warband: &str, name: &str) -> anyhow::Result<Self> {
        validate_warband(warband)?;
        validate_worker(name)?;
        Ok(Self {
            role: Role::Raider,
            warband: Some(warband.to_string()),
            worker: Some(name.to_string()),
        })
    }

    pub fn clan(warband: &str, name: &str) -> anyhow::Result<Self> {
        validate_warband(warband)?;
        validate_worker(name)?;
        Ok(Self {
            role: Role::Clan,
            warband: Some(warband.to_string()),
            worker: Some(name.to_string()),
        })
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn warband(&self) -> Option<&str> {
        self.warband.as_deref()
    }

    pub fn worker(&self) -> Option<&str> {
        self.worker.as_deref()
    }

    /// Parse an identity string.
    ///
    /// Accepted forms: `warchief`, `shaman`, `W/witness`, `W/forge`,
    /// `W/raiders/NAME`, `W/clan/NAME`, and the shorthand `W/NAME`
    /// (interpreted as a raider).
    pub fn parse(s: &str) -> anyhow::Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            bail!("empty identity string");
        }
        let parts: Vec<&str> = s.split('/').collect();
        match parts.as_slice() {
            ["warchief"] => Ok(Self::warchief()),
            ["shaman"] => Ok(Self::shaman()),
            [warband, "witness"] => Self::witness(warband),
            [warband, "forge"] => Self::forge(warband),
            [warband, "raiders", name] => Self::raider(warband, name),
            [warband, "clan", name] => Self::clan(warband, name),
            // Shorthand: WARBAND/NAME is a raider.
            [warband, name] => Self::raider(warband, name),
            _ => Err(anyhow!("unrecognized identity: {s:?}")),
        }
    }

    /// Mailbox / assignee address.
    pub fn address(&self) -> String {
        match self.role {
            Role::Warchief => "warchief".to_string(),
            Role::Shaman => "shaman".to_string(),
            Role::Witness => format!("{}/witness", self.warband_str()),
            Role::Forge => format!("{}/forge", self.warband_str()),
            Role::Raider => format!("{}/raiders/{}", self.warband_str(), self.worker_str()),
            Role::Clan => format!("{}/clan/{}", self.warband_str(), self.worker_str()),
        }
    }

    /// Multiplexer session name, using the warband's prefix (`hq` is fixed
    /// for encampment-level agents).
    pub fn session_name(&self, prefix: &str) -> String {
        match self.role {
            Role::Warchief => format!("{HQ_PREFIX}-warchief"),
            Role::Shaman => format!("{HQ_PREFIX}-shaman"),
            Role::Witness => format!("{prefix}-{}-witness", self.warband_str()),
            Role::Forge => format!("{prefix}-{}-forge", self.warband_str()),
            Role::Raider => format!("{prefix}-{}-{}", self.warband_str(), self.worker_str()),
            Role::Clan => format!(
                "{prefix}-{}-clan-{}",
                self.warband_str(),
                self.worker_str()
            ),
        }
    }

    /// Primary key of this agent's bead in the bead store.
    ///
    /// Currently coincides with the session name, but callers must not rely
    /// on that: the two namespaces evolve independently.
    pub fn agent_bead_id(&self, prefix: &str) -> String {
        self.session_name(prefix)
    }

    /// Working directory of this identity under the encampment root.
    ///
    /// This is the same directory the session manager starts the pane in and
    /// the lock registry writes the lock to.
    pub fn home_dir(&self, encampment_root: &Path) -> PathBuf {
        match self.role {
            Role::Warchief => encampment_root.join("warchief"),
            Role::Shaman => encampment_root.join("shaman"),
            Role::Witness => encampment_root
                .join(self.warband_str())
                .join("witness")
                .join("warband"),
            Role::Forge => encampment_root
                .join(self.warband_str())
                .join("forge")
                .join("warband"),
            Role::Raider => encampment_root
                .join(self.warband_str())
                .join("raiders")
                .join(self.worker_str())
                .join("warband"),
            Role::Clan => encampment_root
                .join(self.warband_str())
                .join("clan")
                .join(self.worker_str())
                .join("warband"),
        }
    }

    fn warband_str(&self) -> &str {
        self.warband.as_deref().unwrap_or_default()
    }

    fn worker_str(&self) -> &str {
        self.worker.as_deref().unwrap_or_default()
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.address())
    }
}

/// Warband names are lowercase alphanumerics (plus `_`). No `-` or `/`:
/// both appear as separators in session names and addresses.
pub fn validate_warband(name: &str) -> anyhow::Result<()> {
    if name.is_empty() || name.len() > 64 {
        bail!("invalid warband name {name:?}: must be 1-64 chars");
    }
    if !name
        .bytes()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_')
    {
        bail!("invalid warband name {name:?}: lowercase alphanumerics and _ only");
    }
    if RESERVED_WORKER_NAMES.contains(&name) {
        bail!("invalid warband name {name:?}: reserved word");
    }
    Ok(())
}

/// Worker names are alphanumerics (plus `_`) and must not shadow a role
/// segment, else `W/witness` and raider "witness" would render identically.
pub fn validate_worker(name: &str) -> anyhow::Result<()> {
    if name.is_empty() || name.len() > 64 {
        bail!("invalid worker name {name:?}: must be 1-64 chars");
    }
    if !name
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'_')
    {
        bail!("invalid worker name {name:?}: alphanumerics and _ only");
    }
    let lowered = name.to_ascii_lowercase();
    if RESERVED_WORKER_NAMES.contains(&lowered.as_str()) {
        bail!("invalid worker name {name:?}: reserved word");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all_renderings() -> Vec<(Identity, &'static str, &'static str)> {
        vec![
            (Identity::warchief(), "warchief", "hq-warchief"),
            (Identity::shaman(), "shaman", "hq-shaman"),
            (
                Identity::witness("horde").unwrap(),
                "horde/witness",
                "hd-horde-witness",
            ),
            (
                Identity::forge("horde").unwrap(),
                "horde/forge",
                "hd-horde-forge",
            ),
            (
                Identity::raider("horde", "Toast").unwrap(),
                "horde/raiders/Toast",
                "hd-horde-Toast",
            ),
            (
                Identity::clan("horde", "Nux").unwrap(),
                "horde/clan/Nux",
                "hd-horde-clan-Nux",
            ),
        ]
    }

    #[test]
    fn canonical_addresses() {
        for (identity, address, _) in all_renderings() {
            assert_eq!(identity.address(), address);
        }
    }

    #[test]
    fn canonical_session_names() {
        for (identity, _, session) in all_renderings() {
            assert_eq!(identity.session_name("hd"), session);
        }
    }

    #[test]
    fn bead_id_matches_current_session_scheme() {
        let id = Identity::raider("horde", "Toast").unwrap();
        assert_eq!(id.agent_bead_id("hd"), "hd-horde-Toast");
    }

    #[test]
    fn custom_warband_prefix() {
        let id = Identity::witness("steppe").unwrap();
        assert_eq!(id.session_name("gx"), "gx-steppe-witness");
        // Encampment-level agents ignore the warband prefix.
        assert_eq!(Identity::warchief().session_name("gx"), "hq-warchief");
    }

    #[test]
    fn address_round_trips_through_parse() {
        for (identity, _, _) in all_renderings() {
            let reparsed = Identity::parse(&identity.address()).unwrap();
            assert_eq!(reparsed, identity);
        }
    }

    #[test]
    fn shorthand_parses_as_raider() {
        let id = Identity::parse("horde/Toast").unwrap();
        assert_eq!(id.role(), Role::Raider);
        assert_eq!(id.warband(), Some("horde"));
        assert_eq!(id.worker(), Some("Toast"));
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(Identity::parse("").is_err());
        assert!(Identity::parse("witness").is_err());
        assert!(Identity::parse("a/b/c/d").is_err());
        assert!(Identity::parse("horde/raiders/").is_err());
    }

    #[test]
    fn reserved_worker_names_rejected() {
        assert!(Identity::raider("horde", "witness").is_err());
        assert!(Identity::raider("horde", "forge").is_err());
        assert!(Identity::clan("horde", "clan").is_err());
    }

    #[test]
    fn separator_characters_rejected() {
        assert!(Identity::raider("hor-de", "Toast").is_err());
        assert!(Identity::raider("horde", "To-ast").is_err());
        assert!(Identity::witness("hor/de").is_err());
    }

    #[test]
    fn session_names_injective() {
        // Distinct identities must render distinct session names for a
        // fixed prefix.
        let ids = [
            Identity::warchief(),
            Identity::shaman(),
            Identity::witness("horde").unwrap(),
            Identity::forge("horde").unwrap(),
            Identity::raider("horde", "Toast").unwrap(),
            Identity::raider("horde", "Nux").unwrap(),
            Identity::clan("horde", "Toast").unwrap(),
            Identity::witness("steppe").unwrap(),
            Identity::raider("steppe", "Toast").unwrap(),
        ];
        let mut seen = std::collections::HashSet::new();
        for id in &ids {
            assert!(
                seen.insert(id.session_name("hd")),
                "collision on {}",
                id.session_name("hd")
            );
        }
    }

    #[test]
    fn home_dirs() {
        let root = Path::new("/camp");
        assert_eq!(
            Identity::warchief().home_dir(root),
            PathBuf::from("/camp/warchief")
        );
        assert_eq!(
            Identity::raider("horde", "Toast").unwrap().home_dir(root),
            PathBuf::from("/camp/horde/raiders/Toast/warband")
        );
        assert_eq!(
            Identity::clan("horde", "Nux").unwrap().home_dir(root),
            PathBuf::from("/camp/horde/clan/Nux/warband")
        );
        assert_eq!(
            Identity::forge("horde").unwrap().home_dir(root),
            PathBuf::from("/camp/horde/forge/warband")
        );
    }
}

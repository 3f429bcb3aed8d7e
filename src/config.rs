//! Encampment and warband configuration.
//!
//! All config is JSON: `warchief/encampment.json` (encampment metadata,
//! runtime, channels), `warchief/warbands.json` (warband registry), and a
//! per-warband `config.json` (session prefix, default branch, name pool).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::error::HordeError;
use crate::identity::DEFAULT_WARBAND_PREFIX;

/// Marker file that makes a directory an encampment root.
pub const ENCAMPMENT_MARKER: &str = "warchief/encampment.json";

/// Top-level encampment.json.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncampmentConfig {
    pub name: String,
    #[serde(default = "default_binary_name")]
    pub binary_name: String,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    /// Fan-out channels: channel name → recipient addresses.
    #[serde(default)]
    pub channels: BTreeMap<String, Vec<String>>,
    #[serde(default = "default_pool_size")]
    pub worker_pool_size: usize,
}

impl Default for EncampmentConfig {
    fn default() -> Self {
        Self {
            name: "encampment".to_string(),
            binary_name: default_binary_name(),
            runtime: RuntimeConfig::default(),
            channels: BTreeMap::new(),
            worker_pool_size: default_pool_size(),
        }
    }
}

/// How to start an agent process inside a pane.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_agent_program")]
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Per-account config dir passed to the agent via env.
    #[serde(default)]
    pub account_dir: Option<String>,
    /// Shell names the readiness poll treats as "agent not started yet".
    #[serde(default = "default_shells")]
    pub shells: Vec<String>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            program: default_agent_program(),
            args: Vec::new(),
            account_dir: None,
            shells: default_shells(),
        }
    }
}

fn default_binary_name() -> String {
    "hd".to_string()
}

fn default_agent_program() -> String {
    "claude".to_string()
}

fn default_shells() -> Vec<String> {
    ["bash", "zsh", "sh", "fish"]
        .iter()
        .map(ToString::to_string)
        .collect()
}

fn default_pool_size() -> usize {
    12
}

impl EncampmentConfig {
    pub fn path(encampment_root: &Path) -> PathBuf {
        encampment_root.join(ENCAMPMENT_MARKER)
    }

    pub fn load(encampment_root: &Path) -> anyhow::Result<Self> {
        let path = Self::path(encampment_root);
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    /// Bounded parallelism for batch starts and batch dispatch.
    pub fn effective_pool_size(&self) -> usize {
        self.worker_pool_size.clamp(1, 100)
    }
}

/// warbands.json: the registry of warbands in this encampment.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WarbandRegistry {
    #[serde(default)]
    pub warbands: Vec<WarbandEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WarbandEntry {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
}

impl WarbandRegistry {
    pub fn path(encampment_root: &Path) -> PathBuf {
        encampment_root.join("warchief").join("warbands.json")
    }

    pub fn load(encampment_root: &Path) -> anyhow::Result<Self> {
        let path = Self::path(encampment_root);
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.warbands.iter().any(|w| w.name == name)
    }

    pub fn names(&self) -> Vec<String> {
        self.warbands.iter().map(|w| w.name.clone()).collect()
    }
}

/// Per-warband config.json.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WarbandConfig {
    #[serde(default = "default_warband_prefix")]
    pub prefix: String,
    #[serde(default = "default_branch")]
    pub default_branch: String,
    #[serde(default = "default_name_pool")]
    pub name_pool: Vec<String>,
}

impl Default for WarbandConfig {
    fn default() -> Self {
        Self {
            prefix: default_warband_prefix(),
            default_branch: default_branch(),
            name_pool: default_name_pool(),
        }
    }
}

fn default_warband_prefix() -> String {
    DEFAULT_WARBAND_PREFIX.to_string()
}

fn default_branch() -> String {
    "main".to_string()
}

fn default_name_pool() -> Vec<String> {
    [
        "Toast", "Nux", "Slit", "Ace", "Morsov", "Rictus", "Capable", "Dag", "Cheedo",
        "Valkyrie", "Furiosa", "Angharad",
    ]
    .iter()
    .map(ToString::to_string)
    .collect()
}

impl WarbandConfig {
    pub fn path(encampment_root: &Path, warband: &str) -> PathBuf {
        encampment_root.join(warband).join("config.json")
    }

    /// Load the warband's config, falling back to defaults when absent.
    pub fn load(encampment_root: &Path, warband: &str) -> anyhow::Result<Self> {
        let path = Self::path(encampment_root, warband);
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }
}

/// Walk upward from `start` to find the encampment root.
pub fn find_encampment_root(start: &Path) -> anyhow::Result<PathBuf> {
    let mut dir = Some(start);
    while let Some(d) = dir {
        if d.join(ENCAMPMENT_MARKER).is_file() {
            return Ok(d.to_path_buf());
        }
        dir = d.parent();
    }
    Err(HordeError::NotInWorkspace {
        dir: start.display().to_string(),
    }
    .into())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scaffold() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("warchief")).unwrap();
        std::fs::write(
            dir.path().join(ENCAMPMENT_MARKER),
            r#"{"name": "the-wastes"}"#,
        )
        .unwrap();
        dir
    }

    #[test]
    fn encampment_defaults() {
        let dir = scaffold();
        let config = EncampmentConfig::load(dir.path()).unwrap();
        assert_eq!(config.name, "the-wastes");
        assert_eq!(config.binary_name, "hd");
        assert_eq!(config.runtime.program, "claude");
        assert!(config.runtime.shells.contains(&"zsh".to_string()));
        assert_eq!(config.effective_pool_size(), 12);
    }

    #[test]
    fn pool_size_clamped() {
        let mut config = EncampmentConfig::default();
        config.worker_pool_size = 0;
        assert_eq!(config.effective_pool_size(), 1);
        config.worker_pool_size = 5000;
        assert_eq!(config.effective_pool_size(), 100);
    }

    #[test]
    fn warband_config_defaults_when_absent() {
        let dir = scaffold();
        let config = WarbandConfig::load(dir.path(), "horde").unwrap();
        assert_eq!(config.prefix, "hd");
        assert_eq!(config.default_branch, "main");
        assert!(config.name_pool.contains(&"Toast".to_string()));
    }

    #[test]
    fn warband_config_override() {
        let dir = scaffold();
        std::fs::create_dir_all(dir.path().join("horde")).unwrap();
        std::fs::write(
            dir.path().join("horde/config.json"),
            r#"{"prefix": "gx", "name_pool": ["Grit"]}"#,
        )
        .unwrap();
        let config = WarbandConfig::load(dir.path(), "horde").unwrap();
        assert_eq!(config.prefix, "gx");
        assert_eq!(config.default_branch, "main");
        assert_eq!(config.name_pool, vec!["Grit".to_string()]);
    }

    #[test]
    fn registry_roundtrip() {
        let dir = scaffold();
        std::fs::write(
            WarbandRegistry::path(dir.path()),
            r#"{"warbands": [{"name": "horde"}, {"name": "steppe", "description": "scouts"}]}"#,
        )
        .unwrap();
        let registry = WarbandRegistry::load(dir.path()).unwrap();
        assert!(registry.contains("horde"));
        assert!(!registry.contains("badlands"));
        assert_eq!(registry.names(), vec!["horde", "steppe"]);
    }

    #[test]
    fn find_root_from_nested_dir() {
        let dir = scaffold();
        let nested = dir.path().join("horde/raiders/Toast/warband");
        std::fs::create_dir_all(&nested).unwrap();
        let root = find_encampment_root(&nested).unwrap();
        assert_eq!(root, dir.path());
    }

    #[test]
    fn find_root_outside_fails() {
        let dir = tempfile::tempdir().unwrap();
        let err = find_encampment_root(dir.path()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<HordeError>(),
            Some(HordeError::NotInWorkspace { .. })
        ));
    }
}

//! Typed interface over the external bead store.
//!
//! Beads live in `.relics/` databases managed by the `rl` tool; the
//! orchestrator only ever talks to them through this module. The adapter
//! handles two quirks of the subprocess path: `show` exiting 0 with empty
//! stdout for a missing bead, and worker directories that point at a shared
//! database through a `redirect` file.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::HordeError;
use crate::subprocess::Tool;

pub const RELICS_DIR: &str = ".relics";
pub const REDIRECT_FILE: &str = "redirect";

/// Slot on an agent-bead naming its hooked bead.
pub const BANNER_SLOT: &str = "banner_bead";

/// Description key recording who dispatched the hooked bead.
pub const DISPATCHED_BY_KEY: &str = "dispatched_by";
/// Description key carrying `--args` supplied at dispatch time.
pub const ATTACHED_ARGS_KEY: &str = "attached_args";
/// Description key for do-not-disturb state on agent-beads.
pub const NOTIFICATION_LEVEL_KEY: &str = "notification_level";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BeadStatus {
    #[default]
    Open,
    InProgress,
    Hooked,
    Escalated,
    Closed,
    Deferred,
}

impl BeadStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            BeadStatus::Open => "open",
            BeadStatus::InProgress => "in_progress",
            BeadStatus::Hooked => "hooked",
            BeadStatus::Escalated => "escalated",
            BeadStatus::Closed => "closed",
            BeadStatus::Deferred => "deferred",
        }
    }
}

impl fmt::Display for BeadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bead {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default, rename = "type")]
    pub bead_type: String,
    #[serde(default)]
    pub status: BeadStatus,
    #[serde(default)]
    pub assignee: String,
    #[serde(default)]
    pub priority: i64,
    #[serde(default)]
    pub parent: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub slots: BTreeMap<String, String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Bead {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            title: String::new(),
            bead_type: "task".to_string(),
            status: BeadStatus::default(),
            assignee: String::new(),
            priority: 2,
            parent: String::new(),
            description: String::new(),
            labels: Vec::new(),
            slots: BTreeMap::new(),
            created_at: None,
            updated_at: None,
        }
    }

    pub fn banner_bead(&self) -> Option<&str> {
        self.slots
            .get(BANNER_SLOT)
            .map(String::as_str)
            .filter(|s| !s.is_empty())
    }

    /// Look up a `key: value` line in the description.
    pub fn description_field(&self, key: &str) -> Option<&str> {
        description_get(&self.description, key)
    }
}

/// The description doubles as a small key/value store via `key: value`
/// lines. Freeform text is left untouched.
pub fn description_get<'a>(description: &'a str, key: &str) -> Option<&'a str> {
    let prefix = format!("{key}:");
    description
        .lines()
        .find_map(|line| line.strip_prefix(&prefix))
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// Set (or replace) a `key: value` line, returning the new description.
pub fn description_set(description: &str, key: &str, value: &str) -> String {
    let prefix = format!("{key}:");
    let mut lines: Vec<String> = description
        .lines()
        .filter(|line| !line.starts_with(&prefix))
        .map(ToString::to_string)
        .collect();
    lines.push(format!("{key}: {value}"));
    lines.join("\n")
}

#[derive(Debug, Clone, Default)]
pub struct CreateBead {
    pub id: Option<String>,
    pub title: String,
    pub bead_type: String,
    pub description: String,
    pub labels: Vec<String>,
    pub priority: Option<i64>,
}

#[derive(Debug, Clone, Default)]
pub struct BeadPatch {
    pub status: Option<BeadStatus>,
    pub assignee: Option<String>,
    pub add_labels: Vec<String>,
    pub remove_labels: Vec<String>,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct BeadFilter {
    pub status: Option<BeadStatus>,
    pub assignee: Option<String>,
    pub bead_type: Option<String>,
    pub label: Option<String>,
    pub parent: Option<String>,
}

/// Operations the orchestrator needs from the bead store.
///
/// `Send + Sync` so batch dispatch can share one store across its worker
/// pool.
pub trait BeadStore: Send + Sync {
    fn exists(&self, id: &str) -> anyhow::Result<bool>;
    fn show(&self, id: &str) -> anyhow::Result<Bead>;
    fn create(&self, opts: &CreateBead) -> anyhow::Result<Bead>;
    fn update(&self, id: &str, patch: &BeadPatch) -> anyhow::Result<()>;
    fn list(&self, filter: &BeadFilter) -> anyhow::Result<Vec<Bead>>;
    fn close(&self, id: &str, reason: &str) -> anyhow::Result<()>;
    /// `None` clears the slot.
    fn set_slot(&self, agent_bead_id: &str, slot: &str, value: Option<&str>)
        -> anyhow::Result<()>;
    fn add_dep(&self, parent: &str, child: &str, dep_type: &str) -> anyhow::Result<()>;
    /// Instantiate a ritual; returns the wisp root bead id.
    fn wisp(&self, ritual: &str, vars: &[(String, String)]) -> anyhow::Result<String>;
    /// Bond a wisp root onto a bead; returns the post-bond root id.
    fn bond(&self, root: &str, bead: &str) -> anyhow::Result<String>;
    fn invoke(&self, ritual: &str) -> anyhow::Result<()>;
    fn agent_state(&self, agent_bead_id: &str, state: &str) -> anyhow::Result<()>;
}

/// Does this look like a bead id (`prefix-alnum`, optional `.N` suffix)?
///
/// Used for provisional acceptance during cross-warband dispatch, where the
/// bead may live in a database this process can't see yet. Store prefixes
/// are at most four characters, which keeps hyphenated ritual names
/// (`scout-sweep`) out of this shape.
pub fn looks_like_bead_id(s: &str) -> bool {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        Regex::new(r"^[a-z][a-z0-9]{0,3}-[A-Za-z0-9]+(\.\d+)?$").expect("bead id regex")
    });
    re.is_match(s)
}

// ---------------------------------------------------------------------------
// Hook-directory resolution
// ---------------------------------------------------------------------------

const MAX_REDIRECT_HOPS: usize = 3;

/// Find the directory whose `.relics/` database owns `bead_id`.
///
/// Encampment-level beads (`hq-*`) always live at the root. Everything else
/// starts at `preferred_cwd` and follows `.relics/redirect` files (each
/// holding a relative path to another `.relics` directory) for at most
/// three hops. Cycles and empty redirects fall back to the last good
/// directory; a cwd with no database at all falls back to itself.
pub fn resolve_hook_dir(bead_id: &str, preferred_cwd: &Path, encampment_root: &Path) -> PathBuf {
    if bead_id.starts_with("hq-") {
        return encampment_root.to_path_buf();
    }

    let mut dir = preferred_cwd.to_path_buf();
    let mut visited = vec![normalize(&dir)];
    for _ in 0..MAX_REDIRECT_HOPS {
        let redirect = dir.join(RELICS_DIR).join(REDIRECT_FILE);
        let Ok(content) = std::fs::read_to_string(&redirect) else {
            return dir;
        };
        let target = content.trim();
        if target.is_empty() {
            // Whitespace-only redirect counts as absent.
            return dir;
        }
        // The redirect names another .relics directory, relative to ours.
        let next_relics = normalize(&dir.join(RELICS_DIR).join(target));
        let Some(next) = next_relics.parent().map(Path::to_path_buf) else {
            return dir;
        };
        let key = normalize(&next);
        if visited.contains(&key) {
            tracing::warn!(bead = bead_id, dir = %next.display(), "redirect cycle");
            return preferred_cwd.to_path_buf();
        }
        visited.push(key);
        dir = next;
    }
    dir
}

/// Lexical normalization: resolve `..` and `.` without touching the
/// filesystem, so cycle detection works on not-yet-created paths too.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir => {}
            other => out.push(other),
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Subprocess-backed store
// ---------------------------------------------------------------------------

/// `rl` adapter rooted at one hook directory.
#[derive(Debug, Clone)]
pub struct RlStore {
    binary: String,
    dir: PathBuf,
}

impl RlStore {
    pub fn new(hook_dir: &Path) -> Self {
        Self {
            binary: "rl".to_string(),
            dir: hook_dir.to_path_buf(),
        }
    }

    pub fn with_binary(hook_dir: &Path, binary: &str) -> Self {
        Self {
            binary: binary.to_string(),
            dir: hook_dir.to_path_buf(),
        }
    }

    pub fn hook_dir(&self) -> &Path {
        &self.dir
    }

    fn tool(&self) -> Tool {
        Tool::new(&self.binary).current_dir(&self.dir)
    }
}

impl BeadStore for RlStore {
    fn exists(&self, id: &str) -> anyhow::Result<bool> {
        match self.show(id) {
            Ok(_) => Ok(true),
            Err(e) => match e.downcast_ref::<HordeError>() {
                Some(HordeError::NotFound { .. }) => Ok(false),
                _ => Err(e),
            },
        }
    }

    fn show(&self, id: &str) -> anyhow::Result<Bead> {
        let output = self.tool().args(&["show", id, "--json"]).run_ok()?;
        // The tool exits 0 with empty stdout for a missing bead.
        if output.stdout.trim().is_empty() {
            return Err(HordeError::NotFound {
                what: "bead",
                id: id.to_string(),
            }
            .into());
        }
        output.parse_json()
    }

    fn create(&self, opts: &CreateBead) -> anyhow::Result<Bead> {
        let priority;
        let mut tool = self
            .tool()
            .args(&["create", "--type", &opts.bead_type, "--title", &opts.title])
            .args(&["--description", &opts.description, "--json"]);
        if let Some(ref id) = opts.id {
            tool = tool.args(&["--id", id]);
        }
        for label in &opts.labels {
            tool = tool.args(&["--label", label]);
        }
        if let Some(p) = opts.priority {
            priority = p.to_string();
            tool = tool.args(&["--priority", &priority]);
        }
        let output = tool.run_ok()?;
        if let Ok(bead) = output.parse_json::<Bead>() {
            return Ok(bead);
        }
        // Older tool versions print "Created <id>" instead of JSON.
        let id = extract_bead_id(&output.stdout).ok_or_else(|| {
            HordeError::Transient(format!("could not parse create output: {}", output.stdout))
        })?;
        let mut bead = Bead::new(&id);
        bead.title.clone_from(&opts.title);
        bead.bead_type.clone_from(&opts.bead_type);
        bead.description.clone_from(&opts.description);
        Ok(bead)
    }

    fn update(&self, id: &str, patch: &BeadPatch) -> anyhow::Result<()> {
        let mut tool = self.tool().args(&["update", id]);
        if let Some(status) = patch.status {
            tool = tool.args(&["--status", status.as_str()]);
        }
        if let Some(ref assignee) = patch.assignee {
            tool = tool.args(&["--assignee", assignee]);
        }
        for label in &patch.add_labels {
            tool = tool.args(&["--add-label", label]);
        }
        for label in &patch.remove_labels {
            tool = tool.args(&["--remove-label", label]);
        }
        if let Some(ref description) = patch.description {
            tool = tool.args(&["--description", description]);
        }
        tool.run_ok()?;
        Ok(())
    }

    fn list(&self, filter: &BeadFilter) -> anyhow::Result<Vec<Bead>> {
        let mut tool = self.tool().arg("list");
        if let Some(status) = filter.status {
            tool = tool.args(&["--status", status.as_str()]);
        }
        if let Some(ref assignee) = filter.assignee {
            tool = tool.args(&["--assignee", assignee]);
        }
        if let Some(ref bead_type) = filter.bead_type {
            tool = tool.args(&["--type", bead_type]);
        }
        if let Some(ref label) = filter.label {
            tool = tool.args(&["--label", label]);
        }
        if let Some(ref parent) = filter.parent {
            tool = tool.args(&["--parent", parent]);
        }
        let output = tool.arg("--json").run_ok()?;
        if output.stdout.trim().is_empty() {
            return Ok(Vec::new());
        }
        output.parse_json()
    }

    fn close(&self, id: &str, reason: &str) -> anyhow::Result<()> {
        self.tool()
            .args(&["close", id, "--reason", reason])
            .run_ok()?;
        Ok(())
    }

    fn set_slot(
        &self,
        agent_bead_id: &str,
        slot: &str,
        value: Option<&str>,
    ) -> anyhow::Result<()> {
        let result = match value {
            Some(v) => self
                .tool()
                .args(&["slot", "set", agent_bead_id, slot, v])
                .run_ok(),
            None => self
                .tool()
                .args(&["slot", "clear", agent_bead_id, slot])
                .run_ok(),
        };
        result.map_err(|e| {
            match e.downcast_ref::<HordeError>() {
                // A racing writer already holds the slot.
                Some(HordeError::ToolFailed { message, .. })
                    if message.contains("held") || message.contains("conflict") =>
                {
                    HordeError::Conflict(format!("slot {slot} on {agent_bead_id}")).into()
                }
                _ => e,
            }
        })?;
        Ok(())
    }

    fn add_dep(&self, parent: &str, child: &str, dep_type: &str) -> anyhow::Result<()> {
        let type_arg = format!("--type={dep_type}");
        self.tool()
            .args(&["dep", "add", parent, child, &type_arg])
            .run_ok()?;
        Ok(())
    }

    fn wisp(&self, ritual: &str, vars: &[(String, String)]) -> anyhow::Result<String> {
        let mut tool = self.tool().args(&["mol", "wisp", ritual]);
        let rendered: Vec<String> = vars.iter().map(|(k, v)| format!("{k}={v}")).collect();
        for pair in &rendered {
            tool = tool.args(&["--var", pair]);
        }
        let output = tool.arg("--json").run_ok()?;
        parse_root_id(&output.stdout)
            .ok_or_else(|| HordeError::Transient("wisp returned no root id".into()).into())
    }

    fn bond(&self, root: &str, bead: &str) -> anyhow::Result<String> {
        let output = self
            .tool()
            .args(&["mol", "bond", root, bead, "--json"])
            .run_ok()?;
        parse_root_id(&output.stdout)
            .ok_or_else(|| HordeError::Transient("bond returned no root id".into()).into())
    }

    fn invoke(&self, ritual: &str) -> anyhow::Result<()> {
        self.tool().args(&["invoke", ritual]).run_ok()?;
        Ok(())
    }

    fn agent_state(&self, agent_bead_id: &str, state: &str) -> anyhow::Result<()> {
        self.tool()
            .args(&["agent", "state", agent_bead_id, state])
            .run_ok()?;
        Ok(())
    }
}

fn parse_root_id(stdout: &str) -> Option<String> {
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(stdout) {
        if let Some(root) = value.get("root").and_then(|r| r.as_str()) {
            return Some(root.to_string());
        }
        if let Some(id) = value.get("id").and_then(|r| r.as_str()) {
            return Some(id.to_string());
        }
    }
    extract_bead_id(stdout)
}

/// Pull the first bead-id-shaped token out of tool output.
pub fn extract_bead_id(output: &str) -> Option<String> {
    output
        .split_whitespace()
        .map(|t| t.trim_matches(|c: char| !c.is_ascii_alphanumeric() && c != '-' && c != '.'))
        .map(|t| t.trim_end_matches('.'))
        .find(|t| looks_like_bead_id(t))
        .map(ToString::to_string)
}

#[cfg(test)]
pub mod testing {
    //! In-memory bead store for lifecycle/dispatch tests.

    use std::sync::Mutex;

    use super::{
        BTreeMap, Bead, BeadFilter, BeadPatch, BeadStatus, BeadStore, CreateBead, HordeError,
    };

    #[derive(Debug, Default)]
    pub struct MemoryStore {
        pub beads: Mutex<BTreeMap<String, Bead>>,
        pub deps: Mutex<Vec<(String, String, String)>>,
        pub invoked: Mutex<Vec<String>>,
        pub agent_states: Mutex<Vec<(String, String)>>,
        pub wisp_count: Mutex<u32>,
    }

    impl MemoryStore {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn seed(&self, bead: Bead) {
            self.beads.lock().unwrap().insert(bead.id.clone(), bead);
        }

        pub fn get(&self, id: &str) -> Option<Bead> {
            self.beads.lock().unwrap().get(id).cloned()
        }
    }

    // Shared handle so store-resolver fakes can hand out owned boxes.
    impl BeadStore for std::sync::Arc<MemoryStore> {
        fn exists(&self, id: &str) -> anyhow::Result<bool> {
            (**self).exists(id)
        }
        fn show(&self, id: &str) -> anyhow::Result<Bead> {
            (**self).show(id)
        }
        fn create(&self, opts: &CreateBead) -> anyhow::Result<Bead> {
            (**self).create(opts)
        }
        fn update(&self, id: &str, patch: &BeadPatch) -> anyhow::Result<()> {
            (**self).update(id, patch)
        }
        fn list(&self, filter: &BeadFilter) -> anyhow::Result<Vec<Bead>> {
            (**self).list(filter)
        }
        fn close(&self, id: &str, reason: &str) -> anyhow::Result<()> {
            (**self).close(id, reason)
        }
        fn set_slot(
            &self,
            agent_bead_id: &str,
            slot: &str,
            value: Option<&str>,
        ) -> anyhow::Result<()> {
            (**self).set_slot(agent_bead_id, slot, value)
        }
        fn add_dep(&self, parent: &str, child: &str, dep_type: &str) -> anyhow::Result<()> {
            (**self).add_dep(parent, child, dep_type)
        }
        fn wisp(&self, ritual: &str, vars: &[(String, String)]) -> anyhow::Result<String> {
            (**self).wisp(ritual, vars)
        }
        fn bond(&self, root: &str, bead: &str) -> anyhow::Result<String> {
            (**self).bond(root, bead)
        }
        fn invoke(&self, ritual: &str) -> anyhow::Result<()> {
            (**self).invoke(ritual)
        }
        fn agent_state(&self, agent_bead_id: &str, state: &str) -> anyhow::Result<()> {
            (**self).agent_state(agent_bead_id, state)
        }
    }

    impl BeadStore for MemoryStore {
        fn exists(&self, id: &str) -> anyhow::Result<bool> {
            Ok(self.beads.lock().unwrap().contains_key(id))
        }

        fn show(&self, id: &str) -> anyhow::Result<Bead> {
            self.get(id).ok_or_else(|| {
                HordeError::NotFound {
                    what: "bead",
                    id: id.to_string(),
                }
                .into()
            })
        }

        fn create(&self, opts: &CreateBead) -> anyhow::Result<Bead> {
            let mut beads = self.beads.lock().unwrap();
            let id = opts
                .id
                .clone()
                .unwrap_or_else(|| format!("gp-{}", beads.len() + 1));
            let mut bead = Bead::new(&id);
            bead.title.clone_from(&opts.title);
            bead.bead_type.clone_from(&opts.bead_type);
            bead.description.clone_from(&opts.description);
            bead.labels.clone_from(&opts.labels);
            if let Some(p) = opts.priority {
                bead.priority = p;
            }
            beads.insert(id, bead.clone());
            Ok(bead)
        }

        fn update(&self, id: &str, patch: &BeadPatch) -> anyhow::Result<()> {
            let mut beads = self.beads.lock().unwrap();
            let bead = beads.get_mut(id).ok_or(HordeError::NotFound {
                what: "bead",
                id: id.to_string(),
            })?;
            if let Some(status) = patch.status {
                bead.status = status;
            }
            if let Some(ref assignee) = patch.assignee {
                bead.assignee.clone_from(assignee);
            }
            for label in &patch.add_labels {
                if !bead.labels.contains(label) {
                    bead.labels.push(label.clone());
                }
            }
            bead.labels.retain(|l| !patch.remove_labels.contains(l));
            if let Some(ref description) = patch.description {
                bead.description.clone_from(description);
            }
            Ok(())
        }

        fn list(&self, filter: &BeadFilter) -> anyhow::Result<Vec<Bead>> {
            Ok(self
                .beads
                .lock()
                .unwrap()
                .values()
                .filter(|b| {
                    filter.status.is_none_or(|s| b.status == s)
                        && filter.assignee.as_ref().is_none_or(|a| &b.assignee == a)
                        && filter
                            .bead_type
                            .as_ref()
                            .is_none_or(|t| &b.bead_type == t)
                        && filter.label.as_ref().is_none_or(|l| b.labels.contains(l))
                        && filter.parent.as_ref().is_none_or(|p| &b.parent == p)
                })
                .cloned()
                .collect())
        }

        fn close(&self, id: &str, reason: &str) -> anyhow::Result<()> {
            let mut beads = self.beads.lock().unwrap();
            let bead = beads.get_mut(id).ok_or(HordeError::NotFound {
                what: "bead",
                id: id.to_string(),
            })?;
            bead.status = BeadStatus::Closed;
            bead.description = super::description_set(&bead.description, "close_reason", reason);
            Ok(())
        }

        fn set_slot(
            &self,
            agent_bead_id: &str,
            slot: &str,
            value: Option<&str>,
        ) -> anyhow::Result<()> {
            let mut beads = self.beads.lock().unwrap();
            let bead = beads.get_mut(agent_bead_id).ok_or(HordeError::NotFound {
                what: "agent-bead",
                id: agent_bead_id.to_string(),
            })?;
            match value {
                Some(v) => {
                    bead.slots.insert(slot.to_string(), v.to_string());
                }
                None => {
                    bead.slots.remove(slot);
                }
            }
            Ok(())
        }

        fn add_dep(&self, parent: &str, child: &str, dep_type: &str) -> anyhow::Result<()> {
            self.deps.lock().unwrap().push((
                parent.to_string(),
                child.to_string(),
                dep_type.to_string(),
            ));
            Ok(())
        }

        fn wisp(&self, ritual: &str, _vars: &[(String, String)]) -> anyhow::Result<String> {
            let mut count = self.wisp_count.lock().unwrap();
            *count += 1;
            let id = format!("wp-{ritual}{count}");
            drop(count);
            let mut bead = Bead::new(&id);
            bead.bead_type = "wisp".to_string();
            self.seed(bead);
            Ok(id)
        }

        fn bond(&self, root: &str, _bead: &str) -> anyhow::Result<String> {
            Ok(root.to_string())
        }

        fn invoke(&self, ritual: &str) -> anyhow::Result<()> {
            self.invoked.lock().unwrap().push(ritual.to_string());
            Ok(())
        }

        fn agent_state(&self, agent_bead_id: &str, state: &str) -> anyhow::Result<()> {
            self.agent_states
                .lock()
                .unwrap()
                .push((agent_bead_id.to_string(), state.to_string()));
            Ok(())
        }
    }
}

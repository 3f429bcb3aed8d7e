//! Terminal multiplexer driver.
//!
//! A thin adapter over `tmux`: session lifecycle, pane capture, key
//! delivery. Everything the orchestrator tells an agent goes through
//! [`signal_session`] — literal paste, a debounce that outlasts the
//! assistant's input coalescing window, then Enter as a separate command.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::Context;

use crate::error::HordeError;
use crate::resolve::ENV_NO_NUDGE;
use crate::subprocess::Tool;

/// Minimum wait between the literal paste and the Enter keystroke.
///
/// Interactive assistants coalesce rapid input; sending Enter inside that
/// window folds the newline into the paste instead of submitting it.
pub const PASTE_DEBOUNCE: Duration = Duration::from_millis(500);

/// How long to wait for an agent process to replace the pane's shell.
pub const READY_TIMEOUT: Duration = Duration::from_secs(8);

/// Poll interval for readiness checks.
const READY_POLL: Duration = Duration::from_millis(250);

/// Session operations the orchestrator needs from a multiplexer.
pub trait Mux: Send + Sync {
    fn has_session(&self, name: &str) -> anyhow::Result<bool>;
    fn new_session_with_command(
        &self,
        name: &str,
        cwd: &Path,
        argv: &[String],
    ) -> anyhow::Result<()>;
    fn kill_session(&self, name: &str) -> anyhow::Result<()>;
    fn list_sessions(&self) -> anyhow::Result<Vec<String>>;
    fn capture_pane(&self, name: &str, lines: u32) -> anyhow::Result<String>;
    fn pane_workdir(&self, name: &str) -> anyhow::Result<PathBuf>;
    fn set_environment(&self, name: &str, key: &str, value: &str) -> anyhow::Result<()>;
    /// Send a key by name (`Enter`, `C-c`, ...), interpreted by the mux.
    fn send_keys_raw(&self, name: &str, key: &str) -> anyhow::Result<()>;
    /// Send text byte-for-byte, no key interpretation.
    fn send_keys_literal(&self, name: &str, text: &str) -> anyhow::Result<()>;
    /// Name of the pane's foreground process.
    fn foreground_command(&self, name: &str) -> anyhow::Result<String>;
    /// Pid of the pane's root process; lock files record it as the session
    /// owner once the pane exists.
    fn pane_pid(&self, name: &str) -> anyhow::Result<u32>;
    /// Attach or link the caller's terminal to the session.
    fn attach(&self, name: &str) -> anyhow::Result<()>;
}

/// Driver over the `tmux` binary.
#[derive(Debug, Clone, Default)]
pub struct TmuxDriver;

impl TmuxDriver {
    pub fn new() -> Self {
        Self
    }

    // `=` forces exact session-name match; bare names are prefix matches.
    fn target(name: &str) -> String {
        format!("={name}")
    }
}

impl Mux for TmuxDriver {
    fn has_session(&self, name: &str) -> anyhow::Result<bool> {
        let output = Tool::new("tmux")
            .args(&["has-session", "-t", &Self::target(name)])
            .run()?;
        Ok(output.success())
    }

    fn new_session_with_command(
        &self,
        name: &str,
        cwd: &Path,
        argv: &[String],
    ) -> anyhow::Result<()> {
        let cwd_str = cwd.display().to_string();
        let mut args = vec!["new-session", "-d", "-s", name, "-c", &cwd_str];
        let argv_refs: Vec<&str> = argv.iter().map(String::as_str).collect();
        args.extend_from_slice(&argv_refs);
        Tool::new("tmux")
            .args(&args)
            .run_ok()
            .with_context(|| format!("creating session {name}"))?;
        Ok(())
    }

    fn kill_session(&self, name: &str) -> anyhow::Result<()> {
        Tool::new("tmux")
            .args(&["kill-session", "-t", &Self::target(name)])
            .run_ok()
            .with_context(|| format!("killing session {name}"))?;
        Ok(())
    }

    fn list_sessions(&self) -> anyhow::Result<Vec<String>> {
        let output = Tool::new("tmux")
            .args(&["list-sessions", "-F", "#{session_name}"])
            .run()?;
        if !output.success() {
            // No server running means no sessions.
            return Ok(Vec::new());
        }
        Ok(output
            .stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(ToString::to_string)
            .collect())
    }

    fn capture_pane(&self, name: &str, lines: u32) -> anyhow::Result<String> {
        let start = format!("-{lines}");
        let output = Tool::new("tmux")
            .args(&["capture-pane", "-p", "-t", &Self::target(name), "-S", &start])
            .run_ok()
            .with_context(|| format!("capturing pane of {name}"))?;
        Ok(output.stdout)
    }

    fn pane_workdir(&self, name: &str) -> anyhow::Result<PathBuf> {
        let output = Tool::new("tmux")
            .args(&[
                "display-message",
                "-p",
                "-t",
                &Self::target(name),
                "#{pane_current_path}",
            ])
            .run_ok()?;
        Ok(PathBuf::from(output.stdout.trim()))
    }

    fn set_environment(&self, name: &str, key: &str, value: &str) -> anyhow::Result<()> {
        Tool::new("tmux")
            .args(&["set-environment", "-t", &Self::target(name), key, value])
            .run_ok()?;
        Ok(())
    }

    fn send_keys_raw(&self, name: &str, key: &str) -> anyhow::Result<()> {
        Tool::new("tmux")
            .args(&["send-keys", "-t", &Self::target(name), key])
            .run_ok()?;
        Ok(())
    }

    fn send_keys_literal(&self, name: &str, text: &str) -> anyhow::Result<()> {
        Tool::new("tmux")
            .args(&["send-keys", "-t", &Self::target(name), "-l", "--", text])
            .run_ok()?;
        Ok(())
    }

    fn foreground_command(&self, name: &str) -> anyhow::Result<String> {
        let output = Tool::new("tmux")
            .args(&[
                "display-message",
                "-p",
                "-t",
                &Self::target(name),
                "#{pane_current_command}",
            ])
            .run_ok()?;
        Ok(output.stdout.trim().to_string())
    }

    fn pane_pid(&self, name: &str) -> anyhow::Result<u32> {
        let output = Tool::new("tmux")
            .args(&[
                "display-message",
                "-p",
                "-t",
                &Self::target(name),
                "#{pane_pid}",
            ])
            .run_ok()?;
        output
            .stdout
            .trim()
            .parse()
            .with_context(|| format!("parsing pane pid for {name}"))
    }

    fn attach(&self, name: &str) -> anyhow::Result<()> {
        // Inside tmux, switch the current client; outside, attach.
        let inside = std::env::var("TMUX").is_ok();
        let verb = if inside { "switch-client" } else { "attach-session" };
        let status = std::process::Command::new("tmux")
            .args([verb, "-t", &Self::target(name)])
            .status()
            .with_context(|| format!("attaching to {name}"))?;
        if status.success() {
            Ok(())
        } else {
            anyhow::bail!("tmux {verb} failed for {name}")
        }
    }
}

/// Deliver `text` to the pane as exactly one user input.
///
/// `HD_TEST_NO_NUDGE` short-circuits to success without touching the pane.
pub fn signal_session(mux: &dyn Mux, name: &str, text: &str) -> anyhow::Result<()> {
    signal_session_with_debounce(mux, name, text, PASTE_DEBOUNCE)
}

pub fn signal_session_with_debounce(
    mux: &dyn Mux,
    name: &str,
    text: &str,
    debounce: Duration,
) -> anyhow::Result<()> {
    signal_session_inner(mux, name, text, debounce, nudges_suppressed())
}

/// True when the test harness asked for signal emission to be skipped.
pub fn nudges_suppressed() -> bool {
    std::env::var(ENV_NO_NUDGE).is_ok()
}

fn signal_session_inner(
    mux: &dyn Mux,
    name: &str,
    text: &str,
    debounce: Duration,
    suppressed: bool,
) -> anyhow::Result<()> {
    if suppressed {
        tracing::debug!(session = name, "nudge suppressed by {}", ENV_NO_NUDGE);
        return Ok(());
    }
    mux.send_keys_literal(name, text)
        .with_context(|| format!("pasting into {name}"))?;
    // Unconditional: the assistant's debounce window must close before Enter.
    std::thread::sleep(debounce);
    mux.send_keys_raw(name, "Enter")
        .with_context(|| format!("submitting input in {name}"))?;
    Ok(())
}

/// Poll until the pane's foreground process is no longer a shell, or fail
/// after `timeout`.
pub fn wait_for_command(
    mux: &dyn Mux,
    name: &str,
    allowed_shells: &[String],
    timeout: Duration,
) -> anyhow::Result<()> {
    let deadline = Instant::now() + timeout;
    loop {
        let command = mux.foreground_command(name)?;
        if !allowed_shells.iter().any(|s| s == &command) {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(HordeError::Timeout {
                tool: format!("session {name}"),
                timeout_secs: timeout.as_secs(),
            }
            .into());
        }
        std::thread::sleep(READY_POLL);
    }
}

/// If the pane is showing the assistant's bypass-permissions warning, enter
/// its acceptance key. Best-effort: all failures are swallowed.
pub fn accept_bypass_permissions_warning(mux: &dyn Mux, name: &str) {
    let Ok(pane) = mux.capture_pane(name, 50) else {
        return;
    };
    if pane.contains("Bypass Permissions") || pane.contains("bypass permissions") {
        let _ = mux.send_keys_raw(name, "2");
        std::thread::sleep(Duration::from_millis(500));
        let _ = mux.send_keys_raw(name, "Enter");
    }
}

#[cfg(test)]
pub mod testing {
    //! In-memory mux used by lifecycle and dispatch tests.

    use std::collections::HashMap;
    use std::sync::Mutex;

    use super::{Mux, Path, PathBuf};

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Call {
        NewSession(String),
        KillSession(String),
        SetEnv(String, String, String),
        SendRaw(String, String),
        SendLiteral(String, String),
    }

    #[derive(Debug, Default)]
    pub struct FakeMux {
        pub calls: Mutex<Vec<Call>>,
        sessions: Mutex<HashMap<String, PathBuf>>,
        /// Foreground command reported for every session.
        pub foreground: Mutex<String>,
        /// Pane text reported by capture_pane.
        pub pane_text: Mutex<String>,
        /// When true, send operations fail.
        pub fail_sends: Mutex<bool>,
    }

    impl FakeMux {
        pub fn new() -> Self {
            let fake = Self::default();
            *fake.foreground.lock().unwrap() = "claude".to_string();
            fake
        }

        pub fn with_session(self, name: &str) -> Self {
            self.sessions
                .lock()
                .unwrap()
                .insert(name.to_string(), PathBuf::from("/"));
            self
        }

        pub fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }

        fn record(&self, call: Call) {
            self.calls.lock().unwrap().push(call);
        }
    }

    impl Mux for FakeMux {
        fn has_session(&self, name: &str) -> anyhow::Result<bool> {
            Ok(self.sessions.lock().unwrap().contains_key(name))
        }

        fn new_session_with_command(
            &self,
            name: &str,
            cwd: &Path,
            _argv: &[String],
        ) -> anyhow::Result<()> {
            self.record(Call::NewSession(name.to_string()));
            self.sessions
                .lock()
                .unwrap()
                .insert(name.to_string(), cwd.to_path_buf());
            Ok(())
        }

        fn kill_session(&self, name: &str) -> anyhow::Result<()> {
            self.record(Call::KillSession(name.to_string()));
            self.sessions.lock().unwrap().remove(name);
            Ok(())
        }

        fn list_sessions(&self) -> anyhow::Result<Vec<String>> {
            let mut names: Vec<String> =
                self.sessions.lock().unwrap().keys().cloned().collect();
            names.sort();
            Ok(names)
        }

        fn capture_pane(&self, _name: &str, _lines: u32) -> anyhow::Result<String> {
            Ok(self.pane_text.lock().unwrap().clone())
        }

        fn pane_workdir(&self, name: &str) -> anyhow::Result<PathBuf> {
            self.sessions
                .lock()
                .unwrap()
                .get(name)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("no session {name}"))
        }

        fn set_environment(&self, name: &str, key: &str, value: &str) -> anyhow::Result<()> {
            self.record(Call::SetEnv(
                name.to_string(),
                key.to_string(),
                value.to_string(),
            ));
            Ok(())
        }

        fn send_keys_raw(&self, name: &str, key: &str) -> anyhow::Result<()> {
            if *self.fail_sends.lock().unwrap() {
                anyhow::bail!("send failed");
            }
            self.record(Call::SendRaw(name.to_string(), key.to_string()));
            Ok(())
        }

        fn send_keys_literal(&self, name: &str, text: &str) -> anyhow::Result<()> {
            if *self.fail_sends.lock().unwrap() {
                anyhow::bail!("send failed");
            }
            self.record(Call::SendLiteral(name.to_string(), text.to_string()));
            Ok(())
        }

        fn foreground_command(&self, _name: &str) -> anyhow::Result<String> {
            Ok(self.foreground.lock().unwrap().clone())
        }

        fn pane_pid(&self, _name: &str) -> anyhow::Result<u32> {
            // Our own pid, so lock-liveness checks in tests see a live owner.
            Ok(std::process::id())
        }

        fn attach(&self, _name: &str) -> anyhow::Result<()> {
            Ok(())
        }
    }
}

//! Launch-command construction.
//!
//! Sessions run inside a tmux session named after the session id, so the assistant
//! survives a restart of this process. The spawned shell first removes any stale tmux
//! session of the same name and then creates a fresh one.

use std::path::Path;

use crate::config::{Multiplexer, ProcessConfig};

const BYPASS_PERMISSIONS_FLAG: &str = "--dangerously-skip-permissions";

/// Derive a tmux-safe session name: lowercase, every non-alphanumeric character
/// replaced by `-`.
pub fn multiplexer_name(session_id: &str) -> String {
    let name: String = session_id
        .chars()
        .flat_map(char::to_lowercase)
        .map(|c| {
            if c.is_ascii_lowercase() || c.is_ascii_digit() {
                c
            } else {
                '-'
            }
        })
        .collect();

    if name.is_empty() {
        "session".to_string()
    } else {
        name
    }
}

/// Quote `value` for POSIX `sh`.
pub fn shell_quote(value: &str) -> String {
    if !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:@%+,".contains(c))
    {
        return value.to_string();
    }
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Program and arguments for the PTY child.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchPlan {
    pub program: String,
    pub args: Vec<String>,
    pub multiplexer_name: String,
}

impl LaunchPlan {
    pub fn new(
        config: &ProcessConfig,
        session_id: &str,
        working_directory: &Path,
        command: &str,
        bypass_permissions: bool,
    ) -> Self {
        let name = multiplexer_name(session_id);
        let assistant = if bypass_permissions {
            format!("{} {}", command.trim_end(), BYPASS_PERMISSIONS_FLAG)
        } else {
            command.to_string()
        };

        let script = match config.multiplexer {
            Multiplexer::None => format!("exec {}", assistant),
            Multiplexer::Tmux => {
                let tmux = shell_quote(&config.tmux_bin);
                let target = shell_quote(&format!("={}", name));
                let quoted_name = shell_quote(&name);
                let cwd = shell_quote(&working_directory.to_string_lossy());
                let command = shell_quote(&assistant);
                if config.reattach_existing {
                    format!(
                        "exec {tmux} new-session -A -s {quoted_name} -c {cwd} {command}"
                    )
                } else {
                    format!(
                        "{tmux} kill-session -t {target} 2>/dev/null; exec {tmux} new-session -s {quoted_name} -c {cwd} {command}"
                    )
                }
            }
        };

        Self {
            program: config.shell.clone(),
            args: vec!["-c".to_string(), script],
            multiplexer_name: name,
        }
    }

    pub fn script(&self) -> &str {
        self.args.last().map(String::as_str).unwrap_or_default()
    }
}

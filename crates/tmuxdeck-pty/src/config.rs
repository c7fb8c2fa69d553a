//! Runtime configuration.
//!
//! Loaded from the OS-appropriate config directory:
//! - macOS: `~/Library/Application Support/tmuxdeck/config.json`
//! - Linux: `~/.config/tmuxdeck/config.json`
//!
//! Every field has a default, so a missing or partial file is fine.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tmuxdeck_terminal::Patterns;

const APP_NAME: &str = "tmuxdeck";
const CONFIG_FILE: &str = "config.json";
const PROJECTS_FILE: &str = "projects.json";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub buffer: BufferConfig,
    pub status: StatusConfig,
    pub process: ProcessConfig,
    pub subscriber: SubscriberConfig,
    /// Project metadata file. Defaults to `projects.json` next to the config file.
    pub projects_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    pub max_chunks: usize,
    pub max_bytes: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            max_chunks: 1000,
            max_bytes: 200_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StatusConfig {
    /// Delay before a bare completion marker becomes `ready`.
    pub ready_delay_ms: u64,
    /// Minimum spacing between heuristic transitions.
    pub flap_window_ms: u64,
    pub patterns: Patterns,
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            ready_delay_ms: 1500,
            flap_window_ms: 400,
            patterns: Patterns::default(),
        }
    }
}

impl StatusConfig {
    pub fn ready_delay(&self) -> Duration {
        Duration::from_millis(self.ready_delay_ms)
    }

    pub fn flap_window(&self) -> Duration {
        Duration::from_millis(self.flap_window_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Multiplexer {
    #[default]
    Tmux,
    /// Run the launch command directly, without a tmux wrapper.
    None,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessConfig {
    pub multiplexer: Multiplexer,
    pub tmux_bin: String,
    pub shell: String,
    pub cols: u16,
    pub rows: u16,
    /// Attach to a same-named tmux session instead of replacing it.
    pub reattach_existing: bool,
    /// Time between the polite signal and SIGKILL.
    pub kill_grace_ms: u64,
    /// How long an exited session stays registered while its exit is delivered.
    pub exit_echo_ms: u64,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            multiplexer: Multiplexer::Tmux,
            tmux_bin: "tmux".to_string(),
            shell: "/bin/sh".to_string(),
            cols: 120,
            rows: 40,
            reattach_existing: false,
            kill_grace_ms: 3000,
            exit_echo_ms: 1000,
        }
    }
}

impl ProcessConfig {
    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }

    pub fn exit_echo(&self) -> Duration {
        Duration::from_millis(self.exit_echo_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SubscriberConfig {
    /// Per-subscriber outbound queue bound; oldest events are dropped beyond it.
    pub queue_capacity: usize,
}

impl Default for SubscriberConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
        }
    }
}

impl Config {
    /// Default config file location.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join(APP_NAME).join(CONFIG_FILE))
    }

    /// Load from `path` (or the default location). Falls back to defaults on any error.
    pub fn load(path: Option<&Path>) -> Self {
        let path = match path {
            Some(p) => Some(p.to_path_buf()),
            None => Self::default_path(),
        };
        let Some(path) = path else {
            return Self::default();
        };

        match fs::read_to_string(&path) {
            Ok(contents) => serde_json::from_str(&contents).unwrap_or_else(|e| {
                tracing::warn!("Failed to parse config file {:?}: {}", path, e);
                Self::default()
            }),
            Err(_) => Self::default(),
        }
    }

    pub fn projects_path(&self) -> Option<PathBuf> {
        self.projects_file.clone().or_else(|| {
            dirs::config_dir().map(|dir| dir.join(APP_NAME).join(PROJECTS_FILE))
        })
    }
}

//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables** — `STUDIOD_LISTEN`, `STUDIOD_ASSISTANT_BIN`
//! 2. **Config file** — path via `--config <path>`, or `studiod.toml` in CWD
//! 3. **Compiled defaults** — see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [server]
//! listen = "127.0.0.1:4333"
//! default_terminal_rows = 24
//! default_terminal_cols = 80
//!
//! [shell]
//! default_shell = "/bin/bash"
//! default_working_dir = "~"
//!
//! [assistant]
//! binary = "claude"
//! terminal_rows = 50
//! terminal_cols = 200
//!
//! [watcher]
//! # Defaults to ~/.claude/projects when omitted
//! # log_root = "/home/user/.claude/projects"
//!
//! [logging]
//! level = "info"
//! ```

use serde::Deserialize;
use std::path::Path;

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub shell: ShellConfig,
    #[serde(default)]
    pub assistant: AssistantConfig,
    #[serde(default)]
    pub watcher: WatcherConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// HTTP server settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Socket address to bind (default `127.0.0.1:4333`).
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Default terminal rows for shell sessions (default 24).
    #[serde(default = "default_terminal_rows")]
    pub default_terminal_rows: u16,
    /// Default terminal columns for shell sessions (default 80).
    #[serde(default = "default_terminal_cols")]
    pub default_terminal_cols: u16,
}

/// Shell defaults for terminal sessions.
#[derive(Debug, Clone, Deserialize)]
pub struct ShellConfig {
    /// Shell binary for terminal sessions (default `/bin/bash`).
    #[serde(default = "default_shell")]
    pub default_shell: String,
    /// Working directory when a terminal request doesn't name one (default `~`).
    #[serde(default = "default_working_dir")]
    pub default_working_dir: String,
}

/// Assistant CLI settings.
#[derive(Debug, Clone, Deserialize)]
pub struct AssistantConfig {
    /// The assistant CLI binary. Override with `STUDIOD_ASSISTANT_BIN`.
    #[serde(default = "default_assistant_binary")]
    pub binary: String,
    /// Terminal rows for assistant sessions (default 50).
    #[serde(default = "default_assistant_rows")]
    pub terminal_rows: u16,
    /// Terminal columns for assistant sessions. Wide by default so the CLI
    /// doesn't wrap its structured output lines (default 200).
    #[serde(default = "default_assistant_cols")]
    pub terminal_cols: u16,
}

/// Subagent watcher settings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WatcherConfig {
    /// Root of the assistant CLI's per-workspace transcript directories.
    /// Defaults to `~/.claude/projects` when omitted.
    pub log_root: Option<String>,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_listen() -> String {
    "127.0.0.1:4333".to_string()
}
fn default_terminal_rows() -> u16 {
    24
}
fn default_terminal_cols() -> u16 {
    80
}
fn default_shell() -> String {
    "/bin/bash".to_string()
}
fn default_working_dir() -> String {
    "~".to_string()
}
fn default_assistant_binary() -> String {
    "claude".to_string()
}
fn default_assistant_rows() -> u16 {
    50
}
fn default_assistant_cols() -> u16 {
    200
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            default_terminal_rows: default_terminal_rows(),
            default_terminal_cols: default_terminal_cols(),
        }
    }
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            default_shell: default_shell(),
            default_working_dir: default_working_dir(),
        }
    }
}

impl Default for AssistantConfig {
    fn default() -> Self {
        Self {
            binary: default_assistant_binary(),
            terminal_rows: default_assistant_rows(),
            terminal_cols: default_assistant_cols(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, reads that file (panics on failure). Otherwise looks
    /// for `studiod.toml` in the current directory, falling back to compiled
    /// defaults.
    pub fn load(path: Option<&str>) -> Self {
        let mut config = if let Some(p) = path {
            let content = std::fs::read_to_string(p)
                .unwrap_or_else(|e| panic!("Failed to read config file {p}: {e}"));
            toml::from_str(&content)
                .unwrap_or_else(|e| panic!("Failed to parse config file {p}: {e}"))
        } else if Path::new("studiod.toml").exists() {
            let content =
                std::fs::read_to_string("studiod.toml").expect("Failed to read studiod.toml");
            toml::from_str(&content).expect("Failed to parse studiod.toml")
        } else {
            Config {
                server: ServerConfig::default(),
                shell: ShellConfig::default(),
                assistant: AssistantConfig::default(),
                watcher: WatcherConfig::default(),
                logging: LoggingConfig::default(),
            }
        };

        // Env var overrides
        if let Ok(listen) = std::env::var("STUDIOD_LISTEN") {
            config.server.listen = listen;
        }
        if let Ok(bin) = std::env::var("STUDIOD_ASSISTANT_BIN") {
            config.assistant.binary = bin;
        }

        config
    }
}

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use crate::config::language::{
    CompileConfig, FileExtension, Language, Placeholders, RunConfig,
};

pub mod language;
mod loader;

/// Example configuration embedded at compile time.
///
/// Library users can access this to generate a starter config file.
pub const EXAMPLE_CONFIG: &str = include_str!("../../runcube.example.toml");

/// Prefix for environment variables overriding configuration values
/// (e.g. `RUNCUBE_EXECUTION__TIMEOUT_SECS=10`)
pub const ENV_PREFIX: &str = "RUNCUBE";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid characters in file extension")]
    InvalidFileExtChars,

    #[error("failed to parse config: {0}")]
    Parse(#[from] config::ConfigError),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Config for runcube
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Shared root directory for execution artifacts.
    #[serde(default = "default_temp_dir")]
    pub temp_dir: PathBuf,

    /// Execution controller settings.
    #[serde(default)]
    pub execution: ExecutionSettings,

    /// Interactive shell settings.
    #[serde(default)]
    pub shell: ShellSettings,

    /// Prompt detection settings.
    #[serde(default)]
    pub prompt: PromptSettings,

    /// WebSocket server settings.
    #[serde(default)]
    pub server: ServerSettings,

    /// Language configurations keyed by language ID
    #[serde(default)]
    pub languages: HashMap<String, Language>,
}

/// Settings for compiling and running submitted code
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionSettings {
    /// Wall clock limit for the run step, in seconds
    pub timeout_secs: u64,

    /// How long to wait for output readers to drain after the compiler or program exits
    /// or is killed, in milliseconds
    pub kill_grace_ms: u64,

    /// Read buffer size for process output
    pub chunk_size: usize,
}

impl ExecutionSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }
}

impl Default for ExecutionSettings {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            kill_grace_ms: 500,
            chunk_size: 4096,
        }
    }
}

/// Settings for the per-connection pseudo-terminal shell
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShellSettings {
    /// Shell program. The host's default shell is used when unset.
    pub program: Option<String>,

    /// Arguments passed to `program`
    pub args: Vec<String>,

    /// Working directory of the shell
    pub cwd: Option<PathBuf>,

    /// Initial terminal height
    pub rows: u16,

    /// Initial terminal width
    pub cols: u16,
}

impl Default for ShellSettings {
    fn default() -> Self {
        Self {
            program: None,
            args: Vec::new(),
            cwd: None,
            rows: 24,
            cols: 80,
        }
    }
}

/// Settings for the "awaiting input" heuristic
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PromptSettings {
    /// Regex patterns replacing the built-in prompt phrasings
    pub patterns: Option<Vec<String>>,
}

/// Settings for the WebSocket endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// Address the server binds to
    pub bind: String,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8080".to_owned(),
        }
    }
}

impl Config {
    /// Create a new config with embedded default languages
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty config with no languages
    pub fn empty() -> Self {
        Self {
            temp_dir: default_temp_dir(),
            execution: ExecutionSettings::default(),
            shell: ShellSettings::default(),
            prompt: PromptSettings::default(),
            server: ServerSettings::default(),
            languages: HashMap::new(),
        }
    }

    /// Sorted language IDs
    pub fn language_ids(&self) -> Vec<&str> {
        let mut ids: Vec<_> = self.languages.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::parse_toml(EXAMPLE_CONFIG).expect("embedded default config should be valid")
    }
}

fn default_temp_dir() -> PathBuf {
    std::env::temp_dir().join("runcube")
}

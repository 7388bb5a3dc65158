use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Deserializer, Serialize, de};

use crate::config::ConfigError;

const INVALID_FILE_EXT_CHARS: [char; 2] = ['/', '.'];

/// Configuration for a programming language
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Language {
    /// Human-readable name for the language (e.g., "Java (OpenJDK)")
    pub name: String,

    /// File extension
    pub extension: FileExtension,

    /// Regex locating the name the toolchain expects the source file to carry
    /// (e.g. a public class declaration). With several capture groups, a match
    /// of an earlier group takes precedence.
    #[serde(default)]
    pub entry_pattern: Option<String>,

    /// Compilation configuration (None for interpreted languages)
    #[serde(default)]
    pub compile: Option<CompileConfig>,

    /// Execution configuration
    pub run: RunConfig,
}

impl Language {
    /// Check if the language is compiled
    pub fn is_compiled(&self) -> bool {
        self.compile.is_some()
    }

    /// Expand placeholders in the given command
    pub fn expand_command(command: &[String], placeholders: &Placeholders<'_>) -> Vec<String> {
        command
            .iter()
            .map(|arg| {
                arg.replace("{source}", placeholders.source)
                    .replace("{output}", placeholders.binary)
                    .replace("{binary}", placeholders.binary)
                    .replace("{entry}", placeholders.entry)
                    .replace("{dir}", placeholders.dir)
            })
            .collect()
    }
}

/// Values substituted into compile and run commands
#[derive(Debug, Clone, Copy)]
pub struct Placeholders<'a> {
    /// Path of the source file
    pub source: &'a str,
    /// Path of the compiled output
    pub binary: &'a str,
    /// Entry name (declared type name, or the source file stem)
    pub entry: &'a str,
    /// Working directory of the execution
    pub dir: &'a str,
}

/// File extension without dot (e.g., "cpp")
#[derive(Debug, Clone, Serialize)]
pub struct FileExtension(String);

impl FileExtension {
    pub fn new(extension: &str) -> Result<Self, ConfigError> {
        let contains_invalid = extension
            .chars()
            .any(|c| INVALID_FILE_EXT_CHARS.contains(&c));
        if contains_invalid {
            return Err(ConfigError::InvalidFileExtChars);
        }
        Ok(Self(extension.to_owned()))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl<'de> Deserialize<'de> for FileExtension {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        FileExtension::new(&s).map_err(|_| {
            de::Error::invalid_value(
                de::Unexpected::Str(&s),
                &"a file extension without '/' or '.' characters",
            )
        })
    }
}

impl std::fmt::Display for FileExtension {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Configuration for the compilation step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompileConfig {
    /// Command and arguments with placeholders
    /// Placeholders: {source}, {binary}, {entry}, {dir}
    pub command: Vec<String>,

    /// Output binary name inside the execution directory (e.g., "main")
    #[serde(default = "default_output_name")]
    pub output_name: String,

    /// Environment variables to set during compilation
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Extra installation directories searched for the compiler when it is
    /// not on PATH
    #[serde(default)]
    pub probe_paths: Vec<PathBuf>,
}

/// Configuration for the execution step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Command and arguments with placeholders
    /// Placeholders: {source}, {binary}, {entry}, {dir}
    pub command: Vec<String>,

    /// Environment variables layered over the server's own environment
    #[serde(default)]
    pub env: HashMap<String, String>,
}

fn default_output_name() -> String {
    "main".to_owned()
}

//! Language registry
//!
//! Turns the configured language table into immutable descriptors once at
//! startup, probing the host for each compiler so a missing toolchain is
//! reported precisely instead of failing as a generic spawn error.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use regex::Regex;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::{Config, Language};

/// Errors from registry construction and lookup
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("language '{0}' is not supported")]
    NotFound(String),

    #[error("language '{id}' has an invalid entry pattern: {source}")]
    InvalidEntryPattern {
        id: String,
        #[source]
        source: regex::Error,
    },
}

/// Locates toolchain programs on the host
pub trait ToolchainProbe: Send + Sync {
    /// Resolve `program` to an executable path, also searching `extra_dirs`
    fn locate(&self, program: &str, extra_dirs: &[PathBuf]) -> Option<PathBuf>;
}

/// Probe that searches the host's PATH and the configured installation directories
#[derive(Debug, Clone, Copy, Default)]
pub struct HostProbe;

impl ToolchainProbe for HostProbe {
    fn locate(&self, program: &str, extra_dirs: &[PathBuf]) -> Option<PathBuf> {
        // Already an absolute or relative path
        if program.contains('/') {
            let path = Path::new(program);
            return is_executable(path).then(|| path.to_path_buf());
        }

        let path_var = std::env::var("PATH").unwrap_or_default();
        let path_dirs = path_var.split(':').filter(|d| !d.is_empty()).map(PathBuf::from);

        path_dirs
            .chain(extra_dirs.iter().cloned())
            .map(|dir| dir.join(program))
            .find(|candidate| is_executable(candidate))
    }
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;

    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

/// A resolved command with its environment overlay
#[derive(Debug, Clone)]
pub struct Invocation {
    /// Program and arguments, with placeholders still unexpanded
    pub command: Vec<String>,

    /// Environment layered over the server's own environment
    pub env: HashMap<String, String>,
}

impl Invocation {
    /// The program name as configured
    pub fn program(&self) -> &str {
        self.command.first().map(String::as_str).unwrap_or_default()
    }
}

/// Immutable description of how to build and run one language
#[derive(Debug, Clone)]
pub struct LanguageDescriptor {
    /// Language ID used in run requests
    pub id: String,

    /// Human-readable name
    pub name: String,

    /// File extension without dot
    pub extension: String,

    /// Compile step (None for interpreted languages)
    pub compile: Option<Invocation>,

    /// Output file name of the compile step; may contain `{entry}`
    pub output_name: String,

    /// Run step
    pub run: Invocation,

    /// Pattern locating the name the source file must carry
    pub entry_pattern: Option<Regex>,

    /// False when the compiler was not found on the host
    pub compileable: bool,
}

impl LanguageDescriptor {
    /// Build a descriptor from configuration, probing for the compiler
    pub fn from_language(
        id: &str,
        language: &Language,
        probe: &dyn ToolchainProbe,
    ) -> Result<Self, RegistryError> {
        let entry_pattern = language
            .entry_pattern
            .as_deref()
            .map(Regex::new)
            .transpose()
            .map_err(|source| RegistryError::InvalidEntryPattern {
                id: id.to_owned(),
                source,
            })?;

        let mut compileable = true;
        let compile = language.compile.as_ref().map(|compile| {
            let mut command = compile.command.clone();
            match command.first().and_then(|p| probe.locate(p, &compile.probe_paths)) {
                Some(path) => {
                    debug!(language = id, compiler = %path.display(), "compiler found");
                    command[0] = path.to_string_lossy().into_owned();
                }
                None => {
                    warn!(
                        language = id,
                        compiler = ?command.first(),
                        "compiler not found, language will report ToolchainUnavailable"
                    );
                    compileable = false;
                }
            }
            Invocation {
                command,
                env: compile.env.clone(),
            }
        });

        // Runtimes are pinned when found; a missing one surfaces as a spawn error
        let mut run_command = language.run.command.clone();
        let extra_dirs = language
            .compile
            .as_ref()
            .map(|c| c.probe_paths.as_slice())
            .unwrap_or_default();
        if let Some(first) = run_command.first_mut()
            && !first.contains('{')
            && let Some(path) = probe.locate(first, extra_dirs)
        {
            *first = path.to_string_lossy().into_owned();
        }

        Ok(Self {
            id: id.to_owned(),
            name: language.name.clone(),
            extension: language.extension.to_string(),
            compile,
            output_name: language
                .compile
                .as_ref()
                .map(|c| c.output_name.clone())
                .unwrap_or_default(),
            run: Invocation {
                command: run_command,
                env: language.run.env.clone(),
            },
            entry_pattern,
            compileable,
        })
    }

    /// Check if the language has a compile step
    pub fn is_compiled(&self) -> bool {
        self.compile.is_some()
    }

    /// Default source file name
    pub fn source_name(&self) -> String {
        format!("main.{}", self.extension)
    }
}

/// Read-only table of language descriptors
#[derive(Debug, Clone, Default)]
pub struct LanguageRegistry {
    languages: HashMap<String, LanguageDescriptor>,
}

impl LanguageRegistry {
    /// Build the registry from configuration using the host probe
    pub fn from_config(config: &Config) -> Result<Self, RegistryError> {
        Self::probe(config, &HostProbe)
    }

    /// Build the registry from configuration with a custom probe
    pub fn probe(config: &Config, probe: &dyn ToolchainProbe) -> Result<Self, RegistryError> {
        let mut languages = HashMap::with_capacity(config.languages.len());
        for (id, language) in &config.languages {
            let descriptor = LanguageDescriptor::from_language(id, language, probe)?;
            languages.insert(id.clone(), descriptor);
        }

        let registry = Self { languages };
        info!(
            languages = registry.languages.len(),
            unavailable = ?registry.unavailable(),
            "language registry ready"
        );
        Ok(registry)
    }

    /// Look up a language by ID
    pub fn describe(&self, id: &str) -> Result<&LanguageDescriptor, RegistryError> {
        self.languages
            .get(id)
            .ok_or_else(|| RegistryError::NotFound(id.to_owned()))
    }

    /// All descriptors sorted by ID
    pub fn languages(&self) -> Vec<&LanguageDescriptor> {
        let mut languages: Vec<_> = self.languages.values().collect();
        languages.sort_by(|a, b| a.id.cmp(&b.id));
        languages
    }

    /// IDs of languages whose compiler is missing
    pub fn unavailable(&self) -> Vec<&str> {
        let mut ids: Vec<_> = self
            .languages
            .values()
            .filter(|d| !d.compileable)
            .map(|d| d.id.as_str())
            .collect();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.languages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.languages.is_empty()
    }
}

//! Artifact management
//!
//! Every execution gets its own `exec-<uuid>` directory under the shared temp
//! root. The source file, compiler output and anything the program writes to
//! its working directory live there, and the whole directory is removed when
//! the execution ends.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::config::{Language, Placeholders};
use crate::registry::LanguageDescriptor;

const EXECUTION_DIR_PREFIX: &str = "exec-";

/// Errors while writing artifacts
#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("failed to write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Files belonging to one execution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifacts {
    /// Per-execution working directory
    pub dir: PathBuf,

    /// Source file
    pub source: PathBuf,

    /// Compiled output (None for interpreted languages)
    pub binary: Option<PathBuf>,

    /// Entry name substituted for `{entry}`
    pub entry: String,
}

impl Artifacts {
    /// Expand a command template against these artifacts
    pub fn expand(&self, command: &[String]) -> Vec<String> {
        let source = self.source.to_string_lossy();
        let binary = self
            .binary
            .as_deref()
            .map(Path::to_string_lossy)
            .unwrap_or_else(|| source.clone());
        let dir = self.dir.to_string_lossy();

        Language::expand_command(
            command,
            &Placeholders {
                source: &source,
                binary: &binary,
                entry: &self.entry,
                dir: &dir,
            },
        )
    }
}

/// Creates and removes execution artifacts under a shared root
#[derive(Debug, Clone)]
pub struct ArtifactManager {
    root: PathBuf,
}

impl ArtifactManager {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root directory shared by all sessions
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory reserved for an execution
    pub fn execution_dir(&self, id: Uuid) -> PathBuf {
        self.root.join(format!("{EXECUTION_DIR_PREFIX}{id}"))
    }

    /// Write `code` to a fresh source file for the given execution
    #[instrument(skip(self, code, descriptor), fields(language = %descriptor.id))]
    pub async fn write_source(
        &self,
        id: Uuid,
        code: &str,
        descriptor: &LanguageDescriptor,
    ) -> Result<Artifacts, ArtifactError> {
        let dir = self.execution_dir(id);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|source| ArtifactError::Io {
                path: dir.clone(),
                source,
            })?;

        let source = dir.join(descriptor.source_name());
        tokio::fs::write(&source, code)
            .await
            .map_err(|e| ArtifactError::Io {
                path: source.clone(),
                source: e,
            })?;

        debug!(?source, len = code.len(), "wrote source file");

        let entry = file_stem(&source);
        let binary = binary_path(&dir, descriptor, &entry);
        Ok(Artifacts {
            dir,
            source,
            binary,
            entry,
        })
    }

    /// Rename the source file to the name its declaration requires
    ///
    /// Languages without an entry pattern, and sources without a matching
    /// declaration, are returned unchanged.
    #[instrument(skip(self, artifacts, code, descriptor), fields(language = %descriptor.id))]
    pub async fn reconcile_entry_name(
        &self,
        artifacts: Artifacts,
        code: &str,
        descriptor: &LanguageDescriptor,
    ) -> Result<Artifacts, ArtifactError> {
        let Some(entry) = detect_entry_name(code, descriptor) else {
            return Ok(artifacts);
        };
        if entry == artifacts.entry {
            return Ok(artifacts);
        }

        let renamed = artifacts
            .dir
            .join(format!("{entry}.{}", descriptor.extension));
        tokio::fs::rename(&artifacts.source, &renamed)
            .await
            .map_err(|source| ArtifactError::Io {
                path: renamed.clone(),
                source,
            })?;

        debug!(from = ?artifacts.source, to = ?renamed, "renamed source to match entry");

        let binary = binary_path(&artifacts.dir, descriptor, &entry);
        Ok(Artifacts {
            source: renamed,
            binary,
            entry,
            ..artifacts
        })
    }

    /// Best-effort removal of an execution's files
    ///
    /// Failures are logged and never returned.
    #[instrument(skip(self, artifacts), fields(dir = %artifacts.dir.display()))]
    pub async fn cleanup(&self, artifacts: &Artifacts) {
        for file in std::iter::once(&artifacts.source).chain(artifacts.binary.as_ref()) {
            remove_file_logged(file).await;
        }
        self.remove_dir(&artifacts.dir).await;
    }

    /// Best-effort removal of an execution directory and everything in it
    pub async fn remove_dir(&self, dir: &Path) {
        match tokio::fs::remove_dir_all(dir).await {
            Ok(()) => debug!(?dir, "removed execution directory"),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!(?dir, error = %e, "failed to remove execution directory"),
        }
    }

    /// Create the root directory if needed
    pub async fn prepare(&self) -> Result<(), ArtifactError> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|source| ArtifactError::Io {
                path: self.root.clone(),
                source,
            })
    }

    /// Remove execution directories left behind by an earlier process
    ///
    /// Returns the number of directories removed.
    pub async fn sweep_stale(&self) -> usize {
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return 0,
            Err(e) => {
                warn!(root = ?self.root, error = %e, "failed to scan artifact root");
                return 0;
            }
        };

        let mut removed = 0;
        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "failed to read artifact root entry");
                    break;
                }
            };
            let is_execution_dir = entry
                .file_name()
                .to_str()
                .is_some_and(|name| name.starts_with(EXECUTION_DIR_PREFIX));
            if is_execution_dir {
                self.remove_dir(&entry.path()).await;
                removed += 1;
            }
        }

        if removed > 0 {
            debug!(removed, "swept stale execution directories");
        }
        removed
    }
}

async fn remove_file_logged(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => warn!(?path, error = %e, "failed to remove artifact"),
    }
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn binary_path(dir: &Path, descriptor: &LanguageDescriptor, entry: &str) -> Option<PathBuf> {
    descriptor
        .is_compiled()
        .then(|| dir.join(descriptor.output_name.replace("{entry}", entry)))
}

/// Find the declared entry name in `code`
///
/// A pattern may carry several capture groups, one per alternative. A match
/// of a lower-numbered group anywhere in the source wins over higher ones, so
/// `public class (\w+)|class (\w+)` prefers the public class but still finds
/// a lone package-private one.
///
/// Only plain identifiers are accepted so the name is always safe to use as
/// a file name.
pub fn detect_entry_name(code: &str, descriptor: &LanguageDescriptor) -> Option<String> {
    let pattern = descriptor.entry_pattern.as_ref()?;

    let mut best: Option<(usize, &str)> = None;
    for captures in pattern.captures_iter(code) {
        let Some((group, name)) = captures
            .iter()
            .enumerate()
            .skip(1)
            .find_map(|(i, m)| m.map(|m| (i, m.as_str())))
        else {
            continue;
        };
        if is_identifier(name) && best.is_none_or(|(g, _)| group < g) {
            best = Some((group, name));
        }
    }

    best.map(|(_, name)| name.to_owned())
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

//! Code runner for runcube
//!
//! Drives one submission through write → compile → run, streaming output as
//! [`ExecutionEvent`]s while the program runs.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use thiserror::Error;
use tokio::process::Command;
use tokio::sync::mpsc;
use uuid::Uuid;

pub use crate::runner::compile::{CompileReport, compile};
pub use crate::runner::execute::{RunEnd, RunReport, run};
pub use crate::runner::execution::ExecutionHandle;
pub use crate::runner::output::OutputSink;

mod compile;
mod execute;
mod execution;
mod output;

use crate::{
    artifact::{ArtifactManager, Artifacts},
    config::{Config, ExecutionSettings},
    registry::{LanguageRegistry, RegistryError},
    types::{Diagnostic, ExecutionOutcome, ExecutionState, ExitInfo, OutputStream},
};

/// Request to compile (if needed) and run a program
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunRequest {
    /// Language ID
    pub language: String,

    /// Program source
    pub source: String,

    /// Written to the program's stdin right after it starts
    pub input: Option<String>,
}

impl RunRequest {
    pub fn new(language: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            language: language.into(),
            source: source.into(),
            input: None,
        }
    }

    pub fn with_input(mut self, input: impl Into<String>) -> Self {
        self.input = Some(input.into());
        self
    }
}

/// Event produced by a running execution
#[derive(Debug, Clone)]
pub enum ExecutionEvent {
    /// Decoded output from the compiler or the program
    Output {
        id: Uuid,
        stream: OutputStream,
        data: String,
    },

    /// Non-terminal state transition
    State { id: Uuid, state: ExecutionState },

    /// Problem to show to the user
    Diagnostic { id: Uuid, diagnostic: Diagnostic },

    /// Final event of every execution
    Finished(ExecutionOutcome),
}

impl ExecutionEvent {
    /// ID of the execution that produced the event
    pub fn id(&self) -> Uuid {
        match self {
            ExecutionEvent::Output { id, .. }
            | ExecutionEvent::State { id, .. }
            | ExecutionEvent::Diagnostic { id, .. } => *id,
            ExecutionEvent::Finished(outcome) => outcome.id,
        }
    }
}

/// Errors that occur during compilation
#[derive(Debug, Error)]
pub enum CompileError {
    #[error("compilation failed with {exit}")]
    Failed { exit: ExitInfo, output_bytes: u64 },

    #[error("failed to start compiler '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("compile command is empty")]
    EmptyCommand,

    #[error("compilation cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors that occur while starting or supervising the program
#[derive(Debug, Error)]
pub enum ExecuteError {
    #[error("failed to start '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("run command is empty")]
    EmptyCommand,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Build a command that runs inside the execution directory
///
/// The environment overlay is layered over the server's own environment.
/// Returns `None` for an empty argument vector.
fn command(
    argv: &[String],
    artifacts: &Artifacts,
    env: &HashMap<String, String>,
) -> Option<Command> {
    let (program, args) = argv.split_first()?;

    let mut cmd = Command::new(program);
    cmd.args(args)
        .current_dir(&artifacts.dir)
        .envs(env)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    Some(cmd)
}

/// High-level runner for code execution
///
/// Cheap to clone; every clone shares the same registry.
#[derive(Debug, Clone)]
pub struct Runner {
    registry: Arc<LanguageRegistry>,
    artifacts: ArtifactManager,
    settings: ExecutionSettings,
}

impl Runner {
    /// Create a runner over an already probed registry
    pub fn new(config: &Config, registry: Arc<LanguageRegistry>) -> Self {
        Self {
            registry,
            artifacts: ArtifactManager::new(&config.temp_dir),
            settings: config.execution.clone(),
        }
    }

    /// Create a runner, probing the host for toolchains
    pub fn from_config(config: &Config) -> Result<Self, RegistryError> {
        let registry = LanguageRegistry::from_config(config)?;
        Ok(Self::new(config, Arc::new(registry)))
    }

    pub fn registry(&self) -> &LanguageRegistry {
        &self.registry
    }

    pub fn artifacts(&self) -> &ArtifactManager {
        &self.artifacts
    }

    pub fn settings(&self) -> &ExecutionSettings {
        &self.settings
    }

    /// Directory the execution with `id` works in
    pub fn execution_dir(&self, id: Uuid) -> PathBuf {
        self.artifacts.execution_dir(id)
    }

    /// Start an execution in the background
    ///
    /// Events are sent to `events`; the last one is always
    /// [`ExecutionEvent::Finished`].
    pub fn start(
        &self,
        request: RunRequest,
        events: mpsc::Sender<ExecutionEvent>,
    ) -> ExecutionHandle {
        execution::spawn(self.clone(), request, events)
    }

    /// Run one execution to completion
    ///
    /// Stdin is closed after the request's input has been written.
    pub async fn execute(
        &self,
        request: RunRequest,
        events: mpsc::Sender<ExecutionEvent>,
    ) -> ExecutionOutcome {
        self.start(request, events).wait().await
    }
}

//! Execution state machine
//!
//! One generic `Pending → Compiling → Running → terminal` machine
//! parameterized by the language descriptor. Each execution runs in its own
//! task, wrapped in a supervisor that turns a panic into an `Internal`
//! diagnostic so the owning session survives.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, error, info, instrument};
use uuid::Uuid;

use crate::artifact::{ArtifactManager, Artifacts};
use crate::registry::LanguageDescriptor;
use crate::runner::{
    CompileError, ExecuteError, ExecutionEvent, OutputSink, RunEnd, RunRequest, Runner, compile,
    run,
};
use crate::types::{Diagnostic, DiagnosticKind, ExecutionOutcome, ExecutionState};

/// Handle to a running execution
///
/// Dropping the handle cancels the execution; use [`ExecutionHandle::wait`]
/// to let it finish instead.
pub struct ExecutionHandle {
    id: Uuid,
    language: String,
    dir: PathBuf,
    stdin: mpsc::UnboundedSender<Vec<u8>>,
    state: watch::Receiver<ExecutionState>,
    cancel: CancellationToken,
    guard: Option<DropGuard>,
    task: JoinHandle<ExecutionOutcome>,
}

impl ExecutionHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn language(&self) -> &str {
        &self.language
    }

    /// Latest published state
    pub fn state(&self) -> ExecutionState {
        *self.state.borrow()
    }

    /// Check if the execution has not reached a terminal state
    pub fn is_active(&self) -> bool {
        !self.state().is_terminal() && !self.task.is_finished()
    }

    /// Queue bytes for the program's stdin
    ///
    /// Gives the bytes back if the execution no longer accepts input.
    pub fn send_input(&self, data: Vec<u8>) -> Result<(), Vec<u8>> {
        if !self.is_active() {
            return Err(data);
        }
        self.stdin.send(data).map_err(|e| e.0)
    }

    /// Ask the execution to stop; the program is killed and artifacts removed
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Working directory of the execution
    pub fn artifact_dir(&self) -> &Path {
        &self.dir
    }

    /// Wait for the execution to finish
    ///
    /// The program's stdin is closed first, so a program reading to EOF ends.
    pub async fn wait(self) -> ExecutionOutcome {
        let Self {
            id,
            language,
            stdin,
            guard,
            task,
            ..
        } = self;
        drop(stdin);
        if let Some(guard) = guard {
            let _token = guard.disarm();
        }

        match task.await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(%id, error = %e, "execution supervisor failed");
                let mut outcome = ExecutionOutcome::new(id, language, ExecutionState::Failed);
                outcome.diagnostic = Some(Diagnostic::new(DiagnosticKind::Internal, e.to_string()));
                outcome
            }
        }
    }
}

impl std::fmt::Debug for ExecutionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionHandle")
            .field("id", &self.id)
            .field("language", &self.language)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Start the supervised state machine for `request`
pub(crate) fn spawn(
    runner: Runner,
    request: RunRequest,
    events: mpsc::Sender<ExecutionEvent>,
) -> ExecutionHandle {
    let id = Uuid::new_v4();
    let (stdin_tx, stdin_rx) = mpsc::unbounded_channel();
    let (state_tx, state_rx) = watch::channel(ExecutionState::Pending);
    let cancel = CancellationToken::new();
    let dir = runner.execution_dir(id);
    let language = request.language.clone();

    let machine = ExecutionMachine {
        id,
        sink: OutputSink::new(id, events),
        state: Arc::new(state_tx),
        stdin: Some(stdin_rx),
        cancel: cancel.clone(),
        started: Instant::now(),
        runner,
        request,
    };

    ExecutionHandle {
        id,
        language,
        dir,
        stdin: stdin_tx,
        state: state_rx,
        guard: Some(cancel.clone().drop_guard()),
        cancel,
        task: tokio::spawn(supervise(machine)),
    }
}

/// Run the machine in its own task and report a panic as a failed execution
async fn supervise(machine: ExecutionMachine) -> ExecutionOutcome {
    let supervisor = Supervisor {
        id: machine.id,
        language: machine.request.language.clone(),
        sink: machine.sink.clone(),
        state: Arc::clone(&machine.state),
        artifacts: machine.runner.artifacts().clone(),
        started: machine.started,
    };
    supervisor.watch(machine.run()).await
}

/// What the supervisor needs to report an execution whose task died
struct Supervisor {
    id: Uuid,
    language: String,
    sink: OutputSink,
    state: Arc<watch::Sender<ExecutionState>>,
    artifacts: ArtifactManager,
    started: Instant,
}

impl Supervisor {
    async fn watch<F>(self, task: F) -> ExecutionOutcome
    where
        F: Future<Output = ExecutionOutcome> + Send + 'static,
    {
        let id = self.id;
        let outcome = match tokio::spawn(task).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(%id, error = %e, "execution task panicked");
                self.artifacts
                    .remove_dir(&self.artifacts.execution_dir(id))
                    .await;

                let diagnostic = Diagnostic::new(
                    DiagnosticKind::Internal,
                    "execution aborted by an internal error",
                );
                self.sink.diagnostic(diagnostic.clone()).await;
                self.state.send_replace(ExecutionState::Failed);

                let mut outcome = ExecutionOutcome::new(id, self.language, ExecutionState::Failed);
                outcome.diagnostic = Some(diagnostic);
                outcome.duration = self.started.elapsed();
                outcome
            }
        };

        info!(
            %id,
            language = %outcome.language,
            state = %outcome.state,
            kind = ?outcome.kind(),
            duration_ms = outcome.duration.as_millis() as u64,
            "execution finished"
        );
        self.sink.finished(outcome.clone()).await;
        outcome
    }
}

struct ExecutionMachine {
    id: Uuid,
    runner: Runner,
    request: RunRequest,
    sink: OutputSink,
    state: Arc<watch::Sender<ExecutionState>>,
    stdin: Option<mpsc::UnboundedReceiver<Vec<u8>>>,
    cancel: CancellationToken,
    started: Instant,
}

impl ExecutionMachine {
    #[instrument(skip(self), fields(id = %self.id, language = %self.request.language))]
    async fn run(mut self) -> ExecutionOutcome {
        let outcome =
            ExecutionOutcome::new(self.id, &self.request.language, ExecutionState::Pending);

        let descriptor = match self.runner.registry().describe(&self.request.language) {
            Ok(descriptor) => descriptor.clone(),
            Err(e) => {
                return self
                    .fail(outcome, Diagnostic::new(DiagnosticKind::UnknownLanguage, e.to_string()))
                    .await;
            }
        };

        let artifacts = match self.prepare(&descriptor).await {
            Ok(artifacts) => artifacts,
            Err(diagnostic) => {
                let dir = self.runner.execution_dir(self.id);
                self.runner.artifacts().remove_dir(&dir).await;
                return self.fail(outcome, diagnostic).await;
            }
        };

        let outcome = self.drive(outcome, &descriptor, &artifacts).await;

        // Every terminal state passes through here
        self.runner.artifacts().cleanup(&artifacts).await;
        self.finish(outcome)
    }

    async fn prepare(&self, descriptor: &LanguageDescriptor) -> Result<Artifacts, Diagnostic> {
        let manager = self.runner.artifacts();
        let io_error = |e: crate::artifact::ArtifactError| {
            Diagnostic::new(DiagnosticKind::IoError, e.to_string())
        };

        let artifacts = manager
            .write_source(self.id, &self.request.source, descriptor)
            .await
            .map_err(io_error)?;
        manager
            .reconcile_entry_name(artifacts, &self.request.source, descriptor)
            .await
            .map_err(io_error)
    }

    async fn drive(
        &mut self,
        mut outcome: ExecutionOutcome,
        descriptor: &LanguageDescriptor,
        artifacts: &Artifacts,
    ) -> ExecutionOutcome {
        let settings = self.runner.settings().clone();

        if let Some(ref invocation) = descriptor.compile {
            if !descriptor.compileable {
                let message = format!(
                    "{} is unavailable: compiler '{}' is not installed on this host",
                    descriptor.name,
                    invocation.program()
                );
                return self
                    .reject(outcome, Diagnostic::new(DiagnosticKind::ToolchainUnavailable, message))
                    .await;
            }
            if self.cancel.is_cancelled() {
                return self.cancelled(outcome);
            }

            self.transition(ExecutionState::Compiling).await;
            match compile(invocation, artifacts, &self.sink, &settings, &self.cancel).await {
                Ok(report) => outcome.compiler_bytes = report.output_bytes,
                Err(CompileError::Failed { exit, output_bytes }) => {
                    outcome.compiler_bytes = output_bytes;
                    let diagnostic = Diagnostic::new(
                        DiagnosticKind::CompileError,
                        format!("compilation failed with {exit}"),
                    );
                    return self.reject(outcome, diagnostic).await;
                }
                Err(CompileError::Cancelled) => return self.cancelled(outcome),
                Err(e @ (CompileError::Spawn { .. } | CompileError::EmptyCommand)) => {
                    return self
                        .reject(outcome, Diagnostic::new(DiagnosticKind::SpawnError, e.to_string()))
                        .await;
                }
                Err(e @ CompileError::Io(_)) => {
                    return self
                        .reject(outcome, Diagnostic::new(DiagnosticKind::IoError, e.to_string()))
                        .await;
                }
            }
        }

        if self.cancel.is_cancelled() {
            return self.cancelled(outcome);
        }

        self.transition(ExecutionState::Running).await;
        let stdin = self
            .stdin
            .take()
            .unwrap_or_else(|| mpsc::unbounded_channel().1);
        let result = run(
            &descriptor.run,
            artifacts,
            self.request.input.take(),
            stdin,
            &self.sink,
            &settings,
            &self.cancel,
        )
        .await;

        match result {
            Ok(report) => {
                outcome.exit = report.exit;
                outcome.stdout_bytes = report.stdout_bytes;
                outcome.stderr_bytes = report.stderr_bytes;
                match report.end {
                    RunEnd::Exited => {
                        outcome.state = ExecutionState::Completed;
                        outcome
                    }
                    RunEnd::TimedOut => {
                        let diagnostic = Diagnostic::new(
                            DiagnosticKind::TimeoutExceeded,
                            format!(
                                "program exceeded the {}s time limit and was killed",
                                settings.timeout_secs
                            ),
                        );
                        self.sink.diagnostic(diagnostic.clone()).await;
                        outcome.state = ExecutionState::TimedOut;
                        outcome.diagnostic = Some(diagnostic);
                        outcome
                    }
                    RunEnd::Cancelled => self.cancelled(outcome),
                }
            }
            Err(e @ (ExecuteError::Spawn { .. } | ExecuteError::EmptyCommand)) => {
                self.reject(outcome, Diagnostic::new(DiagnosticKind::SpawnError, e.to_string()))
                    .await
            }
            Err(e @ ExecuteError::Io(_)) => {
                self.reject(outcome, Diagnostic::new(DiagnosticKind::IoError, e.to_string()))
                    .await
            }
        }
    }

    async fn transition(&self, state: ExecutionState) {
        debug!(%state, "execution state changed");
        self.state.send_replace(state);
        self.sink.state(state).await;
    }

    /// Report `diagnostic` and mark the outcome failed
    async fn reject(
        &self,
        mut outcome: ExecutionOutcome,
        diagnostic: Diagnostic,
    ) -> ExecutionOutcome {
        debug!(%diagnostic, "execution failed");
        self.sink.diagnostic(diagnostic.clone()).await;
        outcome.state = ExecutionState::Failed;
        outcome.diagnostic = Some(diagnostic);
        outcome
    }

    /// Fail before any artifact exists
    async fn fail(&self, outcome: ExecutionOutcome, diagnostic: Diagnostic) -> ExecutionOutcome {
        let outcome = self.reject(outcome, diagnostic).await;
        self.finish(outcome)
    }

    /// Nobody is listening any more, so nothing is reported
    fn cancelled(&self, mut outcome: ExecutionOutcome) -> ExecutionOutcome {
        debug!("execution cancelled");
        outcome.state = ExecutionState::Failed;
        outcome
    }

    fn finish(&self, mut outcome: ExecutionOutcome) -> ExecutionOutcome {
        outcome.duration = self.started.elapsed();
        self.state.send_replace(outcome.state);
        outcome
    }
}

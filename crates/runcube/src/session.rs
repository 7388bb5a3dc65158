//! Session lifecycle management
//!
//! A session is one client connection: a shell, at most one execution, and
//! the event loop that routes between them. Sessions share nothing but the
//! read-only context held by [`SessionManager`].

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::protocol::{ServerMessage, StatusReport};
use crate::registry::{LanguageRegistry, RegistryError};
use crate::router::{PromptDetector, Route, classify, route, shell_line};
use crate::runner::{ExecutionEvent, ExecutionHandle, Runner};
use crate::shell::{ShellError, ShellSession};
use crate::types::OutputStream;

const EVENT_CAPACITY: usize = 256;
const MAX_SHELL_RESPAWNS: u32 = 5;

/// How long teardown waits for a cancelled execution to stop
const EXECUTION_STOP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("failed to start shell: {0}")]
    Shell(#[from] ShellError),

    #[error("invalid prompt pattern: {0}")]
    Prompt(#[from] regex::Error),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("client disconnected")]
    Disconnected,
}

struct Shared {
    config: Config,
    runner: Runner,
    prompt: PromptDetector,
    live: Mutex<HashSet<Uuid>>,
}

impl Shared {
    fn live(&self) -> std::sync::MutexGuard<'_, HashSet<Uuid>> {
        self.live.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Creates sessions and tracks the live ones
#[derive(Clone)]
pub struct SessionManager {
    shared: Arc<Shared>,
}

impl SessionManager {
    /// Create a manager over an already probed registry
    pub fn new(config: Config, registry: Arc<LanguageRegistry>) -> Result<Self, SessionError> {
        let prompt = PromptDetector::from_settings(&config.prompt)?;
        let runner = Runner::new(&config, registry);
        Ok(Self {
            shared: Arc::new(Shared {
                config,
                runner,
                prompt,
                live: Mutex::new(HashSet::new()),
            }),
        })
    }

    /// Create a manager, probing the host for toolchains
    pub fn from_config(config: Config) -> Result<Self, SessionError> {
        let registry = LanguageRegistry::from_config(&config)?;
        Self::new(config, Arc::new(registry))
    }

    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    pub fn runner(&self) -> &Runner {
        &self.shared.runner
    }

    /// Number of sessions that are open
    pub fn active_sessions(&self) -> usize {
        self.shared.live().len()
    }

    /// Open a session and start its shell
    pub fn open(&self, outbound: mpsc::Sender<ServerMessage>) -> Result<Session, SessionError> {
        let id = Uuid::new_v4();
        let shell = ShellSession::spawn(
            &self.shared.config.shell,
            self.shared.config.execution.chunk_size,
        )?;

        self.shared.live().insert(id);
        info!(%id, shell_pid = ?shell.process_id(), "session opened");

        let (events_tx, events_rx) = mpsc::channel(EVENT_CAPACITY);
        Ok(Session {
            id,
            shell: Some(shell),
            execution: None,
            events_tx,
            events_rx,
            outbound,
            respawns: 0,
            registration: Registration {
                id,
                shared: Arc::clone(&self.shared),
            },
        })
    }

    /// Run a session for one connection until it ends, then tear it down
    ///
    /// `inbound` carries the client's text frames; the session ends when it
    /// closes or when `outbound` stops accepting messages.
    pub async fn serve(
        &self,
        inbound: mpsc::Receiver<String>,
        outbound: mpsc::Sender<ServerMessage>,
    ) -> Result<(), SessionError> {
        let mut session = self.open(outbound)?;
        session.run(inbound).await;
        session.close().await;
        Ok(())
    }
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("active_sessions", &self.active_sessions())
            .finish_non_exhaustive()
    }
}

/// Removes the session from the live set when dropped
struct Registration {
    id: Uuid,
    shared: Arc<Shared>,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.shared.live().remove(&self.id);
    }
}

/// State of one client connection
pub struct Session {
    id: Uuid,
    shell: Option<ShellSession>,
    execution: Option<ExecutionHandle>,
    events_tx: mpsc::Sender<ExecutionEvent>,
    events_rx: mpsc::Receiver<ExecutionEvent>,
    outbound: mpsc::Sender<ServerMessage>,
    respawns: u32,
    registration: Registration,
}

impl Session {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// OS process ID of the current shell
    pub fn shell_pid(&self) -> Option<u32> {
        self.shell.as_ref().and_then(ShellSession::process_id)
    }

    /// Working directory of the active execution
    pub fn execution_dir(&self) -> Option<PathBuf> {
        self.execution
            .as_ref()
            .map(|e| e.artifact_dir().to_path_buf())
    }

    /// Check if an execution is running
    pub fn has_active_execution(&self) -> bool {
        self.execution.as_ref().is_some_and(ExecutionHandle::is_active)
    }

    /// Event loop: inbound frames, shell output and execution events
    #[instrument(skip_all, fields(session = %self.id))]
    pub async fn run(&mut self, mut inbound: mpsc::Receiver<String>) {
        loop {
            let result = tokio::select! {
                frame = inbound.recv() => match frame {
                    Some(text) => self.handle_inbound(text).await,
                    None => {
                        debug!("inbound closed");
                        break;
                    }
                },
                chunk = next_output(&mut self.shell) => match chunk {
                    Some(text) => self.send(ServerMessage::output(text)).await,
                    None => {
                        self.respawn_shell().await;
                        Ok(())
                    }
                },
                Some(event) = self.events_rx.recv() => self.handle_event(event).await,
            };

            if let Err(e) = result {
                debug!(error = %e, "ending session loop");
                break;
            }
        }
    }

    async fn handle_inbound(&mut self, text: String) -> Result<(), SessionError> {
        match route(classify(&text), self.has_active_execution()) {
            Route::Shell(bytes) => self.write_shell(bytes).await,
            Route::Execution(bytes) => {
                let rejected = match self.execution {
                    Some(ref execution) => execution.send_input(bytes).err(),
                    None => Some(bytes),
                };
                // The program finished in the meantime
                if let Some(bytes) = rejected {
                    let line = shell_line(&String::from_utf8_lossy(&bytes));
                    self.write_shell(line).await;
                }
            }
            Route::Run(request) => {
                let runner = &self.registration.shared.runner;
                let execution = runner.start(request, self.events_tx.clone());
                debug!(
                    execution = %execution.id(),
                    language = execution.language(),
                    "execution accepted"
                );
                self.execution = Some(execution);
            }
            Route::Reject(diagnostic) => {
                debug!(%diagnostic, "run request rejected");
                return self.send(ServerMessage::output(diagnostic.render())).await;
            }
            Route::Resize { cols, rows } => {
                if let Some(ref shell) = self.shell
                    && let Err(e) = shell.resize(cols, rows)
                {
                    warn!(error = %e, "failed to resize terminal");
                }
            }
        }
        Ok(())
    }

    async fn handle_event(&mut self, event: ExecutionEvent) -> Result<(), SessionError> {
        match event {
            ExecutionEvent::Output { stream, data, .. } => {
                let prompt = matches!(stream, OutputStream::Stdout | OutputStream::Stderr)
                    && self.registration.shared.prompt.detect(&data);
                self.send(ServerMessage::output(data)).await?;
                if prompt {
                    self.send(ServerMessage::PromptWaiting(true)).await?;
                }
            }
            ExecutionEvent::State { id, state } => {
                let language = self
                    .execution
                    .as_ref()
                    .filter(|e| e.id() == id)
                    .map(|e| e.language().to_owned())
                    .unwrap_or_default();
                let report = StatusReport::transition(id, language, state);
                self.send(ServerMessage::ExecutionStatus(report)).await?;
            }
            ExecutionEvent::Diagnostic { diagnostic, .. } => {
                self.send(ServerMessage::output(diagnostic.render())).await?;
            }
            ExecutionEvent::Finished(outcome) => {
                if self.execution.as_ref().is_some_and(|e| e.id() == outcome.id)
                    && let Some(execution) = self.execution.take()
                {
                    execution.wait().await;
                }
                self.send(ServerMessage::PromptWaiting(false)).await?;
                self.send(ServerMessage::ExecutionStatus((&outcome).into()))
                    .await?;
            }
        }
        Ok(())
    }

    async fn write_shell(&mut self, bytes: Vec<u8>) {
        let Some(ref shell) = self.shell else {
            debug!("dropping input, no shell");
            return;
        };
        if let Err(e) = shell.write(bytes).await {
            warn!(error = %e, "failed to write to shell");
        }
    }

    async fn respawn_shell(&mut self) {
        if let Some(old) = self.shell.take()
            && let Err(e) = old.terminate().await
        {
            debug!(error = %e, "exited shell was not reaped cleanly");
        }

        if self.respawns >= MAX_SHELL_RESPAWNS {
            warn!(respawns = self.respawns, "shell keeps exiting, not respawning");
            return;
        }
        self.respawns += 1;

        let config = &self.registration.shared.config;
        match ShellSession::spawn(&config.shell, config.execution.chunk_size) {
            Ok(shell) => {
                info!(
                    pid = ?shell.process_id(),
                    respawns = self.respawns,
                    "shell exited, started a new one"
                );
                self.shell = Some(shell);
            }
            Err(e) => warn!(error = %e, "failed to respawn shell"),
        }
    }

    async fn send(&self, message: ServerMessage) -> Result<(), SessionError> {
        self.outbound
            .send(message)
            .await
            .map_err(|_| SessionError::Disconnected)
    }

    /// Tear the session down
    ///
    /// Every step runs even if an earlier one fails: cancel the execution,
    /// wait for its process to be killed, terminate the shell, then delete
    /// whatever artifacts are left.
    #[instrument(skip_all, fields(session = %self.id))]
    pub async fn close(mut self) {
        // Nobody reads events any more; unblock senders
        self.events_rx.close();

        let mut leftover = None;
        if let Some(execution) = self.execution.take() {
            execution.cancel();
            leftover = Some(execution.artifact_dir().to_path_buf());
            match tokio::time::timeout(EXECUTION_STOP_TIMEOUT, execution.wait()).await {
                Ok(outcome) => debug!(state = %outcome.state, "execution stopped"),
                Err(_) => warn!("execution did not stop within the teardown window"),
            }
        }

        if let Some(shell) = self.shell.take()
            && let Err(e) = shell.terminate().await
        {
            warn!(error = %e, "failed to terminate shell");
        }

        if let Some(dir) = leftover {
            self.registration
                .shared
                .runner
                .artifacts()
                .remove_dir(&dir)
                .await;
        }

        info!("session closed");
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("shell_pid", &self.shell_pid())
            .field("execution", &self.execution)
            .finish_non_exhaustive()
    }
}

async fn next_output(shell: &mut Option<ShellSession>) -> Option<String> {
    match shell {
        Some(shell) => shell.recv().await,
        None => std::future::pending().await,
    }
}

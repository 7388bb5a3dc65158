use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle state of an execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionState {
    /// Accepted, source not yet compiled or started
    Pending,

    /// Compiler is running
    Compiling,

    /// Program is running with the timeout armed
    Running,

    /// Program exited on its own (any exit code)
    Completed,

    /// Execution could not proceed (see the attached diagnostic)
    Failed,

    /// Program was killed by the wall clock limit
    TimedOut,
}

impl ExecutionState {
    /// Check if the state is final
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionState::Completed | ExecutionState::Failed | ExecutionState::TimedOut
        )
    }
}

impl fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ExecutionState::Pending => "pending",
            ExecutionState::Compiling => "compiling",
            ExecutionState::Running => "running",
            ExecutionState::Completed => "completed",
            ExecutionState::Failed => "failed",
            ExecutionState::TimedOut => "timed_out",
        };
        f.write_str(name)
    }
}

/// Kinds of problems reported to the client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiagnosticKind {
    /// Required compiler is not installed on the host
    ToolchainUnavailable,

    /// Compiler exited with a non-zero status
    CompileError,

    /// A process could not be started
    SpawnError,

    /// Wall clock limit hit
    TimeoutExceeded,

    /// Artifact could not be written
    IoError,

    /// A run request arrived while another execution was active
    ExecutionInProgress,

    /// The requested language is not registered
    UnknownLanguage,

    /// The execution task failed unexpectedly
    Internal,
}

impl fmt::Display for DiagnosticKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A problem report attached to an execution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub kind: DiagnosticKind,
    pub message: String,
}

impl Diagnostic {
    pub fn new(kind: DiagnosticKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Terminal-friendly rendering used in `output` events
    pub fn render(&self) -> String {
        format!("\r\n[{}] {}\r\n", self.kind, self.message)
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// How a process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ExitInfo {
    /// Exit code if the process exited normally
    pub code: Option<i32>,

    /// Signal number if the process was killed by a signal
    pub signal: Option<i32>,
}

impl ExitInfo {
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.code == Some(0)
    }
}

impl fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {code}"),
            (None, Some(signal)) => write!(f, "signal {signal}"),
            (None, None) => f.write_str("unknown status"),
        }
    }
}

impl From<std::process::ExitStatus> for ExitInfo {
    fn from(status: std::process::ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
        }
    }
}

/// Origin of an output chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputStream {
    Compiler,
    Stdout,
    Stderr,
}

/// Final report of one execution
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    /// Execution ID
    pub id: Uuid,

    /// Language ID from the request
    pub language: String,

    /// Terminal state
    pub state: ExecutionState,

    /// Problem report for `Failed` and `TimedOut`
    pub diagnostic: Option<Diagnostic>,

    /// Exit of the run process, if it ran to completion
    pub exit: Option<ExitInfo>,

    /// Bytes of compiler output forwarded
    pub compiler_bytes: u64,

    /// Bytes of program stdout forwarded
    pub stdout_bytes: u64,

    /// Bytes of program stderr forwarded
    pub stderr_bytes: u64,

    /// Wall time from acceptance to the terminal state
    pub duration: Duration,
}

impl ExecutionOutcome {
    /// Build an outcome with no output counters
    pub fn new(id: Uuid, language: impl Into<String>, state: ExecutionState) -> Self {
        Self {
            id,
            language: language.into(),
            state,
            diagnostic: None,
            exit: None,
            compiler_bytes: 0,
            stdout_bytes: 0,
            stderr_bytes: 0,
            duration: Duration::ZERO,
        }
    }

    /// Check if the program ran and exited with code 0
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.state == ExecutionState::Completed
            && self.exit.as_ref().is_some_and(ExitInfo::is_success)
    }

    /// Diagnostic kind, if any
    pub fn kind(&self) -> Option<DiagnosticKind> {
        self.diagnostic.as_ref().map(|d| d.kind)
    }
}

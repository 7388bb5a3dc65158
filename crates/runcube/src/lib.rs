//! A library for interactive multi-language code execution.
//!
//! Runcube backs an in-browser coding terminal: each client connection gets a
//! pseudo-terminal shell plus an execution controller that compiles and runs
//! submitted programs, streams their output as it is produced and forwards
//! typed input back to them.
//!
//! # Features
//!
//! - **Multi-language**: Compiled and interpreted languages described in TOML.
//! - **Toolchain probing**: Missing compilers are reported precisely, not as spawn failures.
//! - **Streaming output**: Compiler and program output forwarded chunk by chunk.
//! - **Interactive input**: Typed lines routed to the running program, with prompt hints.
//! - **Wall clock limit**: One timer per execution; runaway programs are killed.
//! - **Session cleanup**: Processes, shells and artifacts are released on disconnect.

pub use artifact::{ArtifactError, ArtifactManager, Artifacts};
pub use config::{Config, ConfigError, EXAMPLE_CONFIG, Language};
pub use protocol::{ClientMessage, ServerMessage, StatusReport};
pub use registry::{
    HostProbe, LanguageDescriptor, LanguageRegistry, RegistryError, ToolchainProbe,
};
pub use router::{Inbound, PromptDetector, Route, classify, route};
pub use runner::{
    CompileError, ExecuteError, ExecutionEvent, ExecutionHandle, RunRequest, Runner,
};
pub use session::{Session, SessionError, SessionManager};
pub use shell::{ShellError, ShellSession};
pub use types::{
    Diagnostic, DiagnosticKind, ExecutionOutcome, ExecutionState, ExitInfo, OutputStream,
};

pub mod artifact;
pub mod config;
pub mod decode;
pub mod protocol;
pub mod registry;
pub mod router;
pub mod runner;
pub mod session;
pub mod shell;
pub mod types;

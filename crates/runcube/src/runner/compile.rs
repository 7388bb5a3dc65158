//! Compilation step for code execution
//!
//! Runs the language's compiler inside the execution directory and streams
//! everything it prints as compiler output.

use std::process::Stdio;

use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::artifact::Artifacts;
use crate::config::ExecutionSettings;
use crate::registry::Invocation;
use crate::runner::output::{OutputSink, drain, pump};
use crate::runner::{CompileError, command};
use crate::types::{ExitInfo, OutputStream};

/// Result of a successful compilation
#[derive(Debug, Clone, Copy)]
pub struct CompileReport {
    /// Compiler exit status
    pub exit: ExitInfo,

    /// Bytes of compiler output forwarded
    pub output_bytes: u64,
}

/// Compile the execution's source
///
/// Returns only after both compiler streams are drained (bounded by the kill
/// grace period), so all compiler output reaches the sink before anything the
/// program prints.
#[instrument(skip_all, fields(id = %sink.id(), compiler = invocation.program()))]
pub async fn compile(
    invocation: &Invocation,
    artifacts: &Artifacts,
    sink: &OutputSink,
    settings: &ExecutionSettings,
    cancel: &CancellationToken,
) -> Result<CompileReport, CompileError> {
    let mut cmd = command(&artifacts.expand(&invocation.command), artifacts, &invocation.env)
        .ok_or(CompileError::EmptyCommand)?;
    cmd.stdin(Stdio::null());

    debug!(?cmd, "spawning compiler");
    let mut child = cmd.spawn().map_err(|source| CompileError::Spawn {
        program: invocation.program().to_owned(),
        source,
    })?;

    let stdout = child
        .stdout
        .take()
        .map(|r| tokio::spawn(pump(r, OutputStream::Compiler, sink.clone(), settings.chunk_size)));
    let stderr = child
        .stderr
        .take()
        .map(|r| tokio::spawn(pump(r, OutputStream::Compiler, sink.clone(), settings.chunk_size)));

    let status = tokio::select! {
        status = child.wait() => Some(status?),
        () = cancel.cancelled() => None,
    };
    let Some(status) = status else {
        if let Err(e) = child.kill().await {
            warn!(error = %e, "failed to kill compiler");
        }
        return Err(CompileError::Cancelled);
    };

    // A backgrounded grandchild may hold the pipes open after the compiler exits
    let output_bytes =
        drain(stdout, settings.kill_grace()).await + drain(stderr, settings.kill_grace()).await;

    let exit = ExitInfo::from(status);
    debug!(%exit, output_bytes, "compiler finished");

    if exit.is_success() {
        Ok(CompileReport { exit, output_bytes })
    } else {
        Err(CompileError::Failed { exit, output_bytes })
    }
}

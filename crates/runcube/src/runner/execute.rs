//! Run step for code execution
//!
//! Spawns the program with piped stdio, forwards typed input to it and
//! enforces the wall clock limit with a single timer.

use std::process::Stdio;

use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::artifact::Artifacts;
use crate::config::ExecutionSettings;
use crate::registry::Invocation;
use crate::runner::output::{OutputSink, drain, pump};
use crate::runner::{ExecuteError, command};
use crate::types::{ExitInfo, OutputStream};

/// Why the run step ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunEnd {
    /// The program exited by itself
    Exited,

    /// The wall clock limit fired and the program was killed
    TimedOut,

    /// The execution was cancelled and the program was killed
    Cancelled,
}

/// Result of the run step
#[derive(Debug, Clone, Copy)]
pub struct RunReport {
    pub end: RunEnd,

    /// Exit status as reaped, including the kill signal after a timeout
    pub exit: Option<ExitInfo>,

    pub stdout_bytes: u64,
    pub stderr_bytes: u64,
}

/// Run the program to completion, timeout or cancellation
///
/// `initial_input` is written to stdin right after spawn. Every message
/// received on `stdin` afterwards is forwarded as-is; stdin is closed once
/// the sending side goes away.
#[instrument(skip_all, fields(id = %sink.id(), program = invocation.program()))]
pub async fn run(
    invocation: &Invocation,
    artifacts: &Artifacts,
    initial_input: Option<String>,
    stdin: mpsc::UnboundedReceiver<Vec<u8>>,
    sink: &OutputSink,
    settings: &ExecutionSettings,
    cancel: &CancellationToken,
) -> Result<RunReport, ExecuteError> {
    let mut cmd = command(&artifacts.expand(&invocation.command), artifacts, &invocation.env)
        .ok_or(ExecuteError::EmptyCommand)?;
    cmd.stdin(Stdio::piped());

    debug!(?cmd, "spawning program");
    let mut child = cmd.spawn().map_err(|source| ExecuteError::Spawn {
        program: invocation.program().to_owned(),
        source,
    })?;

    let writer = child
        .stdin
        .take()
        .map(|pipe| tokio::spawn(feed_stdin(pipe, initial_input, stdin)));
    let stdout = child
        .stdout
        .take()
        .map(|r| tokio::spawn(pump(r, OutputStream::Stdout, sink.clone(), settings.chunk_size)));
    let stderr = child
        .stderr
        .take()
        .map(|r| tokio::spawn(pump(r, OutputStream::Stderr, sink.clone(), settings.chunk_size)));

    // The only timer of this execution; dropped with this frame on every path
    let deadline = tokio::time::sleep(settings.timeout());
    tokio::pin!(deadline);

    let exited = tokio::select! {
        status = child.wait() => Ok(status.map_err(ExecuteError::Io)?),
        () = &mut deadline => Err(RunEnd::TimedOut),
        () = cancel.cancelled() => Err(RunEnd::Cancelled),
    };
    let (end, status) = match exited {
        Ok(status) => (RunEnd::Exited, status),
        Err(end) => {
            debug!(?end, timeout = ?settings.timeout(), "killing program");
            (end, kill(&mut child).await)
        }
    };
    let exit = ExitInfo::from(status);

    if let Some(writer) = writer {
        writer.abort();
    }

    // A program that exited normally may still have output in flight
    let grace = match end {
        RunEnd::Exited => {
            deadline
                .deadline()
                .saturating_duration_since(tokio::time::Instant::now())
                + settings.kill_grace()
        }
        RunEnd::TimedOut | RunEnd::Cancelled => settings.kill_grace(),
    };
    let stdout_bytes = drain(stdout, grace).await;
    let stderr_bytes = drain(stderr, grace).await;

    debug!(?end, %exit, stdout_bytes, stderr_bytes, "program finished");

    Ok(RunReport {
        end,
        exit: Some(exit),
        stdout_bytes,
        stderr_bytes,
    })
}

async fn feed_stdin(
    mut pipe: ChildStdin,
    initial_input: Option<String>,
    mut stdin: mpsc::UnboundedReceiver<Vec<u8>>,
) {
    if let Some(input) = initial_input
        && let Err(e) = write_flush(&mut pipe, input.as_bytes()).await
    {
        debug!(error = %e, "program closed stdin before initial input was written");
        return;
    }

    while let Some(data) = stdin.recv().await {
        if let Err(e) = write_flush(&mut pipe, &data).await {
            debug!(error = %e, "program closed stdin");
            return;
        }
    }
}

async fn write_flush(pipe: &mut ChildStdin, data: &[u8]) -> std::io::Result<()> {
    pipe.write_all(data).await?;
    pipe.flush().await
}

/// Kill the child and reap it
async fn kill(child: &mut Child) -> std::process::ExitStatus {
    if let Err(e) = child.start_kill() {
        warn!(error = %e, "failed to kill program");
    }
    loop {
        match child.wait().await {
            Ok(status) => return status,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!(error = %e, "failed to reap killed program");
                return killed_status();
            }
        }
    }
}

#[cfg(unix)]
fn killed_status() -> std::process::ExitStatus {
    use std::os::unix::process::ExitStatusExt;
    // Raw wait status of a SIGKILL termination
    std::process::ExitStatus::from_raw(9)
}

#[cfg(not(unix))]
fn killed_status() -> std::process::ExitStatus {
    use std::os::windows::process::ExitStatusExt;
    std::process::ExitStatus::from_raw(1)
}

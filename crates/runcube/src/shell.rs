//! Interactive shell on a pseudo-terminal
//!
//! Each connection owns one shell. PTY reads and writes are blocking, so they
//! run on blocking threads and are bridged to the session with channels.

use std::io::{ErrorKind, Read, Write};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use portable_pty::{ChildKiller, CommandBuilder, MasterPty, PtySize, native_pty_system};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::config::ShellSettings;
use crate::decode::Utf8Decoder;

const FALLBACK_SHELL: &str = "/bin/sh";
const CHANNEL_CAPACITY: usize = 256;
const REAP_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum ShellError {
    #[error(transparent)]
    Pty(#[from] anyhow::Error),

    #[error("shell is not running")]
    Closed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A shell process attached to a pseudo-terminal
pub struct ShellSession {
    writer: mpsc::Sender<Vec<u8>>,
    output: mpsc::Receiver<String>,
    master: Arc<Mutex<Box<dyn MasterPty + Send>>>,
    killer: Box<dyn ChildKiller + Send + Sync>,
    pid: Option<u32>,
    wait: JoinHandle<Option<u32>>,
}

impl ShellSession {
    /// Spawn the configured shell
    ///
    /// Must be called from within a tokio runtime.
    #[instrument(skip(settings), fields(program = ?settings.program))]
    pub fn spawn(settings: &ShellSettings, chunk_size: usize) -> Result<Self, ShellError> {
        let pair = native_pty_system().openpty(PtySize {
            rows: settings.rows,
            cols: settings.cols,
            pixel_width: 0,
            pixel_height: 0,
        })?;

        let program = settings.program.clone().unwrap_or_else(default_shell);
        let mut builder = CommandBuilder::new(&program);
        builder.args(&settings.args);
        builder.env("TERM", "xterm-256color");
        if let Some(ref cwd) = settings.cwd {
            builder.cwd(cwd);
        }

        let mut child = pair.slave.spawn_command(builder)?;
        // The master sees EOF only once every slave handle is closed
        drop(pair.slave);

        let killer = child.clone_killer();
        let pid = child.process_id();

        let (output_tx, output_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let reader = pair.master.try_clone_reader()?;
        tokio::task::spawn_blocking(move || read_loop(reader, output_tx, chunk_size));

        let (writer_tx, writer_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let writer = pair.master.take_writer()?;
        tokio::task::spawn_blocking(move || write_loop(writer, writer_rx));

        let wait = tokio::task::spawn_blocking(move || match child.wait() {
            Ok(status) => Some(status.exit_code()),
            Err(e) => {
                debug!(error = %e, "failed to wait for shell");
                None
            }
        });

        info!(%program, ?pid, "shell started");

        Ok(Self {
            writer: writer_tx,
            output: output_rx,
            master: Arc::new(Mutex::new(pair.master)),
            killer,
            pid,
            wait,
        })
    }

    /// OS process ID of the shell
    pub fn process_id(&self) -> Option<u32> {
        self.pid
    }

    /// Write raw bytes to the terminal
    pub async fn write(&self, data: impl Into<Vec<u8>>) -> Result<(), ShellError> {
        self.writer
            .send(data.into())
            .await
            .map_err(|_| ShellError::Closed)
    }

    /// Change the terminal size
    pub fn resize(&self, cols: u16, rows: u16) -> Result<(), ShellError> {
        let master = self.master.lock().map_err(|_| ShellError::Closed)?;
        master.resize(PtySize {
            rows,
            cols,
            pixel_width: 0,
            pixel_height: 0,
        })?;
        debug!(cols, rows, "terminal resized");
        Ok(())
    }

    /// Next chunk of terminal output; `None` once the shell has exited
    pub async fn recv(&mut self) -> Option<String> {
        self.output.recv().await
    }

    /// Kill the shell and reap it
    #[instrument(skip(self), fields(pid = ?self.pid))]
    pub async fn terminate(mut self) -> Result<(), ShellError> {
        if !self.wait.is_finished()
            && let Err(e) = self.killer.kill()
            && e.kind() != ErrorKind::NotFound
        {
            warn!(error = %e, "failed to kill shell");
        }

        // Closing the channel ends the writer thread
        drop(self.writer);

        match tokio::time::timeout(REAP_TIMEOUT, &mut self.wait).await {
            Ok(Ok(code)) => {
                debug!(?code, "shell reaped");
                Ok(())
            }
            Ok(Err(e)) => Err(ShellError::Io(std::io::Error::other(e))),
            Err(_) => {
                warn!("shell did not exit after kill");
                Err(ShellError::Io(std::io::Error::new(
                    ErrorKind::TimedOut,
                    "shell did not exit after kill",
                )))
            }
        }
    }
}

impl std::fmt::Debug for ShellSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShellSession")
            .field("pid", &self.pid)
            .finish_non_exhaustive()
    }
}

fn default_shell() -> String {
    std::env::var("SHELL")
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| FALLBACK_SHELL.to_owned())
}

fn read_loop(mut reader: Box<dyn Read + Send>, output: mpsc::Sender<String>, chunk_size: usize) {
    let mut buf = vec![0u8; chunk_size.max(1)];
    let mut decoder = Utf8Decoder::new();
    loop {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                let text = decoder.decode(&buf[..n]);
                if !text.is_empty() && output.blocking_send(text).is_err() {
                    return;
                }
            }
            Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(ref e) if e.kind() == ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(5));
            }
            // EIO once the shell is gone
            Err(e) => {
                debug!(error = %e, "terminal read ended");
                break;
            }
        }
    }

    let rest = decoder.finish();
    if !rest.is_empty() {
        let _ = output.blocking_send(rest);
    }
}

fn write_loop(mut writer: Box<dyn Write + Send>, mut input: mpsc::Receiver<Vec<u8>>) {
    while let Some(bytes) = input.blocking_recv() {
        if let Err(e) = writer.write_all(&bytes).and_then(|()| writer.flush()) {
            debug!(error = %e, "terminal write failed");
            return;
        }
    }
}

//! Streaming of child process output into execution events

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::decode::Utf8Decoder;
use crate::runner::ExecutionEvent;
use crate::types::{Diagnostic, ExecutionOutcome, ExecutionState, OutputStream};

/// Sends events for one execution
#[derive(Debug, Clone)]
pub struct OutputSink {
    id: Uuid,
    events: mpsc::Sender<ExecutionEvent>,
}

impl OutputSink {
    pub fn new(id: Uuid, events: mpsc::Sender<ExecutionEvent>) -> Self {
        Self { id, events }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Forward a chunk of decoded output
    ///
    /// A closed receiver is ignored so the pipe keeps draining and the child
    /// never blocks on a full pipe.
    pub async fn output(&self, stream: OutputStream, data: String) {
        let _ = self
            .events
            .send(ExecutionEvent::Output {
                id: self.id,
                stream,
                data,
            })
            .await;
    }

    pub async fn state(&self, state: ExecutionState) {
        let _ = self
            .events
            .send(ExecutionEvent::State { id: self.id, state })
            .await;
    }

    pub async fn diagnostic(&self, diagnostic: Diagnostic) {
        let _ = self
            .events
            .send(ExecutionEvent::Diagnostic {
                id: self.id,
                diagnostic,
            })
            .await;
    }

    pub async fn finished(&self, outcome: ExecutionOutcome) {
        let _ = self.events.send(ExecutionEvent::Finished(outcome)).await;
    }
}

/// Read `reader` to EOF, forwarding every chunk as soon as it arrives
///
/// Returns the number of raw bytes read.
pub(crate) async fn pump<R>(
    mut reader: R,
    stream: OutputStream,
    sink: OutputSink,
    chunk_size: usize,
) -> u64
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; chunk_size.max(1)];
    let mut decoder = Utf8Decoder::new();
    let mut total = 0u64;

    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                total += n as u64;
                let text = decoder.decode(&buf[..n]);
                if !text.is_empty() {
                    sink.output(stream, text).await;
                }
            }
            Err(e) => {
                debug!(?stream, error = %e, "output read failed");
                break;
            }
        }
    }

    let rest = decoder.finish();
    if !rest.is_empty() {
        sink.output(stream, rest).await;
    }
    total
}

/// Wait for an output reader, giving up after the grace period
///
/// A grandchild that inherited the pipe can keep it open after the process
/// itself is gone. Returns the bytes read, or 0 when the reader was abandoned.
pub(crate) async fn drain(reader: Option<JoinHandle<u64>>, grace: Duration) -> u64 {
    let Some(mut reader) = reader else {
        return 0;
    };
    match tokio::time::timeout(grace, &mut reader).await {
        Ok(bytes) => bytes.unwrap_or_default(),
        Err(_) => {
            warn!("output reader did not finish within the grace period");
            reader.abort();
            0
        }
    }
}

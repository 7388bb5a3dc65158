//! Integration tests for runcube
//!
//! Most tests only need `/bin/sh` and run everywhere. Tests that need real
//! language toolchains (python3, gcc, javac) are behind a feature:
//!    cargo test -p runcube --features integration-tests

use std::sync::Arc;
use std::time::Duration;

use runcube::config::Config;
use runcube::{
    ExecutionEvent, ExecutionOutcome, LanguageRegistry, RunRequest, Runner, ServerMessage,
    SessionManager,
};
use tempfile::TempDir;
use tokio::sync::mpsc;

mod config_loading;
mod execution;

const FIXTURES_PATH: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/tests/fixtures");

/// Upper bound for anything a test waits on
pub(crate) const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Languages that only need a POSIX shell
const SH_LANGUAGES: &str = r#"
[shell]
program = "/bin/sh"

[languages.shell]
name = "POSIX shell"
extension = "sh"

[languages.shell.run]
command = ["sh", "{source}"]

[languages.entry]
name = "Shell with entry name"
extension = "sh"
entry_pattern = '#\s*entry:\s*(\w+)'

[languages.entry.run]
command = ["sh", "{source}"]

[languages.shc]
name = "Checked shell"
extension = "sh"

[languages.shc.compile]
command = ["sh", "-c", "sh -n \"$0\" && cp \"$0\" \"$1\"", "{source}", "{binary}"]
output_name = "main.out"

[languages.shc.run]
command = ["sh", "{binary}"]

[languages.bgc]
name = "Shell with a lingering compiler helper"
extension = "sh"

[languages.bgc.compile]
command = ["sh", "-c", "sleep 20 & cp \"$0\" \"$1\"", "{source}", "{binary}"]
output_name = "main.out"

[languages.bgc.run]
command = ["sh", "{binary}"]

[languages.ghost]
name = "Ghost"
extension = "gh"

[languages.ghost.compile]
command = ["runcube-missing-compiler", "-o", "{binary}", "{source}"]

[languages.ghost.run]
command = ["{binary}"]

[languages.nope]
name = "Missing runtime"
extension = "np"

[languages.nope.run]
command = ["runcube-missing-runtime", "{source}"]
"#;

/// Helper to get fixture file content
pub(crate) fn fixture_source(name: &str) -> String {
    let path = format!("{FIXTURES_PATH}/sources/{name}");
    std::fs::read_to_string(&path).unwrap_or_else(|e| panic!("Failed to read fixture {path}: {e}"))
}

/// Shell-only config with its own temp root and the given time limit
pub(crate) fn sh_config(timeout_secs: u64) -> (Config, TempDir) {
    let temp = tempfile::tempdir().expect("failed to create temp dir");
    let mut config = Config::parse_toml(SH_LANGUAGES).expect("test config should be valid");
    config.temp_dir = temp.path().to_path_buf();
    config.execution.timeout_secs = timeout_secs;
    config.execution.kill_grace_ms = 200;
    (config, temp)
}

pub(crate) fn sh_runner(timeout_secs: u64) -> (Runner, TempDir) {
    let (config, temp) = sh_config(timeout_secs);
    let runner = Runner::from_config(&config).expect("registry should build");
    (runner, temp)
}

pub(crate) fn sh_manager(timeout_secs: u64) -> (SessionManager, TempDir) {
    let (config, temp) = sh_config(timeout_secs);
    let registry = LanguageRegistry::from_config(&config).expect("registry should build");
    let manager = SessionManager::new(config, Arc::new(registry)).expect("manager should build");
    (manager, temp)
}

/// Names of execution directories left under `root`
pub(crate) fn leftover_dirs(root: &std::path::Path) -> Vec<String> {
    std::fs::read_dir(root)
        .map(|entries| {
            entries
                .filter_map(Result::ok)
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .filter(|name| name.starts_with("exec-"))
                .collect()
        })
        .unwrap_or_default()
}

/// Run one request to completion and collect everything it produced
pub(crate) async fn run_collect(
    runner: &Runner,
    request: RunRequest,
) -> (ExecutionOutcome, Vec<ExecutionEvent>) {
    let (tx, mut rx) = mpsc::channel(1024);
    let outcome = tokio::time::timeout(TEST_TIMEOUT, runner.execute(request, tx))
        .await
        .expect("execution did not finish");

    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    (outcome, events)
}

/// Concatenated output text of the given events
pub(crate) fn output_text(events: &[ExecutionEvent]) -> String {
    events
        .iter()
        .filter_map(|e| match e {
            ExecutionEvent::Output { data, .. } => Some(data.as_str()),
            _ => None,
        })
        .collect()
}

/// Client side of a session driven through channels
pub(crate) struct TestClient {
    pub inbound: mpsc::Sender<String>,
    pub outbound: mpsc::Receiver<ServerMessage>,
    /// Every `output` payload seen so far
    pub transcript: String,
}

impl TestClient {
    pub fn new() -> (Self, mpsc::Receiver<String>, mpsc::Sender<ServerMessage>) {
        let (in_tx, in_rx) = mpsc::channel(64);
        let (out_tx, out_rx) = mpsc::channel(1024);
        let client = Self {
            inbound: in_tx,
            outbound: out_rx,
            transcript: String::new(),
        };
        (client, in_rx, out_tx)
    }

    pub async fn send(&self, frame: impl Into<String>) {
        self.inbound
            .send(frame.into())
            .await
            .expect("session stopped accepting input");
    }

    pub async fn run_code(&self, language: &str, source: &str) {
        let frame = serde_json::json!({
            "type": "run_code",
            "language": language,
            "data": source,
        });
        self.send(frame.to_string()).await;
    }

    pub async fn send_input(&self, data: &str) {
        let frame = serde_json::json!({"type": "send-input", "data": data});
        self.send(frame.to_string()).await;
    }

    /// Wait for a message matching `pred`, recording output along the way
    pub async fn expect<F>(&mut self, what: &str, mut pred: F) -> ServerMessage
    where
        F: FnMut(&ServerMessage, &str) -> bool,
    {
        let result = tokio::time::timeout(TEST_TIMEOUT, async {
            while let Some(message) = self.outbound.recv().await {
                if let ServerMessage::Output(ref text) = message {
                    self.transcript.push_str(text);
                }
                if pred(&message, &self.transcript) {
                    return Some(message);
                }
            }
            None
        })
        .await;

        match result {
            Ok(Some(message)) => message,
            Ok(None) => panic!(
                "session closed while waiting for {what}; transcript: {:?}",
                self.transcript
            ),
            Err(_) => panic!(
                "timed out waiting for {what}; transcript: {:?}",
                self.transcript
            ),
        }
    }

    /// Wait until the transcript contains `needle`
    pub async fn expect_output(&mut self, needle: &str) {
        self.expect(needle, |_, transcript| transcript.contains(needle))
            .await;
    }

    /// Wait for an `execution-status` in the given state
    pub async fn expect_status(&mut self, state: runcube::ExecutionState) -> runcube::StatusReport {
        let message = self
            .expect(&format!("status {state}"), |m, _| {
                matches!(m, ServerMessage::ExecutionStatus(r) if r.state == state)
            })
            .await;
        match message {
            ServerMessage::ExecutionStatus(report) => report,
            _ => unreachable!(),
        }
    }
}

//! Wire messages exchanged with a connected client
//!
//! Inbound frames are JSON objects tagged by `type`. Anything that does not
//! parse as one of them is raw terminal input for the shell. Outbound frames
//! are always JSON objects with `type` and `data`.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{DiagnosticKind, ExecutionOutcome, ExecutionState};

/// Structured message sent by the client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    /// Compile (if needed) and run a program
    #[serde(rename = "run_code")]
    RunCode {
        language: String,
        data: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        input: Option<String>,
    },

    /// Line typed while a program may be waiting for input
    #[serde(rename = "send-input")]
    SendInput { data: String },

    /// Terminal keystrokes wrapped in JSON, written to the shell as-is
    #[serde(rename = "input")]
    Input { data: String },

    /// Terminal dimensions changed
    #[serde(rename = "resize")]
    Resize { cols: u16, rows: u16 },
}

impl ClientMessage {
    /// Parse a text frame; `None` means raw shell input
    pub fn parse(text: &str) -> Option<Self> {
        let trimmed = text.trim_start();
        if !trimmed.starts_with('{') {
            return None;
        }
        serde_json::from_str(trimmed).ok()
    }
}

/// Message sent to the client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ServerMessage {
    /// Terminal text from the shell, the compiler or the running program
    #[serde(rename = "output")]
    Output(String),

    /// Whether the running program appears to be waiting for input
    #[serde(rename = "prompt-waiting")]
    PromptWaiting(bool),

    /// Execution lifecycle change
    #[serde(rename = "execution-status")]
    ExecutionStatus(StatusReport),
}

/// Snapshot of an execution's lifecycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReport {
    pub id: Uuid,
    pub language: String,
    pub state: ExecutionState,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<DiagnosticKind>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal: Option<i32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

impl StatusReport {
    /// Report for a state transition that is not final yet
    pub fn transition(id: Uuid, language: impl Into<String>, state: ExecutionState) -> Self {
        Self {
            id,
            language: language.into(),
            state,
            kind: None,
            exit_code: None,
            signal: None,
            duration_ms: None,
        }
    }
}

impl From<&ExecutionOutcome> for StatusReport {
    fn from(outcome: &ExecutionOutcome) -> Self {
        Self {
            id: outcome.id,
            language: outcome.language.clone(),
            state: outcome.state,
            kind: outcome.kind(),
            exit_code: outcome.exit.and_then(|e| e.code),
            signal: outcome.exit.and_then(|e| e.signal),
            duration_ms: Some(u64::try_from(outcome.duration.as_millis()).unwrap_or(u64::MAX)),
        }
    }
}

impl ServerMessage {
    pub fn output(text: impl Into<String>) -> Self {
        Self::Output(text.into())
    }

    /// Serialize to a JSON text frame
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

//! Inbound message routing and prompt detection
//!
//! The router decides where each client frame goes: the shell, the active
//! execution's stdin, or the execution controller. The prompt detector looks
//! at program output and guesses whether the program is waiting for input.

use regex::{Regex, RegexBuilder};

use crate::config::PromptSettings;
use crate::protocol::ClientMessage;
use crate::runner::RunRequest;
use crate::types::{Diagnostic, DiagnosticKind};

/// Default phrasings that suggest a program is waiting for input
pub const DEFAULT_PROMPT_PATTERNS: &[&str] = &[
    r"\b(enter|input|type|name|choose|select|password)\b",
    r"(\[y/n\]|\(y/n\)|\[yes/no\])",
    r"[:?>]\s*$",
];

/// Classified inbound frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// Keystrokes for the terminal
    RawShellInput(String),

    /// A line meant for the running program
    TypedInput(String),

    /// Start an execution
    RunRequest(RunRequest),

    /// Terminal size change
    Resize { cols: u16, rows: u16 },
}

/// Classify one inbound text frame
pub fn classify(text: &str) -> Inbound {
    match ClientMessage::parse(text) {
        Some(ClientMessage::RunCode {
            language,
            data,
            input,
        }) => Inbound::RunRequest(RunRequest {
            language,
            source: data,
            input,
        }),
        Some(ClientMessage::SendInput { data }) => Inbound::TypedInput(data),
        Some(ClientMessage::Input { data }) => Inbound::RawShellInput(data),
        Some(ClientMessage::Resize { cols, rows }) => Inbound::Resize { cols, rows },
        None => Inbound::RawShellInput(text.to_owned()),
    }
}

/// Where an inbound frame should go
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// Bytes to write to the shell's terminal
    Shell(Vec<u8>),

    /// Line for the active execution's stdin
    Execution(Vec<u8>),

    /// Start a new execution
    Run(RunRequest),

    /// Refuse a run request and tell the client why
    Reject(Diagnostic),

    /// Resize the shell's terminal
    Resize { cols: u16, rows: u16 },
}

/// Decide where `inbound` goes given whether an execution is active
pub fn route(inbound: Inbound, execution_active: bool) -> Route {
    match inbound {
        Inbound::RawShellInput(text) => Route::Shell(text.into_bytes()),
        Inbound::TypedInput(text) if execution_active => Route::Execution(program_line(&text)),
        Inbound::TypedInput(text) => Route::Shell(shell_line(&text)),
        Inbound::RunRequest(_) if execution_active => Route::Reject(Diagnostic::new(
            DiagnosticKind::ExecutionInProgress,
            "execution already in progress",
        )),
        Inbound::RunRequest(request) => Route::Run(request),
        Inbound::Resize { cols, rows } => Route::Resize { cols, rows },
    }
}

/// Newline-terminate typed input for a line-oriented program
pub fn program_line(text: &str) -> Vec<u8> {
    let mut line = text.as_bytes().to_vec();
    if !line.ends_with(b"\n") {
        line.push(b'\n');
    }
    line
}

/// Terminate typed input the way a terminal's Enter key does
pub fn shell_line(text: &str) -> Vec<u8> {
    let trimmed = text.trim_end_matches(['\r', '\n']);
    let mut line = Vec::with_capacity(trimmed.len() + 1);
    line.extend_from_slice(trimmed.as_bytes());
    line.push(b'\r');
    line
}

/// Heuristic "awaiting input" detector
///
/// Advisory only: a false positive just shows an input hint.
#[derive(Debug, Clone)]
pub struct PromptDetector {
    patterns: Vec<Regex>,
}

impl PromptDetector {
    /// Build a detector from case-insensitive patterns
    pub fn new<I, S>(patterns: I) -> Result<Self, regex::Error>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let patterns = patterns
            .into_iter()
            .map(|p| RegexBuilder::new(p.as_ref()).case_insensitive(true).build())
            .collect::<Result<_, _>>()?;
        Ok(Self { patterns })
    }

    /// Detector with the configured patterns, or the defaults
    pub fn from_settings(settings: &PromptSettings) -> Result<Self, regex::Error> {
        match settings.patterns {
            Some(ref patterns) => Self::new(patterns),
            None => Self::new(DEFAULT_PROMPT_PATTERNS),
        }
    }

    /// Check if `chunk` looks like a prompt
    ///
    /// Only the last line is considered: the text after the final newline,
    /// or the last non-empty line when the chunk ends with one.
    pub fn detect(&self, chunk: &str) -> bool {
        let tail = last_line(chunk);
        if tail.is_empty() {
            return false;
        }
        self.patterns.iter().any(|p| p.is_match(tail))
    }
}

impl Default for PromptDetector {
    fn default() -> Self {
        Self {
            patterns: DEFAULT_PROMPT_PATTERNS
                .iter()
                .filter_map(|p| RegexBuilder::new(p).case_insensitive(true).build().ok())
                .collect(),
        }
    }
}

fn last_line(chunk: &str) -> &str {
    let chunk = chunk.trim_end_matches(['\r', '\n']);
    match chunk.rfind('\n') {
        Some(pos) => chunk[pos + 1..].trim_end_matches('\r'),
        None => chunk,
    }
}

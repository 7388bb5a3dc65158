use std::path::PathBuf;
use std::time::{Duration, Instant};

use runcube::config::Config;
use runcube::{
    DiagnosticKind, ExecutionEvent, ExecutionState, LanguageRegistry, OutputStream, RunRequest,
    Runner, ToolchainProbe,
};
use tokio::sync::mpsc;

use super::{TEST_TIMEOUT, fixture_source, leftover_dirs, output_text, run_collect, sh_runner};

fn states(events: &[ExecutionEvent]) -> Vec<ExecutionState> {
    events
        .iter()
        .filter_map(|e| match e {
            ExecutionEvent::State { state, .. } => Some(*state),
            _ => None,
        })
        .collect()
}

fn diagnostics(events: &[ExecutionEvent]) -> Vec<DiagnosticKind> {
    events
        .iter()
        .filter_map(|e| match e {
            ExecutionEvent::Diagnostic { diagnostic, .. } => Some(diagnostic.kind),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_interpreted_hello() {
    let (runner, temp) = sh_runner(5);

    let (outcome, events) = run_collect(&runner, RunRequest::new("shell", "echo hello")).await;

    assert_eq!(outcome.state, ExecutionState::Completed);
    assert!(outcome.is_success());
    assert_eq!(output_text(&events), "hello\n");
    assert_eq!(states(&events), vec![ExecutionState::Running]);
    assert!(matches!(events.last(), Some(ExecutionEvent::Finished(_))));
    assert!(leftover_dirs(temp.path()).is_empty());
}

#[tokio::test]
async fn test_compiled_hello() {
    let (runner, temp) = sh_runner(5);

    let (outcome, events) = run_collect(&runner, RunRequest::new("shc", "echo compiled")).await;

    assert_eq!(outcome.state, ExecutionState::Completed, "{events:?}");
    assert_eq!(
        states(&events),
        vec![ExecutionState::Compiling, ExecutionState::Running]
    );
    assert_eq!(output_text(&events), "compiled\n");
    assert!(leftover_dirs(temp.path()).is_empty());
}

#[tokio::test]
async fn test_compile_error_skips_run() {
    let (runner, temp) = sh_runner(5);

    let (outcome, events) = run_collect(&runner, RunRequest::new("shc", "if then fi (")).await;

    assert_eq!(outcome.state, ExecutionState::Failed);
    assert_eq!(outcome.kind(), Some(DiagnosticKind::CompileError));
    assert!(!states(&events).contains(&ExecutionState::Running));
    assert!(outcome.exit.is_none());

    // The syntax error reaches the client as compiler output
    assert!(outcome.compiler_bytes > 0);
    assert!(events.iter().any(|e| matches!(
        e,
        ExecutionEvent::Output {
            stream: OutputStream::Compiler,
            ..
        }
    )));
    assert!(leftover_dirs(temp.path()).is_empty());
}

#[tokio::test]
async fn test_compiler_grandchild_holding_pipes_does_not_stall() {
    let (runner, temp) = sh_runner(5);
    let started = Instant::now();

    let (outcome, events) = run_collect(&runner, RunRequest::new("bgc", "echo built")).await;

    assert_eq!(outcome.state, ExecutionState::Completed, "{events:?}");
    assert_eq!(
        states(&events),
        vec![ExecutionState::Compiling, ExecutionState::Running]
    );
    assert_eq!(output_text(&events), "built\n");
    // Well under the 20s the helper sleeps; only the kill grace is spent
    assert!(started.elapsed() < Duration::from_secs(5), "{:?}", started.elapsed());
    assert!(leftover_dirs(temp.path()).is_empty());
}

#[tokio::test]
async fn test_toolchain_unavailable_spawns_nothing() {
    let (runner, temp) = sh_runner(5);
    assert!(!runner.registry().describe("ghost").unwrap().compileable);

    let (outcome, events) = run_collect(&runner, RunRequest::new("ghost", "anything")).await;

    assert_eq!(outcome.state, ExecutionState::Failed);
    assert_eq!(outcome.kind(), Some(DiagnosticKind::ToolchainUnavailable));
    assert!(states(&events).is_empty());
    let message = &outcome.diagnostic.as_ref().unwrap().message;
    assert!(message.contains("runcube-missing-compiler"), "{message}");
    assert!(leftover_dirs(temp.path()).is_empty());
}

/// Probe that finds nothing, as on a host without any toolchain
struct BareHost;

impl ToolchainProbe for BareHost {
    fn locate(&self, _program: &str, _extra_dirs: &[PathBuf]) -> Option<PathBuf> {
        None
    }
}

#[tokio::test]
async fn test_java_without_jdk_is_toolchain_unavailable() {
    let temp = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.temp_dir = temp.path().to_path_buf();

    let registry = LanguageRegistry::probe(&config, &BareHost).unwrap();
    assert!(registry.describe("java").is_ok());
    let runner = Runner::new(&config, std::sync::Arc::new(registry));

    let started = Instant::now();
    let (outcome, _events) =
        run_collect(&runner, RunRequest::new("java", fixture_source("Greeter.java"))).await;

    assert_eq!(outcome.kind(), Some(DiagnosticKind::ToolchainUnavailable));
    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(leftover_dirs(temp.path()).is_empty());
}

#[tokio::test]
async fn test_timeout_kills_program() {
    let (runner, temp) = sh_runner(1);

    let started = Instant::now();
    let (outcome, events) =
        run_collect(&runner, RunRequest::new("shell", "echo started\nexec sleep 30")).await;

    assert_eq!(outcome.state, ExecutionState::TimedOut);
    assert_eq!(outcome.kind(), Some(DiagnosticKind::TimeoutExceeded));
    assert_eq!(diagnostics(&events), vec![DiagnosticKind::TimeoutExceeded]);
    assert!(output_text(&events).contains("started"));
    assert!(started.elapsed() < Duration::from_secs(5));

    let exit = outcome.exit.expect("killed program should be reaped");
    assert_eq!(exit.code, None);
    assert_eq!(exit.signal, Some(9));
    assert!(leftover_dirs(temp.path()).is_empty());
}

#[tokio::test]
async fn test_initial_input_is_written() {
    let (runner, _temp) = sh_runner(5);

    let request = RunRequest::new("shell", fixture_source("greet.sh")).with_input("Ada\n");
    let (outcome, events) = run_collect(&runner, request).await;

    assert!(outcome.is_success());
    assert_eq!(output_text(&events), "What is your name? Hello, Ada!\n");
}

#[tokio::test]
async fn test_typed_input_reaches_program() {
    let (runner, temp) = sh_runner(5);
    let (tx, mut rx) = mpsc::channel(64);

    let handle = runner.start(RunRequest::new("shell", fixture_source("greet.sh")), tx);
    let dir = handle.artifact_dir().to_path_buf();

    // Wait until the prompt is printed before typing
    let mut output = String::new();
    tokio::time::timeout(TEST_TIMEOUT, async {
        while let Some(event) = rx.recv().await {
            if let ExecutionEvent::Output { data, .. } = event {
                output.push_str(&data);
                if output.contains("name?") {
                    break;
                }
            }
        }
    })
    .await
    .expect("prompt never appeared");

    assert!(handle.is_active());
    assert_eq!(handle.state(), ExecutionState::Running);
    handle.send_input(b"Bob\n".to_vec()).unwrap();

    let outcome = tokio::time::timeout(TEST_TIMEOUT, handle.wait()).await.unwrap();
    while let Ok(event) = rx.try_recv() {
        if let ExecutionEvent::Output { data, .. } = event {
            output.push_str(&data);
        }
    }

    assert!(outcome.is_success());
    assert!(output.contains("Hello, Bob!"), "{output:?}");
    assert!(!dir.exists());
    assert!(leftover_dirs(temp.path()).is_empty());
}

#[tokio::test]
async fn test_nonzero_exit_is_completed() {
    let (runner, _temp) = sh_runner(5);

    let (outcome, events) = run_collect(&runner, RunRequest::new("shell", "exit 3")).await;

    assert_eq!(outcome.state, ExecutionState::Completed);
    assert_eq!(outcome.exit.and_then(|e| e.code), Some(3));
    assert!(!outcome.is_success());
    assert!(outcome.diagnostic.is_none());
    assert!(diagnostics(&events).is_empty());
}

#[tokio::test]
async fn test_stderr_is_streamed_separately() {
    let (runner, _temp) = sh_runner(5);

    let (outcome, events) =
        run_collect(&runner, RunRequest::new("shell", "echo out\necho err >&2")).await;

    assert!(outcome.is_success());
    assert_eq!(outcome.stdout_bytes, 4);
    assert_eq!(outcome.stderr_bytes, 4);
    assert!(events.iter().any(|e| matches!(
        e,
        ExecutionEvent::Output { stream: OutputStream::Stderr, data, .. } if data == "err\n"
    )));
}

#[tokio::test]
async fn test_unknown_language() {
    let (runner, temp) = sh_runner(5);

    let (outcome, events) = run_collect(&runner, RunRequest::new("cobol", "DISPLAY 'HI'")).await;

    assert_eq!(outcome.state, ExecutionState::Failed);
    assert_eq!(outcome.kind(), Some(DiagnosticKind::UnknownLanguage));
    assert_eq!(diagnostics(&events), vec![DiagnosticKind::UnknownLanguage]);
    assert!(leftover_dirs(temp.path()).is_empty());
}

#[tokio::test]
async fn test_missing_runtime_is_spawn_error() {
    let (runner, temp) = sh_runner(5);

    let (outcome, _events) = run_collect(&runner, RunRequest::new("nope", "x")).await;

    assert_eq!(outcome.state, ExecutionState::Failed);
    assert_eq!(outcome.kind(), Some(DiagnosticKind::SpawnError));
    assert!(leftover_dirs(temp.path()).is_empty());
}

#[tokio::test]
async fn test_entry_name_renames_source() {
    let (runner, _temp) = sh_runner(5);

    let source = "# entry: Greeter\nbasename \"$0\"\n";
    let (outcome, events) = run_collect(&runner, RunRequest::new("entry", source)).await;

    assert!(outcome.is_success());
    assert_eq!(output_text(&events), "Greeter.sh\n");
}

#[tokio::test]
async fn test_program_runs_in_its_own_directory() {
    let (runner, temp) = sh_runner(5);

    let source = "echo scratch > scratch.txt\npwd";
    let (outcome, events) = run_collect(&runner, RunRequest::new("shell", source)).await;

    assert!(outcome.is_success());
    let cwd = output_text(&events);
    assert!(cwd.trim().contains(&format!("exec-{}", outcome.id)), "{cwd}");
    // Files the program created are removed with the directory
    assert!(leftover_dirs(temp.path()).is_empty());
}

#[tokio::test]
async fn test_cancel_kills_program() {
    let (runner, temp) = sh_runner(30);
    let (tx, mut rx) = mpsc::channel(64);

    let handle = runner.start(RunRequest::new("shell", "echo ready\nexec sleep 30"), tx);

    tokio::time::timeout(TEST_TIMEOUT, async {
        while let Some(event) = rx.recv().await {
            if matches!(event, ExecutionEvent::Output { ref data, .. } if data.contains("ready")) {
                break;
            }
        }
    })
    .await
    .expect("program never started");

    let started = Instant::now();
    handle.cancel();
    let outcome = tokio::time::timeout(TEST_TIMEOUT, handle.wait()).await.unwrap();

    assert_eq!(outcome.state, ExecutionState::Failed);
    assert!(outcome.diagnostic.is_none());
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(leftover_dirs(temp.path()).is_empty());
}

#[tokio::test]
async fn test_send_input_after_finish_is_refused() {
    let (runner, _temp) = sh_runner(5);
    let (tx, mut rx) = mpsc::channel(64);

    let handle = runner.start(RunRequest::new("shell", "true"), tx);
    tokio::time::timeout(TEST_TIMEOUT, async {
        while let Some(event) = rx.recv().await {
            if matches!(event, ExecutionEvent::Finished(_)) {
                break;
            }
        }
    })
    .await
    .unwrap();

    // Give the supervisor a moment to return after sending the last event
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!handle.is_active());
    assert_eq!(handle.send_input(b"late\n".to_vec()), Err(b"late\n".to_vec()));
}

#[tokio::test]
async fn test_concurrent_executions_use_separate_directories() {
    let (runner, temp) = sh_runner(5);

    let a = run_collect(&runner, RunRequest::new("shell", "pwd"));
    let b = run_collect(&runner, RunRequest::new("shell", "pwd"));
    let ((outcome_a, events_a), (outcome_b, events_b)) = tokio::join!(a, b);

    assert!(outcome_a.is_success() && outcome_b.is_success());
    assert_ne!(outcome_a.id, outcome_b.id);
    assert_ne!(output_text(&events_a), output_text(&events_b));
    assert!(leftover_dirs(temp.path()).is_empty());
}

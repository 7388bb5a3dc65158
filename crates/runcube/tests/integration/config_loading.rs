use std::path::{Path, PathBuf};
use std::time::Duration;

use runcube::config::Config;
use runcube::{LanguageRegistry, PromptDetector, ToolchainProbe};

use super::FIXTURES_PATH;

fn fixture_config(name: &str) -> String {
    format!("{FIXTURES_PATH}/configs/{name}")
}

/// Probe that claims every program is installed under /opt/fake/bin
struct EverythingInstalled;

impl ToolchainProbe for EverythingInstalled {
    fn locate(&self, program: &str, _extra_dirs: &[PathBuf]) -> Option<PathBuf> {
        Some(Path::new("/opt/fake/bin").join(program))
    }
}

#[test]
fn test_load_valid_config() {
    let config =
        Config::from_file(fixture_config("valid_full.toml")).expect("Failed to load config");

    assert_eq!(config.temp_dir, PathBuf::from("/tmp/runcube-fixture"));
    assert_eq!(config.execution.timeout(), Duration::from_secs(5));
    assert_eq!(config.execution.kill_grace(), Duration::from_millis(250));
    assert_eq!(config.execution.chunk_size, 1024);
    assert_eq!(config.shell.program.as_deref(), Some("/bin/sh"));
    assert_eq!((config.shell.cols, config.shell.rows), (100, 30));
    assert_eq!(config.server.bind, "0.0.0.0:9100");
    assert_eq!(config.language_ids(), vec!["c", "java", "python"]);

    let python = &config.languages["python"];
    assert_eq!(python.run.env["PYTHONIOENCODING"], "utf-8");
    assert!(!python.is_compiled());
}

#[test]
fn test_load_minimal_config() {
    let config =
        Config::from_file(fixture_config("valid_minimal.toml")).expect("Failed to load config");

    assert!(config.languages.contains_key("test"));
    assert_eq!(config.execution.timeout_secs, 30);
    assert_eq!(config.shell.program, None);
    assert_eq!(config.server.bind, "127.0.0.1:8080");
}

#[test]
fn test_load_invalid_empty_name() {
    let result = Config::from_file(fixture_config("invalid_empty_name.toml"));
    assert!(result.is_err());
}

#[test]
fn test_load_invalid_empty_extension() {
    let result = Config::from_file(fixture_config("invalid_empty_extension.toml"));
    assert!(result.is_err());
}

#[test]
fn test_load_invalid_empty_run_command() {
    let result = Config::from_file(fixture_config("invalid_empty_run_command.toml"));
    assert!(result.is_err());
}

#[test]
fn test_load_invalid_entry_pattern() {
    let err = Config::from_file(fixture_config("invalid_entry_pattern.toml")).unwrap_err();
    assert!(err.to_string().contains("entry_pattern"), "{err}");
}

#[test]
fn test_load_missing_file() {
    assert!(Config::from_file(fixture_config("does_not_exist.toml")).is_err());
}

#[test]
fn test_load_with_explicit_path() {
    let path = fixture_config("valid_full.toml");
    let config = Config::load(Some(Path::new(&path))).expect("Failed to load config");
    assert_eq!(config.languages.len(), 3);
}

#[test]
fn test_registry_from_fixture_config() {
    let config = Config::from_file(fixture_config("valid_full.toml")).unwrap();
    let registry = LanguageRegistry::probe(&config, &EverythingInstalled).unwrap();

    assert_eq!(registry.len(), 3);
    assert!(registry.unavailable().is_empty());

    let c = registry.describe("c").unwrap();
    assert!(c.is_compiled());
    assert_eq!(c.compile.as_ref().unwrap().program(), "/opt/fake/bin/gcc");
    assert_eq!(c.run.command, vec!["{binary}"]);

    let java = registry.describe("java").unwrap();
    assert_eq!(java.output_name, "{entry}.class");
    assert!(java.entry_pattern.is_some());

    let python = registry.describe("python").unwrap();
    assert_eq!(python.run.program(), "/opt/fake/bin/python3");
    assert_eq!(python.source_name(), "main.py");
}

#[test]
fn test_prompt_patterns_from_config() {
    let config = Config::from_file(fixture_config("valid_full.toml")).unwrap();
    let detector = PromptDetector::from_settings(&config.prompt).unwrap();

    assert!(detector.detect(">>> "));
    assert!(detector.detect("Continue?"));
    // Configured patterns replace the built-in ones
    assert!(!detector.detect("Enter a number"));
}

#[test]
fn test_default_config_probes_cleanly() {
    let config = Config::default();
    let registry = LanguageRegistry::probe(&config, &EverythingInstalled).unwrap();
    assert_eq!(registry.len(), config.languages.len());
    assert!(registry.unavailable().is_empty());
}

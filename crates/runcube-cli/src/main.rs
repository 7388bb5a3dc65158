//! Runcube CLI
//!
//! Serves interactive execution sessions over WebSocket and runs single
//! programs from the command line.

use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use runcube::{
    Config, EXAMPLE_CONFIG, ExecutionEvent, LanguageRegistry, OutputStream, RunRequest, Runner,
};
use tokio::sync::mpsc;
use tracing::{Level, debug, info};
use tracing_subscriber::EnvFilter;

mod server;

#[derive(Parser)]
#[command(name = "runcube")]
#[command(about = "Interactive multi-language code execution over WebSocket")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a new configuration file
    Init {
        /// Output path (default: runcube.toml)
        #[arg(short, long, default_value = "runcube.toml")]
        output: PathBuf,

        /// Overwrite existing file
        #[arg(short, long)]
        force: bool,
    },

    /// Serve terminal sessions over WebSocket
    Serve {
        /// Address to bind (overrides server.bind)
        #[arg(short, long)]
        bind: Option<String>,
    },

    /// Run a program (compile if needed, then execute)
    Run {
        /// Source file to run
        #[arg(value_name = "FILE")]
        source: PathBuf,

        /// Language ID (default: guessed from the file extension)
        #[arg(short, long)]
        language: Option<String>,

        /// Input file written to the program's stdin
        #[arg(short, long)]
        input: Option<PathBuf>,
    },

    /// List configured languages and whether their toolchain is installed
    Languages,

    /// Show effective configuration
    ShowConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::from_default_env().add_directive(Level::DEBUG.into())
    } else {
        EnvFilter::from_default_env().add_directive(Level::INFO.into())
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    if let Commands::Init { output, force } = &cli.command {
        return init_config(output, *force).await;
    }

    match cli.config {
        Some(ref path) => info!(?path, "loading configuration"),
        None => debug!("using default configuration"),
    }
    let config = Config::load(cli.config.as_deref()).context("failed to load configuration")?;

    match cli.command {
        Commands::Init { .. } => Ok(()),
        Commands::Serve { bind } => server::serve(config, bind).await,
        Commands::Run {
            source,
            language,
            input,
        } => run_program(&config, &source, language, input.as_deref()).await,
        Commands::Languages => list_languages(&config),
        Commands::ShowConfig => {
            show_config(&config);
            Ok(())
        }
    }
}

async fn run_program(
    config: &Config,
    source: &Path,
    language: Option<String>,
    input: Option<&Path>,
) -> Result<()> {
    let runner = Runner::from_config(config).context("failed to build language registry")?;

    let language = match language {
        Some(language) => language,
        None => guess_language(runner.registry(), source).with_context(|| {
            format!(
                "cannot tell the language of '{}', pass --language",
                source.display()
            )
        })?,
    };

    let source_content = tokio::fs::read_to_string(source)
        .await
        .context("failed to read source file")?;

    let input_data = match input {
        Some(path) => Some(
            tokio::fs::read_to_string(path)
                .await
                .context("failed to read input file")?,
        ),
        None => None,
    };

    runner
        .artifacts()
        .prepare()
        .await
        .context("failed to create temp directory")?;

    info!(%language, "running program");

    let (events_tx, mut events_rx) = mpsc::channel(256);
    let printer = tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            match event {
                ExecutionEvent::Output { stream, data, .. } => match stream {
                    OutputStream::Stdout => {
                        print!("{data}");
                        let _ = std::io::stdout().flush();
                    }
                    OutputStream::Stderr | OutputStream::Compiler => eprint!("{data}"),
                },
                ExecutionEvent::Diagnostic { diagnostic, .. } => eprintln!("{diagnostic}"),
                ExecutionEvent::State { state, .. } => debug!(%state, "state changed"),
                ExecutionEvent::Finished(_) => break,
            }
        }
    });

    let mut request = RunRequest::new(language, source_content);
    request.input = input_data;
    let outcome = runner.execute(request, events_tx).await;
    printer.await.context("output printer failed")?;

    // Log execution info via tracing (stderr), keeping stdout clean for piping
    info!(
        state = %outcome.state,
        kind = ?outcome.kind(),
        exit_code = ?outcome.exit.and_then(|e| e.code),
        signal = ?outcome.exit.and_then(|e| e.signal),
        duration = format_args!("{:.3}s", outcome.duration.as_secs_f64()),
        "execution result"
    );

    if outcome.is_success() {
        Ok(())
    } else {
        std::process::exit(outcome.exit.and_then(|e| e.code).unwrap_or(1));
    }
}

fn guess_language(registry: &LanguageRegistry, source: &Path) -> Option<String> {
    let extension = source.extension()?.to_str()?;
    registry
        .languages()
        .into_iter()
        .find(|d| d.extension == extension)
        .map(|d| d.id.clone())
}

fn list_languages(config: &Config) -> Result<()> {
    let registry =
        LanguageRegistry::from_config(config).context("failed to build language registry")?;

    println!("Available languages:\n");
    for lang in registry.languages() {
        let lang_type = if lang.is_compiled() {
            "compiled"
        } else {
            "interpreted"
        };
        let status = if lang.compileable { "" } else { " [toolchain missing]" };
        println!("  {:<15} {} ({}){}", lang.id, lang.name, lang_type, status);
    }
    Ok(())
}

fn show_config(config: &Config) {
    println!("Execution:");
    println!("  Timeout: {}s", config.execution.timeout_secs);
    println!("  Kill grace: {}ms", config.execution.kill_grace_ms);
    println!("  Chunk size: {} bytes", config.execution.chunk_size);
    println!("  Temp dir: {}", config.temp_dir.display());
    println!();
    println!("Shell:");
    println!(
        "  Program: {}",
        config.shell.program.as_deref().unwrap_or("$SHELL")
    );
    println!("  Size: {}x{}", config.shell.cols, config.shell.rows);
    println!();
    println!("Server bind: {}", config.server.bind);
    println!();
    println!("Languages configured: {}", config.languages.len());
}

async fn init_config(output: &Path, force: bool) -> Result<()> {
    if output.exists() && !force {
        anyhow::bail!(
            "Configuration file already exists at '{}'. Use --force to overwrite.",
            output.display()
        );
    }

    tokio::fs::write(output, EXAMPLE_CONFIG)
        .await
        .context("failed to write configuration file")?;

    println!("Created configuration file at '{}'", output.display());
    Ok(())
}

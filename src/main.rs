//! PipeRunner CLI Entry Point
//!
//! Provides the command-line interface for running pipelines and the entry
//! point of the sandbox worker.
//!
//! # Usage
//!
//! ```bash
//! # Run a manifest on the local backend
//! piperunner run pipeline.yaml
//!
//! # Run inside a sandbox
//! piperunner run pipeline.yaml --backend remote
//!
//! # Check a manifest without running it
//! piperunner validate pipeline.yaml
//!
//! # List the registered step implementations
//! piperunner steps
//!
//! # Serve the worker protocol on stdin/stdout (started by the engine)
//! piperunner worker --sandbox /tmp/sandbox --heartbeat-ms 1000
//! ```

use std::env;
use std::io;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use colored::Colorize;
use log::{error, info};

use piperunner::config::EngineConfig;
use piperunner::execution::BackendKind;
use piperunner::remote::SandboxWorker;
use piperunner::{load_manifest, RunCoordinator, RunStatus, StepRegistry, StepStatus};
use piperunner::{APP_NAME, VERSION};

/// Default manifest file used when none is specified.
const DEFAULT_MANIFEST: &str = "pipeline.yaml";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Run,
    Validate,
    Steps,
    Worker,
}

/// Command-line configuration parsed from arguments.
#[derive(Debug)]
struct Config {
    command: Command,
    manifest_path: String,
    config_path: Option<PathBuf>,
    backend: Option<BackendKind>,
    working_dir: Option<PathBuf>,
    timeout_secs: Option<u64>,
    sandbox_root: Option<PathBuf>,
    heartbeat_ms: u64,
    verbose: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            command: Command::Run,
            manifest_path: DEFAULT_MANIFEST.to_string(),
            config_path: None,
            backend: None,
            working_dir: None,
            timeout_secs: None,
            sandbox_root: None,
            heartbeat_ms: 1000,
            verbose: false,
        }
    }
}

/// Configures the logging system with appropriate formatting.
///
/// Output goes to stderr, which keeps stdout free for the worker protocol.
fn setup_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format(|buf, record| {
            use std::io::Write;

            match record.level() {
                log::Level::Warn | log::Level::Error => {
                    writeln!(buf, "[{}] {}", record.level(), record.args())
                }
                _ => writeln!(buf, "{}", record.args()),
            }
        })
        .init();
}

/// Prints the application banner with version information.
fn print_banner() {
    println!();
    println!("{} v{}", APP_NAME, VERSION);
    println!("Pipeline Execution Engine");
    println!();
}

/// Prints usage information.
fn print_usage() {
    println!("Usage: piperunner <COMMAND> [OPTIONS] [MANIFEST_FILE]");
    println!();
    println!("Commands:");
    println!("  run [MANIFEST]        Run a manifest (default: {})", DEFAULT_MANIFEST);
    println!("  validate [MANIFEST]   Check a manifest without running it");
    println!("  steps                 List registered step implementations");
    println!("  worker                Serve the sandbox worker protocol on stdin/stdout");
    println!();
    println!("Options:");
    println!("  --backend KIND        local or remote (overrides the config file)");
    println!("  --config PATH         Engine configuration YAML file");
    println!("  --working-dir PATH    Directory that receives runs/<run_id>/");
    println!("  --timeout SECS        Run timeout in seconds (0 disables)");
    println!("  --sandbox PATH        Sandbox root (worker only)");
    println!("  --heartbeat-ms N      Heartbeat interval (worker only)");
    println!("  --verbose             Enable debug logging");
    println!("  --help                Show this help message");
    println!("  --version             Show version information");
    println!();
    println!("Examples:");
    println!("  piperunner run pipeline.yaml");
    println!("  piperunner run pipeline.yaml --backend remote --timeout 600");
    println!("  piperunner validate pipeline.yaml --config engine.yaml");
}

fn option_value<'a>(args: &'a [String], i: &mut usize, flag: &str) -> Result<&'a str, String> {
    *i += 1;
    args.get(*i)
        .map(String::as_str)
        .ok_or_else(|| format!("{} requires an argument", flag))
}

/// Parses command-line arguments into a Config struct.
fn parse_arguments(args: &[String]) -> Result<Config, String> {
    let mut config = Config::default();
    let mut positional_index = 0;
    let mut i = 1; // Skip program name

    while i < args.len() {
        let arg = &args[i];

        match arg.as_str() {
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("{} {}", APP_NAME, VERSION);
                std::process::exit(0);
            }
            "--verbose" | "-v" => {
                config.verbose = true;
            }
            "--backend" => {
                let value = option_value(args, &mut i, "--backend")?;
                config.backend = Some(value.parse()?);
            }
            "--config" => {
                config.config_path = Some(PathBuf::from(option_value(args, &mut i, "--config")?));
            }
            "--working-dir" => {
                let value = option_value(args, &mut i, "--working-dir")?;
                config.working_dir = Some(PathBuf::from(value));
            }
            "--timeout" => {
                let value = option_value(args, &mut i, "--timeout")?;
                config.timeout_secs = Some(
                    value
                        .parse()
                        .map_err(|_| format!("Invalid timeout value: {}", value))?,
                );
            }
            "--sandbox" => {
                let value = option_value(args, &mut i, "--sandbox")?;
                config.sandbox_root = Some(PathBuf::from(value));
            }
            "--heartbeat-ms" => {
                let value = option_value(args, &mut i, "--heartbeat-ms")?;
                config.heartbeat_ms = value
                    .parse()
                    .map_err(|_| format!("Invalid heartbeat value: {}", value))?;
            }
            arg if arg.starts_with('-') => {
                return Err(format!("Unknown option: {}", arg));
            }
            _ => {
                match positional_index {
                    0 => {
                        config.command = match arg.as_str() {
                            "run" => Command::Run,
                            "validate" => Command::Validate,
                            "steps" => Command::Steps,
                            "worker" => Command::Worker,
                            other => return Err(format!("Unknown command: {}", other)),
                        }
                    }
                    1 => config.manifest_path = arg.clone(),
                    _ => return Err(format!("Unexpected argument: {}", arg)),
                }
                positional_index += 1;
            }
        }
        i += 1;
    }

    if positional_index == 0 {
        return Err("Missing command".to_string());
    }

    Ok(config)
}

/// Loads the engine configuration and applies command-line overrides.
fn engine_config(config: &Config) -> Result<EngineConfig, Box<dyn std::error::Error>> {
    let mut engine = match &config.config_path {
        Some(path) => {
            info!("Loading configuration: {}", path.display());
            EngineConfig::load(path)?
        }
        None => EngineConfig::from_env()?,
    };

    if let Some(backend) = config.backend {
        engine.backend = backend;
    }
    if let Some(secs) = config.timeout_secs {
        engine.run_timeout_secs = secs;
    }
    if let Some(dir) = &config.working_dir {
        if !dir.is_dir() {
            return Err(format!("Working directory does not exist: {}", dir.display()).into());
        }
        engine.working_dir = dir.clone();
    }
    engine.validate()?;

    info!("Working directory: {}", engine.working_dir.display());
    Ok(engine)
}

fn print_status(status: &RunStatus) {
    println!();
    for record in &status.steps {
        let symbol = match record.status {
            StepStatus::Succeeded => "✓".green(),
            StepStatus::Failed => "✗".red(),
            StepStatus::Running => "…".yellow(),
            StepStatus::Pending => "-".dimmed(),
        };
        let rows = record
            .row_count
            .map(|n| format!("{} rows", n))
            .unwrap_or_default();
        let duration = record
            .duration_ms
            .map(|ms| format!("({:.1}s)", ms as f64 / 1000.0))
            .unwrap_or_default();
        println!(
            "  {} {} {} {}",
            symbol,
            record.step_id,
            rows,
            duration.dimmed()
        );
        if let Some(err) = &record.error {
            println!("      {} [{}] {}", "Error:".red(), err.category, err.message);
        }
    }
    println!();

    let headline = format!("Run {} {}", status.run_id, status.status);
    if status.is_success() {
        println!("{}", headline.green().bold());
    } else {
        println!("{}", headline.red().bold());
        if let Some(failure) = &status.failure {
            println!("  {}", failure);
        }
    }
    println!("  {} artifacts in {}ms", status.artifacts.len(), status.duration_ms);
}

fn run_manifest(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let engine = engine_config(config)?;

    info!("Loading manifest: {}", config.manifest_path);
    let manifest = load_manifest(&config.manifest_path).map_err(|e| {
        error!("Failed to load manifest: {}", e);
        format!("Could not load manifest from '{}': {}", config.manifest_path, e)
    })?;
    info!(
        "Manifest loaded: {} steps, {} implementations",
        manifest.len(),
        manifest.implementations().len()
    );

    let coordinator = RunCoordinator::new(engine, StepRegistry::with_builtins());
    let status = coordinator.run(&manifest)?;
    print_status(&status);

    if status.is_success() {
        Ok(())
    } else {
        Err(format!("Run {} failed", status.run_id).into())
    }
}

fn validate(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let engine = engine_config(config)?;
    let manifest = load_manifest(&config.manifest_path)?;
    let coordinator = RunCoordinator::new(engine, StepRegistry::with_builtins());

    let mut healthy = true;
    for (step_id, report) in coordinator.validate(&manifest)? {
        healthy &= report.healthy;
        let symbol = if report.healthy { "✓".green() } else { "✗".red() };
        println!("  {} {} ({})", symbol, step_id, report.implementation);
        for check in report.checks.iter().filter(|c| !c.passed) {
            println!("      {} {}", check.name.red(), check.detail.as_deref().unwrap_or(""));
        }
    }

    if healthy {
        println!("\n{}", "Manifest is valid".green());
        Ok(())
    } else {
        Err("Manifest has invalid step configuration".into())
    }
}

fn list_steps() {
    for descriptor in StepRegistry::with_builtins().descriptors() {
        println!("{}  {}", descriptor.implementation.bold(), descriptor.summary);
        for field in &descriptor.config_fields {
            let required = if field.required { "required" } else { "optional" };
            println!(
                "    {:<12} {:<8} {:<9} {}",
                field.name, field.kind, required, field.description
            );
        }
    }
}

/// Worker mode: stdout carries protocol frames only.
fn serve_worker(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let root = config
        .sandbox_root
        .clone()
        .ok_or("worker requires --sandbox PATH")?;
    info!("Worker {} serving sandbox {}", std::process::id(), root.display());

    SandboxWorker::new(&root, StepRegistry::with_builtins())
        .with_heartbeat_interval(Duration::from_millis(config.heartbeat_ms))
        .serve(io::stdin(), io::stdout())?;
    Ok(())
}

/// Main application entry point.
fn run() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().collect();

    let config = parse_arguments(&args).map_err(|e| {
        eprintln!("Error: {}", e);
        eprintln!();
        print_usage();
        e
    })?;

    setup_logging(config.verbose);

    match config.command {
        Command::Worker => serve_worker(&config),
        Command::Steps => {
            list_steps();
            Ok(())
        }
        Command::Validate => {
            print_banner();
            validate(&config)
        }
        Command::Run => {
            print_banner();
            run_manifest(&config)
        }
    }
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!();
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

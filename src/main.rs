//! Stackyard CLI entrypoint.
//!
//! Exit codes: 0 on success, 1 when a run fails at execution time, 2 when
//! the declarations cannot be planned.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use stackyard::backend::{HttpBackend, LocalBackend, ProvisioningBackend};
use stackyard::cli::{Cli, Commands, OutputFormat, OutputFormatter, StateCommands};
use stackyard::config::{
    BackendKind, ConfigParser, ConfigValidator, StackyardConfig, StateBackend, find_config_file,
};
use stackyard::error::{ConfigError, Result, StackyardError};
use stackyard::orchestrator::Orchestrator;
use stackyard::state::{LocalStateStore, RecordStatus, S3StateStore, STATE_DIR, StateStore};

use clap::Parser;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// Exit code for failures detected before any backend call.
const EXIT_PLAN_ERROR: u8 = 2;

/// Main entrypoint.
fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize logging
    init_logging(cli.verbose, cli.log_json);

    // Run async runtime
    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to create async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e}");
            if e.is_plan_time() {
                ExitCode::from(EXIT_PLAN_ERROR)
            } else {
                ExitCode::FAILURE
            }
        }
    }
}

/// Initializes the logging system. Logs go to stderr; stdout carries output.
fn init_logging(verbose: bool, json: bool) {
    let level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Main async entry point.
async fn run(cli: Cli) -> Result<ExitCode> {
    let formatter = OutputFormatter::new(cli.output);
    let overrides = RunOverrides {
        concurrency: cli.concurrency,
        timeout: cli.timeout,
    };

    match cli.command {
        Commands::Init { path, force } => cmd_init(&path, force),
        Commands::Validate { warnings } => cmd_validate(cli.config.as_ref(), warnings, &formatter),
        Commands::Diff { stacks } => {
            cmd_diff(cli.config.as_ref(), &stacks, overrides, &formatter).await
        }
        Commands::Deploy { stacks, yes } => {
            cmd_deploy(cli.config.as_ref(), &stacks, yes, overrides, &formatter).await
        }
        Commands::Destroy { stacks, yes } => {
            cmd_destroy(cli.config.as_ref(), &stacks, yes, overrides, &formatter).await
        }
        Commands::State { command } => cmd_state(cli.config.as_ref(), command, &formatter).await,
    }
}

/// Command-line overrides of run settings.
#[derive(Debug, Clone, Copy)]
struct RunOverrides {
    concurrency: Option<usize>,
    timeout: Option<u64>,
}

/// Initialize a new project.
fn cmd_init(path: &Path, force: bool) -> Result<ExitCode> {
    info!("Initializing new Stackyard project in: {}", path.display());

    let config_path = path.join("stackyard.yaml");
    let env_path = path.join(".env.example");
    let gitignore_path = path.join(".gitignore");

    if !force && config_path.exists() {
        eprintln!("Configuration file already exists: {}", config_path.display());
        eprintln!("Use --force to overwrite.");
        return Ok(ExitCode::SUCCESS);
    }

    if !path.exists() {
        std::fs::create_dir_all(path)?;
    }

    std::fs::write(&config_path, include_str!("../templates/stackyard.yaml"))?;
    eprintln!("Created: {}", config_path.display());

    std::fs::write(&env_path, include_str!("../templates/.env.example"))?;
    eprintln!("Created: {}", env_path.display());

    let state_entry = format!("{STATE_DIR}/");
    if gitignore_path.exists() {
        let existing = std::fs::read_to_string(&gitignore_path)?;
        if !existing.contains(".env") || !existing.contains(STATE_DIR) {
            let mut file = std::fs::OpenOptions::new()
                .append(true)
                .open(&gitignore_path)?;
            writeln!(file, "\n# Stackyard")?;
            if !existing.contains(".env") {
                writeln!(file, ".env")?;
            }
            if !existing.contains(STATE_DIR) {
                writeln!(file, "{state_entry}")?;
            }
            eprintln!("Updated: {}", gitignore_path.display());
        }
    } else {
        std::fs::write(&gitignore_path, format!(".env\n{state_entry}\n"))?;
        eprintln!("Created: {}", gitignore_path.display());
    }

    eprintln!("\nProject initialized successfully!");
    eprintln!("Next steps:");
    eprintln!("  1. Edit stackyard.yaml with your stacks");
    eprintln!("  2. Run 'stackyard validate' to check your declarations");
    eprintln!("  3. Run 'stackyard diff' to see the deployment plan");
    eprintln!("  4. Run 'stackyard deploy' to deploy in dependency order");

    Ok(ExitCode::SUCCESS)
}

/// Validate configuration.
fn cmd_validate(
    config_path: Option<&PathBuf>,
    show_warnings: bool,
    formatter: &OutputFormatter,
) -> Result<ExitCode> {
    let config_file = resolve_config_path(config_path)?;
    info!("Validating configuration: {}", config_file.display());

    let parser = parser_for(&config_file);
    parser.load_dotenv()?;
    let config = parser.load_with_env(&config_file)?;

    let result = ConfigValidator::new().check(&config);
    formatter.print(&formatter.format_validation(&config, &result, show_warnings));

    if result.is_valid() {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::from(EXIT_PLAN_ERROR))
    }
}

/// Show the plan annotated with pending changes.
async fn cmd_diff(
    config_path: Option<&PathBuf>,
    stacks: &[String],
    overrides: RunOverrides,
    formatter: &OutputFormatter,
) -> Result<ExitCode> {
    let orchestrator = build_orchestrator(config_path, overrides).await?;
    let diff = orchestrator.diff(stacks).await?;
    formatter.print(&formatter.format_diff(&diff));
    Ok(ExitCode::SUCCESS)
}

/// Deploy stacks.
async fn cmd_deploy(
    config_path: Option<&PathBuf>,
    stacks: &[String],
    auto_approve: bool,
    overrides: RunOverrides,
    formatter: &OutputFormatter,
) -> Result<ExitCode> {
    let orchestrator = build_orchestrator(config_path, overrides).await?;

    let diff = orchestrator.diff(stacks).await?;

    // Prompt only when something would change.
    if !auto_approve && diff.has_changes() {
        eprintln!("{}", OutputFormatter::new(OutputFormat::Text).format_diff(&diff));
        if !confirm("Do you want to deploy these stacks? [y/N]: ", |input| {
            input.eq_ignore_ascii_case("y")
        })? {
            eprintln!("Deploy cancelled.");
            return Ok(ExitCode::SUCCESS);
        }
    }

    watch_ctrl_c(&orchestrator);
    let report = orchestrator.deploy(stacks).await?;
    formatter.print(&formatter.format_report(&report));

    Ok(if report.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/// Destroy stacks.
async fn cmd_destroy(
    config_path: Option<&PathBuf>,
    stacks: &[String],
    auto_approve: bool,
    overrides: RunOverrides,
    formatter: &OutputFormatter,
) -> Result<ExitCode> {
    let orchestrator = build_orchestrator(config_path, overrides).await?;
    let plan = orchestrator.destroy_plan(stacks).await?;

    if plan.is_empty() {
        eprintln!("No stacks to destroy.");
        return Ok(ExitCode::SUCCESS);
    }

    if !auto_approve {
        eprintln!("{plan}");
        if !confirm(
            "This action is IRREVERSIBLE. Type 'destroy' to confirm: ",
            |input| input == "destroy",
        )? {
            eprintln!("Destruction cancelled.");
            return Ok(ExitCode::SUCCESS);
        }
    }

    watch_ctrl_c(&orchestrator);
    let report = orchestrator.destroy(stacks).await?;
    formatter.print(&formatter.format_report(&report));

    Ok(if report.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/// State management commands.
async fn cmd_state(
    config_path: Option<&PathBuf>,
    command: StateCommands,
    formatter: &OutputFormatter,
) -> Result<ExitCode> {
    let (config, config_file) = load_config(config_path)?;
    let store = build_state_store(&config, &config_file).await?;

    match command {
        StateCommands::Show => {
            let records = store.list().await?;
            let lock = store.get_lock_info().await?;
            formatter.print(&formatter.format_records(&records, lock.as_ref()));
        }
        StateCommands::Unlock { lock_id, force } => {
            if force {
                if let Some(lock_info) = store.get_lock_info().await? {
                    store.release_lock(&lock_info.lock_id).await?;
                    eprintln!("State forcefully unlocked.");
                } else {
                    eprintln!("State is not locked.");
                }
            } else if let Some(id) = lock_id {
                store.release_lock(&id).await?;
                eprintln!("State unlocked.");
            } else {
                eprintln!("Please provide --lock-id or use --force");
            }
        }
        StateCommands::Prune => {
            let mut pruned = 0usize;
            for record in store.list().await? {
                if record.status == RecordStatus::Destroyed {
                    store.delete(&record.stack_id).await?;
                    debug!(stack = %record.stack_id, "Pruned record");
                    pruned += 1;
                }
            }
            eprintln!("Pruned {pruned} destroyed record(s).");
        }
    }

    Ok(ExitCode::SUCCESS)
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Resolves the configuration file path.
fn resolve_config_path(config_path: Option<&PathBuf>) -> Result<PathBuf> {
    config_path.map_or_else(|| find_config_file("."), |path| Ok(path.clone()))
}

/// Directory containing the configuration file.
fn config_dir(config_file: &Path) -> &Path {
    config_file
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
}

fn parser_for(config_file: &Path) -> ConfigParser {
    ConfigParser::new().with_base_path(config_dir(config_file))
}

/// Loads and validates the configuration.
fn load_config(config_path: Option<&PathBuf>) -> Result<(StackyardConfig, PathBuf)> {
    let config_file = resolve_config_path(config_path)?;
    debug!("Loading configuration from: {}", config_file.display());

    let parser = parser_for(&config_file);
    parser.load_dotenv()?;
    let config = parser.load_with_env(&config_file)?;

    let result = ConfigValidator::new().validate(&config)?;
    for warning in &result.warnings {
        warn!("{warning}");
    }

    Ok((config, config_file))
}

/// Creates the state store selected by the configuration.
async fn build_state_store(
    config: &StackyardConfig,
    config_file: &Path,
) -> Result<Arc<dyn StateStore>> {
    let store: Arc<dyn StateStore> = match config.state.backend {
        StateBackend::Local => {
            let path = config.state.path.as_ref().map_or_else(
                || config_dir(config_file).join(STATE_DIR),
                PathBuf::from,
            );
            Arc::new(LocalStateStore::with_base_dir(path))
        }
        StateBackend::S3 => {
            let bucket = config
                .state
                .bucket
                .as_deref()
                .ok_or_else(|| {
                    StackyardError::from(ConfigError::validation(
                        "S3 bucket not configured",
                        "state.bucket",
                    ))
                })?;
            let prefix = config.state.prefix.as_deref();
            let region = config.state.region.as_deref();
            Arc::new(S3StateStore::new(bucket, prefix, region).await?)
        }
    };
    Ok(store)
}

/// Creates the provisioning backend selected by the configuration.
fn build_backend(config: &StackyardConfig) -> Result<Arc<dyn ProvisioningBackend>> {
    let backend: Arc<dyn ProvisioningBackend> = match config.backend.kind {
        BackendKind::Local => Arc::new(LocalBackend::new()),
        BackendKind::Http => {
            let endpoint = config
                .backend
                .endpoint
                .as_deref()
                .ok_or_else(|| {
                    StackyardError::from(ConfigError::validation(
                        "Backend endpoint not configured",
                        "backend.endpoint",
                    ))
                })?;
            Arc::new(HttpBackend::with_timeout(
                endpoint,
                ConfigParser::get_backend_token(),
                config.backend.timeout_secs,
            )?)
        }
    };
    Ok(backend)
}

async fn build_orchestrator(
    config_path: Option<&PathBuf>,
    overrides: RunOverrides,
) -> Result<Orchestrator> {
    let (config, config_file) = load_config(config_path)?;
    let store = build_state_store(&config, &config_file).await?;
    let backend = build_backend(&config)?;

    let max_concurrency = overrides.concurrency.or(config.run.max_concurrency);
    let timeout = overrides
        .timeout
        .or(config.run.timeout_secs)
        .map(Duration::from_secs);

    Ok(Orchestrator::new(config, backend, store)
        .with_max_concurrency(max_concurrency)
        .with_timeout(timeout))
}

/// Cancels the run on Ctrl-C. In-flight stacks finish; later batches do not start.
fn watch_ctrl_c(orchestrator: &Orchestrator) {
    let signal = orchestrator.signal().clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            signal.cancel("interrupted");
        }
    });
}

/// Prompts on stderr and reads one line from stdin.
fn confirm(prompt: &str, accept: impl Fn(&str) -> bool) -> Result<bool> {
    eprint!("{prompt}");
    std::io::stderr().flush()?;

    let mut input = String::new();
    std::io::stdin().read_line(&mut input)?;
    Ok(accept(input.trim()))
}

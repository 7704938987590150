//! Kestrel CLI entrypoint.
//!
//! This is the main entrypoint for the kestrel command-line tool.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use kestrel::cli::{Cli, Commands, MessageLevel, OutputFormat, OutputFormatter, StateCommands};
use kestrel::config::{find_config_file, ConfigParser, ConfigValidator, KestrelConfig};
use kestrel::error::{Result, StateError};
use kestrel::planner::DependencyGraph;
use kestrel::provider::create_provider;
use kestrel::reconciler::Reconciler;
use kestrel::resource::{ClusterBlueprint, DescriptorValidator};
use kestrel::state::{LocalStateStore, StateStore, STATE_DIR};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// Main entrypoint.
fn main() -> ExitCode {
    let cli = Cli::parse_args();

    init_logging(cli.verbose, cli.log_format);

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to create async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Initializes the logging system. `RUST_LOG` wins unless `--verbose` is set.
fn init_logging(verbose: bool, format: OutputFormat) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);

    match format {
        OutputFormat::Json => builder.json().init(),
        OutputFormat::Text => builder.init(),
    }
}

/// Main async entry point. `Ok(false)` means the command ran but did not
/// fully succeed.
async fn run(cli: Cli) -> Result<bool> {
    let formatter = OutputFormatter::new(cli.output);
    let config_path = cli.config.as_deref();

    match cli.command {
        Commands::Init { path, force } => cmd_init(&path, force),
        Commands::Validate { warnings } => cmd_validate(config_path, warnings, &formatter),
        Commands::Plan { detailed } => cmd_plan(config_path, detailed, &formatter).await,
        Commands::Apply { yes } => cmd_apply(config_path, yes, &formatter).await,
        Commands::Destroy { yes } => cmd_destroy(config_path, yes, &formatter).await,
        Commands::Status { refresh } => cmd_status(config_path, refresh, &formatter).await,
        Commands::State { command } => cmd_state(config_path, command, &formatter).await,
    }
}

/// Initialize a new project.
fn cmd_init(path: &Path, force: bool) -> Result<bool> {
    info!("Initializing new Kestrel project in: {}", path.display());

    let config_path = path.join("kestrel.yaml");
    let env_path = path.join(".env.example");
    let gitignore_path = path.join(".gitignore");

    if !force && config_path.exists() {
        eprintln!("Configuration file already exists: {}", config_path.display());
        eprintln!("Use --force to overwrite.");
        return Ok(false);
    }

    if !path.exists() {
        std::fs::create_dir_all(path)?;
    }

    std::fs::write(&config_path, include_str!("../templates/kestrel.yaml"))?;
    eprintln!("Created: {}", config_path.display());

    std::fs::write(&env_path, include_str!("../templates/.env.example"))?;
    eprintln!("Created: {}", env_path.display());

    let state_entry = format!("{STATE_DIR}/");
    if gitignore_path.exists() {
        let existing = std::fs::read_to_string(&gitignore_path)?;
        if !existing.contains(".env") || !existing.contains(STATE_DIR) {
            let mut file = std::fs::OpenOptions::new().append(true).open(&gitignore_path)?;
            writeln!(file, "\n# Kestrel")?;
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
    eprintln!("  1. Edit kestrel.yaml with your resource group and SSH key");
    eprintln!("  2. Run 'kestrel validate' to check your configuration");
    eprintln!("  3. Run 'kestrel plan' to see what will be provisioned");
    eprintln!("  4. Run 'kestrel apply' to provision the cluster");

    Ok(true)
}

/// Validate configuration and the resource graph it expands to.
fn cmd_validate(config_path: Option<&Path>, show_warnings: bool, formatter: &OutputFormatter) -> Result<bool> {
    let (config, _) = load_config(config_path)?;

    let result = ConfigValidator::new().validate(&config)?;
    let descriptors = ClusterBlueprint::new(&config.cluster).descriptors();
    DescriptorValidator::new().validate(&descriptors)?;
    let graph = DependencyGraph::build(&descriptors)?;

    println!("{}", formatter.format_validation(&result, graph.len(), show_warnings));
    Ok(true)
}

/// Show the plan.
async fn cmd_plan(config_path: Option<&Path>, detailed: bool, formatter: &OutputFormatter) -> Result<bool> {
    let (config, store) = load_config_and_state(config_path)?;
    let provider = create_provider(&config.provider, ConfigParser::provider_token())?;

    let plan = Reconciler::new(&config, &store, provider).plan().await?;

    println!("{}", formatter.format_plan(&plan, detailed));
    Ok(true)
}

/// Apply the plan.
async fn cmd_apply(config_path: Option<&Path>, auto_approve: bool, formatter: &OutputFormatter) -> Result<bool> {
    let (config, store) = load_config_and_state(config_path)?;
    let provider = create_provider(&config.provider, ConfigParser::provider_token())?;
    let cancel = cancel_on_interrupt();

    let reconciler = Reconciler::new(&config, &store, provider).with_cancellation(cancel);

    let plan = reconciler.plan().await?;
    if !plan.has_changes() {
        eprintln!("{}", formatter.message(MessageLevel::Success, "No changes to apply."));
        return Ok(true);
    }

    if !auto_approve {
        eprintln!("{}", formatter.format_plan(&plan, false));
        if !confirm("Do you want to apply this plan?")? {
            eprintln!("Apply cancelled.");
            return Ok(false);
        }
    }

    let report = reconciler.apply().await?;
    println!("{}", formatter.format_report(&report));

    Ok(report.is_success())
}

/// Destroy every managed resource.
async fn cmd_destroy(config_path: Option<&Path>, auto_approve: bool, formatter: &OutputFormatter) -> Result<bool> {
    let (config, store) = load_config_and_state(config_path)?;

    let count = store.load().await?.map_or(0, |s| s.len());
    if count == 0 {
        eprintln!("{}", formatter.message(MessageLevel::Success, "Nothing to destroy."));
        return Ok(true);
    }

    if !auto_approve
        && !confirm(&format!(
            "This will delete {count} resources of {}. Continue?",
            config.cluster.resource_group
        ))?
    {
        eprintln!("Destroy cancelled.");
        return Ok(false);
    }

    let provider = create_provider(&config.provider, ConfigParser::provider_token())?;
    let reconciler = Reconciler::new(&config, &store, provider).with_cancellation(cancel_on_interrupt());

    let report = reconciler.destroy().await?;
    println!("{}", formatter.format_report(&report));

    Ok(report.is_success())
}

/// Show applied resources against the configuration.
async fn cmd_status(config_path: Option<&Path>, refresh: bool, formatter: &OutputFormatter) -> Result<bool> {
    let (config, store) = load_config_and_state(config_path)?;
    let provider = create_provider(&config.provider, ConfigParser::provider_token())?;

    let status = Reconciler::new(&config, &store, provider).status(refresh).await?;

    println!("{}", formatter.format_status(&status));
    Ok(true)
}

/// State management commands.
async fn cmd_state(config_path: Option<&Path>, command: StateCommands, formatter: &OutputFormatter) -> Result<bool> {
    let (config, store) = load_config_and_state(config_path)?;

    match command {
        StateCommands::Show => {
            if let Some(state) = store.load().await? {
                println!("{}", formatter.format_state(&state));
            } else {
                eprintln!("No state found at {}.", store.state_path().display());
            }
        }
        StateCommands::Unlock { lock_id, force } => {
            let Some(lock) = store.get_lock_info().await? else {
                eprintln!("{}", formatter.message(MessageLevel::Success, "State is not locked."));
                return Ok(true);
            };

            if let Some(id) = &lock_id
                && *id != lock.lock_id
            {
                return Err(StateError::LockFailed {
                    message: format!("current lock is {}, not {id}", lock.lock_id),
                }
                .into());
            }

            if !lock.is_expired() && !force && lock_id.is_none() {
                eprintln!("{}", OutputFormatter::describe_lock(&lock));
                eprintln!("Pass --lock-id {} or --force to release it.", lock.lock_id);
                return Ok(false);
            }

            store.release_lock(&lock.lock_id).await?;
            eprintln!("{}", formatter.message(MessageLevel::Success, "State unlocked."));
        }
        StateCommands::Rm { name } => {
            let provider = create_provider(&config.provider, ConfigParser::provider_token())?;
            let removed = Reconciler::new(&config, &store, provider).forget(&name).await?;
            eprintln!(
                "{}",
                formatter.message(
                    MessageLevel::Success,
                    &format!("Removed {} {} from state; it still exists upstream.", removed.kind, removed.name)
                )
            );
        }
    }

    Ok(true)
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Resolves the configuration file path.
fn resolve_config_path(config_path: Option<&Path>) -> Result<PathBuf> {
    config_path.map_or_else(|| find_config_file("."), |path| Ok(path.to_path_buf()))
}

/// Loads the configuration; returns it with the directory it lives in.
fn load_config(config_path: Option<&Path>) -> Result<(KestrelConfig, PathBuf)> {
    let config_file = resolve_config_path(config_path)?;
    debug!("Loading configuration from: {}", config_file.display());

    let base = config_file
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map_or_else(|| PathBuf::from("."), Path::to_path_buf);

    let parser = ConfigParser::new().with_base_path(&base);
    parser.load_dotenv()?;
    let config = parser.load(&config_file)?;

    Ok((config, base))
}

/// Loads configuration and opens the state store it points at.
fn load_config_and_state(config_path: Option<&Path>) -> Result<(KestrelConfig, LocalStateStore)> {
    let (config, base) = load_config(config_path)?;

    let state_dir = config
        .state
        .path
        .as_deref()
        .map_or_else(|| base.join(STATE_DIR), |p| base.join(p));
    debug!("Using state directory: {}", state_dir.display());

    Ok((config, LocalStateStore::with_base_dir(state_dir)))
}

/// Returns a token that is cancelled on Ctrl-C.
fn cancel_on_interrupt() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received; waiting for in-flight operations to finish");
            trigger.cancel();
        }
    });

    token
}

/// Asks a yes/no question on stderr.
fn confirm(prompt: &str) -> Result<bool> {
    eprint!("{prompt} [y/N]: ");
    std::io::stderr().flush()?;

    let mut input = String::new();
    std::io::stdin().read_line(&mut input)?;

    Ok(input.trim().eq_ignore_ascii_case("y"))
}

//! SnipSync command-line tool.
//!
//! Scaffolds and validates configuration, edits the local collection, runs
//! one sync cycle against the configured repository, and shows sync status,
//! persisted conflicts and the audit log.

mod prompt;
mod style;

use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use comfy_table::{presets::UTF8_FULL, Cell, ContentArrangement, Table};
use indicatif::{ProgressBar, ProgressStyle};
use tracing_subscriber::EnvFilter;

use snipsync_core::config::{AppConfig, DEFAULT_CONFIG_TEMPLATE};
use snipsync_core::db::{ConflictStatus, Database};
use snipsync_core::decision::{DecisionChannel, EmptyLocalChoice, Preset};
use snipsync_core::errors::StorageError;
use snipsync_core::git::GitClient;
use snipsync_core::models::{ancestor_paths, normalize_path, Artifact, Directory, Snippet};
use snipsync_core::storage::{snapshot, ArtifactStore};
use snipsync_core::sync_engine::{SyncOrchestrator, SyncOutcome};

use crate::prompt::InteractiveDecisions;

// ---------------------------------------------------------------------------
// CLI argument definitions
// ---------------------------------------------------------------------------

/// Synchronize a snippet collection through a git repository.
#[derive(Parser, Debug)]
#[command(name = "snipsync", version, about = "Synchronize snippets through a git repository")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log at the configured level instead of warnings only.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Generate a default configuration file.
    Init,

    /// Validate the configuration file.
    Validate,

    /// Show current synchronization status.
    Status,

    /// Run one sync cycle.
    Sync(SyncArgs),

    /// List persisted conflicts.
    Conflicts {
        /// Filter by status: pending, resolved, abandoned.
        #[arg(short, long)]
        status: Option<String>,

        /// Number of results.
        #[arg(long, default_value = "20")]
        limit: u32,
    },

    /// Show recent audit log entries.
    Audit {
        /// Maximum number of entries to show.
        #[arg(short, long, default_value = "20")]
        limit: u32,
    },

    /// List the artifacts in local storage.
    List,

    /// Add or replace a snippet in local storage.
    Add {
        /// Snippet path, e.g. /work/hello.
        path: String,

        /// Read the body from this file instead of stdin.
        #[arg(short, long)]
        file: Option<PathBuf>,

        #[arg(short, long, default_value = "text")]
        language: String,
    },

    /// Create a directory in local storage.
    Mkdir {
        path: String,
    },

    /// Remove a snippet or an empty directory from local storage.
    Remove {
        path: String,
    },
}

#[derive(Args, Debug)]
struct SyncArgs {
    /// If local storage is empty, replace it with the repository collection.
    #[arg(long, conflicts_with = "force_overwrite")]
    yes_pull: bool,

    /// If local storage is empty, publish the empty collection.
    #[arg(long)]
    force_overwrite: bool,

    /// Never prompt; undecided conflicts leave the cycle pending.
    #[arg(long)]
    non_interactive: bool,
}

impl SyncArgs {
    fn empty_local_choice(&self) -> Option<EmptyLocalChoice> {
        if self.yes_pull {
            Some(EmptyLocalChoice::PullRemote)
        } else if self.force_overwrite {
            Some(EmptyLocalChoice::ForceOverwrite)
        } else {
            None
        }
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let config_path = cli.config.clone().unwrap_or_else(default_config_path);
    init_logging(cli.verbose, &config_path);

    match run(cli.command, &config_path).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

/// `RUST_LOG` wins; otherwise warnings only, or the configured level with
/// `--verbose`.
fn init_logging(verbose: bool, config_path: &Path) {
    let level = if verbose {
        AppConfig::load_from_file(config_path)
            .map(|c| c.general.log_level)
            .unwrap_or_else(|_| "debug".to_string())
    } else {
        "warn".to_string()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .without_time()
        .init();
}

async fn run(command: Commands, config_path: &Path) -> Result<()> {
    match command {
        Commands::Init => cmd_init(config_path),
        Commands::Validate => cmd_validate(config_path),
        command => {
            let config = load_config(config_path)?;
            let db = open_database(&config)?;

            match command {
                Commands::Status => cmd_status(&db, &config),
                Commands::Sync(args) => cmd_sync(db, &config, args).await,
                Commands::Conflicts { status, limit } => cmd_conflicts(&db, status.as_deref(), limit),
                Commands::Audit { limit } => cmd_audit(&db, limit),
                Commands::List => cmd_list(&db),
                Commands::Add {
                    path,
                    file,
                    language,
                } => cmd_add(&db, &path, file.as_deref(), &language),
                Commands::Mkdir { path } => cmd_mkdir(&db, &path),
                Commands::Remove { path } => cmd_remove(&db, &path),
                Commands::Init | Commands::Validate => Ok(()),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Config helpers
// ---------------------------------------------------------------------------

fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("snipsync")
        .join("config.toml")
}

fn load_config(path: &Path) -> Result<AppConfig> {
    AppConfig::load_and_resolve(path)
        .with_context(|| format!("failed to load configuration from {}", path.display()))
}

fn open_database(config: &AppConfig) -> Result<Arc<Database>> {
    let db = Database::open_initialized(config.database_path()).context("failed to open database")?;
    Ok(Arc::new(db))
}

// ---------------------------------------------------------------------------
// Configuration commands
// ---------------------------------------------------------------------------

fn cmd_init(output: &Path) -> Result<()> {
    if output.exists() {
        anyhow::bail!(
            "file already exists: {}. Use a different path or remove the existing file.",
            output.display()
        );
    }
    if let Some(parent) = output.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).context("failed to create config directory")?;
        }
    }
    std::fs::write(output, DEFAULT_CONFIG_TEMPLATE).context("failed to write config file")?;

    println!("{}", style::success(&format!("Default configuration written to {}", output.display())));
    println!();
    println!("Next steps:");
    println!("  1. Set repository.remote_url to your snippets repository");
    println!("  2. Export the variable named by repository.token_env if the remote needs a token");
    println!("  3. Validate with: snipsync validate --config {}", output.display());
    println!("  4. Run a first sync: snipsync sync --config {}", output.display());
    Ok(())
}

fn cmd_validate(config_path: &Path) -> Result<()> {
    println!("Validating configuration: {}", config_path.display());
    println!();

    let mut config = AppConfig::load_from_file(config_path).context("failed to parse configuration")?;
    println!("  {}", style::success("TOML structure is valid"));

    config
        .resolve_env_vars()
        .context("failed to resolve environment variables")?;
    println!("  {}", style::success("Environment variable references processed"));

    if let Err(e) = config.validate() {
        println!("  {}", style::error(&format!("Validation error: {e}")));
        anyhow::bail!("configuration validation failed");
    }
    println!("  {}", style::success("All required fields are valid"));

    println!();
    println!("Configuration summary:");
    println!("  Remote        : {}", config.repository.remote_url);
    println!("  Branch        : {}/{}", config.repository.remote_name, config.repository.branch);
    println!(
        "  Token         : {}",
        match (&config.repository.token_env, &config.repository.token) {
            (None, _) => "not configured",
            (Some(_), Some(_)) => "set",
            (Some(_), None) => "NOT SET",
        }
    );
    println!("  Working tree  : {}", config.repo_path().display());
    println!("  Format        : {}", config.repository.format);
    println!("  Merge strategy: {}", config.sync.merge_strategy);
    println!("  Database      : {}", config.database_path().display());
    println!();
    println!("Configuration is valid.");
    Ok(())
}

// ---------------------------------------------------------------------------
// Sync commands
// ---------------------------------------------------------------------------

fn cmd_status(db: &Database, config: &AppConfig) -> Result<()> {
    let status = db.sync_status().context("failed to read sync status")?;

    println!();
    println!("{}", style::header("SnipSync Status"));
    println!();
    println!(
        "  State            : {}",
        if status.is_syncing {
            style::status_syncing()
        } else {
            style::status_idle()
        }
    );
    println!("  Last step        : {}", status.state);
    println!(
        "  Last sync at     : {}",
        status
            .last_sync_at
            .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
            .unwrap_or_else(|| "never".to_string())
    );
    println!(
        "  Remote reachable : {}",
        if status.is_connected { "yes" } else { "no" }
    );
    println!("  Pending conflicts: {}", status.pending_conflicts);
    println!("  Remote           : {}", config.repository.remote_url);
    if let Some(ref err) = status.last_error {
        println!();
        println!("{}", style::warn(&format!("Last cycle: {err}")));
    }
    println!();
    Ok(())
}

async fn cmd_sync(db: Arc<Database>, config: &AppConfig, args: SyncArgs) -> Result<()> {
    let client = GitClient::open_or_init(
        config.repo_path(),
        Some(&config.repository.remote_url),
        config.git_settings(),
    )
    .context("failed to open git working tree")?;

    let spinner = ProgressBar::new_spinner();
    spinner.set_style(
        ProgressStyle::with_template("{spinner:.blue} {msg}")
            .context("invalid spinner template")?
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
    );

    let empty_local = args.empty_local_choice();
    let decisions: Arc<dyn DecisionChannel> = if args.non_interactive || !console::user_attended() {
        Arc::new(Preset {
            empty_local,
            ..Default::default()
        })
    } else {
        Arc::new(InteractiveDecisions::new(spinner.clone(), empty_local))
    };

    let store: Arc<dyn ArtifactStore> = db.clone();
    let mut orchestrator = SyncOrchestrator::from_config(config, db, Box::new(client), store, decisions);

    spinner.set_message(format!("Syncing with {}", config.repository.remote_url));
    spinner.enable_steady_tick(Duration::from_millis(100));
    let outcome = orchestrator.run_cycle().await;
    spinner.finish_and_clear();
    let outcome = outcome.context("sync cycle could not start")?;

    match &outcome {
        SyncOutcome::Success { message, .. } => {
            println!("{}", style::success(&format!("Sync complete: {message}")));
            Ok(())
        }
        SyncOutcome::Pending { reason, paths } => {
            println!("{}", style::warn(reason));
            print_paths(paths);
            Ok(())
        }
        SyncOutcome::Cancelled => {
            println!("{}", style::dim("Sync cancelled; nothing was changed."));
            Ok(())
        }
        SyncOutcome::Failed { .. } => {
            println!("{}", style::error(&outcome.message()));
            print_paths(outcome.paths());
            anyhow::bail!("sync failed")
        }
    }
}

fn print_paths(paths: &[String]) {
    for path in paths {
        println!("    {path}");
    }
}

fn cmd_conflicts(db: &Database, status: Option<&str>, limit: u32) -> Result<()> {
    let status = status
        .map(|s| {
            ConflictStatus::from_str_val(s).ok_or_else(|| {
                anyhow::anyhow!("invalid status '{}': use pending, resolved or abandoned", s)
            })
        })
        .transpose()?;
    let conflicts = db
        .list_conflicts(status, limit)
        .context("failed to list conflicts")?;

    if conflicts.is_empty() {
        println!();
        println!("{}", style::success("No conflicts found"));
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec!["ID", "Path", "Type", "Status", "Detected", "Reason"]);

    for c in &conflicts {
        let id_short = if c.id.len() > 8 { &c.id[..8] } else { &c.id };
        table.add_row(vec![
            Cell::new(id_short),
            Cell::new(&c.full_path),
            Cell::new(&c.conflict_type),
            Cell::new(&c.status),
            Cell::new(&c.detected_at[..19.min(c.detected_at.len())]),
            Cell::new(style::truncate(&c.reason, 40)),
        ]);
    }

    println!("{table}");
    println!("{} conflict(s) shown", conflicts.len());
    Ok(())
}

fn cmd_audit(db: &Database, limit: u32) -> Result<()> {
    let entries = db
        .list_audit_log(limit)
        .context("failed to list audit entries")?;

    if entries.is_empty() {
        println!("No audit log entries found.");
        return Ok(());
    }

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec!["Timestamp", "Action", "", "Details"]);

    for entry in &entries {
        table.add_row(vec![
            Cell::new(&entry.created_at[..19.min(entry.created_at.len())]),
            Cell::new(&entry.action),
            Cell::new(if entry.success { "ok" } else { "failed" }),
            Cell::new(style::truncate(entry.details.as_deref().unwrap_or(""), 60)),
        ]);
    }

    println!("{table}");
    println!("{} entries shown", entries.len());
    Ok(())
}

// ---------------------------------------------------------------------------
// Local collection commands
// ---------------------------------------------------------------------------

fn cmd_list(db: &Database) -> Result<()> {
    let artifacts = snapshot(db).context("failed to read local storage")?;
    if artifacts.is_empty() {
        println!("Local collection is empty.");
        return Ok(());
    }

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec!["Path", "Kind", "Language", "Lines"]);

    for artifact in &artifacts {
        let (language, lines) = match artifact {
            Artifact::Snippet(s) => (s.language.clone(), s.body.lines().count().to_string()),
            Artifact::Directory(_) => (String::new(), String::new()),
        };
        table.add_row(vec![
            Cell::new(artifact.full_path()),
            Cell::new(artifact.kind()),
            Cell::new(language),
            Cell::new(lines),
        ]);
    }

    println!("{table}");
    println!("{} artifact(s)", artifacts.len());
    Ok(())
}

fn cmd_add(db: &Database, path: &str, file: Option<&Path>, language: &str) -> Result<()> {
    let body = match file {
        Some(file) => std::fs::read_to_string(file)
            .with_context(|| format!("failed to read {}", file.display()))?,
        None => {
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .context("failed to read snippet body from stdin")?;
            buf
        }
    };

    let snippet = Snippet::new(path, body, language);
    create_ancestors(db, &snippet.full_path)?;
    match db.save_snippet(&snippet) {
        Ok(()) => println!("{}", style::success(&format!("Added {}", snippet.full_path))),
        Err(StorageError::AlreadyExists(_)) => {
            db.update_snippet(&snippet)
                .with_context(|| format!("failed to update {}", snippet.full_path))?;
            println!("{}", style::success(&format!("Updated {}", snippet.full_path)));
        }
        Err(e) => return Err(e).with_context(|| format!("failed to add {}", snippet.full_path)),
    }
    Ok(())
}

fn cmd_mkdir(db: &Database, path: &str) -> Result<()> {
    let full_path = normalize_path(path);
    create_ancestors(db, &full_path)?;
    create_directory(db, &full_path)?;
    println!("{}", style::success(&format!("Created {full_path}")));
    Ok(())
}

fn cmd_remove(db: &Database, path: &str) -> Result<()> {
    let full_path = normalize_path(path);
    let children = snapshot(db)
        .context("failed to read local storage")?
        .iter()
        .filter(|a| a.full_path().starts_with(&format!("{full_path}/")))
        .count();
    if children > 0 {
        anyhow::bail!("{} is not empty ({} artifacts inside)", full_path, children);
    }

    match db.delete_snippet(&full_path) {
        Ok(()) => {}
        Err(StorageError::NotFound(_)) => db
            .delete_directory(&full_path)
            .with_context(|| format!("failed to remove {full_path}"))?,
        Err(e) => return Err(e).with_context(|| format!("failed to remove {full_path}")),
    }
    println!("{}", style::success(&format!("Removed {full_path}")));
    Ok(())
}

fn create_ancestors(db: &Database, full_path: &str) -> Result<()> {
    for ancestor in ancestor_paths(full_path) {
        create_directory(db, &ancestor)?;
    }
    Ok(())
}

/// Create a directory; an existing one is fine.
fn create_directory(db: &Database, full_path: &str) -> Result<()> {
    match db.create_directory(&Directory::new(full_path)) {
        Ok(()) | Err(StorageError::AlreadyExists(_)) => Ok(()),
        Err(e) => Err(e).with_context(|| format!("failed to create {full_path}")),
    }
}

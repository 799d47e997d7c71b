//! SnapSync CLI - Command line interface for folder backups.
//!
//! This tool manages the backup configuration, runs backup batches, lists
//! and prunes snapshots, and mirrors changed snapshots to Google Drive.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::collections::BTreeSet;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use snapsync_common::{Error, Label, SnapshotName};
use snapsync_remote::gdrive::{AuthConfig, AuthManager, DriveCredentials};
use snapsync_remote::{DriveConfig, DriveMirror};
use snapsync_storage::{BackupLock, SnapshotStore};
use snapsync_sync::{
    BackupConfig, BackupPolicy, BackupScheduler, BatchReport, FolderOutcome, MirrorPublisher,
    MirrorReport, PruneOrder, RunHistory, RunRecord, RunStatus, ScheduleMode, SyncEngine,
};

/// Credentials file kept next to the config file.
const CREDENTIALS_FILE: &str = "google_credentials.json";

#[derive(Parser)]
#[command(name = "snapsync")]
#[command(about = "SnapSync - Versioned folder backups with Google Drive mirroring")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file (default: platform config dir).
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a new configuration file.
    Init {
        /// Directory that will hold the snapshots.
        #[arg(short, long)]
        backup_base: PathBuf,

        /// Folder to protect (repeatable).
        #[arg(short, long = "source")]
        sources: Vec<PathBuf>,

        /// Google Drive folder id snapshots are mirrored under.
        #[arg(long)]
        parent_id: Option<String>,

        /// Mirror changed snapshots after each run.
        #[arg(long)]
        upload: bool,

        /// Policy: single_rolling, multi_versioned or most_recent.
        #[arg(long, default_value = "multi_versioned")]
        policy: BackupPolicy,

        /// Snapshots kept per folder.
        #[arg(long, default_value_t = 5)]
        max_retained: usize,

        /// Delete old snapshots before creating the new one.
        #[arg(long)]
        prune_first: bool,

        /// Overwrite an existing configuration.
        #[arg(long)]
        force: bool,
    },

    /// Add a folder to protect.
    AddSource {
        /// Folder path.
        folder: PathBuf,
    },

    /// Stop protecting a folder (existing snapshots are kept).
    RemoveSource {
        /// Folder path.
        folder: PathBuf,
    },

    /// Run one backup batch.
    Run {
        /// Override the configured policy.
        #[arg(long)]
        policy: Option<BackupPolicy>,

        /// Override the configured retention.
        #[arg(long)]
        max_retained: Option<usize>,

        /// Skip the Google Drive upload even when enabled.
        #[arg(long)]
        no_upload: bool,
    },

    /// List snapshots under the backup folder.
    List {
        /// Only show snapshots for this label or folder name.
        #[arg(short, long)]
        label: Option<String>,
    },

    /// Apply retention to one label now.
    Prune {
        /// Label or folder name.
        #[arg(short, long)]
        label: String,

        /// Snapshots to keep.
        #[arg(short, long)]
        keep: usize,
    },

    /// Run backups periodically until interrupted.
    Watch {
        /// Seconds between runs.
        #[arg(short, long, default_value_t = 3600)]
        interval: u64,
    },

    /// Show configuration and the last run.
    Status,

    /// Authorize Google Drive access.
    Auth {
        /// OAuth2 client id (reuses the stored one when omitted).
        #[arg(long)]
        client_id: Option<String>,

        /// OAuth2 client secret (reuses the stored one when omitted).
        #[arg(long)]
        client_secret: Option<String>,

        /// Print the URL instead of opening a browser.
        #[arg(long)]
        no_browser: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config_path = match cli.config {
        Some(path) => path,
        None => BackupConfig::default_path()?,
    };

    match cli.command {
        Commands::Init {
            backup_base,
            sources,
            parent_id,
            upload,
            policy,
            max_retained,
            prune_first,
            force,
        } => {
            let mut config = BackupConfig::new(backup_base);
            for source in sources {
                config.add_source(source);
            }
            config.google_parent_id = parent_id.unwrap_or_default();
            config.upload_enabled = upload;
            config.policy = policy;
            config.max_retained = max_retained;
            if prune_first {
                config.prune_order = PruneOrder::BeforeCreate;
            }
            cmd_init(&config_path, config, force)
        }

        Commands::AddSource { folder } => cmd_add_source(&config_path, &folder),

        Commands::RemoveSource { folder } => cmd_remove_source(&config_path, &folder),

        Commands::Run {
            policy,
            max_retained,
            no_upload,
        } => cmd_run(&config_path, policy, max_retained, !no_upload).await,

        Commands::List { label } => cmd_list(&config_path, label.as_deref()),

        Commands::Prune { label, keep } => cmd_prune(&config_path, &label, keep),

        Commands::Watch { interval } => cmd_watch(&config_path, interval).await,

        Commands::Status => cmd_status(&config_path),

        Commands::Auth {
            client_id,
            client_secret,
            no_browser,
        } => cmd_auth(&config_path, client_id, client_secret, no_browser).await,
    }
}

fn load_config(path: &Path) -> Result<BackupConfig> {
    BackupConfig::load(path).with_context(|| {
        format!(
            "Failed to load config {} (run `snapsync init` first)",
            path.display()
        )
    })
}

fn credentials_path(config_path: &Path) -> PathBuf {
    config_path.with_file_name(CREDENTIALS_FILE)
}

/// Write a new configuration.
fn cmd_init(config_path: &Path, config: BackupConfig, force: bool) -> Result<()> {
    if config_path.exists() && !force {
        anyhow::bail!(
            "Config already exists at {} (use --force to overwrite)",
            config_path.display()
        );
    }

    std::fs::create_dir_all(&config.backup_base).with_context(|| {
        format!(
            "Failed to create backup folder {}",
            config.backup_base.display()
        )
    })?;

    config.save(config_path).context("Failed to save config")?;

    println!("Configuration written to {}", config_path.display());
    if let Err(e) = config.validate() {
        println!("  Note: {}", e);
    }

    Ok(())
}

/// Add a source folder.
fn cmd_add_source(config_path: &Path, folder: &Path) -> Result<()> {
    let mut config = load_config(config_path)?;

    if !folder.is_dir() {
        warn!("{} is not a directory right now", folder.display());
    }

    if config.add_source(folder) {
        config.save(config_path).context("Failed to save config")?;
        println!(
            "Added {} (label: {})",
            folder.display(),
            Label::from_path(folder)
        );
    } else {
        println!("{} is already configured", folder.display());
    }

    Ok(())
}

/// Remove a source folder.
fn cmd_remove_source(config_path: &Path, folder: &Path) -> Result<()> {
    let mut config = load_config(config_path)?;

    if !config.remove_source(folder) {
        anyhow::bail!("{} is not a configured source folder", folder.display());
    }

    config.save(config_path).context("Failed to save config")?;
    println!("Removed {}", folder.display());

    Ok(())
}

/// Run one backup batch, mirror it if enabled, and record it in the history.
async fn backup_once(
    config: BackupConfig,
    config_path: &Path,
    upload: bool,
) -> snapsync_common::Result<RunRecord> {
    let history_path = RunHistory::path_for(config_path);

    let engine_config = config.clone();
    let batch = tokio::task::spawn_blocking(move || SyncEngine::new().run(&engine_config))
        .await
        .map_err(|e| Error::Io(io::Error::other(e)))?;

    let batch = match batch {
        Ok(batch) => batch,
        Err(e) => {
            save_history(&history_path, RunRecord::failed(&e));
            return Err(e);
        }
    };
    print_batch(&batch);

    let mirror = if upload && config.upload_enabled && batch.changed().next().is_some() {
        Some(mirror_to_drive(&batch, &config, &credentials_path(config_path)).await)
    } else {
        None
    };

    let record = RunRecord::from_reports(&batch, mirror.as_ref());
    save_history(&history_path, record.clone());
    Ok(record)
}

async fn mirror_to_drive(
    batch: &BatchReport,
    config: &BackupConfig,
    credentials: &Path,
) -> MirrorReport {
    let mirror = match DriveMirror::new(DriveConfig {
        credentials_path: credentials.to_path_buf(),
    }) {
        Ok(mirror) => mirror,
        Err(e) => {
            warn!("Google Drive upload skipped: {}", e);
            return MirrorReport {
                failures: vec![(credentials.to_path_buf(), e.to_string())],
                ..Default::default()
            };
        }
    };

    let publisher = MirrorPublisher::new(Arc::new(mirror), config.google_parent_id.clone());
    let report = publisher.mirror_batch(batch, config).await;

    for upload in &report.uploaded {
        println!(
            "  uploaded  {} ({} files, {} bytes)",
            upload.snapshot, upload.summary.files, upload.summary.bytes
        );
    }
    for name in &report.pruned {
        println!("  pruned    {} (remote)", name);
    }
    report
}

fn save_history(path: &Path, record: RunRecord) {
    let mut history = match RunHistory::load(path) {
        Ok(history) => history,
        Err(e) => {
            warn!("Starting a new run history: {}", e);
            RunHistory::default()
        }
    };
    history.record(record);
    if let Err(e) = history.save(path) {
        warn!("Failed to save run history: {}", e);
    }
}

fn print_batch(batch: &BatchReport) {
    for folder in &batch.folders {
        match &folder.outcome {
            FolderOutcome::Created { snapshot, .. } => {
                println!("  created   {}", snapshot.path().display())
            }
            FolderOutcome::Synced { snapshot, stats } => println!(
                "  synced    {} ({} files written)",
                snapshot.path().display(),
                stats.files_written
            ),
            FolderOutcome::Skipped { latest } => {
                println!("  unchanged {} (latest {})", folder.source.display(), latest.name())
            }
            FolderOutcome::Failed { reason } => {
                println!("  failed    {}: {}", folder.source.display(), reason)
            }
        }
    }
}

/// Run one batch.
async fn cmd_run(
    config_path: &Path,
    policy: Option<BackupPolicy>,
    max_retained: Option<usize>,
    upload: bool,
) -> Result<()> {
    let mut config = load_config(config_path)?;
    if let Some(policy) = policy {
        config.policy = policy;
    }
    if let Some(max_retained) = max_retained {
        config.max_retained = max_retained;
    }

    info!("Status: Backing up...");
    let record = backup_once(config, config_path, upload)
        .await
        .context("Backup failed")?;

    match record.status {
        RunStatus::Succeeded if record.changed.is_empty() => println!("Nothing changed."),
        RunStatus::Succeeded => println!("Backup complete: {} snapshot(s) changed.", record.changed.len()),
        RunStatus::Partial => {
            println!("Backup finished with problems:");
            for error in &record.errors {
                println!("  - {}", error);
            }
        }
        RunStatus::Failed => {
            anyhow::bail!("Backup failed: {}", record.errors.join("; "));
        }
    }

    Ok(())
}

/// List snapshots, grouped by label.
fn cmd_list(config_path: &Path, label: Option<&str>) -> Result<()> {
    let config = load_config(config_path)?;
    let root = &config.backup_base;

    let labels: BTreeSet<Label> = match label {
        Some(label) => BTreeSet::from([Label::sanitize(label)]),
        None => std::fs::read_dir(root)
            .with_context(|| format!("Failed to read {}", root.display()))?
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.file_name().to_str().and_then(SnapshotName::parse))
            .map(|name| name.label().clone())
            .collect(),
    };

    if labels.is_empty() {
        println!("No snapshots in {}.", root.display());
        return Ok(());
    }

    for label in labels {
        let snapshots = SnapshotStore::new(root, label.clone())
            .list_snapshots()
            .with_context(|| format!("Failed to list snapshots for {}", label))?;

        println!("{} ({} snapshots):", label, snapshots.len());
        for snapshot in snapshots {
            println!(
                "  {}  {}",
                snapshot.name().timestamp().format("%Y-%m-%d %H:%M:%S"),
                snapshot.path().display()
            );
        }
    }

    Ok(())
}

/// Apply retention to one label.
fn cmd_prune(config_path: &Path, label: &str, keep: usize) -> Result<()> {
    let config = load_config(config_path)?;
    let root = &config.backup_base;
    let label = Label::sanitize(label);

    let _lock = BackupLock::acquire(root).context("Failed to lock backup folder")?;
    let report = SnapshotStore::new(root, label.clone())
        .enforce_retention(keep)
        .context("Failed to apply retention")?;

    for snapshot in &report.removed {
        println!("  deleted {}", snapshot.name());
    }
    for (snapshot, reason) in &report.failures {
        println!("  could not delete {}: {}", snapshot.name(), reason);
    }
    println!("{}: {} kept, {} deleted.", label, report.kept, report.removed.len());

    if !report.is_clean() {
        anyhow::bail!("Some snapshots could not be deleted");
    }
    Ok(())
}

/// Run periodically until Ctrl-C.
async fn cmd_watch(config_path: &Path, interval: u64) -> Result<()> {
    if interval == 0 {
        anyhow::bail!("Interval must be at least one second");
    }
    load_config(config_path)?.validate()?;

    let (scheduler, handle) = BackupScheduler::new(ScheduleMode::Periodic {
        interval: Duration::from_secs(interval),
    });

    let path = config_path.to_path_buf();
    let worker = tokio::spawn(handle.run(move |trigger| {
        let path = path.clone();
        async move {
            info!("Starting {:?} backup", trigger);
            // Reload so edits made while watching apply to the next run.
            let config = BackupConfig::load(&path)?;
            backup_once(config, &path, true).await
        }
    }));

    println!("Watching; backing up every {} seconds. Press Ctrl-C to stop.", interval);
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    println!("Stopping after the current run...");
    scheduler.shutdown().await;
    worker.await.context("Scheduler task failed")?;

    Ok(())
}

/// Show configuration and history.
fn cmd_status(config_path: &Path) -> Result<()> {
    let config = load_config(config_path)?;

    println!("Configuration: {}", config_path.display());
    println!("  Backup folder: {}", config.backup_base.display());
    println!("  Policy: {} (keep {})", config.policy, config.effective_retention());
    println!("  Sources:");
    for source in &config.source_folders {
        let state = if source.is_dir() { "" } else { " (missing)" };
        println!(
            "    {} -> {}{}",
            source.display(),
            Label::from_path(source),
            state
        );
    }

    if config.upload_enabled {
        let credentials = credentials_path(config_path);
        let authorized = DriveCredentials::load(&credentials)
            .map(|c| c.tokens.is_some())
            .unwrap_or(false);
        println!(
            "  Upload: Google Drive folder {} ({})",
            config.google_parent_id,
            if authorized { "authorized" } else { "not authorized; run `snapsync auth`" }
        );
    } else {
        println!("  Upload: disabled");
    }

    if let Err(e) = config.validate() {
        println!("  Problem: {}", e);
    }

    let history = RunHistory::load(&RunHistory::path_for(config_path))
        .context("Failed to read run history")?;
    match history.last() {
        Some(run) => {
            println!(
                "Last run: {} ({:?}, {} changed, {} uploaded)",
                run.finished_at.format("%Y-%m-%d %H:%M:%S"),
                run.status,
                run.changed.len(),
                run.uploaded
            );
            for error in &run.errors {
                println!("  - {}", error);
            }
        }
        None => println!("Last run: never"),
    }
    if let Some(run) = history.last_success() {
        println!("Last Backup: {}", run.finished_at.format("%Y-%m-%d %H:%M:%S"));
    }

    Ok(())
}

/// Authorize Google Drive access and store the tokens.
async fn cmd_auth(
    config_path: &Path,
    client_id: Option<String>,
    client_secret: Option<String>,
    no_browser: bool,
) -> Result<()> {
    let path = credentials_path(config_path);
    let stored = DriveCredentials::load(&path).ok().map(|c| c.auth);

    let auth = match (client_id, client_secret, stored) {
        (Some(id), Some(secret), _) => AuthConfig::new(id, secret),
        (None, None, Some(stored)) => stored,
        (Some(id), None, Some(stored)) => AuthConfig::new(id, stored.client_secret),
        (None, Some(secret), Some(stored)) => AuthConfig::new(stored.client_id, secret),
        _ => anyhow::bail!("No stored client credentials; pass --client-id and --client-secret"),
    };

    let manager = AuthManager::new(auth.clone()).context("Invalid OAuth2 configuration")?;
    let (url, _csrf) = manager.authorization_url();

    println!("Open this URL to authorize SnapSync:\n\n  {}\n", url);
    if !no_browser {
        if let Err(e) = open::that(&url) {
            warn!("Could not open a browser: {}", e);
        }
    }

    print!("Paste the code (or the full redirect URL): ");
    io::stdout().flush()?;
    let mut input = String::new();
    io::stdin()
        .lock()
        .read_line(&mut input)
        .context("Failed to read authorization code")?;

    let code = AuthManager::code_from_input(&input)?;
    let tokens = manager
        .exchange_code(&code)
        .await
        .context("Failed to exchange authorization code")?;

    DriveCredentials {
        auth,
        tokens: Some(tokens),
    }
    .save(&path)
    .context("Failed to save credentials")?;

    println!("Authorized. Credentials saved to {}", path.display());
    Ok(())
}

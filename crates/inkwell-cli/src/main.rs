use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use inkwell_common::telemetry::{self, TelemetryConfig};
use inkwell_common::{Config, ConfigFile, FileStore, KvStore};
use inkwell_sync::transport::{MASTER_KEY_KEY, TOKEN_KEY};
use inkwell_sync::{
    CipherEnvelope, Clock, CycleOutcome, EngineOptions, HttpNotesApi, MasterKeyEnvelope,
    NetworkStatus, PullOutcome, SyncEngine, SystemClock, WriteOutcome,
};
use miette::{IntoDiagnostic, Result};
use smol_str::SmolStr;
use tracing::{info, warn};

type Engine = SyncEngine<HttpNotesApi, FileStore>;

#[derive(Parser)]
#[command(version, about = "Inkwell - offline-first sync for encrypted notes", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Path to the JSON config file
    #[arg(long, env = "INKWELL_CONFIG")]
    config: Option<PathBuf>,

    /// Override the data directory from the config
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Log at debug level
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Store the bearer token and master key used for sync
    Login {
        #[arg(long, env = "INKWELL_TOKEN", hide_env_values = true)]
        token: String,

        /// Base64 AES key (16 or 32 bytes)
        #[arg(long, env = "INKWELL_MASTER_KEY", hide_env_values = true)]
        master_key: String,
    },
    /// Forget the stored token and master key
    Logout,
    /// Show queue depth, dead letters and the pull watermark
    Status,
    /// List local notes
    List,
    /// Create a note
    New { title: String, text: String },
    /// Delete notes by id
    Delete {
        #[arg(required = true)]
        ids: Vec<String>,
    },
    /// Drain the outbox once
    Sync,
    /// Merge remote changes into the local vault
    Pull {
        /// Ignore the watermark and fetch everything
        #[arg(long)]
        full: bool,
    },
    /// Inspect or recover dead-lettered operations
    DeadLetters {
        #[command(subcommand)]
        action: DeadLetterAction,
    },
    /// Run the outbox worker and background pull until interrupted
    Run {
        /// Print sync counters in Prometheus text format on exit
        #[arg(long)]
        metrics: bool,
    },
}

#[derive(Subcommand)]
enum DeadLetterAction {
    List,
    /// Move every dead letter back onto the outbox with a fresh retry budget
    Requeue,
    Clear,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_miette();

    let cli = Cli::parse();

    let mut telemetry_config = TelemetryConfig::from_env("inkwell");
    if cli.verbose {
        telemetry_config = telemetry_config.with_level(tracing::Level::DEBUG);
    }
    telemetry::init(telemetry_config);

    let mut config = load_config(cli.config).await?;
    if let Some(dir) = cli.data_dir {
        config.data_dir = dir;
    }
    let store = FileStore::new(&config.data_dir);

    match cli.command {
        Commands::Login { token, master_key } => login(&config, store, token, master_key).await,
        Commands::Logout => {
            store.remove_item(TOKEN_KEY).await?;
            store.remove_item(MASTER_KEY_KEY).await?;
            println!("✓ Logged out");
            Ok(())
        }
        Commands::Status => status(&build_engine(&config, store)?).await,
        Commands::List => list(&build_engine(&config, store)?).await,
        Commands::New { title, text } => {
            let engine = build_engine(&config, store)?;
            let (note, outcome) = engine.create_note(title, text).await?;
            println!("{} {}", note.id, describe(&outcome));
            Ok(())
        }
        Commands::Delete { ids } => {
            let engine = build_engine(&config, store)?;
            let ids: Vec<SmolStr> = ids.into_iter().map(SmolStr::from).collect();
            let outcome = engine.delete_notes(&ids).await?;
            println!("Deleted {} note(s), {}", ids.len(), describe(&outcome));
            Ok(())
        }
        Commands::Sync => sync(&build_engine(&config, store)?).await,
        Commands::Pull { full } => pull(&build_engine(&config, store)?, full).await,
        Commands::DeadLetters { action } => {
            dead_letters(&build_engine(&config, store)?, action).await
        }
        Commands::Run { metrics } => run(build_engine(&config, store)?, metrics).await,
    }
}

async fn load_config(path: Option<PathBuf>) -> Result<Config> {
    let path = path.or_else(default_config_path);
    let config = match path {
        Some(path) if tokio::fs::try_exists(&path).await.unwrap_or(false) => {
            info!(path = %path.display(), "loading config");
            Config::load(&ConfigFile::new(&path)).await?
        }
        _ => Config::default(),
    };
    Ok(config.with_env()?)
}

fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("inkwell").join("config.json"))
}

fn build_engine(config: &Config, store: FileStore) -> Result<Engine> {
    let api = HttpNotesApi::from_config(config)?;
    let envelope: Arc<dyn CipherEnvelope> = Arc::new(MasterKeyEnvelope::new());
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    Ok(SyncEngine::new(
        api,
        store,
        envelope,
        NetworkStatus::online(),
        clock,
        EngineOptions::from(config),
    ))
}

async fn login(config: &Config, store: FileStore, token: String, master_key: String) -> Result<()> {
    // reject bad key material before it is written anywhere
    MasterKeyEnvelope::new().import_key(&master_key)?;
    store.set_item(TOKEN_KEY, token).await?;
    store
        .set_item(MASTER_KEY_KEY, master_key.trim().to_owned())
        .await?;
    println!("✓ Credentials saved to {}", store.dir().display());

    // notes written while logged out never left the vault
    let engine = build_engine(config, store)?;
    if let Some(outcome) = engine.upload_all().await? {
        println!("✓ Local notes {}", describe(&outcome));
    }
    Ok(())
}

async fn status(engine: &Engine) -> Result<()> {
    let queued = engine.outbox().get_all().await?;
    let dead = engine.outbox().dead_letters().await?;
    let notes = engine.notes().await?;
    let watermark = engine.pull_sync().watermark().await?;

    println!("Notes:        {}", notes.len());
    println!("Outbox:       {}", queued.len());
    if let Some(next) = queued.iter().map(|op| op.next_at).min() {
        let wait = (next - SystemClock.now_ms()).max(0);
        println!("  next retry in {:.1}s", wait as f64 / 1000.0);
    }
    println!("Dead letters: {}", dead.len());
    println!("Watermark:    {watermark}");
    Ok(())
}

async fn list(engine: &Engine) -> Result<()> {
    let mut notes = engine.notes().await?;
    notes.sort_by_key(|note| std::cmp::Reverse(note.modified_ms()));
    for note in notes {
        let title = match note.title_str() {
            "" => "(untitled)",
            title => title,
        };
        let lock = if note.is_protected() { " [protected]" } else { "" };
        println!("{}  {}{}", note.id, title, lock);
    }
    Ok(())
}

async fn sync(engine: &Engine) -> Result<()> {
    match engine.sync_now().await {
        CycleOutcome::Completed(report) => {
            println!(
                "✓ delivered {}, retrying {}, dead-lettered {}",
                report.delivered, report.retried, report.dead_lettered
            );
            Ok(())
        }
        CycleOutcome::Offline => {
            println!("⚠ offline, nothing sent");
            Ok(())
        }
        CycleOutcome::AlreadySyncing => {
            println!("⚠ a sync is already running");
            Ok(())
        }
        CycleOutcome::Failed { report, message } => Err(miette::miette!(
            "sync failed after delivering {}: {message}",
            report.delivered
        )),
    }
}

async fn pull(engine: &Engine, full: bool) -> Result<()> {
    let outcome = if full {
        engine.full_resync().await?
    } else {
        engine.pull().await?
    };
    match outcome {
        PullOutcome::Pulled(report) => {
            println!(
                "✓ fetched {}: {} new, {} updated, {} removed",
                report.fetched,
                report.inserted.len(),
                report.updated.len(),
                report.removed.len()
            );
            if !report.skipped.is_empty() {
                println!(
                    "⚠ {} note(s) could not be decrypted; check the master key",
                    report.skipped.len()
                );
            }
        }
        PullOutcome::Paused => println!("⚠ pull is paused"),
    }
    Ok(())
}

async fn dead_letters(engine: &Engine, action: DeadLetterAction) -> Result<()> {
    let outbox = engine.outbox();
    match action {
        DeadLetterAction::List => {
            for op in outbox.dead_letters().await? {
                println!("{}  {:?}  attempts={}", op.op_id, op.kind, op.attempt);
            }
        }
        DeadLetterAction::Requeue => {
            let count = outbox.requeue_dead_letters(SystemClock.now_ms()).await?;
            println!("✓ Requeued {count} op(s)");
        }
        DeadLetterAction::Clear => {
            outbox.clear_dead_letters().await?;
            println!("✓ Dead letters cleared");
        }
    }
    Ok(())
}

async fn run(engine: Engine, print_metrics: bool) -> Result<()> {
    let handles = engine.start();
    info!("sync running, press ctrl-c to stop");
    if let Err(e) = tokio::signal::ctrl_c().await.into_diagnostic() {
        warn!(error = %e, "could not listen for ctrl-c, stopping");
    }
    handles.shutdown().await;
    info!("sync stopped");
    if print_metrics {
        print!("{}", telemetry::render());
    }
    Ok(())
}

fn describe(outcome: &WriteOutcome) -> &'static str {
    match outcome {
        WriteOutcome::Delivered(_) => "delivered",
        WriteOutcome::Queued { .. } => "queued for sync",
    }
}

fn init_miette() {
    miette::set_hook(Box::new(|_| {
        Box::new(
            miette::MietteHandlerOpts::new()
                .terminal_links(true)
                .with_cause_chain()
                .color(true)
                .context_lines(5)
                .tab_width(2)
                .break_words(true)
                .build(),
        )
    }))
    .ok();
}

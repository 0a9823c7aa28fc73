use anyhow::{anyhow, Context, Result};
use appvault_agent::catalog::HttpCatalog;
use appvault_agent::engine::{EngineConfig, UpdateEngine, UpdateEvent, UpdateOutcome};
use appvault_agent::launch::LaunchSession;
use appvault_agent::state::LocalState;
use appvault_core::artifact::ArtifactReader;
use appvault_core::paths::{data_dir, StorageLayout};
use appvault_core::registry::ApplicationRecord;
use appvault_core::secure_storage::{
    delete_shared_secret, load_shared_secret, store_shared_secret,
};
use appvault_core::settings::AgentSettings;
use clap::{Parser, Subcommand};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use zeroize::Zeroizing;

#[derive(Parser, Debug)]
#[command(author, version, about = "AppVault encrypted application agent", long_about = None)]
struct Cli {
    /// Override the data directory (also APPVAULT_DATA_DIR)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Manage the shared artifact secret
    Secret {
        #[command(subcommand)]
        action: SecretAction,
    },
    /// Register every application the server lists
    Discover,
    /// Register an application by hand
    Register {
        key: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        entry_point: Option<String>,
        #[arg(long)]
        icon: Option<String>,
    },
    /// Show registered applications and their installed versions
    Status,
    /// Compare the installed version against the server
    Check { key: String },
    /// Download and install updates (all applications when no key is given)
    Sync { key: Option<String> },
    /// Decrypt and run an installed application
    Launch {
        key: String,
        #[arg(last = true)]
        args: Vec<String>,
    },
    /// Seal a local release file and install it
    Import {
        key: String,
        #[arg(long)]
        file: PathBuf,
        #[arg(long)]
        version: String,
    },
    /// Authenticate an installed artifact without running it
    Verify { key: String },
    /// Inspect the error journal
    Journal {
        #[command(subcommand)]
        action: JournalAction,
    },
}

#[derive(Subcommand, Debug)]
enum SecretAction {
    /// Store the secret in the OS keyring
    Set,
    /// Remove the secret from the OS keyring
    Clear,
}

#[derive(Subcommand, Debug)]
enum JournalAction {
    List,
    Clear,
}

struct Agent {
    settings: AgentSettings,
    local: Arc<LocalState>,
}

impl Agent {
    fn open(data_dir_override: Option<PathBuf>) -> Result<Self> {
        let root = match data_dir_override {
            Some(dir) => dir,
            None => data_dir()?,
        };
        let layout = StorageLayout::new(&root);
        let settings = AgentSettings::load(&layout.settings_file())?;
        let local = LocalState::open(layout).context("open data directory")?;
        Ok(Self {
            settings,
            local: Arc::new(local),
        })
    }

    fn catalog(&self) -> Result<HttpCatalog> {
        Ok(HttpCatalog::new(
            &self.settings.server_url,
            Duration::from_secs(self.settings.request_timeout_secs),
        )?)
    }

    fn engine(&self) -> Result<UpdateEngine> {
        let secret = load_shared_secret()?;
        Ok(UpdateEngine::new(
            Arc::new(self.catalog()?),
            self.local.clone(),
            secret,
            EngineConfig::from_settings(&self.settings),
        ))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
    let cli = Cli::parse();
    let command = match cli.command {
        Commands::Secret { action } => return secret_command(action),
        other => other,
    };
    let agent = Agent::open(cli.data_dir)?;
    match command {
        Commands::Secret { action } => secret_command(action),
        Commands::Discover => discover_command(&agent).await,
        Commands::Register {
            key,
            name,
            entry_point,
            icon,
        } => register_command(&agent, key, name, entry_point, icon),
        Commands::Status => status_command(&agent),
        Commands::Check { key } => check_command(&agent, &key).await,
        Commands::Sync { key } => sync_command(&agent, key).await,
        Commands::Launch { key, args } => launch_command(&agent, &key, &args).await,
        Commands::Import { key, file, version } => {
            import_command(&agent, &key, file, &version).await
        }
        Commands::Verify { key } => verify_command(&agent, &key).await,
        Commands::Journal { action } => journal_command(&agent, action),
    }
}

fn secret_command(action: SecretAction) -> Result<()> {
    match action {
        SecretAction::Set => secret_set_command(),
        SecretAction::Clear => {
            delete_shared_secret()?;
            println!("Secret removed from the system keyring");
            Ok(())
        }
    }
}

fn secret_set_command() -> Result<()> {
    let first = Zeroizing::new(rpassword::prompt_password("Shared secret: ")?);
    let second = Zeroizing::new(rpassword::prompt_password("Confirm shared secret: ")?);
    if first != second {
        return Err(anyhow!("secrets did not match"));
    }
    store_shared_secret(&first)?;
    println!("Secret stored in the system keyring");
    Ok(())
}

async fn discover_command(agent: &Agent) -> Result<()> {
    use appvault_agent::catalog::RemoteCatalog;
    let listings = agent.catalog()?.list_apps().await?;
    for listing in listings {
        let display = listing
            .display_name
            .clone()
            .unwrap_or_else(|| listing.key.clone());
        let entry_point = listing.entry_point.trim_end_matches('_').to_string();
        let mut record = ApplicationRecord::new(&listing.key, &display, &entry_point);
        record.icon = listing.icon.clone();
        match agent.local.registry.register(record) {
            Ok(true) => println!("registered {}", listing.key),
            Ok(false) => println!("refreshed {}", listing.key),
            Err(e) => warn!(app = %listing.key, error = %e, "skipping listing"),
        }
    }
    Ok(())
}

fn register_command(
    agent: &Agent,
    key: String,
    name: Option<String>,
    entry_point: Option<String>,
    icon: Option<String>,
) -> Result<()> {
    let name = name.unwrap_or_else(|| key.clone());
    let entry_point = entry_point.unwrap_or_else(|| key.clone());
    let mut record = ApplicationRecord::new(&key, &name, &entry_point);
    record.icon = icon;
    let created = agent.local.registry.register(record)?;
    println!("{} {}", if created { "registered" } else { "updated" }, key);
    Ok(())
}

fn status_command(agent: &Agent) -> Result<()> {
    let status = agent.local.status();
    if status.is_empty() {
        println!("no applications registered");
        return Ok(());
    }
    for app in status {
        println!(
            "{:<24} installed={:<10} remote={:<10} {}",
            app.record.key,
            app.local_version.as_deref().unwrap_or("-"),
            app.record.remote_version.as_deref().unwrap_or("?"),
            if app.installed { "" } else { "(no artifact)" },
        );
    }
    Ok(())
}

async fn check_command(agent: &Agent, key: &str) -> Result<()> {
    let engine = agent.engine()?;
    let report = engine.check(key, &CancellationToken::new()).await?;
    println!(
        "{key}: installed {} remote {}{}",
        report.local.as_deref().unwrap_or("none"),
        report.manifest.version,
        if report.update_available {
            " (update available)"
        } else {
            ""
        }
    );
    Ok(())
}

fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, cancelling");
            trigger.cancel();
        }
    });
    cancel
}

/// Prints a line per application every five percent of progress.
fn progress_printer() -> impl Fn(UpdateEvent) + Send + Sync {
    let last: Mutex<HashMap<String, u64>> = Mutex::new(HashMap::new());
    move |event| match event {
        UpdateEvent::State { app, state } => info!(app = %app, ?state, "state"),
        UpdateEvent::Progress {
            app,
            received,
            total,
        } => {
            if total == 0 {
                return;
            }
            let pct = received.saturating_mul(100) / total;
            let mut last = last.lock();
            let prev = last.entry(app.clone()).or_insert(u64::MAX);
            if *prev == u64::MAX || pct >= prev.saturating_add(5) || (pct == 100 && *prev != 100) {
                *prev = pct;
                println!("{app}: {pct}% ({received}/{total} bytes)");
            }
        }
    }
}

fn print_outcome(key: &str, outcome: &UpdateOutcome) {
    match outcome {
        UpdateOutcome::UpToDate { version } => println!("{key}: up to date ({version})"),
        UpdateOutcome::Updated { from, to } => println!(
            "{key}: updated {} -> {to}",
            from.as_deref().unwrap_or("none")
        ),
    }
}

async fn sync_command(agent: &Agent, key: Option<String>) -> Result<()> {
    let engine = agent.engine()?;
    let cancel = cancel_on_ctrl_c();
    let printer = progress_printer();
    match key {
        Some(key) => {
            let outcome = engine.sync(&key, &printer, &cancel).await?;
            print_outcome(&key, &outcome);
            Ok(())
        }
        None => {
            let results = engine.sync_all(&printer, &cancel).await;
            let mut failed = 0;
            for (key, result) in &results {
                match result {
                    Ok(outcome) => print_outcome(key, outcome),
                    Err(e) => {
                        failed += 1;
                        println!("{key}: failed: {e}");
                    }
                }
            }
            if failed > 0 {
                return Err(anyhow!("{failed} of {} applications failed to sync", results.len()));
            }
            Ok(())
        }
    }
}

async fn launch_command(agent: &Agent, key: &str, args: &[String]) -> Result<()> {
    let session = LaunchSession::new(agent.local.clone(), load_shared_secret()?);
    let handle = session.launch(key, args).await?;
    let cancel = cancel_on_ctrl_c();
    let status = handle.wait_or_cancel(&cancel).await?;
    if !status.success() {
        std::process::exit(status.code().unwrap_or(1));
    }
    Ok(())
}

async fn import_command(agent: &Agent, key: &str, file: PathBuf, version: &str) -> Result<()> {
    if agent.local.registry.get(key).is_none() {
        let entry_point = file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| key.to_string());
        agent
            .local
            .registry
            .register(ApplicationRecord::new(key, key, &entry_point))?;
    }
    let engine = agent.engine()?;
    let cancel = cancel_on_ctrl_c();
    let printer = progress_printer();
    let outcome = engine
        .install_local(key, &file, version, &printer, &cancel)
        .await?;
    print_outcome(key, &outcome);
    Ok(())
}

async fn verify_command(agent: &Agent, key: &str) -> Result<()> {
    let path = agent.local.layout.artifact_path(key)?;
    let secret = load_shared_secret()?;
    let bytes = tokio::task::spawn_blocking(move || ArtifactReader::open(&path)?.verify(&secret))
        .await
        .context("verify task")??;
    println!("{key}: artifact authentic ({bytes} bytes)");
    Ok(())
}

fn journal_command(agent: &Agent, action: JournalAction) -> Result<()> {
    match action {
        JournalAction::List => {
            let groups = agent.local.journal.grouped_by_date()?;
            if groups.is_empty() {
                println!("journal is empty");
            }
            for (date, entries) in groups {
                println!("{date}");
                for entry in entries {
                    println!(
                        "  {} [{:?}] {}: {}",
                        entry.timestamp.format("%H:%M:%S"),
                        entry.origin,
                        entry.application_key.as_deref().unwrap_or("-"),
                        entry.message
                    );
                }
            }
        }
        JournalAction::Clear => {
            agent.local.journal.clear()?;
            println!("journal cleared");
        }
    }
    Ok(())
}

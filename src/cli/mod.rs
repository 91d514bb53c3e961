use crate::config::{load_config, Config, Paths};
use crate::container::ContainerRunner;
use crate::groups::{GroupRegistry, RouterState, SessionMap};
use crate::handlers::HandlerContext;
use crate::intake::IntakeLoop;
use crate::ipc::IpcBroker;
use crate::kb::KbPipeline;
use crate::scheduler::Scheduler;
use crate::store::Store;
use crate::transport::whatsapp::WhatsAppTransport;
use crate::transport::TransportAdapter;
use crate::utils::task_tracker::TaskTracker;
use crate::utils::{ensure_dir, get_oxiclaw_home};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "oxiclaw")]
#[command(about = "Per-chat AI agent router")]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the router (transport + intake + broker + scheduler)
    Run {
        /// Path to config.json (defaults to ~/.oxiclaw/config.json)
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Show registered groups, tasks and router state
    Status,
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Run { config } => run_service(config.as_deref()).await,
        Commands::Status => show_status().await,
    }
}

/// Verify the container runtime is launchable before arming any loop.
async fn check_sandbox_runtime(config: &Config) -> Result<()> {
    let mut cmd = crate::utils::subprocess::scrubbed_command(&config.container.runtime);
    cmd.arg("--version");
    let result = tokio::time::timeout(std::time::Duration::from_secs(10), cmd.output()).await;
    match result {
        Ok(Ok(output)) if output.status.success() => Ok(()),
        Ok(Ok(output)) => anyhow::bail!(
            "container runtime '{}' is not usable: {}",
            config.container.runtime,
            String::from_utf8_lossy(&output.stderr)
        ),
        Ok(Err(e)) => anyhow::bail!(
            "container runtime '{}' not found: {}",
            config.container.runtime,
            e
        ),
        Err(_) => anyhow::bail!(
            "container runtime '{}' did not respond",
            config.container.runtime
        ),
    }
}

async fn run_service(config_path: Option<&std::path::Path>) -> Result<()> {
    let config = load_config(config_path)?;
    let timezone: chrono_tz::Tz = config
        .timezone
        .parse()
        .map_err(|_| anyhow::anyhow!("invalid timezone '{}'", config.timezone))?;

    check_sandbox_runtime(&config)
        .await
        .context("sandbox runtime check failed")?;

    let home = get_oxiclaw_home()?;
    let paths = Paths::new(home);
    paths.ensure_layout()?;

    let store = Arc::new(Store::open(paths.store_db())?);
    let registry = Arc::new(GroupRegistry::load(&paths)?);
    let sessions = Arc::new(SessionMap::load(&paths)?);
    let state = Arc::new(RouterState::load(&paths)?);
    let tracker = Arc::new(TaskTracker::new());

    // Each registered group needs its IPC drop dirs before the broker or a
    // container touches them.
    for group in registry.all().await {
        ensure_dir(paths.ipc_group_dir(&group.folder).join("messages"))?;
        ensure_dir(paths.ipc_group_dir(&group.folder).join("tasks"))?;
        ensure_dir(paths.group_dir(&group.folder))?;
    }

    let transport = Arc::new(WhatsAppTransport::new(config.transport.clone())?);
    let adapter = Arc::new(TransportAdapter::new(
        transport,
        store.clone(),
        registry.clone(),
        config.assistant_name.clone(),
        tracker.clone(),
    ));

    let runner = Arc::new(ContainerRunner::new(
        config.container.clone(),
        paths.clone(),
        config.project_root.clone(),
        sessions.clone(),
    ));
    let kb = Arc::new(KbPipeline::new(&config, &paths, store.clone())?);

    let ctx = Arc::new(HandlerContext {
        store: store.clone(),
        registry: registry.clone(),
        adapter: adapter.clone(),
        kb: kb.clone(),
        paths: paths.clone(),
        tools: config.tools.clone(),
        timezone,
    });

    let broker = Arc::new(IpcBroker::new(
        paths.clone(),
        registry.clone(),
        ctx.clone(),
        tracker.clone(),
    ));
    let scheduler = Arc::new(Scheduler::new(
        store.clone(),
        registry.clone(),
        runner.clone(),
        adapter.clone(),
        config.assistant_name.clone(),
        timezone,
        tracker.clone(),
    ));
    let intake = Arc::new(IntakeLoop::new(
        store.clone(),
        registry.clone(),
        state,
        adapter.clone(),
        runner,
        kb.clone(),
        config.assistant_name.clone(),
        tracker.clone(),
    ));

    adapter.start().await?;
    intake.start().await;
    broker.start().await;
    scheduler.start().await;

    // Fresh snapshots for the agents, then a best-effort embedding backfill.
    if let Err(e) = ctx.refresh_snapshots().await {
        warn!("initial snapshot write failed: {}", e);
    }
    tokio::spawn(async move {
        match kb.reembed_missing().await {
            Ok(0) => {}
            Ok(n) => info!("re-embedded {} chunks at startup", n),
            Err(e) => warn!("embedding backfill skipped: {}", e),
        }
    });

    info!(
        "oxiclaw running as '{}' with {} registered group(s)",
        config.assistant_name,
        registry.all().await.len()
    );

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    tracker.cancel_all().await;
    Ok(())
}

async fn show_status() -> Result<()> {
    let home = get_oxiclaw_home()?;
    let paths = Paths::new(home);
    let registry = GroupRegistry::load(&paths)?;
    let state = RouterState::load(&paths)?;

    let groups = registry.all().await;
    println!("Registered groups: {}", groups.len());
    for group in &groups {
        println!(
            "  {:<16} {:<24} trigger {}",
            group.folder, group.jid, group.trigger
        );
    }

    if paths.store_db().exists() {
        let store = Store::open(paths.store_db())?;
        let tasks = store.list_tasks()?;
        println!("Tasks: {}", tasks.len());
        for task in &tasks {
            println!(
                "  {:<36} {:<10} {:<8} next {}",
                task.id,
                task.group_folder,
                task.status.as_str(),
                task.next_run.as_deref().unwrap_or("-")
            );
        }
    } else {
        println!("Tasks: store not initialized");
    }

    let last = state.last_timestamp().await;
    println!(
        "Last handled message: {}",
        if last.is_empty() { "-" } else { &last }
    );
    Ok(())
}

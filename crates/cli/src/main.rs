use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};

use triad_core::agents::auditor::Auditor;
use triad_core::agents::executor::Executor;
use triad_core::agents::strategist::Strategist;
use triad_core::bus::AgentBus;
use triad_core::checkpoint::CheckpointStore;
use triad_core::context::{MapState, SharedContext};
use triad_core::dispatch::ToolDispatcher;
use triad_core::events::EventStream;
use triad_core::mcp::{ExecutionLog, ServerManager};
use triad_core::orchestrator::Orchestrator;
use triad_core::registry::SchemaRegistry;
use triad_core::reports::ReportWriter;
use triad_core::routing::ModeRouter;
use triad_core::segmenter::RequestSegmenter;

#[derive(Parser)]
#[command(name = "triad", about = "Trinity multi-agent task orchestrator", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to config.toml (default: ~/.config/triad/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Process a single request and print the replies
    Run {
        /// The request text
        request: String,
        /// Disable request segmentation
        #[arg(long)]
        no_segmentation: bool,
    },
    /// Show the configured tool servers and their connectivity
    Servers,
    /// Show registry, router and dispatcher statistics
    Stats,
    /// Show current configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("triad=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = triad_config::Config::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Run {
            request,
            no_segmentation,
        } => {
            if no_segmentation {
                config.segmentation.enabled = false;
            }
            run_request(&config, &request).await
        }
        Commands::Servers => show_servers(&config).await,
        Commands::Stats => show_stats(&config),
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

struct Components {
    orchestrator: Arc<Orchestrator>,
    manager: Arc<ServerManager>,
    events: EventStream,
}

fn build_components(config: &triad_config::Config) -> Result<Components> {
    let llm: Arc<dyn triad_provider::LlmClient> = triad_provider::create_client(config)?.into();

    let registry = Arc::new(SchemaRegistry::load(
        &triad_config::Config::config_dir().join("mcp_catalog.json"),
        &triad_config::Config::config_dir().join("tool_schemas.json"),
    ));
    let router = Arc::new(ModeRouter::default());
    let context = SharedContext::new();
    let map_state = MapState::new();
    let bus = AgentBus::new();
    let events = EventStream::new();
    let exec_log = ExecutionLog::new();
    let language = config.language.clone();

    let project_root = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    let servers = triad_config::resolve_servers(&config.mcp);
    let manager = ServerManager::new(
        servers,
        &project_root,
        config.mcp.secret_env.clone(),
        config.dispatch.clone(),
    );

    let dispatcher = ToolDispatcher::new(
        manager.clone(),
        registry.clone(),
        map_state,
        context.clone(),
    );

    let checkpoint_dir = config
        .orchestrator
        .checkpoint_dir
        .clone()
        .unwrap_or_else(CheckpointStore::default_dir);
    let checkpoints = Arc::new(CheckpointStore::new(&checkpoint_dir));

    let strategist = Strategist::new(
        llm.clone(),
        dispatcher.clone(),
        router.clone(),
        registry.clone(),
        language.clone(),
    );
    let executor = Executor::new(
        llm.clone(),
        dispatcher.clone(),
        registry.clone(),
        context.clone(),
        bus.clone(),
        events.clone(),
        exec_log.clone(),
        checkpoints.clone(),
        config.orchestrator.clone(),
        language.clone(),
    );
    let auditor = Auditor::new(
        llm.clone(),
        dispatcher.clone(),
        bus.clone(),
        ReportWriter::new(&ReportWriter::default_dir()),
        exec_log,
        config.security.clone(),
        language,
    );

    let mut segmentation = router.segmentation_config();
    segmentation.enabled = segmentation.enabled && config.segmentation.enabled;
    segmentation.max_segments = config.segmentation.max_segments;
    segmentation.min_segment_length = config.segmentation.min_segment_length;
    let segmenter = RequestSegmenter::new(router.clone(), Some(llm), segmentation);

    let orchestrator = Orchestrator::new(
        strategist,
        executor,
        auditor,
        segmenter,
        dispatcher,
        context,
        bus,
        events.clone(),
        checkpoints,
        config.orchestrator.clone(),
    );

    Ok(Components {
        orchestrator,
        manager,
        events,
    })
}

async fn run_request(config: &triad_config::Config, request: &str) -> Result<()> {
    let components = build_components(config)?;

    let report = components.orchestrator.process_request(request, &[]).await;

    for event in components.events.drain_replies() {
        if let triad_core::events::OrchestratorEvent::Voice { agent, message } = &event.event {
            eprintln!("[{agent}] {message}");
        }
    }
    for reply in &report.replies {
        println!("{reply}");
    }
    if report.failed {
        eprintln!("session {} failed", report.session_id);
    }

    components.manager.shutdown().await;
    if report.failed {
        std::process::exit(1);
    }
    Ok(())
}

async fn show_servers(config: &triad_config::Config) -> Result<()> {
    let servers = triad_config::resolve_servers(&config.mcp);
    if servers.is_empty() {
        println!("No tool servers configured.");
        return Ok(());
    }
    let project_root = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    let manager = ServerManager::new(
        servers.clone(),
        &project_root,
        config.mcp.secret_env.clone(),
        config.dispatch.clone(),
    );

    let names: Vec<String> = servers.keys().cloned().collect();
    let status = manager.ensure_servers_connected(&names).await;
    let mut sorted: Vec<_> = servers.iter().collect();
    sorted.sort_by_key(|(name, _)| (*name).clone());
    for (name, server) in sorted {
        let state = if server.disabled {
            "disabled"
        } else if manager.is_internal(name) {
            "internal"
        } else if status.get(name).copied().unwrap_or(false) {
            "connected"
        } else {
            "unreachable"
        };
        println!("{name:24} tier {}  {state}  {}", server.tier, server.description);
    }
    manager.shutdown().await;
    Ok(())
}

fn show_stats(_config: &triad_config::Config) -> Result<()> {
    let registry = SchemaRegistry::embedded();
    let stats = registry.stats();
    println!("registry: {} servers, {} tools", stats.total_servers, stats.total_tools);
    let router = ModeRouter::default();
    println!(
        "modes: {}",
        triad_core::routing::Mode::ALL
            .iter()
            .map(|m| m.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    );
    let _ = router.stats();
    Ok(())
}

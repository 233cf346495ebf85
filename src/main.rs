use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde_json::{Map, Value};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use weft_core::config::AppConfig;
use weft_core::types::FlowEvent;
use weft_events::EventBus;
use weft_flow::{EchoDispatcher, FlowDefinition, FlowRunner, StaticAgentDirectory};
use weft_orchestrator::Orchestrator;

const CLI_PRODUCER: &str = "weft-cli";

#[derive(Parser)]
#[command(name = "weft", version, about = "Event log, event bus and flow orchestration")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "weft.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Publish one event and flush it to disk
    Publish {
        topic: String,
        event_type: String,
        /// JSON payload
        #[arg(long, default_value = "{}")]
        data: String,
        /// Metadata entries as key=value
        #[arg(long = "meta")]
        metadata: Vec<String>,
        #[arg(long, default_value = CLI_PRODUCER)]
        producer: String,
    },
    /// Print stored events as JSON lines
    Events {
        /// Exact topic or pattern such as `orders.*`
        #[arg(long)]
        topic: Option<String>,
        #[arg(long)]
        from: Option<u64>,
        /// Inclusive end offset
        #[arg(long)]
        to: Option<u64>,
        #[arg(long)]
        partition: Option<usize>,
        /// Recompute each entry's checksum
        #[arg(long)]
        verify: bool,
    },
    /// Show the latest offset of each partition and the index sidecar
    Offsets,
    /// Execute a flow definition file with the echo dispatcher
    Run {
        flow: PathBuf,
        /// Variable overrides as key=JSON (bare strings are accepted)
        #[arg(long = "var")]
        vars: Vec<String>,
    },
    /// Run the bus, flush timer, retention sweeper and orchestrator until Ctrl-C
    Daemon,
    /// Delete segments older than the retention window
    Cleanup,
    /// Show the effective configuration
    Config,
}

fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    if path.exists() {
        return AppConfig::load(path).with_context(|| format!("loading {}", path.display()));
    }
    eprintln!("No config file at {}, using defaults", path.display());
    Ok(AppConfig::default())
}

fn init_tracing(config: &AppConfig) {
    let fallback = config
        .logging
        .as_ref()
        .map(|l| l.filter.clone())
        .unwrap_or_else(|| "weft=info,warn".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback)))
        .with_target(false)
        .init();
}

/// Split `key=value` pairs.
fn parse_pairs(pairs: &[String]) -> anyhow::Result<Vec<(String, String)>> {
    pairs
        .iter()
        .map(|p| {
            p.split_once('=')
                .map(|(k, v)| (k.trim().to_string(), v.to_string()))
                .with_context(|| format!("expected key=value, got '{}'", p))
        })
        .collect()
}

/// Values that don't parse as JSON are taken as plain strings.
fn parse_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli.config)?;
    init_tracing(&config);

    match cli.command {
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
        }
        Commands::Publish {
            topic,
            event_type,
            data,
            metadata,
            producer,
        } => {
            let data: Value = serde_json::from_str(&data).context("--data must be JSON")?;
            let metadata: BTreeMap<String, String> = parse_pairs(&metadata)?.into_iter().collect();
            let bus = EventBus::from_config(&config).await?;
            let entry = bus.publish(&topic, &event_type, data, metadata, &producer).await?;
            bus.shutdown().await?;
            println!("{}", serde_json::to_string(&entry)?);
        }
        Commands::Events {
            topic,
            from,
            to,
            partition,
            verify,
        } => {
            let bus = EventBus::from_config(&config).await?;
            let events = bus.get_events(topic.as_deref(), from, to, partition).await?;
            let mut corrupt = 0usize;
            for event in &events {
                if verify {
                    if let Err(e) = event.verify_checksum() {
                        warn!(error = %e, "Checksum mismatch");
                        corrupt += 1;
                    }
                }
                println!("{}", serde_json::to_string(event)?);
            }
            bus.shutdown().await?;
            if corrupt > 0 {
                anyhow::bail!("{} of {} events failed checksum verification", corrupt, events.len());
            }
        }
        Commands::Offsets => {
            let bus = EventBus::from_config(&config).await?;
            for partition in 0..bus.partitions() {
                match bus.get_latest_offset(Some(partition)) {
                    Some(offset) => println!("partition {:>3}  latest offset {}", partition, offset),
                    None => println!("partition {:>3}  empty", partition),
                }
            }
            let index = bus.log().index();
            if !index.is_empty() {
                println!();
                println!("{}", serde_json::to_string_pretty(index.entries())?);
            }
            bus.shutdown().await?;
        }
        Commands::Run { flow, vars } => {
            let definition = FlowDefinition::load(&flow)?;
            let overrides: Map<String, Value> = parse_pairs(&vars)?
                .into_iter()
                .map(|(k, v)| (k, parse_value(&v)))
                .collect();
            let runner = FlowRunner::new(
                config.flow.clone(),
                Arc::new(StaticAgentDirectory::from_config(&config.agents)),
                Arc::new(EchoDispatcher),
            );
            let outcome = runner
                .execute_flow(&definition, (!overrides.is_empty()).then_some(overrides))
                .await;
            match outcome {
                Ok(context) => println!("{}", serde_json::to_string_pretty(&context)?),
                Err(e) => anyhow::bail!("flow '{}' failed: {}", definition.id, e),
            }
        }
        Commands::Daemon => run_daemon(config).await?,
        Commands::Cleanup => {
            let bus = EventBus::from_config(&config).await?;
            let removed = bus.log().cleanup().await?;
            bus.shutdown().await?;
            println!("Removed {} expired segment(s)", removed);
        }
    }

    Ok(())
}

/// Log finished executions until the runner goes away. Returns how many were
/// logged.
async fn log_flow_events(mut events: broadcast::Receiver<FlowEvent>) -> usize {
    let mut finished = 0;
    loop {
        match events.recv().await {
            Ok(FlowEvent::ExecutionFinished {
                flow_id,
                execution_id,
                status,
                error,
                ..
            }) => {
                finished += 1;
                info!(flow_id = %flow_id, execution_id = %execution_id, status = ?status, error = ?error, "Flow execution finished");
            }
            Ok(_) => {}
            Err(RecvError::Lagged(missed)) => warn!(missed, "Flow event logger lagged"),
            Err(RecvError::Closed) => return finished,
        }
    }
}

async fn run_daemon(config: AppConfig) -> anyhow::Result<()> {
    let bus = EventBus::from_config(&config).await?;
    bus.start();

    let runner = Arc::new(FlowRunner::new(
        config.flow.clone(),
        Arc::new(StaticAgentDirectory::from_config(&config.agents)),
        Arc::new(EchoDispatcher),
    ));

    let flow_events = runner.subscribe_events();
    tokio::spawn(log_flow_events(flow_events));

    let orchestrator = if config.orchestrator.enabled {
        let o = Orchestrator::from_config(config.orchestrator.clone(), bus.clone(), runner.clone())?;
        o.start().await?;
        Some(o)
    } else {
        info!("Orchestrator disabled");
        None
    };

    info!(
        log_dir = %config.log.dir_path().display(),
        partitions = bus.partitions(),
        "Weft daemon running, press Ctrl-C to stop"
    );
    tokio::signal::ctrl_c().await.ok();
    info!("Shutting down");

    if let Some(o) = orchestrator {
        o.stop();
    }
    for id in runner.active_executions() {
        if let Err(e) = runner.cancel_flow(&id) {
            warn!(execution_id = %id, error = %e, "Cancel failed");
        }
    }
    bus.shutdown().await?;
    Ok(())
}

//! Dgraph Kubernetes Operator
//!
//! Command line entry point: runs the operator, prints build information or
//! prints the CRD manifest.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dgraph_operator::config::{ConfigOverrides, OperatorConfig};
use dgraph_operator::crd::dgraph_cluster_crd;
use dgraph_operator::version::BuildInfo;
use dgraph_operator::{operator, server};
use kube::Client;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

/// Dgraph Kubernetes Operator
#[derive(Parser, Debug)]
#[command(name = "dgraph-operator")]
#[command(about = "Kubernetes operator for Dgraph clusters")]
#[command(version)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// YAML configuration file
    #[arg(long, env = "DGRAPH_OPERATOR_CONFIG_FILE", global = true)]
    config_file: Option<PathBuf>,

    #[command(flatten)]
    overrides: ConfigOverrides,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the operator (default)
    Run,
    /// Print build information
    Version,
    /// Print the CRD YAML and exit
    Crd,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    match args.command.unwrap_or(Command::Run) {
        Command::Version => {
            println!("{}", BuildInfo::current());
            Ok(())
        }
        Command::Crd => print_crd(),
        Command::Run => {
            let mut config = match &args.config_file {
                Some(path) => OperatorConfig::from_file(path)
                    .with_context(|| format!("Failed to load {}", path.display()))?,
                None => OperatorConfig::default(),
            };
            config.apply(&args.overrides);
            config.validate().context("Invalid configuration")?;
            run(config).await
        }
    }
}

async fn run(config: OperatorConfig) -> Result<()> {
    init_logging(&config)?;

    let build = BuildInfo::current();
    info!(
        version = build.version,
        commit = build.commit,
        namespace = config.namespace.as_deref().unwrap_or("all"),
        "Starting Dgraph Kubernetes Operator"
    );

    let cancel = CancellationToken::new();
    tokio::spawn(operator::shutdown_signal(cancel.clone()));

    let metrics = PrometheusBuilder::new()
        .install_recorder()
        .context("Failed to install Prometheus recorder")?;

    let addr = config.server.addr()?;
    let server_cancel = cancel.clone();
    tokio::spawn(async move {
        if let Err(e) = server::serve(addr, Some(metrics), server_cancel).await {
            error!(error = %e, "Health server failed");
        }
    });

    let client = Client::try_default()
        .await
        .context("Failed to create Kubernetes client")?;

    operator::run(client, config, cancel)
        .await
        .context("Operator failed")?;

    info!("Operator stopped");
    Ok(())
}

/// Initialize logging subsystem
fn init_logging(config: &OperatorConfig) -> Result<()> {
    let filter = EnvFilter::try_new(&config.log.level)
        .with_context(|| format!("Invalid log level '{}'", config.log.level))?;

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_span_events(FmtSpan::CLOSE)
        .with_target(true)
        .with_thread_ids(false)
        .with_line_number(false);

    if config.log.json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    Ok(())
}

/// Print the CRD YAML for installation
fn print_crd() -> Result<()> {
    let yaml = serde_yaml::to_string(&dgraph_cluster_crd())?;
    println!("{}", yaml);

    Ok(())
}

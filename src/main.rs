//! Binary entry point for the `forester` CLI.

mod cli;

use std::io::{self, Write};
use std::process;
use std::sync::Arc;

use clap::Parser;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use cli::{Cli, CreateCommand, GrowCommand};
use forester::{
    CloudInitError, ConfigError, Forest, ForestOrchestrator, ForestReport, ForesterConfig, Node,
    OrchestratorError, ProvisionRequest, Registry, RegistryError, ScalewayConfig,
    ScalewayProvider, ScalewayProviderError, SelectionRequest, TeardownSummary,
};

type Orchestrator = ForestOrchestrator<ScalewayProvider, dyn Registry>;

#[derive(Debug, Error)]
enum CliError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("provider error: {0}")]
    Provider(#[from] ScalewayProviderError),
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),
    #[error("{0}")]
    Orchestrator(Box<OrchestratorError<ScalewayProviderError>>),
    #[error("teardown of {forest_id} left {count} server(s) behind")]
    IncompleteTeardown { forest_id: String, count: usize },
    #[error("failed to write output: {0}")]
    Output(#[from] io::Error),
}

impl From<ConfigError> for CliError {
    fn from(value: ConfigError) -> Self {
        Self::Config(value.to_string())
    }
}

impl From<CloudInitError> for CliError {
    fn from(value: CloudInitError) -> Self {
        Self::Config(value.to_string())
    }
}

impl From<OrchestratorError<ScalewayProviderError>> for CliError {
    fn from(value: OrchestratorError<ScalewayProviderError>) -> Self {
        Self::Orchestrator(Box::new(value))
    }
}

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();
    let exit_code = match dispatch(cli, &mut io::stdout()).await {
        Ok(()) => 0,
        Err(err) => {
            report_error(&err);
            1
        }
    };

    process::exit(exit_code);
}

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("forester=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .init();
}

async fn dispatch(cli: Cli, out: &mut impl Write) -> Result<(), CliError> {
    match cli {
        Cli::Create(args) => create(args, out).await,
        Cli::Grow(args) => grow(args, out).await,
        Cli::Destroy(args) => destroy(&args.forest_id, out).await,
        Cli::List => list(out).await,
        Cli::Status(args) => status(&args.forest_id, out).await,
        Cli::Check => check(out).await,
    }
}

fn load_forester_config() -> Result<ForesterConfig, CliError> {
    let config = ForesterConfig::load_without_cli_args()?;
    config.validate()?;
    Ok(config)
}

fn build_orchestrator(config: &ForesterConfig) -> Result<Orchestrator, CliError> {
    let provider = ScalewayProvider::new(ScalewayConfig::load_without_cli_args()?)?;
    Ok(ForestOrchestrator::new(provider, config.open_registry()?)
        .with_user_data(config.user_data()?)
        .with_settings(config.orchestrator_settings()))
}

/// Token cancelled by the first Ctrl-C.
fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; rolling back");
            trigger.cancel();
        }
    });
    token
}

fn selection_for(
    args: &CreateCommand,
    config: &ForesterConfig,
    scaleway: &ScalewayConfig,
) -> SelectionRequest {
    let primary = args
        .instance_type
        .clone()
        .unwrap_or_else(|| scaleway.default_instance_type.clone());
    let fallbacks = if args.fallback_types.is_empty() {
        config.fallback_instance_types()
    } else {
        args.fallback_types.clone()
    };
    let zones = if args.zones.is_empty() {
        config.preferred_zones()
    } else {
        args.zones.clone()
    };
    let selection = SelectionRequest::new(primary)
        .with_fallbacks(fallbacks)
        .with_preferred_locations(zones);
    if args.pinned {
        selection.preferred_only()
    } else {
        selection
    }
}

async fn create(args: CreateCommand, out: &mut impl Write) -> Result<(), CliError> {
    let config = load_forester_config()?;
    let orchestrator = build_orchestrator(&config)?;
    let scaleway = orchestrator.provider().config();
    let image = args
        .image
        .clone()
        .unwrap_or_else(|| scaleway.default_image.clone());
    let mut request = ProvisionRequest::new(
        args.nodes,
        selection_for(&args, &config, scaleway),
        image,
    );
    if let Some(forest_id) = args.forest_id {
        request = request.with_forest_id(forest_id);
    }

    let report = orchestrator
        .provision(&request, cancel_on_ctrl_c())
        .await?;
    write_report(out, &report)
}

async fn grow(args: GrowCommand, out: &mut impl Write) -> Result<(), CliError> {
    let config = load_forester_config()?;
    let orchestrator = build_orchestrator(&config)?;
    let report = orchestrator
        .grow(&args.forest_id, args.nodes, cancel_on_ctrl_c())
        .await?;
    write_report(out, &report)
}

async fn destroy(forest_id: &str, out: &mut impl Write) -> Result<(), CliError> {
    let config = load_forester_config()?;
    let orchestrator = build_orchestrator(&config)?;
    let summary = orchestrator.teardown(forest_id).await?;
    write_teardown(out, &summary)?;
    if summary.is_clean() {
        Ok(())
    } else {
        Err(CliError::IncompleteTeardown {
            forest_id: summary.forest_id,
            count: summary.failures.len(),
        })
    }
}

fn open_registry() -> Result<Arc<dyn Registry>, CliError> {
    Ok(load_forester_config()?.open_registry()?)
}

async fn list(out: &mut impl Write) -> Result<(), CliError> {
    let forests = open_registry()?.list_forests().await;
    write_forest_table(out, &forests)
}

async fn status(forest_id: &str, out: &mut impl Write) -> Result<(), CliError> {
    let registry = open_registry()?;
    let forest = registry.get_forest(forest_id).await?;
    let nodes = registry.get_nodes(forest_id).await?;
    if !forest.is_reconciled(&nodes) {
        warn!(
            forest_id,
            size = forest.size,
            nodes = nodes.len(),
            "forest size does not match its node records"
        );
    }
    write_report(out, &ForestReport { forest, nodes })
}

async fn check(out: &mut impl Write) -> Result<(), CliError> {
    let registry = open_registry()?;
    registry.check_reachable().await?;
    writeln!(out, "registry at {} is reachable", registry.endpoint())?;
    Ok(())
}

fn write_forest_line(out: &mut impl Write, forest: &Forest) -> io::Result<()> {
    writeln!(
        out,
        "{}\t{}\t{} node(s)\t{}\t{}\t{}",
        forest.id,
        forest.status,
        forest.size,
        forest.machine_type,
        forest.location,
        forest.created_at.to_rfc3339()
    )
}

fn write_node_line(out: &mut impl Write, node: &Node) -> io::Result<()> {
    writeln!(
        out,
        "  {}\t{}\t{}\t{}\t{}",
        node.name, node.role, node.status, node.addresses, node.id
    )
}

fn write_report(out: &mut impl Write, report: &ForestReport) -> Result<(), CliError> {
    write_forest_line(out, &report.forest)?;
    for node in &report.nodes {
        write_node_line(out, node)?;
    }
    Ok(())
}

fn write_forest_table(out: &mut impl Write, forests: &[Forest]) -> Result<(), CliError> {
    if forests.is_empty() {
        writeln!(out, "no forests registered")?;
    }
    for forest in forests {
        write_forest_line(out, forest)?;
    }
    Ok(())
}

fn write_teardown(out: &mut impl Write, summary: &TeardownSummary) -> Result<(), CliError> {
    writeln!(
        out,
        "forest {} destroyed: {} server(s) deleted, {} orphan(s) removed",
        summary.forest_id,
        summary.deleted.len(),
        summary.orphans.len()
    )?;
    for (server, reason) in &summary.failures {
        writeln!(out, "  failed to delete {server}: {reason}")?;
    }
    Ok(())
}

fn report_error(err: &CliError) {
    write_error(io::stderr(), err);
}

fn write_error(mut target: impl Write, err: &CliError) {
    writeln!(target, "{err}").ok();
}

//! Command line entry point.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use argh::FromArgs;
use tokio_util::sync::CancellationToken;
use yansi::Paint;

use crate::auth::oauth::OAuthAuthenticator;
use crate::auth::{Authenticator, ClientCredentials, StaticAuthenticator, TokenManager};
use crate::catalog::BoxedCatalog;
use crate::catalog::http::HttpCatalog;
use crate::catalog::in_memory::InMemoryCatalog;
use crate::config::Config;
use crate::dataset::{DatasetWalker, EntityKind};
use crate::observability;
use crate::orchestrator::Orchestrator;
use crate::report::RunReport;
use crate::workload::Phase;

/// Load tests for Iceberg REST catalog services.
#[derive(Debug, FromArgs)]
struct Args {
    /// path to the YAML configuration file
    #[argh(option, short = 'c')]
    pub config: Option<PathBuf>,

    #[argh(subcommand)]
    pub command: Command,
}

#[derive(Debug, FromArgs)]
#[argh(subcommand)]
enum Command {
    Run(RunCommand),
    Plan(PlanCommand),
    Version(VersionCommand),
}

/// run all configured phases against the catalog service
#[derive(Debug, FromArgs)]
#[argh(subcommand, name = "run")]
struct RunCommand {
    /// run against an in-memory catalog holding the whole dataset
    #[argh(switch)]
    dry_run: bool,

    /// do not render progress bars
    #[argh(switch)]
    no_progress: bool,
}

/// print the dataset size and the resolved phases without running them
#[derive(Debug, FromArgs)]
#[argh(subcommand, name = "plan")]
struct PlanCommand {}

/// print the harness version
#[derive(Default, Debug, FromArgs)]
#[argh(subcommand, name = "version")]
struct VersionCommand {}

/// Parses the arguments and executes the CLI command.
pub fn execute() -> Result<()> {
    let args: Args = argh::from_env();

    match args.command {
        Command::Version(VersionCommand {}) => {
            println!("{}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Command::Plan(PlanCommand {}) => {
            let config = Config::load(args.config.as_deref())?;
            config.validate()?;
            let (walker, phases) = resolve(&config)?;
            print_plan(&walker, &phases);
            Ok(())
        }
        Command::Run(command) => {
            let mut config = Config::load(args.config.as_deref())?;
            config.catalog.dry_run |= command.dry_run;
            config.validate()?;
            let (walker, phases) = resolve(&config)?;

            let runtime = tokio::runtime::Builder::new_multi_thread()
                .thread_name("loadtest-rt")
                .enable_all()
                .build()?;
            let _runtime_guard = runtime.enter();

            observability::init_tracing(&config.logging);
            tracing::debug!(?config);

            let report = runtime.block_on(run(config, walker, phases, !command.no_progress))?;
            report.print();

            match report.aborted {
                Some(error) => Err(error.into()),
                None => Ok(()),
            }
        }
    }
}

fn resolve(config: &Config) -> Result<(DatasetWalker, Vec<Phase>)> {
    let walker = DatasetWalker::new(&config.dataset, &config.catalog.catalog_prefix)?;
    let phases = config.workload.phases(&walker)?;
    Ok((walker, phases))
}

async fn run(
    config: Config,
    walker: DatasetWalker,
    phases: Vec<Phase>,
    progress: bool,
) -> Result<RunReport> {
    let catalog = build_catalog(&config, &walker)?;
    let (authenticator, client) = build_authenticator(&config)?;

    let abort = CancellationToken::new();
    let manager = TokenManager::new(authenticator, client, config.auth.token_settings());
    let credentials = manager
        .start(abort.clone())
        .await
        .context("failed to acquire an access token")?;

    let interrupt = abort.clone();
    let signal = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupted, waiting for in-flight actions");
            interrupt.cancel();
        }
    });

    tracing::info!(
        catalog = catalog.name(),
        catalogs = walker.count(EntityKind::Catalog),
        namespaces = walker.count(EntityKind::Namespace),
        tables = walker.count(EntityKind::Table),
        views = walker.count(EntityKind::View),
        "starting run"
    );

    let orchestrator = Orchestrator::new(catalog, walker, credentials.reader())
        .with_cancellation(abort)
        .with_action_timeout(config.catalog.request_timeout)
        .with_progress(progress);
    let report = orchestrator.run(phases).await;

    signal.abort();
    credentials.shutdown().await;
    tracing::info!(elapsed = ?report.elapsed, "run finished");

    Ok(report)
}

fn build_catalog(config: &Config, walker: &DatasetWalker) -> Result<BoxedCatalog> {
    if config.catalog.dry_run {
        let catalog = InMemoryCatalog::new();
        catalog.populate(walker);
        return Ok(Box::new(catalog));
    }

    let client = reqwest::Client::builder()
        .timeout(config.catalog.request_timeout)
        .build()?;
    let mut catalog = HttpCatalog::new(client, &config.catalog.base_url)?
        .with_storage_location(&config.catalog.storage_location);
    if let Some(realm) = &config.catalog.realm {
        catalog = catalog.with_realm(&config.catalog.realm_header, realm);
    }

    Ok(Box::new(catalog))
}

fn build_authenticator(config: &Config) -> Result<(Arc<dyn Authenticator>, ClientCredentials)> {
    let auth = &config.auth;
    let mut client = ClientCredentials::new(&auth.client_id, auth.client_secret());
    client.scope = auth.scope.clone();

    if let Some(token) = auth.static_token() {
        return Ok((Arc::new(StaticAuthenticator::new(token)), client));
    }
    if config.catalog.dry_run {
        return Ok((Arc::new(StaticAuthenticator::new("dry-run")), client));
    }

    let http = reqwest::Client::builder().timeout(auth.timeout).build()?;
    let mut authenticator =
        OAuthAuthenticator::new(http, auth.token_url(&config.catalog.base_url))
            .with_refresh_buffer(auth.refresh_buffer);
    if let Some(realm) = &config.catalog.realm {
        authenticator = authenticator.with_realm(&config.catalog.realm_header, realm);
    }

    Ok((Arc::new(authenticator), client))
}

fn print_plan(walker: &DatasetWalker, phases: &[Phase]) {
    let topology = walker.topology();
    println!("{}", "## DATASET".bold());
    println!(
        "  tree: width {}, {} leaf namespaces",
        topology.width().bold(),
        topology.leaves().bold()
    );
    for kind in EntityKind::ALL {
        println!("  {kind}s: {}", walker.count(kind).bold());
    }

    println!();
    println!("{}", "## PHASES".bold());
    for (index, phase) in phases.iter().enumerate() {
        let pacing = match phase.rate() {
            Some(rate) => format!("{rate} ops/s"),
            None => "unpaced".to_owned(),
        };
        println!(
            "  {}. {} ({} {}, target: {}, concurrency: {}, {pacing})",
            index + 1,
            phase.name().bold().blue(),
            phase.action(),
            phase.kind(),
            phase.target(),
            phase.concurrency()
        );
    }
}

mod config;

use appconfig::metrics_defs::ALL_METRICS;
use appconfig::scheduler::SchedulerError;
use appconfig::{
    BuildError, HttpTransportFactory, PullRefresh, RefreshError, RefreshEvent, RefreshScheduler,
    ReplicaClientFactory, ReplicaClientsBuilder, StateHolder, health_report,
};
use clap::{Args, Parser};
use config::{Config, ConfigError, LoggingConfig, MetricsConfig};
use metrics_exporter_statsd::StatsdBuilder;
use shared::admin_service::{AdminService, HealthCheck};
use shared::http::run_http_service;
use shared::metrics_defs::describe_metrics;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser)]
enum CliCommand {
    /// Load every configured store and poll it for changes
    Run(CliArgs),
    /// Validate the config file and exit
    Check(CliArgs),
}

#[derive(Args)]
struct CliArgs {
    #[arg(long, short = 'c')]
    config_file: PathBuf,
}

#[derive(thiserror::Error, Debug)]
enum RefresherError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("could not build replica clients: {0}")]
    Build(#[from] BuildError),
    #[error(transparent)]
    Refresh(#[from] RefreshError),
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
    #[error("could not set up metrics: {0}")]
    Metrics(String),
}

fn main() -> ExitCode {
    let cli = CliCommand::parse();

    match cli {
        CliCommand::Check(args) => match Config::from_file(&args.config_file) {
            Ok(config) => {
                println!(
                    "Config is valid, {} store(s) configured",
                    config.provider.stores.len()
                );
                ExitCode::SUCCESS
            }
            Err(err) => {
                eprintln!("Invalid config: {err}");
                ExitCode::FAILURE
            }
        },
        CliCommand::Run(args) => {
            let config = match Config::from_file(&args.config_file) {
                Ok(config) => config,
                Err(err) => return config_failure(err),
            };

            let _sentry = init_logging(config.logging.as_ref());

            if let Some(metrics) = &config.metrics
                && let Err(err) = init_metrics(metrics)
            {
                tracing::error!(error = %err, "Failed to start refresher");
                return ExitCode::FAILURE;
            }

            let result = tokio::runtime::Runtime::new()
                .map_err(RefresherError::from)
                .and_then(|runtime| runtime.block_on(run(config)));

            match result {
                Ok(()) => ExitCode::SUCCESS,
                Err(err) => {
                    tracing::error!(error = %err, "Refresher exited with error");
                    ExitCode::FAILURE
                }
            }
        }
    }
}

fn config_failure(err: ConfigError) -> ExitCode {
    eprintln!("Failed to load config: {err}");
    ExitCode::FAILURE
}

fn init_logging(logging: Option<&LoggingConfig>) -> Option<sentry::ClientInitGuard> {
    let guard = logging.map(|logging| {
        sentry::init((
            logging.sentry_dsn.as_str(),
            sentry::ClientOptions {
                release: sentry::release_name!(),
                ..Default::default()
            },
        ))
    });

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(
            guard
                .as_ref()
                .map(|_| sentry::integrations::tracing::layer()),
        )
        .init();

    guard
}

fn init_metrics(config: &MetricsConfig) -> Result<(), RefresherError> {
    let recorder = StatsdBuilder::from(config.statsd_host.as_str(), config.statsd_port)
        .build(Some("appconfig_refresher"))
        .map_err(|e| RefresherError::Metrics(e.to_string()))?;
    metrics::set_global_recorder(recorder).map_err(|e| RefresherError::Metrics(e.to_string()))?;
    describe_metrics(ALL_METRICS);

    tracing::info!(
        host = %config.statsd_host,
        port = config.statsd_port,
        "Reporting metrics to statsd"
    );
    Ok(())
}

async fn run(config: Config) -> Result<(), RefresherError> {
    let transport_factory = HttpTransportFactory::new(config.provider.request_timeout())?;
    let builder = ReplicaClientsBuilder::new(Arc::new(transport_factory));
    let factory = Arc::new(ReplicaClientFactory::new(&config.provider, &builder)?);
    let state_holder = Arc::new(StateHolder::new());

    let (events_tx, events_rx) = broadcast::channel::<RefreshEvent>(16);
    let engine = Arc::new(PullRefresh::new(
        factory.clone(),
        state_holder.clone(),
        Arc::new(events_tx),
        &config.provider,
    ));

    let loaded = engine.load_configurations().await?;
    tracing::info!(
        stores = loaded.len(),
        settings = loaded.iter().map(|s| s.settings.len()).sum::<usize>(),
        "Initial configuration loaded"
    );

    let scheduler = RefreshScheduler::spawn(engine.clone(), config.poll_interval());
    let reload_task = tokio::spawn(reload_on_refresh(engine.clone(), events_rx));

    let (ready_factory, ready_state) = (factory.clone(), state_holder.clone());
    let admin_service = AdminService::<_, _, RefresherError>::new(
        move || health_report(&ready_factory, &ready_state).is_ready(),
        move || {
            let report = health_report(&factory, &state_holder);
            HealthCheck {
                healthy: report.is_healthy(),
                body: report.to_json(),
            }
        },
    );
    let admin_task = run_http_service(
        &config.admin_listener.host,
        config.admin_listener.port,
        admin_service,
    );

    tokio::select! {
        result = admin_task => result?,
        _ = tokio::signal::ctrl_c() => tracing::info!("Shutting down"),
    }

    reload_task.abort();
    scheduler.shutdown().await?;
    Ok(())
}

/// Reloads every store each time a change is detected.
async fn reload_on_refresh(engine: Arc<PullRefresh>, mut events: broadcast::Receiver<RefreshEvent>) {
    loop {
        match events.recv().await {
            Ok(event) => {
                tracing::info!(message = %event.message, "Configuration changed, reloading");
                match engine.load_configurations().await {
                    Ok(loaded) => tracing::info!(
                        stores = loaded.len(),
                        settings = loaded.iter().map(|s| s.settings.len()).sum::<usize>(),
                        "Configuration reloaded"
                    ),
                    Err(err) => tracing::error!(error = %err, "Failed to reload configuration"),
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "Missed refresh events");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

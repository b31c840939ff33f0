//! Command-line entry point for the saxs_stream pipeline.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use saxs_stream::catalog::http::HttpCatalog;
use saxs_stream::catalog::mock::MockCatalog;
use saxs_stream::catalog::RunCatalog;
use saxs_stream::channel::broker::Broker;
use saxs_stream::channel::tcp::{TcpPublisher, TcpSubscriber};
use saxs_stream::channel::{self, FanOutSink};
use saxs_stream::config::PipelineConfig;
use saxs_stream::driver::notify::{JsonLinesSource, NotifyDriver};
use saxs_stream::driver::polling::PollingDriver;
use saxs_stream::messages::{DerivedEvent, LifecycleEvent};
use saxs_stream::publisher::CatalogWriteBack;
use saxs_stream::reduce::operator::ReductionOperator;
use saxs_stream::reduce::registry::ReducerRegistry;
use saxs_stream::shutdown::{self, ShutdownHandle, ShutdownSignal};
use saxs_stream::sim::AcquisitionSim;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser)]
#[command(
    name = "saxs_stream",
    about = "Streaming frame delivery and reduction for SAXS/GISAXS beamlines"
)]
struct Cli {
    /// Path to the configuration file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Poll the catalog for runs and publish the raw lifecycle stream.
    Poll {
        /// Catalog base URL (overrides the config file).
        #[arg(long)]
        catalog_url: Option<String>,
        /// Bind address for the lifecycle publisher.
        #[arg(long)]
        publish_address: Option<String>,
        /// Poll interval in seconds.
        #[arg(long)]
        poll_interval: Option<u64>,
        /// Deliver exactly this run, then exit.
        #[arg(long)]
        run_id: Option<String>,
    },
    /// Follow a push notification channel instead of polling.
    Listen {
        /// Notification service address.
        #[arg(long)]
        notify_address: Option<String>,
        /// Catalog base URL (overrides the config file).
        #[arg(long)]
        catalog_url: Option<String>,
        /// Bind address for the lifecycle publisher.
        #[arg(long)]
        publish_address: Option<String>,
    },
    /// Run a reduction worker over a published lifecycle stream.
    Reduce {
        /// Address of the lifecycle publisher to subscribe to.
        #[arg(long)]
        subscribe_address: Option<String>,
        /// Bind address for the derived-event publisher.
        #[arg(long)]
        derived_address: Option<String>,
        /// Registry name of the reducer to run.
        #[arg(long)]
        reducer: Option<String>,
    },
    /// Round-robin frames from producers to a pool of workers.
    Broker {
        /// Producers connect here.
        #[arg(long)]
        frontend_address: Option<String>,
        /// Workers connect here.
        #[arg(long)]
        backend_address: Option<String>,
    },
    /// Run the whole pipeline in-process against a simulated acquisition.
    Simulate {
        /// Bind address for the lifecycle publisher.
        #[arg(long)]
        publish_address: Option<String>,
        /// Bind address for the derived-event publisher.
        #[arg(long)]
        derived_address: Option<String>,
        /// Number of simulated runs.
        #[arg(long)]
        runs: Option<u32>,
    },
}

fn init_tracing(log_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn spawn_ctrl_c(handle: ShutdownHandle) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested");
        }
        handle.shutdown();
    });
}

fn http_catalog(config: &PipelineConfig) -> Arc<dyn RunCatalog> {
    Arc::new(HttpCatalog::new(
        &config.catalog.uri,
        config.catalog.api_key.clone(),
        config.catalog.root_segments.clone(),
        config.catalog.frame_segments.clone(),
    ))
}

/// Fail fast when the catalog is unreachable at startup; later transient
/// errors are retried, but a misconfigured catalog should not start.
async fn check_catalog(catalog: &Arc<dyn RunCatalog>, uri: &str) -> Result<()> {
    catalog
        .most_recent_run()
        .await
        .with_context(|| format!("catalog at {uri} is unreachable"))?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = PipelineConfig::load(cli.config.as_deref())?;
    init_tracing(&config.application.log_level);

    let (handle, signal) = shutdown::channel();
    spawn_ctrl_c(handle);

    match cli.command {
        Command::Poll {
            catalog_url,
            publish_address,
            poll_interval,
            run_id,
        } => {
            if let Some(url) = catalog_url {
                config.catalog.uri = url;
            }
            if let Some(address) = publish_address {
                config.channel.publish_address = address;
            }
            if let Some(secs) = poll_interval {
                config.poller.poll_interval = std::time::Duration::from_secs(secs);
            }
            if run_id.is_some() {
                config.poller.single_run_id = run_id;
            }
            config.validate().map_err(anyhow::Error::from)?;

            let catalog = http_catalog(&config);
            check_catalog(&catalog, &config.catalog.uri).await?;
            let publisher: TcpPublisher<LifecycleEvent> =
                TcpPublisher::bind(&config.channel.publish_address).await?;
            info!(address = %publisher.local_addr(), "publishing lifecycle events");
            PollingDriver::new(
                catalog,
                config.catalog.frame_segments.clone(),
                config.poller_options(),
                publisher,
                signal,
            )
            .run()
            .await?;
        }

        Command::Listen {
            notify_address,
            catalog_url,
            publish_address,
        } => {
            if let Some(url) = catalog_url {
                config.catalog.uri = url;
            }
            if let Some(address) = notify_address {
                config.notify.address = address;
            }
            if let Some(address) = publish_address {
                config.channel.publish_address = address;
            }
            config.validate().map_err(anyhow::Error::from)?;

            let catalog = http_catalog(&config);
            check_catalog(&catalog, &config.catalog.uri).await?;
            let source = JsonLinesSource::new(&config.notify.address, config.channel.retry.clone());
            let publisher: TcpPublisher<LifecycleEvent> =
                TcpPublisher::bind(&config.channel.publish_address).await?;
            info!(address = %publisher.local_addr(), "publishing lifecycle events");
            NotifyDriver::new(
                source,
                catalog,
                config.catalog.frame_segments.clone(),
                config.notify_options(),
                publisher,
                signal,
            )
            .run()
            .await?;
        }

        Command::Reduce {
            subscribe_address,
            derived_address,
            reducer,
        } => {
            if let Some(address) = subscribe_address {
                config.channel.publish_address = address;
            }
            if let Some(address) = derived_address {
                config.channel.derived_address = address;
            }
            if let Some(name) = reducer {
                config.reducer.name = name;
            }
            config.validate().map_err(anyhow::Error::from)?;

            let registry = ReducerRegistry::new();
            let reducer = registry
                .create(&config.reducer.name, &config.reducer.params)
                .with_context(|| {
                    format!(
                        "unknown or misconfigured reducer '{}' (available: {:?})",
                        config.reducer.name,
                        registry.names()
                    )
                })?;
            let source: TcpSubscriber<LifecycleEvent> = TcpSubscriber::new(
                &config.channel.publish_address,
                config.channel.retry.clone(),
            );
            let publisher: TcpPublisher<DerivedEvent> =
                TcpPublisher::bind(&config.channel.derived_address).await?;
            info!(address = %publisher.local_addr(), "publishing derived events");
            ReductionOperator::new(
                source,
                reducer,
                vec![Box::new(publisher)],
                config.channel.retry.clone(),
                signal,
            )
            .run()
            .await?;
        }

        Command::Broker {
            frontend_address,
            backend_address,
        } => {
            if let Some(address) = frontend_address {
                config.channel.broker_frontend_address = address;
            }
            if let Some(address) = backend_address {
                config.channel.broker_backend_address = address;
            }
            Broker::new(
                &config.channel.broker_frontend_address,
                &config.channel.broker_backend_address,
                config.channel.queue_depth,
            )
            .run(signal)
            .await?;
        }

        Command::Simulate {
            publish_address,
            derived_address,
            runs,
        } => {
            if let Some(address) = publish_address {
                config.channel.publish_address = address;
            }
            if let Some(address) = derived_address {
                config.channel.derived_address = address;
            }
            if let Some(runs) = runs {
                config.sim.runs = runs;
            }
            config.validate().map_err(anyhow::Error::from)?;
            simulate(&config, signal).await?;
        }
    }
    Ok(())
}

/// The whole pipeline in one process: simulated acquisition feeding a mock
/// catalog, a polling driver publishing lifecycle events, and a reduction
/// operator publishing derived events and writing results back.
async fn simulate(config: &PipelineConfig, signal: ShutdownSignal) -> Result<()> {
    let catalog = MockCatalog::new();
    let registry = ReducerRegistry::new();
    let reducer = registry
        .create(&config.reducer.name, &config.reducer.params)
        .map_err(|err| anyhow::anyhow!(err))?;

    let raw_publisher: TcpPublisher<LifecycleEvent> =
        TcpPublisher::bind(&config.channel.publish_address).await?;
    info!(address = %raw_publisher.local_addr(), "publishing lifecycle events");
    let derived_publisher: TcpPublisher<DerivedEvent> =
        TcpPublisher::bind(&config.channel.derived_address).await?;
    info!(address = %derived_publisher.local_addr(), "publishing derived events");

    let (event_tx, event_rx) = channel::bounded::<LifecycleEvent>(config.channel.queue_depth);
    let raw_sink: FanOutSink<LifecycleEvent> =
        FanOutSink::new(vec![Box::new(raw_publisher), Box::new(event_tx)]);

    let writeback = CatalogWriteBack::new(Arc::new(catalog.clone()));
    let operator = ReductionOperator::new(
        event_rx,
        reducer,
        vec![Box::new(derived_publisher), Box::new(writeback)],
        config.channel.retry.clone(),
        signal.clone(),
    );

    let mut poller_options = config.poller_options();
    // Poll fast enough to keep up with the simulated frame rate.
    poller_options.poll_interval = config.sim.frame_interval.min(poller_options.poll_interval);
    let driver = PollingDriver::new(
        Arc::new(catalog.clone()) as Arc<dyn RunCatalog>,
        config.catalog.frame_segments.clone(),
        poller_options,
        raw_sink,
        signal.clone(),
    );

    let sim = AcquisitionSim::new(catalog, config.sim_options());

    let driver_task = tokio::spawn(driver.run());
    let operator_task = tokio::spawn(operator.run());
    sim.run(signal.clone()).await?;

    // Let the driver drain the final run before tearing the tasks down.
    let grace = config.poller.poll_interval * (config.poller.drain_grace_cycles + 2);
    tokio::time::sleep(grace).await;
    driver_task.abort();
    operator_task.abort();
    if let Ok(Err(err)) = driver_task.await {
        bail!("driver failed: {err}");
    }
    if let Ok(Err(err)) = operator_task.await {
        bail!("operator failed: {err}");
    }
    info!("simulation finished");
    Ok(())
}

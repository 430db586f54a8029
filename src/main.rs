//! IP Loan Relayer - cross-chain orchestration of IP-collateralised loans
//!
//! Watches the collateral manager on the source chain and the loan manager
//! on the destination chain, and drives each loan through lock, issuance,
//! repayment or default, and collateral release over a message relay.

use anyhow::Result;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

mod api;
mod chain;
mod config;
mod devnet;
mod error;
mod events;
mod ledger;
mod metadata;
mod metrics;
mod orchestrator;
mod relay;
mod state;
mod tx;
mod types;

use chain::{require_address, ChainPair};
use config::{LogFormat, Settings, TransportMode};
use devnet::Devnet;
use events::ObservedEvent;
use ledger::{EvmCollateralLedger, EvmLoanLedger};
use metadata::MetadataClient;
use metrics::MetricsServer;
use orchestrator::{Adapters, EngineConfig, LoanEngine};
use relay::MailboxRelay;
use state::{LoanStore, MemoryLoanStore, PgLoanStore};
use tx::TransactionSender;
use types::Clock;

/// Everything the engine and API need from one transport
struct Transport {
    config: EngineConfig,
    adapters: Adapters,
    events: broadcast::Receiver<ObservedEvent>,
    chains: Option<Arc<ChainPair>>,
    sender: Option<Arc<TransactionSender>>,
    devnet: Option<Arc<Devnet>>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let settings = Settings::load()?;

    // Initialize logging
    init_logging(settings.logging.format);

    info!("Starting IP Loan Relayer v{}", env!("CARGO_PKG_VERSION"));
    info!(
        "Instance {}: {:?} transport, domain {} ({}) -> domain {} ({})",
        settings.instance_id(),
        settings.relayer.transport,
        settings.source.domain,
        settings.source.name,
        settings.destination.domain,
        settings.destination.name
    );
    if !settings.has_route_to_destination() {
        warn!(
            "No route names destination domain {}; loan requests will be rejected",
            settings.destination.domain
        );
    }

    let store = open_store(&settings).await?;

    // Initialize metrics server
    let metrics_server = if settings.metrics.enabled {
        Some(MetricsServer::new(settings.metrics.port))
    } else {
        None
    };

    let transport = match settings.relayer.transport {
        TransportMode::Local => local_transport(&settings, store.clone()).await?,
        TransportMode::Evm => evm_transport(&settings, store.clone()).await?,
    };
    let Transport {
        config,
        adapters,
        events,
        chains,
        sender,
        devnet,
    } = transport;

    let collateral = adapters.collateral.clone();
    let engine = Arc::new(LoanEngine::new(config, store.clone(), adapters, Clock::System));
    engine.recover().await?;
    info!("Loan engine initialized");

    let mut handles: Vec<JoinHandle<()>> = Vec::new();

    if let Some(devnet) = &devnet {
        handles.extend(devnet.start());
    }

    // Start API server
    handles.push(tokio::spawn({
        let state = api::AppState {
            store: store.clone(),
            engine: engine.clone(),
            collateral,
            metadata: Arc::new(MetadataClient::new(&settings.metadata)?),
            chains: chains.clone(),
            devnet: devnet.clone(),
        };
        let config = settings.api.clone();
        async move {
            if let Err(e) = api::run_server(config, state).await {
                error!("API server error: {}", e);
            }
        }
    }));

    // Start metrics server
    if let Some(server) = metrics_server {
        handles.push(tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!("Metrics server error: {}", e);
            }
        }));
    }

    // Start chain listeners
    if let Some(chains) = &chains {
        let chains = chains.clone();
        handles.push(tokio::spawn(async move {
            if let Err(e) = chains.start_listeners().await {
                error!("Chain listener error: {}", e);
            }
        }));
    }

    // Start the loan engine
    handles.push(tokio::spawn({
        let engine = engine.clone();
        let tick_interval = settings.relayer.tick_interval();
        async move {
            if let Err(e) = engine.run(events, tick_interval).await {
                error!("Loan engine error: {}", e);
            }
        }
    }));

    // Health check loop
    handles.push(tokio::spawn({
        let chains = chains.clone();
        let sender = sender.clone();
        let store = store.clone();
        let interval = settings.relayer.health_check_interval_secs;
        async move {
            loop {
                tokio::time::sleep(tokio::time::Duration::from_secs(interval)).await;
                let mut healthy = true;

                // Check chain connections
                if let Some(chains) = &chains {
                    for (chain_id, ok) in chains.health_check().await {
                        if !ok {
                            warn!("Chain {} health check failed", chain_id);
                            healthy = false;
                        }
                    }
                }

                // Gas funds on both chains
                if let (Some(chains), Some(sender)) = (&chains, &sender) {
                    for chain_id in chains.chain_ids() {
                        match sender.get_balance(chain_id).await {
                            Ok(balance) => {
                                let eth = ethers::utils::format_ether(balance)
                                    .parse::<f64>()
                                    .unwrap_or(0.0);
                                metrics::record_wallet_balance(chain_id, eth);
                            }
                            Err(e) => warn!("Balance check failed on chain {}: {}", chain_id, e),
                        }
                    }
                }

                // Check loan store
                if let Err(e) = store.health_check().await {
                    warn!("Loan store health check failed: {}", e);
                    healthy = false;
                }

                if healthy {
                    metrics::record_health_check();
                } else {
                    metrics::record_health_check_failure();
                }
            }
        }
    }));

    info!("IP Loan Relayer is running");
    info!("API server: http://{}:{}", settings.api.host, settings.api.port);
    if settings.metrics.enabled {
        info!("Metrics: http://0.0.0.0:{}/metrics", settings.metrics.port);
    }

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutdown signal received, stopping...");

    // Graceful shutdown
    engine.stop().await;
    if let Some(chains) = &chains {
        chains.stop().await;
    }

    // Abort background tasks
    for handle in handles {
        handle.abort();
    }

    info!("IP Loan Relayer stopped");
    Ok(())
}

async fn open_store(settings: &Settings) -> Result<Arc<dyn LoanStore>> {
    match (&settings.database, settings.relayer.transport) {
        (Some(database), _) => {
            let store = PgLoanStore::new(database).await?;
            info!("Database connection established");
            store.run_migrations().await?;
            info!("Database migrations complete");
            Ok(Arc::new(store))
        }
        (None, TransportMode::Local) => {
            warn!("No database configured; loan records are kept in memory");
            Ok(Arc::new(MemoryLoanStore::new()))
        }
        (None, TransportMode::Evm) => {
            anyhow::bail!("the evm transport requires a [database] section")
        }
    }
}

async fn local_transport(settings: &Settings, store: Arc<dyn LoanStore>) -> Result<Transport> {
    let devnet = Arc::new(Devnet::new(settings, store).await?);
    info!("Local transport initialized");
    Ok(Transport {
        config: devnet.engine_config(),
        adapters: devnet.adapters(),
        events: devnet.subscribe_events(),
        chains: None,
        sender: None,
        devnet: Some(devnet),
    })
}

async fn evm_transport(settings: &Settings, store: Arc<dyn LoanStore>) -> Result<Transport> {
    let collateral_manager =
        require_address("collateral manager", &settings.source.collateral_manager)?;
    let ip_registry = require_address("IP registry", &settings.source.ip_registry)?;
    let loan_manager = require_address("loan manager", &settings.destination.loan_manager)?;
    let source_mailbox = require_address("source mailbox", &settings.source.mailbox)?;
    let destination_mailbox =
        require_address("destination mailbox", &settings.destination.mailbox)?;

    // Initialize chain pair (handles both chain connections)
    let chains = Arc::new(ChainPair::new(settings, store).await?);
    let events = chains.subscribe_events();
    info!("Chain connections initialized");

    let sender = Arc::new(TransactionSender::new(chains.clone(), settings).await?);
    info!("Relayer wallet {:?}", sender.wallet_address());

    let source = chains.source();
    let destination = chains.destination();
    let adapters = Adapters {
        collateral: Arc::new(EvmCollateralLedger::new(
            source.clone(),
            sender.clone(),
            collateral_manager,
            ip_registry,
        )),
        loans: Arc::new(EvmLoanLedger::new(
            destination.clone(),
            sender.clone(),
            loan_manager,
        )),
        source_relay: Arc::new(MailboxRelay::new(
            sender.clone(),
            source.chain_id(),
            settings.source.domain,
            source_mailbox,
        )),
        destination_relay: Arc::new(MailboxRelay::new(
            sender.clone(),
            destination.chain_id(),
            settings.destination.domain,
            destination_mailbox,
        )),
    };

    Ok(Transport {
        config: EngineConfig::new(settings, collateral_manager, loan_manager),
        adapters,
        events,
        chains: Some(chains),
        sender: Some(sender),
        devnet: None,
    })
}

fn init_logging(format: LogFormat) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("info,iploan_relayer=debug,sqlx=warn,hyper=warn")
    });

    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Json => registry.with(fmt::layer().json().with_target(true)).init(),
        LogFormat::Text => registry
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .init(),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

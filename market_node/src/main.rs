use anyhow::{bail, Context, Result};
use bmb_node::{
    api::{create_router, rate_limiter::RateLimiter, AppState, PaymentInfo},
    config::{NodeConfig, ObjectBackend, StorageBackend},
    events::EventManager,
    monitoring::ExpiryMonitor,
    payment::{
        ChainVerifier, Erc20Relay, FormatOnlyVerifier, PaymentVerifier, SettlementExecutor,
    },
    policy::SessionValidator,
    storage::{FsObjectStore, MarketStore, MemoryObjectStore, MemoryStorage, ObjectStore, Storage},
    MarketService,
};
use clap::Parser;
use log::{info, warn};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Marketplace node arguments
#[derive(Parser)]
#[clap(name = "bmb-node")]
#[clap(about = "Buy My Behavior marketplace node")]
struct Args {
    /// Path to node configuration file
    #[clap(long, default_value = "config/node.yaml")]
    config_path: PathBuf,

    /// Override the listen host
    #[clap(long)]
    host: Option<String>,

    /// Override the listen port
    #[clap(long)]
    port: Option<u16>,

    /// Print the effective configuration and exit
    #[clap(long)]
    print_config: bool,
}

fn open_storage(config: &NodeConfig) -> Result<Arc<dyn Storage>> {
    match config.storage.backend {
        StorageBackend::Memory => {
            warn!("Using in-memory storage; data is lost on restart");
            Ok(Arc::new(MemoryStorage::new()))
        }
        #[cfg(feature = "rocksdb")]
        StorageBackend::Rocksdb => {
            let db = bmb_node::storage::RocksDbStorage::new(&config.storage.data_dir)
                .with_context(|| format!("failed to open {:?}", config.storage.data_dir))?;
            info!("RocksDB storage opened at {:?}", config.storage.data_dir);
            Ok(Arc::new(db))
        }
        #[cfg(not(feature = "rocksdb"))]
        StorageBackend::Rocksdb => {
            bail!("storage.backend = rocksdb needs a build with the `rocksdb` feature")
        }
    }
}

fn open_objects(config: &NodeConfig) -> Arc<dyn ObjectStore> {
    let base_url = config.storage.public_base_url.clone();
    match config.storage.objects {
        ObjectBackend::Memory => Arc::new(MemoryObjectStore::new(base_url)),
        ObjectBackend::Fs => Arc::new(FsObjectStore::new(
            config.storage.objects_dir.clone(),
            base_url,
        )),
    }
}

fn payment_verifier(config: &NodeConfig) -> Result<Arc<dyn PaymentVerifier>> {
    let payment = &config.payment;
    match (
        &payment.rpc_url,
        &payment.usdt_contract_address,
        &payment.escrow_wallet_address,
    ) {
        (Some(rpc), Some(token), Some(escrow)) => {
            let verifier = ChainVerifier::new(rpc, token, escrow, payment.token_decimals)
                .context("invalid payment configuration")?;
            info!("Verifying payments on chain via {}", rpc);
            Ok(Arc::new(verifier))
        }
        _ => {
            warn!("Payment chain not configured; transaction hashes are only format-checked");
            Ok(Arc::new(FormatOnlyVerifier))
        }
    }
}

async fn settlement_executor(config: &NodeConfig) -> Result<Option<Arc<SettlementExecutor>>> {
    let payment = &config.payment;
    let (Some(key), Some(rpc), Some(token)) = (
        &payment.escrow_private_key,
        &payment.rpc_url,
        &payment.usdt_contract_address,
    ) else {
        info!("No escrow signer configured; settlements are recorded but not paid out");
        return Ok(None);
    };
    let relay = Erc20Relay::connect(
        rpc,
        key,
        token,
        payment.token_decimals,
        Duration::from_secs(payment.confirmation_timeout_secs),
    )
    .await
    .context("failed to connect the escrow signer")?;
    Ok(Some(Arc::new(SettlementExecutor::new(Arc::new(relay)))))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
    }
    info!("Shutdown signal received");
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    let mut config = NodeConfig::load(Some(&args.config_path))?;
    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if args.print_config {
        print!("{}", config.to_yaml()?);
        return Ok(());
    }

    info!("Starting BMB node v{}", env!("CARGO_PKG_VERSION"));
    info!("Config path: {:?}", args.config_path);

    let store = Arc::new(MarketStore::new(open_storage(&config)?));
    let objects = open_objects(&config);
    let events = Arc::new(EventManager::new(config.server.realtime_buffer));
    let verifier = payment_verifier(&config)?;

    let mut service = MarketService::new(store, events.clone(), verifier.clone(), objects.clone())
        .with_rules(config.market.clone())
        .with_platform_wallet(config.payment.platform_wallet_address.clone())
        .with_amount_scale(config.payment.token_decimals);
    if let Some(executor) = settlement_executor(&config).await? {
        service = service.with_settlement(executor);
    }
    let service = Arc::new(service);

    let monitor = ExpiryMonitor::new(
        service.clone(),
        Duration::from_secs(config.monitor.sweep_interval_secs),
    );
    monitor.start().await;

    let rate_limiter = Arc::new(RateLimiter::new(config.rate_limit.clone()));
    let cleanup_limiter = rate_limiter.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(300));
        loop {
            interval.tick().await;
            cleanup_limiter.cleanup_expired();
        }
    });

    let state = AppState {
        service,
        sessions: Arc::new(SessionValidator::new(
            &config.auth.jwt_secret,
            &config.auth.audience,
            config.auth.token_ttl_secs,
        )),
        events,
        rate_limiter,
        objects,
        verifier,
        payment: PaymentInfo {
            token_address: config.payment.usdt_contract_address.clone(),
            escrow_address: config.payment.escrow_wallet_address.clone(),
            token_decimals: config.payment.token_decimals,
            verifies_on_chain: config.payment.verifies_on_chain(),
        },
        max_upload_bytes: config.server.max_upload_bytes,
    };
    let app = create_router(state, &config.server);

    let addr = config.listen_addr();
    info!("Starting API server on {}", addr);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    monitor.stop().await;
    info!("BMB node stopped");
    Ok(())
}

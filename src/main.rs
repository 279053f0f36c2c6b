use anyhow::{Context, Result};
use clap::Parser;
use rust_decimal::Decimal;
use std::{net::SocketAddr, sync::Arc};
use tokio::{sync::mpsc, task::JoinSet};
use tracing::{error, info, warn};

use binary_options_engine::{
    api,
    config::Config,
    execution::{ExpiryScheduler, MemoryLedger, MemoryTradeStore, SettlementEngine, TradeStore},
    hub::PriceHub,
    shutdown::{wait_for_signal, Shutdown},
    streams::{spawn_dispatcher, IngestStats, TickIngestor},
    supervisor::{supervise, RestartPolicy},
    types::{AppState, TradeIdGenerator},
};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Symbols to stream (comma-separated)
    #[arg(short, long, env = "SYMBOLS", default_value = "BTCUSDT,ETHUSDT")]
    symbols: String,

    /// Port to run the web server on
    #[arg(short, long, env = "PORT", default_value = "8080")]
    port: u16,

    /// Combined-stream base URL of the exchange
    #[arg(long, env = "UPSTREAM_URL", default_value = "wss://stream.binance.com:9443")]
    upstream_url: String,

    /// Profit paid on a winning stake
    #[arg(long, env = "PAYOUT_RATE", default_value = "0.85")]
    payout_rate: Decimal,

    /// Seed for the payout PRNG (random when unset)
    #[arg(long, env = "SEED")]
    seed: Option<u64>,

    /// Opening balance of every demo wallet
    #[arg(long, env = "STARTING_BALANCE", default_value = "10000")]
    starting_balance: Decimal,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("binary_options_engine=info".parse()?),
        )
        .init();

    let args = Args::parse();

    let mut config = Config::default();
    config.ingest.symbols = args
        .symbols
        .split(',')
        .map(|s| s.trim().to_uppercase())
        .filter(|s| !s.is_empty())
        .collect();
    config.ingest.upstream_url = args.upstream_url.clone();
    config.engine.seed = args.seed;
    config.validate().context("invalid configuration")?;

    info!("Starting binary options engine");
    info!("Symbols: {}", config.ingest.symbols.join(","));
    info!("Upstream: {}", config.ingest.upstream_url);
    info!("Payout rate: {}", args.payout_rate);

    let shutdown = Shutdown::new();
    let hub = Arc::new(PriceHub::with_symbols(config.ingest.symbols.clone()));
    let trades: Arc<dyn TradeStore> = Arc::new(MemoryTradeStore::new());
    let ledger = Arc::new(MemoryLedger::new(args.starting_balance));
    let scheduler = Arc::new(ExpiryScheduler::new(config.engine.batch_window));
    let engine = Arc::new(SettlementEngine::new(
        config.engine.clone(),
        hub.clone(),
        trades,
        ledger.clone(),
        scheduler.clone(),
    ));
    engine
        .warm_start()
        .await
        .context("failed to load recent winners")?;

    // Ingestor -> dispatcher -> hub
    let (tick_tx, tick_rx) = mpsc::channel(config.ingest.publish_capacity);
    let ingest_stats = Arc::new(IngestStats::default());
    let dispatcher = spawn_dispatcher(hub.clone(), tick_rx);

    let policy = RestartPolicy::default();
    let mut tasks = JoinSet::new();

    {
        let ingest = config.ingest.clone();
        let stats = ingest_stats.clone();
        let sd = shutdown.clone();
        tasks.spawn(supervise("ingestor", policy, shutdown.clone(), move || {
            let ingestor = TickIngestor::new(ingest.clone(), tick_tx.clone(), stats.clone(), sd.clone());
            async move {
                match ingestor {
                    Ok(ingestor) => ingestor.run().await,
                    Err(e) => Err(anyhow::Error::new(e).context("failed to build tick ingestor")),
                }
            }
        }));
    }

    // Scheduler -> settlement processor
    let (batch_tx, batch_rx) = mpsc::channel(config.engine.batch_capacity);
    let batch_rx = Arc::new(tokio::sync::Mutex::new(batch_rx));
    {
        let scheduler = scheduler.clone();
        let sd = shutdown.clone();
        tasks.spawn(supervise("scheduler", policy, shutdown.clone(), move || {
            let (scheduler, tx, sd) = (scheduler.clone(), batch_tx.clone(), sd.clone());
            async move { scheduler.run(tx, sd).await }
        }));
    }
    // Runs until the scheduler task above exits and drops `batch_tx`
    {
        let engine = engine.clone();
        tasks.spawn(supervise("settlement", policy, shutdown.clone(), move || {
            let (engine, rx) = (engine.clone(), batch_rx.clone());
            async move { engine.run_batches(&rx).await }
        }));
    }
    {
        let engine = engine.clone();
        let sd = shutdown.clone();
        tasks.spawn(supervise("settlement-retry", policy, shutdown.clone(), move || {
            let (engine, sd) = (engine.clone(), sd.clone());
            async move { engine.run_retries(sd).await }
        }));
    }
    {
        let engine = engine.clone();
        let sd = shutdown.clone();
        tasks.spawn(supervise("winner-sweep", policy, shutdown.clone(), move || {
            let (engine, sd) = (engine.clone(), sd.clone());
            async move { engine.run_winner_sweep(sd).await }
        }));
    }

    let state = Arc::new(AppState {
        hub,
        engine,
        ledger,
        ingest_stats,
        session_config: config.session.clone(),
        trade_ids: TradeIdGenerator::from_clock(),
        payout_rate: args.payout_rate,
        shutdown: shutdown.clone(),
    });
    let app = api::router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], args.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("Server running at http://{}", addr);

    let server = {
        let sd = shutdown.clone();
        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { sd.cancelled().await })
                .await
        })
    };

    let mut failure = None;
    tokio::select! {
        _ = wait_for_signal() => info!("Shutting down"),
        Some(joined) = tasks.join_next() => match joined {
            Ok(Ok(())) => warn!("A background task exited early, shutting down"),
            Ok(Err(e)) => {
                error!("Background task failed: {:#}", e);
                failure = Some(e);
            }
            Err(e) => failure = Some(anyhow::Error::new(e).context("background task crashed")),
        },
    }

    shutdown.trigger();
    while let Some(joined) = tasks.join_next().await {
        if let Ok(Err(e)) = joined {
            warn!("Task failed while stopping: {:#}", e);
        }
    }
    server.await.context("server task crashed")??;
    let _ = dispatcher.await;

    info!("Shutdown complete");
    match failure {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

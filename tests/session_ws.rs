use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::{SinkExt, StreamExt};
use rust_decimal_macros::dec;
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

use binary_options_engine::{
    api,
    config::{Config, EngineConfig},
    execution::{Direction, ExpiryScheduler, MemoryLedger, MemoryTradeStore, SettlementEngine, TradeOrder},
    hub::PriceHub,
    shutdown::Shutdown,
    streams::IngestStats,
    types::{AppState, PriceTick, TradeIdGenerator},
};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct Server {
    addr: std::net::SocketAddr,
    hub: Arc<PriceHub>,
    engine: Arc<SettlementEngine>,
    shutdown: Shutdown,
}

async fn start_server() -> Server {
    let config = Config::default();
    let shutdown = Shutdown::new();
    let hub = Arc::new(PriceHub::with_symbols(["BTCUSDT", "ETHUSDT"]));
    let ledger = Arc::new(MemoryLedger::new(dec!(1000)));
    let scheduler = Arc::new(ExpiryScheduler::new(config.engine.batch_window));
    let engine = Arc::new(SettlementEngine::new(
        EngineConfig {
            seed: Some(1),
            ..config.engine.clone()
        },
        hub.clone(),
        Arc::new(MemoryTradeStore::new()),
        ledger.clone(),
        scheduler,
    ));

    let state = Arc::new(AppState {
        hub: hub.clone(),
        engine: engine.clone(),
        ledger,
        ingest_stats: Arc::new(IngestStats::default()),
        session_config: config.session.clone(),
        trade_ids: TradeIdGenerator::starting_at(1),
        payout_rate: dec!(0.85),
        shutdown: shutdown.clone(),
    });

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = api::router(state);
    let sd = shutdown.clone();
    tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { sd.cancelled().await })
            .await
            .unwrap();
    });

    Server {
        addr,
        hub,
        engine,
        shutdown,
    }
}

async fn connect(server: &Server, user_id: u64) -> Client {
    let url = format!("ws://{}/ws?userId={}", server.addr, user_id);
    let (ws, _) = connect_async(url).await.unwrap();
    ws
}

/// Poll until `check` holds, failing after a few seconds
async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

/// Next JSON frame from the server, skipping control frames
async fn next_json(ws: &mut Client) -> Value {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("server frame within 5s")
            .expect("stream open")
            .unwrap();
        if let Message::Text(text) = frame {
            return serde_json::from_str(text.as_str()).unwrap();
        }
    }
}

fn tick(symbol: &str, price: rust_decimal::Decimal) -> PriceTick {
    PriceTick::new(symbol, price, dec!(1), Utc::now()).unwrap()
}

#[tokio::test]
async fn test_subscribe_receives_price_updates_in_order() {
    let server = start_server().await;
    let mut ws = connect(&server, 0).await;
    eventually(|| server.hub.connected_count() == 1).await;

    ws.send(Message::Text(r#"{"action":"subscribe","symbol":"btcusdt"}"#.into()))
        .await
        .unwrap();
    eventually(|| server.hub.subscriber_count("BTCUSDT") == 1).await;

    server.hub.publish(tick("BTCUSDT", dec!(30000)));
    server.hub.publish(tick("ETHUSDT", dec!(2000)));
    server.hub.publish(tick("BTCUSDT", dec!(30001)));

    let first = next_json(&mut ws).await;
    assert_eq!(first["type"], "price_update");
    assert_eq!(first["data"]["symbol"], "BTCUSDT");
    assert_eq!(first["data"]["price"], "30000");

    let second = next_json(&mut ws).await;
    assert_eq!(second["data"]["price"], "30001");

    server.shutdown.trigger();
}

#[tokio::test]
async fn test_unknown_action_gets_error_frame() {
    let server = start_server().await;
    let mut ws = connect(&server, 0).await;
    eventually(|| server.hub.connected_count() == 1).await;

    ws.send(Message::Text(r#"{"action":"trade","symbol":"BTCUSDT"}"#.into()))
        .await
        .unwrap();
    let frame = next_json(&mut ws).await;
    assert_eq!(frame["type"], "error");
    assert!(frame["data"]["message"].as_str().unwrap().contains("unknown action"));

    // The session survives a rejected command.
    assert_eq!(server.hub.connected_count(), 1);
    server.shutdown.trigger();
}

#[tokio::test]
async fn test_trade_result_reaches_owner() {
    let server = start_server().await;
    let mut ws = connect(&server, 42).await;
    eventually(|| server.hub.connected_count() == 1).await;

    server.hub.publish(tick("BTCUSDT", dec!(30000)));
    let order = TradeOrder {
        id: 1,
        user_id: 42,
        symbol: "BTCUSDT".to_string(),
        direction: Direction::Up,
        amount: dec!(100),
        payout_rate: dec!(0.85),
        duration_sec: 30,
        is_demo: true,
    };
    server.engine.place_trade(order).await.unwrap();
    server.hub.publish(tick("BTCUSDT", dec!(30100)));
    server.engine.settle_batch(&[1]).await;

    let frame = next_json(&mut ws).await;
    assert_eq!(frame["type"], "trade_result");
    assert_eq!(frame["data"]["tradeId"], 1);
    assert_eq!(frame["data"]["status"], "WON");
    server.shutdown.trigger();
}

#[tokio::test]
async fn test_client_close_deregisters_session() {
    let server = start_server().await;
    let mut ws = connect(&server, 7).await;
    eventually(|| server.hub.connected_count() == 1).await;

    ws.close(None).await.unwrap();
    eventually(|| server.hub.connected_count() == 0).await;
    server.shutdown.trigger();
}

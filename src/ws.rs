//! Client websocket sessions
//!
//! Each connection gets a `SessionHandle` registered with the hub and two
//! tasks: a reader that applies subscribe/unsubscribe commands and a writer
//! that drains the outbound queue and keeps the heartbeat.

use axum::{
    body::Bytes,
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::HeaderMap,
    response::IntoResponse,
};
use chrono::Utc;
use futures::stream::SplitStream;
use futures::{Sink, SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, timeout, Instant};
use tracing::{debug, error, info, warn};

use crate::api::caller_id;
use crate::config::SessionConfig;
use crate::hub::{Enqueue, PriceHub, SessionHandle};
use crate::shutdown::Shutdown;
use crate::types::{AppState, ClientCommand, ClientMessage, ServerMessage};

#[derive(Debug, Deserialize)]
pub struct WsParams {
    #[serde(rename = "userId", alias = "user_id")]
    pub user_id: Option<u64>,
}

/// Why a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Teardown {
    ClientClosed,
    ReadError,
    Evicted,
    HeartbeatTimeout,
    WriteFailed,
    Shutdown,
    Aborted,
}

impl std::fmt::Display for Teardown {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let reason = match self {
            Self::ClientClosed => "client closed",
            Self::ReadError => "read error",
            Self::Evicted => "evicted",
            Self::HeartbeatTimeout => "heartbeat timeout",
            Self::WriteFailed => "write failed",
            Self::Shutdown => "server shutdown",
            Self::Aborted => "aborted",
        };
        f.write_str(reason)
    }
}

/// GET /ws - upgrade to a client session. The user comes from the
/// `x-user-id` header or the `userId` query parameter; 0 is anonymous.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    Query(params): Query<WsParams>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let user_id = caller_id(&headers).or(params.user_id).unwrap_or(0);
    ws.on_upgrade(move |socket| handle_socket(socket, state, user_id))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>, user_id: u64) {
    let config = state.session_config.clone();
    let (session, outbound) = SessionHandle::new(user_id, config.queue_capacity);
    state.hub.register(session.clone());
    info!("Session {} connected (user {})", session.id(), user_id);

    let (sender, receiver) = socket.split();

    let mut send_task = tokio::spawn(write_loop(
        sender,
        outbound,
        session.clone(),
        config,
        state.shutdown.clone(),
    ));
    let mut recv_task = tokio::spawn(read_loop(receiver, session.clone(), state.hub.clone()));

    // Whichever side finishes first ends the session
    let reason = tokio::select! {
        reason = &mut send_task => {
            recv_task.abort();
            reason.unwrap_or(Teardown::Aborted)
        }
        reason = &mut recv_task => {
            send_task.abort();
            reason.unwrap_or(Teardown::Aborted)
        }
    };

    state.hub.deregister(session.id());
    info!("Session {} disconnected: {}", session.id(), reason);
}

async fn read_loop(
    mut receiver: SplitStream<WebSocket>,
    session: Arc<SessionHandle>,
    hub: Arc<PriceHub>,
) -> Teardown {
    loop {
        let frame = tokio::select! {
            _ = session.closed() => return Teardown::Evicted,
            frame = receiver.next() => frame,
        };

        match frame {
            Some(Ok(Message::Text(text))) => apply_command(text.as_str(), &session, &hub),
            Some(Ok(Message::Pong(_))) => session.record_pong(),
            Some(Ok(Message::Close(_))) | None => return Teardown::ClientClosed,
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                debug!("Session {} read error: {}", session.id(), e);
                return Teardown::ReadError;
            }
        }
    }
}

/// Apply one client command; rejected commands are answered with an error frame
pub fn apply_command(text: &str, session: &SessionHandle, hub: &PriceHub) {
    let command = serde_json::from_str::<ClientMessage>(text)
        .map_err(|e| format!("invalid command: {e}"))
        .and_then(ClientMessage::into_command);

    let result = match command {
        Ok(ClientCommand::Subscribe(symbol)) => hub
            .subscribe(session.id(), &symbol)
            .map_err(|e| e.to_string()),
        Ok(ClientCommand::Unsubscribe(symbol)) => {
            hub.unsubscribe(session.id(), &symbol);
            Ok(())
        }
        Err(message) => Err(message),
    };

    if let Err(message) = result {
        debug!("Session {} command rejected: {}", session.id(), message);
        if session.try_enqueue(ServerMessage::Error { message }) == Enqueue::Full {
            session.close();
        }
    }
}

/// Writer side of a session over any message sink
pub async fn write_loop<S>(
    mut sender: S,
    mut outbound: mpsc::Receiver<ServerMessage>,
    session: Arc<SessionHandle>,
    config: SessionConfig,
    shutdown: Shutdown,
) -> Teardown
where
    S: Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    let reason = write_frames(&mut sender, &mut outbound, &session, &config, &shutdown).await;
    if reason == Teardown::Shutdown {
        drain(&mut sender, &mut outbound, &config).await;
    }
    let _ = timeout(Duration::from_secs(1), sender.close()).await;
    reason
}

async fn write_frames<S>(
    sender: &mut S,
    outbound: &mut mpsc::Receiver<ServerMessage>,
    session: &SessionHandle,
    config: &SessionConfig,
    shutdown: &Shutdown,
) -> Teardown
where
    S: Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    let mut ping = tokio::time::interval_at(Instant::now() + config.ping_interval, config.ping_interval);
    // Send time of the oldest ping not yet answered
    let mut unanswered: Option<Instant> = None;

    loop {
        let pong_deadline = unanswered.map_or_else(Instant::now, |sent| sent + config.pong_grace);

        tokio::select! {
            biased;
            _ = shutdown.cancelled() => return Teardown::Shutdown,
            _ = session.closed() => return Teardown::Evicted,
            msg = outbound.recv() => {
                let Some(msg) = msg else { return Teardown::Evicted };
                if let Err(reason) = send_message(sender, &msg, config.write_timeout).await {
                    return reason;
                }
            }
            _ = ping.tick() => {
                if unanswered.is_some_and(|sent| session.last_pong() >= sent) {
                    unanswered = None;
                }
                if let Err(reason) = send_frame(sender, Message::Ping(Bytes::new()), config.write_timeout).await {
                    return reason;
                }
                let heartbeat = ServerMessage::Heartbeat { timestamp: Utc::now().timestamp_millis() };
                if let Err(reason) = send_message(sender, &heartbeat, config.write_timeout).await {
                    return reason;
                }
                unanswered.get_or_insert_with(Instant::now);
            }
            _ = sleep_until(pong_deadline), if unanswered.is_some() => {
                if unanswered.is_some_and(|sent| session.last_pong() < sent) {
                    warn!("Session {} missed its pong, terminating", session.id());
                    return Teardown::HeartbeatTimeout;
                }
                unanswered = None;
            }
        }
    }
}

/// Flush queued messages for at most the drain timeout
async fn drain<S>(sender: &mut S, outbound: &mut mpsc::Receiver<ServerMessage>, config: &SessionConfig)
where
    S: Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    let flush = async {
        while let Ok(msg) = outbound.try_recv() {
            if send_message(sender, &msg, config.write_timeout).await.is_err() {
                break;
            }
        }
    };
    if timeout(config.drain_timeout, flush).await.is_err() {
        debug!("Queue drain cut off after {:?}", config.drain_timeout);
    }
}

async fn send_message<S>(sender: &mut S, msg: &ServerMessage, write_timeout: Duration) -> Result<(), Teardown>
where
    S: Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    let json = match serde_json::to_string(msg) {
        Ok(json) => json,
        Err(e) => {
            error!("Failed to encode outbound message: {}", e);
            return Ok(());
        }
    };
    send_frame(sender, Message::Text(json.into()), write_timeout).await
}

async fn send_frame<S>(sender: &mut S, frame: Message, write_timeout: Duration) -> Result<(), Teardown>
where
    S: Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    match timeout(write_timeout, sender.send(frame)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => {
            debug!("Socket write failed: {}", e);
            Err(Teardown::WriteFailed)
        }
        Err(_) => {
            warn!("Socket write exceeded {:?}", write_timeout);
            Err(Teardown::WriteFailed)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn error_message(rx: &mut mpsc::Receiver<ServerMessage>) -> String {
        match rx.try_recv() {
            Ok(ServerMessage::Error { message }) => message,
            other => panic!("expected error frame, got {other:?}"),
        }
    }

    #[test]
    fn test_subscribe_and_unsubscribe_commands() {
        let hub = PriceHub::new();
        let (session, mut rx) = SessionHandle::new(0, 8);
        hub.register(session.clone());

        apply_command(r#"{"action":"subscribe","symbol":"btcusdt"}"#, &session, &hub);
        assert!(hub.is_subscribed(session.id(), "BTCUSDT"));
        assert!(rx.try_recv().is_err());

        apply_command(r#"{"action":"unsubscribe","symbol":"BTCUSDT"}"#, &session, &hub);
        assert!(!hub.is_subscribed(session.id(), "BTCUSDT"));
    }

    #[test]
    fn test_rejected_commands_get_error_frames() {
        let hub = PriceHub::with_symbols(["BTCUSDT"]);
        let (session, mut rx) = SessionHandle::new(0, 8);
        hub.register(session.clone());

        apply_command(r#"{"action":"buy","symbol":"BTCUSDT"}"#, &session, &hub);
        assert!(error_message(&mut rx).contains("unknown action"));

        apply_command("not json", &session, &hub);
        assert!(error_message(&mut rx).starts_with("invalid command"));

        apply_command(r#"{"action":"subscribe","symbol":"DOGEUSDT"}"#, &session, &hub);
        assert!(error_message(&mut rx).contains("DOGEUSDT"));
        assert!(!session.is_closed());
    }

    #[test]
    fn test_error_on_full_queue_closes_session() {
        let hub = PriceHub::new();
        let (session, _rx) = SessionHandle::new(0, 1);
        hub.register(session.clone());

        apply_command("{}", &session, &hub);
        apply_command("{}", &session, &hub);
        assert!(session.is_closed());
    }

    type Frames = futures::channel::mpsc::UnboundedReceiver<Message>;

    fn spawn_writer(
        session: &Arc<SessionHandle>,
        outbound: mpsc::Receiver<ServerMessage>,
        shutdown: &Shutdown,
    ) -> (tokio::task::JoinHandle<Teardown>, Frames) {
        let (sink, frames) = futures::channel::mpsc::unbounded();
        let task = tokio::spawn(write_loop(
            sink,
            outbound,
            session.clone(),
            SessionConfig::default(),
            shutdown.clone(),
        ));
        (task, frames)
    }

    /// Wait for the next ping followed by its heartbeat frame
    async fn expect_ping_and_heartbeat(frames: &mut Frames) {
        assert!(matches!(frames.next().await, Some(Message::Ping(_))));
        match frames.next().await {
            Some(Message::Text(text)) => assert!(text.as_str().contains(r#""type":"heartbeat""#)),
            other => panic!("expected heartbeat, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_ping_and_heartbeat_every_interval() {
        let (session, outbound) = SessionHandle::new(0, 8);
        let shutdown = Shutdown::new();
        let (task, mut frames) = spawn_writer(&session, outbound, &shutdown);
        let start = Instant::now();

        for round in 1..=4u32 {
            expect_ping_and_heartbeat(&mut frames).await;
            assert_eq!(start.elapsed(), Duration::from_secs(30) * round);
            session.record_pong();
        }
        assert!(!task.is_finished());

        shutdown.trigger();
        assert_eq!(task.await.unwrap(), Teardown::Shutdown);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_pong_ends_session() {
        let (session, outbound) = SessionHandle::new(0, 8);
        let shutdown = Shutdown::new();
        let (task, mut frames) = spawn_writer(&session, outbound, &shutdown);
        let start = Instant::now();

        assert_eq!(task.await.unwrap(), Teardown::HeartbeatTimeout);
        // First ping at 30s, then 45s of grace.
        assert_eq!(start.elapsed(), Duration::from_secs(75));
        expect_ping_and_heartbeat(&mut frames).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_flushes_queued_messages() {
        let (session, outbound) = SessionHandle::new(0, 8);
        for ts in 1..=3 {
            assert_eq!(session.try_enqueue(ServerMessage::Heartbeat { timestamp: ts }), Enqueue::Delivered);
        }
        let shutdown = Shutdown::new();
        shutdown.trigger();

        let (task, frames) = spawn_writer(&session, outbound, &shutdown);
        assert_eq!(task.await.unwrap(), Teardown::Shutdown);

        // The sink is closed after the drain, so the stream ends.
        let sent: Vec<Message> = frames.collect().await;
        assert_eq!(sent.len(), 3);
        assert!(matches!(&sent[2], Message::Text(t) if t.as_str().contains(r#""timestamp":3"#)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_is_cut_off_by_stalled_socket() {
        let (session, outbound) = SessionHandle::new(0, 8);
        for ts in 1..=5 {
            session.try_enqueue(ServerMessage::Heartbeat { timestamp: ts });
        }
        let shutdown = Shutdown::new();
        shutdown.trigger();

        // Nobody reads this channel, so every write stalls.
        let (sink, _frames) = futures::channel::mpsc::channel::<Message>(0);
        let start = Instant::now();
        let reason = write_loop(sink, outbound, session.clone(), SessionConfig::default(), shutdown).await;

        assert_eq!(reason, Teardown::Shutdown);
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(2) && elapsed <= Duration::from_secs(3), "{elapsed:?}");
    }

    #[test]
    fn test_teardown_reasons() {
        assert_eq!(Teardown::HeartbeatTimeout.to_string(), "heartbeat timeout");
        assert_eq!(Teardown::Evicted.to_string(), "evicted");
    }
}

//! Hub-side handle for one client session

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use uuid::Uuid;

use crate::types::ServerMessage;

pub type SessionId = Uuid;

/// Result of a non-blocking enqueue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueue {
    Delivered,
    /// Queue at capacity: the session is a slow consumer
    Full,
    /// Session already torn down
    Closed,
}

/// Shared between the hub (producer side) and the session's socket loops.
#[derive(Debug)]
pub struct SessionHandle {
    id: SessionId,
    user_id: u64,
    tx: mpsc::Sender<ServerMessage>,
    closed: watch::Sender<bool>,
    last_pong: Mutex<Instant>,
}

impl SessionHandle {
    /// Create a handle with a bounded outbound queue; the receiver goes to the writer loop.
    pub fn new(user_id: u64, capacity: usize) -> (Arc<Self>, mpsc::Receiver<ServerMessage>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let (closed, _) = watch::channel(false);
        let handle = Arc::new(Self {
            id: Uuid::new_v4(),
            user_id,
            tx,
            closed,
            last_pong: Mutex::new(Instant::now()),
        });
        (handle, rx)
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    /// 0 means anonymous
    pub fn user_id(&self) -> u64 {
        self.user_id
    }

    pub fn try_enqueue(&self, msg: ServerMessage) -> Enqueue {
        if self.is_closed() {
            return Enqueue::Closed;
        }
        match self.tx.try_send(msg) {
            Ok(()) => Enqueue::Delivered,
            Err(mpsc::error::TrySendError::Full(_)) => Enqueue::Full,
            Err(mpsc::error::TrySendError::Closed(_)) => Enqueue::Closed,
        }
    }

    /// Mark the session for teardown; its socket loops observe this and exit.
    pub fn close(&self) {
        self.closed.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Resolves once `close` has been called
    pub async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    pub fn record_pong(&self) {
        *self.last_pong.lock() = Instant::now();
    }

    pub fn last_pong(&self) -> Instant {
        *self.last_pong.lock()
    }
}

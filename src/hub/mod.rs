//! Price hub: last-price cache and per-symbol fan-out to client sessions
//!
//! One producer (the ingest dispatcher) publishes ticks; sessions subscribe
//! and unsubscribe; the settlement engine reads snapshots and pushes
//! per-user notifications. Enqueue is always non-blocking and a session whose
//! queue is full is evicted in the same pass.

mod session;

pub use session::{Enqueue, SessionHandle, SessionId};

use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::{EngineError, EngineResult};
use crate::types::{PriceTick, ServerMessage};

#[derive(Default)]
struct SymbolState {
    last: Option<PriceTick>,
    subscribers: HashMap<SessionId, Arc<SessionHandle>>,
}

#[derive(Default)]
struct HubState {
    symbols: HashMap<String, SymbolState>,
    sessions: HashMap<SessionId, Arc<SessionHandle>>,
    by_user: HashMap<u64, HashSet<SessionId>>,
}

pub struct PriceHub {
    /// Symbols sessions may subscribe to; empty accepts any symbol
    known: HashSet<String>,
    state: RwLock<HubState>,
    published: AtomicU64,
    evicted: AtomicU64,
}

impl PriceHub {
    /// Hub that accepts subscriptions for any symbol
    pub fn new() -> Self {
        Self::with_symbols(Vec::<String>::new())
    }

    /// Hub restricted to a known symbol list
    pub fn with_symbols<I, S>(symbols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            known: symbols.into_iter().map(|s| s.into().to_uppercase()).collect(),
            state: RwLock::new(HubState::default()),
            published: AtomicU64::new(0),
            evicted: AtomicU64::new(0),
        }
    }

    /// Make a session reachable for subscriptions and user notifications
    pub fn register(&self, session: Arc<SessionHandle>) {
        let mut state = self.state.write();
        if session.user_id() != 0 {
            state
                .by_user
                .entry(session.user_id())
                .or_default()
                .insert(session.id());
        }
        state.sessions.insert(session.id(), session);
    }

    /// Remove a session from every symbol set and the user index, then close it
    pub fn deregister(&self, session_id: SessionId) -> bool {
        let removed = {
            let mut state = self.state.write();
            let removed = state.sessions.remove(&session_id);
            for symbol in state.symbols.values_mut() {
                symbol.subscribers.remove(&session_id);
            }
            if let Some(session) = &removed {
                let user_id = session.user_id();
                if let Some(ids) = state.by_user.get_mut(&user_id) {
                    ids.remove(&session_id);
                    if ids.is_empty() {
                        state.by_user.remove(&user_id);
                    }
                }
            }
            removed
        };

        match removed {
            Some(session) => {
                session.close();
                true
            }
            None => false,
        }
    }

    /// Idempotent; fails for unregistered sessions or unknown symbols
    pub fn subscribe(&self, session_id: SessionId, symbol: &str) -> EngineResult<()> {
        let symbol = symbol.to_uppercase();
        if !self.known.is_empty() && !self.known.contains(&symbol) {
            return Err(EngineError::InvalidSymbol { symbol });
        }

        let mut state = self.state.write();
        let session = state
            .sessions
            .get(&session_id)
            .cloned()
            .ok_or_else(|| EngineError::unavailable(format!("session {session_id} is not connected")))?;
        state
            .symbols
            .entry(symbol)
            .or_default()
            .subscribers
            .insert(session_id, session);
        Ok(())
    }

    /// Idempotent; returns whether the session was subscribed
    pub fn unsubscribe(&self, session_id: SessionId, symbol: &str) -> bool {
        let symbol = symbol.to_uppercase();
        let mut state = self.state.write();
        state
            .symbols
            .get_mut(&symbol)
            .map(|s| s.subscribers.remove(&session_id).is_some())
            .unwrap_or(false)
    }

    /// Cache the tick as the symbol's last price and fan it out.
    /// Returns the number of sessions the update was queued for.
    pub fn publish(&self, tick: PriceTick) -> usize {
        let message = ServerMessage::PriceUpdate(tick.to_update());
        let subscribers: Vec<Arc<SessionHandle>> = {
            let mut state = self.state.write();
            let symbol = state.symbols.entry(tick.symbol.clone()).or_default();
            symbol.last = Some(tick);
            symbol.subscribers.values().cloned().collect()
        };
        self.published.fetch_add(1, Ordering::Relaxed);

        let mut delivered = 0;
        let mut slow = Vec::new();
        for session in subscribers {
            match session.try_enqueue(message.clone()) {
                Enqueue::Delivered => delivered += 1,
                Enqueue::Full => slow.push(session.id()),
                Enqueue::Closed => {
                    self.deregister(session.id());
                }
            }
        }
        for session_id in slow {
            self.evict(session_id);
        }
        delivered
    }

    /// Last cached tick for a symbol
    pub fn snapshot(&self, symbol: &str) -> Option<PriceTick> {
        let state = self.state.read();
        state.symbols.get(symbol).and_then(|s| s.last.clone())
    }

    /// Queue a message for every live session of a user. Returns the delivery count.
    pub fn notify_user(&self, user_id: u64, message: ServerMessage) -> usize {
        let sessions: Vec<Arc<SessionHandle>> = {
            let state = self.state.read();
            match state.by_user.get(&user_id) {
                Some(ids) => ids
                    .iter()
                    .filter_map(|id| state.sessions.get(id).cloned())
                    .collect(),
                None => return 0,
            }
        };

        let mut delivered = 0;
        for session in sessions {
            match session.try_enqueue(message.clone()) {
                Enqueue::Delivered => delivered += 1,
                Enqueue::Full => self.evict(session.id()),
                Enqueue::Closed => {
                    self.deregister(session.id());
                }
            }
        }
        if delivered == 0 {
            debug!("No live session for user {}, notification dropped", user_id);
        }
        delivered
    }

    pub fn connected_count(&self) -> usize {
        self.state.read().sessions.len()
    }

    pub fn subscriber_count(&self, symbol: &str) -> usize {
        self.state
            .read()
            .symbols
            .get(symbol)
            .map(|s| s.subscribers.len())
            .unwrap_or(0)
    }

    pub fn is_subscribed(&self, session_id: SessionId, symbol: &str) -> bool {
        self.state
            .read()
            .symbols
            .get(symbol)
            .map(|s| s.subscribers.contains_key(&session_id))
            .unwrap_or(false)
    }

    pub fn published_count(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    pub fn evicted_count(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }

    fn evict(&self, session_id: SessionId) {
        if self.deregister(session_id) {
            self.evicted.fetch_add(1, Ordering::Relaxed);
            warn!("Evicted slow consumer session {}", session_id);
        }
    }
}

impl Default for PriceHub {
    fn default() -> Self {
        Self::new()
    }
}

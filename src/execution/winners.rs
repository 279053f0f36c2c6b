//! Recent-winner records backing the payout cooldown

use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, HashSet};

/// Last win time per user, kept for one cooldown window
#[derive(Debug, Clone)]
pub struct WinnerRecords {
    window: Duration,
    last_win: HashMap<u64, DateTime<Utc>>,
}

impl WinnerRecords {
    pub fn new(window: std::time::Duration) -> Self {
        Self {
            window: Duration::from_std(window).unwrap_or_else(|_| Duration::hours(24)),
            last_win: HashMap::new(),
        }
    }

    /// Warm start from users the store reports as recent winners
    pub fn seed<I: IntoIterator<Item = u64>>(&mut self, users: I, at: DateTime<Utc>) {
        for user in users {
            self.record(user, at);
        }
    }

    pub fn record(&mut self, user_id: u64, at: DateTime<Utc>) {
        let entry = self.last_win.entry(user_id).or_insert(at);
        if at > *entry {
            *entry = at;
        }
    }

    /// Users whose last win falls inside the window ending at `now`
    pub fn recent(&self, now: DateTime<Utc>) -> HashSet<u64> {
        let cutoff = now - self.window;
        self.last_win
            .iter()
            .filter(|(_, at)| **at > cutoff)
            .map(|(user, _)| *user)
            .collect()
    }

    /// Drop records older than the window; returns how many were removed
    pub fn sweep(&mut self, now: DateTime<Utc>) -> usize {
        let cutoff = now - self.window;
        let before = self.last_win.len();
        self.last_win.retain(|_, at| *at > cutoff);
        before - self.last_win.len()
    }

    pub fn len(&self) -> usize {
        self.last_win.len()
    }

    pub fn is_empty(&self) -> bool {
        self.last_win.is_empty()
    }
}

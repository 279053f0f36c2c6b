//! Payout-selection policy over one expiry batch
//!
//! Pure functions: the caller supplies the batch, the users on cooldown and
//! the PRNG, so a seeded generator makes every run reproducible.

use rand::seq::SliceRandom;
use rand::Rng;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::collections::HashSet;

use super::trade::Direction;
use crate::config::PolicyConfig;

/// One trade as seen by the policy
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub trade_id: u64,
    pub user_id: u64,
    pub amount: Decimal,
}

/// Winner counts derived from the batch size
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WinnerTargets {
    pub total: usize,
    pub small: usize,
    pub big: usize,
    pub repeat: usize,
}

impl WinnerTargets {
    pub fn for_batch(n: usize, config: &PolicyConfig) -> Self {
        let total = floor_mul(n, config.winner_ratio).max(1);
        let small = floor_mul(total, config.small_winner_ratio);
        Self {
            total,
            small,
            big: total - small,
            repeat: floor_mul(total, config.repeat_winner_ratio),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selection {
    /// Users whose trades in this batch win
    pub winners: HashSet<u64>,
    pub small_picked: usize,
    pub big_picked: usize,
    pub repeat_picked: usize,
}

impl Selection {
    pub fn is_winner(&self, user_id: u64) -> bool {
        self.winners.contains(&user_id)
    }
}

/// Pick the winning users of a batch.
///
/// The batch is sorted by amount; users not on cooldown form the eligible
/// set, split at `floor(len/2)` into a lower and an upper pool. Small winners
/// come from the lower pool, big winners from the upper one, and a small
/// quota of repeat winners from the users on cooldown. A pool smaller than
/// its quota is taken whole and never spills into another pool.
///
/// The split count is the eligible set's length, not the batch size `n`;
/// only the winner targets are derived from `n`.
pub fn select_winners<R: Rng + ?Sized>(
    batch: &[Candidate],
    on_cooldown: &HashSet<u64>,
    config: &PolicyConfig,
    rng: &mut R,
) -> Selection {
    if batch.is_empty() {
        return Selection::default();
    }

    let mut sorted: Vec<&Candidate> = batch.iter().collect();
    sorted.sort_by(|a, b| a.amount.cmp(&b.amount).then(a.trade_id.cmp(&b.trade_id)));

    let targets = WinnerTargets::for_batch(sorted.len(), config);
    let (eligible, repeat): (Vec<&Candidate>, Vec<&Candidate>) = sorted
        .into_iter()
        .partition(|c| !on_cooldown.contains(&c.user_id));

    // Halves of the eligible set, not of the whole batch
    let mid = eligible.len() / 2;
    let mut selection = Selection::default();

    let lower = distinct_users(&eligible[..mid], &selection.winners);
    selection.small_picked = pick(&lower, targets.small, rng, &mut selection.winners);

    let upper = distinct_users(&eligible[mid..], &selection.winners);
    selection.big_picked = pick(&upper, targets.big, rng, &mut selection.winners);

    let repeaters = distinct_users(&repeat, &selection.winners);
    selection.repeat_picked = pick(&repeaters, targets.repeat, rng, &mut selection.winners);

    selection
}

/// Draw a nudge factor uniformly from the configured epsilon range (7 decimal places)
pub fn sample_epsilon<R: Rng + ?Sized>(config: &PolicyConfig, rng: &mut R) -> Decimal {
    const SCALE: u32 = 7;
    let unit = Decimal::from(10i64.pow(SCALE));
    let lo = (config.epsilon_min * unit).trunc().to_i64().unwrap_or(1);
    let hi = (config.epsilon_max * unit).trunc().to_i64().unwrap_or(lo).max(lo);
    Decimal::new(rng.gen_range(lo..=hi), SCALE)
}

/// Exit price moved away from `baseline` by `epsilon`: in the trade's favour
/// for winners, against it for losers.
pub fn exit_price(baseline: Decimal, direction: Direction, won: bool, epsilon: Decimal) -> Decimal {
    let moves_up = (direction == Direction::Up) == won;
    let factor = if moves_up {
        Decimal::ONE + epsilon
    } else {
        Decimal::ONE - epsilon
    };
    (baseline * factor).round_dp(8)
}

fn floor_mul(n: usize, ratio: Decimal) -> usize {
    (Decimal::from(n) * ratio).floor().to_usize().unwrap_or(0)
}

fn distinct_users(pool: &[&Candidate], exclude: &HashSet<u64>) -> Vec<u64> {
    let mut seen = HashSet::new();
    pool.iter()
        .map(|c| c.user_id)
        .filter(|u| !exclude.contains(u) && seen.insert(*u))
        .collect()
}

fn pick<R: Rng + ?Sized>(pool: &[u64], count: usize, rng: &mut R, winners: &mut HashSet<u64>) -> usize {
    let mut picked = 0;
    for user in pool.choose_multiple(rng, count) {
        winners.insert(*user);
        picked += 1;
    }
    picked
}

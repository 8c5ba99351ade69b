//! Per-client request throttling for speculative navigation.
//!
//! Every `mayLaunchUrl` a client issues is a prediction. Predictions that turn
//! into real navigations keep the client unthrottled; each consecutive
//! prediction that never materializes doubles the delay the client must wait
//! before the next one is accepted.
//!
//! # Algorithm
//!
//! - Each client (by uid) keeps a short ring of recent predictions.
//! - Registering a new request while the previous one is still unconfirmed
//!   counts a miss. `n` consecutive misses impose a delay of
//!   `min_delay * 2^(n-1)`, capped at `max_delay`.
//! - A confirmed prediction clears the miss streak and the delay.
//! - A client idle for `forget_after_ms` starts over.
//! - A trust score (EWMA of prediction accuracy) is kept for diagnostics.
//!
//! Timestamps are passed in explicitly (`now_ms`); no background threads.

use std::collections::{HashSet, VecDeque};
use std::num::NonZeroUsize;

use lru::LruCache;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::ThrottleConfig;

/// Starting trust score for a client never seen before.
const INITIAL_TRUST: f64 = 0.5;

/// Outcome of one recorded prediction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PredictionState {
    /// Not yet navigated to.
    Pending,
    /// A real navigation matched it.
    Confirmed,
    /// Superseded by another prediction before any navigation matched.
    Missed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PredictionRecord {
    pub url: String,
    pub requested_at_ms: u64,
    pub state: PredictionState,
}

#[derive(Debug, Clone)]
struct ThrottleEntry {
    history: VecDeque<PredictionRecord>,
    current_delay_ms: u64,
    last_request_ms: Option<u64>,
    consecutive_misses: u32,
    score: f64,
}

impl ThrottleEntry {
    fn new(history_len: usize) -> Self {
        Self {
            history: VecDeque::with_capacity(history_len),
            current_delay_ms: 0,
            last_request_ms: None,
            consecutive_misses: 0,
            score: INITIAL_TRUST,
        }
    }
}

/// Serializable view of one client's throttle state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThrottleStats {
    pub uid: u32,
    pub current_delay_ms: u64,
    pub consecutive_misses: u32,
    pub trust_score: f64,
    pub banned: bool,
    pub history: Vec<PredictionRecord>,
}

/// Rate limiter keyed by client uid.
///
/// State is in-memory only and bounded: at most `max_tracked_clients` entries,
/// least recently used evicted first, each with at most `history_len`
/// predictions. Bans live outside the LRU so that eviction never lifts them;
/// only [`reset`](Self::reset) and [`purge_all`](Self::purge_all) do.
#[derive(Debug)]
pub struct RequestThrottler {
    config: ThrottleConfig,
    entries: LruCache<u32, ThrottleEntry>,
    banned: HashSet<u32>,
}

impl RequestThrottler {
    #[must_use]
    pub fn new(config: ThrottleConfig) -> Self {
        let capacity = NonZeroUsize::new(config.max_tracked_clients).unwrap_or(NonZeroUsize::MIN);
        Self {
            config,
            entries: LruCache::new(capacity),
            banned: HashSet::new(),
        }
    }

    #[must_use]
    pub fn config(&self) -> &ThrottleConfig {
        &self.config
    }

    /// Whether `uid` may submit another speculative request at `now_ms`.
    ///
    /// Read-only: does not create an entry or touch recency.
    #[must_use]
    pub fn is_allowed(&self, uid: u32, now_ms: u64) -> bool {
        if self.banned.contains(&uid) {
            return false;
        }
        let Some(entry) = self.entries.peek(&uid) else {
            return true;
        };
        match entry.last_request_ms {
            None => true,
            Some(last) => now_ms.saturating_sub(last) >= entry.current_delay_ms,
        }
    }

    /// Record a prediction for `url` and recompute the client's delay.
    pub fn register_request(&mut self, uid: u32, url: &str, now_ms: u64) {
        let history_len = self.config.history_len.max(1);
        let forget_after_ms = self.config.forget_after_ms;
        let alpha = self.config.trust_alpha;
        let (min_delay, max_delay) = (self.config.min_delay_ms, self.config.max_delay_ms);

        let entry = self
            .entries
            .get_or_insert_mut(uid, || ThrottleEntry::new(history_len));

        if entry
            .last_request_ms
            .is_some_and(|last| now_ms.saturating_sub(last) >= forget_after_ms)
        {
            debug!(uid, "Forgetting idle client's miss streak");
            entry.consecutive_misses = 0;
            entry.current_delay_ms = 0;
            if let Some(last) = entry.history.back_mut() {
                if last.state == PredictionState::Pending {
                    last.state = PredictionState::Missed;
                }
            }
        }

        if let Some(last) = entry.history.back_mut() {
            if last.state == PredictionState::Pending {
                last.state = PredictionState::Missed;
                entry.consecutive_misses = entry.consecutive_misses.saturating_add(1);
                entry.score *= 1.0 - alpha;
            }
        }

        entry.current_delay_ms = backoff_delay(entry.consecutive_misses, min_delay, max_delay);
        entry.last_request_ms = Some(now_ms);
        entry.history.push_back(PredictionRecord {
            url: url.to_string(),
            requested_at_ms: now_ms,
            state: PredictionState::Pending,
        });
        while entry.history.len() > history_len {
            entry.history.pop_front();
        }

        debug!(
            uid,
            delay_ms = entry.current_delay_ms,
            misses = entry.consecutive_misses,
            "Registered speculative request"
        );
    }

    /// Record that the pending prediction for `url` was navigated to.
    ///
    /// Returns `false` if there was no pending prediction for that URL.
    pub fn register_success(&mut self, uid: u32, url: &str) -> bool {
        let alpha = self.config.trust_alpha;
        let Some(entry) = self.entries.get_mut(&uid) else {
            return false;
        };
        let Some(record) = entry
            .history
            .iter_mut()
            .rev()
            .find(|r| r.state == PredictionState::Pending && r.url == url)
        else {
            return false;
        };
        record.state = PredictionState::Confirmed;
        entry.consecutive_misses = 0;
        entry.current_delay_ms = 0;
        entry.score = alpha + (1.0 - alpha) * entry.score;
        debug!(uid, score = entry.score, "Prediction confirmed");
        true
    }

    /// Refuse every further request from `uid` until reset.
    pub fn ban(&mut self, uid: u32) {
        if self.banned.insert(uid) {
            info!(uid, "Client banned from speculative requests");
        }
    }

    /// Drop everything known about `uid`, including a ban.
    pub fn reset(&mut self, uid: u32) {
        let had_entry = self.entries.pop(&uid).is_some();
        if self.banned.remove(&uid) || had_entry {
            info!(uid, "Throttling reset");
        }
    }

    pub fn purge_all(&mut self) {
        let n = self.entries.len();
        let bans = self.banned.len();
        self.entries.clear();
        self.banned.clear();
        info!(purged = n, bans, "All throttle entries purged");
    }

    #[must_use]
    pub fn tracked_clients(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn stats(&self, uid: u32) -> Option<ThrottleStats> {
        let banned = self.banned.contains(&uid);
        match self.entries.peek(&uid) {
            Some(entry) => Some(ThrottleStats {
                uid,
                current_delay_ms: entry.current_delay_ms,
                consecutive_misses: entry.consecutive_misses,
                trust_score: entry.score,
                banned,
                history: entry.history.iter().cloned().collect(),
            }),
            None if banned => Some(ThrottleStats {
                uid,
                current_delay_ms: 0,
                consecutive_misses: 0,
                trust_score: INITIAL_TRUST,
                banned,
                history: Vec::new(),
            }),
            None => None,
        }
    }
}

/// Delay after `misses` consecutive unconfirmed predictions.
#[must_use]
pub fn backoff_delay(misses: u32, min_delay_ms: u64, max_delay_ms: u64) -> u64 {
    if misses == 0 {
        return 0;
    }
    let shift = (misses - 1).min(63);
    min_delay_ms
        .checked_mul(1u64 << shift)
        .unwrap_or(u64::MAX)
        .clamp(min_delay_ms, max_delay_ms)
}

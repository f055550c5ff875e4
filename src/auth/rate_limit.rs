//! Per-IP sliding-window failure limiter with a bounded in-memory store.
//!
//! Records age out `window` after their first attempt. Reaching
//! `max_attempts` failures inside one window blocks the IP for a full
//! window. Authentication success never resets a counter — a probing client
//! that finally guesses right still runs into its block.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::error::{RestexecError, Result};

/// Interval between background sweeps of expired records.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Limiter tuning knobs.
#[derive(Debug, Clone)]
pub struct RateLimitSettings {
    pub enabled: bool,
    pub max_attempts: u32,
    pub window: Duration,
    pub trust_proxy: bool,
    pub max_entries: usize,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 5,
            window: Duration::from_millis(60_000),
            trust_proxy: false,
            max_entries: 10_000,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Record {
    attempts: u32,
    first_attempt: Instant,
    blocked_until: Option<Instant>,
}

/// Sliding-window failure counter keyed by client IP.
pub struct RateLimiter {
    settings: RateLimitSettings,
    records: Mutex<HashMap<IpAddr, Record>>,
}

impl RateLimiter {
    pub fn new(settings: RateLimitSettings) -> Self {
        Self {
            settings,
            records: Mutex::new(HashMap::new()),
        }
    }

    pub fn settings(&self) -> &RateLimitSettings {
        &self.settings
    }

    /// Reject the request if `ip` is inside a block.
    ///
    /// An expired block drops the record entirely before the request is
    /// processed, so the next failure starts a fresh window at one.
    pub async fn check(&self, ip: IpAddr) -> Result<()> {
        self.check_at(ip, Instant::now()).await
    }

    async fn check_at(&self, ip: IpAddr, now: Instant) -> Result<()> {
        if !self.settings.enabled {
            return Ok(());
        }
        let mut records = self.records.lock().await;
        let Some(record) = records.get(&ip) else {
            return Ok(());
        };
        if let Some(blocked_until) = record.blocked_until {
            if now < blocked_until {
                let remaining_ms = blocked_until.duration_since(now).as_millis() as u64;
                return Err(RestexecError::RateLimited {
                    retry_after_secs: remaining_ms.div_ceil(1000).max(1),
                });
            }
            records.remove(&ip);
        }
        Ok(())
    }

    /// Record an authentication failure from `ip`.
    pub async fn record_failure(&self, ip: IpAddr) {
        self.record_failure_at(ip, Instant::now()).await;
    }

    async fn record_failure_at(&self, ip: IpAddr, now: Instant) {
        if !self.settings.enabled {
            return;
        }
        let mut records = self.records.lock().await;

        match records.get_mut(&ip) {
            Some(record) if now.duration_since(record.first_attempt) <= self.settings.window => {
                record.attempts += 1;
                if record.attempts >= self.settings.max_attempts && record.blocked_until.is_none() {
                    record.blocked_until = Some(now + self.settings.window);
                    tracing::warn!(
                        ip = %ip,
                        attempts = record.attempts,
                        "client blocked after repeated authentication failures"
                    );
                }
            }
            Some(record) => {
                // Window elapsed since the first attempt: start over.
                *record = Record {
                    attempts: 1,
                    first_attempt: now,
                    blocked_until: None,
                };
            }
            None => {
                if records.len() >= self.settings.max_entries {
                    Self::evict_oldest(&mut records, self.settings.max_entries);
                }
                records.insert(
                    ip,
                    Record {
                        attempts: 1,
                        first_attempt: now,
                        blocked_until: None,
                    },
                );
            }
        }
    }

    /// Evict the oldest 10 % of records by first attempt to stay under the
    /// hard capacity.
    fn evict_oldest(records: &mut HashMap<IpAddr, Record>, max_entries: usize) {
        let evict_count = (max_entries / 10).max(1);
        let mut by_age: Vec<(IpAddr, Instant)> = records
            .iter()
            .map(|(ip, r)| (*ip, r.first_attempt))
            .collect();
        by_age.sort_by_key(|(_, first)| *first);
        for (ip, _) in by_age.into_iter().take(evict_count) {
            records.remove(&ip);
        }
        tracing::debug!(evicted = evict_count, "rate-limit store at capacity, evicted oldest");
    }

    /// Drop records that are blocked-and-expired or unblocked with an
    /// expired window.
    pub async fn sweep(&self) {
        self.sweep_at(Instant::now()).await;
    }

    async fn sweep_at(&self, now: Instant) {
        let mut records = self.records.lock().await;
        let window = self.settings.window;
        records.retain(|_, record| match record.blocked_until {
            Some(blocked_until) => now < blocked_until,
            None => now.duration_since(record.first_attempt) <= window,
        });
    }

    /// Number of records currently stored.
    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.lock().await.is_empty()
    }
}

/// Run the periodic sweeper until cancelled.
pub async fn run_sweeper(limiter: std::sync::Arc<RateLimiter>, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(SWEEP_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                limiter.sweep().await;
            }
            _ = cancel.cancelled() => {
                tracing::debug!("rate-limit sweeper stopped");
                return;
            }
        }
    }
}

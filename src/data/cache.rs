//! TTL cache of candle series per (instrument, interval).
//!
//! A cached series stays valid for one interval. Misses go to the broker
//! through the shared request limiter, with the `RetryPolicy` deciding
//! timeouts and backoff. A fetch that never yields a usable series
//! degrades to an empty series ("no data this cycle"); the cache never
//! returns an error.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::broker::BrokerPort;
use crate::config::CacheConfig;
use crate::types::CandleSeries;

/// Series with fewer usable points than this count as a failed fetch.
pub const MIN_USABLE_POINTS: usize = 5;

// ---------------------------------------------------------------------------
// Retry policy
// ---------------------------------------------------------------------------

/// Attempt count, per-attempt timeouts and inter-attempt backoffs.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    timeouts: Vec<Duration>,
    backoffs: Vec<Duration>,
}

impl RetryPolicy {
    pub fn new(timeouts: Vec<Duration>, backoffs: Vec<Duration>) -> Self {
        Self { timeouts, backoffs }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(
            config
                .attempt_timeouts_secs
                .iter()
                .map(|s| Duration::from_secs(*s))
                .collect(),
            config
                .backoffs_secs
                .iter()
                .map(|s| Duration::from_secs(*s))
                .collect(),
        )
    }

    pub fn attempts(&self) -> usize {
        self.timeouts.len()
    }

    /// Timeout for a zero-based attempt.
    pub fn timeout_for(&self, attempt: usize) -> Duration {
        self.timeouts
            .get(attempt)
            .or_else(|| self.timeouts.last())
            .copied()
            .unwrap_or(Duration::from_secs(30))
    }

    /// Sleep after a failed zero-based attempt, or `None` after the last one.
    pub fn backoff_after(&self, attempt: usize) -> Option<Duration> {
        if attempt + 1 >= self.attempts() {
            return None;
        }
        Some(
            self.backoffs
                .get(attempt)
                .or_else(|| self.backoffs.last())
                .copied()
                .unwrap_or(Duration::ZERO),
        )
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&CacheConfig::default())
    }
}

// ---------------------------------------------------------------------------
// Cache
// ---------------------------------------------------------------------------

type CacheKey = (String, u32);

struct CacheEntry {
    series: CandleSeries,
    fetched_at: Instant,
}

type Slot = Arc<tokio::sync::Mutex<Option<CacheEntry>>>;

/// Observability counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub failed_fetches: u64,
    pub evictions: u64,
    pub entries: usize,
}

/// Market data cache shared by all scan tasks.
pub struct MarketDataCache {
    broker: Arc<dyn BrokerPort>,
    limiter: Arc<Semaphore>,
    policy: RetryPolicy,
    ceiling: Duration,
    sweep_interval: Duration,
    slots: Mutex<HashMap<CacheKey, Slot>>,
    last_sweep: Mutex<Instant>,
    hits: AtomicU64,
    misses: AtomicU64,
    failed_fetches: AtomicU64,
    evictions: AtomicU64,
}

impl MarketDataCache {
    pub fn new(
        broker: Arc<dyn BrokerPort>,
        limiter: Arc<Semaphore>,
        config: &CacheConfig,
    ) -> Self {
        Self {
            broker,
            limiter,
            policy: RetryPolicy::from_config(config),
            ceiling: Duration::from_secs(config.ttl_ceiling_secs),
            sweep_interval: Duration::from_secs(config.sweep_interval_secs),
            slots: Mutex::new(HashMap::new()),
            last_sweep: Mutex::new(Instant::now()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            failed_fetches: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Candles for (instrument, interval). Valid cached data is returned
    /// without I/O; otherwise the broker is asked per the retry policy.
    /// Returns an empty series when every attempt fails.
    pub async fn get(&self, instrument: &str, interval_secs: u32, lookback: usize) -> CandleSeries {
        self.maybe_sweep();

        let slot = self.slot(instrument, interval_secs);
        // Held across the fetch: same-key callers queue here and then hit.
        let mut guard = slot.lock().await;

        let ttl = Duration::from_secs(u64::from(interval_secs));
        if let Some(entry) = guard.as_ref() {
            if entry.fetched_at.elapsed() < ttl {
                self.hits.fetch_add(1, Ordering::Relaxed);
                debug!(instrument, interval_secs, "Cache hit");
                return entry.series.clone();
            }
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        let series = self.fetch_with_retry(instrument, interval_secs, lookback).await;
        if series.is_empty() {
            self.failed_fetches.fetch_add(1, Ordering::Relaxed);
        } else {
            *guard = Some(CacheEntry {
                series: series.clone(),
                fetched_at: Instant::now(),
            });
        }
        series
    }

    fn slot(&self, instrument: &str, interval_secs: u32) -> Slot {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots
            .entry((instrument.to_string(), interval_secs))
            .or_default()
            .clone()
    }

    async fn fetch_with_retry(
        &self,
        instrument: &str,
        interval_secs: u32,
        lookback: usize,
    ) -> CandleSeries {
        for attempt in 0..self.policy.attempts() {
            let timeout = self.policy.timeout_for(attempt);
            let result = {
                let _permit = match self.limiter.acquire().await {
                    Ok(permit) => permit,
                    Err(_) => {
                        warn!(instrument, "Request limiter closed");
                        return CandleSeries::empty(instrument, interval_secs);
                    }
                };
                tokio::time::timeout(
                    timeout,
                    self.broker.get_candles(instrument, interval_secs, lookback),
                )
                .await
            };

            match result {
                Ok(Ok(raw)) => {
                    let series = CandleSeries::from_raw(instrument, interval_secs, &raw);
                    if series.len() >= MIN_USABLE_POINTS {
                        debug!(
                            instrument,
                            interval_secs,
                            attempt = attempt + 1,
                            candles = series.len(),
                            "Candles fetched"
                        );
                        return series;
                    }
                    warn!(
                        instrument,
                        interval_secs,
                        attempt = attempt + 1,
                        received = raw.len(),
                        usable = series.len(),
                        "Too few usable candles"
                    );
                }
                Ok(Err(e)) => {
                    warn!(
                        instrument,
                        interval_secs,
                        attempt = attempt + 1,
                        error = %e,
                        "Candle fetch failed"
                    );
                }
                Err(_) => {
                    warn!(
                        instrument,
                        interval_secs,
                        attempt = attempt + 1,
                        timeout_secs = timeout.as_secs(),
                        "Candle fetch timed out"
                    );
                }
            }

            if let Some(backoff) = self.policy.backoff_after(attempt) {
                tokio::time::sleep(backoff).await;
            }
        }

        warn!(
            instrument,
            interval_secs,
            attempts = self.policy.attempts(),
            "No usable candles after all attempts"
        );
        CandleSeries::empty(instrument, interval_secs)
    }

    /// Run `sweep` if the sweep interval has passed since the last one.
    pub fn maybe_sweep(&self) {
        {
            let mut last = self.last_sweep.lock().unwrap_or_else(|e| e.into_inner());
            if last.elapsed() < self.sweep_interval {
                return;
            }
            *last = Instant::now();
        }
        self.sweep();
    }

    /// Evict entries older than the ceiling. Slots in use are skipped.
    pub fn sweep(&self) -> usize {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        let before = slots.len();
        let ceiling = self.ceiling;
        slots.retain(|_, slot| {
            // Only the map holds it, so nobody can be about to lock it.
            if Arc::strong_count(slot) > 1 {
                return true;
            }
            match slot.try_lock() {
                Ok(entry) => entry
                    .as_ref()
                    .map(|e| e.fetched_at.elapsed() < ceiling)
                    .unwrap_or(false),
                Err(_) => true,
            }
        });
        let evicted = before - slots.len();
        if evicted > 0 {
            self.evictions.fetch_add(evicted as u64, Ordering::Relaxed);
            info!(evicted, remaining = slots.len(), "Cache sweep");
        }
        evicted
    }

    pub fn stats(&self) -> CacheStats {
        let entries = self.slots.lock().map(|s| s.len()).unwrap_or(0);
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            failed_fetches: self.failed_fetches.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            entries,
        }
    }
}

//! Tunable parameters for the spatial index and the match engine.

use h3o::Resolution;

use crate::clock::ONE_SEC_MS;

/// Default search radius around a pickup point (km).
const DEFAULT_SEARCH_RADIUS_KM: f64 = 10.0;

/// Radius doubling stops at this bound (km).
const DEFAULT_MAX_RADIUS_KM: f64 = 40.0;

/// Candidates taken per search pass, nearest first.
const DEFAULT_CANDIDATE_LIMIT: usize = 8;

/// How long a driver may sit on an offer before it lapses.
const DEFAULT_OFFER_DEADLINE_MS: u64 = 15 * ONE_SEC_MS;

/// Location reports older than this exclude a driver from matching.
const DEFAULT_STALE_AFTER_MS: u64 = 120 * ONE_SEC_MS;

/// Spatial index parameters.
#[derive(Debug, Clone, Copy)]
pub struct GeoConfig {
    /// H3 resolution used for cell bucketing. Resolution 8 (~460m hexagons)
    /// keeps city-scale radius queries to a few thousand cells.
    pub resolution: Resolution,
    /// Entries kept in the per-index grid-disk cache.
    pub disk_cache_entries: usize,
}

impl Default for GeoConfig {
    fn default() -> Self {
        Self {
            resolution: Resolution::Eight,
            disk_cache_entries: 1_000,
        }
    }
}

impl GeoConfig {
    pub fn with_resolution(mut self, resolution: Resolution) -> Self {
        self.resolution = resolution;
        self
    }
}

/// Matching behavior of the engine.
#[derive(Debug, Clone, Copy)]
pub struct MatchConfig {
    /// Initial search radius around the pickup (km).
    pub search_radius_km: f64,
    /// The radius doubles on an empty pass until it reaches this cap (km).
    pub max_radius_km: f64,
    /// Maximum candidates considered per search pass.
    pub candidate_limit: usize,
    /// Offer deadline; a driver who has not answered by then loses the offer (ms).
    pub offer_deadline_ms: u64,
    /// Requeue rounds granted after the candidate search comes up empty.
    pub max_requeues: u32,
    /// Base delay before a requeued booking is retried; doubles per round (ms).
    pub retry_backoff_ms: u64,
    /// Location staleness bound for matching eligibility (ms).
    pub stale_after_ms: u64,
    /// Cadence of the reconciliation sweep (ms).
    pub sweep_interval_ms: u64,
    /// Worker threads pulling from the booking queue.
    pub workers: usize,
}

impl Default for MatchConfig {
    fn default() -> Self {
        Self {
            search_radius_km: DEFAULT_SEARCH_RADIUS_KM,
            max_radius_km: DEFAULT_MAX_RADIUS_KM,
            candidate_limit: DEFAULT_CANDIDATE_LIMIT,
            offer_deadline_ms: DEFAULT_OFFER_DEADLINE_MS,
            max_requeues: 3,
            retry_backoff_ms: 2 * ONE_SEC_MS,
            stale_after_ms: DEFAULT_STALE_AFTER_MS,
            sweep_interval_ms: ONE_SEC_MS,
            workers: 4,
        }
    }
}

impl MatchConfig {
    pub fn with_search_radius_km(mut self, radius_km: f64) -> Self {
        self.search_radius_km = radius_km;
        self
    }

    pub fn with_max_radius_km(mut self, radius_km: f64) -> Self {
        self.max_radius_km = radius_km;
        self
    }

    pub fn with_candidate_limit(mut self, limit: usize) -> Self {
        self.candidate_limit = limit;
        self
    }

    pub fn with_offer_deadline_ms(mut self, deadline_ms: u64) -> Self {
        self.offer_deadline_ms = deadline_ms;
        self
    }

    pub fn with_max_requeues(mut self, rounds: u32) -> Self {
        self.max_requeues = rounds;
        self
    }

    pub fn with_retry_backoff_ms(mut self, backoff_ms: u64) -> Self {
        self.retry_backoff_ms = backoff_ms;
        self
    }

    pub fn with_stale_after_ms(mut self, stale_after_ms: u64) -> Self {
        self.stale_after_ms = stale_after_ms;
        self
    }

    pub fn with_sweep_interval_ms(mut self, interval_ms: u64) -> Self {
        self.sweep_interval_ms = interval_ms;
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }
}

/// Top-level configuration consumed by `Dispatcher::build`.
#[derive(Debug, Clone, Copy, Default)]
pub struct DispatchConfig {
    pub geo: GeoConfig,
    pub matching: MatchConfig,
}

//! Metrics extraction and scoring for workload runs.
//!
//! A run's raw counters come straight from the dispatcher's telemetry; this
//! module flattens them into a serializable result row and scores rows
//! against each other for ranking.

use dispatch_core::telemetry::TelemetrySnapshot;

/// Aggregated outcome of a single workload run.
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct WorkloadResult {
    /// Drivers registered for the run.
    pub fleet_size: usize,
    /// Bookings accepted by the dispatcher.
    pub bookings_submitted: u64,
    /// Offers pushed to the fleet.
    pub offers_made: u64,
    /// Bookings confirmed end to end.
    pub confirmed: u64,
    /// Offers the fleet declined.
    pub offers_rejected: u64,
    /// Offers that lapsed unanswered.
    pub offer_timeouts: u64,
    /// Reservations lost to a concurrent worker.
    pub reservation_conflicts: u64,
    /// Requeue rounds consumed across all bookings.
    pub requeues: u64,
    /// Bookings given up after exhausting their rounds.
    pub unmatched: u64,
    /// Bookings that outlived their time-to-live in the queue.
    pub expired: u64,
    /// Bookings cancelled by the customer side.
    pub cancelled: u64,
    /// Confirmed share of submitted bookings.
    pub match_rate: f64,
    /// Mean submission-to-confirmation latency; 0 when nothing confirmed.
    pub avg_time_to_confirm_ms: f64,
    /// Wall time of the whole run.
    pub wall_time_ms: u64,
}

impl WorkloadResult {
    /// Flatten a telemetry snapshot into a result row.
    pub fn from_snapshot(fleet_size: usize, snapshot: TelemetrySnapshot, wall_time_ms: u64) -> Self {
        let match_rate = if snapshot.bookings_submitted == 0 {
            0.0
        } else {
            snapshot.offers_accepted as f64 / snapshot.bookings_submitted as f64
        };
        Self {
            fleet_size,
            bookings_submitted: snapshot.bookings_submitted,
            offers_made: snapshot.offers_made,
            confirmed: snapshot.offers_accepted,
            offers_rejected: snapshot.offers_rejected,
            offer_timeouts: snapshot.offer_timeouts,
            reservation_conflicts: snapshot.reservation_conflicts,
            requeues: snapshot.requeues,
            unmatched: snapshot.bookings_unmatched,
            expired: snapshot.bookings_expired,
            cancelled: snapshot.bookings_cancelled,
            match_rate,
            avg_time_to_confirm_ms: snapshot.avg_time_to_confirm_ms().unwrap_or(0.0),
            wall_time_ms,
        }
    }
}

/// Configurable weights for the service score.
///
/// The score rewards a high match rate, rewards fast confirmations and
/// penalizes offers that lapse unanswered.
#[derive(Debug, Clone, Copy)]
pub struct ServiceWeights {
    /// Weight for the confirmed share of bookings (higher is better).
    pub match_rate_weight: f64,
    /// Weight for confirmation latency (inverted, lower is better).
    pub time_to_confirm_weight: f64,
    /// Penalty weight for the lapsed share of offers (negative).
    pub timeout_penalty: f64,
}

impl Default for ServiceWeights {
    fn default() -> Self {
        Self {
            match_rate_weight: 0.5,
            time_to_confirm_weight: 0.3,
            timeout_penalty: -0.2,
        }
    }
}

/// Normalize a value to [0, 1] over the observed range. A degenerate range
/// maps everything to 0.5.
fn normalize(value: f64, min: f64, max: f64) -> f64 {
    if max == min {
        0.5
    } else {
        ((value - min) / (max - min)).max(0.0).min(1.0)
    }
}

/// Score every result against the others.
///
/// Match and timeout rates are already in [0, 1]; confirmation latency is
/// min-max normalized across the slice. Runs that confirmed nothing take the
/// slice's worst latency so an idle run cannot win on speed.
pub fn service_scores(results: &[WorkloadResult], weights: &ServiceWeights) -> Vec<f64> {
    if results.is_empty() {
        return Vec::new();
    }

    let worst_time = results
        .iter()
        .filter(|result| result.confirmed > 0)
        .map(|result| result.avg_time_to_confirm_ms)
        .fold(0.0_f64, f64::max);
    let times: Vec<f64> = results
        .iter()
        .map(|result| {
            if result.confirmed > 0 {
                result.avg_time_to_confirm_ms
            } else {
                worst_time
            }
        })
        .collect();
    let time_min = times.iter().cloned().fold(f64::INFINITY, f64::min);
    let time_max = times.iter().cloned().fold(0.0_f64, f64::max);

    results
        .iter()
        .zip(&times)
        .map(|(result, &time)| {
            let timeout_rate = if result.offers_made == 0 {
                0.0
            } else {
                result.offer_timeouts as f64 / result.offers_made as f64
            };
            weights.match_rate_weight * result.match_rate
                + weights.time_to_confirm_weight * (1.0 - normalize(time, time_min, time_max))
                + weights.timeout_penalty * timeout_rate
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(confirmed: u64, submitted: u64, avg_ms: f64, timeouts: u64) -> WorkloadResult {
        WorkloadResult {
            fleet_size: 10,
            bookings_submitted: submitted,
            offers_made: confirmed + timeouts,
            confirmed,
            offers_rejected: 0,
            offer_timeouts: timeouts,
            reservation_conflicts: 0,
            requeues: 0,
            unmatched: submitted - confirmed,
            expired: 0,
            cancelled: 0,
            match_rate: confirmed as f64 / submitted as f64,
            avg_time_to_confirm_ms: avg_ms,
            wall_time_ms: 1_000,
        }
    }

    #[test]
    fn test_higher_match_rate_scores_higher() {
        let results = vec![result(5, 10, 800.0, 0), result(9, 10, 800.0, 0)];
        let scores = service_scores(&results, &ServiceWeights::default());
        assert!(scores[1] > scores[0]);
    }

    #[test]
    fn test_slow_confirmations_score_lower() {
        let results = vec![result(8, 10, 300.0, 0), result(8, 10, 3_000.0, 0)];
        let scores = service_scores(&results, &ServiceWeights::default());
        assert!(scores[0] > scores[1]);
    }

    #[test]
    fn test_timeouts_are_penalized() {
        let results = vec![result(8, 10, 500.0, 0), result(8, 10, 500.0, 8)];
        let scores = service_scores(&results, &ServiceWeights::default());
        assert!(scores[0] > scores[1]);
    }

    #[test]
    fn test_idle_run_cannot_win_on_speed() {
        let idle = result(0, 10, 0.0, 0);
        let busy = result(10, 10, 900.0, 0);
        let scores = service_scores(&[idle, busy], &ServiceWeights::default());
        assert!(scores[1] > scores[0]);
    }

    #[test]
    fn test_empty_results_yield_no_scores() {
        assert!(service_scores(&[], &ServiceWeights::default()).is_empty());
    }
}

//! Live counters for the dispatcher, cheap to bump from any worker.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Shared counters covering the whole match loop. All increments are relaxed;
/// the snapshot is a point-in-time copy, not a consistent cut.
#[derive(Debug, Default)]
pub struct MatchTelemetry {
    bookings_submitted: AtomicU64,
    offers_made: AtomicU64,
    offers_accepted: AtomicU64,
    offers_rejected: AtomicU64,
    offer_timeouts: AtomicU64,
    reservation_conflicts: AtomicU64,
    requeues: AtomicU64,
    bookings_unmatched: AtomicU64,
    bookings_cancelled: AtomicU64,
    bookings_expired: AtomicU64,
    store_write_failures: AtomicU64,
    store_retries_flushed: AtomicU64,
    orphaned_releases: AtomicU64,
    stale_evictions: AtomicU64,
    time_to_confirm_total_ms: AtomicU64,
}

impl MatchTelemetry {
    pub fn new() -> Self {
        Self::default()
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_submitted(&self) {
        Self::bump(&self.bookings_submitted);
    }

    pub fn record_offer(&self) {
        Self::bump(&self.offers_made);
    }

    pub fn record_confirmed(&self, time_to_confirm_ms: u64) {
        Self::bump(&self.offers_accepted);
        self.time_to_confirm_total_ms
            .fetch_add(time_to_confirm_ms, Ordering::Relaxed);
    }

    pub fn record_rejected(&self) {
        Self::bump(&self.offers_rejected);
    }

    pub fn record_offer_timeout(&self) {
        Self::bump(&self.offer_timeouts);
    }

    pub fn record_reservation_conflict(&self) {
        Self::bump(&self.reservation_conflicts);
    }

    pub fn record_requeue(&self) {
        Self::bump(&self.requeues);
    }

    pub fn record_unmatched(&self) {
        Self::bump(&self.bookings_unmatched);
    }

    pub fn record_cancelled(&self) {
        Self::bump(&self.bookings_cancelled);
    }

    pub fn record_expired(&self) {
        Self::bump(&self.bookings_expired);
    }

    pub fn record_store_write_failure(&self) {
        Self::bump(&self.store_write_failures);
    }

    pub fn record_store_retry_flushed(&self) {
        Self::bump(&self.store_retries_flushed);
    }

    pub fn record_orphaned_release(&self) {
        Self::bump(&self.orphaned_releases);
    }

    pub fn record_stale_eviction(&self) {
        Self::bump(&self.stale_evictions);
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            bookings_submitted: self.bookings_submitted.load(Ordering::Relaxed),
            offers_made: self.offers_made.load(Ordering::Relaxed),
            offers_accepted: self.offers_accepted.load(Ordering::Relaxed),
            offers_rejected: self.offers_rejected.load(Ordering::Relaxed),
            offer_timeouts: self.offer_timeouts.load(Ordering::Relaxed),
            reservation_conflicts: self.reservation_conflicts.load(Ordering::Relaxed),
            requeues: self.requeues.load(Ordering::Relaxed),
            bookings_unmatched: self.bookings_unmatched.load(Ordering::Relaxed),
            bookings_cancelled: self.bookings_cancelled.load(Ordering::Relaxed),
            bookings_expired: self.bookings_expired.load(Ordering::Relaxed),
            store_write_failures: self.store_write_failures.load(Ordering::Relaxed),
            store_retries_flushed: self.store_retries_flushed.load(Ordering::Relaxed),
            orphaned_releases: self.orphaned_releases.load(Ordering::Relaxed),
            stale_evictions: self.stale_evictions.load(Ordering::Relaxed),
            time_to_confirm_total_ms: self.time_to_confirm_total_ms.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of all counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TelemetrySnapshot {
    pub bookings_submitted: u64,
    pub offers_made: u64,
    pub offers_accepted: u64,
    pub offers_rejected: u64,
    pub offer_timeouts: u64,
    pub reservation_conflicts: u64,
    pub requeues: u64,
    pub bookings_unmatched: u64,
    pub bookings_cancelled: u64,
    pub bookings_expired: u64,
    pub store_write_failures: u64,
    pub store_retries_flushed: u64,
    pub orphaned_releases: u64,
    pub stale_evictions: u64,
    pub time_to_confirm_total_ms: u64,
}

impl TelemetrySnapshot {
    /// Bookings that reached a terminal state.
    pub fn resolved(&self) -> u64 {
        self.offers_accepted
            + self.bookings_unmatched
            + self.bookings_cancelled
            + self.bookings_expired
    }

    /// Share of offers answered with an acceptance.
    pub fn acceptance_rate(&self) -> f64 {
        if self.offers_made == 0 {
            return 0.0;
        }
        self.offers_accepted as f64 / self.offers_made as f64
    }

    /// Mean time from submission to confirmation.
    pub fn avg_time_to_confirm_ms(&self) -> Option<f64> {
        if self.offers_accepted == 0 {
            return None;
        }
        Some(self.time_to_confirm_total_ms as f64 / self.offers_accepted as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_recorded_counts() {
        let telemetry = MatchTelemetry::new();
        telemetry.record_submitted();
        telemetry.record_submitted();
        telemetry.record_offer();
        telemetry.record_offer();
        telemetry.record_offer();
        telemetry.record_confirmed(4_000);
        telemetry.record_confirmed(2_000);
        telemetry.record_rejected();
        telemetry.record_unmatched();

        let snapshot = telemetry.snapshot();
        assert_eq!(snapshot.bookings_submitted, 2);
        assert_eq!(snapshot.offers_made, 3);
        assert_eq!(snapshot.offers_accepted, 2);
        assert_eq!(snapshot.resolved(), 3);
        assert!((snapshot.acceptance_rate() - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(snapshot.avg_time_to_confirm_ms(), Some(3_000.0));
    }

    #[test]
    fn empty_snapshot_has_no_average() {
        let snapshot = MatchTelemetry::new().snapshot();
        assert_eq!(snapshot.avg_time_to_confirm_ms(), None);
        assert_eq!(snapshot.acceptance_rate(), 0.0);
        assert_eq!(snapshot.resolved(), 0);
    }
}

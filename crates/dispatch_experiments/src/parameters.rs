//! Workload variation framework for exploring dispatcher behavior.
//!
//! This module defines workload spaces over fleet size, demand and matching
//! knobs, and generates the concrete workload sets a sweep will run.

use dispatch_core::config::{DispatchConfig, MatchConfig};

/// One workload configuration: a fleet, a burst of bookings and the
/// dispatcher knobs they run under.
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct WorkloadParams {
    /// Drivers registered before the burst starts.
    pub fleet_size: usize,
    /// Bookings submitted in one burst.
    pub bookings: usize,
    /// Probability that the simulated fleet accepts an offer.
    pub accept_rate: f64,
    /// Delay before a driver answers an offer (ms).
    pub response_delay_ms: u64,
    /// Time a confirmed driver stays on trip before becoming available (ms).
    pub trip_duration_ms: u64,
    /// Offer deadline handed to the dispatcher (ms).
    pub offer_deadline_ms: u64,
    /// Candidates considered per search pass.
    pub candidate_limit: usize,
    /// Requeue rounds before a booking is given up.
    pub max_requeues: u32,
    /// Base requeue backoff (ms).
    pub retry_backoff_ms: u64,
    /// Match worker threads.
    pub workers: usize,
    /// Booking time-to-live (ms).
    pub booking_ttl_ms: u64,
}

impl Default for WorkloadParams {
    fn default() -> Self {
        Self {
            fleet_size: 50,
            bookings: 100,
            accept_rate: 0.8,
            response_delay_ms: 5,
            trip_duration_ms: 500,
            offer_deadline_ms: 2_000,
            candidate_limit: 8,
            max_requeues: 3,
            retry_backoff_ms: 50,
            workers: 2,
            booking_ttl_ms: 30_000,
        }
    }
}

impl WorkloadParams {
    /// Dispatcher configuration implied by this workload.
    pub fn dispatch_config(&self) -> DispatchConfig {
        DispatchConfig {
            matching: MatchConfig::default()
                .with_offer_deadline_ms(self.offer_deadline_ms)
                .with_candidate_limit(self.candidate_limit)
                .with_max_requeues(self.max_requeues)
                .with_retry_backoff_ms(self.retry_backoff_ms)
                .with_sweep_interval_ms(50)
                .with_workers(self.workers),
            ..Default::default()
        }
    }
}

/// A single workload with experiment metadata for tracking and
/// reproducibility.
#[derive(Debug, Clone)]
pub struct WorkloadSet {
    /// The workload to run.
    pub params: WorkloadParams,
    /// Unique experiment ID for this combination.
    pub experiment_id: String,
    /// Run ID within the experiment (for repeated runs with the same params).
    pub run_id: usize,
    /// Seed for fleet placement and fleet behavior.
    pub seed: u64,
}

impl WorkloadSet {
    pub fn new(params: WorkloadParams, experiment_id: String, run_id: usize, seed: u64) -> Self {
        Self {
            params,
            experiment_id,
            run_id,
            seed,
        }
    }
}

fn or_base<T: Copy>(values: &[T], base: T) -> Vec<T> {
    if values.is_empty() {
        vec![base]
    } else {
        values.to_vec()
    }
}

/// Defines a workload space for grid exploration.
///
/// Dimensions left unset fall back to the base workload's value.
#[derive(Debug, Clone, Default)]
pub struct WorkloadSpace {
    base: WorkloadParams,
    fleet_sizes: Vec<usize>,
    bookings: Vec<usize>,
    accept_rates: Vec<f64>,
    offer_deadlines_ms: Vec<u64>,
    candidate_limits: Vec<usize>,
}

impl WorkloadSpace {
    /// Create a new workload space for grid search.
    pub fn grid() -> Self {
        Self::default()
    }

    /// Set base parameters (used as defaults for unset dimensions).
    pub fn with_base(mut self, base: WorkloadParams) -> Self {
        self.base = base;
        self
    }

    /// Set fleet sizes to explore.
    pub fn fleet_size(mut self, sizes: Vec<usize>) -> Self {
        self.fleet_sizes = sizes;
        self
    }

    /// Set booking counts to explore.
    pub fn bookings(mut self, counts: Vec<usize>) -> Self {
        self.bookings = counts;
        self
    }

    /// Set fleet accept rates to explore.
    pub fn accept_rate(mut self, rates: Vec<f64>) -> Self {
        self.accept_rates = rates;
        self
    }

    /// Set offer deadlines to explore (ms).
    pub fn offer_deadline_ms(mut self, deadlines: Vec<u64>) -> Self {
        self.offer_deadlines_ms = deadlines;
        self
    }

    /// Set candidate limits to explore.
    pub fn candidate_limit(mut self, limits: Vec<usize>) -> Self {
        self.candidate_limits = limits;
        self
    }

    /// Generate all workload sets using grid search (Cartesian product).
    pub fn generate(&self) -> Vec<WorkloadSet> {
        let fleet_sizes = or_base(&self.fleet_sizes, self.base.fleet_size);
        let booking_counts = or_base(&self.bookings, self.base.bookings);
        let accept_rates = or_base(&self.accept_rates, self.base.accept_rate);
        let offer_deadlines = or_base(&self.offer_deadlines_ms, self.base.offer_deadline_ms);
        let candidate_limits = or_base(&self.candidate_limits, self.base.candidate_limit);

        let mut sets = Vec::new();
        for &fleet_size in &fleet_sizes {
            for &bookings in &booking_counts {
                for &accept_rate in &accept_rates {
                    for &offer_deadline_ms in &offer_deadlines {
                        for &candidate_limit in &candidate_limits {
                            let mut params = self.base;
                            params.fleet_size = fleet_size;
                            params.bookings = bookings;
                            params.accept_rate = accept_rate;
                            params.offer_deadline_ms = offer_deadline_ms;
                            params.candidate_limit = candidate_limit;

                            let experiment_id = sets.len();
                            let seed = (experiment_id as u64).wrapping_mul(0x9e3779b9);
                            sets.push(WorkloadSet::new(
                                params,
                                format!("exp_{}", experiment_id),
                                0,
                                seed,
                            ));
                        }
                    }
                }
            }
        }
        sets
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grid_single_dimension() {
        let space = WorkloadSpace::grid().fleet_size(vec![10, 20, 40]);
        let sets = space.generate();
        assert_eq!(sets.len(), 3);
        assert_eq!(sets[0].params.fleet_size, 10);
        assert_eq!(sets[2].params.fleet_size, 40);
        // Unset dimensions stay at the base value.
        assert_eq!(sets[0].params.bookings, WorkloadParams::default().bookings);
    }

    #[test]
    fn test_grid_multiple_dimensions() {
        let space = WorkloadSpace::grid()
            .fleet_size(vec![10, 20])
            .accept_rate(vec![0.5, 0.8, 1.0])
            .candidate_limit(vec![4, 8]);
        let sets = space.generate();
        assert_eq!(sets.len(), 12); // 2 * 3 * 2 combinations
        assert!(sets.iter().any(|set| set.params.candidate_limit == 4));
    }

    #[test]
    fn test_seeds_are_distinct_and_reproducible() {
        let space = WorkloadSpace::grid().bookings(vec![10, 20]);
        let first = space.generate();
        let second = space.generate();
        assert_eq!(first[0].seed, second[0].seed);
        assert_ne!(first[0].seed, first[1].seed);
        assert_eq!(first[0].experiment_id, "exp_0");
        assert_eq!(first[1].experiment_id, "exp_1");
    }

    #[test]
    fn test_dispatch_config_carries_the_knobs() {
        let params = WorkloadParams {
            offer_deadline_ms: 750,
            candidate_limit: 3,
            max_requeues: 1,
            workers: 6,
            ..Default::default()
        };
        let config = params.dispatch_config();
        assert_eq!(config.matching.offer_deadline_ms, 750);
        assert_eq!(config.matching.candidate_limit, 3);
        assert_eq!(config.matching.max_requeues, 1);
        assert_eq!(config.matching.workers, 6);
    }
}

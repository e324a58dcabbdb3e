//! Parallel workload execution using rayon.
//!
//! This module runs single workloads against a live dispatcher and executes
//! many workloads in parallel for parameter sweeps.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use indicatif::{ProgressBar, ProgressStyle};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;

use dispatch_core::assignment::BookingRequest;
use dispatch_core::clock::{Clock, SystemClock};
use dispatch_core::engine::Dispatcher;
use dispatch_core::notify::NotificationSink;
use dispatch_core::registry::DriverSpec;
use dispatch_core::store::{InMemoryStore, Store};
use dispatch_core::types::{BookingId, Capabilities, CustomerId, DriverId, Location};

use crate::metrics::WorkloadResult;
use crate::parameters::WorkloadSet;
use crate::responder::FleetResponder;

/// Hard stop for a single run; a healthy workload resolves well before this.
const RUN_WALL_CAP: Duration = Duration::from_secs(60);

/// Run one workload to completion and extract its result row.
///
/// Builds a dispatcher with an in-memory store, registers the fleet, starts
/// the match workers and a [`FleetResponder`] playing the driver side, then
/// submits the booking burst and waits until every booking reaches a
/// terminal state.
///
/// # Arguments
///
/// * `set` - Workload configuration for this run
///
/// # Returns
///
/// A `WorkloadResult` with the run's counters and rates.
pub fn run_single_workload(set: &WorkloadSet) -> WorkloadResult {
    let params = set.params;
    let responder = Arc::new(FleetResponder::new(
        params.accept_rate,
        params.response_delay_ms,
        params.trip_duration_ms,
        set.seed,
    ));
    let dispatcher = Arc::new(Dispatcher::build(
        params.dispatch_config(),
        Arc::new(InMemoryStore::default()) as Arc<dyn Store>,
        Arc::clone(&responder) as Arc<dyn NotificationSink>,
        Arc::new(SystemClock) as Arc<dyn Clock>,
    ));

    let mut rng = StdRng::seed_from_u64(set.seed);
    for id in 1..=params.fleet_size as u64 {
        dispatcher
            .registry
            .register(DriverSpec {
                id: DriverId(id),
                location: Location {
                    lat: rng.gen_range(52.40..52.61),
                    lon: rng.gen_range(13.20..13.60),
                },
                capabilities: Capabilities::NONE,
            })
            .expect("register driver");
    }

    dispatcher.start();
    let fleet = Arc::clone(&responder).run(Arc::clone(&dispatcher));

    let started = Instant::now();
    for id in 1..=params.bookings as u64 {
        let now = SystemClock.now_ms();
        dispatcher
            .engine
            .submit(BookingRequest {
                id: BookingId(id),
                customer: CustomerId(id),
                pickup: Location {
                    lat: rng.gen_range(52.45..52.56),
                    lon: rng.gen_range(13.30..13.50),
                },
                dropoff: Location {
                    lat: rng.gen_range(52.40..52.61),
                    lon: rng.gen_range(13.20..13.60),
                },
                required: Capabilities::NONE,
                requested_at_ms: now,
                expires_at_ms: now + params.booking_ttl_ms,
            })
            .expect("submit booking");
    }

    let cap = Instant::now() + RUN_WALL_CAP;
    while dispatcher.telemetry.snapshot().resolved() < params.bookings as u64
        && Instant::now() < cap
    {
        thread::sleep(Duration::from_millis(5));
    }
    let wall_time_ms = started.elapsed().as_millis() as u64;

    responder.stop();
    fleet.join().expect("fleet responder thread");
    dispatcher.shutdown();

    WorkloadResult::from_snapshot(params.fleet_size, dispatcher.telemetry.snapshot(), wall_time_ms)
}

/// Run multiple workloads in parallel.
///
/// Uses rayon to execute workloads concurrently across available CPU cores.
/// Each workload runs its own dispatcher with no shared state.
///
/// # Arguments
///
/// * `workload_sets` - Vector of workload sets to run
/// * `num_threads` - Optional number of threads to use. If None, uses rayon's default.
///
/// # Returns
///
/// Vector of `WorkloadResult` in the same order as input workload sets.
pub fn run_parallel_workloads(
    workload_sets: Vec<WorkloadSet>,
    num_threads: Option<usize>,
) -> Vec<WorkloadResult> {
    run_parallel_workloads_with_progress(workload_sets, num_threads, true)
}

/// Run multiple workloads in parallel with optional progress bar.
///
/// # Arguments
///
/// * `workload_sets` - Vector of workload sets to run
/// * `num_threads` - Optional number of threads to use. If None, uses rayon's default.
/// * `show_progress` - Whether to display a progress bar
///
/// # Returns
///
/// Vector of `WorkloadResult` in the same order as input workload sets.
pub fn run_parallel_workloads_with_progress(
    workload_sets: Vec<WorkloadSet>,
    num_threads: Option<usize>,
    show_progress: bool,
) -> Vec<WorkloadResult> {
    let total = workload_sets.len();
    let pb = if show_progress && total > 0 {
        let bar = ProgressBar::new(total as u64);
        bar.set_style(
            ProgressStyle::default_bar()
                .template(
                    "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})",
                )
                .unwrap()
                .progress_chars("#>-"),
        );
        Some(bar)
    } else {
        None
    };

    let pool = if let Some(threads) = num_threads {
        rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .build()
            .expect("Failed to create thread pool")
    } else {
        rayon::ThreadPoolBuilder::new()
            .build()
            .expect("Failed to create thread pool")
    };

    let pb_clone = pb.clone();
    let results = pool.install(|| {
        workload_sets
            .par_iter()
            .map(|set| {
                let result = run_single_workload(set);
                if let Some(ref progress_bar) = pb_clone {
                    progress_bar.inc(1);
                }
                result
            })
            .collect()
    });

    if let Some(ref progress_bar) = pb {
        progress_bar.finish_with_message("Completed");
    }

    results
}

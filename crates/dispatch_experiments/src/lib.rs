//! Parallel workload sweeps for the dispatch core.
//!
//! This crate runs many dispatcher workloads in parallel with varying fleet
//! sizes, demand levels and matching knobs, plays a scripted fleet against
//! each one, and extracts comparable result rows to analyze how the knobs
//! move match rate, confirmation latency and offer timeouts.
//!
//! # Quick Start
//!
//! ```no_run
//! use dispatch_experiments::{
//!     find_best_result_index, run_parallel_workloads, ServiceWeights, WorkloadSpace,
//! };
//!
//! // Define the workload space (grid search)
//! let space = WorkloadSpace::grid()
//!     .fleet_size(vec![25, 50, 100])
//!     .accept_rate(vec![0.6, 0.8, 1.0])
//!     .offer_deadline_ms(vec![1_000, 2_000]);
//!
//! // Generate workload sets
//! let workload_sets = space.generate();
//!
//! // Run workloads in parallel
//! let results = run_parallel_workloads(workload_sets, None);
//!
//! // Score results and find the best configuration
//! let weights = ServiceWeights::default();
//! let best_idx = find_best_result_index(&results, &weights).unwrap();
//! ```
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - [`parameters`]: Workload variation framework (grid search)
//! - [`responder`]: Scripted fleet answering offers against a live dispatcher
//! - [`runner`]: Parallel workload execution using rayon
//! - [`metrics`]: Result extraction and service scoring
//! - [`export`]: Result export to CSV/JSON and ranking

pub mod export;
pub mod metrics;
pub mod parameters;
pub mod responder;
pub mod runner;

pub use export::{export_to_csv, export_to_json, find_best_result_index, find_best_workload};
pub use metrics::{service_scores, ServiceWeights, WorkloadResult};
pub use parameters::{WorkloadParams, WorkloadSet, WorkloadSpace};
pub use responder::FleetResponder;
pub use runner::{run_parallel_workloads, run_parallel_workloads_with_progress, run_single_workload};

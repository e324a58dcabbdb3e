//! Result export and ranking utilities.
//!
//! This module exports sweep results to CSV and JSON and finds the workload
//! with the best service score.

use std::fs::File;
use std::path::Path;

use crate::metrics::{service_scores, ServiceWeights, WorkloadResult};
use crate::parameters::WorkloadSet;

fn ensure_not_empty<T>(items: &[T]) -> Result<(), Box<dyn std::error::Error>> {
    if items.is_empty() {
        return Err("No results to export".into());
    }
    Ok(())
}

/// Export workload results with their parameters to CSV format.
///
/// Creates a CSV file with one column per parameter and per metric. Results
/// and workload sets are paired by index.
///
/// # Errors
///
/// Returns an error if file creation or CSV writing fails, or if the two
/// slices differ in length.
pub fn export_to_csv(
    results: &[WorkloadResult],
    workload_sets: &[WorkloadSet],
    path: impl AsRef<Path>,
) -> Result<(), Box<dyn std::error::Error>> {
    ensure_not_empty(results)?;
    if results.len() != workload_sets.len() {
        return Err(format!(
            "Results length ({}) doesn't match workload_sets length ({})",
            results.len(),
            workload_sets.len()
        )
        .into());
    }

    let file = File::create(path)?;
    let mut wtr = csv::Writer::from_writer(file);

    wtr.write_record([
        "experiment_id",
        "run_id",
        "seed",
        "fleet_size",
        "bookings",
        "accept_rate",
        "response_delay_ms",
        "trip_duration_ms",
        "offer_deadline_ms",
        "candidate_limit",
        "max_requeues",
        "retry_backoff_ms",
        "workers",
        "booking_ttl_ms",
        "bookings_submitted",
        "offers_made",
        "confirmed",
        "offers_rejected",
        "offer_timeouts",
        "reservation_conflicts",
        "requeues",
        "unmatched",
        "expired",
        "cancelled",
        "match_rate",
        "avg_time_to_confirm_ms",
        "wall_time_ms",
    ])?;

    for (result, set) in results.iter().zip(workload_sets.iter()) {
        let params = set.params;
        wtr.write_record([
            &set.experiment_id,
            &set.run_id.to_string(),
            &set.seed.to_string(),
            &params.fleet_size.to_string(),
            &params.bookings.to_string(),
            &params.accept_rate.to_string(),
            &params.response_delay_ms.to_string(),
            &params.trip_duration_ms.to_string(),
            &params.offer_deadline_ms.to_string(),
            &params.candidate_limit.to_string(),
            &params.max_requeues.to_string(),
            &params.retry_backoff_ms.to_string(),
            &params.workers.to_string(),
            &params.booking_ttl_ms.to_string(),
            &result.bookings_submitted.to_string(),
            &result.offers_made.to_string(),
            &result.confirmed.to_string(),
            &result.offers_rejected.to_string(),
            &result.offer_timeouts.to_string(),
            &result.reservation_conflicts.to_string(),
            &result.requeues.to_string(),
            &result.unmatched.to_string(),
            &result.expired.to_string(),
            &result.cancelled.to_string(),
            &result.match_rate.to_string(),
            &result.avg_time_to_confirm_ms.to_string(),
            &result.wall_time_ms.to_string(),
        ])?;
    }

    wtr.flush()?;
    Ok(())
}

/// Export workload results to JSON format.
///
/// Creates a JSON file with an array of all result rows.
///
/// # Errors
///
/// Returns an error if file creation or JSON serialization fails.
pub fn export_to_json(
    results: &[WorkloadResult],
    path: impl AsRef<Path>,
) -> Result<(), Box<dyn std::error::Error>> {
    let file = File::create(path)?;
    serde_json::to_writer_pretty(file, results)?;
    Ok(())
}

/// Find the index of the result with the highest service score.
///
/// # Returns
///
/// Index of the best result, or None if results are empty.
pub fn find_best_result_index(
    results: &[WorkloadResult],
    weights: &ServiceWeights,
) -> Option<usize> {
    let scores = service_scores(results, weights);
    scores
        .iter()
        .enumerate()
        .max_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
        .map(|(index, _)| index)
}

/// Find the workload set with the highest service score.
///
/// # Returns
///
/// The best workload set, or None if inputs are empty or mismatched.
pub fn find_best_workload<'a>(
    results: &[WorkloadResult],
    workload_sets: &'a [WorkloadSet],
    weights: &ServiceWeights,
) -> Option<&'a WorkloadSet> {
    if results.len() != workload_sets.len() {
        return None;
    }
    find_best_result_index(results, weights).map(|index| &workload_sets[index])
}

//! Example: Workload sweep across fleet size, fleet behavior and offer deadlines.
//!
//! This example demonstrates how to:
//! 1. Define a workload space
//! 2. Run the workloads in parallel
//! 3. Score results and find the best configuration
//! 4. Export results to CSV/JSON
//!
//! To sweep different knobs, change the space definition in main().

use dispatch_experiments::{
    export_to_csv, find_best_result_index, find_best_workload, run_parallel_workloads,
    ServiceWeights, WorkloadParams, WorkloadSpace,
};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("Starting workload sweep...");

    let base = WorkloadParams {
        bookings: 150,
        response_delay_ms: 5,
        trip_duration_ms: 400,
        ..Default::default()
    };
    let space = WorkloadSpace::grid()
        .with_base(base)
        .fleet_size(vec![25, 50, 100])
        .accept_rate(vec![0.6, 0.8, 1.0])
        .offer_deadline_ms(vec![500, 2_000]);

    println!("Generating workload sets...");
    let workload_sets = space.generate();
    println!("Generated {} workload combinations", workload_sets.len());

    // Run workloads in parallel (uses all available CPU cores by default)
    println!("Running workloads in parallel...");
    let results = run_parallel_workloads(workload_sets.clone(), None);
    println!("Completed {} workloads", results.len());

    println!("Scoring results...");
    let weights = ServiceWeights::default();
    let best_idx = find_best_result_index(&results, &weights).expect("No results to analyze");

    println!("\n=== Best Result ===");
    let best_result = &results[best_idx];
    println!("Match rate: {:.1}%", best_result.match_rate * 100.0);
    println!("Confirmed: {}", best_result.confirmed);
    println!("Unmatched: {}", best_result.unmatched);
    println!("Offer timeouts: {}", best_result.offer_timeouts);
    println!(
        "Avg time to confirm: {:.0} ms",
        best_result.avg_time_to_confirm_ms
    );
    println!("Wall time: {} ms", best_result.wall_time_ms);

    if let Some(best) = find_best_workload(&results, &workload_sets, &weights) {
        println!("\n=== Best Workload ===");
        println!("Experiment: {}", best.experiment_id);
        println!("Fleet size: {}", best.params.fleet_size);
        println!("Bookings: {}", best.params.bookings);
        println!("Accept rate: {:.0}%", best.params.accept_rate * 100.0);
        println!("Offer deadline: {} ms", best.params.offer_deadline_ms);
        println!("Candidate limit: {}", best.params.candidate_limit);
    }

    println!("\nExporting results...");
    export_to_csv(&results, &workload_sets, "workload_results.csv")?;
    println!("Exported to workload_results.csv");

    println!("\nSweep complete!");

    Ok(())
}

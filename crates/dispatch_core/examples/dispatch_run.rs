//! Stand up a dispatcher over a random Berlin fleet, replay a burst of
//! bookings against it and print the matching funnel.
//!
//! Run with: cargo run -p dispatch_core --example dispatch_run
//! Set RUST_LOG=dispatch_core=debug to watch individual match decisions.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use dispatch_core::assignment::BookingRequest;
use dispatch_core::clock::{Clock, SystemClock};
use dispatch_core::config::{DispatchConfig, MatchConfig};
use dispatch_core::engine::Dispatcher;
use dispatch_core::geo::distance_km;
use dispatch_core::notify::{MatchOutcome, NotificationSink, RecordingSink, SinkEvent};
use dispatch_core::registry::DriverSpec;
use dispatch_core::store::{InMemoryStore, Store};
use dispatch_core::types::{
    BookingId, Capabilities, CustomerId, DriverId, Location, VehicleFeature,
};

fn main() {
    const NUM_DRIVERS: u64 = 100;
    const NUM_BOOKINGS: u64 = 120;
    const ACCEPT_RATE: f64 = 0.85;
    const WALL_CAP: Duration = Duration::from_secs(30);

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    // Short deadlines and backoffs so the whole run takes seconds.
    let config = DispatchConfig {
        matching: MatchConfig::default()
            .with_offer_deadline_ms(400)
            .with_retry_backoff_ms(100)
            .with_max_requeues(4)
            .with_sweep_interval_ms(50)
            .with_workers(4),
        ..Default::default()
    };
    let sink = Arc::new(RecordingSink::new());
    let store = Arc::new(InMemoryStore::default());
    let dispatcher = Arc::new(Dispatcher::build(
        config,
        Arc::clone(&store) as Arc<dyn Store>,
        Arc::clone(&sink) as Arc<dyn NotificationSink>,
        Arc::new(SystemClock) as Arc<dyn Clock>,
    ));

    let mut rng = StdRng::seed_from_u64(123);
    for id in 1..=NUM_DRIVERS {
        let capabilities = if id % 4 == 0 {
            Capabilities::NONE.with(VehicleFeature::WheelchairAccess)
        } else {
            Capabilities::NONE
        };
        dispatcher
            .registry
            .register(DriverSpec {
                id: DriverId(id),
                location: Location {
                    lat: rng.gen_range(52.40..52.61),
                    lon: rng.gen_range(13.20..13.60),
                },
                capabilities,
            })
            .expect("register driver");
    }

    dispatcher.start();

    // Fleet side: answer each offer exactly once, mostly accepting. Drivers
    // stay on trip after a confirmation, so late bookings can run out of
    // candidates and go unmatched.
    let fleet = {
        let dispatcher = Arc::clone(&dispatcher);
        let sink = Arc::clone(&sink);
        thread::spawn(move || {
            let mut rng = StdRng::seed_from_u64(7);
            let mut answered = 0;
            let cap = Instant::now() + WALL_CAP;
            while Instant::now() < cap {
                let offers = sink.offers();
                for (driver, booking, _) in offers.iter().skip(answered).copied() {
                    // The offer may have lapsed under us; stale answers are
                    // rejected by the engine and ignored here.
                    if rng.gen_bool(ACCEPT_RATE) {
                        let _ = dispatcher.engine.accept_offer(booking, driver);
                    } else {
                        let _ = dispatcher.engine.reject_offer(booking, driver);
                    }
                }
                answered = offers.len();
                if dispatcher.telemetry.snapshot().resolved() >= NUM_BOOKINGS {
                    break;
                }
                thread::sleep(Duration::from_millis(10));
            }
        })
    };

    let started = Instant::now();
    for id in 1..=NUM_BOOKINGS {
        let required = if id % 10 == 0 {
            Capabilities::NONE.with(VehicleFeature::WheelchairAccess)
        } else {
            Capabilities::NONE
        };
        let now = SystemClock.now_ms();
        dispatcher
            .engine
            .submit(BookingRequest {
                id: BookingId(id),
                customer: CustomerId(10_000 + id),
                pickup: Location {
                    lat: rng.gen_range(52.45..52.56),
                    lon: rng.gen_range(13.30..13.50),
                },
                dropoff: Location {
                    lat: rng.gen_range(52.40..52.61),
                    lon: rng.gen_range(13.20..13.60),
                },
                required,
                requested_at_ms: now,
                expires_at_ms: now + 30_000,
            })
            .expect("submit booking");
    }

    fleet.join().expect("fleet thread");
    dispatcher.shutdown();
    let elapsed = started.elapsed();

    let snapshot = dispatcher.telemetry.snapshot();
    println!(
        "--- Dispatch run ({} drivers, {} bookings, seed 123) ---",
        NUM_DRIVERS, NUM_BOOKINGS
    );
    println!("Wall time:          {:.2} s", elapsed.as_secs_f64());
    println!("Bookings submitted: {}", snapshot.bookings_submitted);
    println!("Offers made:        {}", snapshot.offers_made);
    println!("Confirmed:          {}", snapshot.offers_accepted);
    println!("Rejected offers:    {}", snapshot.offers_rejected);
    println!("Offer timeouts:     {}", snapshot.offer_timeouts);
    println!("Requeues:           {}", snapshot.requeues);
    println!("Unmatched:          {}", snapshot.bookings_unmatched);
    println!(
        "Acceptance rate:    {:.1}%",
        snapshot.acceptance_rate() * 100.0
    );
    if let Some(avg) = snapshot.avg_time_to_confirm_ms() {
        println!("Avg time to confirm: {:.0} ms", avg);
    }

    let confirmed: Vec<(BookingId, DriverId)> = sink
        .events()
        .iter()
        .filter_map(|event| match event {
            SinkEvent::Resolution {
                booking,
                outcome: MatchOutcome::Confirmed { driver },
            } => Some((*booking, *driver)),
            _ => None,
        })
        .collect();

    if confirmed.is_empty() {
        println!("\nNo matches confirmed; check that drivers and pickups share the search radius.");
        return;
    }

    const SAMPLE: usize = 10;
    println!("\nSample confirmed matches (first {}):", SAMPLE);
    for (i, (booking, driver)) in confirmed.iter().take(SAMPLE).enumerate() {
        let assignment = dispatcher.board.snapshot(*booking).expect("assignment");
        let record = dispatcher.registry.snapshot(*driver).expect("driver record");
        println!(
            "  {}  {} -> {}  pickup_distance={:.2} km",
            i + 1,
            booking,
            driver,
            distance_km(assignment.pickup, record.location),
        );
    }
    if confirmed.len() > SAMPLE {
        println!("  ... and {} more", confirmed.len() - SAMPLE);
    }
}

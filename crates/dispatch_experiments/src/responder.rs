//! Scripted fleet behavior for workload runs.
//!
//! A `FleetResponder` plays the driver side against a live dispatcher: it
//! receives offers through the notification sink, answers them after a
//! configurable delay with a seeded accept/reject split, and hands drivers
//! back to the registry once their simulated trip ends.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use dispatch_core::engine::Dispatcher;
use dispatch_core::notify::{MatchOutcome, NotificationSink};
use dispatch_core::types::{BookingId, DriverId};

fn lock_inbox(
    inbox: &Mutex<VecDeque<(DriverId, BookingId)>>,
) -> MutexGuard<'_, VecDeque<(DriverId, BookingId)>> {
    inbox.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Simulated driver pool answering offers from a dispatcher.
///
/// The sink side only queues offers; a worker thread started with [`run`]
/// answers them, so the dispatcher's match loop is never re-entered from its
/// own call stack.
///
/// [`run`]: FleetResponder::run
pub struct FleetResponder {
    inbox: Mutex<VecDeque<(DriverId, BookingId)>>,
    accept_rate: f64,
    response_delay_ms: u64,
    trip_duration_ms: u64,
    seed: u64,
    stop: AtomicBool,
}

impl FleetResponder {
    pub fn new(accept_rate: f64, response_delay_ms: u64, trip_duration_ms: u64, seed: u64) -> Self {
        Self {
            inbox: Mutex::new(VecDeque::new()),
            accept_rate,
            response_delay_ms,
            trip_duration_ms,
            seed,
            stop: AtomicBool::new(false),
        }
    }

    /// Start the answering thread. Runs until [`stop`] is called.
    ///
    /// [`stop`]: FleetResponder::stop
    pub fn run(self: Arc<Self>, dispatcher: Arc<Dispatcher>) -> JoinHandle<()> {
        thread::spawn(move || self.answer_loop(&dispatcher))
    }

    /// Ask the answering thread to finish its inbox and exit.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    fn answer_loop(&self, dispatcher: &Dispatcher) {
        let mut rng = StdRng::seed_from_u64(self.seed);
        let mut on_trip: Vec<(DriverId, Instant)> = Vec::new();

        loop {
            let now = Instant::now();
            on_trip.retain(|(driver, done_at)| {
                if *done_at <= now {
                    dispatcher.registry.complete_trip(*driver);
                    false
                } else {
                    true
                }
            });

            let next = lock_inbox(&self.inbox).pop_front();
            match next {
                Some((driver, booking)) => {
                    if self.response_delay_ms > 0 {
                        thread::sleep(Duration::from_millis(self.response_delay_ms));
                    }
                    // The offer may have lapsed while we slept; the engine
                    // rejects stale answers and we move on.
                    if rng.gen_bool(self.accept_rate) {
                        if dispatcher.engine.accept_offer(booking, driver).is_ok() {
                            on_trip.push((
                                driver,
                                Instant::now() + Duration::from_millis(self.trip_duration_ms),
                            ));
                        }
                    } else {
                        let _ = dispatcher.engine.reject_offer(booking, driver);
                    }
                }
                None => {
                    if self.stop.load(Ordering::SeqCst) {
                        break;
                    }
                    thread::sleep(Duration::from_millis(2));
                }
            }
        }
    }
}

impl NotificationSink for FleetResponder {
    fn notify_offer(&self, driver: DriverId, booking: BookingId, _deadline_ms: u64) {
        lock_inbox(&self.inbox).push_back((driver, booking));
    }

    fn notify_resolution(&self, _booking: BookingId, _outcome: MatchOutcome) {}
}

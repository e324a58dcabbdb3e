#![allow(dead_code)]

use std::sync::Arc;

use dispatch_core::assignment::{BookingRequest, BookingState};
use dispatch_core::clock::{Clock, SimulatedClock};
use dispatch_core::config::{DispatchConfig, MatchConfig};
use dispatch_core::engine::Dispatcher;
use dispatch_core::notify::{NotificationSink, RecordingSink};
use dispatch_core::registry::DriverSpec;
use dispatch_core::store::{InMemoryStore, Store};
use dispatch_core::test_helpers::{near_pickup, TEST_DROPOFF, TEST_PICKUP};
use dispatch_core::types::{BookingId, Capabilities, CustomerId, DriverId, DriverStatus};

/// Simulated start of time for every test dispatcher.
pub const START_MS: u64 = 1_000_000;

/// Default booking time-to-live; generous enough that only tests that
/// advance the clock see expiries.
pub const DEFAULT_TTL_MS: u64 = 300_000;

/// Builder for a dispatcher wired to a simulated clock, a recording sink and
/// an in-memory store.
#[derive(Debug, Default)]
pub struct TestDispatchBuilder {
    matching: MatchConfig,
}

impl TestDispatchBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole matching configuration.
    pub fn with_matching(mut self, matching: MatchConfig) -> Self {
        self.matching = matching;
        self
    }

    pub fn with_offer_deadline_ms(mut self, deadline_ms: u64) -> Self {
        self.matching.offer_deadline_ms = deadline_ms;
        self
    }

    pub fn with_max_requeues(mut self, max_requeues: u32) -> Self {
        self.matching.max_requeues = max_requeues;
        self
    }

    pub fn with_retry_backoff_ms(mut self, backoff_ms: u64) -> Self {
        self.matching.retry_backoff_ms = backoff_ms;
        self
    }

    pub fn with_candidate_limit(mut self, limit: usize) -> Self {
        self.matching.candidate_limit = limit;
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.matching.workers = workers;
        self
    }

    pub fn with_sweep_interval_ms(mut self, interval_ms: u64) -> Self {
        self.matching.sweep_interval_ms = interval_ms;
        self
    }

    pub fn build(self) -> TestDispatch {
        let clock = Arc::new(SimulatedClock::starting_at(START_MS));
        let sink = Arc::new(RecordingSink::new());
        let store = Arc::new(InMemoryStore::new());
        let config = DispatchConfig {
            matching: self.matching,
            ..DispatchConfig::default()
        };
        let dispatcher = Dispatcher::build(
            config,
            Arc::clone(&store) as Arc<dyn Store>,
            Arc::clone(&sink) as Arc<dyn NotificationSink>,
            Arc::clone(&clock) as Arc<dyn Clock>,
        );
        TestDispatch {
            dispatcher,
            clock,
            sink,
            store,
        }
    }
}

/// A fully wired dispatcher plus handles to its test doubles.
pub struct TestDispatch {
    pub dispatcher: Dispatcher,
    pub clock: Arc<SimulatedClock>,
    pub sink: Arc<RecordingSink>,
    pub store: Arc<InMemoryStore>,
}

impl TestDispatch {
    pub fn with_defaults() -> Self {
        TestDispatchBuilder::new().build()
    }

    /// Register an available driver `offset_km` east of the test pickup.
    pub fn add_driver(&self, id: u64, offset_km: f64) -> DriverId {
        self.add_driver_with(id, offset_km, Capabilities::NONE)
    }

    pub fn add_driver_with(
        &self,
        id: u64,
        offset_km: f64,
        capabilities: Capabilities,
    ) -> DriverId {
        let driver = DriverId(id);
        self.dispatcher
            .registry
            .register(DriverSpec {
                id: driver,
                location: near_pickup(offset_km),
                capabilities,
            })
            .expect("register driver");
        driver
    }

    /// Submit a booking at the test pickup with the default time-to-live.
    pub fn submit_booking(&self, id: u64) -> BookingId {
        self.submit_booking_with(id, Capabilities::NONE, DEFAULT_TTL_MS)
    }

    pub fn submit_booking_with(
        &self,
        id: u64,
        required: Capabilities,
        ttl_ms: u64,
    ) -> BookingId {
        let booking = BookingId(id);
        let now = self.clock.now_ms();
        self.dispatcher
            .engine
            .submit(BookingRequest {
                id: booking,
                customer: CustomerId(id + 9_000),
                pickup: TEST_PICKUP,
                dropoff: TEST_DROPOFF,
                required,
                requested_at_ms: now,
                expires_at_ms: now + ttl_ms,
            })
            .expect("submit booking");
        booking
    }

    /// Drive exactly `n` match cycles on the calling thread. Each cycle
    /// blocks until the queue has a due entry, so counts must line up with
    /// what the test enqueued.
    pub fn run_cycles(&self, n: usize) {
        for _ in 0..n {
            assert!(
                self.dispatcher.engine.run_match_cycle(),
                "queue closed with cycles left to run"
            );
        }
    }

    pub fn booking_state(&self, booking: BookingId) -> BookingState {
        self.dispatcher
            .board
            .state_of(booking)
            .expect("known booking")
    }

    pub fn driver_status(&self, driver: DriverId) -> DriverStatus {
        self.dispatcher
            .registry
            .status_of(driver)
            .expect("known driver")
    }

    /// Advance the simulated clock, then run one reconciliation pass.
    /// Returns the number of repair actions the sweep took.
    pub fn advance_and_sweep(&self, ms: u64) -> usize {
        self.clock.advance(ms);
        self.dispatcher.engine.run_reconciliation()
    }

    /// The driver currently holding an open offer for `booking`.
    pub fn offered_driver(&self, booking: BookingId) -> Option<DriverId> {
        self.dispatcher
            .engine
            .offer_for(booking)
            .map(|reservation| reservation.driver)
    }

    pub fn pickup_distance_km(&self, offset_km: f64) -> f64 {
        dispatch_core::geo::distance_km(TEST_PICKUP, near_pickup(offset_km))
    }

    pub fn dropoff_distance_km(&self) -> f64 {
        dispatch_core::geo::distance_km(TEST_PICKUP, TEST_DROPOFF)
    }
}

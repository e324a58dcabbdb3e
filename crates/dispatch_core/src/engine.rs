//! The match engine: worker loops, the offer lifecycle and the
//! reconciliation sweep.
//!
//! Matching is greedy and sequential per booking. The nearest untried
//! candidate gets a reservation attempt, a successful reservation becomes the
//! booking's single outstanding offer, and the booking rests until the driver
//! answers or the offer deadline lapses. Losing a reservation race just moves
//! the search to the next candidate.
//!
//! There is no cross-component transaction. Consistency relies on ordering
//! (reserve, then offer, then notify) plus the periodic sweep, which rolls
//! lapsed offers back to `Pending`, releases orphaned holds and retries
//! failed store writes.

use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::assignment::{Assignment, AssignmentBoard, BookingRequest, BookingState};
use crate::clock::Clock;
use crate::config::{DispatchConfig, MatchConfig};
use crate::error::{DispatchError, DispatchResult};
use crate::geo::GeoIndex;
use crate::notify::{MatchOutcome, NotificationSink};
use crate::queue::{BookingQueue, QueueItem, QueuedBooking};
use crate::registry::DriverRegistry;
use crate::store::Store;
use crate::telemetry::MatchTelemetry;
use crate::types::{BookingId, DriverId};

/// An outstanding offer: a reserved driver bound to a booking until the
/// deadline.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reservation {
    pub booking: BookingId,
    pub driver: DriverId,
    pub offered_at_ms: u64,
    pub deadline_ms: u64,
    pub distance_km: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct OfferDeadline {
    deadline_ms: u64,
    booking: BookingId,
    driver: DriverId,
}

impl Ord for OfferDeadline {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Reverse ordering to make BinaryHeap a min-heap by deadline.
        other
            .deadline_ms
            .cmp(&self.deadline_ms)
            .then_with(|| other.booking.cmp(&self.booking))
    }
}

impl PartialOrd for OfferDeadline {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// How one pass over the candidate rings ended.
enum OfferRound {
    /// An offer is out; the booking leaves the queue until it settles.
    Offered,
    /// Every reachable candidate was tried or taken.
    Exhausted,
    /// The booking stopped being `Pending` mid-search.
    BookingGone,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn queued_entry(assignment: &Assignment) -> QueuedBooking {
    QueuedBooking {
        booking: assignment.booking,
        requested_at_ms: assignment.requested_at_ms,
        expires_at_ms: assignment.expires_at_ms,
    }
}

fn retry_backoff_ms(base_ms: u64, attempts: u32) -> u64 {
    let exponent = attempts.saturating_sub(1).min(16);
    base_ms.saturating_mul(1u64 << exponent)
}

pub struct MatchEngine {
    geo: Arc<GeoIndex>,
    registry: Arc<DriverRegistry>,
    queue: Arc<BookingQueue>,
    board: Arc<AssignmentBoard>,
    notifier: Arc<dyn NotificationSink>,
    clock: Arc<dyn Clock>,
    telemetry: Arc<MatchTelemetry>,
    config: MatchConfig,
    offers: Mutex<HashMap<BookingId, Reservation>>,
    deadlines: Mutex<BinaryHeap<OfferDeadline>>,
    shutting_down: AtomicBool,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl MatchEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        geo: Arc<GeoIndex>,
        registry: Arc<DriverRegistry>,
        queue: Arc<BookingQueue>,
        board: Arc<AssignmentBoard>,
        notifier: Arc<dyn NotificationSink>,
        clock: Arc<dyn Clock>,
        telemetry: Arc<MatchTelemetry>,
        config: MatchConfig,
    ) -> Self {
        Self {
            geo,
            registry,
            queue,
            board,
            notifier,
            clock,
            telemetry,
            config,
            offers: Mutex::new(HashMap::new()),
            deadlines: Mutex::new(BinaryHeap::new()),
            shutting_down: AtomicBool::new(false),
            workers: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &MatchConfig {
        &self.config
    }

    /// Admit a booking and hand it to the match workers.
    pub fn submit(&self, request: BookingRequest) -> DispatchResult<()> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(DispatchError::ShuttingDown(request.id));
        }
        for location in [request.pickup, request.dropoff] {
            if !location.is_valid() {
                return Err(DispatchError::InvalidLocation {
                    lat: location.lat,
                    lon: location.lon,
                });
            }
        }
        self.board.open(request)?;
        self.telemetry.record_submitted();
        let entry = QueuedBooking {
            booking: request.id,
            requested_at_ms: request.requested_at_ms,
            expires_at_ms: request.expires_at_ms,
        };
        if !self.queue.enqueue(entry) {
            // Lost the race with shutdown; close the booking out.
            let _ = self.board.transition(request.id, BookingState::Cancelled);
            return Err(DispatchError::ShuttingDown(request.id));
        }
        debug!(booking = %request.id, "booking submitted");
        Ok(())
    }

    /// Pull one booking off the queue and drive it through a match round.
    /// Blocks while the queue is empty; returns false once it is closed and
    /// drained.
    pub fn run_match_cycle(&self) -> bool {
        let Some(item) = self.queue.dequeue() else {
            return false;
        };
        match item {
            QueueItem::Expired(entry) => self.expire_booking(entry),
            QueueItem::Ready(entry) => self.match_booking(entry),
        }
        true
    }

    fn expire_booking(&self, entry: QueuedBooking) {
        match self.board.transition(entry.booking, BookingState::Expired) {
            Ok(_) => {
                self.telemetry.record_expired();
                debug!(booking = %entry.booking, "booking expired before a match");
                self.notifier
                    .notify_resolution(entry.booking, MatchOutcome::Expired);
            }
            // Settled some other way while it sat in the queue.
            Err(_) => {}
        }
    }

    fn match_booking(&self, entry: QueuedBooking) {
        let Some(assignment) = self.board.snapshot(entry.booking) else {
            return;
        };
        if assignment.state != BookingState::Pending {
            return;
        }
        match self.offer_to_nearest(&assignment) {
            OfferRound::Offered | OfferRound::BookingGone => {}
            OfferRound::Exhausted => self.finish_round(entry),
        }
    }

    /// Walk candidates nearest-first, widening the radius until an offer
    /// sticks or the search caps out.
    fn offer_to_nearest(&self, assignment: &Assignment) -> OfferRound {
        let booking = assignment.booking;
        let mut tried: HashSet<DriverId> = assignment.offered_drivers.clone();
        let mut radius_km = self.config.search_radius_km;
        loop {
            // Ask for enough extra to see past drivers already tried.
            let limit = self.config.candidate_limit + tried.len();
            let candidates = match self.geo.query_radius(assignment.pickup, radius_km, limit) {
                Ok(candidates) => candidates,
                Err(error) => {
                    warn!(%booking, %error, "candidate query failed");
                    return OfferRound::Exhausted;
                }
            };
            for (driver, distance_km) in candidates {
                if tried.contains(&driver) {
                    continue;
                }
                if !self.registry.meets_requirements(driver, assignment.required) {
                    tried.insert(driver);
                    continue;
                }
                // Give up mid-search if the booking settled under us.
                if self.board.state_of(booking) != Some(BookingState::Pending) {
                    return OfferRound::BookingGone;
                }
                if !self.registry.try_reserve(driver, booking) {
                    self.telemetry.record_reservation_conflict();
                    tried.insert(driver);
                    continue;
                }
                return match self.place_offer(booking, driver, distance_km) {
                    Ok(()) => OfferRound::Offered,
                    Err(_) => OfferRound::BookingGone,
                };
            }
            if radius_km >= self.config.max_radius_km {
                return OfferRound::Exhausted;
            }
            radius_km = (radius_km * 2.0).min(self.config.max_radius_km);
        }
    }

    /// Turn a fresh reservation into the booking's outstanding offer. The
    /// offers entry goes in before the board flips to `Offered`, so a booking
    /// the board shows as `Offered` always has a live entry.
    fn place_offer(
        &self,
        booking: BookingId,
        driver: DriverId,
        distance_km: f64,
    ) -> DispatchResult<()> {
        let now = self.clock.now_ms();
        let reservation = Reservation {
            booking,
            driver,
            offered_at_ms: now,
            deadline_ms: now + self.config.offer_deadline_ms,
            distance_km,
        };
        lock(&self.offers).insert(booking, reservation);
        if let Err(error) = self.board.record_offer(booking, driver) {
            // Lost a race with a cancellation; put the driver back.
            lock(&self.offers).remove(&booking);
            self.registry.release(driver, booking);
            debug!(%booking, %driver, "offer abandoned, booking settled mid-placement");
            return Err(error);
        }
        lock(&self.deadlines).push(OfferDeadline {
            deadline_ms: reservation.deadline_ms,
            booking,
            driver,
        });
        self.telemetry.record_offer();
        debug!(%booking, %driver, distance_km, "offer placed");
        self.notifier
            .notify_offer(driver, booking, reservation.deadline_ms);
        Ok(())
    }

    /// No candidate accepted a reservation this round: requeue with backoff
    /// or give the booking up.
    fn finish_round(&self, entry: QueuedBooking) {
        let booking = entry.booking;
        let Ok(attempts) = self.board.bump_attempts(booking) else {
            return;
        };
        if attempts > self.config.max_requeues {
            self.give_up(booking, attempts);
            return;
        }
        // Next round starts from scratch; drivers that conflicted or
        // declined may be free again by then.
        self.board.reset_offered(booking);
        let backoff_ms = retry_backoff_ms(self.config.retry_backoff_ms, attempts);
        self.telemetry.record_requeue();
        debug!(%booking, attempts, backoff_ms, "no driver reserved, requeueing");
        self.queue
            .enqueue_delayed(entry, self.clock.now_ms() + backoff_ms);
    }

    fn give_up(&self, booking: BookingId, rounds: u32) {
        if self.board.transition(booking, BookingState::Unmatched).is_err() {
            return;
        }
        let error = DispatchError::NoDriversAvailable {
            booking,
            reason: format!(
                "{rounds} search rounds exhausted at {:.1} km",
                self.config.max_radius_km
            ),
        };
        warn!(%error, "booking unmatched");
        self.telemetry.record_unmatched();
        self.notifier.notify_resolution(
            booking,
            MatchOutcome::Unmatched {
                reason: error.to_string(),
            },
        );
    }

    /// Driver accepts the outstanding offer. Fails for the wrong driver, a
    /// lapsed offer or a settled booking.
    pub fn accept_offer(&self, booking: BookingId, driver: DriverId) -> DispatchResult<()> {
        let accepted = self
            .board
            .resolve_offer(booking, driver, BookingState::Accepted)?;
        lock(&self.offers).remove(&booking);
        if !self.registry.confirm(driver, booking) {
            // The hold is gone, e.g. released by a racing cancellation. Put
            // the booking back in line unless it settled meanwhile.
            if self.board.transition(booking, BookingState::Pending).is_ok() {
                self.queue.requeue_front(queued_entry(&accepted));
            }
            return Err(DispatchError::InvalidTransition {
                booking,
                from: BookingState::Accepted,
                to: BookingState::Confirmed,
            });
        }
        if let Err(error) = self.board.transition(booking, BookingState::Confirmed) {
            // Cancelled in the gap between accept and confirm; the trip is
            // void, free the driver.
            self.registry.complete_trip(driver);
            return Err(error);
        }
        let waited_ms = self.clock.now_ms().saturating_sub(accepted.requested_at_ms);
        self.telemetry.record_confirmed(waited_ms);
        info!(%booking, %driver, waited_ms, "booking confirmed");
        self.notifier
            .notify_resolution(booking, MatchOutcome::Confirmed { driver });
        Ok(())
    }

    /// Driver declines the outstanding offer. The booking goes straight back
    /// to the front of the line with the driver kept in its skip set.
    pub fn reject_offer(&self, booking: BookingId, driver: DriverId) -> DispatchResult<()> {
        let rejected = self
            .board
            .resolve_offer(booking, driver, BookingState::Rejected)?;
        lock(&self.offers).remove(&booking);
        self.registry.release(driver, booking);
        self.telemetry.record_rejected();
        debug!(%booking, %driver, "offer rejected");
        self.notifier
            .notify_resolution(booking, MatchOutcome::Rejected { driver });
        if self.board.transition(booking, BookingState::Pending).is_ok() {
            self.queue.requeue_front(queued_entry(&rejected));
        }
        Ok(())
    }

    /// Customer withdraws the booking. Legal until `Confirmed`; any
    /// outstanding offer is torn down and its driver released.
    pub fn cancel_booking(&self, booking: BookingId) -> DispatchResult<()> {
        let previous = self.board.transition(booking, BookingState::Cancelled)?;
        lock(&self.offers).remove(&booking);
        if let Some(driver) = previous.assigned_driver {
            if !self.registry.release(driver, booking) {
                // The driver accepted while we cancelled and is already on
                // the (now void) trip.
                self.registry.complete_trip(driver);
            }
        }
        self.telemetry.record_cancelled();
        info!(%booking, "booking cancelled");
        self.notifier
            .notify_resolution(booking, MatchOutcome::Cancelled);
        Ok(())
    }

    pub fn offer_for(&self, booking: BookingId) -> Option<Reservation> {
        lock(&self.offers).get(&booking).copied()
    }

    pub fn outstanding_offers(&self) -> usize {
        lock(&self.offers).len()
    }

    /// One pass of the repair sweep. Returns how many actions it took; the
    /// background sweeper runs this on a fixed cadence.
    pub fn run_reconciliation(&self) -> usize {
        let now = self.clock.now_ms();
        let mut actions = 0;
        actions += self.resolve_lapsed_offers(now);
        actions += self.recover_stuck_offers();
        actions += self.release_orphaned_holds(now);
        actions += self.registry.retry_unpersisted();
        actions += self.board.retry_unpersisted();
        actions += self.registry.evict_stale();
        actions
    }

    /// Roll offers whose deadline passed back to `Pending` and requeue them
    /// at the front.
    fn resolve_lapsed_offers(&self, now: u64) -> usize {
        let mut due = Vec::new();
        {
            let mut deadlines = lock(&self.deadlines);
            while deadlines
                .peek()
                .map_or(false, |next| next.deadline_ms <= now)
            {
                if let Some(next) = deadlines.pop() {
                    due.push(next);
                }
            }
        }
        let mut resolved = 0;
        for entry in due {
            // Heap entries are lazy: skip ones whose offer already settled or
            // was replaced by a newer offer to the same booking.
            let live = lock(&self.offers).get(&entry.booking).map_or(false, |r| {
                r.driver == entry.driver && r.deadline_ms == entry.deadline_ms
            });
            if live && self.lapse_offer(entry.booking, entry.driver) {
                resolved += 1;
            }
        }
        resolved
    }

    fn lapse_offer(&self, booking: BookingId, driver: DriverId) -> bool {
        // Board first: if the driver answers concurrently, exactly one side
        // wins the Offered state.
        let Ok(previous) = self
            .board
            .resolve_offer(booking, driver, BookingState::Pending)
        else {
            return false;
        };
        lock(&self.offers).remove(&booking);
        self.registry.release(driver, booking);
        self.telemetry.record_offer_timeout();
        debug!(%booking, %driver, "offer timed out");
        self.notifier
            .notify_resolution(booking, MatchOutcome::TimedOut { driver });
        self.queue.requeue_front(queued_entry(&previous));
        true
    }

    /// Bookings the board shows as `Offered` with no live offers entry, e.g.
    /// restored from the store after a restart. Treated as lapsed.
    fn recover_stuck_offers(&self) -> usize {
        let mut recovered = 0;
        for (booking, driver) in self.board.offered_bookings() {
            if lock(&self.offers).contains_key(&booking) {
                continue;
            }
            if self.lapse_offer(booking, driver) {
                recovered += 1;
            }
        }
        recovered
    }

    /// Release holds with no matching offer once they outlive the offer
    /// deadline. Covers reserve/offer pairs that died halfway.
    fn release_orphaned_holds(&self, now: u64) -> usize {
        let mut released = 0;
        for (driver, booking, since_ms) in self.registry.reserved_pairs() {
            if now.saturating_sub(since_ms) <= self.config.offer_deadline_ms {
                continue;
            }
            let matches_offer = lock(&self.offers)
                .get(&booking)
                .map_or(false, |r| r.driver == driver);
            if matches_offer {
                continue;
            }
            if self.registry.release(driver, booking) {
                self.telemetry.record_orphaned_release();
                warn!(%driver, %booking, "released orphaned reservation");
                released += 1;
            }
        }
        released
    }

    /// Spawn the match workers and the reconciliation sweeper. Idempotent
    /// while running.
    pub fn start(self: Arc<Self>) {
        let mut workers = lock(&self.workers);
        if !workers.is_empty() {
            return;
        }
        self.shutting_down.store(false, Ordering::SeqCst);
        for _ in 0..self.config.workers {
            let engine = Arc::clone(&self);
            workers.push(thread::spawn(move || engine.worker_loop()));
        }
        let engine = Arc::clone(&self);
        workers.push(thread::spawn(move || engine.sweep_loop()));
        info!(workers = self.config.workers, "match engine started");
    }

    /// Stop accepting bookings, drain the workers and join them.
    pub fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        self.queue.close();
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *lock(&self.workers));
        for handle in handles {
            if handle.join().is_err() {
                warn!("engine thread panicked before shutdown");
            }
        }
        info!("match engine stopped");
    }

    fn worker_loop(&self) {
        while !self.shutting_down.load(Ordering::SeqCst) {
            if !self.run_match_cycle() {
                break;
            }
        }
    }

    fn sweep_loop(&self) {
        while !self.shutting_down.load(Ordering::SeqCst) {
            self.run_reconciliation();
            thread::sleep(Duration::from_millis(self.config.sweep_interval_ms));
        }
    }
}

/// The matching parts wired together over a shared store, sink and clock.
pub struct Dispatcher {
    pub geo: Arc<GeoIndex>,
    pub registry: Arc<DriverRegistry>,
    pub queue: Arc<BookingQueue>,
    pub board: Arc<AssignmentBoard>,
    pub engine: Arc<MatchEngine>,
    pub telemetry: Arc<MatchTelemetry>,
}

impl Dispatcher {
    pub fn build(
        config: DispatchConfig,
        store: Arc<dyn Store>,
        notifier: Arc<dyn NotificationSink>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let telemetry = Arc::new(MatchTelemetry::default());
        let geo = Arc::new(GeoIndex::new(config.geo));
        let registry = Arc::new(DriverRegistry::new(
            Arc::clone(&geo),
            Arc::clone(&store),
            Arc::clone(&clock),
            config.matching.stale_after_ms,
            Arc::clone(&telemetry),
        ));
        let queue = Arc::new(BookingQueue::new(Arc::clone(&clock)));
        let board = Arc::new(AssignmentBoard::new(store, Arc::clone(&telemetry)));
        let engine = Arc::new(MatchEngine::new(
            Arc::clone(&geo),
            Arc::clone(&registry),
            Arc::clone(&queue),
            Arc::clone(&board),
            notifier,
            clock,
            Arc::clone(&telemetry),
            config.matching,
        ));
        Self {
            geo,
            registry,
            queue,
            board,
            engine,
            telemetry,
        }
    }

    /// Spawn the engine's workers and its sweeper.
    pub fn start(&self) {
        Arc::clone(&self.engine).start();
    }

    /// Stop the workers and wait for them to finish.
    pub fn shutdown(&self) {
        self.engine.shutdown();
    }
}

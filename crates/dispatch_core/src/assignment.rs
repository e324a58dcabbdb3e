//! Booking lifecycle: the assignment state machine and the shared board.
//!
//! States move `Pending -> Offered -> Accepted -> Confirmed` on the happy
//! path. `Offered -> Rejected` and `Offered -> Pending` (lapsed offer) feed
//! the retry loop; `Cancelled`, `Expired` and `Unmatched` are the remaining
//! terminals. Terminal states accept no further transitions.
//!
//! The board serializes every change to one booking behind its shard lock and
//! writes through to the store while holding it. A failed write never blocks
//! matching: the in-memory state stays authoritative and the record is
//! flagged until a retry flushes it.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{DispatchError, DispatchResult};
use crate::store::{BookingRecord, Store};
use crate::telemetry::MatchTelemetry;
use crate::types::{BookingId, Capabilities, CustomerId, DriverId, Location};

const SHARD_COUNT: usize = 16;

/// Lifecycle state of a booking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BookingState {
    /// Queued, no offer outstanding.
    Pending,
    /// A reserved driver holds an open offer.
    Offered,
    /// The driver accepted; confirmation is in flight.
    Accepted,
    /// Driver and booking are bound. Terminal.
    Confirmed,
    /// The offered driver declined; the booking retries.
    Rejected,
    /// Withdrawn by the customer. Terminal.
    Cancelled,
    /// The booking deadline lapsed before a match. Terminal.
    Expired,
    /// Candidate search exhausted its retry rounds. Terminal.
    Unmatched,
}

impl BookingState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            BookingState::Confirmed
                | BookingState::Cancelled
                | BookingState::Expired
                | BookingState::Unmatched
        )
    }

    fn permits(self, next: BookingState) -> bool {
        use BookingState::*;
        matches!(
            (self, next),
            (Pending, Offered)
                | (Pending, Unmatched)
                | (Pending, Expired)
                | (Pending, Cancelled)
                | (Offered, Accepted)
                | (Offered, Rejected)
                | (Offered, Pending)
                | (Offered, Cancelled)
                | (Accepted, Confirmed)
                | (Accepted, Cancelled)
                | (Accepted, Pending)
                | (Rejected, Pending)
                | (Rejected, Offered)
                | (Rejected, Unmatched)
                | (Rejected, Expired)
                | (Rejected, Cancelled)
        )
    }
}

/// A new booking as submitted.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BookingRequest {
    pub id: BookingId,
    pub customer: CustomerId,
    pub pickup: Location,
    pub dropoff: Location,
    pub required: Capabilities,
    pub requested_at_ms: u64,
    pub expires_at_ms: u64,
}

/// Live matching state of one booking.
#[derive(Debug, Clone)]
pub struct Assignment {
    pub booking: BookingId,
    pub customer: CustomerId,
    pub pickup: Location,
    pub dropoff: Location,
    pub required: Capabilities,
    pub requested_at_ms: u64,
    pub expires_at_ms: u64,
    pub state: BookingState,
    pub assigned_driver: Option<DriverId>,
    /// Requeue rounds consumed so far.
    pub attempts: u32,
    /// Drivers already tried this round; skipped by candidate search.
    pub offered_drivers: HashSet<DriverId>,
    /// Set when the last store write failed; cleared by the retry sweep.
    pub unpersisted: bool,
}

impl Assignment {
    fn from_request(request: BookingRequest) -> Self {
        Self {
            booking: request.id,
            customer: request.customer,
            pickup: request.pickup,
            dropoff: request.dropoff,
            required: request.required,
            requested_at_ms: request.requested_at_ms,
            expires_at_ms: request.expires_at_ms,
            state: BookingState::Pending,
            assigned_driver: None,
            attempts: 0,
            offered_drivers: HashSet::new(),
            unpersisted: false,
        }
    }

    fn from_record(record: BookingRecord) -> Self {
        Self {
            booking: record.id,
            customer: record.customer,
            pickup: record.pickup,
            dropoff: record.dropoff,
            required: record.required,
            requested_at_ms: record.requested_at_ms,
            expires_at_ms: record.expires_at_ms,
            state: record.state,
            assigned_driver: record.assigned_driver,
            attempts: record.attempts,
            offered_drivers: HashSet::new(),
            unpersisted: false,
        }
    }

    fn to_record(&self) -> BookingRecord {
        BookingRecord {
            id: self.booking,
            customer: self.customer,
            pickup: self.pickup,
            dropoff: self.dropoff,
            required: self.required,
            requested_at_ms: self.requested_at_ms,
            expires_at_ms: self.expires_at_ms,
            state: self.state,
            assigned_driver: self.assigned_driver,
            attempts: self.attempts,
        }
    }
}

fn lock_shard<T>(shard: &Mutex<T>) -> MutexGuard<'_, T> {
    shard.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Shard-locked table of every booking the dispatcher knows about.
///
/// All state changes go through the board, which checks the transition table
/// and persists the updated record before releasing the booking's shard.
pub struct AssignmentBoard {
    shards: Vec<Mutex<HashMap<BookingId, Assignment>>>,
    store: Arc<dyn Store>,
    telemetry: Arc<MatchTelemetry>,
}

impl AssignmentBoard {
    pub fn new(store: Arc<dyn Store>, telemetry: Arc<MatchTelemetry>) -> Self {
        Self {
            shards: (0..SHARD_COUNT).map(|_| Mutex::new(HashMap::new())).collect(),
            store,
            telemetry,
        }
    }

    fn shard(&self, booking: BookingId) -> &Mutex<HashMap<BookingId, Assignment>> {
        &self.shards[booking.0 as usize % SHARD_COUNT]
    }

    fn persist(&self, assignment: &mut Assignment) {
        match self.store.save_booking(&assignment.to_record()) {
            Ok(()) => assignment.unpersisted = false,
            Err(error) => {
                assignment.unpersisted = true;
                self.telemetry.record_store_write_failure();
                warn!(booking = %assignment.booking, %error, "booking write failed, keeping in-memory state");
            }
        }
    }

    /// Admit a new booking in `Pending`. Rejects duplicate ids.
    pub fn open(&self, request: BookingRequest) -> DispatchResult<()> {
        let mut shard = lock_shard(self.shard(request.id));
        if let Some(existing) = shard.get(&request.id) {
            return Err(DispatchError::InvalidTransition {
                booking: request.id,
                from: existing.state,
                to: BookingState::Pending,
            });
        }
        let mut assignment = Assignment::from_request(request);
        self.persist(&mut assignment);
        shard.insert(request.id, assignment);
        Ok(())
    }

    /// Apply a state change and persist it. Returns the assignment as it was
    /// before the change, so callers see the binding they displaced.
    pub fn transition(&self, booking: BookingId, to: BookingState) -> DispatchResult<Assignment> {
        let mut shard = lock_shard(self.shard(booking));
        let assignment = shard
            .get_mut(&booking)
            .ok_or(DispatchError::UnknownBooking(booking))?;
        if !assignment.state.permits(to) {
            return Err(DispatchError::InvalidTransition {
                booking,
                from: assignment.state,
                to,
            });
        }
        let previous = assignment.clone();
        assignment.state = to;
        assignment.assigned_driver = match to {
            BookingState::Offered | BookingState::Accepted | BookingState::Confirmed => {
                assignment.assigned_driver
            }
            _ => None,
        };
        self.persist(assignment);
        Ok(previous)
    }

    /// Bind a driver and move `Pending -> Offered` in one step.
    pub fn record_offer(&self, booking: BookingId, driver: DriverId) -> DispatchResult<()> {
        let mut shard = lock_shard(self.shard(booking));
        let assignment = shard
            .get_mut(&booking)
            .ok_or(DispatchError::UnknownBooking(booking))?;
        if !assignment.state.permits(BookingState::Offered) {
            return Err(DispatchError::InvalidTransition {
                booking,
                from: assignment.state,
                to: BookingState::Offered,
            });
        }
        assignment.state = BookingState::Offered;
        assignment.assigned_driver = Some(driver);
        assignment.offered_drivers.insert(driver);
        self.persist(assignment);
        Ok(())
    }

    /// Settle an outstanding offer. Fails unless the booking is `Offered` to
    /// exactly `driver`, so late or duplicate answers bounce off. Returns the
    /// assignment as it was before the change.
    pub fn resolve_offer(
        &self,
        booking: BookingId,
        driver: DriverId,
        to: BookingState,
    ) -> DispatchResult<Assignment> {
        let mut shard = lock_shard(self.shard(booking));
        let assignment = shard
            .get_mut(&booking)
            .ok_or(DispatchError::UnknownBooking(booking))?;
        if assignment.state != BookingState::Offered
            || assignment.assigned_driver != Some(driver)
            || !assignment.state.permits(to)
        {
            return Err(DispatchError::InvalidTransition {
                booking,
                from: assignment.state,
                to,
            });
        }
        let previous = assignment.clone();
        assignment.state = to;
        assignment.assigned_driver = match to {
            BookingState::Accepted => Some(driver),
            _ => None,
        };
        self.persist(assignment);
        Ok(previous)
    }

    pub fn snapshot(&self, booking: BookingId) -> Option<Assignment> {
        lock_shard(self.shard(booking)).get(&booking).cloned()
    }

    pub fn state_of(&self, booking: BookingId) -> Option<BookingState> {
        lock_shard(self.shard(booking))
            .get(&booking)
            .map(|assignment| assignment.state)
    }

    /// Consume one requeue round. Returns the new attempt count.
    pub fn bump_attempts(&self, booking: BookingId) -> DispatchResult<u32> {
        let mut shard = lock_shard(self.shard(booking));
        let assignment = shard
            .get_mut(&booking)
            .ok_or(DispatchError::UnknownBooking(booking))?;
        assignment.attempts += 1;
        let attempts = assignment.attempts;
        self.persist(assignment);
        Ok(attempts)
    }

    /// Clear the tried-driver set so the next round reconsiders everyone.
    pub fn reset_offered(&self, booking: BookingId) {
        let mut shard = lock_shard(self.shard(booking));
        if let Some(assignment) = shard.get_mut(&booking) {
            assignment.offered_drivers.clear();
        }
    }

    /// Bookings currently `Offered`, with their bound driver. Sweep input.
    pub fn offered_bookings(&self) -> Vec<(BookingId, DriverId)> {
        let mut offered = Vec::new();
        for shard in &self.shards {
            let shard = lock_shard(shard);
            for assignment in shard.values() {
                if assignment.state == BookingState::Offered {
                    if let Some(driver) = assignment.assigned_driver {
                        offered.push((assignment.booking, driver));
                    }
                }
            }
        }
        offered
    }

    /// Re-attempt store writes that failed earlier. Returns how many flushed.
    pub fn retry_unpersisted(&self) -> usize {
        let mut flushed = 0;
        for shard in &self.shards {
            let mut shard = lock_shard(shard);
            for assignment in shard.values_mut() {
                if assignment.unpersisted
                    && self.store.save_booking(&assignment.to_record()).is_ok()
                {
                    assignment.unpersisted = false;
                    flushed += 1;
                    self.telemetry.record_store_retry_flushed();
                }
            }
        }
        flushed
    }

    /// Rebuild the board from stored records, e.g. after a restart. Tried
    /// drivers are not persisted; retries start with a clean skip set.
    pub fn restore(&self, records: Vec<BookingRecord>) {
        for record in records {
            let assignment = Assignment::from_record(record);
            lock_shard(self.shard(assignment.booking)).insert(assignment.booking, assignment);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;
    use crate::test_helpers::FlakyStore;

    fn request(id: u64) -> BookingRequest {
        BookingRequest {
            id: BookingId(id),
            customer: CustomerId(id + 100),
            pickup: Location::new(52.52, 13.405),
            dropoff: Location::new(52.50, 13.45),
            required: Capabilities::NONE,
            requested_at_ms: 1_000,
            expires_at_ms: 301_000,
        }
    }

    fn board_with(store: Arc<dyn Store>) -> AssignmentBoard {
        AssignmentBoard::new(store, Arc::new(MatchTelemetry::default()))
    }

    fn board() -> AssignmentBoard {
        board_with(Arc::new(InMemoryStore::new()))
    }

    #[test]
    fn happy_path_tracks_the_assigned_driver() {
        let board = board();
        let booking = BookingId(1);
        board.open(request(1)).expect("open");
        assert_eq!(board.state_of(booking), Some(BookingState::Pending));

        board.record_offer(booking, DriverId(9)).expect("offer");
        let snapshot = board.snapshot(booking).expect("snapshot");
        assert_eq!(snapshot.state, BookingState::Offered);
        assert_eq!(snapshot.assigned_driver, Some(DriverId(9)));
        assert!(snapshot.offered_drivers.contains(&DriverId(9)));

        let before = board
            .resolve_offer(booking, DriverId(9), BookingState::Accepted)
            .expect("accept");
        assert_eq!(before.state, BookingState::Offered);

        board.transition(booking, BookingState::Confirmed).expect("confirm");
        let snapshot = board.snapshot(booking).expect("snapshot");
        assert_eq!(snapshot.state, BookingState::Confirmed);
        assert_eq!(snapshot.assigned_driver, Some(DriverId(9)));
        assert!(snapshot.state.is_terminal());
    }

    #[test]
    fn terminal_states_reject_every_transition() {
        let board = board();
        let booking = BookingId(1);
        board.open(request(1)).expect("open");
        board.record_offer(booking, DriverId(9)).expect("offer");
        board
            .resolve_offer(booking, DriverId(9), BookingState::Accepted)
            .expect("accept");
        board.transition(booking, BookingState::Confirmed).expect("confirm");

        let err = board
            .transition(booking, BookingState::Cancelled)
            .expect_err("terminal");
        assert!(matches!(
            err,
            DispatchError::InvalidTransition {
                from: BookingState::Confirmed,
                to: BookingState::Cancelled,
                ..
            }
        ));
        assert_eq!(board.state_of(booking), Some(BookingState::Confirmed));
    }

    #[test]
    fn lapsed_offer_clears_the_driver_but_keeps_the_skip_set() {
        let board = board();
        let booking = BookingId(1);
        board.open(request(1)).expect("open");
        board.record_offer(booking, DriverId(9)).expect("offer");

        let before = board
            .transition(booking, BookingState::Pending)
            .expect("lapse");
        assert_eq!(before.assigned_driver, Some(DriverId(9)));

        let snapshot = board.snapshot(booking).expect("snapshot");
        assert_eq!(snapshot.state, BookingState::Pending);
        assert_eq!(snapshot.assigned_driver, None);
        assert!(snapshot.offered_drivers.contains(&DriverId(9)));
    }

    #[test]
    fn resolve_offer_rejects_the_wrong_driver_and_late_answers() {
        let board = board();
        let booking = BookingId(1);
        board.open(request(1)).expect("open");
        board.record_offer(booking, DriverId(9)).expect("offer");

        // Wrong driver.
        assert!(board
            .resolve_offer(booking, DriverId(8), BookingState::Accepted)
            .is_err());
        assert_eq!(board.state_of(booking), Some(BookingState::Offered));

        // Late answer after the offer lapsed.
        board.transition(booking, BookingState::Pending).expect("lapse");
        assert!(board
            .resolve_offer(booking, DriverId(9), BookingState::Accepted)
            .is_err());
        assert_eq!(board.state_of(booking), Some(BookingState::Pending));
    }

    #[test]
    fn cancel_is_legal_from_every_non_terminal_state() {
        for setup in 0..4 {
            let board = board();
            let booking = BookingId(1);
            board.open(request(1)).expect("open");
            match setup {
                0 => {} // Pending
                1 => {
                    board.record_offer(booking, DriverId(9)).expect("offer");
                }
                2 => {
                    board.record_offer(booking, DriverId(9)).expect("offer");
                    board
                        .resolve_offer(booking, DriverId(9), BookingState::Accepted)
                        .expect("accept");
                }
                _ => {
                    board.record_offer(booking, DriverId(9)).expect("offer");
                    board
                        .resolve_offer(booking, DriverId(9), BookingState::Rejected)
                        .expect("reject");
                }
            }
            board.transition(booking, BookingState::Cancelled).expect("cancel");
            assert_eq!(board.state_of(booking), Some(BookingState::Cancelled));
        }
    }

    #[test]
    fn attempts_bump_and_skip_set_reset() {
        let board = board();
        let booking = BookingId(1);
        board.open(request(1)).expect("open");
        board.record_offer(booking, DriverId(9)).expect("offer");
        board.transition(booking, BookingState::Pending).expect("lapse");

        assert_eq!(board.bump_attempts(booking).expect("bump"), 1);
        assert_eq!(board.bump_attempts(booking).expect("bump"), 2);

        board.reset_offered(booking);
        let snapshot = board.snapshot(booking).expect("snapshot");
        assert!(snapshot.offered_drivers.is_empty());
        assert_eq!(snapshot.attempts, 2);
    }

    #[test]
    fn duplicate_open_is_rejected() {
        let board = board();
        board.open(request(1)).expect("open");
        let err = board.open(request(1)).expect_err("duplicate");
        assert!(matches!(err, DispatchError::InvalidTransition { .. }));
    }

    #[test]
    fn transitions_write_through_to_the_store() {
        let store = Arc::new(InMemoryStore::new());
        let board = board_with(Arc::clone(&store) as Arc<dyn Store>);
        let booking = BookingId(1);
        board.open(request(1)).expect("open");
        board.record_offer(booking, DriverId(9)).expect("offer");

        let record = store.load_booking(booking).expect("load").expect("present");
        assert_eq!(record.state, BookingState::Offered);
        assert_eq!(record.assigned_driver, Some(DriverId(9)));
    }

    #[test]
    fn failed_writes_flag_the_assignment_and_flush_on_retry() {
        let store = Arc::new(FlakyStore::new());
        let board = board_with(Arc::clone(&store) as Arc<dyn Store>);
        let booking = BookingId(1);
        board.open(request(1)).expect("open");

        store.set_failing(true);
        board.record_offer(booking, DriverId(9)).expect("offer");
        let snapshot = board.snapshot(booking).expect("snapshot");
        assert_eq!(snapshot.state, BookingState::Offered);
        assert!(snapshot.unpersisted);

        store.set_failing(false);
        assert_eq!(board.retry_unpersisted(), 1);
        assert!(!board.snapshot(booking).expect("snapshot").unpersisted);

        let record = store.load_booking(booking).expect("load").expect("present");
        assert_eq!(record.state, BookingState::Offered);
    }

    #[test]
    fn restore_rebuilds_assignments_with_a_clean_skip_set() {
        let board = board();
        let booking = BookingId(1);
        board.open(request(1)).expect("open");
        board.record_offer(booking, DriverId(9)).expect("offer");
        let record = board.snapshot(booking).expect("snapshot").to_record();

        let restored = board_with(Arc::new(InMemoryStore::new()));
        restored.restore(vec![record]);
        let snapshot = restored.snapshot(booking).expect("snapshot");
        assert_eq!(snapshot.state, BookingState::Offered);
        assert_eq!(snapshot.assigned_driver, Some(DriverId(9)));
        assert!(snapshot.offered_drivers.is_empty());
        assert_eq!(restored.offered_bookings(), vec![(booking, DriverId(9))]);
    }
}

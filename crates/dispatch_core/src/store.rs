//! Durable storage seam for driver and booking records.
//!
//! The dispatcher is authoritative in memory and writes through to a `Store`.
//! A write failure never blocks matching: the owning structure flags the
//! record unpersisted and the reconciliation sweep retries it.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};

use crate::assignment::BookingState;
use crate::error::StoreError;
use crate::types::{BookingId, Capabilities, CustomerId, DriverId, DriverStatus, Location};

/// Persistent record of one driver.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DriverRecord {
    pub id: DriverId,
    pub location: Location,
    pub status: DriverStatus,
    pub last_updated_ms: u64,
    pub capabilities: Capabilities,
    /// Soft deactivation flag; drivers are never hard-deleted.
    pub active: bool,
    pub reserved_for: Option<BookingId>,
}

/// Persistent record of one booking.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BookingRecord {
    pub id: BookingId,
    pub customer: CustomerId,
    pub pickup: Location,
    pub dropoff: Location,
    pub required: Capabilities,
    pub requested_at_ms: u64,
    pub expires_at_ms: u64,
    pub state: BookingState,
    pub assigned_driver: Option<DriverId>,
    pub attempts: u32,
}

/// One interface in front of whatever backend a deployment uses. Backends
/// are adapters behind this trait, not parallel code paths.
pub trait Store: Send + Sync {
    fn load_driver(&self, id: DriverId) -> Result<Option<DriverRecord>, StoreError>;
    fn save_driver(&self, record: &DriverRecord) -> Result<(), StoreError>;
    fn load_booking(&self, id: BookingId) -> Result<Option<BookingRecord>, StoreError>;
    fn save_booking(&self, record: &BookingRecord) -> Result<(), StoreError>;
}

fn lock_table<T>(table: &Mutex<T>) -> MutexGuard<'_, T> {
    table.lock().unwrap_or_else(PoisonError::into_inner)
}

/// HashMap-backed store for tests, demos and single-node deployments.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    drivers: Mutex<HashMap<DriverId, DriverRecord>>,
    bookings: Mutex<HashMap<BookingId, BookingRecord>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn driver_count(&self) -> usize {
        lock_table(&self.drivers).len()
    }

    pub fn booking_count(&self) -> usize {
        lock_table(&self.bookings).len()
    }
}

impl Store for InMemoryStore {
    fn load_driver(&self, id: DriverId) -> Result<Option<DriverRecord>, StoreError> {
        Ok(lock_table(&self.drivers).get(&id).copied())
    }

    fn save_driver(&self, record: &DriverRecord) -> Result<(), StoreError> {
        lock_table(&self.drivers).insert(record.id, *record);
        Ok(())
    }

    fn load_booking(&self, id: BookingId) -> Result<Option<BookingRecord>, StoreError> {
        Ok(lock_table(&self.bookings).get(&id).copied())
    }

    fn save_booking(&self, record: &BookingRecord) -> Result<(), StoreError> {
        lock_table(&self.bookings).insert(record.id, *record);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_driver() -> DriverRecord {
        DriverRecord {
            id: DriverId(1),
            location: Location::new(52.52, 13.405),
            status: DriverStatus::Available,
            last_updated_ms: 1_000,
            capabilities: Capabilities::NONE,
            active: true,
            reserved_for: None,
        }
    }

    #[test]
    fn driver_records_round_trip() {
        let store = InMemoryStore::new();
        assert_eq!(store.load_driver(DriverId(1)).expect("load"), None);

        let record = sample_driver();
        store.save_driver(&record).expect("save");
        assert_eq!(store.load_driver(DriverId(1)).expect("load"), Some(record));
        assert_eq!(store.driver_count(), 1);

        let moved = DriverRecord {
            status: DriverStatus::Reserved,
            reserved_for: Some(BookingId(9)),
            ..record
        };
        store.save_driver(&moved).expect("save");
        assert_eq!(store.load_driver(DriverId(1)).expect("load"), Some(moved));
        assert_eq!(store.driver_count(), 1);
    }

    #[test]
    fn booking_records_round_trip() {
        let store = InMemoryStore::new();
        let record = BookingRecord {
            id: BookingId(5),
            customer: CustomerId(77),
            pickup: Location::new(0.0, 0.0),
            dropoff: Location::new(0.0, 0.1),
            required: Capabilities::NONE,
            requested_at_ms: 500,
            expires_at_ms: 500 + 300_000,
            state: BookingState::Pending,
            assigned_driver: None,
            attempts: 0,
        };
        store.save_booking(&record).expect("save");
        assert_eq!(store.load_booking(BookingId(5)).expect("load"), Some(record));
        assert_eq!(store.load_booking(BookingId(6)).expect("load"), None);
        assert_eq!(store.booking_count(), 1);
    }
}

//! Test helpers for common test setup and utilities.
//!
//! This module provides shared fixtures to reduce duplication across test
//! files. It compiles behind the `test-helpers` feature (on by default) so
//! integration tests and benches can use it too.

use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::StoreError;
use crate::store::{BookingRecord, DriverRecord, InMemoryStore, Store};
use crate::types::{BookingId, DriverId, Location};

/// Alexanderplatz, Berlin. The standard pickup point across test files.
pub const TEST_PICKUP: Location = Location {
    lat: 52.5219,
    lon: 13.4132,
};

/// Brandenburg Gate, roughly 2.4 km west of the test pickup.
pub const TEST_DROPOFF: Location = Location {
    lat: 52.5163,
    lon: 13.3777,
};

/// A point approximately `offset_km` east of the test pickup.
///
/// Useful for placing drivers at known distances; the offset is exact enough
/// for radius assertions at city scale.
pub fn near_pickup(offset_km: f64) -> Location {
    // One degree of longitude spans ~67.8 km at Berlin's latitude.
    Location::new(TEST_PICKUP.lat, TEST_PICKUP.lon + offset_km / 67.8)
}

/// An `InMemoryStore` whose writes can be switched to fail, for exercising
/// the write-through fallback and the retry sweep.
#[derive(Default)]
pub struct FlakyStore {
    inner: InMemoryStore,
    failing: AtomicBool,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn gate(&self) -> Result<(), StoreError> {
        if self.failing.load(Ordering::SeqCst) {
            Err(StoreError::new("injected store failure"))
        } else {
            Ok(())
        }
    }
}

impl Store for FlakyStore {
    fn load_driver(&self, id: DriverId) -> Result<Option<DriverRecord>, StoreError> {
        self.gate()?;
        self.inner.load_driver(id)
    }

    fn save_driver(&self, record: &DriverRecord) -> Result<(), StoreError> {
        self.gate()?;
        self.inner.save_driver(record)
    }

    fn load_booking(&self, id: BookingId) -> Result<Option<BookingRecord>, StoreError> {
        self.gate()?;
        self.inner.load_booking(id)
    }

    fn save_booking(&self, record: &BookingRecord) -> Result<(), StoreError> {
        self.gate()?;
        self.inner.save_booking(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo::distance_km;

    #[test]
    fn fixture_points_sit_at_city_scale() {
        let d = distance_km(TEST_PICKUP, TEST_DROPOFF);
        assert!((1.5..3.5).contains(&d), "got {d}");
    }

    #[test]
    fn near_pickup_offsets_are_accurate() {
        let d = distance_km(TEST_PICKUP, near_pickup(5.0));
        assert!((d - 5.0).abs() < 0.25, "got {d}");
    }

    #[test]
    fn flaky_store_fails_only_while_switched_on() {
        use crate::assignment::BookingState;
        use crate::types::{Capabilities, CustomerId, DriverStatus};

        let store = FlakyStore::new();
        let record = BookingRecord {
            id: BookingId(1),
            customer: CustomerId(2),
            pickup: TEST_PICKUP,
            dropoff: TEST_DROPOFF,
            required: Capabilities::NONE,
            requested_at_ms: 0,
            expires_at_ms: 60_000,
            state: BookingState::Pending,
            assigned_driver: None,
            attempts: 0,
        };
        store.save_booking(&record).expect("write");

        store.set_failing(true);
        assert!(store.save_booking(&record).is_err());
        assert!(store.load_booking(BookingId(1)).is_err());

        store.set_failing(false);
        assert!(store.load_booking(BookingId(1)).expect("read").is_some());

        let driver = DriverRecord {
            id: DriverId(7),
            location: TEST_PICKUP,
            status: DriverStatus::Available,
            last_updated_ms: 0,
            capabilities: Capabilities::NONE,
            active: true,
            reserved_for: None,
        };
        store.save_driver(&driver).expect("write");
        assert!(store.load_driver(DriverId(7)).expect("read").is_some());
    }
}

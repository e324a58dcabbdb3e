//! Driver pool: profiles, availability and reservation holds.
//!
//! Reservations are compare-and-set. `try_reserve` either atomically moves an
//! Available driver to Reserved for one booking or returns false without
//! blocking, so workers racing for the same candidate settle in one shard
//! lock acquisition.
//!
//! The registry owns spatial index membership: a driver is queryable exactly
//! while it is active, Available and fresh. Reserving, going offline,
//! deactivating or turning stale removes it; releasing, completing a trip or
//! a location update puts it back.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::warn;

use crate::clock::Clock;
use crate::error::{DispatchError, DispatchResult};
use crate::geo::GeoIndex;
use crate::store::{DriverRecord, Store};
use crate::telemetry::MatchTelemetry;
use crate::types::{BookingId, Capabilities, DriverId, DriverStatus, Location};

const SHARD_COUNT: usize = 16;

/// Driver profile handed to `register`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DriverSpec {
    pub id: DriverId,
    pub location: Location,
    pub capabilities: Capabilities,
}

/// Pool occupancy by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryCounts {
    pub available: usize,
    pub reserved: usize,
    pub on_trip: usize,
    pub offline: usize,
}

#[derive(Debug, Clone, Copy)]
struct ReservationHold {
    booking: BookingId,
    since_ms: u64,
}

#[derive(Debug, Clone, Copy)]
struct DriverEntry {
    location: Location,
    status: DriverStatus,
    last_updated_ms: u64,
    capabilities: Capabilities,
    active: bool,
    reserved: Option<ReservationHold>,
    unpersisted: bool,
}

impl DriverEntry {
    fn to_record(self, id: DriverId) -> DriverRecord {
        DriverRecord {
            id,
            location: self.location,
            status: self.status,
            last_updated_ms: self.last_updated_ms,
            capabilities: self.capabilities,
            active: self.active,
            reserved_for: self.reserved.map(|hold| hold.booking),
        }
    }
}

fn lock_shard<T>(shard: &Mutex<T>) -> MutexGuard<'_, T> {
    shard.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct DriverRegistry {
    shards: Vec<Mutex<HashMap<DriverId, DriverEntry>>>,
    geo: Arc<GeoIndex>,
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    stale_after_ms: u64,
    telemetry: Arc<MatchTelemetry>,
}

impl DriverRegistry {
    pub fn new(
        geo: Arc<GeoIndex>,
        store: Arc<dyn Store>,
        clock: Arc<dyn Clock>,
        stale_after_ms: u64,
        telemetry: Arc<MatchTelemetry>,
    ) -> Self {
        Self {
            shards: (0..SHARD_COUNT).map(|_| Mutex::new(HashMap::new())).collect(),
            geo,
            store,
            clock,
            stale_after_ms,
            telemetry,
        }
    }

    fn shard(&self, driver: DriverId) -> &Mutex<HashMap<DriverId, DriverEntry>> {
        &self.shards[driver.0 as usize % SHARD_COUNT]
    }

    fn persist(&self, driver: DriverId, entry: &mut DriverEntry) {
        match self.store.save_driver(&entry.to_record(driver)) {
            Ok(()) => entry.unpersisted = false,
            Err(error) => {
                entry.unpersisted = true;
                self.telemetry.record_store_write_failure();
                warn!(%driver, %error, "driver write failed, keeping in-memory state");
            }
        }
    }

    fn index(&self, driver: DriverId, location: Location) {
        // Stored locations were validated on the way in, so this only fails
        // if the grid itself misbehaves.
        if let Err(error) = self.geo.insert_or_update(driver, location) {
            warn!(%driver, %error, "driver could not be indexed");
        }
    }

    /// Add a driver to the pool or bring a known one back online. A driver
    /// mid-reservation or mid-trip only gets its profile refreshed.
    pub fn register(&self, spec: DriverSpec) -> DispatchResult<()> {
        if !spec.location.is_valid() {
            return Err(DispatchError::InvalidLocation {
                lat: spec.location.lat,
                lon: spec.location.lon,
            });
        }
        let now = self.clock.now_ms();
        let mut shard = lock_shard(self.shard(spec.id));
        let index_at = match shard.get_mut(&spec.id) {
            None => {
                let mut entry = DriverEntry {
                    location: spec.location,
                    status: DriverStatus::Available,
                    last_updated_ms: now,
                    capabilities: spec.capabilities,
                    active: true,
                    reserved: None,
                    unpersisted: false,
                };
                self.persist(spec.id, &mut entry);
                shard.insert(spec.id, entry);
                Some(spec.location)
            }
            Some(entry) => {
                entry.capabilities = spec.capabilities;
                entry.active = true;
                match entry.status {
                    DriverStatus::Offline | DriverStatus::Available => {
                        entry.status = DriverStatus::Available;
                        entry.location = spec.location;
                        entry.last_updated_ms = now;
                        self.persist(spec.id, entry);
                        Some(spec.location)
                    }
                    DriverStatus::Reserved | DriverStatus::OnTrip => {
                        self.persist(spec.id, entry);
                        None
                    }
                }
            }
        };
        drop(shard);
        if let Some(location) = index_at {
            self.index(spec.id, location);
        }
        Ok(())
    }

    /// Claim a driver for one booking. Succeeds only for an active, fresh,
    /// Available driver with no other hold; otherwise returns false with
    /// nothing changed.
    pub fn try_reserve(&self, driver: DriverId, booking: BookingId) -> bool {
        let now = self.clock.now_ms();
        let mut shard = lock_shard(self.shard(driver));
        let Some(entry) = shard.get_mut(&driver) else {
            return false;
        };
        let fresh = now.saturating_sub(entry.last_updated_ms) <= self.stale_after_ms;
        if !entry.active
            || entry.status != DriverStatus::Available
            || entry.reserved.is_some()
            || !fresh
        {
            return false;
        }
        entry.status = DriverStatus::Reserved;
        entry.reserved = Some(ReservationHold {
            booking,
            since_ms: now,
        });
        self.persist(driver, entry);
        drop(shard);
        self.geo.remove(driver);
        true
    }

    /// Drop a hold and return the driver to the pool. Succeeds only if the
    /// driver is reserved for exactly `booking`.
    pub fn release(&self, driver: DriverId, booking: BookingId) -> bool {
        let mut shard = lock_shard(self.shard(driver));
        let Some(entry) = shard.get_mut(&driver) else {
            return false;
        };
        if entry.status != DriverStatus::Reserved
            || entry.reserved.map(|hold| hold.booking) != Some(booking)
        {
            return false;
        }
        entry.reserved = None;
        // A driver deactivated mid-hold leaves the pool instead.
        entry.status = if entry.active {
            DriverStatus::Available
        } else {
            DriverStatus::Offline
        };
        let index_at = entry.active.then_some(entry.location);
        self.persist(driver, entry);
        drop(shard);
        if let Some(location) = index_at {
            self.index(driver, location);
        }
        true
    }

    /// Turn a hold into a trip. The driver stays out of the index until the
    /// trip completes.
    pub fn confirm(&self, driver: DriverId, booking: BookingId) -> bool {
        let mut shard = lock_shard(self.shard(driver));
        let Some(entry) = shard.get_mut(&driver) else {
            return false;
        };
        if entry.status != DriverStatus::Reserved
            || entry.reserved.map(|hold| hold.booking) != Some(booking)
        {
            return false;
        }
        entry.status = DriverStatus::OnTrip;
        entry.reserved = None;
        self.persist(driver, entry);
        true
    }

    /// Refresh a driver's position. Always updates the stored point and its
    /// freshness stamp; the index follows only while the driver is matchable.
    pub fn update_location(&self, driver: DriverId, location: Location) -> DispatchResult<()> {
        if !location.is_valid() {
            return Err(DispatchError::InvalidLocation {
                lat: location.lat,
                lon: location.lon,
            });
        }
        let now = self.clock.now_ms();
        let mut shard = lock_shard(self.shard(driver));
        let entry = shard
            .get_mut(&driver)
            .ok_or(DispatchError::UnknownDriver(driver))?;
        entry.location = location;
        entry.last_updated_ms = now;
        let index_now = entry.active && entry.status == DriverStatus::Available;
        self.persist(driver, entry);
        drop(shard);
        if index_now {
            self.geo.insert_or_update(driver, location)?;
        }
        Ok(())
    }

    /// Take an Available driver off shift. False while reserved or on a trip.
    pub fn go_offline(&self, driver: DriverId) -> bool {
        let mut shard = lock_shard(self.shard(driver));
        let Some(entry) = shard.get_mut(&driver) else {
            return false;
        };
        if entry.status != DriverStatus::Available {
            return false;
        }
        entry.status = DriverStatus::Offline;
        self.persist(driver, entry);
        drop(shard);
        self.geo.remove(driver);
        true
    }

    /// Finish the current trip and rejoin the pool at the stored location.
    pub fn complete_trip(&self, driver: DriverId) -> bool {
        let mut shard = lock_shard(self.shard(driver));
        let Some(entry) = shard.get_mut(&driver) else {
            return false;
        };
        if entry.status != DriverStatus::OnTrip {
            return false;
        }
        entry.status = if entry.active {
            DriverStatus::Available
        } else {
            DriverStatus::Offline
        };
        let index_at = entry.active.then_some(entry.location);
        self.persist(driver, entry);
        drop(shard);
        if let Some(location) = index_at {
            self.index(driver, location);
        }
        true
    }

    /// Soft-remove a driver. An in-flight reservation or trip finishes
    /// normally, but no new holds are granted.
    pub fn deactivate(&self, driver: DriverId) -> bool {
        let mut shard = lock_shard(self.shard(driver));
        let Some(entry) = shard.get_mut(&driver) else {
            return false;
        };
        entry.active = false;
        let unindex = entry.status == DriverStatus::Available;
        if unindex {
            entry.status = DriverStatus::Offline;
        }
        self.persist(driver, entry);
        drop(shard);
        if unindex {
            self.geo.remove(driver);
        }
        true
    }

    pub fn status_of(&self, driver: DriverId) -> Option<DriverStatus> {
        lock_shard(self.shard(driver))
            .get(&driver)
            .map(|entry| entry.status)
    }

    pub fn snapshot(&self, driver: DriverId) -> Option<DriverRecord> {
        lock_shard(self.shard(driver))
            .get(&driver)
            .map(|entry| entry.to_record(driver))
    }

    /// Whether the driver's capabilities cover everything `required`.
    pub fn meets_requirements(&self, driver: DriverId, required: Capabilities) -> bool {
        lock_shard(self.shard(driver))
            .get(&driver)
            .map(|entry| entry.capabilities.satisfies(required))
            .unwrap_or(false)
    }

    /// Every outstanding hold as `(driver, booking, held_since_ms)`. Sweep
    /// input for orphan detection.
    pub fn reserved_pairs(&self) -> Vec<(DriverId, BookingId, u64)> {
        let mut pairs = Vec::new();
        for shard in &self.shards {
            let shard = lock_shard(shard);
            for (driver, entry) in shard.iter() {
                if let Some(hold) = entry.reserved {
                    pairs.push((*driver, hold.booking, hold.since_ms));
                }
            }
        }
        pairs
    }

    pub fn counts(&self) -> RegistryCounts {
        let mut counts = RegistryCounts::default();
        for shard in &self.shards {
            let shard = lock_shard(shard);
            for entry in shard.values() {
                match entry.status {
                    DriverStatus::Available => counts.available += 1,
                    DriverStatus::Reserved => counts.reserved += 1,
                    DriverStatus::OnTrip => counts.on_trip += 1,
                    DriverStatus::Offline => counts.offline += 1,
                }
            }
        }
        counts
    }

    /// Drop stale Available drivers out of the spatial index. Their status is
    /// untouched; a location update makes them matchable again. Returns how
    /// many were evicted.
    pub fn evict_stale(&self) -> usize {
        let now = self.clock.now_ms();
        let mut evicted = 0;
        for shard in &self.shards {
            let shard = lock_shard(shard);
            for (driver, entry) in shard.iter() {
                let stale = now.saturating_sub(entry.last_updated_ms) > self.stale_after_ms;
                if stale
                    && entry.active
                    && entry.status == DriverStatus::Available
                    && self.geo.contains(*driver)
                {
                    self.geo.remove(*driver);
                    self.telemetry.record_stale_eviction();
                    evicted += 1;
                }
            }
        }
        evicted
    }

    /// Re-attempt store writes that failed earlier. Returns how many flushed.
    pub fn retry_unpersisted(&self) -> usize {
        let mut flushed = 0;
        for (index, shard) in self.shards.iter().enumerate() {
            let mut shard = lock_shard(shard);
            for (driver, entry) in shard.iter_mut() {
                debug_assert_eq!(driver.0 as usize % SHARD_COUNT, index);
                if entry.unpersisted && self.store.save_driver(&entry.to_record(*driver)).is_ok() {
                    entry.unpersisted = false;
                    flushed += 1;
                    self.telemetry.record_store_retry_flushed();
                }
            }
        }
        flushed
    }

    /// Rebuild the pool from stored records, e.g. after a restart. Holds are
    /// re-aged from now so the orphan sweep gives them a fresh grace period.
    pub fn restore(&self, records: Vec<DriverRecord>) {
        let now = self.clock.now_ms();
        for record in records {
            let entry = DriverEntry {
                location: record.location,
                status: record.status,
                last_updated_ms: record.last_updated_ms,
                capabilities: record.capabilities,
                active: record.active,
                reserved: record.reserved_for.map(|booking| ReservationHold {
                    booking,
                    since_ms: now,
                }),
                unpersisted: false,
            };
            let index_at = (entry.active && entry.status == DriverStatus::Available)
                .then_some(entry.location);
            lock_shard(self.shard(record.id)).insert(record.id, entry);
            if let Some(location) = index_at {
                self.index(record.id, location);
            }
        }
    }
}

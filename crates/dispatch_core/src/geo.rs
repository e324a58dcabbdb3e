//! Spatial operations: H3-based driver indexing and distance calculations.
//!
//! This module provides:
//!
//! - **GeoGrid**: Wrapper for H3 resolution configuration
//! - **Grid disk queries**: Find cells within K grid distance, with caching
//! - **Distance calculations**: Haversine distance between coordinates
//! - **GeoIndex**: H3 cell → driver mappings for radius queries
//!
//! Default resolution is 8 (~460m cell size), suitable for city-scale
//! dispatch radii.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::{Mutex, MutexGuard, PoisonError};

use h3o::{CellIndex, LatLng, Resolution};
use lru::LruCache;

use crate::config::GeoConfig;
use crate::error::{DispatchError, DispatchResult};
use crate::types::{DriverId, Location};

/// Shards for the driver and cell tables. Queries touch only cell shards;
/// updates serialize per driver and touch one cell shard at a time.
const SHARD_COUNT: usize = 16;

/// Haversine distance in kilometers between two coordinates.
pub fn distance_km(a: Location, b: Location) -> f64 {
    let (lat1, lon1) = (a.lat.to_radians(), a.lon.to_radians());
    let (lat2, lon2) = (b.lat.to_radians(), b.lon.to_radians());
    let dlat = lat2 - lat1;
    let dlon = lon2 - lon1;
    let sin_dlat = (dlat * 0.5).sin();
    let sin_dlon = (dlon * 0.5).sin();
    let h = sin_dlat * sin_dlat + lat1.cos() * lat2.cos() * sin_dlon * sin_dlon;
    let c = 2.0 * h.sqrt().atan2((1.0 - h).sqrt());
    6371.0 * c
}

fn location_of_cell(cell: CellIndex) -> Location {
    let center: LatLng = cell.into();
    Location::new(center.lat(), center.lng())
}

#[derive(Debug, Clone, Copy)]
pub struct GeoGrid {
    resolution: Resolution,
}

impl GeoGrid {
    pub fn new(resolution: Resolution) -> Self {
        Self { resolution }
    }

    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    /// Map a coordinate to its H3 cell at this grid's resolution.
    pub fn cell_for(&self, location: Location) -> DispatchResult<CellIndex> {
        if !location.is_valid() {
            return Err(DispatchError::InvalidLocation {
                lat: location.lat,
                lon: location.lon,
            });
        }
        let latlng = LatLng::new(location.lat, location.lon).map_err(|_| {
            DispatchError::InvalidLocation {
                lat: location.lat,
                lon: location.lon,
            }
        })?;
        Ok(latlng.to_cell(self.resolution))
    }

    pub fn grid_disk(&self, origin: CellIndex, k: u32) -> Vec<CellIndex> {
        debug_assert_eq!(
            origin.resolution(),
            self.resolution,
            "origin resolution must match grid resolution"
        );
        origin.grid_disk::<Vec<_>>(k)
    }

    /// Shortest center-to-center distance from `origin` to a neighbor (km).
    ///
    /// Measured from the live grid instead of a per-resolution constant
    /// table; it is the step size used to turn a km radius into a ring count.
    fn ring_step_km(&self, origin: CellIndex) -> f64 {
        let center = location_of_cell(origin);
        origin
            .grid_disk::<Vec<_>>(1)
            .into_iter()
            .filter(|cell| *cell != origin)
            .map(|cell| distance_km(center, location_of_cell(cell)))
            .fold(f64::INFINITY, f64::min)
    }

    /// Ring count whose disk covers every driver within `radius_km` of a
    /// point in `origin`.
    pub fn rings_for_radius(&self, origin: CellIndex, radius_km: f64) -> u32 {
        let step = self.ring_step_km(origin);
        if !step.is_finite() || step <= f64::EPSILON {
            return 1;
        }
        // Ring k sits no closer than k * step * sqrt(3)/2 to the origin
        // center (hexagon edge midpoints). Two extra rings absorb the offset
        // of the query point and of the drivers from their cell centers.
        let effective_step = step * (3.0_f64.sqrt() / 2.0);
        (radius_km / effective_step).ceil() as u32 + 2
    }
}

impl Default for GeoGrid {
    fn default() -> Self {
        Self {
            resolution: GeoConfig::default().resolution,
        }
    }
}

/// Grid disk cache for repeated radius queries out of hot cells.
struct GridDiskCache {
    cache: Mutex<LruCache<(CellIndex, u32), Vec<CellIndex>>>,
}

impl GridDiskCache {
    fn new(entries: usize) -> Self {
        let entries = NonZeroUsize::new(entries.max(1)).expect("cache size must be non-zero");
        Self {
            cache: Mutex::new(LruCache::new(entries)),
        }
    }

    fn get_or_compute(&self, origin: CellIndex, k: u32, grid: &GeoGrid) -> Vec<CellIndex> {
        let mut cache = match self.cache.lock() {
            Ok(guard) => guard,
            Err(_) => return grid.grid_disk(origin, k), // Fallback: compute without cache if mutex poisoned
        };
        cache
            .get_or_insert((origin, k), || grid.grid_disk(origin, k))
            .clone()
    }
}

#[derive(Debug, Clone, Copy)]
struct IndexedDriver {
    location: Location,
    cell: CellIndex,
}

fn lock_shard<T>(shard: &Mutex<T>) -> MutexGuard<'_, T> {
    shard.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Spatial index over matchable drivers.
///
/// Driver positions are bucketed by H3 cell; radius queries enumerate the
/// grid disk covering the radius and filter by exact haversine distance, so
/// query cost scales with the disk's population rather than the fleet size.
///
/// Thread safety: the per-driver table and the cell buckets are shard-locked.
/// Updates hold the driver's shard while they move the bucket entry, so a
/// driver is present in at most one cell bucket at any instant (briefly in
/// none while moving between cells).
pub struct GeoIndex {
    grid: GeoGrid,
    disk_cache: GridDiskCache,
    driver_shards: Vec<Mutex<HashMap<DriverId, IndexedDriver>>>,
    cell_shards: Vec<Mutex<HashMap<CellIndex, Vec<(DriverId, Location)>>>>,
}

impl GeoIndex {
    pub fn new(config: GeoConfig) -> Self {
        Self {
            grid: GeoGrid::new(config.resolution),
            disk_cache: GridDiskCache::new(config.disk_cache_entries),
            driver_shards: (0..SHARD_COUNT).map(|_| Mutex::new(HashMap::new())).collect(),
            cell_shards: (0..SHARD_COUNT).map(|_| Mutex::new(HashMap::new())).collect(),
        }
    }

    pub fn grid(&self) -> &GeoGrid {
        &self.grid
    }

    fn driver_shard(&self, driver: DriverId) -> &Mutex<HashMap<DriverId, IndexedDriver>> {
        &self.driver_shards[driver.0 as usize % SHARD_COUNT]
    }

    fn cell_shard(&self, cell: CellIndex) -> &Mutex<HashMap<CellIndex, Vec<(DriverId, Location)>>> {
        &self.cell_shards[u64::from(cell) as usize % SHARD_COUNT]
    }

    fn remove_from_bucket(
        shard: &mut HashMap<CellIndex, Vec<(DriverId, Location)>>,
        cell: CellIndex,
        driver: DriverId,
    ) {
        if let Some(bucket) = shard.get_mut(&cell) {
            bucket.retain(|(entry, _)| *entry != driver);
            if bucket.is_empty() {
                shard.remove(&cell);
            }
        }
    }

    /// Insert a driver or move it to a new position.
    pub fn insert_or_update(&self, driver: DriverId, location: Location) -> DispatchResult<()> {
        let cell = self.grid.cell_for(location)?;
        let mut entries = lock_shard(self.driver_shard(driver));
        let previous = entries.insert(driver, IndexedDriver { location, cell });
        match previous {
            Some(old) if old.cell == cell => {
                let mut shard = lock_shard(self.cell_shard(cell));
                if let Some(bucket) = shard.get_mut(&cell) {
                    for entry in bucket.iter_mut() {
                        if entry.0 == driver {
                            entry.1 = location;
                        }
                    }
                }
            }
            Some(old) => {
                // Remove from the old bucket before inserting into the new
                // one. A concurrent query may briefly miss the driver; it can
                // never see it twice.
                {
                    let mut shard = lock_shard(self.cell_shard(old.cell));
                    Self::remove_from_bucket(&mut shard, old.cell, driver);
                }
                let mut shard = lock_shard(self.cell_shard(cell));
                shard.entry(cell).or_default().push((driver, location));
            }
            None => {
                let mut shard = lock_shard(self.cell_shard(cell));
                shard.entry(cell).or_default().push((driver, location));
            }
        }
        Ok(())
    }

    /// Remove a driver from the index. No-op when absent.
    pub fn remove(&self, driver: DriverId) {
        let mut entries = lock_shard(self.driver_shard(driver));
        if let Some(indexed) = entries.remove(&driver) {
            let mut shard = lock_shard(self.cell_shard(indexed.cell));
            Self::remove_from_bucket(&mut shard, indexed.cell, driver);
        }
    }

    pub fn contains(&self, driver: DriverId) -> bool {
        lock_shard(self.driver_shard(driver)).contains_key(&driver)
    }

    /// Number of drivers currently indexed.
    pub fn len(&self) -> usize {
        self.driver_shards
            .iter()
            .map(|shard| lock_shard(shard).len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All drivers within `radius_km` of `center`, ascending by haversine
    /// distance, at most `limit` entries. Equidistant drivers tie-break by id
    /// so repeated queries are stable.
    pub fn query_radius(
        &self,
        center: Location,
        radius_km: f64,
        limit: usize,
    ) -> DispatchResult<Vec<(DriverId, f64)>> {
        if limit == 0 || radius_km <= 0.0 {
            return Ok(Vec::new());
        }
        let origin = self.grid.cell_for(center)?;
        let k = self.grid.rings_for_radius(origin, radius_km);
        let disk = self.disk_cache.get_or_compute(origin, k, &self.grid);

        let mut hits: Vec<(DriverId, f64)> = Vec::new();
        for cell in &disk {
            let shard = lock_shard(self.cell_shard(*cell));
            if let Some(bucket) = shard.get(cell) {
                for (driver, location) in bucket {
                    let distance = distance_km(center, *location);
                    if distance <= radius_km {
                        hits.push((*driver, distance));
                    }
                }
            }
        }
        hits.sort_by(|a, b| {
            a.1.partial_cmp(&b.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        hits.truncate(limit);
        Ok(hits)
    }
}

impl Default for GeoIndex {
    fn default() -> Self {
        Self::new(GeoConfig::default())
    }
}

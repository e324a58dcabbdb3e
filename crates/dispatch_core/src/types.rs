//! Identifiers, coordinates and driver vocabulary shared across the crate.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Driver identifier, unique within one dispatcher instance.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct DriverId(pub u64);

/// Booking identifier, unique within one dispatcher instance.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct BookingId(pub u64);

/// Customer identifier. Opaque to the matching core; carried for records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CustomerId(pub u64);

impl fmt::Display for DriverId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "driver-{}", self.0)
    }
}

impl fmt::Display for BookingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "booking-{}", self.0)
    }
}

/// WGS84 coordinate in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub lat: f64,
    pub lon: f64,
}

impl Location {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }

    /// True when both components are finite and within WGS84 bounds.
    pub fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lon.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lon)
    }
}

/// Driver availability lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DriverStatus {
    Offline,
    Available,
    Reserved,
    OnTrip,
}

/// Vehicle features a booking can require.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VehicleFeature {
    Premium,
    Van,
    WheelchairAccess,
    ChildSeat,
    PetFriendly,
}

impl VehicleFeature {
    fn bit(self) -> u16 {
        1 << (self as u16)
    }
}

/// Set of vehicle features, stored as a bitmask.
///
/// A driver matches a booking when the driver's set is a superset of the
/// booking's required set; an empty requirement matches every driver.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
pub struct Capabilities(u16);

impl Capabilities {
    pub const NONE: Capabilities = Capabilities(0);

    pub fn with(mut self, feature: VehicleFeature) -> Self {
        self.0 |= feature.bit();
        self
    }

    pub fn contains(&self, feature: VehicleFeature) -> bool {
        self.0 & feature.bit() != 0
    }

    /// True when every feature in `required` is present in `self`.
    pub fn satisfies(&self, required: Capabilities) -> bool {
        self.0 & required.0 == required.0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

impl FromIterator<VehicleFeature> for Capabilities {
    fn from_iter<I: IntoIterator<Item = VehicleFeature>>(iter: I) -> Self {
        iter.into_iter()
            .fold(Capabilities::NONE, |set, feature| set.with(feature))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capabilities_superset_satisfies_requirement() {
        let driver = Capabilities::NONE
            .with(VehicleFeature::Van)
            .with(VehicleFeature::WheelchairAccess);
        let required = Capabilities::NONE.with(VehicleFeature::WheelchairAccess);

        assert!(driver.satisfies(required));
        assert!(!required.satisfies(driver));
        assert!(driver.contains(VehicleFeature::Van));
        assert!(!driver.contains(VehicleFeature::ChildSeat));
    }

    #[test]
    fn empty_requirement_matches_any_driver() {
        let bare = Capabilities::NONE;
        let fancy = Capabilities::NONE.with(VehicleFeature::Premium);

        assert!(bare.satisfies(Capabilities::NONE));
        assert!(fancy.satisfies(Capabilities::NONE));
    }

    #[test]
    fn capabilities_collect_from_iterator() {
        let set: Capabilities = [VehicleFeature::Premium, VehicleFeature::PetFriendly]
            .into_iter()
            .collect();
        assert!(set.contains(VehicleFeature::Premium));
        assert!(set.contains(VehicleFeature::PetFriendly));
        assert!(!set.contains(VehicleFeature::Van));
    }

    #[test]
    fn location_bounds_are_checked() {
        assert!(Location::new(52.52, 13.405).is_valid());
        assert!(Location::new(-90.0, 180.0).is_valid());
        assert!(!Location::new(90.1, 0.0).is_valid());
        assert!(!Location::new(0.0, -180.5).is_valid());
        assert!(!Location::new(f64::NAN, 0.0).is_valid());
    }
}

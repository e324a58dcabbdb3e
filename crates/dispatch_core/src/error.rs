//! Error types surfaced at the dispatcher's API seams.
//!
//! Reservation conflicts and offer timeouts are deliberately not errors: both
//! are routine outcomes of the match loop, handled inline and counted in
//! telemetry.

use thiserror::Error;

use crate::assignment::BookingState;
use crate::types::{BookingId, DriverId};

pub type DispatchResult<T> = Result<T, DispatchError>;

#[derive(Debug, Error)]
pub enum DispatchError {
    /// Candidate search exhausted every radius and retry round.
    #[error("no drivers available for {booking}: {reason}")]
    NoDriversAvailable { booking: BookingId, reason: String },

    /// A state change the assignment lifecycle forbids. Terminal bookings
    /// reject every transition.
    #[error("invalid transition for {booking}: {from:?} -> {to:?}")]
    InvalidTransition {
        booking: BookingId,
        from: BookingState,
        to: BookingState,
    },

    /// The backing store rejected a read or write. Matching continues on
    /// in-memory state; the affected record is flagged for the sweep.
    #[error("store unavailable: {0}")]
    StoreUnavailable(#[from] StoreError),

    #[error("unknown {0}")]
    UnknownDriver(DriverId),

    #[error("unknown {0}")]
    UnknownBooking(BookingId),

    /// Latitude or longitude outside WGS84 bounds.
    #[error("invalid location: lat {lat}, lon {lon}")]
    InvalidLocation { lat: f64, lon: f64 },

    /// The dispatcher is shutting down and no longer accepts bookings.
    #[error("dispatcher shutting down, {0} not accepted")]
    ShuttingDown(BookingId),
}

/// Error raised by `Store` implementations. Adapters map backend failures
/// into the message.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct StoreError(pub String);

impl StoreError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

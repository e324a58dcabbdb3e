//! Delivery channel for offer and resolution events.

use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::info;

use crate::types::{BookingId, DriverId};

/// Final disposition of an offer or a booking.
#[derive(Debug, Clone, PartialEq)]
pub enum MatchOutcome {
    Confirmed { driver: DriverId },
    Rejected { driver: DriverId },
    TimedOut { driver: DriverId },
    Cancelled,
    Expired,
    Unmatched { reason: String },
}

/// Push channel towards drivers and customers.
///
/// Implementations must not block and must swallow their own failures; a
/// dropped notification never stalls the match loop.
pub trait NotificationSink: Send + Sync {
    fn notify_offer(&self, driver: DriverId, booking: BookingId, deadline_ms: u64);
    fn notify_resolution(&self, booking: BookingId, outcome: MatchOutcome);
}

/// Sink that logs every event through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl NotificationSink for LogSink {
    fn notify_offer(&self, driver: DriverId, booking: BookingId, deadline_ms: u64) {
        info!(%driver, %booking, deadline_ms, "offer sent");
    }

    fn notify_resolution(&self, booking: BookingId, outcome: MatchOutcome) {
        info!(%booking, ?outcome, "booking resolved");
    }
}

/// Everything a `RecordingSink` saw, in emission order.
#[derive(Debug, Clone, PartialEq)]
pub enum SinkEvent {
    Offer {
        driver: DriverId,
        booking: BookingId,
        deadline_ms: u64,
    },
    Resolution {
        booking: BookingId,
        outcome: MatchOutcome,
    },
}

/// Sink that records events for assertions and embedders that poll.
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<SinkEvent>>,
}

fn lock_events(events: &Mutex<Vec<SinkEvent>>) -> MutexGuard<'_, Vec<SinkEvent>> {
    events.lock().unwrap_or_else(PoisonError::into_inner)
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<SinkEvent> {
        lock_events(&self.events).clone()
    }

    /// Offers emitted so far, in order.
    pub fn offers(&self) -> Vec<(DriverId, BookingId, u64)> {
        lock_events(&self.events)
            .iter()
            .filter_map(|event| match event {
                SinkEvent::Offer {
                    driver,
                    booking,
                    deadline_ms,
                } => Some((*driver, *booking, *deadline_ms)),
                _ => None,
            })
            .collect()
    }

    pub fn last_offer(&self) -> Option<(DriverId, BookingId, u64)> {
        self.offers().pop()
    }

    /// Latest resolution emitted for `booking`, if any.
    pub fn last_resolution(&self, booking: BookingId) -> Option<MatchOutcome> {
        lock_events(&self.events)
            .iter()
            .rev()
            .find_map(|event| match event {
                SinkEvent::Resolution {
                    booking: b,
                    outcome,
                } if *b == booking => Some(outcome.clone()),
                _ => None,
            })
    }
}

impl NotificationSink for RecordingSink {
    fn notify_offer(&self, driver: DriverId, booking: BookingId, deadline_ms: u64) {
        lock_events(&self.events).push(SinkEvent::Offer {
            driver,
            booking,
            deadline_ms,
        });
    }

    fn notify_resolution(&self, booking: BookingId, outcome: MatchOutcome) {
        lock_events(&self.events).push(SinkEvent::Resolution { booking, outcome });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_sink_keeps_emission_order() {
        let sink = RecordingSink::new();
        sink.notify_offer(DriverId(1), BookingId(10), 15_000);
        sink.notify_resolution(BookingId(10), MatchOutcome::Rejected { driver: DriverId(1) });
        sink.notify_offer(DriverId(2), BookingId(10), 30_000);
        sink.notify_resolution(BookingId(10), MatchOutcome::Confirmed { driver: DriverId(2) });

        assert_eq!(sink.events().len(), 4);
        assert_eq!(
            sink.offers(),
            vec![(DriverId(1), BookingId(10), 15_000), (DriverId(2), BookingId(10), 30_000)]
        );
        assert_eq!(sink.last_offer(), Some((DriverId(2), BookingId(10), 30_000)));
        assert_eq!(
            sink.last_resolution(BookingId(10)),
            Some(MatchOutcome::Confirmed { driver: DriverId(2) })
        );
        assert_eq!(sink.last_resolution(BookingId(99)), None);
    }
}

//! Booking status state machine.
//!
//! ```text
//! Pending ──► Confirmed ──► Completed
//!    │            │
//!    └──► Cancelled ◄──┘
//! ```
//!
//! `Cancelled` and `Completed` are terminal. Self-transitions are illegal.

use crate::model::{ActorRole, Booking, BookingStatus, Ms};

use super::EngineError;

/// Legal successors of each status.
pub fn allowed_targets(from: BookingStatus) -> &'static [BookingStatus] {
    match from {
        BookingStatus::Pending => &[BookingStatus::Confirmed, BookingStatus::Cancelled],
        BookingStatus::Confirmed => &[BookingStatus::Completed, BookingStatus::Cancelled],
        BookingStatus::Cancelled | BookingStatus::Completed => &[],
    }
}

pub fn is_legal(from: BookingStatus, to: BookingStatus) -> bool {
    allowed_targets(from).contains(&to)
}

/// Customers may only cancel; providers and admins may request anything.
pub fn may_request(role: ActorRole, to: BookingStatus) -> bool {
    match role {
        ActorRole::Customer => to == BookingStatus::Cancelled,
        ActorRole::Provider | ActorRole::Admin => true,
    }
}

/// Whether reaching `to` is forbidden once the booking's start has passed.
fn requires_future_start(to: BookingStatus) -> bool {
    matches!(to, BookingStatus::Confirmed | BookingStatus::Cancelled)
}

/// Full check for moving `booking` to `to`, in order: actor permission,
/// temporal guard, transition graph.
pub fn check_transition(
    booking: &Booking,
    to: BookingStatus,
    role: ActorRole,
    now: Ms,
) -> Result<(), EngineError> {
    if !may_request(role, to) {
        return Err(EngineError::NotPermitted { role, to });
    }
    if requires_future_start(to) && booking.start <= now {
        return Err(EngineError::PastBooking);
    }
    if !is_legal(booking.status, to) {
        return Err(EngineError::IllegalTransition {
            from: booking.status,
            to,
        });
    }
    Ok(())
}

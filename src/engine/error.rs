use thiserror::Error;
use ulid::Ulid;

use crate::model::{ActorRole, BookingStatus};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid timezone: {0}")]
    InvalidTimezone(String),
    #[error("service not found: {0}")]
    ServiceNotFound(Ulid),
    #[error("not found: {0}")]
    NotFound(Ulid),
    #[error("already exists: {0}")]
    AlreadyExists(Ulid),
    #[error("service {service_id} is not offered by provider {provider_id}")]
    ServiceProviderMismatch { service_id: Ulid, provider_id: Ulid },

    #[error("booking time is not in the future")]
    PastBooking,
    #[error("booking time is beyond the booking horizon")]
    TooFarInFuture,
    #[error("customer cannot book their own service")]
    SelfBookingForbidden,
    #[error("requested time is outside the provider's availability")]
    OutsideAvailability,

    #[error("slot occupied by booking {0}")]
    SlotOccupied(Ulid),
    #[error("customer already has booking {0} at this time")]
    CustomerDoubleBooked(Ulid),

    #[error("illegal transition: {from} -> {to}")]
    IllegalTransition { from: BookingStatus, to: BookingStatus },
    #[error("{role} may not move a booking to {to}")]
    NotPermitted { role: ActorRole, to: BookingStatus },

    #[error("invalid window: {0}")]
    InvalidWindow(&'static str),
    #[error("invalid service: {0}")]
    InvalidService(&'static str),
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),

    #[error("storage contention: {0}")]
    StorageContention(&'static str),
    #[error("storage error: {0}")]
    Storage(String),
}

impl EngineError {
    /// Only transient lock/commit timeouts are worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::StorageContention(_))
    }

    /// Conflict outcomes of concurrent reservation.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            EngineError::SlotOccupied(_) | EngineError::CustomerDoubleBooked(_)
        )
    }

    /// Stable label for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::InvalidTimezone(_) => "invalid_timezone",
            EngineError::ServiceNotFound(_) => "service_not_found",
            EngineError::NotFound(_) => "not_found",
            EngineError::AlreadyExists(_) => "already_exists",
            EngineError::ServiceProviderMismatch { .. } => "service_provider_mismatch",
            EngineError::PastBooking => "past_booking",
            EngineError::TooFarInFuture => "too_far_in_future",
            EngineError::SelfBookingForbidden => "self_booking_forbidden",
            EngineError::OutsideAvailability => "outside_availability",
            EngineError::SlotOccupied(_) => "slot_occupied",
            EngineError::CustomerDoubleBooked(_) => "customer_double_booked",
            EngineError::IllegalTransition { .. } => "illegal_transition",
            EngineError::NotPermitted { .. } => "not_permitted",
            EngineError::InvalidWindow(_) => "invalid_window",
            EngineError::InvalidService(_) => "invalid_service",
            EngineError::LimitExceeded(_) => "limit_exceeded",
            EngineError::StorageContention(_) => "storage_contention",
            EngineError::Storage(_) => "storage",
        }
    }
}

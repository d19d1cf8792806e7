use ulid::Ulid;

use crate::calendar::utc_date;
use crate::model::*;

use super::availability::{blackout_spans, merge_overlapping, open_windows_on, subtract_intervals};
use super::EngineError;

pub(crate) fn validate_span(span: &Span) -> Result<(), EngineError> {
    use crate::limits::*;
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    Ok(())
}

/// Start must be strictly after `now` and no later than `horizon`.
pub(crate) fn check_booking_time(start: Ms, now: Ms, horizon: Ms) -> Result<(), EngineError> {
    if start <= now {
        return Err(EngineError::PastBooking);
    }
    if start > horizon {
        return Err(EngineError::TooFarInFuture);
    }
    Ok(())
}

pub(crate) fn check_provider_free(ps: &ProviderState, span: &Span) -> Result<(), EngineError> {
    match ps.overlapping(span).next() {
        Some(existing) => Err(EngineError::SlotOccupied(existing.id)),
        None => Ok(()),
    }
}

pub(crate) fn check_customer_free(cs: &CustomerState, span: &Span) -> Result<(), EngineError> {
    match cs.overlapping(span).next() {
        Some(existing) => Err(EngineError::CustomerDoubleBooked(existing.id)),
        None => Ok(()),
    }
}

pub(crate) fn check_not_self(customer_id: Ulid, provider_id: Ulid) -> Result<(), EngineError> {
    if customer_id == provider_id {
        return Err(EngineError::SelfBookingForbidden);
    }
    Ok(())
}

/// Find the open window `span` was carved from.
///
/// `span` must sit entirely inside the union of open windows for the UTC date
/// of its start, selected the same way slot computation selects them, and must
/// not touch a blackout. Returns the id of the window containing `span.start`.
pub(crate) fn covering_window(windows: &[AvailabilityWindow], span: &Span) -> Result<Ulid, EngineError> {
    let day = utc_date(span.start).ok_or(EngineError::OutsideAvailability)?;

    let mut carved_from = None;
    let mut open = Vec::new();
    for (w, s) in open_windows_on(windows, day) {
        if carved_from.is_none() && s.contains_instant(span.start) {
            carved_from = Some(w.id);
        }
        open.push(s);
    }
    open.sort_by_key(|s| s.start);
    let open = merge_overlapping(&open);

    if !subtract_intervals(&[*span], &open).is_empty() {
        return Err(EngineError::OutsideAvailability);
    }
    if blackout_spans(windows).iter().any(|b| b.overlaps(span)) {
        return Err(EngineError::OutsideAvailability);
    }
    carved_from.ok_or(EngineError::OutsideAvailability)
}

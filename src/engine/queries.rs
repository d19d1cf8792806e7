use std::collections::HashSet;

use chrono::NaiveDate;
use tracing::debug;
use ulid::Ulid;

use crate::calendar::{format_hhmm, parse_timezone, utc_midnight, week_day};
use crate::model::*;
use crate::observability::SLOT_QUERIES_TOTAL;

use super::availability::{candidate_starts, day_span};
use super::{Engine, EngineError};

/// One bookable start: wall-clock label in the caller's zone plus the instant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Slot {
    pub time: String,
    pub start: Ms,
}

impl Engine {
    pub fn get_service(&self, id: Ulid) -> Option<Service> {
        self.services.get(&id).map(|e| e.value().clone())
    }

    /// Services offered by `provider_id`, ordered by id.
    pub fn list_services(&self, provider_id: Ulid) -> Vec<Service> {
        let mut services: Vec<Service> = self
            .services
            .iter()
            .filter(|e| e.provider_id == provider_id)
            .map(|e| e.value().clone())
            .collect();
        services.sort_by_key(|s| s.id);
        services
    }

    /// Bookable start instants for `service_id` on the UTC date `date`, sorted.
    ///
    /// Busy time is the provider's occupying bookings plus, when the caller is
    /// a known customer, the caller's own occupying bookings.
    pub async fn available_starts(
        &self,
        ctx: &CallerContext,
        service_id: Ulid,
        date: NaiveDate,
    ) -> Result<Vec<Ms>, EngineError> {
        parse_timezone(&ctx.timezone)?;
        let service = self
            .get_service(service_id)
            .ok_or(EngineError::ServiceNotFound(service_id))?;
        let duration = service.duration_ms();

        // Slots may run into the next day; look one duration past it.
        let midnight = utc_midnight(date);
        let range = Span::new(midnight - duration, midnight + DAY_MS + duration);

        // Read locks are taken one at a time so readers never hold two.
        let mut busy: Vec<Span> = Vec::new();
        if let Some(customer_id) = ctx.customer_id
            && let Some(cs) = self.existing_customer(&customer_id)
        {
            let guard = cs.read().await;
            busy.extend(guard.overlapping(&range).map(Booking::span));
        }

        let Some(ps) = self.existing_provider(&service.provider_id) else {
            return Ok(Vec::new());
        };
        let guard = ps.read().await;
        busy.extend(guard.overlapping(&range).map(Booking::span));

        let starts = candidate_starts(&guard.windows, date, duration, &busy, self.clock.now_ms());
        Ok(starts)
    }

    /// Bookable slots rendered as `HH:MM` in the caller's timezone.
    ///
    /// Order follows the underlying instants; a local time that repeats (DST
    /// fall-back) is listed once.
    pub async fn compute_available_slots(
        &self,
        ctx: &CallerContext,
        service_id: Ulid,
        date: NaiveDate,
    ) -> Result<Vec<String>, EngineError> {
        let slots = self.available_slots(ctx, service_id, date).await?;
        Ok(slots.into_iter().map(|s| s.time).collect())
    }

    /// Like [`Engine::compute_available_slots`], keeping each slot's instant.
    pub async fn available_slots(
        &self,
        ctx: &CallerContext,
        service_id: Ulid,
        date: NaiveDate,
    ) -> Result<Vec<Slot>, EngineError> {
        let tz = parse_timezone(&ctx.timezone)?;
        let starts = self.available_starts(ctx, service_id, date).await?;
        metrics::counter!(SLOT_QUERIES_TOTAL).increment(1);

        let mut seen = HashSet::new();
        let slots: Vec<Slot> = starts
            .into_iter()
            .filter_map(|start| format_hhmm(start, tz).map(|time| Slot { time, start }))
            .filter(|s| seen.insert(s.time.clone()))
            .collect();
        debug!(%service_id, %date, timezone = %ctx.timezone, count = slots.len(), "slots computed");
        Ok(slots)
    }

    /// Windows of a provider, optionally narrowed to a weekday and/or a date.
    ///
    /// With no filter every window is returned. With filters, recurring windows
    /// match on `week_day` (or the date's weekday) and once-windows (including
    /// blackouts) match when they overlap `date`.
    pub async fn list_windows(
        &self,
        provider_id: Ulid,
        week_day_filter: Option<u8>,
        date: Option<NaiveDate>,
    ) -> Vec<AvailabilityWindow> {
        let Some(ps) = self.existing_provider(&provider_id) else {
            return Vec::new();
        };
        let guard = ps.read().await;
        if week_day_filter.is_none() && date.is_none() {
            return guard.windows.clone();
        }

        let wanted_day = week_day_filter.or(date.map(week_day));
        let bounds = date.map(day_span);
        guard
            .windows
            .iter()
            .filter(|w| match w.schedule {
                WindowSchedule::Recurring { week_day, .. } => wanted_day == Some(week_day),
                WindowSchedule::Once { span } => bounds.is_some_and(|d| d.overlaps(&span)),
            })
            .cloned()
            .collect()
    }

    /// Occupying bookings of `party` that overlap `span`, sorted by start.
    pub async fn find_overlapping(&self, party: Party, span: Span) -> Vec<Booking> {
        match party {
            Party::Provider(id) => match self.existing_provider(&id) {
                Some(ps) => ps.read().await.overlapping(&span).cloned().collect(),
                None => Vec::new(),
            },
            Party::Customer(id) => match self.existing_customer(&id) {
                Some(cs) => cs.read().await.overlapping(&span).cloned().collect(),
                None => Vec::new(),
            },
        }
    }

    /// Fetch a booking by id, soft-deleted ones included.
    pub async fn get_booking(&self, id: Ulid) -> Option<Booking> {
        let provider_id = self.booking_index.get(&id)?.provider_id;
        let ps = self.existing_provider(&provider_id)?;
        let guard = ps.read().await;
        guard.booking(id).cloned()
    }

    /// Every non-deleted booking of `party`, any status, sorted by start.
    pub async fn list_bookings(&self, party: Party) -> Vec<Booking> {
        match party {
            Party::Provider(id) => match self.existing_provider(&id) {
                Some(ps) => ps
                    .read()
                    .await
                    .bookings
                    .iter()
                    .filter(|b| !b.deleted)
                    .cloned()
                    .collect(),
                None => Vec::new(),
            },
            Party::Customer(id) => {
                // Cancelled bookings leave the customer ledger, so go through
                // the providers that hold this customer's bookings.
                let mut providers: Vec<Ulid> = self
                    .booking_index
                    .iter()
                    .filter(|e| e.customer_id == id)
                    .map(|e| e.provider_id)
                    .collect();
                providers.sort();
                providers.dedup();

                let mut out = Vec::new();
                for pid in providers {
                    if let Some(ps) = self.existing_provider(&pid) {
                        let guard = ps.read().await;
                        out.extend(
                            guard
                                .bookings
                                .iter()
                                .filter(|b| b.customer_id == id && !b.deleted)
                                .cloned(),
                        );
                    }
                }
                out.sort_by_key(|b| (b.start, b.id));
                out
            }
        }
    }
}

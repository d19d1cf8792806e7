use std::time::{Duration, Instant};

use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::calendar::horizon_limit;
use crate::limits::*;
use crate::model::*;
use crate::notify::NotificationKind;
use crate::observability::{
    RESERVATIONS_TOTAL, RESERVATION_RETRIES_TOTAL, RESERVE_DURATION_SECONDS, TRANSITIONS_TOTAL,
};

use super::conflict::{
    check_booking_time, check_customer_free, check_not_self, check_provider_free, covering_window,
    validate_span,
};
use super::transition::check_transition;
use super::{Engine, EngineError, WalCommand};

/// A request to hold `[start, start + service duration)` for a customer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservationRequest {
    pub id: Ulid,
    pub provider_id: Ulid,
    pub service_id: Ulid,
    pub customer_id: Ulid,
    pub start: Ms,
    pub notes: Option<String>,
}

impl ReservationRequest {
    pub fn new(provider_id: Ulid, service_id: Ulid, customer_id: Ulid, start: Ms) -> Self {
        Self {
            id: Ulid::new(),
            provider_id,
            service_id,
            customer_id,
            start,
            notes: None,
        }
    }

    pub fn with_id(mut self, id: Ulid) -> Self {
        self.id = id;
        self
    }

    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }
}

/// Exponential backoff between contention retries: 10ms, 20ms, 40ms, ...
fn backoff(attempt: u32) -> Duration {
    Duration::from_millis(10u64.saturating_mul(1 << attempt.min(10)))
}

fn validate_window(window: &AvailabilityWindow) -> Result<(), EngineError> {
    match window.schedule {
        WindowSchedule::Recurring { week_day, from, to } => {
            if week_day > 6 {
                return Err(EngineError::InvalidWindow("week_day must be 0..=6"));
            }
            if from < 0 || to > DAY_MS {
                return Err(EngineError::InvalidWindow("time of day out of range"));
            }
            if from >= to {
                return Err(EngineError::InvalidWindow("start must be before end"));
            }
        }
        WindowSchedule::Once { span } => {
            if span.start >= span.end {
                return Err(EngineError::InvalidWindow("start must be before end"));
            }
            validate_span(&span)?;
            if span.duration_ms() > MAX_WINDOW_SPAN_MS {
                return Err(EngineError::LimitExceeded("window too long"));
            }
        }
    }
    Ok(())
}

impl Engine {
    // ── Catalog ──────────────────────────────────────────────

    pub async fn register_service(&self, service: Service) -> Result<(), EngineError> {
        if service.duration_minutes == 0 {
            return Err(EngineError::InvalidService("duration must be positive"));
        }
        if service.duration_minutes > MAX_SERVICE_DURATION_MINUTES {
            return Err(EngineError::LimitExceeded("service duration too long"));
        }
        if service.price < 0 {
            return Err(EngineError::InvalidService("price must not be negative"));
        }
        let _gate = self.enter_mutation().await?;
        // The provider lock serializes catalog changes for one provider.
        let mut guard = self.lock_provider(service.provider_id).await?;
        if self.services.contains_key(&service.id) {
            return Err(EngineError::AlreadyExists(service.id));
        }
        let offered = self
            .services
            .iter()
            .filter(|s| s.provider_id == service.provider_id)
            .count();
        if offered >= MAX_SERVICES_PER_PROVIDER {
            return Err(EngineError::LimitExceeded("too many services for provider"));
        }

        let event = Event::ServiceRegistered {
            id: service.id,
            provider_id: service.provider_id,
            duration_minutes: service.duration_minutes,
            price: service.price,
        };
        self.persist_and_apply(&mut guard, None, &event).await?;
        info!(service_id = %service.id, provider_id = %service.provider_id, "service registered");
        Ok(())
    }

    /// Existing bookings keep their span; only new reservations are refused.
    pub async fn remove_service(&self, id: Ulid) -> Result<Service, EngineError> {
        let service = self.get_service(id).ok_or(EngineError::ServiceNotFound(id))?;
        let _gate = self.enter_mutation().await?;
        let mut guard = self.lock_provider(service.provider_id).await?;
        if !self.services.contains_key(&id) {
            return Err(EngineError::ServiceNotFound(id));
        }
        let event = Event::ServiceRemoved {
            id,
            provider_id: service.provider_id,
        };
        self.persist_and_apply(&mut guard, None, &event).await?;
        Ok(service)
    }

    // ── Availability windows ─────────────────────────────────

    pub async fn add_window(&self, window: AvailabilityWindow) -> Result<(), EngineError> {
        validate_window(&window)?;
        let _gate = self.enter_mutation().await?;
        let mut guard = self.lock_provider(window.provider_id).await?;
        if self.window_index.contains_key(&window.id) {
            return Err(EngineError::AlreadyExists(window.id));
        }
        if guard.windows.len() >= MAX_WINDOWS_PER_PROVIDER {
            return Err(EngineError::LimitExceeded("too many windows for provider"));
        }
        let event = Event::WindowAdded { window };
        self.persist_and_apply(&mut guard, None, &event).await
    }

    /// Replace a window's schedule or active flag. The owning provider is fixed.
    pub async fn update_window(&self, window: AvailabilityWindow) -> Result<(), EngineError> {
        validate_window(&window)?;
        let owner = self
            .window_index
            .get(&window.id)
            .map(|e| *e.value())
            .ok_or(EngineError::NotFound(window.id))?;
        if owner != window.provider_id {
            return Err(EngineError::InvalidWindow("window cannot move between providers"));
        }
        let _gate = self.enter_mutation().await?;
        let mut guard = self.lock_provider(owner).await?;
        if !guard.windows.iter().any(|w| w.id == window.id) {
            return Err(EngineError::NotFound(window.id));
        }
        let event = Event::WindowUpdated { window };
        self.persist_and_apply(&mut guard, None, &event).await
    }

    /// Returns the owning provider.
    pub async fn remove_window(&self, id: Ulid) -> Result<Ulid, EngineError> {
        let provider_id = self
            .window_index
            .get(&id)
            .map(|e| *e.value())
            .ok_or(EngineError::NotFound(id))?;
        let _gate = self.enter_mutation().await?;
        let mut guard = self.lock_provider(provider_id).await?;
        if !guard.windows.iter().any(|w| w.id == id) {
            return Err(EngineError::NotFound(id));
        }
        let event = Event::WindowRemoved { id, provider_id };
        self.persist_and_apply(&mut guard, None, &event).await?;
        Ok(provider_id)
    }

    // ── Reservation ──────────────────────────────────────────

    /// Create a `Pending` booking, atomically with respect to every other
    /// reservation touching the same provider or customer.
    ///
    /// Contention (lock or commit queue timeouts) is retried up to
    /// `max_retries` times; every other error is returned as-is.
    pub async fn reserve(&self, request: ReservationRequest) -> Result<Booking, EngineError> {
        let started = Instant::now();
        let mut attempt = 0;
        let result = loop {
            match self.try_reserve(&request).await {
                Err(e) if e.is_retryable() && attempt < self.config.max_retries => {
                    attempt += 1;
                    metrics::counter!(RESERVATION_RETRIES_TOTAL).increment(1);
                    warn!(booking_id = %request.id, attempt, error = %e, "reserve contended, retrying");
                    tokio::time::sleep(backoff(attempt)).await;
                }
                other => break other,
            }
        };
        metrics::histogram!(RESERVE_DURATION_SECONDS).record(started.elapsed().as_secs_f64());

        match &result {
            Ok(booking) => {
                metrics::counter!(RESERVATIONS_TOTAL, "outcome" => "ok").increment(1);
                info!(
                    booking_id = %booking.id,
                    provider_id = %booking.provider_id,
                    customer_id = %booking.customer_id,
                    start = booking.start,
                    "booking reserved"
                );
                self.emit(NotificationKind::BookingCreated, booking);
            }
            Err(e) => {
                metrics::counter!(RESERVATIONS_TOTAL, "outcome" => e.kind()).increment(1);
                if e.is_conflict() {
                    info!(booking_id = %request.id, provider_id = %request.provider_id, error = %e, "reservation lost to a conflicting booking");
                } else {
                    debug!(booking_id = %request.id, error = %e, "reservation refused");
                }
            }
        }
        result
    }

    async fn try_reserve(&self, req: &ReservationRequest) -> Result<Booking, EngineError> {
        let service = self
            .get_service(req.service_id)
            .ok_or(EngineError::ServiceNotFound(req.service_id))?;
        if service.provider_id != req.provider_id {
            return Err(EngineError::ServiceProviderMismatch {
                service_id: req.service_id,
                provider_id: req.provider_id,
            });
        }
        if let Some(ref notes) = req.notes
            && notes.len() > MAX_NOTES_LEN
        {
            return Err(EngineError::LimitExceeded("notes too long"));
        }
        if req.start < MIN_VALID_TIMESTAMP_MS || req.start > MAX_VALID_TIMESTAMP_MS {
            return Err(EngineError::LimitExceeded("timestamp out of range"));
        }
        let span = Span::new(req.start, req.start + service.duration_ms());
        validate_span(&span)?;

        // Lock order: commit gate, customer, then provider. Every writer that
        // touches both ledgers follows it.
        let _gate = self.enter_mutation().await?;
        let mut customer = self.lock_customer(req.customer_id).await?;
        let mut provider = self.lock_provider(req.provider_id).await?;

        if self.booking_index.contains_key(&req.id) {
            return Err(EngineError::AlreadyExists(req.id));
        }

        let now = self.clock.now_ms();
        let horizon = horizon_limit(now, self.config.horizon_months, self.config.horizon_extra_days)
            .ok_or(EngineError::LimitExceeded("booking horizon out of range"))?;
        check_booking_time(span.start, now, horizon)?;
        check_provider_free(&provider, &span)?;
        check_customer_free(&customer, &span)?;
        check_not_self(req.customer_id, req.provider_id)?;

        let slot_id = if self.config.enforce_availability {
            Some(covering_window(&provider.windows, &span)?)
        } else {
            None
        };
        if provider.bookings.len() >= MAX_BOOKINGS_PER_PROVIDER {
            return Err(EngineError::LimitExceeded("too many bookings for provider"));
        }

        let booking = Booking {
            id: req.id,
            provider_id: req.provider_id,
            service_id: req.service_id,
            customer_id: req.customer_id,
            start: span.start,
            end: span.end,
            status: BookingStatus::Pending,
            slot_id,
            notes: req.notes.clone(),
            deleted: false,
            version: 0,
        };
        let event = Event::BookingCreated {
            booking: booking.clone(),
        };
        self.persist_and_apply(&mut provider, Some(&mut customer), &event)
            .await?;
        Ok(booking)
    }

    // ── Status transitions ───────────────────────────────────

    /// Move a booking to `to` on behalf of `role`.
    pub async fn transition(
        &self,
        booking_id: Ulid,
        to: BookingStatus,
        role: ActorRole,
    ) -> Result<Booking, EngineError> {
        let mut attempt = 0;
        let result = loop {
            match self.try_transition(booking_id, to, role).await {
                Err(e) if e.is_retryable() && attempt < self.config.max_retries => {
                    attempt += 1;
                    warn!(%booking_id, attempt, error = %e, "transition contended, retrying");
                    tokio::time::sleep(backoff(attempt)).await;
                }
                other => break other,
            }
        };

        match &result {
            Ok((from, booking)) => {
                metrics::counter!(TRANSITIONS_TOTAL, "to" => to.as_str(), "outcome" => "ok")
                    .increment(1);
                info!(%booking_id, %from, %to, %role, "booking status changed");
                self.emit(NotificationKind::StatusChanged { from: *from, to }, booking);
            }
            Err(e) => {
                metrics::counter!(TRANSITIONS_TOTAL, "to" => to.as_str(), "outcome" => e.kind())
                    .increment(1);
                debug!(%booking_id, %to, %role, error = %e, "transition refused");
            }
        }
        result.map(|(_, booking)| booking)
    }

    async fn try_transition(
        &self,
        booking_id: Ulid,
        to: BookingStatus,
        role: ActorRole,
    ) -> Result<(BookingStatus, Booking), EngineError> {
        let refs = self
            .booking_index
            .get(&booking_id)
            .map(|e| *e.value())
            .ok_or(EngineError::NotFound(booking_id))?;

        let _gate = self.enter_mutation().await?;
        let mut customer = self.lock_customer(refs.customer_id).await?;
        let mut provider = self.lock_provider(refs.provider_id).await?;

        let current = provider
            .booking(booking_id)
            .filter(|b| !b.deleted)
            .cloned()
            .ok_or(EngineError::NotFound(booking_id))?;
        check_transition(&current, to, role, self.clock.now_ms())?;

        let event = Event::BookingStatusChanged {
            id: booking_id,
            provider_id: refs.provider_id,
            status: to,
            version: current.version + 1,
        };
        self.persist_and_apply(&mut provider, Some(&mut customer), &event)
            .await?;

        let updated = Booking {
            status: to,
            version: current.version + 1,
            ..current.clone()
        };
        Ok((current.status, updated))
    }

    /// Soft-delete: the booking stays readable but stops occupying time.
    pub async fn delete_booking(&self, booking_id: Ulid) -> Result<Booking, EngineError> {
        let refs = self
            .booking_index
            .get(&booking_id)
            .map(|e| *e.value())
            .ok_or(EngineError::NotFound(booking_id))?;

        let _gate = self.enter_mutation().await?;
        let mut customer = self.lock_customer(refs.customer_id).await?;
        let mut provider = self.lock_provider(refs.provider_id).await?;

        let current = provider
            .booking(booking_id)
            .filter(|b| !b.deleted)
            .cloned()
            .ok_or(EngineError::NotFound(booking_id))?;

        let event = Event::BookingDeleted {
            id: booking_id,
            provider_id: refs.provider_id,
        };
        self.persist_and_apply(&mut provider, Some(&mut customer), &event)
            .await?;
        info!(%booking_id, "booking deleted");
        Ok(Booking {
            deleted: true,
            ..current
        })
    }

    // ── WAL maintenance ──────────────────────────────────────

    /// Compact the WAL by rewriting it with only the events needed to recreate the current state.
    ///
    /// Mutations are held off from the snapshot until the compact command is
    /// queued; later appends follow it in the writer's queue.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let gate = self.commit_gate.write().await;
        let mut events: Vec<Event> = self
            .services
            .iter()
            .map(|s| Event::ServiceRegistered {
                id: s.id,
                provider_id: s.provider_id,
                duration_minutes: s.duration_minutes,
                price: s.price,
            })
            .collect();

        let providers: Vec<_> = self.providers.iter().map(|e| e.value().clone()).collect();
        for ps in providers {
            let guard = ps.read().await;
            events.extend(
                guard
                    .windows
                    .iter()
                    .map(|w| Event::WindowAdded { window: w.clone() }),
            );
            events.extend(guard.bookings.iter().map(|b| Event::BookingCreated {
                booking: b.clone(),
            }));
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::Storage("WAL writer shut down".into()))?;
        drop(gate);
        rx.await
            .map_err(|_| EngineError::Storage("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::Storage(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

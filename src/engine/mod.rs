mod availability;
mod conflict;
mod error;
mod mutations;
mod queries;
mod transition;

pub use availability::{
    blackout_spans, candidate_starts, discretize, merge_overlapping, open_spans, remove_conflicting,
    subtract_intervals,
};
pub use error::EngineError;
pub use mutations::ReservationRequest;
pub use queries::Slot;
pub use transition::{allowed_targets, check_transition, is_legal, may_request};

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::sync::{mpsc, oneshot, OwnedRwLockWriteGuard, RwLock, RwLockReadGuard};
use tracing::warn;
use ulid::Ulid;

use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::model::*;
use crate::notify::{NotificationKind, NotificationSink};
use crate::wal::Wal;

pub type SharedProviderState = Arc<RwLock<ProviderState>>;
pub type SharedCustomerState = Arc<RwLock<CustomerState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
                let mut deferred = None;

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break, // channel empty, flush batch
                    }
                }

                commit_batch(&mut wal, &mut batch);
                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Always flush, even on append error, so partially buffered bytes
    // don't leak into the next batch.
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!(),
    }
}

// ── Engine ───────────────────────────────────────────────

/// Booking ledger for one tenant.
///
/// Each provider and each customer has its own `RwLock`. Writers that can
/// change occupancy take the customer lock first, then the provider lock,
/// and hold both across check + WAL commit + apply.
///
/// Every mutation also holds `commit_gate` shared, taken before any ledger
/// lock. Compaction takes it exclusively, so no commit lands in the old WAL
/// file after the snapshot was read.
pub struct Engine {
    pub(super) providers: DashMap<Ulid, SharedProviderState>,
    pub(super) customers: DashMap<Ulid, SharedCustomerState>,
    pub(super) services: DashMap<Ulid, Service>,
    /// Reverse lookup: booking id → provider + customer.
    pub(super) booking_index: DashMap<Ulid, BookingRef>,
    /// Reverse lookup: window id → provider id.
    pub(super) window_index: DashMap<Ulid, Ulid>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub(super) notify: Arc<dyn NotificationSink>,
    pub(super) clock: Arc<dyn Clock>,
    pub(super) config: EngineConfig,
    pub(super) commit_gate: RwLock<()>,
}

/// Apply a provider-scoped event (caller holds the write lock).
fn apply_to_provider(ps: &mut ProviderState, event: &Event) {
    match event {
        Event::WindowAdded { window } | Event::WindowUpdated { window } => {
            ps.upsert_window(window.clone());
        }
        Event::WindowRemoved { id, .. } => {
            ps.remove_window(*id);
        }
        Event::BookingCreated { booking } => ps.insert_booking(booking.clone()),
        Event::BookingStatusChanged {
            id,
            status,
            version,
            ..
        } => {
            if let Some(b) = ps.booking_mut(*id) {
                b.status = *status;
                b.version = *version;
            }
        }
        Event::BookingDeleted { id, .. } => {
            if let Some(b) = ps.booking_mut(*id) {
                b.deleted = true;
            }
        }
        // Services live in the engine-wide catalog
        Event::ServiceRegistered { .. } | Event::ServiceRemoved { .. } => {}
    }
}

/// Mirror booking events into the customer's occupancy list.
fn apply_to_customer(cs: &mut CustomerState, event: &Event) {
    match event {
        Event::BookingCreated { booking } if booking.occupies() => {
            cs.insert_booking(booking.clone());
        }
        Event::BookingStatusChanged {
            id,
            status,
            version,
            ..
        } => {
            if *status == BookingStatus::Cancelled {
                cs.remove_booking(*id);
            } else if let Some(b) = cs.booking_mut(*id) {
                b.status = *status;
                b.version = *version;
            }
        }
        Event::BookingDeleted { id, .. } => {
            cs.remove_booking(*id);
        }
        _ => {}
    }
}

impl Engine {
    pub fn new(
        wal_path: PathBuf,
        notify: Arc<dyn NotificationSink>,
        config: EngineConfig,
    ) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            providers: DashMap::new(),
            customers: DashMap::new(),
            services: DashMap::new(),
            booking_index: DashMap::new(),
            window_index: DashMap::new(),
            wal_tx,
            notify,
            clock: Arc::new(SystemClock),
            config,
            commit_gate: RwLock::new(()),
        };

        // We're the sole owner of these Arcs, so try_write always succeeds
        // instantly. Never block here: this may run inside an async context.
        for event in &events {
            let provider = engine.provider_state(event.provider_id());
            let mut ps = provider.try_write().expect("replay: uncontended write");
            apply_to_provider(&mut ps, event);
            if let Some(customer_id) = engine.customer_of(event) {
                let customer = engine.customer_state(customer_id);
                let mut cs = customer.try_write().expect("replay: uncontended write");
                apply_to_customer(&mut cs, event);
            }
            engine.apply_to_indexes(event);
        }

        Ok(engine)
    }

    /// Replace the clock (tests pin "now" with a `ManualClock`).
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn now_ms(&self) -> Ms {
        self.clock.now_ms()
    }

    pub(super) fn provider_state(&self, id: Ulid) -> SharedProviderState {
        self.providers
            .entry(id)
            .or_insert_with(|| Arc::new(RwLock::new(ProviderState::new(id))))
            .value()
            .clone()
    }

    pub(super) fn customer_state(&self, id: Ulid) -> SharedCustomerState {
        self.customers
            .entry(id)
            .or_insert_with(|| Arc::new(RwLock::new(CustomerState::new(id))))
            .value()
            .clone()
    }

    pub(super) fn existing_provider(&self, id: &Ulid) -> Option<SharedProviderState> {
        self.providers.get(id).map(|e| e.value().clone())
    }

    pub(super) fn existing_customer(&self, id: &Ulid) -> Option<SharedCustomerState> {
        self.customers.get(id).map(|e| e.value().clone())
    }

    fn customer_of(&self, event: &Event) -> Option<Ulid> {
        match event {
            Event::BookingCreated { booking } => Some(booking.customer_id),
            Event::BookingStatusChanged { id, .. } | Event::BookingDeleted { id, .. } => {
                self.booking_index.get(id).map(|r| r.customer_id)
            }
            _ => None,
        }
    }

    fn apply_to_indexes(&self, event: &Event) {
        match event {
            Event::ServiceRegistered {
                id,
                provider_id,
                duration_minutes,
                price,
            } => {
                self.services.insert(
                    *id,
                    Service {
                        id: *id,
                        provider_id: *provider_id,
                        duration_minutes: *duration_minutes,
                        price: *price,
                    },
                );
            }
            Event::ServiceRemoved { id, .. } => {
                self.services.remove(id);
            }
            Event::WindowAdded { window } | Event::WindowUpdated { window } => {
                self.window_index.insert(window.id, window.provider_id);
            }
            Event::WindowRemoved { id, .. } => {
                self.window_index.remove(id);
            }
            Event::BookingCreated { booking } => {
                self.booking_index.insert(
                    booking.id,
                    BookingRef {
                        provider_id: booking.provider_id,
                        customer_id: booking.customer_id,
                    },
                );
            }
            Event::BookingStatusChanged { .. } | Event::BookingDeleted { .. } => {}
        }
    }

    /// Enter the commit gate ahead of any ledger lock.
    pub(super) async fn enter_mutation(&self) -> Result<RwLockReadGuard<'_, ()>, EngineError> {
        tokio::time::timeout(self.config.lock_timeout, self.commit_gate.read())
            .await
            .map_err(|_| EngineError::StorageContention("WAL compaction in progress"))
    }

    /// Acquire a provider's write lock within the configured bound.
    pub(super) async fn lock_provider(
        &self,
        id: Ulid,
    ) -> Result<OwnedRwLockWriteGuard<ProviderState>, EngineError> {
        let state = self.provider_state(id);
        tokio::time::timeout(self.config.lock_timeout, state.write_owned())
            .await
            .map_err(|_| EngineError::StorageContention("provider ledger lock timed out"))
    }

    /// Acquire a customer's write lock within the configured bound.
    pub(super) async fn lock_customer(
        &self,
        id: Ulid,
    ) -> Result<OwnedRwLockWriteGuard<CustomerState>, EngineError> {
        let state = self.customer_state(id);
        tokio::time::timeout(self.config.lock_timeout, state.write_owned())
            .await
            .map_err(|_| EngineError::StorageContention("customer ledger lock timed out"))
    }

    /// Write event to WAL via the background group-commit writer.
    ///
    /// Only the enqueue is bounded: once the writer has the record, we wait for
    /// its outcome so memory never diverges from what is on disk.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        let cmd = WalCommand::Append {
            event: event.clone(),
            response: tx,
        };
        self.wal_tx
            .send_timeout(cmd, self.config.lock_timeout)
            .await
            .map_err(|e| match e {
                SendTimeoutError::Timeout(_) => EngineError::StorageContention("WAL queue full"),
                SendTimeoutError::Closed(_) => EngineError::Storage("WAL writer shut down".into()),
            })?;
        rx.await
            .map_err(|_| EngineError::Storage("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::Storage(e.to_string()))
    }

    /// WAL-append, then apply to the locked states and the indexes.
    pub(super) async fn persist_and_apply(
        &self,
        ps: &mut ProviderState,
        cs: Option<&mut CustomerState>,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_provider(ps, event);
        if let Some(cs) = cs {
            apply_to_customer(cs, event);
        }
        self.apply_to_indexes(event);
        Ok(())
    }

    /// Hand a committed change to the notification sink. Never fails the caller.
    pub(super) fn emit(&self, kind: NotificationKind, booking: &Booking) {
        if let Err(e) = self.notify.notify(kind, booking) {
            metrics::counter!(crate::observability::NOTIFICATION_FAILURES_TOTAL).increment(1);
            warn!(booking_id = %booking.id, error = %e, "notification delivery failed");
        }
    }
}

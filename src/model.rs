use std::fmt;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds, UTC. The only instant type.
pub type Ms = i64;

pub const MINUTE_MS: Ms = 60_000;
pub const HOUR_MS: Ms = 60 * MINUTE_MS;
pub const DAY_MS: Ms = 24 * HOUR_MS;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    /// `None` unless `start < end`. Use for spans built from client input.
    pub fn checked(start: Ms, end: Ms) -> Option<Self> {
        (start < end).then_some(Self { start, end })
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    /// `[a,b)` and `[c,d)` intersect iff `a < d && c < b`.
    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }

    /// Returns true if `self` fully contains `other`.
    pub fn contains_span(&self, other: &Span) -> bool {
        self.start <= other.start && other.end <= self.end
    }
}

// ── Availability windows ────────────────────────────────────────

/// When a window applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WindowSchedule {
    /// Every week on `week_day` (Sunday = 0). `from`/`to` are ms after midnight
    /// in the provider's UTC reference.
    Recurring { week_day: u8, from: Ms, to: Ms },
    /// A single absolute UTC span.
    Once { span: Span },
}

/// A provider-declared window. For `Once` windows `active = false` is a
/// blackout; inactive recurring windows are ignored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilityWindow {
    pub id: Ulid,
    pub provider_id: Ulid,
    pub schedule: WindowSchedule,
    pub active: bool,
}

impl AvailabilityWindow {
    pub fn recurring(provider_id: Ulid, week_day: u8, from: Ms, to: Ms) -> Self {
        Self {
            id: Ulid::new(),
            provider_id,
            schedule: WindowSchedule::Recurring { week_day, from, to },
            active: true,
        }
    }

    pub fn once(provider_id: Ulid, span: Span) -> Self {
        Self {
            id: Ulid::new(),
            provider_id,
            schedule: WindowSchedule::Once { span },
            active: true,
        }
    }

    pub fn blackout(provider_id: Ulid, span: Span) -> Self {
        Self {
            active: false,
            ..Self::once(provider_id, span)
        }
    }

    pub fn is_blackout(&self) -> bool {
        matches!(self.schedule, WindowSchedule::Once { .. }) && !self.active
    }

    /// Concrete span of this window when anchored on a UTC midnight.
    /// `Once` windows ignore the anchor.
    pub fn span_on(&self, midnight: Ms) -> Span {
        match self.schedule {
            WindowSchedule::Recurring { from, to, .. } => Span::new(midnight + from, midnight + to),
            WindowSchedule::Once { span } => span,
        }
    }
}

// ── Services ────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub id: Ulid,
    pub provider_id: Ulid,
    pub duration_minutes: u32,
    /// Minor currency units; opaque to the engine.
    pub price: i64,
}

impl Service {
    pub fn duration_ms(&self) -> Ms {
        self.duration_minutes as Ms * MINUTE_MS
    }
}

// ── Bookings ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BookingStatus {
    Pending,
    Confirmed,
    Cancelled,
    Completed,
}

impl BookingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Pending => "pending",
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::Cancelled => "cancelled",
            BookingStatus::Completed => "completed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Some(BookingStatus::Pending),
            "confirmed" => Some(BookingStatus::Confirmed),
            "cancelled" | "canceled" => Some(BookingStatus::Cancelled),
            "completed" => Some(BookingStatus::Completed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, BookingStatus::Cancelled | BookingStatus::Completed)
    }
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who is asking for a status change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActorRole {
    Customer,
    Provider,
    Admin,
}

impl ActorRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActorRole::Customer => "customer",
            ActorRole::Provider => "provider",
            ActorRole::Admin => "admin",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "customer" => Some(ActorRole::Customer),
            "provider" => Some(ActorRole::Provider),
            "admin" => Some(ActorRole::Admin),
            _ => None,
        }
    }
}

impl fmt::Display for ActorRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub provider_id: Ulid,
    pub service_id: Ulid,
    pub customer_id: Ulid,
    /// Reservation start, UTC.
    pub start: Ms,
    /// `start + service duration`, fixed at reservation time.
    pub end: Ms,
    pub status: BookingStatus,
    /// Window this booking was carved from, if known.
    pub slot_id: Option<Ulid>,
    pub notes: Option<String>,
    /// Soft-delete tombstone. Independent of `status`.
    pub deleted: bool,
    pub version: u64,
}

impl Booking {
    pub fn span(&self) -> Span {
        Span::new(self.start, self.end)
    }

    /// Whether this booking still claims its time range.
    pub fn occupies(&self) -> bool {
        !self.deleted && self.status != BookingStatus::Cancelled
    }
}

/// Which side of the ledger a query is keyed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Party {
    Provider(Ulid),
    Customer(Ulid),
}

/// Explicit per-call caller context. The engine never reads ambient session state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallerContext {
    pub customer_id: Option<Ulid>,
    pub timezone: String,
}

impl CallerContext {
    pub fn anonymous(timezone: impl Into<String>) -> Self {
        Self {
            customer_id: None,
            timezone: timezone.into(),
        }
    }

    pub fn customer(customer_id: Ulid, timezone: impl Into<String>) -> Self {
        Self {
            customer_id: Some(customer_id),
            timezone: timezone.into(),
        }
    }
}

// ── Per-provider / per-customer state ──────────────────────────

/// Everything the engine knows about one provider. Guarded by its own lock.
#[derive(Debug, Clone)]
pub struct ProviderState {
    pub id: Ulid,
    pub windows: Vec<AvailabilityWindow>,
    /// All bookings (any status, including tombstones), sorted by `start`.
    pub bookings: Vec<Booking>,
}

impl ProviderState {
    pub fn new(id: Ulid) -> Self {
        Self {
            id,
            windows: Vec::new(),
            bookings: Vec::new(),
        }
    }

    pub fn upsert_window(&mut self, window: AvailabilityWindow) {
        match self.windows.iter_mut().find(|w| w.id == window.id) {
            Some(existing) => *existing = window,
            None => self.windows.push(window),
        }
    }

    pub fn remove_window(&mut self, id: Ulid) -> Option<AvailabilityWindow> {
        let pos = self.windows.iter().position(|w| w.id == id)?;
        Some(self.windows.remove(pos))
    }

    pub fn booking(&self, id: Ulid) -> Option<&Booking> {
        self.bookings.iter().find(|b| b.id == id)
    }

    pub fn booking_mut(&mut self, id: Ulid) -> Option<&mut Booking> {
        self.bookings.iter_mut().find(|b| b.id == id)
    }

    pub fn insert_booking(&mut self, booking: Booking) {
        insert_sorted(&mut self.bookings, booking);
    }

    /// Occupying bookings whose span overlaps `query`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Booking> {
        occupying_overlaps(&self.bookings, query)
    }
}

/// Occupying bookings of one customer across all providers.
#[derive(Debug, Clone)]
pub struct CustomerState {
    pub id: Ulid,
    /// Sorted by `start`; cancelled and deleted bookings are dropped.
    pub bookings: Vec<Booking>,
}

impl CustomerState {
    pub fn new(id: Ulid) -> Self {
        Self {
            id,
            bookings: Vec::new(),
        }
    }

    pub fn insert_booking(&mut self, booking: Booking) {
        insert_sorted(&mut self.bookings, booking);
    }

    pub fn remove_booking(&mut self, id: Ulid) -> Option<Booking> {
        let pos = self.bookings.iter().position(|b| b.id == id)?;
        Some(self.bookings.remove(pos))
    }

    pub fn booking_mut(&mut self, id: Ulid) -> Option<&mut Booking> {
        self.bookings.iter_mut().find(|b| b.id == id)
    }

    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Booking> {
        occupying_overlaps(&self.bookings, query)
    }
}

fn insert_sorted(bookings: &mut Vec<Booking>, booking: Booking) {
    let pos = bookings
        .binary_search_by_key(&booking.start, |b| b.start)
        .unwrap_or_else(|e| e);
    bookings.insert(pos, booking);
}

/// Everything at index >= right_bound starts at or after `query.end`, so it can't overlap.
fn occupying_overlaps<'a>(bookings: &'a [Booking], query: &Span) -> impl Iterator<Item = &'a Booking> {
    let right_bound = bookings.partition_point(|b| b.start < query.end);
    let query_start = query.start;
    bookings[..right_bound]
        .iter()
        .filter(move |b| b.end > query_start && b.occupies())
}

/// Reverse lookup entry: booking id → the two states that hold it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BookingRef {
    pub provider_id: Ulid,
    pub customer_id: Ulid,
}

/// The event types. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ServiceRegistered {
        id: Ulid,
        provider_id: Ulid,
        duration_minutes: u32,
        price: i64,
    },
    ServiceRemoved {
        id: Ulid,
        provider_id: Ulid,
    },
    WindowAdded {
        window: AvailabilityWindow,
    },
    WindowUpdated {
        window: AvailabilityWindow,
    },
    WindowRemoved {
        id: Ulid,
        provider_id: Ulid,
    },
    BookingCreated {
        booking: Booking,
    },
    BookingStatusChanged {
        id: Ulid,
        provider_id: Ulid,
        status: BookingStatus,
        version: u64,
    },
    BookingDeleted {
        id: Ulid,
        provider_id: Ulid,
    },
}

impl Event {
    /// Provider whose state this event mutates.
    pub fn provider_id(&self) -> Ulid {
        match self {
            Event::ServiceRegistered { provider_id, .. }
            | Event::ServiceRemoved { provider_id, .. }
            | Event::WindowRemoved { provider_id, .. }
            | Event::BookingStatusChanged { provider_id, .. }
            | Event::BookingDeleted { provider_id, .. } => *provider_id,
            Event::WindowAdded { window } | Event::WindowUpdated { window } => window.provider_id,
            Event::BookingCreated { booking } => booking.provider_id,
        }
    }
}

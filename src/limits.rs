use crate::model::Ms;

pub const MAX_TENANTS: usize = 1024;
pub const MAX_TENANT_NAME_LEN: usize = 64;

pub const MAX_SERVICES_PER_PROVIDER: usize = 1_000;
pub const MAX_WINDOWS_PER_PROVIDER: usize = 10_000;
pub const MAX_BOOKINGS_PER_PROVIDER: usize = 1_000_000;

/// One day.
pub const MAX_SERVICE_DURATION_MINUTES: u32 = 24 * 60;
pub const MAX_NOTES_LEN: usize = 2_000;

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2100-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;
/// A once-window may span at most 31 days.
pub const MAX_WINDOW_SPAN_MS: Ms = 31 * 86_400_000;

//! Hard caps on input sizes. Violations surface as `EngineError::LimitExceeded`.

pub const MAX_RESOURCES: usize = 10_000;
pub const MAX_USERS: usize = 1_000_000;
pub const MAX_BOOKINGS_PER_RESOURCE: usize = 500_000;
pub const MAX_ACTIVE_WAITLIST_PER_USER: usize = 50;

pub const MAX_ID_LEN: usize = 128;
pub const MAX_NAME_LEN: usize = 256;
pub const MAX_EMAIL_LEN: usize = 320;
pub const MAX_REASON_LEN: usize = 1024;
pub const MAX_PLAN_LEN: usize = 128;
/// Older discount changes stay in the timeline only.
pub const MAX_DISCOUNT_HISTORY: usize = 100;

/// One million in major currency units, in cents.
pub const MAX_AMOUNT_CENTS: i64 = 100_000_000;
/// Ten thousand hours, in minutes.
pub const MAX_SUBSCRIPTION_MINUTES: i64 = 600_000;

pub const MAX_TIMELINE_LIMIT: usize = 1_000;
pub const DEFAULT_TIMELINE_LIMIT: usize = 50;

pub const MAX_CONNECTIONS: usize = 4096;

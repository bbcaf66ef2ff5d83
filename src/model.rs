use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds, used for every wall-clock timestamp.
pub type Ms = i64;

/// Minutes since midnight.
pub type Minute = u32;

pub const MINUTES_PER_DAY: Minute = 24 * 60;

/// Half-open interval `[start, end)` within one calendar day, in minutes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    pub start: Minute,
    pub end: Minute,
}

impl Span {
    pub fn new(start: Minute, end: Minute) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration(&self) -> Minute {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    #[allow(dead_code)]
    pub fn contains_span(&self, other: &Span) -> bool {
        self.start <= other.start && other.end <= self.end
    }
}

impl fmt::Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", format_hhmm(self.start), format_hhmm(self.end))
    }
}

/// Parse `"HH:MM"` into minutes since midnight. `"24:00"` is accepted as end of day.
pub fn parse_hhmm(s: &str) -> Option<Minute> {
    let (h, m) = s.trim().split_once(':')?;
    let h: Minute = h.parse().ok()?;
    let m: Minute = m.parse().ok()?;
    if m >= 60 {
        return None;
    }
    let total = h.checked_mul(60)?.checked_add(m)?;
    (total <= MINUTES_PER_DAY).then_some(total)
}

/// `local@domain`, within the length cap.
pub fn is_email(s: &str) -> bool {
    s.len() <= crate::limits::MAX_EMAIL_LEN
        && matches!(s.split_once('@'), Some((local, domain)) if !local.is_empty() && !domain.is_empty())
}

pub fn format_hhmm(minutes: Minute) -> String {
    format!("{:02}:{:02}", minutes / 60, minutes % 60)
}

// ── Ledger units ─────────────────────────────────────────────────

/// Money in minor units (cents). Signed: balances may go negative down to the credit floor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Money(pub i64);

impl Money {
    pub const ZERO: Money = Money(0);

    pub fn cents(self) -> i64 {
        self.0
    }

    pub fn as_f64(self) -> f64 {
        self.0 as f64 / 100.0
    }
}

impl std::ops::Add for Money {
    type Output = Money;
    fn add(self, rhs: Money) -> Money {
        Money(self.0 + rhs.0)
    }
}

impl std::ops::Sub for Money {
    type Output = Money;
    fn sub(self, rhs: Money) -> Money {
        Money(self.0 - rhs.0)
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        write!(f, "{sign}{}.{:02}", abs / 100, abs % 100)
    }
}

impl FromStr for Money {
    type Err = String;

    /// Accepts `15`, `15.5`, `-80.25`. More than two fractional digits is rejected.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let cents = parse_fixed(s, 2).ok_or_else(|| format!("invalid amount: {s}"))?;
        Ok(Money(cents))
    }
}

/// Subscription hours, stored as whole minutes so deduction and refund are exact.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Hours(pub i64);

impl Hours {
    pub const ZERO: Hours = Hours(0);

    pub fn from_minutes(minutes: i64) -> Self {
        Hours(minutes)
    }

    pub fn minutes(self) -> i64 {
        self.0
    }

    pub fn as_f64(self) -> f64 {
        self.0 as f64 / 60.0
    }
}

impl fmt::Display for Hours {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let v = self.as_f64();
        if v.fract() == 0.0 {
            write!(f, "{v:.0}")
        } else {
            // Trim to at most 4 decimals without trailing zeros: 0.5, 1.25, 0.3333
            let s = format!("{v:.4}");
            write!(f, "{}", s.trim_end_matches('0'))
        }
    }
}

impl FromStr for Hours {
    type Err = String;

    /// Decimal hours that land on a whole minute: `2`, `1.5`, `0.25`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || format!("invalid hours (must be a whole number of minutes): {s}");
        // Parse with 4 decimals of precision, then require an exact minute.
        let ten_thousandths = parse_fixed(s, 4).ok_or_else(err)?;
        let scaled = ten_thousandths.checked_mul(60).ok_or_else(err)?;
        if scaled % 10_000 != 0 {
            return Err(err());
        }
        Ok(Hours(scaled / 10_000))
    }
}

/// Parse a decimal string into an integer scaled by 10^`scale`.
fn parse_fixed(s: &str, scale: u32) -> Option<i64> {
    let s = s.trim();
    let (neg, digits) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s),
    };
    let (int_part, frac_part) = match digits.split_once('.') {
        Some((i, f)) => (i, f),
        None => (digits, ""),
    };
    if int_part.is_empty() && frac_part.is_empty() {
        return None;
    }
    if frac_part.len() > scale as usize {
        return None;
    }
    if !int_part.chars().all(|c| c.is_ascii_digit()) || !frac_part.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let int: i64 = if int_part.is_empty() { 0 } else { int_part.parse().ok()? };
    let mut frac: i64 = if frac_part.is_empty() { 0 } else { frac_part.parse().ok()? };
    for _ in frac_part.len()..scale as usize {
        frac *= 10;
    }
    let value = int.checked_mul(10i64.pow(scale))?.checked_add(frac)?;
    Some(if neg { -value } else { value })
}

// ── Enumerations ─────────────────────────────────────────────────

macro_rules! string_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = String;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s.trim().to_ascii_lowercase().as_str() {
                    $($text => Ok($name::$variant),)+
                    other => Err(format!(concat!("unknown ", stringify!($name), ": {}"), other)),
                }
            }
        }
    };
}

string_enum!(ResourceKind { Cabinet => "cabinet", Capsule => "capsule" });
string_enum!(Role { Owner => "owner", SeniorAdmin => "senior_admin", Admin => "admin", User => "user" });
string_enum!(BookingStatus { Confirmed => "confirmed", Cancelled => "cancelled" });
string_enum!(PaymentMethod { Balance => "balance", Subscription => "subscription" });
string_enum!(BookingFormat { Individual => "individual", Group => "group" });
string_enum!(WaitlistStatus { Active => "active", Fulfilled => "fulfilled", Cancelled => "cancelled" });

impl Role {
    /// Staff roles may act on other users' bookings and accounts.
    pub fn is_privileged(&self) -> bool {
        matches!(self, Role::Owner | Role::SeniorAdmin | Role::Admin)
    }
}

// ── Records ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    pub id: String,
    pub name: String,
    pub kind: ResourceKind,
    pub location: String,
    pub hourly_rate: Money,
    pub capacity: u32,
    pub min_booking_hours: u32,
    pub active: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub remaining: Hours,
    pub frozen: bool,
    pub frozen_until: Option<Ms>,
    pub plan: Option<String>,
}

impl Subscription {
    pub fn new(remaining: Hours, plan: Option<String>) -> Self {
        Self {
            remaining,
            frozen: false,
            frozen_until: None,
            plan,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscountChange {
    pub old_percent: u8,
    pub new_percent: u8,
    pub reason: String,
    /// Name of the staff member who made the change.
    pub changed_by: String,
    pub at: Ms,
}

/// A payer account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: Ulid,
    pub email: String,
    pub name: String,
    pub role: Role,
    pub balance: Money,
    /// Non-negative: how far below zero `balance` may go.
    pub credit_limit: Money,
    pub subscription: Option<Subscription>,
    /// 0..=100. Informational: clients apply it when quoting `final_price`.
    pub personal_discount_percent: u8,
    /// Newest first.
    pub discount_history: Vec<DiscountChange>,
    pub created_at: Ms,
}

impl User {
    pub fn new(id: Ulid, email: String, name: String, role: Role, created_at: Ms) -> Self {
        Self {
            id,
            email,
            name,
            role,
            balance: Money::ZERO,
            credit_limit: Money::ZERO,
            subscription: None,
            personal_discount_percent: 0,
            discount_history: Vec::new(),
            created_at,
        }
    }

    pub fn available_funds(&self) -> Money {
        self.balance + self.credit_limit
    }
}

/// The authenticated user a request runs as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor {
    pub id: Ulid,
    pub email: String,
    pub name: String,
    pub role: Role,
}

impl Actor {
    pub fn is_privileged(&self) -> bool {
        self.role.is_privileged()
    }

    /// Owner of the record, or staff.
    pub fn may_act_for(&self, owner: Ulid) -> bool {
        self.id == owner || self.is_privileged()
    }
}

impl From<&User> for Actor {
    fn from(user: &User) -> Self {
        Self {
            id: user.id,
            email: user.email.clone(),
            name: user.name.clone(),
            role: user.role,
        }
    }
}

/// What a booking cost its payer, in the unit it was paid in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Charge {
    Balance(Money),
    Hours(Hours),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub resource_id: String,
    /// Payer and owner.
    pub user_id: Ulid,
    pub date: NaiveDate,
    pub span: Span,
    pub status: BookingStatus,
    pub payment_method: PaymentMethod,
    pub final_price: Money,
    pub hours_deducted: Option<Hours>,
    pub format: BookingFormat,
    pub cancellation_reason: Option<String>,
    pub cancelled_by: Option<String>,
    pub re_rent_listed: bool,
    pub calendar_event_id: Option<String>,
    pub created_at: Ms,
}

impl Booking {
    pub fn start_time(&self) -> Minute {
        self.span.start
    }

    pub fn duration(&self) -> Minute {
        self.span.duration()
    }

    pub fn is_confirmed(&self) -> bool {
        self.status == BookingStatus::Confirmed
    }

    /// The charge recorded at creation. Refunds reverse exactly this.
    pub fn recorded_charge(&self) -> Charge {
        match self.payment_method {
            PaymentMethod::Subscription => Charge::Hours(
                self.hours_deducted
                    .unwrap_or(Hours::from_minutes(self.duration() as i64)),
            ),
            PaymentMethod::Balance => Charge::Balance(self.final_price),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitlistEntry {
    pub id: Ulid,
    pub user_id: Ulid,
    pub resource_id: String,
    pub date: NaiveDate,
    pub span: Span,
    pub status: WaitlistStatus,
    pub created_at: Ms,
}

/// All bookings of one resource, sorted by `(date, span.start)`.
#[derive(Debug, Clone)]
pub struct ResourceState {
    pub resource: Resource,
    pub bookings: Vec<Booking>,
}

impl ResourceState {
    pub fn new(resource: Resource) -> Self {
        Self {
            resource,
            bookings: Vec::new(),
        }
    }

    /// Insert booking maintaining sort order by `(date, start)`.
    pub fn insert_booking(&mut self, booking: Booking) {
        let key = (booking.date, booking.span.start);
        let pos = self
            .bookings
            .partition_point(|b| (b.date, b.span.start) <= key);
        self.bookings.insert(pos, booking);
    }

    pub fn booking(&self, id: Ulid) -> Option<&Booking> {
        self.bookings.iter().find(|b| b.id == id)
    }

    pub fn booking_mut(&mut self, id: Ulid) -> Option<&mut Booking> {
        self.bookings.iter_mut().find(|b| b.id == id)
    }

    /// All bookings (any status) on `date`, in start order.
    pub fn on_day(&self, date: NaiveDate) -> &[Booking] {
        let lo = self.bookings.partition_point(|b| b.date < date);
        let hi = self.bookings.partition_point(|b| b.date <= date);
        &self.bookings[lo..hi]
    }

    /// Confirmed bookings on `date` whose span overlaps `query`.
    pub fn overlapping(&self, date: NaiveDate, query: &Span) -> impl Iterator<Item = &Booking> {
        let day = self.on_day(date);
        // Everything at index >= right_bound starts at or after query.end → can't overlap.
        let right_bound = day.partition_point(|b| b.span.start < query.end);
        day[..right_bound]
            .iter()
            .filter(move |b| b.is_confirmed() && b.span.end > query.start)
    }
}

/// The event types. Flat, no nesting beyond the records themselves. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ResourceCreated {
        resource: Resource,
    },
    ResourceUpdated {
        resource: Resource,
    },
    UserRegistered {
        user: User,
    },
    RoleChanged {
        user_id: Ulid,
        role: Role,
    },
    BalanceAdjusted {
        user_id: Ulid,
        delta: Money,
    },
    CreditLimitSet {
        user_id: Ulid,
        limit: Money,
    },
    SubscriptionAssigned {
        user_id: Ulid,
        subscription: Subscription,
    },
    SubscriptionFrozen {
        user_id: Ulid,
        frozen: bool,
        frozen_until: Option<Ms>,
    },
    DiscountSet {
        user_id: Ulid,
        change: DiscountChange,
    },
    /// Booking row and payer charge in one record: both land or neither does.
    BookingCreated {
        booking: Booking,
        charge: Charge,
    },
    /// Snapshot of an existing booking, written by compaction. Carries no charge.
    BookingRestored {
        booking: Booking,
    },
    BookingCancelled {
        id: Ulid,
        resource_id: String,
        user_id: Ulid,
        reason: String,
        cancelled_by: String,
        refund: Charge,
    },
    BookingReRentListed {
        id: Ulid,
        resource_id: String,
        listed: bool,
    },
    CalendarLinked {
        id: Ulid,
        resource_id: String,
        event_id: String,
    },
    CalendarUnlinked {
        id: Ulid,
        resource_id: String,
    },
    WaitlistJoined {
        entry: WaitlistEntry,
    },
    WaitlistStatusChanged {
        id: Ulid,
        status: WaitlistStatus,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 6, 1).unwrap()
    }

    fn booking(date: NaiveDate, start: Minute, end: Minute) -> Booking {
        Booking {
            id: Ulid::new(),
            resource_id: "R1".into(),
            user_id: Ulid::new(),
            date,
            span: Span::new(start, end),
            status: BookingStatus::Confirmed,
            payment_method: PaymentMethod::Balance,
            final_price: Money(1000),
            hours_deducted: None,
            format: BookingFormat::Individual,
            cancellation_reason: None,
            cancelled_by: None,
            re_rent_listed: false,
            calendar_event_id: None,
            created_at: 0,
        }
    }

    fn resource_state() -> ResourceState {
        ResourceState::new(Resource {
            id: "R1".into(),
            name: "Room 1".into(),
            kind: ResourceKind::Cabinet,
            location: "unbox_one".into(),
            hourly_rate: Money(2000),
            capacity: 4,
            min_booking_hours: 1,
            active: true,
        })
    }

    #[test]
    fn span_overlap() {
        let a = Span::new(600, 660);
        let b = Span::new(630, 660);
        let c = Span::new(660, 690);
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c)); // adjacent, not overlapping
        assert_eq!(a.duration(), 60);
    }

    #[test]
    fn hhmm_parse_and_format() {
        assert_eq!(parse_hhmm("10:00"), Some(600));
        assert_eq!(parse_hhmm("09:05"), Some(545));
        assert_eq!(parse_hhmm("24:00"), Some(1440));
        assert_eq!(parse_hhmm("24:01"), None);
        assert_eq!(parse_hhmm("10:60"), None);
        assert_eq!(parse_hhmm("ten"), None);
        assert_eq!(format_hhmm(545), "09:05");
        assert_eq!(Span::new(600, 690).to_string(), "10:00-11:30");
    }

    #[test]
    fn hhmm_rejects_oversized_hours() {
        assert_eq!(parse_hhmm("25:00"), None);
        assert_eq!(parse_hhmm("99999999:00"), None);
        assert_eq!(parse_hhmm("71582789:00"), None); // wraps to 00:44 unchecked
        assert_eq!(parse_hhmm("4294967295:59"), None);
    }

    #[test]
    fn money_parse_and_display() {
        assert_eq!("15".parse::<Money>().unwrap(), Money(1500));
        assert_eq!("15.5".parse::<Money>().unwrap(), Money(1550));
        assert_eq!("-80.25".parse::<Money>().unwrap(), Money(-8025));
        assert_eq!(".5".parse::<Money>().unwrap(), Money(50));
        assert!("1.234".parse::<Money>().is_err());
        assert!("abc".parse::<Money>().is_err());
        assert!("".parse::<Money>().is_err());
        assert_eq!(Money(-9500).to_string(), "-95.00");
        assert_eq!(Money(5).to_string(), "0.05");
        assert_eq!(Money(-5).to_string(), "-0.05");
    }

    #[test]
    fn hours_parse_and_display() {
        assert_eq!("2".parse::<Hours>().unwrap(), Hours(120));
        assert_eq!("1.5".parse::<Hours>().unwrap(), Hours(90));
        assert_eq!("0.25".parse::<Hours>().unwrap(), Hours(15));
        assert!("0.01".parse::<Hours>().is_err()); // 0.6 minutes
        assert_eq!(Hours(30).to_string(), "0.5");
        assert_eq!(Hours(120).to_string(), "2");
        assert_eq!(Hours(75).to_string(), "1.25");
    }

    #[test]
    fn hours_too_large_is_an_error() {
        assert!("100000000000000".parse::<Hours>().is_err());
        assert!("-100000000000000".parse::<Hours>().is_err());
        assert!("99999999999999999999".parse::<Hours>().is_err());
    }

    #[test]
    fn role_privilege() {
        assert!(Role::Owner.is_privileged());
        assert!(Role::SeniorAdmin.is_privileged());
        assert!(Role::Admin.is_privileged());
        assert!(!Role::User.is_privileged());
        assert_eq!("senior_admin".parse::<Role>().unwrap(), Role::SeniorAdmin);
        assert!("root".parse::<Role>().is_err());
    }

    #[test]
    fn bookings_sorted_by_day_then_start() {
        let mut rs = resource_state();
        let next = day().succ_opt().unwrap();
        rs.insert_booking(booking(next, 540, 600));
        rs.insert_booking(booking(day(), 720, 780));
        rs.insert_booking(booking(day(), 600, 660));
        let keys: Vec<_> = rs.bookings.iter().map(|b| (b.date, b.span.start)).collect();
        assert_eq!(keys, vec![(day(), 600), (day(), 720), (next, 540)]);
        assert_eq!(rs.on_day(day()).len(), 2);
        assert_eq!(rs.on_day(next).len(), 1);
    }

    #[test]
    fn overlapping_skips_cancelled_and_other_days() {
        let mut rs = resource_state();
        let mut cancelled = booking(day(), 600, 660);
        cancelled.status = BookingStatus::Cancelled;
        rs.insert_booking(cancelled);
        rs.insert_booking(booking(day().succ_opt().unwrap(), 600, 660));
        rs.insert_booking(booking(day(), 660, 720));
        let query = Span::new(630, 670);
        let hits: Vec<_> = rs.overlapping(day(), &query).collect();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].span, Span::new(660, 720));
    }

    #[test]
    fn overlapping_adjacent_not_included() {
        let mut rs = resource_state();
        rs.insert_booking(booking(day(), 600, 660));
        let hits: Vec<_> = rs.overlapping(day(), &Span::new(660, 690)).collect();
        assert!(hits.is_empty());
    }

    #[test]
    fn recorded_charge_uses_stored_values() {
        let mut b = booking(day(), 600, 690);
        assert_eq!(b.recorded_charge(), Charge::Balance(Money(1000)));
        b.payment_method = PaymentMethod::Subscription;
        b.hours_deducted = Some(Hours(90));
        assert_eq!(b.recorded_charge(), Charge::Hours(Hours(90)));
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::BookingCreated {
            booking: booking(day(), 600, 660),
            charge: Charge::Balance(Money(1500)),
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}

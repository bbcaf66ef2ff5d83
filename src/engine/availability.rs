use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::*;

// ── Availability Algorithm ────────────────────────────────────────

/// Whether bookings listed for re-rent count as occupying their slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReRentPolicy {
    /// Listed bookings still block. Always used when creating bookings.
    #[default]
    Block,
    /// Listed bookings are treated as free (availability display).
    Skip,
}

/// Result of a slot check. `conflict` is set iff `available` is false.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Availability {
    pub available: bool,
    pub conflict: Option<ConflictInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictInfo {
    pub booking_id: Ulid,
    pub span: Span,
    pub description: String,
}

impl Availability {
    pub fn free() -> Self {
        Self {
            available: true,
            conflict: None,
        }
    }

    pub fn taken(booking: &Booking) -> Self {
        Self {
            available: false,
            conflict: Some(ConflictInfo {
                booking_id: booking.id,
                span: booking.span,
                description: describe_conflict(booking),
            }),
        }
    }
}

pub fn describe_conflict(booking: &Booking) -> String {
    format!(
        "booking {} on {} {} ({} min)",
        booking.id,
        booking.date,
        booking.span,
        booking.duration()
    )
}

/// First confirmed booking on `date` overlapping `span`, in start order.
///
/// Overlap is half-open: `[a, b)` and `[b, c)` do not conflict.
pub fn find_conflict<'a>(
    rs: &'a ResourceState,
    date: NaiveDate,
    span: &Span,
    exclude: Option<Ulid>,
    policy: ReRentPolicy,
) -> Option<&'a Booking> {
    rs.overlapping(date, span).find(|b| {
        if exclude == Some(b.id) {
            return false;
        }
        !(policy == ReRentPolicy::Skip && b.re_rent_listed)
    })
}

/// Free windows of `date` after removing confirmed bookings.
pub fn free_slots(rs: &ResourceState, date: NaiveDate, policy: ReRentPolicy) -> Vec<Span> {
    let day = [Span::new(0, MINUTES_PER_DAY)];
    let mut taken: Vec<Span> = rs
        .on_day(date)
        .iter()
        .filter(|b| b.is_confirmed())
        .filter(|b| !(policy == ReRentPolicy::Skip && b.re_rent_listed))
        .map(|b| b.span)
        .collect();
    if taken.is_empty() {
        return day.to_vec();
    }
    taken.sort_by_key(|s| s.start);
    let taken = merge_overlapping(&taken);
    subtract_intervals(&day, &taken)
}

/// Merge sorted overlapping/adjacent intervals into disjoint intervals.
pub fn merge_overlapping(sorted: &[Span]) -> Vec<Span> {
    let mut merged: Vec<Span> = Vec::new();
    for &span in sorted {
        if let Some(last) = merged.last_mut()
            && span.start <= last.end {
                last.end = last.end.max(span.end);
                continue;
            }
        merged.push(span);
    }
    merged
}

pub fn subtract_intervals(base: &[Span], to_remove: &[Span]) -> Vec<Span> {
    let mut result = Vec::new();
    let mut ri = 0;

    for &b in base {
        let mut current_start = b.start;
        let current_end = b.end;

        while ri < to_remove.len() && to_remove[ri].end <= current_start {
            ri += 1;
        }

        let mut j = ri;
        while j < to_remove.len() && to_remove[j].start < current_end {
            let r = &to_remove[j];
            if r.start > current_start {
                result.push(Span::new(current_start, r.start));
            }
            current_start = current_start.max(r.end);
            j += 1;
        }

        if current_start < current_end {
            result.push(Span::new(current_start, current_end));
        }
    }

    result
}

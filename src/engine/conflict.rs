use chrono::NaiveDate;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::availability::{describe_conflict, find_conflict, ReRentPolicy};
use super::EngineError;

pub(crate) fn validate_id(id: &str, what: &'static str) -> Result<(), EngineError> {
    if id.trim().is_empty() {
        return Err(EngineError::Invalid(format!("{what} must not be empty")));
    }
    if id.len() > MAX_ID_LEN {
        return Err(EngineError::LimitExceeded("id too long"));
    }
    Ok(())
}

pub(crate) fn validate_len(text: &str, max: usize, what: &'static str) -> Result<(), EngineError> {
    if text.len() > max {
        return Err(EngineError::LimitExceeded(what));
    }
    Ok(())
}

pub(crate) fn validate_amount(amount: Money) -> Result<(), EngineError> {
    if amount.cents().abs() > MAX_AMOUNT_CENTS {
        return Err(EngineError::LimitExceeded("amount out of range"));
    }
    Ok(())
}

/// `start + duration` must stay within the day.
pub(crate) fn booking_span(start_time: Minute, duration: Minute) -> Result<Span, EngineError> {
    if duration == 0 {
        return Err(EngineError::Invalid("duration must be positive".into()));
    }
    let end = start_time
        .checked_add(duration)
        .filter(|end| *end <= MINUTES_PER_DAY)
        .ok_or_else(|| {
            EngineError::Invalid(format!(
                "booking {}+{duration}min runs past midnight",
                format_hhmm(start_time.min(MINUTES_PER_DAY))
            ))
        })?;
    Ok(Span::new(start_time, end))
}

pub(crate) fn window_span(start: Minute, end: Minute) -> Result<Span, EngineError> {
    if start >= end {
        return Err(EngineError::Invalid("start must be before end".into()));
    }
    if end > MINUTES_PER_DAY {
        return Err(EngineError::Invalid("window runs past midnight".into()));
    }
    Ok(Span::new(start, end))
}

/// Creation check: re-rent-listed bookings still block.
pub(crate) fn check_no_conflict(
    rs: &ResourceState,
    date: NaiveDate,
    span: &Span,
    exclude: Option<Ulid>,
) -> Result<(), EngineError> {
    match find_conflict(rs, date, span, exclude, ReRentPolicy::Block) {
        Some(existing) => Err(EngineError::SlotConflict(describe_conflict(existing))),
        None => Ok(()),
    }
}

use chrono::NaiveDate;
use dashmap::mapref::entry::Entry;
use tracing::{info, warn};
use ulid::Ulid;

use crate::audit::TimelineEvent;
use crate::limits::*;
use crate::model::*;
use crate::observability;

use super::conflict::{booking_span, check_no_conflict, validate_amount, validate_id, validate_len};
use super::settlement::ensure_covered;
use super::{now_ms, Engine, EngineError, SharedUser};

const DEFAULT_CANCEL_REASON: &str = "User cancelled";
const MS_PER_HOUR: f64 = 3_600_000.0;

/// A booking request as received from a client.
#[derive(Debug, Clone, PartialEq)]
pub struct NewBooking {
    pub id: Ulid,
    pub resource_id: String,
    pub date: NaiveDate,
    pub start_time: Minute,
    pub duration: Minute,
    pub payment_method: PaymentMethod,
    pub final_price: Money,
    pub format: BookingFormat,
    /// Staff only: bill someone else, by id or email.
    pub target_user: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CancelOutcome {
    pub booking: Booking,
    /// `None` when the booking was already cancelled.
    pub refund: Option<Charge>,
    pub is_late: bool,
}

impl Engine {
    pub async fn create_booking(&self, actor: &Actor, request: NewBooking) -> Result<Booking, EngineError> {
        let result = self.create_booking_inner(actor, request).await;
        match &result {
            Ok(booking) => {
                metrics::counter!(
                    observability::BOOKINGS_CREATED_TOTAL,
                    "payment_method" => booking.payment_method.as_str()
                )
                .increment(1);
            }
            Err(e) => {
                metrics::counter!(observability::BOOKINGS_REJECTED_TOTAL, "reason" => e.kind())
                    .increment(1);
            }
        }
        result
    }

    async fn create_booking_inner(&self, actor: &Actor, request: NewBooking) -> Result<Booking, EngineError> {
        let payer_id = self.resolve_payer(actor, request.target_user.as_deref())?;
        validate_id(&request.resource_id, "resource id")?;
        let span = booking_span(request.start_time, request.duration)?;
        if request.final_price < Money::ZERO {
            return Err(EngineError::Invalid("final price must not be negative".into()));
        }
        validate_amount(request.final_price)?;

        let rs = self
            .get_resource(&request.resource_id)
            .ok_or_else(|| EngineError::NotFound(format!("resource {}", request.resource_id)))?;
        let payer = self.user_handle(&payer_id)?;

        let booking = {
            let _commit = self.commit_gate.read().await;
            // Held through check, charge and commit: concurrent creates on this
            // resource are serialized.
            let mut guard = rs.write().await;
            if !guard.resource.active {
                return Err(EngineError::Invalid(format!("resource {} is not active", request.resource_id)));
            }
            if guard.bookings.len() >= MAX_BOOKINGS_PER_RESOURCE {
                return Err(EngineError::LimitExceeded("too many bookings on resource"));
            }
            // Ids are global: reserve across all resources before checking this one.
            match self.booking_index.entry(request.id) {
                Entry::Occupied(_) => {
                    return Err(EngineError::AlreadyExists(format!("booking {}", request.id)));
                }
                Entry::Vacant(slot) => {
                    slot.insert(request.resource_id.clone());
                }
            }
            let committed = self
                .commit_booking(&mut guard, &payer, payer_id, &request, span)
                .await;
            if committed.is_err() {
                self.booking_index.remove(&request.id);
            }
            committed?
        };

        info!(
            booking = %booking.id,
            resource = %booking.resource_id,
            payer = %booking.user_id,
            "booked {} {}",
            booking.date,
            booking.span
        );
        self.fulfil_waitlist(&booking).await;
        let booking = self.mirror_to_calendar(booking).await;

        let mut audit = TimelineEvent::new(
            actor,
            booking.id.to_string(),
            "booking",
            "booking_created",
            format!(
                "booking {} on {} {} {}",
                booking.resource_id, booking.date, booking.span, booking.payment_method
            ),
        )
        .with("resource_id", booking.resource_id.clone())
        .with("date", booking.date.to_string())
        .with("start_time", format_hhmm(booking.span.start))
        .with("duration", booking.duration())
        .with("payment_method", booking.payment_method.as_str())
        .with("final_price", booking.final_price.as_f64())
        .with("user_id", booking.user_id.to_string());
        if let Some(hours) = booking.hours_deducted {
            audit = audit.with("hours_deducted", hours.as_f64());
        }
        self.audit.log_event(audit);
        Ok(booking)
    }

    /// Conflict check, charge and WAL commit. Caller holds the resource write lock
    /// and has reserved `request.id`.
    async fn commit_booking(
        &self,
        guard: &mut ResourceState,
        payer: &SharedUser,
        payer_id: Ulid,
        request: &NewBooking,
        span: Span,
    ) -> Result<Booking, EngineError> {
        check_no_conflict(guard, request.date, &span, None)?;

        let (charge, hours_deducted) = match request.payment_method {
            PaymentMethod::Subscription => {
                let hours = Hours::from_minutes(span.duration() as i64);
                (Charge::Hours(hours), Some(hours))
            }
            PaymentMethod::Balance => (Charge::Balance(request.final_price), None),
        };

        let mut payer_guard = payer.lock().await;
        ensure_covered(&payer_guard, charge)?;

        let booking = Booking {
            id: request.id,
            resource_id: request.resource_id.clone(),
            user_id: payer_id,
            date: request.date,
            span,
            status: BookingStatus::Confirmed,
            payment_method: request.payment_method,
            final_price: request.final_price,
            hours_deducted,
            format: request.format,
            cancellation_reason: None,
            cancelled_by: None,
            re_rent_listed: false,
            calendar_event_id: None,
            created_at: now_ms(),
        };
        let event = Event::BookingCreated {
            booking: booking.clone(),
            charge,
        };
        self.persist_and_apply(guard, Some(&mut payer_guard), &event)
            .await?;
        Ok(booking)
    }

    /// Default payer is the requester. Staff may bill another user by id or email.
    fn resolve_payer(&self, actor: &Actor, target: Option<&str>) -> Result<Ulid, EngineError> {
        let Some(handle) = target.map(str::trim).filter(|h| !h.is_empty()) else {
            return Ok(actor.id);
        };
        if !actor.is_privileged() {
            return match self.resolve_user(handle) {
                Some(id) if id == actor.id => Ok(id),
                _ => Err(EngineError::Forbidden("only staff may book for another user")),
            };
        }
        self.resolve_user(handle)
            .ok_or_else(|| EngineError::NotFound(format!("target user {handle}")))
    }

    /// Best-effort: errors are logged and counted, never returned.
    async fn mirror_to_calendar(&self, mut booking: Booking) -> Booking {
        match self.calendar.create_event(&booking).await {
            Ok(Some(event_id)) => {
                if self.link_calendar_event(&booking, &event_id).await {
                    booking.calendar_event_id = Some(event_id);
                }
            }
            Ok(None) => {}
            Err(e) => {
                metrics::counter!(observability::CALENDAR_SYNC_FAILURES_TOTAL, "op" => "create")
                    .increment(1);
                warn!(booking = %booking.id, "calendar mirror failed: {e}");
            }
        }
        booking
    }

    async fn link_calendar_event(&self, booking: &Booking, event_id: &str) -> bool {
        let Some(rs) = self.get_resource(&booking.resource_id) else {
            return false;
        };
        let linked = {
            let _commit = self.commit_gate.read().await;
            let mut guard = rs.write().await;
            match guard.booking(booking.id) {
                Some(current) if current.is_confirmed() => {
                    let event = Event::CalendarLinked {
                        id: booking.id,
                        resource_id: booking.resource_id.clone(),
                        event_id: event_id.to_string(),
                    };
                    match self.persist_and_apply(&mut guard, None, &event).await {
                        Ok(()) => true,
                        Err(e) => {
                            warn!(booking = %booking.id, "could not record calendar event {event_id}: {e}");
                            false
                        }
                    }
                }
                _ => false,
            }
        };
        if !linked {
            // Cancelled while the event was being created, or unrecorded: remove the orphan.
            if let Err(e) = self.calendar.delete_event(event_id, &booking.resource_id).await {
                warn!(booking = %booking.id, "orphan calendar event {event_id} not removed: {e}");
            }
        }
        linked
    }

    /// Cancel and refund the owner exactly what was charged. Cancelling a cancelled
    /// booking returns it unchanged.
    pub async fn cancel_booking(
        &self,
        actor: &Actor,
        id: Ulid,
        reason: Option<String>,
    ) -> Result<CancelOutcome, EngineError> {
        let reason = reason
            .map(|r| r.trim().to_string())
            .filter(|r| !r.is_empty())
            .unwrap_or_else(|| DEFAULT_CANCEL_REASON.to_string());
        validate_len(&reason, MAX_REASON_LEN, "cancellation reason too long")?;
        let resource_id = self
            .resource_for_booking(&id)
            .ok_or_else(|| EngineError::NotFound(format!("booking {id}")))?;
        let rs = self
            .get_resource(&resource_id)
            .ok_or_else(|| EngineError::NotFound(format!("resource {resource_id}")))?;

        let (booking, refund) = {
            let _commit = self.commit_gate.read().await;
            let mut guard = rs.write().await;
            let booking = guard
                .booking(id)
                .cloned()
                .ok_or_else(|| EngineError::NotFound(format!("booking {id}")))?;
            if !actor.may_act_for(booking.user_id) {
                return Err(EngineError::Forbidden("not the owner of this booking"));
            }
            if !booking.is_confirmed() {
                return Ok(CancelOutcome {
                    booking,
                    refund: None,
                    is_late: false,
                });
            }

            let refund = booking.recorded_charge();
            let owner = self.user_handle(&booking.user_id)?;
            let mut owner_guard = owner.lock().await;
            let event = Event::BookingCancelled {
                id,
                resource_id: resource_id.clone(),
                user_id: booking.user_id,
                reason: reason.clone(),
                cancelled_by: actor.email.clone(),
                refund,
            };
            self.persist_and_apply(&mut guard, Some(&mut owner_guard), &event)
                .await?;
            let booking = guard
                .booking(id)
                .cloned()
                .ok_or_else(|| EngineError::NotFound(format!("booking {id}")))?;
            (booking, refund)
        };

        let booking = self.unmirror_from_calendar(booking).await;

        let hours_until_start = (self.starts_at_ms(&booking) - now_ms()) as f64 / MS_PER_HOUR;
        let is_late = hours_until_start < self.settings.late_cancel_hours as f64;
        metrics::counter!(observability::BOOKINGS_CANCELLED_TOTAL).increment(1);
        if is_late {
            metrics::counter!(observability::LATE_CANCELLATIONS_TOTAL).increment(1);
        }
        info!(booking = %id, late = is_late, "cancelled: {reason}");

        let (refunded_amount, refunded_hours) = match refund {
            Charge::Balance(amount) => (amount.as_f64(), 0.0),
            Charge::Hours(hours) => (0.0, hours.as_f64()),
        };
        self.audit.log_event(
            TimelineEvent::new(
                actor,
                id.to_string(),
                "booking",
                "booking_cancelled",
                format!("booking {} on {} {} cancelled: {reason}", resource_id, booking.date, booking.span),
            )
            .with("reason", reason)
            .with("is_late_cancellation", is_late)
            .with("hours_until_start", (hours_until_start * 100.0).round() / 100.0)
            .with("refunded_amount", refunded_amount)
            .with("refunded_hours", refunded_hours)
            .with("user_id", booking.user_id.to_string()),
        );

        self.announce_freed_slot(&booking);
        Ok(CancelOutcome {
            booking,
            refund: Some(refund),
            is_late,
        })
    }

    /// The stored reference is cleared whether or not the remote delete succeeded.
    async fn unmirror_from_calendar(&self, mut booking: Booking) -> Booking {
        let Some(event_id) = booking.calendar_event_id.clone() else {
            return booking;
        };
        if let Err(e) = self.calendar.delete_event(&event_id, &booking.resource_id).await {
            metrics::counter!(observability::CALENDAR_SYNC_FAILURES_TOTAL, "op" => "delete")
                .increment(1);
            warn!(booking = %booking.id, "calendar event {event_id} not removed: {e}");
        }
        let Some(rs) = self.get_resource(&booking.resource_id) else {
            return booking;
        };
        let _commit = self.commit_gate.read().await;
        let mut guard = rs.write().await;
        let event = Event::CalendarUnlinked {
            id: booking.id,
            resource_id: booking.resource_id.clone(),
        };
        match self.persist_and_apply(&mut guard, None, &event).await {
            Ok(()) => booking.calendar_event_id = None,
            Err(e) => warn!(booking = %booking.id, "could not clear calendar reference: {e}"),
        }
        booking
    }

    /// Booking start as a UTC instant, reading date and time in the venue's offset.
    pub(super) fn starts_at_ms(&self, booking: &Booking) -> Ms {
        let start = booking.span.start;
        let local = booking
            .date
            .and_hms_opt(start / 60, start % 60, 0)
            .unwrap_or_else(|| booking.date.and_time(chrono::NaiveTime::MIN));
        local.and_utc().timestamp_millis() - self.settings.utc_offset.local_minus_utc() as Ms * 1000
    }

    /// Offer a confirmed booking for re-rent, or withdraw the offer.
    pub async fn set_re_rent_listed(&self, actor: &Actor, id: Ulid, listed: bool) -> Result<Booking, EngineError> {
        let resource_id = self
            .resource_for_booking(&id)
            .ok_or_else(|| EngineError::NotFound(format!("booking {id}")))?;
        let rs = self
            .get_resource(&resource_id)
            .ok_or_else(|| EngineError::NotFound(format!("resource {resource_id}")))?;
        let _commit = self.commit_gate.read().await;
        let mut guard = rs.write().await;
        let booking = guard
            .booking(id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("booking {id}")))?;
        if !actor.may_act_for(booking.user_id) {
            return Err(EngineError::Forbidden("not the owner of this booking"));
        }
        if !booking.is_confirmed() {
            return Err(EngineError::Invalid("cancelled bookings cannot be listed for re-rent".into()));
        }
        if booking.re_rent_listed == listed {
            return Ok(booking);
        }

        let event = Event::BookingReRentListed {
            id,
            resource_id,
            listed,
        };
        self.persist_and_apply(&mut guard, None, &event).await?;
        let event_type = if listed { "re_rent_listed" } else { "re_rent_unlisted" };
        self.audit.log_event(TimelineEvent::new(
            actor,
            id.to_string(),
            "booking",
            event_type,
            format!("booking on {} {} {event_type}", booking.date, booking.span),
        ));
        guard
            .booking(id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("booking {id}")))
    }
}

use chrono::NaiveDate;
use ulid::Ulid;

use crate::audit::{TimelineEvent, TimelineFilter};
use crate::limits::*;
use crate::model::*;

use super::availability::{self, Availability, ReRentPolicy};
use super::conflict::booking_span;
use super::{Engine, EngineError, SharedResourceState, SharedUser};

/// Filters for `list_bookings`. Every field is optional.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BookingFilter {
    pub resource_id: Option<String>,
    pub date: Option<NaiveDate>,
    pub status: Option<BookingStatus>,
    pub user_id: Option<Ulid>,
}

impl BookingFilter {
    fn matches(&self, booking: &Booking) -> bool {
        self.date.is_none_or(|d| booking.date == d)
            && self.status.is_none_or(|s| booking.status == s)
            && self.user_id.is_none_or(|u| booking.user_id == u)
    }
}

impl Engine {
    fn resource_or_not_found(&self, id: &str) -> Result<SharedResourceState, EngineError> {
        self.get_resource(id)
            .ok_or_else(|| EngineError::NotFound(format!("resource {id}")))
    }

    /// Read-only slot check.
    pub async fn is_available(
        &self,
        resource_id: &str,
        date: NaiveDate,
        start_time: Minute,
        duration: Minute,
        exclude: Option<Ulid>,
        policy: ReRentPolicy,
    ) -> Result<Availability, EngineError> {
        let span = booking_span(start_time, duration)?;
        let rs = self.resource_or_not_found(resource_id)?;
        let guard = rs.read().await;
        Ok(
            match availability::find_conflict(&guard, date, &span, exclude, policy) {
                Some(existing) => Availability::taken(existing),
                None => Availability::free(),
            },
        )
    }

    pub async fn free_slots(
        &self,
        resource_id: &str,
        date: NaiveDate,
        min_duration: Option<Minute>,
        policy: ReRentPolicy,
    ) -> Result<Vec<Span>, EngineError> {
        let rs = self.resource_or_not_found(resource_id)?;
        let guard = rs.read().await;
        let mut free = availability::free_slots(&guard, date, policy);
        if let Some(min) = min_duration {
            free.retain(|span| span.duration() >= min);
        }
        Ok(free)
    }

    /// Staff see all bookings; users only their own.
    pub async fn list_bookings(&self, actor: &Actor, filter: &BookingFilter) -> Result<Vec<Booking>, EngineError> {
        let resources: Vec<SharedResourceState> = match &filter.resource_id {
            Some(id) => vec![self.resource_or_not_found(id)?],
            None => self.resources.iter().map(|e| e.value().clone()).collect(),
        };
        let mut out = Vec::new();
        for rs in resources {
            let guard = rs.read().await;
            let candidates = match filter.date {
                Some(date) => guard.on_day(date),
                None => &guard.bookings[..],
            };
            out.extend(
                candidates
                    .iter()
                    .filter(|b| actor.is_privileged() || b.user_id == actor.id)
                    .filter(|b| filter.matches(b))
                    .cloned(),
            );
        }
        out.sort_by(|a, b| {
            (a.date, a.span.start, &a.resource_id).cmp(&(b.date, b.span.start, &b.resource_id))
        });
        Ok(out)
    }

    pub async fn get_booking(&self, actor: &Actor, id: Ulid) -> Result<Booking, EngineError> {
        let not_found = || EngineError::NotFound(format!("booking {id}"));
        let resource_id = self.resource_for_booking(&id).ok_or_else(not_found)?;
        let rs = self.resource_or_not_found(&resource_id)?;
        let guard = rs.read().await;
        let booking = guard.booking(id).cloned().ok_or_else(not_found)?;
        if !actor.may_act_for(booking.user_id) {
            return Err(EngineError::Forbidden("not the owner of this booking"));
        }
        Ok(booking)
    }

    pub async fn list_resources(&self) -> Vec<Resource> {
        let resources: Vec<SharedResourceState> =
            self.resources.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::with_capacity(resources.len());
        for rs in resources {
            out.push(rs.read().await.resource.clone());
        }
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    pub async fn resource_info(&self, id: &str) -> Result<Resource, EngineError> {
        let rs = self.resource_or_not_found(id)?;
        let guard = rs.read().await;
        Ok(guard.resource.clone())
    }

    /// Staff see every account; users only themselves.
    pub async fn list_users(&self, actor: &Actor) -> Vec<User> {
        let users: Vec<SharedUser> = if actor.is_privileged() {
            self.users.iter().map(|e| e.value().clone()).collect()
        } else {
            self.get_user(&actor.id).into_iter().collect()
        };
        let mut out = Vec::with_capacity(users.len());
        for user in users {
            out.push(user.lock().await.clone());
        }
        out.sort_by_key(|u| u.id);
        out
    }

    pub async fn user_info(&self, actor: &Actor, id: Ulid) -> Result<User, EngineError> {
        if !actor.may_act_for(id) {
            return Err(EngineError::Forbidden("not allowed to view this account"));
        }
        let user = self.user_handle(&id)?;
        let guard = user.lock().await;
        Ok(guard.clone())
    }

    /// Staff only. Newest first.
    pub fn list_timeline(&self, actor: &Actor, filter: &TimelineFilter) -> Result<Vec<TimelineEvent>, EngineError> {
        if !actor.is_privileged() {
            return Err(EngineError::Forbidden("only staff may read the timeline"));
        }
        let limit = match filter.limit {
            0 => DEFAULT_TIMELINE_LIMIT,
            n => n.min(MAX_TIMELINE_LIMIT),
        };
        Ok(self.timeline.query(&TimelineFilter {
            limit,
            ..filter.clone()
        }))
    }
}

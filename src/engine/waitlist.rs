use chrono::NaiveDate;
use tracing::info;
use ulid::Ulid;

use crate::audit::TimelineEvent;
use crate::limits::*;
use crate::model::*;
use crate::notify::Notification;

use super::conflict::window_span;
use super::{now_ms, Engine, EngineError};

impl Engine {
    pub async fn join_waitlist(
        &self,
        actor: &Actor,
        id: Ulid,
        resource_id: &str,
        date: NaiveDate,
        start: Minute,
        end: Minute,
    ) -> Result<WaitlistEntry, EngineError> {
        if self.get_resource(resource_id).is_none() {
            return Err(EngineError::NotFound(format!("resource {resource_id}")));
        }
        let span = window_span(start, end)?;
        let _commit = self.commit_gate.read().await;
        if self.waitlist.contains_key(&id) {
            return Err(EngineError::AlreadyExists(format!("waitlist entry {id}")));
        }
        let active = self
            .waitlist
            .iter()
            .filter(|e| e.user_id == actor.id && e.status == WaitlistStatus::Active)
            .count();
        if active >= MAX_ACTIVE_WAITLIST_PER_USER {
            return Err(EngineError::LimitExceeded("too many active waitlist entries"));
        }

        let entry = WaitlistEntry {
            id,
            user_id: actor.id,
            resource_id: resource_id.to_string(),
            date,
            span,
            status: WaitlistStatus::Active,
            created_at: now_ms(),
        };
        self.wal_append(&Event::WaitlistJoined { entry: entry.clone() })
            .await?;
        self.waitlist.insert(id, entry.clone());
        self.audit.log_event(TimelineEvent::new(
            actor,
            id.to_string(),
            "waitlist",
            "waitlist_joined",
            format!("waiting for {resource_id} on {date} {span}"),
        ));
        Ok(entry)
    }

    /// Marks the entry cancelled. Leaving twice is a no-op.
    pub async fn leave_waitlist(&self, actor: &Actor, id: Ulid) -> Result<WaitlistEntry, EngineError> {
        let _commit = self.commit_gate.read().await;
        let entry = self
            .waitlist
            .get(&id)
            .map(|e| e.value().clone())
            .ok_or_else(|| EngineError::NotFound(format!("waitlist entry {id}")))?;
        if !actor.may_act_for(entry.user_id) {
            return Err(EngineError::Forbidden("not the owner of this waitlist entry"));
        }
        if entry.status != WaitlistStatus::Active {
            return Ok(entry);
        }
        self.set_waitlist_status(id, WaitlistStatus::Cancelled).await
    }

    async fn set_waitlist_status(&self, id: Ulid, status: WaitlistStatus) -> Result<WaitlistEntry, EngineError> {
        self.wal_append(&Event::WaitlistStatusChanged { id, status })
            .await?;
        let mut entry = self
            .waitlist
            .get_mut(&id)
            .ok_or_else(|| EngineError::NotFound(format!("waitlist entry {id}")))?;
        entry.status = status;
        Ok(entry.clone())
    }

    /// The payer's own active entries overlapping a new booking are fulfilled by it.
    pub(super) async fn fulfil_waitlist(&self, booking: &Booking) {
        let matched: Vec<Ulid> = self
            .waitlist
            .iter()
            .filter(|e| {
                e.status == WaitlistStatus::Active
                    && e.user_id == booking.user_id
                    && e.resource_id == booking.resource_id
                    && e.date == booking.date
                    && e.span.overlaps(&booking.span)
            })
            .map(|e| e.id)
            .collect();
        if matched.is_empty() {
            return;
        }
        let _commit = self.commit_gate.read().await;
        for id in matched {
            if let Err(e) = self.set_waitlist_status(id, WaitlistStatus::Fulfilled).await {
                tracing::warn!(entry = %id, "could not mark waitlist entry fulfilled: {e}");
            }
        }
    }

    /// Staff see every entry; users see their own.
    pub fn list_waitlist(&self, actor: &Actor) -> Vec<WaitlistEntry> {
        let mut entries: Vec<WaitlistEntry> = self
            .waitlist
            .iter()
            .filter(|e| actor.is_privileged() || e.user_id == actor.id)
            .map(|e| e.value().clone())
            .collect();
        entries.sort_by_key(|e| (e.date, e.span.start, e.id));
        entries
    }

    /// Tell active entries overlapping a freed slot about it. Returns who was told.
    pub(super) fn announce_freed_slot(&self, booking: &Booking) -> Vec<Ulid> {
        let mut waiting: Vec<(Ulid, Ulid)> = self
            .waitlist
            .iter()
            .filter(|e| {
                e.status == WaitlistStatus::Active
                    && e.resource_id == booking.resource_id
                    && e.date == booking.date
                    && e.span.overlaps(&booking.span)
            })
            .map(|e| (e.id, e.user_id))
            .collect();
        if waiting.is_empty() {
            return Vec::new();
        }
        waiting.sort();
        for (entry, user) in &waiting {
            info!(entry = %entry, user = %user, "slot {} {} freed on {}", booking.date, booking.span, booking.resource_id);
        }
        let ids: Vec<Ulid> = waiting.into_iter().map(|(entry, _)| entry).collect();
        self.notify.send(
            &booking.resource_id,
            Notification::SlotFreed {
                resource_id: booking.resource_id.clone(),
                date: booking.date,
                span: booking.span,
                waitlist: ids.clone(),
            },
        );
        ids
    }
}

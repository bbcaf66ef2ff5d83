mod accounts;
mod availability;
mod catalog;
mod conflict;
mod error;
mod lifecycle;
mod queries;
mod settlement;
#[cfg(test)]
mod tests;
mod waitlist;

pub use availability::{
    describe_conflict, find_conflict, free_slots, merge_overlapping, subtract_intervals,
    Availability, ConflictInfo, ReRentPolicy,
};
pub use catalog::ResourcePatch;
pub use error::EngineError;
pub use lifecycle::{CancelOutcome, NewBooking};
pub use queries::BookingFilter;
pub use settlement::{
    charge_balance, charge_subscription_hours, ensure_covered, refund, refund_balance,
    refund_subscription_hours, settle, HoursRefund,
};

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{FixedOffset, Offset, Utc};
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tracing::warn;
use ulid::Ulid;

use crate::audit::{AuditSink, Timeline};
use crate::calendar::{CalendarSync, DisabledCalendar};
use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

pub type SharedResourceState = Arc<RwLock<ResourceState>>;
pub type SharedUser = Arc<Mutex<User>>;

pub fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

/// Operational knobs that do not change the data model.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Local wall-clock offset of the venue. Booking dates and times are local.
    pub utc_offset: FixedOffset,
    /// Cancellations closer than this to the start are flagged as late.
    pub late_cancel_hours: i64,
    /// How long a freeze lasts when a subscription is frozen.
    pub freeze_days: i64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            utc_offset: Utc.fix(),
            late_cancel_hours: 24,
            freeze_days: 14,
        }
    }
}

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

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Owns the WAL. Every drained batch of appends shares one fsync.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let WalCommand::Append { event, response } = cmd else {
            handle_non_append(&mut wal, cmd);
            continue;
        };
        let mut batch = vec![(event, response)];
        let mut deferred = None;
        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                Ok(other) => {
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }
        commit_batch(&mut wal, &mut batch);
        if let Some(cmd) = deferred {
            handle_non_append(&mut wal, cmd);
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<PendingAppend>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(started.elapsed().as_secs_f64());
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[PendingAppend]) -> io::Result<()> {
    let append_err = batch
        .iter()
        .find_map(|(event, _)| wal.append_buffered(event).err());
    // Flush even after a failed append so half-written bytes do not leak into the next batch.
    let flush_err = wal.flush_sync().err();
    match append_err.or(flush_err) {
        Some(e) => Err(e),
        None => Ok(()),
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
        WalCommand::Append { event, response } => {
            let mut batch = vec![(event, response)];
            commit_batch(wal, &mut batch);
        }
    }
}

// ── Engine ───────────────────────────────────────────────

pub struct Engine {
    pub(super) resources: DashMap<String, SharedResourceState>,
    pub(super) users: DashMap<Ulid, SharedUser>,
    /// Lowercased email → user id.
    pub(super) emails: DashMap<String, Ulid>,
    /// Booking id → resource id.
    pub(super) booking_index: DashMap<Ulid, String>,
    pub(super) waitlist: DashMap<Ulid, WaitlistEntry>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    /// Mutations hold it shared; compaction holds it exclusively so its snapshot
    /// and the file swap see no interleaved commit.
    pub(super) commit_gate: RwLock<()>,
    /// Serializes role changes so the last-owner check cannot race.
    pub(super) role_changes: Mutex<()>,
    pub notify: Arc<NotifyHub>,
    pub(super) calendar: Arc<dyn CalendarSync>,
    pub(super) audit: Arc<dyn AuditSink>,
    pub(super) timeline: Arc<Timeline>,
    pub(super) settings: Settings,
}

/// Resource-side effect of an event. Caller holds the resource write lock.
fn apply_to_resource(rs: &mut ResourceState, event: &Event, booking_index: &DashMap<Ulid, String>) {
    match event {
        Event::ResourceUpdated { resource } => {
            rs.resource = resource.clone();
        }
        Event::BookingCreated { booking, .. } | Event::BookingRestored { booking } => {
            booking_index.insert(booking.id, booking.resource_id.clone());
            rs.insert_booking(booking.clone());
        }
        Event::BookingCancelled {
            id,
            reason,
            cancelled_by,
            ..
        } => {
            if let Some(b) = rs.booking_mut(*id) {
                b.status = BookingStatus::Cancelled;
                b.cancellation_reason = Some(reason.clone());
                b.cancelled_by = Some(cancelled_by.clone());
            }
        }
        Event::BookingReRentListed { id, listed, .. } => {
            if let Some(b) = rs.booking_mut(*id) {
                b.re_rent_listed = *listed;
            }
        }
        Event::CalendarLinked { id, event_id, .. } => {
            if let Some(b) = rs.booking_mut(*id) {
                b.calendar_event_id = Some(event_id.clone());
            }
        }
        Event::CalendarUnlinked { id, .. } => {
            if let Some(b) = rs.booking_mut(*id) {
                b.calendar_event_id = None;
            }
        }
        _ => {}
    }
}

/// Payer-side effect of an event. Caller holds the user lock.
fn apply_to_user(user: &mut User, event: &Event) {
    match event {
        Event::RoleChanged { role, .. } => user.role = *role,
        Event::BalanceAdjusted { delta, .. } => user.balance = user.balance + *delta,
        Event::CreditLimitSet { limit, .. } => user.credit_limit = *limit,
        Event::SubscriptionAssigned { subscription, .. } => {
            user.subscription = Some(subscription.clone());
        }
        Event::SubscriptionFrozen {
            frozen,
            frozen_until,
            ..
        } => {
            if let Some(sub) = user.subscription.as_mut() {
                sub.frozen = *frozen;
                sub.frozen_until = *frozen_until;
            }
        }
        Event::DiscountSet { change, .. } => {
            user.personal_discount_percent = change.new_percent;
            user.discount_history.insert(0, change.clone());
            user.discount_history.truncate(crate::limits::MAX_DISCOUNT_HISTORY);
        }
        Event::BookingCreated { booking, charge } => {
            // Validated before the record was written; a failure here means the log
            // disagrees with itself, which we report but do not stop on.
            if let Err(e) = settlement::settle(user, *charge) {
                warn!(booking = %booking.id, "replayed charge did not settle: {e}");
            }
        }
        Event::BookingCancelled { refund, .. } => settlement::refund(user, *refund),
        _ => {}
    }
}

fn event_resource_id(event: &Event) -> Option<&str> {
    match event {
        Event::ResourceUpdated { resource } => Some(&resource.id),
        Event::BookingCreated { booking, .. } | Event::BookingRestored { booking } => {
            Some(&booking.resource_id)
        }
        Event::BookingCancelled { resource_id, .. }
        | Event::BookingReRentListed { resource_id, .. }
        | Event::CalendarLinked { resource_id, .. }
        | Event::CalendarUnlinked { resource_id, .. } => Some(resource_id),
        _ => None,
    }
}

fn event_user_id(event: &Event) -> Option<Ulid> {
    match event {
        Event::RoleChanged { user_id, .. }
        | Event::BalanceAdjusted { user_id, .. }
        | Event::CreditLimitSet { user_id, .. }
        | Event::SubscriptionAssigned { user_id, .. }
        | Event::SubscriptionFrozen { user_id, .. }
        | Event::DiscountSet { user_id, .. }
        | Event::BookingCancelled { user_id, .. } => Some(*user_id),
        Event::BookingCreated { booking, .. } => Some(booking.user_id),
        _ => None,
    }
}

impl Engine {
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let timeline = Arc::new(Timeline::in_memory());
        let engine = Self {
            resources: DashMap::new(),
            users: DashMap::new(),
            emails: DashMap::new(),
            booking_index: DashMap::new(),
            waitlist: DashMap::new(),
            wal_tx,
            commit_gate: RwLock::new(()),
            role_changes: Mutex::new(()),
            notify,
            calendar: Arc::new(DisabledCalendar),
            audit: timeline.clone(),
            timeline,
            settings: Settings::default(),
        };

        for event in &events {
            engine.replay_event(event);
        }
        tracing::info!(
            events = events.len(),
            resources = engine.resources.len(),
            users = engine.users.len(),
            "replayed WAL {}",
            wal_path.display()
        );
        Ok(engine)
    }

    pub fn with_calendar(mut self, calendar: Arc<dyn CalendarSync>) -> Self {
        self.calendar = calendar;
        self
    }

    /// Timeline used both for recording and for `list_timeline`.
    pub fn with_timeline(mut self, timeline: Arc<Timeline>) -> Self {
        self.audit = timeline.clone();
        self.timeline = timeline;
        self
    }

    pub fn with_settings(mut self, settings: Settings) -> Self {
        self.settings = settings;
        self
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Replay runs before the engine is shared, so every lock is uncontended.
    fn replay_event(&self, event: &Event) {
        match event {
            Event::ResourceCreated { resource } => {
                self.resources.insert(
                    resource.id.clone(),
                    Arc::new(RwLock::new(ResourceState::new(resource.clone()))),
                );
            }
            Event::UserRegistered { user } => {
                self.emails.insert(user.email.to_lowercase(), user.id);
                self.users.insert(user.id, Arc::new(Mutex::new(user.clone())));
            }
            Event::WaitlistJoined { entry } => {
                self.waitlist.insert(entry.id, entry.clone());
            }
            Event::WaitlistStatusChanged { id, status } => {
                if let Some(mut entry) = self.waitlist.get_mut(id) {
                    entry.status = *status;
                }
            }
            other => {
                if let Some(resource_id) = event_resource_id(other)
                    && let Some(rs) = self.get_resource(resource_id)
                {
                    let mut guard = rs.try_write().expect("replay: uncontended write");
                    apply_to_resource(&mut guard, other, &self.booking_index);
                }
                if let Some(user_id) = event_user_id(other)
                    && let Some(user) = self.get_user(&user_id)
                {
                    let mut guard = user.try_lock().expect("replay: uncontended lock");
                    apply_to_user(&mut guard, other);
                }
            }
        }
    }

    /// Write event to WAL via the background group-commit writer.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub fn get_resource(&self, id: &str) -> Option<SharedResourceState> {
        self.resources.get(id).map(|e| e.value().clone())
    }

    pub fn get_user(&self, id: &Ulid) -> Option<SharedUser> {
        self.users.get(id).map(|e| e.value().clone())
    }

    pub fn user_id_by_email(&self, email: &str) -> Option<Ulid> {
        self.emails.get(&email.to_lowercase()).map(|e| *e.value())
    }

    pub fn resource_for_booking(&self, booking_id: &Ulid) -> Option<String> {
        self.booking_index.get(booking_id).map(|e| e.value().clone())
    }

    /// Look up a user by ULID, then by email.
    pub fn resolve_user(&self, handle: &str) -> Option<Ulid> {
        let handle = handle.trim();
        if let Ok(id) = Ulid::from_string(handle)
            && self.users.contains_key(&id)
        {
            return Some(id);
        }
        self.user_id_by_email(handle)
    }

    /// Resolve a session login (email or id) to the acting user.
    pub async fn resolve_actor(&self, login: &str) -> Result<Actor, EngineError> {
        let id = self
            .resolve_user(login)
            .ok_or_else(|| EngineError::NotFound(format!("user {login}")))?;
        let user = self
            .get_user(&id)
            .ok_or_else(|| EngineError::NotFound(format!("user {login}")))?;
        let guard = user.lock().await;
        Ok(Actor::from(&*guard))
    }

    /// WAL-append, then apply to the resource and optionally the payer, then notify.
    pub(super) async fn persist_and_apply(
        &self,
        rs: &mut ResourceState,
        payer: Option<&mut User>,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_resource(rs, event, &self.booking_index);
        if let Some(payer) = payer {
            apply_to_user(payer, event);
        }
        self.notify.send_event(&rs.resource.id, event);
        Ok(())
    }

    pub(super) async fn persist_user_event(
        &self,
        user: &mut User,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_user(user, event);
        Ok(())
    }

    /// Rewrite the WAL as the minimal event set that rebuilds current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _exclusive = self.commit_gate.write().await;
        let mut events = Vec::with_capacity(self.users.len() + self.resources.len());

        let users: Vec<SharedUser> = self.users.iter().map(|e| e.value().clone()).collect();
        for user in users {
            let user = user.lock().await.clone();
            events.push(Event::UserRegistered { user });
        }

        let resources: Vec<SharedResourceState> =
            self.resources.iter().map(|e| e.value().clone()).collect();
        for rs in resources {
            let guard = rs.read().await;
            events.push(Event::ResourceCreated {
                resource: guard.resource.clone(),
            });
            events.extend(guard.bookings.iter().map(|b| Event::BookingRestored {
                booking: b.clone(),
            }));
        }

        let mut entries: Vec<WaitlistEntry> =
            self.waitlist.iter().map(|e| e.value().clone()).collect();
        entries.sort_by_key(|e| e.id);
        events.extend(entries.into_iter().map(|entry| Event::WaitlistJoined { entry }));

        let count = events.len();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        tracing::info!(events = count, "compacted WAL");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

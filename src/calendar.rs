//! External calendar mirror. Best-effort: callers log failures and carry on.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveTime, TimeDelta};
use dashmap::DashMap;
use reqwest::{Client, StatusCode};
use serde_json::json;

use crate::model::{Booking, Minute};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    Request(String),
    Api { status: u16, message: String },
    Rejected(String),
}

impl std::fmt::Display for SyncError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncError::Request(e) => write!(f, "calendar request failed: {e}"),
            SyncError::Api { status, message } => write!(f, "calendar API error {status}: {message}"),
            SyncError::Rejected(msg) => write!(f, "calendar rejected event: {msg}"),
        }
    }
}

impl std::error::Error for SyncError {}

#[async_trait]
pub trait CalendarSync: Send + Sync {
    /// Mirror a confirmed booking. `Ok(None)` means no calendar is mapped for the resource.
    async fn create_event(&self, booking: &Booking) -> Result<Option<String>, SyncError>;

    async fn delete_event(&self, event_id: &str, resource_id: &str) -> Result<(), SyncError>;

    fn is_connected(&self) -> bool;
}

/// Used when no calendar credentials are configured.
#[derive(Debug, Default)]
pub struct DisabledCalendar;

#[async_trait]
impl CalendarSync for DisabledCalendar {
    async fn create_event(&self, _booking: &Booking) -> Result<Option<String>, SyncError> {
        Ok(None)
    }

    async fn delete_event(&self, _event_id: &str, _resource_id: &str) -> Result<(), SyncError> {
        Ok(())
    }

    fn is_connected(&self) -> bool {
        false
    }
}

// ── Google Calendar (REST v3) ────────────────────────────────────

const GCAL_API_URL: &str = "https://www.googleapis.com/calendar/v3";

/// Google Calendar client. Authenticates with a pre-issued bearer token;
/// each resource maps to one calendar id.
#[derive(Clone)]
pub struct GoogleCalendar {
    client: Client,
    token: String,
    api_url: String,
    time_zone: String,
    calendars: HashMap<String, String>,
}

impl GoogleCalendar {
    pub fn new(token: String, calendars: HashMap<String, String>, time_zone: String) -> Self {
        Self {
            client: Client::new(),
            token,
            api_url: GCAL_API_URL.to_string(),
            time_zone,
            calendars,
        }
    }

    pub fn with_api_url(mut self, api_url: impl Into<String>) -> Self {
        self.api_url = api_url.into();
        self
    }

    pub fn calendar_id(&self, resource_id: &str) -> Option<&str> {
        self.calendars.get(resource_id).map(String::as_str)
    }

    /// Request body for a booking. Times are local wall-clock in `time_zone`.
    pub fn event_body(&self, booking: &Booking) -> serde_json::Value {
        json!({
            "summary": format!("Booking: {} ({})", booking.format, booking.payment_method),
            "description": format!("Id: {}\nUser: {}", booking.id, booking.user_id),
            "start": {
                "dateTime": local_date_time(booking.date, booking.span.start),
                "timeZone": self.time_zone,
            },
            "end": {
                "dateTime": local_date_time(booking.date, booking.span.end),
                "timeZone": self.time_zone,
            },
        })
    }
}

/// `minute` past midnight of `date`. An end of `24:00` rolls over to the next day.
fn local_date_time(date: NaiveDate, minute: Minute) -> String {
    let at = date.and_time(NaiveTime::MIN) + TimeDelta::minutes(i64::from(minute));
    at.format("%Y-%m-%dT%H:%M:%S").to_string()
}

#[async_trait]
impl CalendarSync for GoogleCalendar {
    async fn create_event(&self, booking: &Booking) -> Result<Option<String>, SyncError> {
        let Some(calendar_id) = self.calendar_id(&booking.resource_id) else {
            tracing::warn!("no calendar id mapped for resource {}", booking.resource_id);
            return Ok(None);
        };
        let response = self
            .client
            .post(format!("{}/calendars/{calendar_id}/events", self.api_url))
            .bearer_auth(&self.token)
            .json(&self.event_body(booking))
            .send()
            .await
            .map_err(|e| SyncError::Request(e.to_string()))?;

        match response.status() {
            StatusCode::OK => {
                let body: serde_json::Value = response
                    .json()
                    .await
                    .map_err(|e| SyncError::Request(e.to_string()))?;
                body.get("id")
                    .and_then(|v| v.as_str())
                    .map(|id| Some(id.to_string()))
                    .ok_or_else(|| SyncError::Rejected("response without event id".into()))
            }
            status => {
                let message = response.text().await.unwrap_or_default();
                Err(SyncError::Api {
                    status: status.as_u16(),
                    message,
                })
            }
        }
    }

    async fn delete_event(&self, event_id: &str, resource_id: &str) -> Result<(), SyncError> {
        let Some(calendar_id) = self.calendar_id(resource_id) else {
            return Ok(());
        };
        let response = self
            .client
            .delete(format!("{}/calendars/{calendar_id}/events/{event_id}", self.api_url))
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| SyncError::Request(e.to_string()))?;

        match response.status() {
            // Already gone counts as deleted.
            s if s.is_success() || s == StatusCode::GONE || s == StatusCode::NOT_FOUND => {
                tracing::info!("deleted calendar event {event_id}");
                Ok(())
            }
            status => {
                let message = response.text().await.unwrap_or_default();
                Err(SyncError::Api {
                    status: status.as_u16(),
                    message,
                })
            }
        }
    }

    fn is_connected(&self) -> bool {
        !self.token.is_empty()
    }
}

// ── In-memory calendar ───────────────────────────────────────────

/// Keeps events in a map. Failure injection makes it usable as a test double.
#[derive(Debug, Default)]
pub struct MemoryCalendar {
    events: DashMap<String, (String, String)>,
    next_id: AtomicU64,
    fail_create: AtomicBool,
    fail_delete: AtomicBool,
}

impl MemoryCalendar {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_create(&self, fail: bool) {
        self.fail_create.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_delete(&self, fail: bool) {
        self.fail_delete.store(fail, Ordering::SeqCst);
    }

    pub fn contains(&self, event_id: &str) -> bool {
        self.events.contains_key(event_id)
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

#[async_trait]
impl CalendarSync for MemoryCalendar {
    async fn create_event(&self, booking: &Booking) -> Result<Option<String>, SyncError> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(SyncError::Request("injected create failure".into()));
        }
        let n = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let event_id = format!("evt-{n}");
        self.events.insert(
            event_id.clone(),
            (booking.resource_id.clone(), booking.id.to_string()),
        );
        Ok(Some(event_id))
    }

    async fn delete_event(&self, event_id: &str, _resource_id: &str) -> Result<(), SyncError> {
        if self.fail_delete.load(Ordering::SeqCst) {
            return Err(SyncError::Request("injected delete failure".into()));
        }
        self.events.remove(event_id);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        true
    }
}

/// Parse `resource=calendar_id,resource2=calendar_id2`.
pub fn parse_calendar_map(raw: &str) -> HashMap<String, String> {
    raw.split(',')
        .filter_map(|pair| {
            let (resource, calendar) = pair.split_once('=')?;
            let (resource, calendar) = (resource.trim(), calendar.trim());
            (!resource.is_empty() && !calendar.is_empty())
                .then(|| (resource.to_string(), calendar.to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;
    use chrono::NaiveDate;
    use ulid::Ulid;

    fn booking() -> Booking {
        Booking {
            id: Ulid::new(),
            resource_id: "unbox_one_room_1".into(),
            user_id: Ulid::new(),
            date: NaiveDate::from_ymd_opt(2025, 6, 1).unwrap(),
            span: Span::new(600, 690),
            status: BookingStatus::Confirmed,
            payment_method: PaymentMethod::Balance,
            final_price: Money(3000),
            hours_deducted: None,
            format: BookingFormat::Individual,
            cancellation_reason: None,
            cancelled_by: None,
            re_rent_listed: false,
            calendar_event_id: None,
            created_at: 0,
        }
    }

    #[test]
    fn calendar_map_parsing() {
        let map = parse_calendar_map("unbox_one_room_1=cal1@group, capsule_1 = cal2 ,broken,=x");
        assert_eq!(map.len(), 2);
        assert_eq!(map["unbox_one_room_1"], "cal1@group");
        assert_eq!(map["capsule_1"], "cal2");
    }

    #[test]
    fn google_event_body_uses_local_times() {
        let mut calendars = HashMap::new();
        calendars.insert("unbox_one_room_1".to_string(), "cal1".to_string());
        let gcal = GoogleCalendar::new("token".into(), calendars, "Asia/Tbilisi".into());
        let body = gcal.event_body(&booking());
        assert_eq!(body["start"]["dateTime"], "2025-06-01T10:00:00");
        assert_eq!(body["end"]["dateTime"], "2025-06-01T11:30:00");
        assert_eq!(body["start"]["timeZone"], "Asia/Tbilisi");
        assert_eq!(gcal.calendar_id("unbox_one_room_1"), Some("cal1"));
        assert_eq!(gcal.calendar_id("other"), None);
    }

    #[test]
    fn google_event_ending_at_midnight_rolls_to_next_day() {
        let gcal = GoogleCalendar::new("token".into(), HashMap::new(), "UTC".into());
        let late = Booking {
            span: Span::new(22 * 60, MINUTES_PER_DAY),
            ..booking()
        };
        let body = gcal.event_body(&late);
        assert_eq!(body["start"]["dateTime"], "2025-06-01T22:00:00");
        assert_eq!(body["end"]["dateTime"], "2025-06-02T00:00:00");
    }

    #[tokio::test]
    async fn google_unmapped_resource_is_skipped() {
        let gcal = GoogleCalendar::new("token".into(), HashMap::new(), "UTC".into());
        assert_eq!(gcal.create_event(&booking()).await, Ok(None));
        assert_eq!(gcal.delete_event("evt", "unbox_one_room_1").await, Ok(()));
    }

    #[tokio::test]
    async fn memory_calendar_roundtrip_and_failures() {
        let cal = MemoryCalendar::new();
        let id = cal.create_event(&booking()).await.unwrap().unwrap();
        assert!(cal.contains(&id));
        cal.delete_event(&id, "unbox_one_room_1").await.unwrap();
        assert!(cal.is_empty());

        cal.set_fail_create(true);
        assert!(cal.create_event(&booking()).await.is_err());
        cal.set_fail_delete(true);
        assert!(cal.delete_event("x", "r").await.is_err());
    }

    #[tokio::test]
    async fn disabled_calendar_is_noop() {
        let cal = DisabledCalendar;
        assert!(!cal.is_connected());
        assert_eq!(cal.create_event(&booking()).await, Ok(None));
    }
}

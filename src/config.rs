use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use chrono::FixedOffset;

use crate::calendar::{parse_calendar_map, CalendarSync, DisabledCalendar, GoogleCalendar};
use crate::engine::Settings;

/// Server configuration, read once from `SLOTBOOK_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub metrics_port: Option<u16>,
    pub utc_offset_minutes: i32,
    pub late_cancel_hours: i64,
    pub freeze_days: i64,
    pub owner_email: Option<String>,
    pub gcal_token: Option<String>,
    pub gcal_calendars: String,
    pub gcal_timezone: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 5433,
            bind: "0.0.0.0".into(),
            data_dir: PathBuf::from("./data"),
            password: "slotbook".into(),
            max_connections: 256,
            compact_threshold: 1000,
            tls_cert: None,
            tls_key: None,
            metrics_port: None,
            utc_offset_minutes: 0,
            late_cancel_hours: 24,
            freeze_days: 14,
            owner_email: None,
            gcal_token: None,
            gcal_calendars: String::new(),
            gcal_timezone: "Asia/Tbilisi".into(),
        }
    }
}

#[derive(Debug)]
pub struct ConfigError {
    pub var: &'static str,
    pub value: String,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid value for {}: {:?}", self.var, self.value)
    }
}

impl std::error::Error for ConfigError {}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Unset or empty keys keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let defaults = Config::default();
        let max_connections: usize = parse_or(&get, "SLOTBOOK_MAX_CONNECTIONS", defaults.max_connections)?;
        Ok(Self {
            port: parse_or(&get, "SLOTBOOK_PORT", defaults.port)?,
            bind: get("SLOTBOOK_BIND").unwrap_or(defaults.bind),
            data_dir: get("SLOTBOOK_DATA_DIR").map(PathBuf::from).unwrap_or(defaults.data_dir),
            password: get("SLOTBOOK_PASSWORD").unwrap_or(defaults.password),
            max_connections: max_connections.clamp(1, crate::limits::MAX_CONNECTIONS),
            compact_threshold: parse_or(&get, "SLOTBOOK_COMPACT_THRESHOLD", defaults.compact_threshold)?,
            tls_cert: get("SLOTBOOK_TLS_CERT"),
            tls_key: get("SLOTBOOK_TLS_KEY"),
            metrics_port: parse_opt(&get, "SLOTBOOK_METRICS_PORT")?,
            utc_offset_minutes: parse_or(&get, "SLOTBOOK_UTC_OFFSET_MINUTES", defaults.utc_offset_minutes)?,
            late_cancel_hours: parse_or(&get, "SLOTBOOK_LATE_CANCEL_HOURS", defaults.late_cancel_hours)?,
            freeze_days: parse_or(&get, "SLOTBOOK_FREEZE_DAYS", defaults.freeze_days)?,
            owner_email: get("SLOTBOOK_OWNER_EMAIL"),
            gcal_token: get("SLOTBOOK_GCAL_TOKEN"),
            gcal_calendars: get("SLOTBOOK_GCAL_CALENDARS").unwrap_or(defaults.gcal_calendars),
            gcal_timezone: get("SLOTBOOK_GCAL_TIMEZONE").unwrap_or(defaults.gcal_timezone),
        })
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("slotbook.wal")
    }

    pub fn timeline_path(&self) -> PathBuf {
        self.data_dir.join("timeline.jsonl")
    }

    pub fn settings(&self) -> Result<Settings, ConfigError> {
        let utc_offset = FixedOffset::east_opt(self.utc_offset_minutes * 60).ok_or_else(|| ConfigError {
            var: "SLOTBOOK_UTC_OFFSET_MINUTES",
            value: self.utc_offset_minutes.to_string(),
        })?;
        Ok(Settings {
            utc_offset,
            late_cancel_hours: self.late_cancel_hours,
            freeze_days: self.freeze_days,
        })
    }

    /// Google Calendar when a token is configured, otherwise a no-op mirror.
    pub fn calendar(&self) -> Arc<dyn CalendarSync> {
        match &self.gcal_token {
            Some(token) => Arc::new(GoogleCalendar::new(
                token.clone(),
                parse_calendar_map(&self.gcal_calendars),
                self.gcal_timezone.clone(),
            )),
            None => Arc::new(DisabledCalendar),
        }
    }
}

fn parse_opt<T: FromStr>(
    get: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<T>, ConfigError> {
    get(var)
        .map(|value| value.trim().parse().map_err(|_| ConfigError { var, value }))
        .transpose()
}

fn parse_or<T: FromStr>(
    get: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    Ok(parse_opt(get, var)?.unwrap_or(default))
}

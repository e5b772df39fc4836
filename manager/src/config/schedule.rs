//! Validated scheduling policy

use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

use chrono::{NaiveTime, Timelike, Weekday};
use serde::{Deserialize, Serialize};

use crate::config::schema::SchedulerSettings;
use crate::errors::ManagerError;

/// Pipeline action. The derived ordering is the execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Check,
    Build,
    Deploy,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Check => "check",
            Action::Build => "build",
            Action::Deploy => "deploy",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Action {
    type Err = ManagerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "check" => Ok(Action::Check),
            "build" => Ok(Action::Build),
            "deploy" => Ok(Action::Deploy),
            other => Err(ManagerError::ConfigError(format!("Unknown action: {}", other))),
        }
    }
}

/// Allowed time-of-day window, both ends inclusive at minute granularity.
///
/// Windows never wrap past midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl TimeWindow {
    pub fn parse(raw: &str) -> Result<Self, ManagerError> {
        let invalid = || ManagerError::ConfigError(format!("Invalid time window format: {}", raw));

        let (start, end) = raw.trim().split_once('-').ok_or_else(invalid)?;
        let start = parse_hh_mm(start).ok_or_else(invalid)?;
        let end = parse_hh_mm(end).ok_or_else(invalid)?;

        if start > end {
            return Err(ManagerError::ConfigError(format!(
                "Time window {} wraps past midnight, use two days or a narrower window",
                raw
            )));
        }

        Ok(Self { start, end })
    }

    pub fn contains(&self, time: NaiveTime) -> bool {
        let minute = NaiveTime::from_hms_opt(time.hour(), time.minute(), 0).unwrap_or(time);
        self.start <= minute && minute <= self.end
    }
}

impl fmt::Display for TimeWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start.format("%H:%M"), self.end.format("%H:%M"))
    }
}

fn parse_hh_mm(raw: &str) -> Option<NaiveTime> {
    let (h, m) = raw.trim().split_once(':')?;
    if h.len() != 2 || m.len() != 2 {
        return None;
    }
    NaiveTime::from_hms_opt(h.parse().ok()?, m.parse().ok()?, 0)
}

/// Parse `15s`, `5m` or `1h`.
pub fn parse_interval(raw: &str) -> Result<Duration, ManagerError> {
    let invalid = || ManagerError::ConfigError(format!("Invalid interval format: {}", raw));

    let raw = raw.trim();
    let (unit_at, _) = raw.char_indices().last().ok_or_else(invalid)?;
    let (value, unit) = raw.split_at(unit_at);
    let value: u64 = value.parse().map_err(|_| invalid())?;
    if value == 0 {
        return Err(invalid());
    }

    let secs = match unit {
        "s" => value,
        "m" => value.checked_mul(60).ok_or_else(invalid)?,
        "h" => value.checked_mul(3600).ok_or_else(invalid)?,
        _ => return Err(invalid()),
    };
    Ok(Duration::from_secs(secs))
}

pub fn parse_weekday(raw: &str) -> Result<Weekday, ManagerError> {
    match raw.trim().to_lowercase().as_str() {
        "mon" | "monday" => Ok(Weekday::Mon),
        "tue" | "tuesday" => Ok(Weekday::Tue),
        "wed" | "wednesday" => Ok(Weekday::Wed),
        "thu" | "thursday" => Ok(Weekday::Thu),
        "fri" | "friday" => Ok(Weekday::Fri),
        "sat" | "saturday" => Ok(Weekday::Sat),
        "sun" | "sunday" => Ok(Weekday::Sun),
        other => Err(ManagerError::ConfigError(format!("Invalid day: {}", other))),
    }
}

/// Scheduling policy, loaded once at startup
#[derive(Debug, Clone)]
pub struct ScheduleConfig {
    pub enabled: bool,
    pub check_interval: Duration,
    pub time_window: TimeWindow,
    pub days: Vec<Weekday>,
    pub actions: BTreeSet<Action>,
    pub max_retries: u32,
}

impl ScheduleConfig {
    pub fn from_settings(settings: &SchedulerSettings) -> Result<Self, ManagerError> {
        let check_interval = parse_interval(&settings.check_interval)?;
        let time_window = TimeWindow::parse(&settings.time_window)?;

        let mut days = Vec::new();
        for raw in &settings.days {
            let day = parse_weekday(raw)?;
            if !days.contains(&day) {
                days.push(day);
            }
        }
        if days.is_empty() {
            return Err(ManagerError::ConfigError("No valid day configured".to_string()));
        }

        let actions = settings
            .actions
            .iter()
            .map(|a| a.parse::<Action>())
            .collect::<Result<BTreeSet<_>, _>>()?;

        if settings.max_retries == 0 {
            return Err(ManagerError::ConfigError(
                "max_retries must be at least 1".to_string(),
            ));
        }

        Ok(Self {
            enabled: settings.enabled,
            check_interval,
            time_window,
            days,
            actions,
            max_retries: settings.max_retries,
        })
    }

    pub fn has(&self, action: Action) -> bool {
        self.actions.contains(&action)
    }
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        // The defaults of SchedulerSettings always validate
        Self {
            enabled: false,
            check_interval: Duration::from_secs(15),
            time_window: TimeWindow {
                start: NaiveTime::MIN,
                end: NaiveTime::from_hms_opt(23, 59, 0).unwrap_or(NaiveTime::MIN),
            },
            days: vec![
                Weekday::Mon,
                Weekday::Tue,
                Weekday::Wed,
                Weekday::Thu,
                Weekday::Fri,
                Weekday::Sat,
                Weekday::Sun,
            ],
            actions: BTreeSet::new(),
            max_retries: 3,
        }
    }
}

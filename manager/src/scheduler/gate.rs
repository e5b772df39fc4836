//! Day and time-window gating

use chrono::{Datelike, NaiveDateTime, NaiveTime, Weekday};
use serde::Serialize;

use crate::config::schedule::ScheduleConfig;

/// Source of local wall-clock time
pub trait Clock: Send + Sync {
    fn now(&self) -> NaiveDateTime;
}

/// The host's local time
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalClock;

impl Clock for LocalClock {
    fn now(&self) -> NaiveDateTime {
        chrono::Local::now().naive_local()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "gate", rename_all = "snake_case")]
pub enum GateDecision {
    Open,
    WrongDay { day: Weekday },
    OutsideWindow { time: NaiveTime },
}

impl GateDecision {
    pub fn is_open(&self) -> bool {
        *self == GateDecision::Open
    }
}

pub fn evaluate(config: &ScheduleConfig, now: NaiveDateTime) -> GateDecision {
    let day = now.weekday();
    if !config.days.contains(&day) {
        return GateDecision::WrongDay { day };
    }
    if !config.time_window.contains(now.time()) {
        return GateDecision::OutsideWindow { time: now.time() };
    }
    GateDecision::Open
}

//! Calendar admission gate.
//!
//! A request is admitted when its timestamp, shifted into the configured fixed
//! UTC offset, falls on an active weekday within `[start_hour, end_hour)`.
//! A caller presenting the operator bypass token skips the check.

use anyhow::Result;
use chrono::{DateTime, Datelike, FixedOffset, Timelike, Utc, Weekday};

use crate::config::ScheduleConfig;
use crate::error::ScheduleError;

#[derive(Debug, Clone)]
pub struct ScheduleGate {
    enabled: bool,
    start_hour: u32,
    end_hour: u32,
    weekdays: Vec<Weekday>,
    offset: FixedOffset,
    bypass_token: Option<String>,
}

impl ScheduleGate {
    pub fn from_config(config: &ScheduleConfig) -> Result<Self> {
        let offset = FixedOffset::east_opt(config.utc_offset_minutes * 60)
            .ok_or_else(|| anyhow::anyhow!("schedule.utc_offset_minutes out of range"))?;
        let bypass_token = match &config.bypass_token_env {
            Some(var) => std::env::var(var).ok().filter(|t| !t.is_empty()),
            None => None,
        };
        Ok(Self {
            enabled: config.enabled,
            start_hour: config.start_hour,
            end_hour: config.end_hour,
            weekdays: config.parsed_weekdays()?,
            offset,
            bypass_token,
        })
    }

    pub fn with_bypass_token(mut self, token: impl Into<String>) -> Self {
        self.bypass_token = Some(token.into());
        self
    }

    pub fn offset(&self) -> FixedOffset {
        self.offset
    }

    pub fn check(&self, now: DateTime<Utc>, bypass: Option<&str>) -> Result<(), ScheduleError> {
        if !self.enabled {
            return Ok(());
        }
        if let (Some(expected), Some(given)) = (self.bypass_token.as_deref(), bypass) {
            if expected == given {
                tracing::debug!("schedule gate bypassed by operator token");
                return Ok(());
            }
        }

        let local = now.with_timezone(&self.offset);
        let day_ok = self.weekdays.contains(&local.weekday());
        let hour = local.hour();
        let hour_ok = hour >= self.start_hour && hour < self.end_hour;

        if day_ok && hour_ok {
            Ok(())
        } else {
            Err(ScheduleError {
                window: self.describe(),
            })
        }
    }

    /// E.g. `"Mon, Tue, Wed, Thu, Fri 09:00-17:00 (UTC+10:00)"`.
    pub fn describe(&self) -> String {
        let days: Vec<String> = self.weekdays.iter().map(|d| d.to_string()).collect();
        format!(
            "{} {:02}:00-{:02}:00 (UTC{})",
            days.join(", "),
            self.start_hour,
            self.end_hour,
            self.offset
        )
    }
}

//! Trading calendars
//!
//! All engine date arithmetic (window extension, row counts) is expressed in
//! sessions of a [`TradingCalendar`], never in wall-clock days.

use crate::error::{PipelineError, Result};
use crate::types::Date;
use chrono::{Datelike, Duration, NaiveDate, Weekday};

/// Longest run of consecutive non-session days a calendar may contain
const MAX_SESSION_GAP_DAYS: usize = 366;

/// Trading calendar trait
pub trait TradingCalendar: Send + Sync {
    /// Check if a date is a trading session
    fn is_session(&self, date: Date) -> bool;

    /// Ordered sessions between two dates (inclusive)
    fn sessions(&self, start: Date, end: Date) -> Result<Vec<Date>> {
        let mut days = Vec::new();
        let mut current = start;
        while current <= end {
            if self.is_session(current) {
                days.push(current);
            }
            current += Duration::days(1);
        }
        Ok(days)
    }

    /// The `count` sessions strictly before `date`, oldest first
    fn sessions_before(&self, date: Date, count: usize) -> Result<Vec<Date>> {
        let mut days = Vec::with_capacity(count);
        let mut current = date;
        let mut gap = 0;
        while days.len() < count {
            current -= Duration::days(1);
            if self.is_session(current) {
                days.push(current);
                gap = 0;
            } else {
                gap += 1;
                if gap > MAX_SESSION_GAP_DAYS {
                    return Err(PipelineError::CalendarError(format!(
                        "No session found within {} days before {}",
                        MAX_SESSION_GAP_DAYS, current
                    )));
                }
            }
        }
        days.reverse();
        Ok(days)
    }

    /// Get the next session after the given date
    fn next_session(&self, date: Date) -> Result<Date> {
        let mut current = date;
        for _ in 0..MAX_SESSION_GAP_DAYS {
            current += Duration::days(1);
            if self.is_session(current) {
                return Ok(current);
            }
        }
        Err(PipelineError::CalendarError(format!(
            "No session found within {} days after {}",
            MAX_SESSION_GAP_DAYS, date
        )))
    }
}

/// Weekday calendar with an explicit holiday list (NYSE-style)
#[derive(Debug, Clone, Default)]
pub struct WeekdayCalendar {
    /// Sorted holiday dates
    holidays: Vec<Date>,
}

impl WeekdayCalendar {
    /// Create a calendar where every weekday is a session
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a calendar with the given holidays
    pub fn with_holidays(mut holidays: Vec<Date>) -> Self {
        holidays.sort();
        holidays.dedup();
        Self { holidays }
    }

    /// Add a custom holiday
    pub fn add_holiday(&mut self, date: Date) {
        if let Err(pos) = self.holidays.binary_search(&date) {
            self.holidays.insert(pos, date);
        }
    }

    fn is_weekend(date: NaiveDate) -> bool {
        matches!(date.weekday(), Weekday::Sat | Weekday::Sun)
    }
}

impl TradingCalendar for WeekdayCalendar {
    fn is_session(&self, date: Date) -> bool {
        !Self::is_weekend(date) && self.holidays.binary_search(&date).is_err()
    }
}

/// Calendar backed by an explicit, finite list of sessions
///
/// Requests reaching outside the list fail rather than guessing.
#[derive(Debug, Clone)]
pub struct SessionCalendar {
    sessions: Vec<Date>,
}

impl SessionCalendar {
    /// Create a calendar from a list of sessions (sorted and deduplicated)
    pub fn new(mut sessions: Vec<Date>) -> Self {
        sessions.sort();
        sessions.dedup();
        Self { sessions }
    }

    /// All sessions known to this calendar
    pub fn all_sessions(&self) -> &[Date] {
        &self.sessions
    }

    /// First known session
    pub fn first_session(&self) -> Option<Date> {
        self.sessions.first().copied()
    }
}

impl TradingCalendar for SessionCalendar {
    fn is_session(&self, date: Date) -> bool {
        self.sessions.binary_search(&date).is_ok()
    }

    fn sessions(&self, start: Date, end: Date) -> Result<Vec<Date>> {
        let lo = self.sessions.partition_point(|d| *d < start);
        let hi = self.sessions.partition_point(|d| *d <= end);
        Ok(self.sessions[lo..hi.max(lo)].to_vec())
    }

    fn sessions_before(&self, date: Date, count: usize) -> Result<Vec<Date>> {
        let end = self.sessions.partition_point(|d| *d < date);
        if count > end {
            return Err(PipelineError::CalendarError(format!(
                "Calendar has only {} sessions before {}, {} requested",
                end, date, count
            )));
        }
        Ok(self.sessions[end - count..end].to_vec())
    }

    fn next_session(&self, date: Date) -> Result<Date> {
        let idx = self.sessions.partition_point(|d| *d <= date);
        self.sessions.get(idx).copied().ok_or_else(|| {
            PipelineError::CalendarError(format!("No session after {}", date))
        })
    }
}

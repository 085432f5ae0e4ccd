//! Merge window
//!
//! Automated merges are only admitted during a configured hour range on
//! non-blocked weekdays. The window is consulted at selection time only; an
//! operation admitted before the window closes is allowed to finish.

use chrono::{DateTime, Datelike, Duration, TimeZone, Timelike, Weekday};
use serde::{Deserialize, Serialize};

/// Upper bound on the forward scan for the next opening
const SCAN_HOURS: i64 = 24 * 8;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeWindow {
    /// First hour (0-23) inside the window
    pub start_hour: u32,
    /// First hour after the window. Smaller than `start_hour` wraps midnight;
    /// equal means open all day.
    pub end_hour: u32,
    #[serde(default)]
    pub blocked_weekdays: Vec<Weekday>,
}

impl Default for MergeWindow {
    fn default() -> Self {
        Self {
            start_hour: 9,
            end_hour: 17,
            blocked_weekdays: vec![Weekday::Sat, Weekday::Sun],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WindowStatus<Tz: TimeZone> {
    Open,
    Closed { next_opening: Option<DateTime<Tz>> },
}

impl MergeWindow {
    /// Always open, no blocked days
    pub fn always_open() -> Self {
        Self {
            start_hour: 0,
            end_hour: 0,
            blocked_weekdays: Vec::new(),
        }
    }

    pub fn is_open<Tz: TimeZone>(&self, now: &DateTime<Tz>) -> bool {
        if self.blocked_weekdays.contains(&now.weekday()) {
            return false;
        }
        let hour = now.hour();
        match self.start_hour.cmp(&self.end_hour) {
            std::cmp::Ordering::Equal => true,
            std::cmp::Ordering::Less => self.start_hour <= hour && hour < self.end_hour,
            std::cmp::Ordering::Greater => hour >= self.start_hour || hour < self.end_hour,
        }
    }

    /// `now` when open, otherwise the next top of the hour at which the
    /// window opens. `None` when it never opens (every day blocked).
    pub fn next_opening<Tz: TimeZone>(&self, now: &DateTime<Tz>) -> Option<DateTime<Tz>> {
        if self.is_open(now) {
            return Some(now.clone());
        }
        let top_of_hour = now
            .with_minute(0)
            .and_then(|t| t.with_second(0))
            .and_then(|t| t.with_nanosecond(0))?;
        (1..=SCAN_HOURS)
            .map(|h| top_of_hour.clone() + Duration::hours(h))
            .find(|candidate| self.is_open(candidate))
    }

    pub fn status<Tz: TimeZone>(&self, now: &DateTime<Tz>) -> WindowStatus<Tz> {
        if self.is_open(now) {
            WindowStatus::Open
        } else {
            WindowStatus::Closed {
                next_opening: self.next_opening(now),
            }
        }
    }

    /// Format the window for display
    pub fn format_window_display<Tz: TimeZone>(&self, now: &DateTime<Tz>) -> String
    where
        Tz::Offset: std::fmt::Display,
    {
        let mut output = String::new();

        output.push_str("🕒 MERGE WINDOW:\n");
        output.push_str("─────────────────\n");

        let range = if self.start_hour == self.end_hour {
            "all day".to_string()
        } else {
            format!("{:02}:00-{:02}:00", self.start_hour, self.end_hour)
        };

        match self.status(now) {
            WindowStatus::Open => {
                output.push_str(&format!("🟢 Open now ({range})\n"));
            }
            WindowStatus::Closed {
                next_opening: Some(opening),
            } => {
                let minutes = (opening.clone() - now.clone()).num_minutes().max(0);
                output.push_str(&format!(
                    "🔴 Closed ({range}), opens {} (in {}h {}m)\n",
                    opening.format("%a %H:%M"),
                    minutes / 60,
                    minutes % 60
                ));
            }
            WindowStatus::Closed { next_opening: None } => {
                output.push_str(&format!("🔴 Closed ({range}), every day is blocked\n"));
            }
        }

        if !self.blocked_weekdays.is_empty() {
            let days: Vec<String> = self.blocked_weekdays.iter().map(|d| d.to_string()).collect();
            output.push_str(&format!("🚫 Blocked days: {}\n", days.join(", ")));
        }

        output
    }
}

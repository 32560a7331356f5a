use std::sync::LazyLock;

use regex::Regex;

use crate::model::task::{DurationUnit, TaskDuration};

/// Marker that introduces a duration token in a task line
pub const DURATION_MARKER: &str = "⏱";

static HOURS_MINUTES: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:(\d+)\s*(?:h|hr|hrs|hour|hours))?\s*(?:(\d+)\s*(?:m|min|mins|minute|minutes))?$")
        .unwrap()
});

static DAYS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d+)\s*(?:d|day|days)$").unwrap());

/// Parse a duration token such as `45m`, `2h`, `1h30m`, `1h 30m` or `3d`.
/// Hours are normalised to minutes. Zero or unreadable durations are None.
pub fn parse_duration(token: &str) -> Option<TaskDuration> {
    let token = token.trim().to_lowercase();
    if token.is_empty() {
        return None;
    }

    if let Some(caps) = DAYS.captures(&token) {
        let days: u32 = caps[1].parse().ok()?;
        return (days > 0).then(|| TaskDuration::days(days));
    }

    let caps = HOURS_MINUTES.captures(&token)?;
    let hours: u32 = match caps.get(1) {
        Some(m) => m.as_str().parse().ok()?,
        None => 0,
    };
    let minutes: u32 = match caps.get(2) {
        Some(m) => m.as_str().parse().ok()?,
        None => 0,
    };
    if caps.get(1).is_none() && caps.get(2).is_none() {
        return None;
    }
    let total = hours.checked_mul(60)?.checked_add(minutes)?;
    (total > 0).then(|| TaskDuration::minutes(total))
}

/// Render a duration in its shortest canonical token form
pub fn format_duration(duration: &TaskDuration) -> String {
    match duration.unit {
        DurationUnit::Day => format!("{}d", duration.amount),
        DurationUnit::Minute => {
            let hours = duration.amount / 60;
            let minutes = duration.amount % 60;
            match (hours, minutes) {
                (0, m) => format!("{}m", m),
                (h, 0) => format!("{}h", h),
                (h, m) => format!("{}h{}m", h, m),
            }
        }
    }
}

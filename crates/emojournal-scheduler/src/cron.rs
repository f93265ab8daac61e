//! Lightweight cron expression parser, evaluated in a timezone.
//! Supports: "MIN HOUR DOM MON DOW" (5-field, no seconds)
//! Wildcards: *, */N, N, N,M,...  (DOM/MON/DOW: only * supported)
//! Example: "55 8 * * *" in Europe/Moscow = every day at 08:55 Moscow time

use chrono::{DateTime, Duration, TimeZone, Timelike, Utc};
use chrono_tz::Tz;

/// A parsed cron schedule bound to a timezone.
#[derive(Debug, Clone, PartialEq)]
pub struct CronSpec {
    expression: String,
    minutes: Vec<u32>,
    hours: Vec<u32>,
    tz: Tz,
}

impl CronSpec {
    /// Parse a 5-field expression. Returns None (and logs) on invalid input.
    pub fn parse(expression: &str, tz: Tz) -> Option<Self> {
        let parts: Vec<&str> = expression.split_whitespace().collect();
        if parts.len() != 5 {
            tracing::warn!(
                "Invalid cron expression: '{}' (need 5 fields: MIN HOUR DOM MON DOW)",
                expression
            );
            return None;
        }
        if parts[2..].iter().any(|p| *p != "*") {
            tracing::warn!(
                "Unsupported cron expression: '{}' (DOM/MON/DOW must be *)",
                expression
            );
            return None;
        }

        let minutes = parse_field(parts[0], 0, 59)?;
        let hours = parse_field(parts[1], 0, 23)?;
        if minutes.is_empty() || hours.is_empty() {
            return None;
        }

        Some(Self {
            expression: expression.to_string(),
            minutes,
            hours,
            tz,
        })
    }

    /// Every day at `hour:minute` local time.
    pub fn daily_at(hour: u32, minute: u32, tz: Tz) -> Option<Self> {
        Self::parse(&format!("{minute} {hour} * * *"), tz)
    }

    /// Top of every hour, server (UTC) time.
    pub fn hourly() -> Self {
        Self {
            expression: "0 * * * *".to_string(),
            minutes: vec![0],
            hours: (0..=23).collect(),
            tz: chrono_tz::UTC,
        }
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    pub fn timezone(&self) -> Tz {
        self.tz
    }

    /// First matching instant strictly after `after`.
    ///
    /// Local times that fall in a DST gap are skipped; ambiguous ones take the
    /// earlier instant.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let local = after.with_timezone(&self.tz).naive_local();
        let mut candidate = local.with_second(0)?.with_nanosecond(0)? + Duration::minutes(1);

        // Try up to 48 hours ahead
        for _ in 0..(48 * 60) {
            if self.minutes.contains(&candidate.minute()) && self.hours.contains(&candidate.hour())
                && let Some(at) = self.tz.from_local_datetime(&candidate).earliest()
            {
                let at = at.with_timezone(&Utc);
                if at > after {
                    return Some(at);
                }
            }
            candidate += Duration::minutes(1);
        }

        None
    }
}

impl std::fmt::Display for CronSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.expression, self.tz)
    }
}

/// Parse a cron field into a list of matching values.
fn parse_field(field: &str, min: u32, max: u32) -> Option<Vec<u32>> {
    if field == "*" {
        return Some((min..=max).collect());
    }

    // */N: every N
    if let Some(step) = field.strip_prefix("*/") {
        let n: u32 = step.parse().ok()?;
        if n == 0 {
            return None;
        }
        return Some((min..=max).step_by(n as usize).collect());
    }

    // Comma-separated: "0,15,30,45"
    if field.contains(',') {
        let vals: Result<Vec<u32>, _> = field.split(',').map(|s| s.trim().parse()).collect();
        return vals
            .ok()
            .map(|v| v.into_iter().filter(|x| *x >= min && *x <= max).collect());
    }

    // Single number
    let n: u32 = field.parse().ok()?;
    if n >= min && n <= max {
        Some(vec![n])
    } else {
        None
    }
}

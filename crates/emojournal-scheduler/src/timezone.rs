//! Timezone resolution with a safe fallback.
//!
//! `chrono-tz` compiles the IANA database into the binary, so parsing is a
//! table lookup with nothing to reload. The resolver only remembers which
//! invalid names it has already warned about, to keep logs quiet.

use chrono::{DateTime, Duration, LocalResult, NaiveDate, NaiveDateTime, NaiveTime, Offset, TimeZone, Utc};
use chrono_tz::Tz;
use std::collections::HashSet;
use std::sync::Mutex;

pub const DEFAULT_TIMEZONE: Tz = chrono_tz::Europe::Moscow;

#[derive(Debug)]
pub struct TimezoneResolver {
    fallback: Tz,
    warned: Mutex<HashSet<String>>,
}

impl TimezoneResolver {
    pub fn new(fallback: Tz) -> Self {
        Self {
            fallback,
            warned: Mutex::new(HashSet::new()),
        }
    }

    /// Build from a configured name; an unknown name falls back to Moscow.
    pub fn from_name(name: &str) -> Self {
        let fallback = name.trim().parse::<Tz>().unwrap_or_else(|_| {
            tracing::warn!("⚠️ Unknown default timezone '{}', using {}", name, DEFAULT_TIMEZONE);
            DEFAULT_TIMEZONE
        });
        Self::new(fallback)
    }

    pub fn fallback(&self) -> Tz {
        self.fallback
    }

    /// Resolve a stored timezone string. Never fails.
    pub fn resolve(&self, name: &str) -> Tz {
        let trimmed = name.trim();
        if let Ok(tz) = trimmed.parse::<Tz>() {
            return tz;
        }
        let mut warned = self.warned.lock().unwrap_or_else(|p| p.into_inner());
        if warned.insert(trimmed.to_string()) {
            tracing::warn!(
                "🌐 Invalid timezone '{}', falling back to {}",
                trimmed,
                self.fallback
            );
        }
        self.fallback
    }
}

impl Default for TimezoneResolver {
    fn default() -> Self {
        Self::new(DEFAULT_TIMEZONE)
    }
}

/// Map a local wall-clock time to an instant.
///
/// Ambiguous times (DST fall-back) take the earlier instant. Times inside a
/// DST gap are pushed forward by the size of a typical gap (one hour).
pub fn local_to_utc(tz: Tz, date: NaiveDate, time: NaiveTime) -> Option<DateTime<Utc>> {
    let naive = date.and_time(time);
    match tz.from_local_datetime(&naive) {
        LocalResult::Single(dt) => Some(dt.with_timezone(&Utc)),
        LocalResult::Ambiguous(earliest, _) => Some(earliest.with_timezone(&Utc)),
        LocalResult::None => tz
            .from_local_datetime(&(naive + Duration::hours(1)))
            .earliest()
            .map(|dt| dt.with_timezone(&Utc)),
    }
}

/// Local wall clock with the zone's sub-hour UTC offset taken off.
///
/// A tick at the top of a UTC hour reads `:30` in a `+05:30` zone. Removing
/// the `:30` (or `:45`) moves that tick onto minute 0 of the local hour it
/// has just entered. Whole-hour zones are unchanged.
pub fn hour_aligned_local(tz: Tz, now: DateTime<Utc>) -> NaiveDateTime {
    let local = now.with_timezone(&tz);
    let sub_hour = local.offset().fix().local_minus_utc().rem_euclid(3600);
    local.naive_local() - Duration::seconds(i64::from(sub_hour))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;

    #[test]
    fn test_resolves_valid_name() {
        let resolver = TimezoneResolver::default();
        assert_eq!(resolver.resolve("Asia/Tokyo"), chrono_tz::Asia::Tokyo);
        assert_eq!(resolver.resolve("  Europe/Berlin "), chrono_tz::Europe::Berlin);
    }

    #[test]
    fn test_invalid_and_empty_fall_back() {
        let resolver = TimezoneResolver::new(chrono_tz::UTC);
        assert_eq!(resolver.resolve(""), chrono_tz::UTC);
        assert_eq!(resolver.resolve("Not/AZone"), chrono_tz::UTC);
        // Second lookup of the same bad name still falls back.
        assert_eq!(resolver.resolve("Not/AZone"), chrono_tz::UTC);
    }

    #[test]
    fn test_from_name_bad_default() {
        let resolver = TimezoneResolver::from_name("nowhere");
        assert_eq!(resolver.fallback(), DEFAULT_TIMEZONE);
    }

    #[test]
    fn test_local_to_utc_moscow() {
        let date = NaiveDate::from_ymd_opt(2026, 10, 14).unwrap();
        let at = local_to_utc(chrono_tz::Europe::Moscow, date, NaiveTime::from_hms_opt(13, 0, 0).unwrap()).unwrap();
        assert_eq!(at.hour(), 10);
    }

    #[test]
    fn test_local_to_utc_dst_gap() {
        // 2026-03-29 02:30 does not exist in Berlin.
        let date = NaiveDate::from_ymd_opt(2026, 3, 29).unwrap();
        let at = local_to_utc(chrono_tz::Europe::Berlin, date, NaiveTime::from_hms_opt(2, 30, 0).unwrap());
        assert!(at.is_some());
    }

    #[test]
    fn test_hour_aligned_local() {
        let tick = Utc.with_ymd_and_hms(2026, 10, 18, 16, 0, 0).unwrap();
        let at = |tz: Tz| {
            let t = hour_aligned_local(tz, tick);
            (t.hour(), t.minute())
        };
        assert_eq!(at(chrono_tz::Europe::Moscow), (19, 0));
        assert_eq!(at(chrono_tz::Asia::Kolkata), (21, 0));
        assert_eq!(at(chrono_tz::Asia::Kathmandu), (21, 0));
        assert_eq!(at(chrono_tz::America::St_Johns), (13, 0));
    }
}

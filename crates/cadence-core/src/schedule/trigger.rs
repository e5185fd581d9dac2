//! Trigger compilation and next-fire computation.
//!
//! Cron expressions are evaluated with `croner` in the schedule's IANA
//! timezone (via `chrono-tz`), so "06:00 on weekdays" follows local wall-clock
//! time across DST changes. Interval triggers are anchored on the previous
//! fire; date triggers fire once.

use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;

use cadence_types::schedule::Trigger;

use super::SchedulerError;

/// Upper bound on how many missed occurrences are enumerated at once. The
/// most recent occurrence is found separately by [`CompiledTrigger::latest_until`].
pub const MAX_MISSED_OCCURRENCES: usize = 64;

// ---------------------------------------------------------------------------
// Human-readable schedule normalization
// ---------------------------------------------------------------------------

/// Normalize a cron trigger string to the 6-field form `croner` parses.
///
/// Accepts a standard 5-field cron expression (a `0` seconds field is
/// prepended) or one of these case-insensitive shorthands:
/// - "every minute" / "minutely"      -> "0 * * * * *"
/// - "every hour" / "hourly"          -> "0 0 * * * *"
/// - "every day" / "daily"            -> "0 0 0 * * *"
/// - "weekly"                         -> "0 0 0 * * SUN"
/// - "monthly"                        -> "0 0 0 1 * *"
/// - "every day at HH:MM"             -> "0 MM HH * * *"
/// - "every N minutes" / "every N hours"
///
/// `@hourly`, `@daily`, `@weekly` and `@monthly` are accepted as aliases.
pub fn normalize_schedule(input: &str) -> Result<String, SchedulerError> {
    let trimmed = input.trim();
    let invalid = || SchedulerError::InvalidSchedule(format!("unrecognized schedule format: '{trimmed}'"));

    let parts: Vec<&str> = trimmed.split_whitespace().collect();
    if parts.len() == 5 {
        return Ok(format!("0 {}", parts.join(" ")));
    }

    let lower = trimmed.to_lowercase();
    let lower = lower.strip_prefix('@').unwrap_or(&lower);

    match lower {
        "every minute" | "minutely" => return Ok("0 * * * * *".to_string()),
        "every hour" | "hourly" => return Ok("0 0 * * * *".to_string()),
        "every day" | "daily" | "midnight" => return Ok("0 0 0 * * *".to_string()),
        "weekly" => return Ok("0 0 0 * * SUN".to_string()),
        "monthly" => return Ok("0 0 0 1 * *".to_string()),
        _ => {}
    }

    let Some(rest) = lower.strip_prefix("every ") else {
        return Err(invalid());
    };

    if let Some(at) = rest.strip_prefix("day at ") {
        let (hour, minute) = at.trim().split_once(':').ok_or_else(invalid)?;
        let hour: u32 = hour.trim().parse().map_err(|_| invalid())?;
        let minute: u32 = minute.trim().parse().map_err(|_| invalid())?;
        if hour >= 24 || minute >= 60 {
            return Err(invalid());
        }
        return Ok(format!("0 {minute} {hour} * * *"));
    }

    let words: Vec<&str> = rest.split_whitespace().collect();
    if let [n, unit] = words.as_slice() {
        let n: u32 = n.parse().map_err(|_| invalid())?;
        if n == 0 {
            return Err(SchedulerError::InvalidSchedule("interval must be > 0".to_string()));
        }
        return match unit.trim_end_matches('s') {
            "minute" if n < 60 => Ok(format!("0 */{n} * * * *")),
            "hour" if n < 24 => Ok(format!("0 0 */{n} * * *")),
            _ => Err(invalid()),
        };
    }

    Err(invalid())
}

/// Parse an IANA timezone name such as "America/New_York".
pub fn parse_timezone(name: &str) -> Result<Tz, SchedulerError> {
    name.trim()
        .parse::<Tz>()
        .map_err(|_| SchedulerError::InvalidTimezone(name.to_string()))
}

// ---------------------------------------------------------------------------
// CompiledTrigger
// ---------------------------------------------------------------------------

/// A validated trigger ready for fire-time computation.
#[derive(Debug, Clone)]
pub enum CompiledTrigger {
    Cron { cron: croner::Cron, tz: Tz },
    Interval { every: Duration },
    Date { at: DateTime<Utc> },
}

impl CompiledTrigger {
    /// Validate `trigger` in `timezone`.
    pub fn compile(trigger: &Trigger, timezone: &str) -> Result<Self, SchedulerError> {
        let tz = parse_timezone(timezone)?;
        match trigger {
            Trigger::Cron { expression } => {
                let normalized = normalize_schedule(expression)?;
                let cron = normalized
                    .parse::<croner::Cron>()
                    .map_err(|e| SchedulerError::InvalidSchedule(format!("'{expression}': {e}")))?;
                Ok(CompiledTrigger::Cron { cron, tz })
            }
            Trigger::Interval { seconds } => {
                if *seconds == 0 {
                    return Err(SchedulerError::InvalidSchedule(
                        "interval must be > 0 seconds".to_string(),
                    ));
                }
                let seconds = i64::try_from(*seconds)
                    .map_err(|_| SchedulerError::InvalidSchedule(format!("interval {seconds}s is too large")))?;
                let every = Duration::try_seconds(seconds)
                    .ok_or_else(|| SchedulerError::InvalidSchedule(format!("interval {seconds}s is too large")))?;
                Ok(CompiledTrigger::Interval { every })
            }
            Trigger::Date { run_at } => Ok(CompiledTrigger::Date { at: *run_at }),
        }
    }

    /// First fire time for a schedule activated at `anchor`. A date trigger
    /// returns its instant even when it already passed, so the caller can
    /// apply the misfire policy.
    pub fn first_fire(&self, anchor: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            CompiledTrigger::Date { at } => Some(*at),
            _ => self.following(anchor),
        }
    }

    /// The fire time strictly after `previous`.
    pub fn following(&self, previous: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            CompiledTrigger::Cron { cron, tz } => cron
                .find_next_occurrence(&previous.with_timezone(tz), false)
                .ok()
                .map(|t| t.with_timezone(&Utc)),
            CompiledTrigger::Interval { every } => previous.checked_add_signed(*every),
            CompiledTrigger::Date { .. } => None,
        }
    }

    /// The first fire time strictly after `now`, continuing the series that
    /// contains `previous`.
    pub fn next_after(&self, previous: DateTime<Utc>, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            CompiledTrigger::Cron { .. } => self.following(previous.max(now)),
            CompiledTrigger::Interval { every } => {
                if previous > now {
                    return Some(previous);
                }
                let period = every.num_milliseconds().max(1);
                let behind = (now - previous).num_milliseconds();
                let steps = behind / period + 1;
                previous.checked_add_signed(Duration::milliseconds(period.saturating_mul(steps)))
            }
            CompiledTrigger::Date { at } => (*at > now).then_some(*at),
        }
    }

    /// Occurrences from `first` (inclusive) up to `now` (inclusive), at most
    /// [`MAX_MISSED_OCCURRENCES`] of them.
    pub fn occurrences_until(&self, first: DateTime<Utc>, now: DateTime<Utc>) -> Vec<DateTime<Utc>> {
        let mut found = Vec::new();
        let mut cursor = Some(first);
        while let Some(at) = cursor {
            if at > now || found.len() >= MAX_MISSED_OCCURRENCES {
                break;
            }
            found.push(at);
            cursor = self.following(at);
        }
        found
    }

    /// The last occurrence at or before `now` in the series that starts at
    /// `first`, however many occurrences lie in between.
    pub fn latest_until(&self, first: DateTime<Utc>, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if first > now {
            return None;
        }
        match self {
            CompiledTrigger::Interval { every } => {
                let period = every.num_milliseconds().max(1);
                let steps = (now - first).num_milliseconds() / period;
                first.checked_add_signed(Duration::milliseconds(period.saturating_mul(steps)))
            }
            CompiledTrigger::Cron { .. } => {
                let mut latest = first;
                while let Some(next) = self.following(latest).filter(|t| *t <= now) {
                    latest = next;
                }
                Some(latest)
            }
            CompiledTrigger::Date { .. } => Some(first),
        }
    }

    /// The next `count` fire times after `from`.
    pub fn upcoming(&self, from: DateTime<Utc>, count: usize) -> Vec<DateTime<Utc>> {
        let mut times = Vec::with_capacity(count);
        let mut cursor = self.first_fire(from).filter(|t| *t > from);
        while let Some(at) = cursor {
            if times.len() >= count {
                break;
            }
            times.push(at);
            cursor = self.following(at);
        }
        times
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn utc(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    // -------------------------------------------------------------------
    // normalize_schedule
    // -------------------------------------------------------------------

    #[test]
    fn test_normalize_standard_5field_cron() {
        assert_eq!(normalize_schedule("*/5 * * * *").unwrap(), "0 */5 * * * *");
        assert_eq!(normalize_schedule("  0 6  * * 1-5 ").unwrap(), "0 0 6 * * 1-5");
    }

    #[test]
    fn test_normalize_shorthands() {
        assert_eq!(normalize_schedule("hourly").unwrap(), "0 0 * * * *");
        assert_eq!(normalize_schedule("@daily").unwrap(), "0 0 0 * * *");
        assert_eq!(normalize_schedule("Every Minute").unwrap(), "0 * * * * *");
        assert_eq!(normalize_schedule("every 15 minutes").unwrap(), "0 */15 * * * *");
        assert_eq!(normalize_schedule("every 2 hours").unwrap(), "0 0 */2 * * *");
        assert_eq!(normalize_schedule("every day at 14:30").unwrap(), "0 30 14 * * *");
    }

    #[test]
    fn test_normalize_rejects_garbage() {
        assert!(normalize_schedule("whenever").is_err());
        assert!(normalize_schedule("every 0 minutes").is_err());
        assert!(normalize_schedule("every day at 25:00").is_err());
        assert!(normalize_schedule("every 10 seconds").is_err());
        assert!(normalize_schedule("* * *").is_err());
    }

    // -------------------------------------------------------------------
    // Compilation
    // -------------------------------------------------------------------

    #[test]
    fn test_compile_rejects_bad_input() {
        let cron = |e: &str| Trigger::Cron {
            expression: e.to_string(),
        };
        assert!(matches!(
            CompiledTrigger::compile(&cron("0 6 * * *"), "Mars/Olympus"),
            Err(SchedulerError::InvalidTimezone(_))
        ));
        assert!(matches!(
            CompiledTrigger::compile(&cron("61 * * * *"), "UTC"),
            Err(SchedulerError::InvalidSchedule(_))
        ));
        assert!(CompiledTrigger::compile(&Trigger::Interval { seconds: 0 }, "UTC").is_err());
    }

    // -------------------------------------------------------------------
    // Fire-time computation
    // -------------------------------------------------------------------

    #[test]
    fn test_weekday_cron_in_new_york() {
        let trigger = CompiledTrigger::compile(
            &Trigger::Cron {
                expression: "0 6 * * 1-5".to_string(),
            },
            "America/New_York",
        )
        .unwrap();

        // Saturday noon UTC -> Monday 06:00 EDT.
        let next = trigger.first_fire(utc(2024, 6, 1, 12, 0)).unwrap();
        assert_eq!(next, utc(2024, 6, 3, 10, 0));

        // In winter the same wall-clock time is 11:00 UTC.
        let next = trigger.first_fire(utc(2024, 1, 6, 12, 0)).unwrap();
        assert_eq!(next, utc(2024, 1, 8, 11, 0));
    }

    #[test]
    fn test_interval_anchors_on_previous_fire() {
        let trigger = CompiledTrigger::compile(&Trigger::Interval { seconds: 300 }, "UTC").unwrap();
        let anchor = utc(2024, 6, 1, 0, 0);
        assert_eq!(trigger.first_fire(anchor), Some(utc(2024, 6, 1, 0, 5)));
        assert_eq!(
            trigger.next_after(utc(2024, 6, 1, 0, 5), utc(2024, 6, 1, 0, 17)),
            Some(utc(2024, 6, 1, 0, 20))
        );
    }

    #[test]
    fn test_date_fires_once() {
        let at = utc(2024, 6, 1, 9, 0);
        let trigger = CompiledTrigger::compile(&Trigger::Date { run_at: at }, "UTC").unwrap();
        assert_eq!(trigger.first_fire(utc(2024, 6, 1, 10, 0)), Some(at));
        assert_eq!(trigger.following(at), None);
        assert_eq!(trigger.next_after(at, utc(2024, 6, 1, 10, 0)), None);
    }

    #[test]
    fn test_occurrences_until_and_upcoming() {
        let trigger = CompiledTrigger::compile(
            &Trigger::Cron {
                expression: "hourly".to_string(),
            },
            "UTC",
        )
        .unwrap();

        let missed = trigger.occurrences_until(utc(2024, 6, 1, 1, 0), utc(2024, 6, 1, 3, 30));
        assert_eq!(
            missed,
            vec![utc(2024, 6, 1, 1, 0), utc(2024, 6, 1, 2, 0), utc(2024, 6, 1, 3, 0)]
        );

        let next = trigger.upcoming(utc(2024, 6, 1, 3, 30), 2);
        assert_eq!(next, vec![utc(2024, 6, 1, 4, 0), utc(2024, 6, 1, 5, 0)]);
    }

    #[test]
    fn test_latest_until_reaches_past_the_enumeration_cap() {
        let every_minute = CompiledTrigger::compile(&Trigger::Interval { seconds: 60 }, "UTC").unwrap();
        let start = utc(2024, 6, 1, 0, 0);
        let now = utc(2024, 6, 1, 2, 0) + Duration::seconds(10);

        assert_eq!(every_minute.occurrences_until(start, now).len(), MAX_MISSED_OCCURRENCES);
        assert_eq!(every_minute.latest_until(start, now), Some(utc(2024, 6, 1, 2, 0)));
        assert_eq!(every_minute.latest_until(now, start), None);

        let hourly = CompiledTrigger::compile(
            &Trigger::Cron {
                expression: "hourly".to_string(),
            },
            "UTC",
        )
        .unwrap();
        assert_eq!(
            hourly.latest_until(utc(2024, 6, 1, 0, 0), utc(2024, 6, 10, 6, 30)),
            Some(utc(2024, 6, 10, 6, 0))
        );
    }
}

//! Next-execution arithmetic for scheduled jobs.
//!
//! Recurring schedules are anchored on the job's reference instant: the n-th
//! occurrence is always `reference + n * factor * unit`, computed directly from
//! the reference so month-end clamping never accumulates.

use chrono::{DateTime, Datelike, Duration, Months, Utc};
use serde::{Deserialize, Serialize};

/// A job never fires sooner than this after "now".
pub const SCHEDULE_MARGIN_SECS: i64 = 60;

/// Upper bound on stepping when looking for the next occurrence.
pub const MAX_ITERATIONS: u32 = 100_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScheduleType {
    /// Run once, as soon as possible.
    Asap,
    /// Run once, at the reference instant.
    At,
    Hourly,
    Daily,
    Weekly,
    Monthly,
}

impl ScheduleType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Asap => "ASAP",
            Self::At => "AT",
            Self::Hourly => "HOURLY",
            Self::Daily => "DAILY",
            Self::Weekly => "WEEKLY",
            Self::Monthly => "MONTHLY",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ASAP" => Some(Self::Asap),
            "AT" => Some(Self::At),
            "HOURLY" => Some(Self::Hourly),
            "DAILY" => Some(Self::Daily),
            "WEEKLY" => Some(Self::Weekly),
            "MONTHLY" => Some(Self::Monthly),
            _ => None,
        }
    }

    pub fn is_repeating(&self) -> bool {
        !matches!(self, Self::Asap | Self::At)
    }
}

impl std::fmt::Display for ScheduleType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Compute when a job with this schedule should next fire.
///
/// `Asap` has no instant, `At` is exactly the reference. Recurring types return
/// the first occurrence strictly after `now + 1 minute`. A factor `<= 0` counts
/// as 1.
pub fn next_execution(
    schedule_type: ScheduleType,
    factor: i32,
    reference: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    let factor = i64::from(factor.max(1));
    let threshold = now + Duration::seconds(SCHEDULE_MARGIN_SECS);

    let unit_ms: i64 = match schedule_type {
        ScheduleType::Asap => return None,
        ScheduleType::At => return Some(reference),
        ScheduleType::Monthly => return Some(next_monthly(factor, reference, threshold)),
        ScheduleType::Hourly => 3_600_000,
        ScheduleType::Daily => 86_400_000,
        ScheduleType::Weekly => 7 * 86_400_000,
    };
    Some(next_fixed(unit_ms.saturating_mul(factor), reference, threshold))
}

fn next_fixed(step_ms: i64, reference: DateTime<Utc>, threshold: DateTime<Utc>) -> DateTime<Utc> {
    let behind_ms = (threshold - reference).num_milliseconds();
    let start = if behind_ms < 0 { 0 } else { behind_ms / step_ms + 1 };
    first_after(reference, threshold, start, |k| {
        let offset = Duration::try_milliseconds(k.checked_mul(step_ms)?)?;
        reference.checked_add_signed(offset)
    })
}

fn next_monthly(factor: i64, reference: DateTime<Utc>, threshold: DateTime<Utc>) -> DateTime<Utc> {
    let months_behind = i64::from(threshold.year() - reference.year()) * 12
        + i64::from(threshold.month0())
        - i64::from(reference.month0());
    // one step of slack so month-length clamping can't skip the earliest hit
    let start = (months_behind / factor - 1).max(0);
    first_after(reference, threshold, start, |k| {
        let months = u32::try_from(k.checked_mul(factor)?).ok()?;
        reference.checked_add_months(Months::new(months))
    })
}

/// Walk `k = start, start + 1, ...` until `at(k)` lands strictly after `threshold`.
/// Gives back the last computed instant when the cap or the calendar range runs out.
fn first_after<F>(
    reference: DateTime<Utc>,
    threshold: DateTime<Utc>,
    start: i64,
    at: F,
) -> DateTime<Utc>
where
    F: Fn(i64) -> Option<DateTime<Utc>>,
{
    let mut last = reference;
    let mut k = start;
    for _ in 0..MAX_ITERATIONS {
        match at(k) {
            Some(candidate) if candidate > threshold => return candidate,
            Some(candidate) => last = candidate,
            None => return last,
        }
        k += 1;
    }
    last
}

use chrono::{DateTime, Datelike, Days, Duration, LocalResult, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use reveil_core::AlarmDefinition;
use tokio::time::Instant;

use crate::{clock::deadline_for, types::ScheduledOccurrence};

/// Days scanned ahead of the reference date. A non-empty weekday filter
/// always matches within a week; the extra days cover the day-before start
/// and a gap that swallows a whole local date.
const SEARCH_DAYS: u64 = 9;

/// Upper bound when walking forward out of a DST gap (minutes).
const MAX_GAP_MINUTES: u32 = 48 * 60;

/// Compute the next occurrence of `definition` at or after `reference`.
///
/// The deadline is `monotonic_now + (target - reference)`. Returns `None`
/// only when no matching local date exists in the search horizon.
pub fn compute_next(
    definition: &AlarmDefinition,
    reference: DateTime<Utc>,
    monotonic_now: Instant,
) -> Option<ScheduledOccurrence> {
    let target = next_instant(definition, reference)?;
    Some(ScheduledOccurrence {
        target,
        deadline: deadline_for(target.with_timezone(&Utc), reference, monotonic_now),
    })
}

/// First instant ≥ `reference` whose local date passes the weekday filter
/// and whose local time is `time_of_day`, resolved with [`resolve_local`].
pub fn next_instant(definition: &AlarmDefinition, reference: DateTime<Utc>) -> Option<DateTime<Tz>> {
    let tz = definition.timezone;
    let time = definition.time_of_day.to_naive()?;

    // Start a day early: a gap late on the previous local date can resolve
    // onto the reference date.
    let first = reference.with_timezone(&tz).date_naive().pred_opt()?;

    for offset in 0..=SEARCH_DAYS {
        let date = first.checked_add_days(Days::new(offset))?;
        if !definition.allows_weekday(date.weekday()) {
            continue;
        }
        let candidate = resolve_local(&tz, date.and_time(time))?;
        if candidate.with_timezone(&Utc) >= reference {
            return Some(candidate);
        }
    }
    None
}

/// Whether `instant` is exactly an occurrence `definition` would produce.
pub fn occurs_at(definition: &AlarmDefinition, instant: DateTime<Utc>) -> bool {
    next_instant(definition, instant).is_some_and(|t| t.with_timezone(&Utc) == instant)
}

/// Map a local wall time to a real instant.
///
/// - ambiguous (backward overlap): the earlier of the two instants;
/// - nonexistent (forward gap): the first valid local time after the gap.
pub fn resolve_local(tz: &Tz, naive: NaiveDateTime) -> Option<DateTime<Tz>> {
    match tz.from_local_datetime(&naive) {
        LocalResult::Single(t) => Some(t),
        LocalResult::Ambiguous(earliest, _) => Some(earliest),
        LocalResult::None => {
            let mut probe = naive;
            for _ in 0..MAX_GAP_MINUTES {
                probe += Duration::minutes(1);
                match tz.from_local_datetime(&probe) {
                    LocalResult::Single(t) | LocalResult::Ambiguous(t, _) => return Some(t),
                    LocalResult::None => continue,
                }
            }
            None
        }
    }
}

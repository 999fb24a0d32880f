//! Recurrence expander: next due instant of a recurring schedule.

use chrono::{DateTime, Duration, Months, Utc};

use crate::job::Recurrence;

/// Next occurrence after `from`.
///
/// Monthly steps keep the day of month, clamped to the last day when the target
/// month is shorter (Jan 31 -> Feb 28/29). Returns `None` for `Recurrence::None`
/// or when the result is out of range.
pub fn next_occurrence(recurrence: Recurrence, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
    match recurrence {
        Recurrence::None => None,
        Recurrence::Daily => from.checked_add_signed(Duration::days(1)),
        Recurrence::Weekly => from.checked_add_signed(Duration::days(7)),
        Recurrence::Monthly => from.checked_add_months(Months::new(1)),
    }
}

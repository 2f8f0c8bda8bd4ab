//! Retention policy for historical backups.
//!
//! Each backup is judged on its own start date and the current time only;
//! sibling backups are never consulted.

use chrono::{DateTime, Datelike, Duration, Utc, Weekday};

use crate::models::backup::Backup;

/// Sunday backups are kept while younger than this many days.
pub const WEEKLY_WINDOW_DAYS: i64 = 32;
/// Every backup is kept while younger than this many days.
pub const DAILY_WINDOW_DAYS: i64 = 8;

/// Decide whether a backup started at `started_at` should be discarded at `now`.
///
/// Rules, first match wins:
/// 1. started on the 1st of a month: keep, forever
/// 2. started on a Sunday less than 32 days ago: keep
/// 3. started less than 8 days ago: keep
/// 4. otherwise discard
///
/// "Less than N days ago" is strict: a backup exactly N days old is no longer
/// covered by that rule.
pub fn should_discard(started_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    if started_at.day() == 1 {
        return false;
    }
    if started_at.weekday() == Weekday::Sun
        && started_at > now - Duration::days(WEEKLY_WINDOW_DAYS)
    {
        return false;
    }
    if started_at > now - Duration::days(DAILY_WINDOW_DAYS) {
        return false;
    }
    true
}

/// Retention applied by the sweep.
#[derive(Debug, Clone, Copy)]
pub struct RetentionPolicy {
    /// Uncompleted backups at least this old are treated as abandoned.
    /// `None` leaves them to the calendar rules.
    pub abandoned_after: Option<Duration>,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            abandoned_after: Some(Duration::hours(48)),
        }
    }
}

impl RetentionPolicy {
    pub fn new(abandoned_after: Option<Duration>) -> Self {
        Self { abandoned_after }
    }

    /// Whether the sweep should remove `backup` at `now`.
    ///
    /// A backup that never completed and started at least `abandoned_after`
    /// ago is discarded whatever its date, otherwise a failed attempt on the
    /// 1st of a month would be kept forever. Everything else goes through
    /// [`should_discard`].
    pub fn discards(&self, backup: &Backup, now: DateTime<Utc>) -> bool {
        if let Some(after) = self.abandoned_after {
            if !backup.is_completed() && backup.started_at <= now - after {
                return true;
            }
        }
        should_discard(backup.started_at, now)
    }
}

//! Date-driven progress math for a challenge.
//!
//! Nothing here touches the database: the functions take a snapshot of the
//! challenge header plus task tallies and "today" (already resolved to the
//! user's timezone) and return what the stored state should become.

use std::collections::BTreeMap;

use chrono::{Days, NaiveDate};

use crate::entities::{challenge, day_task};
use crate::error::AppError;
use crate::model::ChallengeStatus;

pub fn whole_days_between(from: NaiveDate, to: NaiveDate) -> i64 {
    (to - from).num_days()
}

/// Calendar date that belongs to `day_number` (1-based) of a cycle starting on
/// `start_date`. Fails when the date falls outside chrono's calendar range.
pub fn date_for_day(start_date: NaiveDate, day_number: i32) -> Result<NaiveDate, AppError> {
    u64::try_from(i64::from(day_number) - 1)
        .ok()
        .and_then(|offset| start_date.checked_add_days(Days::new(offset)))
        .ok_or_else(|| {
            AppError::InvalidInput(format!(
                "day {day_number} from {start_date} is outside the supported date range"
            ))
        })
}

/// Day number whose tasks may be toggled today.
pub fn unlocked_day(start_date: NaiveDate, duration_days: i32, today: NaiveDate) -> i32 {
    let elapsed = whole_days_between(start_date, today);
    let day = elapsed.saturating_add(1).clamp(1, i64::from(duration_days.max(1)));
    day as i32
}

pub fn next_streak(previous_check: Option<NaiveDate>, streak_count: i32, today: NaiveDate) -> i32 {
    match previous_check {
        Some(previous) if previous.succ_opt() == Some(today) => streak_count + 1,
        _ => 1,
    }
}

/// Integer percentage, rounded half up. No required tasks means nothing has
/// been achieved yet.
pub fn achievement_rate(done: u32, total: u32) -> i32 {
    if total == 0 {
        return 0;
    }
    let done = u64::from(done.min(total));
    let total = u64::from(total);
    ((200 * done + total) / (2 * total)) as i32
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct TaskTally {
    pub required: u32,
    pub done: u32,
}

impl TaskTally {
    pub fn is_complete(&self) -> bool {
        self.done >= self.required
    }
}

/// Required-task counts per day and overall.
#[derive(Clone, Debug, Default)]
pub struct Tallies {
    by_day: BTreeMap<i32, TaskTally>,
}

impl Tallies {
    pub fn from_tasks(tasks: &[day_task::Model]) -> Self {
        let mut by_day: BTreeMap<i32, TaskTally> = BTreeMap::new();
        for task in tasks {
            let tally = by_day.entry(task.day_number).or_default();
            if task.is_required {
                tally.required += 1;
                if task.is_done {
                    tally.done += 1;
                }
            }
        }
        Self { by_day }
    }

    pub fn day(&self, day_number: i32) -> TaskTally {
        self.by_day.get(&day_number).copied().unwrap_or_default()
    }

    pub fn overall(&self) -> TaskTally {
        self.by_day
            .values()
            .fold(TaskTally::default(), |acc, tally| TaskTally {
                required: acc.required + tally.required,
                done: acc.done + tally.done,
            })
    }

    pub fn achievement_rate(&self) -> i32 {
        let overall = self.overall();
        achievement_rate(overall.done, overall.required)
    }
}

/// The date-relevant part of a challenge header.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Progress {
    pub status: ChallengeStatus,
    pub start_date: NaiveDate,
    pub duration_days: i32,
    pub current_day: i32,
    pub streak_count: i32,
    pub last_check_date: Option<NaiveDate>,
}

/// Header fields produced by advancing one day.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Advance {
    pub current_day: i32,
    pub streak_count: i32,
    pub last_check_date: NaiveDate,
    pub achievement_rate: i32,
    pub completed: bool,
}

impl Progress {
    pub fn of(challenge: &challenge::Model, status: ChallengeStatus) -> Self {
        Self {
            status,
            start_date: challenge.start_date,
            duration_days: challenge.duration_days,
            current_day: challenge.current_day,
            streak_count: challenge.streak_count,
            last_check_date: challenge.last_check_date,
        }
    }

    pub fn unlocked_day(&self, today: NaiveDate) -> i32 {
        unlocked_day(self.start_date, self.duration_days, today)
    }

    /// True when the window for `current_day` has closed without its required
    /// tasks being finished, or the whole cycle has run out with required
    /// tasks still open.
    pub fn can_retry(&self, today: NaiveDate, tallies: &Tallies) -> bool {
        if self.status != ChallengeStatus::Active {
            return false;
        }
        let fell_behind = self.unlocked_day(today) > self.current_day
            && !tallies.day(self.current_day).is_complete();
        let cycle_over = whole_days_between(self.start_date, today)
            >= i64::from(self.duration_days)
            && !tallies.overall().is_complete();
        fell_behind || cycle_over
    }

    pub fn advance(&self, today: NaiveDate, tallies: &Tallies) -> Advance {
        let was_last_day = self.current_day >= self.duration_days;
        Advance {
            current_day: (self.current_day + 1).min(self.duration_days),
            streak_count: next_streak(self.last_check_date, self.streak_count, today),
            last_check_date: today,
            achievement_rate: tallies.achievement_rate(),
            completed: was_last_day && tallies.overall().is_complete(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn task(day_number: i32, is_required: bool, is_done: bool) -> day_task::Model {
        let now = Utc::now();
        day_task::Model {
            id: 0,
            challenge_id: 1,
            day_number,
            task_order: 1,
            title: format!("Day {day_number}"),
            description: None,
            is_required,
            is_done,
            done_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn progress(current_day: i32) -> Progress {
        Progress {
            status: ChallengeStatus::Active,
            start_date: date(2024, 1, 1),
            duration_days: 7,
            current_day,
            streak_count: 0,
            last_check_date: None,
        }
    }

    #[test]
    fn unlocked_day_counts_from_start() {
        assert_eq!(unlocked_day(date(2024, 1, 1), 7, date(2024, 1, 3)), 3);
        assert_eq!(unlocked_day(date(2024, 1, 1), 7, date(2024, 1, 1)), 1);
    }

    #[test]
    fn unlocked_day_is_clamped_to_cycle() {
        assert_eq!(unlocked_day(date(2024, 1, 10), 7, date(2024, 1, 1)), 1);
        assert_eq!(unlocked_day(date(2024, 1, 1), 7, date(2024, 3, 1)), 7);
    }

    #[test]
    fn unlocked_day_never_decreases_over_time() {
        let start = date(2024, 1, 1);
        let mut previous = 0;
        for offset in -3..20 {
            let day = unlocked_day(start, 7, start + Duration::days(offset));
            assert!(day >= previous);
            assert!((1..=7).contains(&day));
            previous = day;
        }
    }

    #[test]
    fn streak_continues_only_on_consecutive_days() {
        let checked = Some(date(2024, 1, 3));
        assert_eq!(next_streak(checked, 3, date(2024, 1, 4)), 4);
        assert_eq!(next_streak(checked, 3, date(2024, 1, 6)), 1);
        assert_eq!(next_streak(None, 0, date(2024, 1, 6)), 1);
    }

    #[test]
    fn achievement_rate_rounds_to_nearest_percent() {
        assert_eq!(achievement_rate(1, 3), 33);
        assert_eq!(achievement_rate(2, 3), 67);
        assert_eq!(achievement_rate(1, 8), 13);
        assert_eq!(achievement_rate(4, 4), 100);
        assert_eq!(achievement_rate(0, 0), 0);
    }

    #[test]
    fn tallies_ignore_optional_tasks() {
        let tallies = Tallies::from_tasks(&[
            task(1, true, true),
            task(1, false, false),
            task(2, true, false),
        ]);
        assert!(tallies.day(1).is_complete());
        assert!(!tallies.day(2).is_complete());
        assert_eq!(tallies.overall(), TaskTally { required: 2, done: 1 });
        assert!(tallies.day(9).is_complete());
    }

    #[test]
    fn advance_moves_to_next_day() {
        let tallies = Tallies::from_tasks(&[task(3, true, true), task(4, true, false)]);
        let advance = progress(3).advance(date(2024, 1, 3), &tallies);
        assert_eq!(advance.current_day, 4);
        assert_eq!(advance.last_check_date, date(2024, 1, 3));
        assert_eq!(advance.streak_count, 1);
        assert_eq!(advance.achievement_rate, 50);
        assert!(!advance.completed);
    }

    #[test]
    fn advance_on_last_day_completes_when_everything_is_done() {
        let tallies = Tallies::from_tasks(&[task(6, true, true), task(7, true, true)]);
        let advance = progress(7).advance(date(2024, 1, 7), &tallies);
        assert_eq!(advance.current_day, 7);
        assert!(advance.completed);

        let unfinished = Tallies::from_tasks(&[task(6, true, false), task(7, true, true)]);
        assert!(!progress(7).advance(date(2024, 1, 7), &unfinished).completed);
    }

    #[test]
    fn retry_window_opens_after_missed_day() {
        let tallies = Tallies::from_tasks(&[task(2, true, false)]);
        assert!(!progress(2).can_retry(date(2024, 1, 2), &tallies));
        assert!(progress(2).can_retry(date(2024, 1, 3), &tallies));

        let paused = Progress {
            status: ChallengeStatus::Paused,
            ..progress(2)
        };
        assert!(!paused.can_retry(date(2024, 1, 3), &tallies));
    }

    #[test]
    fn retry_opens_once_cycle_ends_with_open_tasks() {
        let tallies = Tallies::from_tasks(&[task(1, true, false), task(7, true, true)]);
        let last_day = Progress {
            streak_count: 6,
            last_check_date: Some(date(2024, 1, 7)),
            ..progress(7)
        };
        assert!(!last_day.can_retry(date(2024, 1, 7), &tallies));
        assert!(last_day.can_retry(date(2024, 1, 8), &tallies));

        let finished = Tallies::from_tasks(&[task(1, true, true), task(7, true, true)]);
        assert!(!last_day.can_retry(date(2024, 1, 8), &finished));
    }

    #[test]
    fn date_for_day_is_offset_from_start() {
        assert_eq!(date_for_day(date(2024, 1, 1), 1).unwrap(), date(2024, 1, 1));
        assert_eq!(date_for_day(date(2024, 1, 30), 3).unwrap(), date(2024, 2, 1));
    }

    #[test]
    fn date_for_day_rejects_dates_past_the_calendar() {
        assert!(matches!(
            date_for_day(date(2024, 1, 1), 200_000_000),
            Err(AppError::InvalidInput(_))
        ));
        assert!(date_for_day(NaiveDate::MAX, 2).is_err());
        assert!(date_for_day(date(2024, 1, 1), 0).is_err());
    }
}

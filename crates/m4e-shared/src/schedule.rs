//! Event schedules and the voting windows derived from them.
//!
//! An event either happens once at a fixed start date or repeats on a set
//! of weekdays at a fixed time of day. Each occurrence `o` has a voting
//! window `[o - voting_lead, o)`. All times are UTC.

use chrono::{DateTime, Datelike, Duration, NaiveTime, Utc, Weekday};
use serde::{Deserialize, Serialize};

/// Set of weekdays, encoded the way the webapp stores it
/// (Monday = 0x01 … Sunday = 0x40).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct Weekdays(pub u8);

impl Weekdays {
    pub const MONDAY: Weekdays = Weekdays(0x01);
    pub const TUESDAY: Weekdays = Weekdays(0x02);
    pub const WEDNESDAY: Weekdays = Weekdays(0x04);
    pub const THURSDAY: Weekdays = Weekdays(0x08);
    pub const FRIDAY: Weekdays = Weekdays(0x10);
    pub const SATURDAY: Weekdays = Weekdays(0x20);
    pub const SUNDAY: Weekdays = Weekdays(0x40);
    pub const ALL: Weekdays = Weekdays(0x7f);

    pub fn empty() -> Self {
        Weekdays(0)
    }

    pub fn is_empty(self) -> bool {
        self.0 & Self::ALL.0 == 0
    }

    pub fn contains(self, day: Weekday) -> bool {
        self.0 & (1 << day.num_days_from_monday()) != 0
    }

    pub fn with(self, day: Weekday) -> Self {
        Weekdays(self.0 | (1 << day.num_days_from_monday()))
    }
}

impl std::ops::BitOr for Weekdays {
    type Output = Weekdays;

    fn bitor(self, rhs: Weekdays) -> Weekdays {
        Weekdays(self.0 | rhs.0)
    }
}

/// Weekly repetition of an event.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct RepeatSchedule {
    pub weekdays: Weekdays,
    pub day_time: NaiveTime,
}

/// Half-open interval `[start, end)` during which members may vote.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct VotingWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl VotingWindow {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, t: DateTime<Utc>) -> bool {
        self.start <= t && t < self.end
    }
}

impl std::fmt::Display for VotingWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {})", self.start.to_rfc3339(), self.end.to_rfc3339())
    }
}

/// When an event takes place and how long before each occurrence voting opens.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct EventSchedule {
    /// Date of a non-repeating event. Ignored when `repeat` is set.
    pub start: DateTime<Utc>,
    pub repeat: Option<RepeatSchedule>,
    /// Voting opens this long before each occurrence.
    #[serde(with = "lead_secs")]
    pub voting_lead: Duration,
}

impl EventSchedule {
    pub fn once(start: DateTime<Utc>, voting_lead: Duration) -> Self {
        Self {
            start,
            repeat: None,
            voting_lead,
        }
    }

    pub fn weekly(weekdays: Weekdays, day_time: NaiveTime, voting_lead: Duration) -> Self {
        Self {
            start: DateTime::<Utc>::default(),
            repeat: Some(RepeatSchedule { weekdays, day_time }),
            voting_lead,
        }
    }

    pub fn is_repeating(&self) -> bool {
        self.repeat.is_some()
    }

    /// The first occurrence strictly after `t`.
    pub fn occurrence_after(&self, t: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self.repeat {
            None => (self.start > t).then_some(self.start),
            Some(repeat) => {
                if repeat.weekdays.is_empty() {
                    return None;
                }
                // A week and a day covers every weekday even when today's
                // occurrence has already passed.
                (0..=7).find_map(|offset| {
                    let date = t.date_naive() + Duration::days(offset);
                    if !repeat.weekdays.contains(date.weekday()) {
                        return None;
                    }
                    let occurrence = date.and_time(repeat.day_time).and_utc();
                    (occurrence > t).then_some(occurrence)
                })
            }
        }
    }

    /// Voting window of the given occurrence.
    pub fn window_for(&self, occurrence: DateTime<Utc>) -> VotingWindow {
        let lead = self.voting_lead.max(Duration::zero());
        VotingWindow::new(occurrence - lead, occurrence)
    }

    /// The window that is open at `t`, or the next one to open.
    pub fn next_window(&self, t: DateTime<Utc>) -> Option<VotingWindow> {
        self.occurrence_after(t).map(|o| self.window_for(o))
    }

    /// The window open at `t`, if any.
    pub fn window_at(&self, t: DateTime<Utc>) -> Option<VotingWindow> {
        self.next_window(t).filter(|w| w.contains(t))
    }

    pub fn is_voting_open(&self, t: DateTime<Utc>) -> bool {
        self.window_at(t).is_some()
    }
}

mod lead_secs {
    use chrono::Duration;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(lead: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_i64(lead.num_seconds())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::seconds(i64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    #[test]
    fn test_weekdays_bits() {
        let days = Weekdays::MONDAY | Weekdays::FRIDAY;
        assert!(days.contains(Weekday::Mon));
        assert!(days.contains(Weekday::Fri));
        assert!(!days.contains(Weekday::Sun));
        assert_eq!(Weekdays::empty().with(Weekday::Sun), Weekdays::SUNDAY);
    }

    #[test]
    fn test_single_occurrence_window() {
        let start = at(2026, 3, 2, 12, 0);
        let schedule = EventSchedule::once(start, Duration::hours(2));

        assert!(!schedule.is_voting_open(at(2026, 3, 2, 9, 59)));
        assert!(schedule.is_voting_open(at(2026, 3, 2, 10, 0)));
        assert!(schedule.is_voting_open(at(2026, 3, 2, 11, 59)));
        assert!(!schedule.is_voting_open(start));
        assert!(schedule.next_window(start).is_none());
    }

    #[test]
    fn test_weekly_occurrences() {
        // 2026-03-02 is a Monday.
        let schedule = EventSchedule::weekly(
            Weekdays::MONDAY | Weekdays::WEDNESDAY,
            NaiveTime::from_hms_opt(12, 30, 0).unwrap(),
            Duration::minutes(90),
        );

        assert_eq!(
            schedule.occurrence_after(at(2026, 3, 2, 8, 0)),
            Some(at(2026, 3, 2, 12, 30))
        );
        assert_eq!(
            schedule.occurrence_after(at(2026, 3, 2, 12, 30)),
            Some(at(2026, 3, 4, 12, 30))
        );
        assert_eq!(
            schedule.occurrence_after(at(2026, 3, 5, 13, 0)),
            Some(at(2026, 3, 9, 12, 30))
        );

        let window = schedule.window_at(at(2026, 3, 4, 11, 15)).unwrap();
        assert_eq!(window.start, at(2026, 3, 4, 11, 0));
        assert_eq!(window.end, at(2026, 3, 4, 12, 30));
        assert!(schedule.window_at(at(2026, 3, 4, 10, 59)).is_none());
    }

    #[test]
    fn test_empty_weekdays_never_open() {
        let schedule = EventSchedule::weekly(
            Weekdays::empty(),
            NaiveTime::from_hms_opt(12, 0, 0).unwrap(),
            Duration::hours(1),
        );
        assert!(schedule.occurrence_after(at(2026, 3, 2, 11, 30)).is_none());
        assert!(!schedule.is_voting_open(at(2026, 3, 2, 11, 30)));
    }
}

use std::fmt;
use std::str::FromStr;

use cadence_core::Node;
use chrono::{DateTime, Datelike, NaiveTime, TimeDelta, Timelike, Utc, Weekday};

use crate::error::{Result, SchedulerError};

/// Slack applied when searching for the next weekday occurrence. A candidate
/// earlier than `now + WEEKDAY_GUARD_MS` is skipped, so a job that just fired
/// at its own instant is pushed to the following week instead of re-firing.
pub const WEEKDAY_GUARD_MS: i64 = 250;

/// Entity counted by an interval repetition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IntervalUnit {
    Seconds,
    Minutes,
    Hours,
    Days,
}

impl IntervalUnit {
    pub fn as_str(self) -> &'static str {
        match self {
            IntervalUnit::Seconds => "seconds",
            IntervalUnit::Minutes => "minutes",
            IntervalUnit::Hours => "hours",
            IntervalUnit::Days => "days",
        }
    }

    /// Exact length in seconds; days are 24h of elapsed time, no calendar rules.
    fn seconds(self) -> i64 {
        match self {
            IntervalUnit::Seconds => 1,
            IntervalUnit::Minutes => 60,
            IntervalUnit::Hours => 3_600,
            IntervalUnit::Days => 86_400,
        }
    }
}

impl fmt::Display for IntervalUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IntervalUnit {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "seconds" => Ok(IntervalUnit::Seconds),
            "minutes" => Ok(IntervalUnit::Minutes),
            "hours" => Ok(IntervalUnit::Hours),
            "days" => Ok(IntervalUnit::Days),
            other => Err(SchedulerError::InvalidArgument(format!(
                "unknown interval unit: {other}"
            ))),
        }
    }
}

/// Repeat every `count` units, measured from the moment the due date is
/// recomputed (not from the previous due date).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntervalRepetition {
    unit: IntervalUnit,
    count: i64,
    period: TimeDelta,
}

impl IntervalRepetition {
    pub fn new(unit: IntervalUnit, count: i64) -> Result<Self> {
        if count < 1 {
            return Err(SchedulerError::InvalidArgument(format!(
                "repetition count must be a positive integer, got {count}"
            )));
        }
        let period = count
            .checked_mul(unit.seconds())
            .and_then(TimeDelta::try_seconds)
            .ok_or_else(|| {
                SchedulerError::InvalidArgument(format!("interval of {count} {unit} is too large"))
            })?;
        Ok(Self {
            unit,
            count,
            period,
        })
    }

    pub fn unit(&self) -> IntervalUnit {
        self.unit
    }

    pub fn count(&self) -> i64 {
        self.count
    }

    pub fn next_due(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now.checked_add_signed(self.period)
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

/// Repeat weekly on `day` at `time` (UTC).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WeekdayRepetition {
    day: Weekday,
    time: NaiveTime,
}

impl WeekdayRepetition {
    pub fn new(day: Weekday, hour: u32, minute: u32) -> Result<Self> {
        if hour > 23 || minute > 59 {
            return Err(SchedulerError::InvalidArgument(format!(
                "time of day out of range: {hour:02}:{minute:02}"
            )));
        }
        let time = NaiveTime::from_hms_opt(hour, minute, 0).ok_or_else(|| {
            SchedulerError::InvalidArgument(format!("invalid time of day {hour}:{minute}"))
        })?;
        Ok(Self { day, time })
    }

    pub fn day(&self) -> Weekday {
        self.day
    }

    pub fn hour(&self) -> u32 {
        self.time.hour()
    }

    pub fn minute(&self) -> u32 {
        self.time.minute()
    }

    /// First instant on `day` at `time` that is not earlier than
    /// `now + WEEKDAY_GUARD_MS`.
    pub fn next_due(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let earliest = now + TimeDelta::milliseconds(WEEKDAY_GUARD_MS);
        let mut candidate = now.date_naive().and_time(self.time).and_utc();

        // Today plus seven more days always contains a match.
        for _ in 0..=7 {
            if candidate >= earliest && candidate.weekday() == self.day {
                return candidate;
            }
            candidate += TimeDelta::days(1);
        }
        unreachable!(
            "no {} {} found within eight days of {now}",
            weekday_name(self.day),
            self.time
        )
    }
}

/// How a job's next due date is derived after each run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Repetition {
    Interval(IntervalRepetition),
    Weekday(WeekdayRepetition),
}

impl Repetition {
    pub fn every(unit: IntervalUnit, count: i64) -> Result<Self> {
        IntervalRepetition::new(unit, count).map(Repetition::Interval)
    }

    pub fn weekly(day: Weekday, hour: u32, minute: u32) -> Result<Self> {
        WeekdayRepetition::new(day, hour, minute).map(Repetition::Weekday)
    }

    pub fn next_due(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            Repetition::Interval(r) => r.next_due(now),
            Repetition::Weekday(r) => r.next_due(now),
        }
    }

    /// The `repeat` node: policy identifier as value, parameters as child.
    pub fn to_node(&self) -> Node {
        match self {
            Repetition::Interval(r) => Node::new("repeat")
                .with_value(r.unit.as_str())
                .with_children([Node::new("value").with_value(r.count)]),
            Repetition::Weekday(r) => Node::new("repeat")
                .with_value(weekday_name(r.day))
                .with_children([Node::new("time")
                    .with_value(format!("{:02}:{:02}", r.hour(), r.minute()))]),
        }
    }

    /// Parse a `repeat` node belonging to job `job`.
    pub fn from_node(repeat: &Node, job: &str) -> Result<Self> {
        let policy = repeat
            .text()
            .ok_or_else(|| SchedulerError::malformed(job, "repeat node carries no policy"))?;

        if let Ok(unit) = policy.parse::<IntervalUnit>() {
            let count = repeat
                .child("value")
                .and_then(Node::integer)
                .ok_or_else(|| SchedulerError::malformed(job, "interval repeat without value"))?;
            return Repetition::every(unit, count)
                .map_err(|e| SchedulerError::malformed(job, e.to_string()));
        }

        if let Ok(day) = policy.trim().parse::<Weekday>() {
            let time = repeat
                .child("time")
                .and_then(Node::text)
                .ok_or_else(|| SchedulerError::malformed(job, "weekday repeat without time"))?;
            let (hour, minute) = parse_time_of_day(time).ok_or_else(|| {
                SchedulerError::malformed(job, format!("time '{time}' is not HH:MM"))
            })?;
            return Repetition::weekly(day, hour, minute)
                .map_err(|e| SchedulerError::malformed(job, e.to_string()));
        }

        Err(SchedulerError::malformed(
            job,
            format!("unknown repetition policy '{policy}'"),
        ))
    }
}

impl fmt::Display for Repetition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Repetition::Interval(r) if r.count == 1 => {
                write!(f, "every 1 {}", r.unit.as_str().trim_end_matches('s'))
            }
            Repetition::Interval(r) => write!(f, "every {} {}", r.count, r.unit),
            Repetition::Weekday(r) => write!(
                f,
                "{} at {:02}:{:02} UTC",
                weekday_name(r.day),
                r.hour(),
                r.minute()
            ),
        }
    }
}

pub fn weekday_name(day: Weekday) -> &'static str {
    match day {
        Weekday::Mon => "Monday",
        Weekday::Tue => "Tuesday",
        Weekday::Wed => "Wednesday",
        Weekday::Thu => "Thursday",
        Weekday::Fri => "Friday",
        Weekday::Sat => "Saturday",
        Weekday::Sun => "Sunday",
    }
}

/// Parse `HH:MM` (single-digit hours accepted). Range checks happen in
/// [`WeekdayRepetition::new`].
pub fn parse_time_of_day(s: &str) -> Option<(u32, u32)> {
    let (hour, minute) = s.trim().split_once(':')?;
    Some((hour.parse().ok()?, minute.parse().ok()?))
}

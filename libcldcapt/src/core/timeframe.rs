use chrono::{DateTime, Datelike, Duration, LocalResult, NaiveDate, NaiveDateTime, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

/// Calendar granularities a preservation policy can name, ordered
/// coarsest-first.
#[derive(
    Serialize, Deserialize, Display, EnumString, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Timeframe {
    Years,
    Quarters,
    Months,
    Weeks,
    Days,
    Hours,
    Minutes,
    Seconds,
}

/// Identity of one interval at a timeframe. Two instants share an interval
/// iff their buckets compare equal. Weeks follow ISO-8601 (Monday 00:00) and
/// carry the ISO week-year, which can differ from the calendar year at year
/// boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Bucket {
    Year { year: i32 },
    Quarter { year: i32, quarter: u32 },
    Month { year: i32, month: u32 },
    Week { year: i32, week: u32 },
    Day { year: i32, ordinal: u32 },
    Hour { year: i32, ordinal: u32, hour: u32 },
    Minute { year: i32, ordinal: u32, hour: u32, minute: u32 },
    Second { year: i32, ordinal: u32, hour: u32, minute: u32, second: u32 },
}

impl Timeframe {
    /// The bucket containing `instant`, evaluated on the wall clock of `tz`.
    pub fn bucket(self, instant: DateTime<Utc>, tz: Tz) -> Bucket {
        let local = instant.with_timezone(&tz);
        match self {
            Timeframe::Years => Bucket::Year { year: local.year() },
            Timeframe::Quarters => Bucket::Quarter {
                year: local.year(),
                quarter: local.month0() / 3 + 1,
            },
            Timeframe::Months => Bucket::Month {
                year: local.year(),
                month: local.month(),
            },
            Timeframe::Weeks => {
                let week = local.iso_week();
                Bucket::Week {
                    year: week.year(),
                    week: week.week(),
                }
            }
            Timeframe::Days => Bucket::Day {
                year: local.year(),
                ordinal: local.ordinal(),
            },
            Timeframe::Hours => Bucket::Hour {
                year: local.year(),
                ordinal: local.ordinal(),
                hour: local.hour(),
            },
            Timeframe::Minutes => Bucket::Minute {
                year: local.year(),
                ordinal: local.ordinal(),
                hour: local.hour(),
                minute: local.minute(),
            },
            Timeframe::Seconds => Bucket::Second {
                year: local.year(),
                ordinal: local.ordinal(),
                hour: local.hour(),
                minute: local.minute(),
                second: local.second(),
            },
        }
    }

    /// The `count` most recent buckets ending at the one containing `now`,
    /// oldest first.
    pub fn enumerate(self, now: DateTime<Utc>, count: u32, tz: Tz) -> Vec<Bucket> {
        let mut buckets = Vec::with_capacity(count as usize);
        let mut cursor = now;
        for _ in 0..count {
            buckets.push(self.bucket(cursor, tz));
            cursor = self.bucket_start(cursor, tz) - Duration::seconds(1);
        }
        buckets.reverse();
        buckets
    }

    /// First instant of the bucket containing `instant`. A wall-clock bucket
    /// start that falls into a DST gap resolves to the first valid instant
    /// after the gap.
    pub fn bucket_start(self, instant: DateTime<Utc>, tz: Tz) -> DateTime<Utc> {
        let local = instant.with_timezone(&tz).naive_local();
        let date = local.date();
        let start = match self {
            Timeframe::Years => first_of_month(date.year(), 1),
            Timeframe::Quarters => first_of_month(date.year(), date.month0() / 3 * 3 + 1),
            Timeframe::Months => first_of_month(date.year(), date.month()),
            Timeframe::Weeks => (date - Duration::days(i64::from(date.weekday().num_days_from_monday())))
                .and_hms(0, 0, 0),
            Timeframe::Days => date.and_hms(0, 0, 0),
            Timeframe::Hours => date.and_hms(local.hour(), 0, 0),
            Timeframe::Minutes => date.and_hms(local.hour(), local.minute(), 0),
            Timeframe::Seconds => date.and_hms(local.hour(), local.minute(), local.second()),
        };
        resolve_local(tz, start)
    }
}

fn first_of_month(year: i32, month: u32) -> NaiveDateTime {
    NaiveDate::from_ymd(year, month, 1).and_hms(0, 0, 0)
}

fn resolve_local(tz: Tz, wall: NaiveDateTime) -> DateTime<Utc> {
    let mut wall = wall;
    for _ in 0..16 {
        match tz.from_local_datetime(&wall) {
            LocalResult::Single(t) => return t.with_timezone(&Utc),
            // Overlapping wall-clock times take the earlier instant.
            LocalResult::Ambiguous(earlier, _) => return earlier.with_timezone(&Utc),
            LocalResult::None => wall += Duration::minutes(15),
        }
    }
    // No real zone skips more than four hours; treat the residue as UTC.
    Utc.from_utc_datetime(&wall)
}

//! Calendar bucketing for time-series queries.
//!
//! Both the generated (empty) buckets and the buckets that real rows fall into are computed
//! with [`truncate`], so the two sides of a gap-filled series always line up.

use crate::error::QueryError;
use chrono::{
    DateTime, Datelike, Days, Duration, FixedOffset, LocalResult, Months, NaiveDate,
    NaiveDateTime, Offset, TimeZone, Timelike, Utc,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

const GAP_SEARCH_MINUTES: i64 = 180;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Interval {
    Hour,
    Day,
    Week,
    Month,
}

impl Interval {
    pub fn as_str(self) -> &'static str {
        match self {
            Interval::Hour => "hour",
            Interval::Day => "day",
            Interval::Week => "week",
            Interval::Month => "month",
        }
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Interval {
    type Err = QueryError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "hour" => Ok(Interval::Hour),
            "day" => Ok(Interval::Day),
            "week" => Ok(Interval::Week),
            "month" => Ok(Interval::Month),
            _ => Err(QueryError::InvalidInterval(raw.to_string())),
        }
    }
}

pub fn parse_timezone(raw: &str) -> Result<chrono_tz::Tz, QueryError> {
    raw.trim()
        .parse::<chrono_tz::Tz>()
        .map_err(|_| QueryError::InvalidTimezone(raw.to_string()))
}

/// Rounds `ts` down to the start of its containing interval in `tz`.
///
/// Weeks start on Monday. Ambiguous local starts keep the UTC offset of `ts` when possible;
/// nonexistent local starts move forward to the next valid local time.
pub fn truncate<Tz: TimeZone>(ts: DateTime<Utc>, interval: Interval, tz: &Tz) -> DateTime<Utc> {
    let local = ts.with_timezone(tz);
    let offset = local.offset().fix();
    let naive = local.naive_local();
    let date = naive.date();
    let start = match interval {
        Interval::Hour => date.and_hms_opt(naive.hour(), 0, 0),
        Interval::Day => date.and_hms_opt(0, 0, 0),
        Interval::Week => date
            .checked_sub_days(Days::new(u64::from(date.weekday().num_days_from_monday())))
            .and_then(|monday| monday.and_hms_opt(0, 0, 0)),
        Interval::Month => date.with_day(1).and_then(|first| first.and_hms_opt(0, 0, 0)),
    };
    match start {
        Some(start) => resolve_local(tz, start, Some(offset)),
        None => ts,
    }
}

/// Moves `ts` forward by one calendar interval in `tz`. Month steps clamp to the end of the
/// target month.
fn add_interval<Tz: TimeZone>(ts: DateTime<Utc>, interval: Interval, tz: &Tz) -> DateTime<Utc> {
    let local = ts.with_timezone(tz);
    let offset = local.offset().fix();
    let naive = local.naive_local();
    let shifted = match interval {
        Interval::Hour => return ts + Duration::hours(1),
        Interval::Day => naive.checked_add_days(Days::new(1)),
        Interval::Week => naive.checked_add_days(Days::new(7)),
        Interval::Month => naive.checked_add_months(Months::new(1)),
    };
    match shifted {
        Some(shifted) => resolve_local(tz, shifted, Some(offset)),
        None => ts,
    }
}

fn next_bucket<Tz: TimeZone>(start: DateTime<Utc>, interval: Interval, tz: &Tz) -> DateTime<Utc> {
    // Step from the local calendar date so a bucket that opened late (midnight inside a DST
    // gap) still advances to the following calendar boundary.
    let date = start.with_timezone(tz).date_naive();
    let next_date: Option<NaiveDate> = match interval {
        Interval::Hour => return truncate(start + Duration::hours(1), interval, tz),
        Interval::Day => date.checked_add_days(Days::new(1)),
        Interval::Week => date.checked_add_days(Days::new(7)),
        Interval::Month => date
            .with_day(1)
            .and_then(|first| first.checked_add_months(Months::new(1))),
    };
    match next_date.and_then(|d| d.and_hms_opt(0, 0, 0)) {
        Some(naive) => truncate(resolve_local(tz, naive, None), interval, tz),
        None => start,
    }
}

fn resolve_local<Tz: TimeZone>(
    tz: &Tz,
    naive: NaiveDateTime,
    preferred: Option<FixedOffset>,
) -> DateTime<Utc> {
    match tz.from_local_datetime(&naive) {
        LocalResult::Single(dt) => dt.with_timezone(&Utc),
        LocalResult::Ambiguous(a, b) => {
            let a_utc = a.with_timezone(&Utc);
            let b_utc = b.with_timezone(&Utc);
            match preferred {
                Some(offset) if a.offset().fix() == offset => a_utc,
                Some(offset) if b.offset().fix() == offset => b_utc,
                _ => a_utc.min(b_utc),
            }
        }
        LocalResult::None => match find_next_valid_local(tz, naive) {
            Some(dt) => dt.with_timezone(&Utc),
            None => {
                let offset = preferred.unwrap_or_else(|| Utc.fix());
                (naive - Duration::seconds(i64::from(offset.local_minus_utc()))).and_utc()
            }
        },
    }
}

fn find_next_valid_local<Tz: TimeZone>(tz: &Tz, naive: NaiveDateTime) -> Option<DateTime<Tz>> {
    for minutes in 1..=GAP_SEARCH_MINUTES {
        let candidate = naive + Duration::minutes(minutes);
        match tz.from_local_datetime(&candidate) {
            LocalResult::Single(dt) => return Some(dt),
            LocalResult::Ambiguous(a, b) => {
                return Some(if a.with_timezone(&Utc) <= b.with_timezone(&Utc) {
                    a
                } else {
                    b
                })
            }
            LocalResult::None => continue,
        }
    }
    None
}

/// Lazy, restartable sequence of bucket starts. Clone it to iterate again.
#[derive(Clone)]
pub struct BucketIter<Tz: TimeZone> {
    cursor: Option<DateTime<Utc>>,
    end: DateTime<Utc>,
    interval: Interval,
    tz: Tz,
}

impl<Tz: TimeZone> Iterator for BucketIter<Tz> {
    type Item = DateTime<Utc>;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.cursor?;
        if current >= self.end {
            self.cursor = None;
            return None;
        }
        let next = next_bucket(current, self.interval, &self.tz);
        self.cursor = (next > current).then_some(next);
        Some(current)
    }
}

/// Buckets from `truncate(date_from)` inclusive to `truncate(date_to + interval)` exclusive.
pub fn bucket_range<Tz: TimeZone>(
    interval: Interval,
    date_from: DateTime<Utc>,
    date_to: DateTime<Utc>,
    tz: &Tz,
) -> BucketIter<Tz> {
    let start = truncate(date_from, interval, tz);
    let end = truncate(add_interval(date_to, interval, tz), interval, tz);
    BucketIter {
        cursor: (date_from <= date_to).then_some(start),
        end,
        interval,
        tz: tz.clone(),
    }
}

pub fn generate_buckets<Tz: TimeZone>(
    interval: Interval,
    date_from: DateTime<Utc>,
    date_to: DateTime<Utc>,
    tz: &Tz,
) -> Vec<DateTime<Utc>> {
    bucket_range(interval, date_from, date_to, tz).collect()
}

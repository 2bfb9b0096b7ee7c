//! Fixed calendar periods over which quotas are counted.
//!
//! Every period is computed in UTC. The period key (`YYYY-MM-DD` for daily
//! plans, `YYYY-MM` for monthly plans) namespaces the counters, so crossing a
//! boundary needs no explicit reset: the next request simply lands on a new key.

use std::time::Duration;

use chrono::{DateTime, Datelike, Days, Months, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, ErrorDetails};

const DAILY_KEY_FORMAT: &str = "%Y-%m-%d";
const MONTHLY_KEY_FORMAT: &str = "%Y-%m";

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum PeriodKind {
    Daily,
    Monthly,
}

/// A concrete period: its key plus the half-open interval `[start, end)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Period {
    pub kind: PeriodKind,
    pub key: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl Period {
    /// The period of the given kind that contains `now`.
    pub fn containing(kind: PeriodKind, now: DateTime<Utc>) -> Self {
        let today = now.date_naive();
        match kind {
            PeriodKind::Daily => Self::daily(today),
            PeriodKind::Monthly => {
                let first = today - Days::new(u64::from(today.day0()));
                Self::monthly(first)
            }
        }
    }

    /// The period immediately following this one.
    pub fn next(&self) -> Self {
        Self::containing(self.kind, self.end)
    }

    /// Parse a stored period key back into a period.
    pub fn from_key(kind: PeriodKind, key: &str) -> Result<Self, Error> {
        let invalid = || {
            Error::new(ErrorDetails::InvalidPeriodKey {
                key: key.to_string(),
            })
        };
        let date = match kind {
            PeriodKind::Daily => NaiveDate::parse_from_str(key, DAILY_KEY_FORMAT),
            PeriodKind::Monthly => NaiveDate::parse_from_str(&format!("{key}-01"), DAILY_KEY_FORMAT),
        }
        .map_err(|_| invalid())?;
        let period = match kind {
            PeriodKind::Daily => Self::daily(date),
            PeriodKind::Monthly => Self::monthly(date),
        };
        // Rejects non-canonical spellings such as `2024-1-5`.
        if period.key != key {
            return Err(invalid());
        }
        Ok(period)
    }

    /// Infer the kind from the shape of the key and parse it.
    pub fn parse_key(key: &str) -> Result<Self, Error> {
        match key.len() {
            10 => Self::from_key(PeriodKind::Daily, key),
            7 => Self::from_key(PeriodKind::Monthly, key),
            _ => Err(Error::new(ErrorDetails::InvalidPeriodKey {
                key: key.to_string(),
            })),
        }
    }

    pub fn contains(&self, instant: DateTime<Utc>) -> bool {
        self.start <= instant && instant < self.end
    }

    /// Time until this period ends, never less than one second.
    pub fn retry_after(&self, now: DateTime<Utc>) -> Duration {
        let remaining = (self.end - now).num_seconds().max(1);
        Duration::from_secs(remaining.unsigned_abs())
    }

    fn daily(date: NaiveDate) -> Self {
        let start = date.and_time(NaiveTime::MIN).and_utc();
        let end = (date + Days::new(1)).and_time(NaiveTime::MIN).and_utc();
        Self {
            kind: PeriodKind::Daily,
            key: date.format(DAILY_KEY_FORMAT).to_string(),
            start,
            end,
        }
    }

    fn monthly(first_of_month: NaiveDate) -> Self {
        let start = first_of_month.and_time(NaiveTime::MIN).and_utc();
        let end = (first_of_month + Months::new(1))
            .and_time(NaiveTime::MIN)
            .and_utc();
        Self {
            kind: PeriodKind::Monthly,
            key: first_of_month.format(MONTHLY_KEY_FORMAT).to_string(),
            start,
            end,
        }
    }
}

/// The next midnight UTC strictly after `now`. Every daily and monthly period
/// boundary falls on one.
pub fn next_boundary(now: DateTime<Utc>) -> DateTime<Utc> {
    Period::containing(PeriodKind::Daily, now).end
}

//! Date helpers: academic-year labels and the inclusive duration rule.

use std::fmt;
use std::str::FromStr;

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::ParseError;

pub const DATE_FORMAT: &str = "%Y-%m-%d";

/// Month (1-based) on which a new academic year starts.
pub const ACADEMIC_YEAR_START_MONTH: u32 = 6;

/// Parse a stored `yyyy-mm-dd` date. A trailing time part (`2024-01-10T09:00`) is ignored.
pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    if let Ok(date) = NaiveDate::parse_from_str(raw, DATE_FORMAT) {
        return Some(date);
    }
    match raw.as_bytes().get(10) {
        Some(b'T') | Some(b' ') => NaiveDate::parse_from_str(raw.get(..10)?, DATE_FORMAT).ok(),
        _ => None,
    }
}

pub fn academic_year_of(date: NaiveDate) -> String {
    let year = date.year();
    if date.month() >= ACADEMIC_YEAR_START_MONTH {
        format!("{}-{}", year, year + 1)
    } else {
        format!("{}-{}", year - 1, year)
    }
}

/// `"YYYY-YYYY"` label for the June-to-May year containing `date`.
pub fn academic_year(date: Option<&str>) -> Option<String> {
    date.and_then(parse_date).map(academic_year_of)
}

/// Inclusive day count between two stored dates; `None` when either is missing or unparseable.
pub fn duration_days(from: Option<&str>, to: Option<&str>) -> Option<i64> {
    let from = parse_date(from?)?;
    let to = parse_date(to?)?;
    Some((to - from).num_days().abs() + 1)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DurationBucket {
    #[serde(rename = "1")]
    SingleDay,
    #[serde(rename = "2-7")]
    UpToWeek,
    #[serde(rename = "8-30")]
    UpToMonth,
    #[serde(rename = "31+")]
    Longer,
}

impl DurationBucket {
    pub fn label(self) -> &'static str {
        match self {
            DurationBucket::SingleDay => "1",
            DurationBucket::UpToWeek => "2-7",
            DurationBucket::UpToMonth => "8-30",
            DurationBucket::Longer => "31+",
        }
    }

    pub fn contains(self, days: i64) -> bool {
        match self {
            DurationBucket::SingleDay => days == 1,
            DurationBucket::UpToWeek => (2..=7).contains(&days),
            DurationBucket::UpToMonth => (8..=30).contains(&days),
            DurationBucket::Longer => days > 30,
        }
    }

    /// An event without a computable duration never falls into any bucket.
    pub fn matches(self, days: Option<i64>) -> bool {
        days.is_some_and(|d| self.contains(d))
    }
}

impl fmt::Display for DurationBucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for DurationBucket {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "1" => Ok(DurationBucket::SingleDay),
            "2-7" => Ok(DurationBucket::UpToWeek),
            "8-30" => Ok(DurationBucket::UpToMonth),
            // A bare `+` in a query string decodes to a space, leaving `31`.
            "31+" | "31" | "31plus" => Ok(DurationBucket::Longer),
            other => Err(ParseError::DurationBucket(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn academic_year_splits_on_june() {
        assert_eq!(academic_year(Some("2024-01-10")).as_deref(), Some("2023-2024"));
        assert_eq!(academic_year(Some("2024-05-31")).as_deref(), Some("2023-2024"));
        assert_eq!(academic_year(Some("2024-06-01")).as_deref(), Some("2024-2025"));
        assert_eq!(academic_year(Some("2024-12-31")).as_deref(), Some("2024-2025"));
        assert_eq!(academic_year(None), None);
        assert_eq!(academic_year(Some("")), None);
        assert_eq!(academic_year(Some("next tuesday")), None);
    }

    #[test]
    fn academic_year_holds_for_every_month() {
        for month in 1..=12 {
            let date = NaiveDate::from_ymd_opt(2030, month, 15).unwrap();
            let expected = if month < 6 { "2029-2030" } else { "2030-2031" };
            assert_eq!(academic_year_of(date), expected, "month {month}");
        }
    }

    #[test]
    fn parse_date_ignores_time_suffix() {
        assert_eq!(parse_date("2024-01-10T09:30:00Z"), NaiveDate::from_ymd_opt(2024, 1, 10));
        assert_eq!(parse_date(" 2024-01-10 "), NaiveDate::from_ymd_opt(2024, 1, 10));
        assert_eq!(parse_date("10/01/2024"), None);
    }

    #[test]
    fn duration_is_inclusive_and_order_insensitive() {
        assert_eq!(duration_days(Some("2024-01-10"), Some("2024-01-10")), Some(1));
        assert_eq!(duration_days(Some("2024-01-10"), Some("2024-01-12")), Some(3));
        assert_eq!(duration_days(Some("2024-01-12"), Some("2024-01-10")), Some(3));
        assert_eq!(duration_days(Some("2024-02-28"), Some("2024-03-01")), Some(3));
        assert_eq!(duration_days(None, Some("2024-01-10")), None);
        assert_eq!(duration_days(Some("2024-01-10"), Some("soon")), None);
    }

    #[test]
    fn duration_never_drops_below_one() {
        let start = NaiveDate::from_ymd_opt(2023, 12, 20).unwrap();
        for offset in 0..60 {
            let end = start + chrono::Duration::days(offset);
            let from = start.format(DATE_FORMAT).to_string();
            let to = end.format(DATE_FORMAT).to_string();
            let days = duration_days(Some(&from), Some(&to)).unwrap();
            assert_eq!(days, offset + 1);
            assert!(days >= 1);
        }
    }

    #[test]
    fn buckets_partition_durations() {
        assert!(DurationBucket::SingleDay.contains(1));
        assert!(DurationBucket::UpToWeek.contains(2));
        assert!(DurationBucket::UpToWeek.contains(7));
        assert!(DurationBucket::UpToMonth.contains(8));
        assert!(DurationBucket::UpToMonth.contains(30));
        assert!(DurationBucket::Longer.contains(31));
        assert!(!DurationBucket::Longer.matches(None));
        assert_eq!("2-7".parse::<DurationBucket>().unwrap(), DurationBucket::UpToWeek);
        assert!("7+".parse::<DurationBucket>().is_err());
    }

    #[test]
    fn long_bucket_accepts_query_friendly_spellings() {
        for raw in ["31+", "31 ", "31", "31plus"] {
            assert_eq!(raw.parse::<DurationBucket>(), Ok(DurationBucket::Longer), "{raw:?}");
        }
        assert!("32".parse::<DurationBucket>().is_err());
    }
}

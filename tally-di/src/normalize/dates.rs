//! Date resolution under rule-set conventions
//!
//! Raw date strings are ambiguous on their own: 01/02/2024 is January 2nd
//! or February 1st depending on locale. The rule-set's date order decides;
//! this module only mechanically applies it.

use crate::models::DateOrder;
use chrono::NaiveDate;

const SEPARATORS: [char; 3] = ['/', '-', '.'];

/// Parse a raw date string under the given component order.
///
/// Accepts `/`, `-`, or `.` as separator (consistently within one value).
/// Two-digit years are expanded into 2000-2099.
pub fn parse_date(raw: &str, order: DateOrder) -> Result<NaiveDate, String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err("empty date".to_string());
    }

    let separator = SEPARATORS
        .iter()
        .copied()
        .find(|sep| trimmed.contains(*sep))
        .ok_or_else(|| format!("no recognized separator in {:?}", trimmed))?;

    let parts: Vec<&str> = trimmed.split(separator).collect();
    if parts.len() != 3 {
        return Err(format!(
            "expected 3 date components, found {} in {:?}",
            parts.len(),
            trimmed
        ));
    }

    let numbers: Vec<i64> = parts
        .iter()
        .map(|part| {
            part.parse::<i64>()
                .map_err(|_| format!("non-numeric date component {:?}", part))
        })
        .collect::<Result<_, _>>()?;

    let (year, month, day) = match order {
        DateOrder::MonthDayYear => (numbers[2], numbers[0], numbers[1]),
        DateOrder::DayMonthYear => (numbers[2], numbers[1], numbers[0]),
        DateOrder::YearMonthDay => (numbers[0], numbers[1], numbers[2]),
    };

    let year = expand_year(year)?;
    let month = u32::try_from(month).map_err(|_| format!("month out of range in {:?}", trimmed))?;
    let day = u32::try_from(day).map_err(|_| format!("day out of range in {:?}", trimmed))?;

    NaiveDate::from_ymd_opt(year, month, day)
        .ok_or_else(|| format!("no such calendar date: {:?}", trimmed))
}

fn expand_year(year: i64) -> Result<i32, String> {
    let expanded = if (0..100).contains(&year) {
        2000 + year
    } else {
        year
    };
    i32::try_from(expanded).map_err(|_| format!("year out of range: {}", year))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn order_decides_ambiguous_dates() {
        assert_eq!(
            parse_date("01/02/2024", DateOrder::MonthDayYear).unwrap(),
            date(2024, 1, 2)
        );
        assert_eq!(
            parse_date("01/02/2024", DateOrder::DayMonthYear).unwrap(),
            date(2024, 2, 1)
        );
        assert_eq!(
            parse_date("2024-01-02", DateOrder::YearMonthDay).unwrap(),
            date(2024, 1, 2)
        );
    }

    #[test]
    fn dot_separator_and_short_year() {
        assert_eq!(
            parse_date("31.12.24", DateOrder::DayMonthYear).unwrap(),
            date(2024, 12, 31)
        );
    }

    #[test]
    fn impossible_dates_are_rejected() {
        assert!(parse_date("13/13/2024", DateOrder::MonthDayYear).is_err());
        assert!(parse_date("02/30/2024", DateOrder::MonthDayYear).is_err());
        assert!(parse_date("01/02", DateOrder::MonthDayYear).is_err());
        assert!(parse_date("next tuesday", DateOrder::MonthDayYear).is_err());
        assert!(parse_date("", DateOrder::MonthDayYear).is_err());
    }

    #[test]
    fn leap_day_valid_only_in_leap_years() {
        assert!(parse_date("02/29/2024", DateOrder::MonthDayYear).is_ok());
        assert!(parse_date("02/29/2023", DateOrder::MonthDayYear).is_err());
    }
}

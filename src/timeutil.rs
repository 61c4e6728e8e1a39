//! CDX timestamp handling
//!
//! CDX services identify points in time with fixed-width, lexically sortable
//! 14-digit UTC strings (`YYYYMMDDhhmmss`). Callers may supply any digit
//! prefix of one; these helpers pad prefixes, convert between timestamps and
//! unix times, and decode the publish window encoded in a Common Crawl
//! index name.

use chrono::{Datelike, Duration, NaiveDate, NaiveDateTime, TimeZone, Utc};

use crate::{CdxError, Result};

const TIMESTAMP_FMT: &str = "%Y%m%d%H%M%S";
const TIMESTAMP_LOW: &str = "19780101000000";
const TIMESTAMP_HIGH: &str = "29991231235959";

/// Days in each month, indexed 1-12. February stays 28 even in leap years;
/// padding a month up to the 28th is close enough for range selection.
const DAYS_IN_MONTH: [u32; 13] = [0, 31, 28, 31, 30, 31, 30, 31, 31, 30, 31, 30, 31];

/// Pads a timestamp prefix down to the earliest instant it covers.
///
/// # Examples
///
/// ```
/// assert_eq!(cdxfetch::timeutil::pad_timestamp("1998"), "19980101000000");
/// ```
pub fn pad_timestamp(ts: &str) -> String {
    format!("{}{}", ts, &TIMESTAMP_LOW[ts.len().min(14)..])
}

/// Pads a timestamp prefix up to the latest instant it covers.
///
/// # Examples
///
/// ```
/// assert_eq!(cdxfetch::timeutil::pad_timestamp_up("199802"), "19980228235959");
/// ```
pub fn pad_timestamp_up(ts: &str) -> String {
    let mut padded = format!("{}{}", ts, &TIMESTAMP_HIGH[ts.len().min(14)..]);
    let month: usize = padded[4..6].parse().unwrap_or(12);
    let day = DAYS_IN_MONTH[month.clamp(1, 12)];
    padded.replace_range(6..8, &format!("{:02}", day));
    padded
}

/// Converts a timestamp (or prefix) to a unix time in seconds.
pub fn timestamp_to_time(ts: &str) -> Result<i64> {
    validate_timestamp(ts)?;
    let padded = pad_timestamp(ts);
    let naive = NaiveDateTime::parse_from_str(&padded, TIMESTAMP_FMT)
        .map_err(|_| CdxError::Timestamp(ts.to_string()))?;
    Ok(Utc.from_utc_datetime(&naive).timestamp())
}

/// Converts a unix time in seconds to a full 14-digit timestamp.
pub fn time_to_timestamp(t: i64) -> String {
    match Utc.timestamp_opt(t, 0) {
        chrono::LocalResult::Single(dt) => dt.format(TIMESTAMP_FMT).to_string(),
        _ => TIMESTAMP_LOW.to_string(),
    }
}

/// Checks that a user-supplied timestamp is a plausible digit string.
pub fn validate_timestamp(ts: &str) -> Result<()> {
    if ts.is_empty() || ts.len() > 14 || !ts.bytes().all(|b| b.is_ascii_digit()) {
        return Err(CdxError::Timestamp(ts.to_string()));
    }
    // The web was born in 1989; a value in this window is probably a unix
    // time pasted in by mistake.
    if let Ok(n) = ts.parse::<i64>() {
        if ts.len() >= 9 && (605_664_000..1_989_031_200).contains(&n) && ts.len() != 14 {
            return Err(CdxError::Timestamp(format!(
                "{} looks like a unix time, cdx timestamp would be {}",
                ts,
                time_to_timestamp(n)
            )));
        }
    }
    Ok(())
}

/// Decodes a Common Crawl index name like `CC-MAIN-2018-02` into the unix
/// time its data runs up to. The year-week part is `YYYY-WW` where `WW` is a
/// Monday-start week number and the window ends on that week's Sunday.
pub fn cc_index_to_time(year: i32, week: u32) -> Option<i64> {
    let jan1 = NaiveDate::from_ymd_opt(year, 1, 1)?;
    let to_first_monday = (8 - jan1.weekday().number_from_monday()) % 7;
    let first_monday = jan1 + Duration::days(i64::from(to_first_monday));
    let monday = first_monday + Duration::weeks(i64::from(week) - 1);
    let sunday = monday + Duration::days(6);
    let dt = sunday.and_hms_opt(0, 0, 0)?;
    Some(Utc.from_utc_datetime(&dt).timestamp())
}

/// End times for the handful of early Common Crawl indexes whose names do
/// not follow the year-week pattern.
pub fn cc_index_special_time(name: &str) -> Option<i64> {
    let ts = match name {
        "2012" => "201206",
        "2009-2010" => "201009",
        "2008-2009" => "200901",
        _ => return None,
    };
    timestamp_to_time(ts).ok()
}

/// Formats a unix time as the ISO form WARC headers use.
pub fn time_to_iso_date(t: i64) -> String {
    match Utc.timestamp_opt(t, 0) {
        chrono::LocalResult::Single(dt) => dt.format("%Y-%m-%dT%H:%M:%SZ").to_string(),
        _ => String::new(),
    }
}

/// Current unix time; isolated so tests and callers can supply their own.
pub fn now() -> i64 {
    Utc::now().timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pad_timestamp() {
        assert_eq!(pad_timestamp("1998"), "19980101000000");
        assert_eq!(pad_timestamp("19980203"), "19980203000000");
        assert_eq!(pad_timestamp("19980203040506"), "19980203040506");
    }

    #[test]
    fn test_pad_timestamp_up() {
        assert_eq!(pad_timestamp_up("199802"), "19980228235959");
        assert_eq!(pad_timestamp_up("1998"), "19981231235959");
        assert_eq!(pad_timestamp_up("199804"), "19980430235959");
    }

    #[test]
    fn test_timestamp_to_time() {
        assert_eq!(timestamp_to_time("1999").unwrap(), 915_148_800);
        assert_eq!(time_to_timestamp(915_148_800), "19990101000000");
    }

    #[test]
    fn test_roundtrip() {
        let t = timestamp_to_time("20170101000000").unwrap();
        assert_eq!(time_to_timestamp(t), "20170101000000");
    }

    #[test]
    fn test_validate_rejects_garbage() {
        assert!(validate_timestamp("2017-01").is_err());
        assert!(validate_timestamp("").is_err());
        assert!(validate_timestamp("abc").is_err());
        assert!(validate_timestamp("20170101").is_ok());
    }

    #[test]
    fn test_validate_catches_unix_time() {
        // 1515888000 is 2018-01-14 as a unix time, not a cdx timestamp
        assert!(validate_timestamp("1515888000").is_err());
    }

    #[test]
    fn test_cc_index_to_time() {
        // CC-MAIN-2018-02 ends on Sunday 2018-01-14
        assert_eq!(cc_index_to_time(2018, 2).unwrap(), 1_515_888_000);
    }

    #[test]
    fn test_cc_index_special() {
        assert_eq!(
            cc_index_special_time("2012"),
            timestamp_to_time("201206").ok()
        );
        assert!(cc_index_special_time("2024-33").is_none());
    }

    #[test]
    fn test_iso_date() {
        assert_eq!(time_to_iso_date(915_148_800), "1999-01-01T00:00:00Z");
    }
}

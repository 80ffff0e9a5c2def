//! Authoritative transaction date resolution.
//!
//! Precedence:
//!
//! 1. The date captured from the message text, parsed with the rule's
//!    `date_format` (ISO `%Y-%m-%d` when the rule has none). Calendar-day
//!    precision only.
//! 2. The mailbox receipt timestamp, full precision.
//!
//! An unparseable capture falls through to (2). With neither available the
//! resolution fails; there is no fallback to the current time.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};

use crate::error::ParseFailure;
use crate::models::TransactionDate;

pub const DEFAULT_DATE_FORMAT: &str = "%Y-%m-%d";

pub fn resolve_date(
    extracted: Option<&str>,
    date_format: Option<&str>,
    received_at: Option<DateTime<Utc>>,
) -> Result<TransactionDate, ParseFailure> {
    let format = date_format
        .map(str::trim)
        .filter(|f| !f.is_empty())
        .unwrap_or(DEFAULT_DATE_FORMAT);

    if let Some(day) = extracted.and_then(|raw| parse_day(raw.trim(), format)) {
        return Ok(TransactionDate::Day(day));
    }

    received_at
        .map(TransactionDate::Instant)
        .ok_or(ParseFailure::DateUnresolvable)
}

/// Parse `raw` with `format`, keeping only the calendar day. Formats that
/// include a time or an offset are accepted; the time is discarded.
fn parse_day(raw: &str, format: &str) -> Option<NaiveDate> {
    if raw.is_empty() {
        return None;
    }
    NaiveDate::parse_from_str(raw, format)
        .ok()
        .or_else(|| {
            NaiveDateTime::parse_from_str(raw, format)
                .ok()
                .map(|dt| dt.date())
        })
        .or_else(|| {
            DateTime::parse_from_str(raw, format)
                .ok()
                .map(|dt| dt.date_naive())
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn received() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 10, 0, 0).unwrap()
    }

    #[test]
    fn extracted_date_wins_with_day_precision() {
        let date = resolve_date(Some("2026-03-01"), None, Some(received())).unwrap();
        assert_eq!(
            date,
            TransactionDate::Day(NaiveDate::from_ymd_opt(2026, 3, 1).unwrap())
        );
    }

    #[test]
    fn received_at_keeps_full_precision() {
        let date = resolve_date(None, None, Some(received())).unwrap();
        assert_eq!(date, TransactionDate::Instant(received()));
    }

    #[test]
    fn rule_format_is_honoured() {
        let date = resolve_date(Some("01/03/2026"), Some("%d/%m/%Y"), None).unwrap();
        assert_eq!(date.day(), NaiveDate::from_ymd_opt(2026, 3, 1).unwrap());
    }

    #[test]
    fn datetime_formats_drop_time_of_day() {
        let date = resolve_date(Some("2026-03-01 23:59"), Some("%Y-%m-%d %H:%M"), None).unwrap();
        assert_eq!(
            date,
            TransactionDate::Day(NaiveDate::from_ymd_opt(2026, 3, 1).unwrap())
        );
    }

    #[test]
    fn unparseable_capture_falls_through() {
        let date = resolve_date(Some("yesterday"), Some("%d/%m/%Y"), Some(received())).unwrap();
        assert_eq!(date, TransactionDate::Instant(received()));
    }

    #[test]
    fn nothing_usable_fails() {
        assert_eq!(
            resolve_date(Some("soon"), None, None),
            Err(ParseFailure::DateUnresolvable)
        );
        assert_eq!(resolve_date(None, None, None), Err(ParseFailure::DateUnresolvable));
    }
}

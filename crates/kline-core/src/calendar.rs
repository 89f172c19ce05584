use chrono::{DateTime, NaiveDate, Utc};

const DAY_MS: i64 = 86_400_000;

/// First millisecond of `date` (00:00:00.000 UTC).
pub fn day_start_ms(date: NaiveDate) -> i64 {
    date.and_time(chrono::NaiveTime::MIN)
        .and_utc()
        .timestamp_millis()
}

/// Last millisecond of `date` (23:59:59.999 UTC).
pub fn day_end_ms(date: NaiveDate) -> i64 {
    day_start_ms(date) + DAY_MS - 1
}

/// UTC calendar day containing the given millisecond timestamp.
pub fn date_of_ms(ms: i64) -> Option<NaiveDate> {
    DateTime::<Utc>::from_timestamp_millis(ms).map(|dt| dt.date_naive())
}

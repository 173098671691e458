use chrono::{Local, NaiveDate};

/// Today's date on the local clock.
pub fn local_today() -> NaiveDate {
    Local::now().date_naive()
}

/// Renders a date the way the portal stores it, e.g. `20240101`.
pub fn portal_date(date: NaiveDate) -> String {
    date.format("%Y%m%d").to_string()
}

/// Current Unix time in milliseconds.
pub fn now_millis() -> i64 {
    Local::now().timestamp_millis()
}

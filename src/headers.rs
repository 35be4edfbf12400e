//! Total extraction of protocol metadata from ESI response headers.
//!
//! Every field is optional. A header that is missing, not valid UTF-8, or
//! fails to parse is reported as `None`; nothing here returns an error.

use crate::budget::BudgetSnapshot;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, ETAG, EXPIRES, LAST_MODIFIED, RETRY_AFTER};

pub const PAGES: &str = "x-pages";
pub const RATELIMIT_GROUP: &str = "x-ratelimit-group";
pub const RATELIMIT_LIMIT: &str = "x-ratelimit-limit";
pub const RATELIMIT_REMAINING: &str = "x-ratelimit-remaining";
pub const RATELIMIT_USED: &str = "x-ratelimit-used";
pub const ERROR_LIMIT_REMAIN: &str = "x-esi-error-limit-remain";
pub const ERROR_LIMIT_RESET: &str = "x-esi-error-limit-reset";

/// Everything the client reads from a response's headers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedHeaders {
    pub validator: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub last_modified: Option<DateTime<Utc>>,
    pub total_pages: Option<u32>,
    pub budget: BudgetSnapshot,
}

pub fn parse_headers(headers: &HeaderMap) -> ParsedHeaders {
    parse_headers_at(headers, Utc::now())
}

/// Same as [`parse_headers`], resolving an HTTP-date `Retry-After` against `now`.
pub fn parse_headers_at(headers: &HeaderMap, now: DateTime<Utc>) -> ParsedHeaders {
    ParsedHeaders {
        validator: header_str(headers, ETAG.as_str()).map(str::to_string),
        expires_at: header_str(headers, EXPIRES.as_str()).and_then(parse_http_date),
        last_modified: header_str(headers, LAST_MODIFIED.as_str()).and_then(parse_http_date),
        total_pages: header_parse::<u32>(headers, PAGES).filter(|p| *p >= 1),
        budget: extract_budget_at(headers, now),
    }
}

fn extract_budget_at(headers: &HeaderMap, now: DateTime<Utc>) -> BudgetSnapshot {
    BudgetSnapshot {
        group: header_str(headers, RATELIMIT_GROUP).map(str::to_string),
        limit: header_str(headers, RATELIMIT_LIMIT).map(str::to_string),
        remaining: header_parse::<i64>(headers, RATELIMIT_REMAINING),
        used: header_parse::<i64>(headers, RATELIMIT_USED),
        retry_after_seconds: header_str(headers, RETRY_AFTER.as_str())
            .and_then(|s| parse_retry_after(s, now)),
        error_budget_remaining: header_parse::<i64>(headers, ERROR_LIMIT_REMAIN),
        error_budget_reset_seconds: header_parse::<u64>(headers, ERROR_LIMIT_RESET),
    }
}

/// `Retry-After` is either delta-seconds or an HTTP-date; dates in the past clamp to 0.
pub fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<u64> {
    if let Ok(secs) = value.trim().parse::<u64>() {
        return Some(secs);
    }
    let at = parse_http_date(value)?;
    Some((at - now).num_seconds().max(0) as u64)
}

/// Parses an IMF-fixdate such as `Wed, 21 Oct 2015 07:28:00 GMT`.
pub fn parse_http_date(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(value.trim())
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

fn header_parse<T: std::str::FromStr>(headers: &HeaderMap, name: &str) -> Option<T> {
    header_str(headers, name).and_then(|s| s.parse::<T>().ok())
}

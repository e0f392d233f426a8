//! Per-`(queue, model)` usage counters.

use crate::limiter::start_of_next_utc_month;
use serde::{Deserialize, Serialize};

/// The entire counter state for one model key within a queue.
///
/// The three timestamp sequences are kept sorted ascending and never hold an
/// entry older than their window. The monthly reset-at values always point
/// at the first instant of a UTC calendar month. `minute_token_window_start`
/// anchors a *tumbling* 60-second token window: it resets when crossed, it
/// does not slide.
///
/// Every field carries a serde default so that buckets read back from the
/// remote store survive missing fields; [`UsageBucket::normalize`] then maps
/// zeroed anchors onto the current time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct UsageBucket {
    pub second_ts: Vec<i64>,
    pub minute_ts: Vec<i64>,
    pub day_ts: Vec<i64>,
    pub month_token_count: u64,
    pub month_token_reset_at: i64,
    pub month_request_count: u64,
    pub month_request_reset_at: i64,
    pub minute_token_count: u64,
    pub minute_token_window_start: i64,
}

impl UsageBucket {
    /// A zeroed bucket whose month resets point at the next UTC month
    /// boundary and whose minute token window starts now.
    pub fn fresh(now: i64) -> Self {
        let next_month = start_of_next_utc_month(now);
        Self {
            month_token_reset_at: next_month,
            month_request_reset_at: next_month,
            minute_token_window_start: now,
            ..Self::default()
        }
    }

    /// Repair anchors lost to partial persistence: zeroed reset-at and
    /// window-start values become `now`, so the next maintenance pass
    /// advances them properly.
    pub fn normalize(&mut self, now: i64) {
        if self.month_token_reset_at <= 0 {
            self.month_token_reset_at = now;
        }
        if self.month_request_reset_at <= 0 {
            self.month_request_reset_at = now;
        }
        if self.minute_token_window_start <= 0 {
            self.minute_token_window_start = now;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserialization_tolerates_missing_fields() {
        let bucket: UsageBucket =
            serde_json::from_str(r#"{"monthRequestCount": 10}"#).unwrap();
        assert_eq!(bucket.month_request_count, 10);
        assert!(bucket.second_ts.is_empty());
        assert_eq!(bucket.month_token_reset_at, 0);

        let mut bucket = bucket;
        bucket.normalize(1_700_000_000_000);
        assert_eq!(bucket.month_token_reset_at, 1_700_000_000_000);
        assert_eq!(bucket.minute_token_window_start, 1_700_000_000_000);
    }

    #[test]
    fn wire_names_are_camel_case() {
        let json = serde_json::to_value(UsageBucket::fresh(0)).unwrap();
        assert!(json.get("secondTs").is_some());
        assert!(json.get("monthTokenResetAt").is_some());
        assert!(json.get("minuteTokenWindowStart").is_some());
    }
}

//! Pure admission and accounting math over a [`UsageBucket`].
//!
//! Every function takes `now` explicitly, so the live dispatcher, the wait
//! estimator's replay, and the tests all drive the same code with their own
//! clocks. Nothing here sleeps or allocates beyond the bucket itself.

use crate::bucket::UsageBucket;
use chrono::{Datelike, TimeZone, Utc};
use switchboard_common::{LimitKind, LimitSpec};

pub const SECOND_MS: i64 = 1_000;
pub const MINUTE_MS: i64 = 60_000;
pub const DAY_MS: i64 = 86_400_000;

/// Epoch-ms of the first instant of the UTC calendar month after `now_ms`.
pub fn start_of_next_utc_month(now_ms: i64) -> i64 {
    let now = match Utc.timestamp_millis_opt(now_ms).single() {
        Some(dt) => dt,
        None => Utc::now(),
    };
    let (year, month) = if now.month() == 12 {
        (now.year() + 1, 1)
    } else {
        (now.year(), now.month() + 1)
    };
    match Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0).single() {
        Some(boundary) => boundary.timestamp_millis(),
        None => now_ms,
    }
}

/// Maintenance pass applied at the start of every admission check: prune
/// the sliding windows, roll the monthly counters over UTC month
/// boundaries, and reset the tumbling minute token window once stale.
pub fn maintain(bucket: &mut UsageBucket, now: i64) {
    prune_window(&mut bucket.second_ts, now, SECOND_MS);
    prune_window(&mut bucket.minute_ts, now, MINUTE_MS);
    prune_window(&mut bucket.day_ts, now, DAY_MS);

    if now >= bucket.month_token_reset_at {
        bucket.month_token_count = 0;
        bucket.month_token_reset_at = start_of_next_utc_month(now);
    }
    if now >= bucket.month_request_reset_at {
        bucket.month_request_count = 0;
        bucket.month_request_reset_at = start_of_next_utc_month(now);
    }
    if now - bucket.minute_token_window_start >= MINUTE_MS {
        bucket.minute_token_count = 0;
        bucket.minute_token_window_start = now;
    }
}

fn prune_window(ts: &mut Vec<i64>, now: i64, window: i64) {
    ts.retain(|&t| now - t < window);
}

/// How long until a request of `tokens_needed` tokens is admissible under
/// `limits`. Returns 0 when it may run immediately. The answer is the
/// maximum over all triggered limits, clamped to ≥ 0.
///
/// A `tokens_needed` of 0 never trips a token-based limit.
pub fn wait_ms(
    bucket: &mut UsageBucket,
    limits: &[LimitSpec],
    now: i64,
    tokens_needed: u64,
) -> i64 {
    maintain(bucket, now);

    let mut wait = 0i64;
    for spec in limits {
        let candidate = match spec.kind {
            LimitKind::RequestsPerSecond => {
                window_wait(&bucket.second_ts, spec.limit, now, SECOND_MS)
            }
            LimitKind::RequestsPerMinute => {
                window_wait(&bucket.minute_ts, spec.limit, now, MINUTE_MS)
            }
            LimitKind::RequestsPerDay => window_wait(&bucket.day_ts, spec.limit, now, DAY_MS),
            LimitKind::TokensPerMonth => {
                if tokens_needed > 0 && bucket.month_token_count + tokens_needed > spec.limit {
                    bucket.month_token_reset_at - now
                } else {
                    0
                }
            }
            LimitKind::RequestsPerMonth => {
                if bucket.month_request_count + 1 > spec.limit {
                    bucket.month_request_reset_at - now
                } else {
                    0
                }
            }
            LimitKind::TokensPerMinute => {
                if tokens_needed > 0 && bucket.minute_token_count + tokens_needed > spec.limit {
                    bucket.minute_token_window_start + MINUTE_MS - now
                } else {
                    0
                }
            }
        };
        wait = wait.max(candidate.max(0));
    }
    wait
}

fn window_wait(ts: &[i64], limit: u64, now: i64, window: i64) -> i64 {
    if (ts.len() as u64) < limit {
        return 0;
    }
    match ts.first() {
        Some(&oldest) => window - (now - oldest),
        None => 0,
    }
}

/// Account for a successfully completed request. Callers only invoke this
/// after [`wait_ms`] returned 0 for the same item.
pub fn record(bucket: &mut UsageBucket, now: i64, tokens: u64) {
    bucket.second_ts.push(now);
    bucket.minute_ts.push(now);
    bucket.day_ts.push(now);

    if tokens > 0 {
        bucket.month_token_count += tokens;
    }
    bucket.month_request_count += 1;

    if now - bucket.minute_token_window_start >= MINUTE_MS {
        bucket.minute_token_count = 0;
        bucket.minute_token_window_start = now;
    }
    if tokens > 0 {
        bucket.minute_token_count += tokens;
    }

    prune_window(&mut bucket.second_ts, now, SECOND_MS);
    prune_window(&mut bucket.minute_ts, now, MINUTE_MS);
    prune_window(&mut bucket.day_ts, now, DAY_MS);
}

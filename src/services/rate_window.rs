//! Rate window calculator.
//!
//! Pure functions that decide whether a rate-limit policy has room for a
//! request at a given instant, and what the window state becomes if it does.
//! Nothing here reads a clock or touches storage: `now` is passed in and the
//! new state is returned for the caller to persist.
//!
//! All arithmetic is on integer milliseconds and integer tokens. Partial
//! refill progress is kept by advancing timestamps in whole intervals, so
//! two replicas evaluating the same stored fields at the same instant always
//! agree.

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};

use crate::models::key::{RateLimitKind, RateLimitPolicy, WindowState};

/// Outcome of evaluating a policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowDecision {
    pub allowed: bool,
    /// State to persist if the request goes through. On denial this only
    /// reflects refills and window rollovers; nothing needs writing.
    pub state: WindowState,
    /// Budget left after this request (or before it, if denied).
    pub remaining: i64,
    /// When the budget next grows.
    pub reset_at: DateTime<Utc>,
    /// How long to wait before `cost` could fit. `None` when allowed, or
    /// when waiting can never help (`cost` above the policy limit).
    pub retry_after: Option<Duration>,
}

/// Evaluate `policy` for a request of `cost` units at `now`.
///
/// `state` is the persisted window state, `None` for a key never used.
pub fn evaluate(
    policy: &RateLimitPolicy,
    state: Option<&WindowState>,
    now: DateTime<Utc>,
    cost: i64,
) -> WindowDecision {
    let state = state.copied().unwrap_or_else(|| policy.initial_state(now));
    match policy.kind() {
        RateLimitKind::TokenBucket => token_bucket(policy, state, now, cost),
        RateLimitKind::FixedWindow => fixed_window(policy, state, now, cost),
        RateLimitKind::SlidingWindow => sliding_window(policy, state, now, cost),
    }
}

fn token_bucket(
    policy: &RateLimitPolicy,
    state: WindowState,
    now: DateTime<Utc>,
    cost: i64,
) -> WindowDecision {
    let limit = policy.limit();
    let interval = policy.refill_interval_ms();

    let ticks = elapsed_ms(state.updated_at, now) / interval;
    let refilled = state
        .tokens
        .max(0)
        .saturating_add(ticks.saturating_mul(policy.refill_rate()));

    // A full bucket has nothing pending, restart the refill clock from now.
    let (tokens, last_refill) = if refilled >= limit {
        (limit, now)
    } else {
        (refilled, shift(state.updated_at, ticks.saturating_mul(interval)))
    };

    let reset_at = shift(last_refill, interval);
    let allowed = cost <= tokens;
    let remaining = if allowed { tokens - cost } else { tokens };

    let retry_after = if allowed || cost > limit {
        None
    } else {
        let ticks_needed = ceil_div_wide(cost - tokens, 1, policy.refill_rate());
        let ready_at = shift(last_refill, ticks_needed.saturating_mul(interval));
        Some(until(now, ready_at))
    };

    WindowDecision {
        allowed,
        state: WindowState {
            tokens: remaining,
            previous: 0,
            updated_at: last_refill,
        },
        remaining,
        reset_at,
        retry_after,
    }
}

fn fixed_window(
    policy: &RateLimitPolicy,
    state: WindowState,
    now: DateTime<Utc>,
    cost: i64,
) -> WindowDecision {
    let limit = policy.limit();
    let interval = policy.refill_interval_ms();

    let windows = elapsed_ms(state.updated_at, now) / interval;
    let (start, available) = if windows == 0 {
        (state.updated_at, state.tokens.clamp(0, limit))
    } else {
        (shift(state.updated_at, windows.saturating_mul(interval)), limit)
    };

    let reset_at = shift(start, interval);
    let allowed = cost <= available;
    let remaining = if allowed { available - cost } else { available };
    let retry_after = (!allowed && cost <= limit).then(|| until(now, reset_at));

    WindowDecision {
        allowed,
        state: WindowState {
            tokens: remaining,
            previous: 0,
            updated_at: start,
        },
        remaining,
        reset_at,
        retry_after,
    }
}

fn sliding_window(
    policy: &RateLimitPolicy,
    state: WindowState,
    now: DateTime<Utc>,
    cost: i64,
) -> WindowDecision {
    let limit = policy.limit();
    let interval = policy.refill_interval_ms();

    let used = (limit - state.tokens).clamp(0, limit);
    let windows = elapsed_ms(state.updated_at, now) / interval;
    let (start, current, previous) = match windows {
        0 => (state.updated_at, used, state.previous.max(0)),
        1 => (shift(state.updated_at, interval), 0, used),
        n => (shift(state.updated_at, n.saturating_mul(interval)), 0, 0),
    };

    let into_window = elapsed_ms(start, now).min(interval);
    // Rounded up: the estimate may over-count, never under-count.
    let weighted = ceil_div_wide(previous, interval - into_window, interval);
    let estimate = weighted.saturating_add(current);

    let reset_at = shift(start, interval);
    let allowed = estimate.saturating_add(cost) <= limit;
    let current = if allowed { current + cost } else { current };
    let remaining = (limit - weighted - current).max(0);

    let retry_after = if allowed || cost > limit {
        None
    } else {
        let room = limit - current - cost;
        if room < 0 || previous == 0 {
            Some(until(now, reset_at))
        } else {
            // Smallest offset e where ceil(previous * (interval - e) / interval) <= room
            let offset = interval - floor_div_wide(room, interval, previous);
            Some(until(now, shift(start, offset)))
        }
    };

    WindowDecision {
        allowed,
        state: WindowState {
            tokens: limit - current,
            previous,
            updated_at: start,
        },
        remaining,
        reset_at,
        retry_after,
    }
}

/// Milliseconds from `from` to `to`, zero if the clock went backwards.
fn elapsed_ms(from: DateTime<Utc>, to: DateTime<Utc>) -> i64 {
    (to - from).num_milliseconds().max(0)
}

fn shift(at: DateTime<Utc>, ms: i64) -> DateTime<Utc> {
    at.checked_add_signed(TimeDelta::milliseconds(ms))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

fn until(now: DateTime<Utc>, at: DateTime<Utc>) -> Duration {
    (at - now).to_std().unwrap_or(Duration::ZERO)
}

/// `ceil(a * b / d)` without overflowing the product.
fn ceil_div_wide(a: i64, b: i64, d: i64) -> i64 {
    let product = a as i128 * b as i128;
    let d = d as i128;
    ((product + d - 1) / d).min(i64::MAX as i128) as i64
}

/// `floor(a * b / d)` without overflowing the product.
fn floor_div_wide(a: i64, b: i64, d: i64) -> i64 {
    ((a as i128 * b as i128) / d as i128).min(i64::MAX as i128) as i64
}

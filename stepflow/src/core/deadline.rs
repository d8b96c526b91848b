//! Nested deadline helpers for the flow ⊃ step ⊃ unit timeout cascade.

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

/// Upper bound for any single duration handed to chrono arithmetic.
const MAX_SPAN_MS: u64 = 366 * 24 * 60 * 60 * 1000;

/// Soft default and hard ceiling for one timeout scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeLimits {
    /// Used when the caller does not request a duration.
    pub soft_ms: u64,
    /// Requested durations are capped here.
    pub hard_ms: u64,
}

impl ScopeLimits {
    pub const fn new(soft_ms: u64, hard_ms: u64) -> Self {
        Self { soft_ms, hard_ms }
    }
}

/// Resolve the effective duration of a scope.
///
/// Falls back to the soft default, caps at the hard ceiling, then clamps to
/// whatever remains of the enclosing scope.
pub fn clamp_ms(requested: Option<u64>, limits: ScopeLimits, parent_remaining: Option<u64>) -> u64 {
    let wanted = requested.unwrap_or(limits.soft_ms).min(limits.hard_ms);
    match parent_remaining {
        Some(remaining) => wanted.min(remaining),
        None => wanted,
    }
}

/// Convert milliseconds into a chrono span, saturating at one year.
pub fn span(ms: u64) -> TimeDelta {
    let ms = ms.min(MAX_SPAN_MS);
    TimeDelta::milliseconds(i64::try_from(ms).unwrap_or(i64::MAX))
}

/// Milliseconds elapsed between two instants, zero if `to` precedes `from`.
pub fn elapsed_ms(from: DateTime<Utc>, to: DateTime<Utc>) -> u64 {
    u64::try_from((to - from).num_milliseconds()).unwrap_or(0)
}

/// An absolute point in time by which a scope must finish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline {
    pub at: DateTime<Utc>,
}

impl Deadline {
    pub fn after(now: DateTime<Utc>, ms: u64) -> Self {
        Self { at: now + span(ms) }
    }

    pub fn remaining_ms(&self, now: DateTime<Utc>) -> u64 {
        elapsed_ms(now, self.at)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.at
    }

    /// Deadline for a nested scope, clamped to this one.
    pub fn child(&self, now: DateTime<Utc>, requested: Option<u64>, limits: ScopeLimits) -> Self {
        let ms = clamp_ms(requested, limits, Some(self.remaining_ms(now)));
        Self::after(now, ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STEP: ScopeLimits = ScopeLimits::new(10_000, 60_000);

    #[test]
    fn unset_request_uses_soft_default() {
        assert_eq!(clamp_ms(None, STEP, None), 10_000);
    }

    #[test]
    fn request_is_capped_by_hard_ceiling_and_parent() {
        assert_eq!(clamp_ms(Some(120_000), STEP, None), 60_000);
        assert_eq!(clamp_ms(Some(30_000), STEP, Some(5_000)), 5_000);
        assert_eq!(clamp_ms(Some(30_000), STEP, Some(0)), 0);
    }

    #[test]
    fn child_deadline_never_outlives_parent() {
        let now = DateTime::<Utc>::from_timestamp(1_700_000_000, 0).expect("timestamp");
        let parent = Deadline::after(now, 2_000);
        let child = parent.child(now, Some(50_000), STEP);
        assert_eq!(child.at, parent.at);
        assert!(!child.is_expired(now));
        assert!(child.is_expired(now + span(2_000)));
    }

    #[test]
    fn elapsed_is_zero_when_reversed() {
        let now = DateTime::<Utc>::from_timestamp(1_700_000_000, 0).expect("timestamp");
        assert_eq!(elapsed_ms(now + span(5), now), 0);
        assert_eq!(elapsed_ms(now, now + span(1_500)), 1_500);
    }
}

use rand::Rng;
use rkyv::{Archive, Deserialize as RkyvDeserialize, Serialize as RkyvSerialize};

/// Retry policy for a task's attempts.
#[derive(Debug, Clone, Copy, PartialEq, Archive, RkyvSerialize, RkyvDeserialize)]
#[archive(check_bytes)]
pub struct RetryPolicy {
    /// Total attempts allowed, including the first. Must be positive.
    pub max_attempts: u32,
    /// Base delay for the exponential term, in milliseconds.
    pub base_ms: i64,
    /// Upper bound (exclusive) of the additive uniform jitter, in milliseconds.
    /// Zero disables jitter entirely.
    pub jitter_max_ms: i64,
    /// Cap on the exponent so the exponential term cannot overflow.
    pub max_exponent: u32,
}

impl RetryPolicy {
    pub fn default_max_attempts() -> u32 {
        5
    }
    pub fn default_base_ms() -> i64 {
        1_000
    }
    pub fn default_max_exponent() -> u32 {
        10
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: Self::default_max_attempts(),
            base_ms: Self::default_base_ms(),
            jitter_max_ms: 0,
            max_exponent: Self::default_max_exponent(),
        }
    }
}

/// Compute the delay in milliseconds before the retry that follows a failed
/// attempt.
/// - `failed_attempt`: 0-based index of the attempt that just failed
/// - `policy`: retry configuration
/// - `rng`: jitter source; injected so callers can seed it
///
/// The exponential term is `base_ms * 2^failed_attempt`, with the exponent
/// capped at `policy.max_exponent`. The jitter draw is uniform in
/// `[0, jitter_max_ms)` and decorrelates retries issued at the same attempt
/// count across many concurrent tasks. Always returns a value >= 0.
pub fn compute_delay_ms<R: Rng + ?Sized>(
    failed_attempt: u32,
    policy: &RetryPolicy,
    rng: &mut R,
) -> i64 {
    // Cap at 62 regardless of configuration so the shift stays in range.
    let exponent = failed_attempt.min(policy.max_exponent).min(62);
    let base = policy.base_ms.max(0);
    let delay = base.saturating_mul(1i64 << exponent);
    let jitter = if policy.jitter_max_ms > 0 {
        rng.gen_range(0..policy.jitter_max_ms)
    } else {
        0
    };
    delay.saturating_add(jitter)
}

/// Compute the epoch-ms time for the retry that follows a failed attempt.
pub fn next_run_at_ms<R: Rng + ?Sized>(
    failure_time_ms: i64,
    failed_attempt: u32,
    policy: &RetryPolicy,
    rng: &mut R,
) -> i64 {
    failure_time_ms.saturating_add(compute_delay_ms(failed_attempt, policy, rng))
}

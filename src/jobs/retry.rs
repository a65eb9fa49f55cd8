//! Retry scheduling
//!
//! Exponential backoff with full jitter, tuned per job type. Transient
//! failures back off; malformed-input failures never retry.

use crate::db::JobType;
use chrono::{DateTime, Duration, Utc};
use rand::Rng;

/// Per-type backoff configuration.
#[derive(Debug, Clone, Copy)]
pub struct RetryStrategy {
    pub max_retries: i64,
    pub base_delay_seconds: i64,
    pub max_delay_seconds: i64,
}

/// Strategy for a job type. Transcripts may simply not exist yet, the
/// summarizer hits rate limits, and distribution failures are network
/// weather, so each gets its own pacing.
pub fn retry_strategy(job_type: JobType) -> RetryStrategy {
    match job_type {
        JobType::FetchTranscript => RetryStrategy {
            max_retries: 3,
            base_delay_seconds: 60,
            max_delay_seconds: 600,
        },
        JobType::GenerateSummary => RetryStrategy {
            max_retries: 3,
            base_delay_seconds: 30,
            max_delay_seconds: 300,
        },
        JobType::Distribute => RetryStrategy {
            max_retries: 5,
            base_delay_seconds: 120,
            max_delay_seconds: 1800,
        },
        JobType::ProcessChatCommand => RetryStrategy {
            max_retries: 3,
            base_delay_seconds: 60,
            max_delay_seconds: 600,
        },
    }
}

/// Next retry timestamp: `min(base * 2^retry_count, max) * jitter[0.75, 1.25]`,
/// floored at the base delay so jitter can't schedule sooner than one base
/// interval out.
pub fn next_retry_at(retry_count: i64, strategy: RetryStrategy) -> DateTime<Utc> {
    Utc::now() + Duration::seconds(retry_delay_seconds(retry_count, strategy))
}

fn retry_delay_seconds(retry_count: i64, strategy: RetryStrategy) -> i64 {
    let exp = u32::try_from(retry_count.clamp(0, 32)).unwrap_or(32);
    let raw = strategy
        .base_delay_seconds
        .saturating_mul(1_i64 << exp.min(62));
    let capped = raw.min(strategy.max_delay_seconds);

    let jitter: f64 = rand::thread_rng().gen_range(0.75..=1.25);
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
    let jittered = (capped as f64 * jitter) as i64;

    jittered.max(strategy.base_delay_seconds)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_strategies_per_type() {
        assert_eq!(retry_strategy(JobType::FetchTranscript).max_retries, 3);
        assert_eq!(retry_strategy(JobType::Distribute).max_retries, 5);
        assert_eq!(retry_strategy(JobType::Distribute).max_delay_seconds, 1800);
        assert_eq!(retry_strategy(JobType::GenerateSummary).base_delay_seconds, 30);
    }

    #[test]
    fn test_delay_floor_is_base() {
        let strategy = retry_strategy(JobType::FetchTranscript);
        for retry in 0..10 {
            assert!(retry_delay_seconds(retry, strategy) >= strategy.base_delay_seconds);
        }
    }

    proptest! {
        // Delays are bounded by max_delay plus the jitter headroom, and
        // never drop below the base delay, for any retry count.
        #[test]
        fn prop_delay_bounded(retry_count in 0_i64..100) {
            let strategy = retry_strategy(JobType::Distribute);
            let delay = retry_delay_seconds(retry_count, strategy);
            prop_assert!(delay >= strategy.base_delay_seconds);
            let ceiling = strategy.max_delay_seconds as f64 * 1.25;
            prop_assert!((delay as f64) <= ceiling + 1.0);
        }

        // Ignoring jitter, the pre-jitter schedule is non-decreasing in
        // retry_count: a later retry never targets an earlier interval
        // than 0.75x of what an earlier retry could target at 1.25x... the
        // deterministic core (capped exponential) must be monotone.
        #[test]
        fn prop_capped_exponential_monotone(a in 0_i64..30, b in 0_i64..30) {
            let strategy = retry_strategy(JobType::FetchTranscript);
            let core = |r: i64| {
                (strategy.base_delay_seconds << u32::try_from(r).unwrap().min(62))
                    .min(strategy.max_delay_seconds)
            };
            if a <= b {
                prop_assert!(core(a) <= core(b));
            }
        }
    }
}

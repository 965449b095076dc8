//! Reconnect backoff: capped exponential growth with uniform jitter.

use std::time::Duration;

use crate::ValidationError;

/// Exponential backoff used between reconnect attempts.
///
/// The pre-jitter delay is `min(base * factor ^ attempt, max)`. Jitter then
/// moves it uniformly within `±jitter` of itself so that many clients dropped
/// by the same outage do not retry in lockstep.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    /// The initial backoff duration.
    pub base: Duration,
    /// The multiplicative factor for each subsequent retry.
    pub factor: f64,
    /// The maximum duration to wait between retries.
    pub max: Duration,
    /// Jitter ratio; `0.1` means ±10%.
    pub jitter: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            factor: 2.0,
            max: Duration::from_secs(5),
            jitter: 0.1,
        }
    }
}

/// A delay chosen for one reconnect attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduledDelay {
    /// Delay before jitter.
    pub base: Duration,
    /// Delay actually slept.
    pub scheduled: Duration,
    /// Signed jitter in milliseconds (`scheduled - base`).
    pub jitter_ms: i64,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            ..Self::default()
        }
    }

    pub fn without_jitter(mut self) -> Self {
        self.jitter = 0.0;
        self
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.base.is_zero() {
            return Err(ValidationError::ZeroDuration {
                field: "backoff.base",
            });
        }
        if !(0.0..1.0).contains(&self.jitter) {
            return Err(ValidationError::InvalidJitter { value: self.jitter });
        }
        if !self.factor.is_finite() || self.factor < 1.0 {
            return Err(ValidationError::InvalidBackoffFactor { value: self.factor });
        }
        if self.max < self.base {
            return Err(ValidationError::BackoffMaxBelowBase {
                base_ms: self.base.as_millis() as u64,
                max_ms: self.max.as_millis() as u64,
            });
        }
        Ok(())
    }

    /// Pre-jitter delay for a 0-based attempt number.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(i32::MAX as u32) as i32;
        let seconds = self.base.as_secs_f64() * self.factor.powi(exponent);
        let capped = seconds.min(self.max.as_secs_f64());
        Duration::try_from_secs_f64(capped).unwrap_or(self.max)
    }

    /// Pick the delay for `attempt`, honouring a server retry hint as a floor.
    pub fn schedule(&self, attempt: u32, retry_hint: Option<Duration>) -> ScheduledDelay {
        self.schedule_with(attempt, retry_hint, &mut fastrand::Rng::new())
    }

    /// Like [`Backoff::schedule`] with a caller-supplied random source.
    pub fn schedule_with(
        &self,
        attempt: u32,
        retry_hint: Option<Duration>,
        rng: &mut fastrand::Rng,
    ) -> ScheduledDelay {
        let mut base = self.delay(attempt);
        if let Some(hint) = retry_hint {
            base = base.max(hint).min(self.max);
        }

        let base_ms = base.as_millis() as i64;
        let spread_ms = (base_ms as f64 * self.jitter) as i64;
        let jitter_ms = if spread_ms > 0 {
            rng.i64(-spread_ms..=spread_ms)
        } else {
            0
        };
        let scheduled = Duration::from_millis((base_ms + jitter_ms).max(0) as u64);

        ScheduledDelay {
            base,
            scheduled,
            jitter_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_double_until_capped() {
        let backoff = Backoff::default();
        let delays: Vec<u64> = (0..6).map(|attempt| backoff.delay(attempt).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 5, 5, 5]);
    }

    #[test]
    fn huge_attempt_numbers_stay_capped() {
        let backoff = Backoff::default();
        assert_eq!(backoff.delay(u32::MAX), Duration::from_secs(5));
    }

    #[test]
    fn jitter_stays_within_ten_percent() {
        let backoff = Backoff::default();
        let mut rng = fastrand::Rng::with_seed(7);
        for _ in 0..200 {
            for attempt in 0..6 {
                let delay = backoff.schedule_with(attempt, None, &mut rng);
                let base_ms = delay.base.as_millis() as i64;
                let scheduled_ms = delay.scheduled.as_millis() as i64;
                assert!(
                    (scheduled_ms - base_ms).abs() <= base_ms / 10,
                    "attempt={attempt}, base={base_ms}, scheduled={scheduled_ms}"
                );
                assert_eq!(scheduled_ms - base_ms, delay.jitter_ms);
            }
        }
    }

    #[test]
    fn without_jitter_schedules_exact_delay() {
        let backoff = Backoff::default().without_jitter();
        let delay = backoff.schedule(2, None);
        assert_eq!(delay.scheduled, Duration::from_secs(4));
        assert_eq!(delay.jitter_ms, 0);
    }

    #[test]
    fn retry_hint_is_a_floor_capped_at_max() {
        let backoff = Backoff::default().without_jitter();
        assert_eq!(
            backoff.schedule(0, Some(Duration::from_secs(3))).scheduled,
            Duration::from_secs(3)
        );
        assert_eq!(
            backoff.schedule(2, Some(Duration::from_secs(3))).scheduled,
            Duration::from_secs(4)
        );
        assert_eq!(
            backoff.schedule(0, Some(Duration::from_secs(60))).scheduled,
            Duration::from_secs(5)
        );
    }

    #[test]
    fn rejects_invalid_settings() {
        let zero = Backoff::new(Duration::ZERO, Duration::from_secs(5));
        assert!(zero.validate().is_err());

        let wide = Backoff {
            jitter: 1.5,
            ..Backoff::default()
        };
        assert!(matches!(
            wide.validate(),
            Err(ValidationError::InvalidJitter { .. })
        ));
    }

    #[test]
    fn rejects_shrinking_or_non_finite_factor() {
        for factor in [-2.0, 0.5, f64::NAN, f64::INFINITY] {
            let backoff = Backoff {
                factor,
                ..Backoff::default()
            };
            assert!(
                matches!(
                    backoff.validate(),
                    Err(ValidationError::InvalidBackoffFactor { .. })
                ),
                "factor {factor}"
            );
        }
        let flat = Backoff {
            factor: 1.0,
            ..Backoff::default()
        };
        assert!(flat.validate().is_ok());
    }

    #[test]
    fn rejects_max_below_base() {
        let backoff = Backoff::new(Duration::from_secs(1), Duration::ZERO);
        assert_eq!(
            backoff.validate(),
            Err(ValidationError::BackoffMaxBelowBase {
                base_ms: 1_000,
                max_ms: 0,
            })
        );
    }

    #[test]
    fn unvalidated_negative_factor_does_not_panic() {
        let backoff = Backoff {
            factor: -2.0,
            ..Backoff::default()
        }
        .without_jitter();
        for attempt in 0..6 {
            assert!(backoff.schedule(attempt, None).scheduled <= backoff.max);
        }
    }
}

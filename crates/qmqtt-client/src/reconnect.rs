//! Reconnect backoff.

use std::time::Duration;

use rand::Rng;

use crate::config::ReconnectConfig;

/// Delay before reconnect `attempt` (starting at 1), without jitter:
/// `min(initial * multiplier^(attempt - 1), max)`.
pub fn base_delay(config: &ReconnectConfig, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
    let factor = config.multiplier.max(1.0).powi(exponent);
    let secs = config.initial_delay.as_secs_f64() * factor;
    let max = config.max_delay.as_secs_f64();
    if !secs.is_finite() || secs >= max {
        config.max_delay
    } else {
        Duration::from_secs_f64(secs)
    }
}

/// Spread `delay` uniformly by up to `jitter` of its length either way.
pub fn apply_jitter<R: Rng + ?Sized>(delay: Duration, jitter: f64, rng: &mut R) -> Duration {
    let jitter = jitter.clamp(0.0, 1.0);
    if jitter == 0.0 || delay.is_zero() {
        return delay;
    }
    let factor = rng.gen_range((1.0 - jitter)..=(1.0 + jitter));
    delay.mul_f64(factor)
}

/// Jittered delay before reconnect `attempt`.
pub fn next_delay(config: &ReconnectConfig, attempt: u32) -> Duration {
    apply_jitter(
        base_delay(config, attempt),
        config.jitter,
        &mut rand::thread_rng(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_growth_and_cap() {
        let config = ReconnectConfig::enabled();
        let delays: Vec<u64> = (1..=8)
            .map(|n| base_delay(&config, n).as_secs())
            .collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 32, 60, 60]);
        assert_eq!(base_delay(&config, u32::MAX), Duration::from_secs(60));
    }

    #[test]
    fn test_attempt_zero_uses_initial() {
        let config = ReconnectConfig::enabled();
        assert_eq!(base_delay(&config, 0), Duration::from_secs(1));
    }

    #[test]
    fn test_jitter_bounds() {
        let mut rng = rand::thread_rng();
        let base = Duration::from_secs(10);
        for _ in 0..200 {
            let d = apply_jitter(base, 0.1, &mut rng);
            assert!(d >= Duration::from_millis(8_999) && d <= Duration::from_millis(11_001));
        }
        assert_eq!(apply_jitter(base, 0.0, &mut rng), base);
    }

    #[test]
    fn test_next_delay_without_jitter_is_exact() {
        let config = ReconnectConfig {
            jitter: 0.0,
            ..ReconnectConfig::enabled()
        };
        assert_eq!(next_delay(&config, 3), Duration::from_secs(4));
    }
}

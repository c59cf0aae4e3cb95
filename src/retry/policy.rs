use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Strategy for spacing reconnect attempts with multiplicative backoff.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    /// Delay before the first retry, and after every successful open.
    #[serde(with = "millis", rename = "base_delay_ms")]
    pub base_delay: Duration,
    /// Maximum delay cap for later retries.
    #[serde(with = "millis", rename = "max_delay_ms")]
    pub max_delay: Duration,
    /// Growth factor applied after each failed attempt.
    pub multiplier: f64,
    /// Jitter ratio (0.0..=1.0); up to this fraction of the delay is added.
    pub jitter_ratio: f64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::tunnel_default()
    }
}

impl ReconnectPolicy {
    /// Default policy for devhook tunnel reconnects.
    pub fn tunnel_default() -> Self {
        Self {
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(10),
            multiplier: 1.5,
            jitter_ratio: 0.20,
        }
    }

    /// Same schedule without randomness.
    pub fn without_jitter(mut self) -> Self {
        self.jitter_ratio = 0.0;
        self
    }

    /// The delay that follows `current` after one more failure.
    ///
    /// Works in whole milliseconds and rounds down, so the schedule is
    /// 250, 375, 562, 843, ... for the default policy.
    pub fn grow(&self, current: Duration) -> Duration {
        let millis = current.as_millis() as f64 * self.multiplier.max(1.0);
        let grown = Duration::from_millis(millis.floor() as u64);
        grown.min(self.max_delay)
    }

    /// Add up to `jitter_ratio * delay` of uniformly random extra wait.
    pub fn with_jitter(&self, delay: Duration) -> Duration {
        if self.jitter_ratio <= 0.0 {
            return delay;
        }
        let ratio = self.jitter_ratio.clamp(0.0, 1.0);
        let spread = delay.as_millis() as f64 * ratio;
        let extra = rand::random::<f64>() * spread;
        delay + Duration::from_millis(extra.round() as u64)
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn growth_rounds_down_and_caps() {
        let policy = ReconnectPolicy::tunnel_default();
        assert_eq!(
            policy.grow(Duration::from_millis(250)),
            Duration::from_millis(375)
        );
        assert_eq!(
            policy.grow(Duration::from_millis(375)),
            Duration::from_millis(562)
        );
        assert_eq!(
            policy.grow(Duration::from_millis(9_000)),
            Duration::from_secs(10)
        );
    }

    #[test]
    fn jitter_stays_within_ratio() {
        let policy = ReconnectPolicy::tunnel_default();
        let delay = Duration::from_millis(1_000);
        for _ in 0..200 {
            let jittered = policy.with_jitter(delay);
            assert!(jittered >= delay);
            assert!(jittered <= Duration::from_millis(1_200));
        }
    }

    #[test]
    fn zero_jitter_is_identity() {
        let policy = ReconnectPolicy::tunnel_default().without_jitter();
        let delay = Duration::from_millis(843);
        assert_eq!(policy.with_jitter(delay), delay);
    }

    #[test]
    fn policy_reads_millisecond_fields_from_toml() {
        let policy: ReconnectPolicy =
            toml::from_str("base_delay_ms = 100\nmax_delay_ms = 2000\njitter_ratio = 0.0")
                .expect("policy should parse");
        assert_eq!(policy.base_delay, Duration::from_millis(100));
        assert_eq!(policy.max_delay, Duration::from_secs(2));
        assert_eq!(policy.multiplier, 1.5);
        assert_eq!(policy.jitter_ratio, 0.0);
    }
}

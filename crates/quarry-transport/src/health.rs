// Copyright 2025 Quarry Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use quarry_common::protocol::error::{Result, TransportError};
use quarry_common::NodeAddress;
use serde::Serialize;
use std::time::Duration;
use tokio::time::Instant;

/// Upper bound accepted for `max_delay`
pub const MAX_BACKOFF_DELAY: Duration = Duration::from_secs(30 * 86_400);

// Resurrection time used when `now + delay` does not fit in an `Instant`
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// Dead-node backoff configuration
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Delay after the first failure
    pub base_delay: Duration,
    /// Exponential backoff multiplier, at least 1.0
    pub factor: f64,
    /// Maximum delay cap
    pub max_delay: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(60),
            factor: 2.0,
            // 60s doubled five times
            max_delay: Duration::from_secs(1920),
        }
    }
}

impl BackoffConfig {
    /// Calculate the resurrection delay for a node with `consecutive_failures`
    /// failures: `min(base * factor^(failures - 1), max)`.
    pub fn delay_for(&self, consecutive_failures: u32) -> Duration {
        let exponent = consecutive_failures.saturating_sub(1).min(i32::MAX as u32) as i32;
        let scaled = self.base_delay.as_secs_f64() * self.factor.powi(exponent);
        if scaled.is_nan() || scaled >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        // a factor below zero flips the sign on odd exponents
        if scaled <= 0.0 {
            return self.base_delay.min(self.max_delay);
        }
        Duration::from_secs_f64(scaled).min(self.max_delay)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.factor.is_finite() || self.factor < 1.0 {
            return Err(TransportError::InvalidConfig(format!(
                "backoff factor must be a finite number >= 1.0, got {}",
                self.factor
            )));
        }
        if self.base_delay > self.max_delay {
            return Err(TransportError::InvalidConfig(format!(
                "base delay {:?} exceeds max delay {:?}",
                self.base_delay, self.max_delay
            )));
        }
        if self.max_delay > MAX_BACKOFF_DELAY {
            return Err(TransportError::InvalidConfig(format!(
                "max delay {:?} exceeds the {:?} limit",
                self.max_delay, MAX_BACKOFF_DELAY
            )));
        }
        Ok(())
    }
}

/// Failure bookkeeping for one node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailureRecord {
    pub consecutive_failures: u32,
    pub resurrect_at: Instant,
}

impl FailureRecord {
    pub(crate) fn new(now: Instant) -> Self {
        Self {
            consecutive_failures: 0,
            resurrect_at: now,
        }
    }

    /// Count one more failure and push the resurrection time out.
    ///
    /// `resurrect_at` never moves backwards.
    pub(crate) fn record_failure(&mut self, now: Instant, backoff: &BackoffConfig) -> Duration {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        let delay = backoff.delay_for(self.consecutive_failures);
        let due = now
            .checked_add(delay)
            .or_else(|| now.checked_add(FAR_FUTURE))
            .unwrap_or(now);
        self.resurrect_at = self.resurrect_at.max(due);
        delay
    }

    pub fn is_due(&self, now: Instant) -> bool {
        self.resurrect_at <= now
    }

    pub fn remaining(&self, now: Instant) -> Duration {
        self.resurrect_at.saturating_duration_since(now)
    }
}

/// Point-in-time view of one node's health.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeStatus {
    pub address: NodeAddress,
    pub alive: bool,
    pub consecutive_failures: u32,
    /// Milliseconds until a dead node becomes eligible again
    pub resurrect_in_ms: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_config_default() {
        let config = BackoffConfig::default();
        assert_eq!(config.base_delay, Duration::from_secs(60));
        assert_eq!(config.factor, 2.0);
        assert_eq!(config.max_delay, Duration::from_secs(1920));
    }

    #[test]
    fn test_delay_for() {
        let config = BackoffConfig {
            base_delay: Duration::from_secs(30),
            factor: 2.0,
            max_delay: Duration::from_secs(300),
        };

        assert_eq!(config.delay_for(1).as_secs(), 30);
        assert_eq!(config.delay_for(2).as_secs(), 60);
        assert_eq!(config.delay_for(3).as_secs(), 120);
        assert_eq!(config.delay_for(4).as_secs(), 240);
        // capped at max
        assert_eq!(config.delay_for(5).as_secs(), 300);
        assert_eq!(config.delay_for(10).as_secs(), 300);
        assert_eq!(config.delay_for(u32::MAX).as_secs(), 300);
    }

    #[test]
    fn test_delay_for_zero_failures_is_base() {
        let config = BackoffConfig::default();
        assert_eq!(config.delay_for(0), config.base_delay);
    }

    #[test]
    fn test_delay_is_non_decreasing_and_bounded() {
        let config = BackoffConfig {
            base_delay: Duration::from_millis(250),
            factor: 1.5,
            max_delay: Duration::from_secs(20),
        };
        let mut previous = Duration::ZERO;
        for failures in 1..200 {
            let delay = config.delay_for(failures);
            assert!(delay >= previous);
            assert!(delay <= config.max_delay);
            previous = delay;
        }
    }

    #[test]
    fn test_validate() {
        assert!(BackoffConfig::default().validate().is_ok());

        let shrinking = BackoffConfig {
            factor: 0.5,
            ..Default::default()
        };
        assert!(shrinking.validate().is_err());

        let inverted = BackoffConfig {
            base_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(1),
            ..Default::default()
        };
        assert!(inverted.validate().is_err());

        let huge = BackoffConfig {
            base_delay: Duration::from_secs(u64::MAX),
            factor: 2.0,
            max_delay: Duration::from_secs(u64::MAX),
        };
        assert!(huge.validate().is_err());
    }

    #[test]
    fn test_delay_for_negative_factor_stays_in_range() {
        let config = BackoffConfig {
            base_delay: Duration::from_secs(1),
            factor: -2.0,
            max_delay: Duration::from_secs(8),
        };
        for failures in 1..10 {
            let delay = config.delay_for(failures);
            assert!(delay <= config.max_delay);
        }
        assert_eq!(config.delay_for(2), Duration::from_secs(1));
    }

    #[test]
    fn test_failure_record_with_unrepresentable_delay() {
        let config = BackoffConfig {
            base_delay: Duration::from_secs(u64::MAX),
            factor: 2.0,
            max_delay: Duration::from_secs(u64::MAX),
        };
        let now = Instant::now();
        let mut record = FailureRecord::new(now);

        assert_eq!(record.record_failure(now, &config), config.max_delay);
        assert!(record.resurrect_at > now);
        assert!(!record.is_due(now + Duration::from_secs(86_400)));

        record.record_failure(now, &config);
        assert_eq!(record.consecutive_failures, 2);
    }

    #[test]
    fn test_failure_record_escalates() {
        let config = BackoffConfig {
            base_delay: Duration::from_secs(1),
            factor: 2.0,
            max_delay: Duration::from_secs(4),
        };
        let now = Instant::now();
        let mut record = FailureRecord::new(now);

        assert_eq!(record.record_failure(now, &config), Duration::from_secs(1));
        assert_eq!(record.consecutive_failures, 1);
        assert_eq!(record.resurrect_at, now + Duration::from_secs(1));

        assert_eq!(record.record_failure(now, &config), Duration::from_secs(2));
        assert_eq!(record.resurrect_at, now + Duration::from_secs(2));

        assert_eq!(record.record_failure(now, &config), Duration::from_secs(4));
        assert_eq!(record.record_failure(now, &config), Duration::from_secs(4));
        assert_eq!(record.consecutive_failures, 4);
    }

    #[test]
    fn test_failure_record_due() {
        let config = BackoffConfig {
            base_delay: Duration::from_secs(5),
            ..Default::default()
        };
        let now = Instant::now();
        let mut record = FailureRecord::new(now);
        record.record_failure(now, &config);

        assert!(!record.is_due(now));
        assert_eq!(record.remaining(now), Duration::from_secs(5));
        assert!(record.is_due(now + Duration::from_secs(5)));
        assert_eq!(record.remaining(now + Duration::from_secs(6)), Duration::ZERO);
    }
}

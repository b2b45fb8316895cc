use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::sleep;

pub struct ReconnectManager {
    min_interval: Duration,

    max_interval: Duration,

    /// Exponential backoff multiplier
    backoff_multiplier: f64,

    /// None means unlimited retries
    max_attempts: Option<u32>,
}

impl ReconnectManager {
    pub fn new() -> Self {
        Self {
            min_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            max_attempts: None,
        }
    }

    pub fn min_interval(mut self, interval: Duration) -> Self {
        self.min_interval = interval;
        self
    }

    pub fn max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = interval;
        self
    }

    pub fn backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    /// Call `connect_fn` until it succeeds, sleeping with exponential backoff
    /// between attempts.
    pub async fn reconnect_loop<F, Fut, E>(&self, mut connect_fn: F) -> Result<()>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<(), E>>,
        E: std::fmt::Display,
    {
        let mut attempt = 0;
        let mut current_interval = self.min_interval;

        loop {
            attempt += 1;

            if let Some(max) = self.max_attempts {
                if attempt > max {
                    return Err(anyhow::anyhow!("Max reconnect attempts ({max}) exceeded"));
                }
            }

            log::info!("Reconnect attempt #{attempt}");

            match connect_fn().await {
                Ok(()) => {
                    log::info!("Reconnected successfully after {attempt} attempts");
                    return Ok(());
                }
                Err(e) => {
                    log::warn!("Reconnect attempt #{attempt} failed: {e}");

                    log::debug!("Waiting {current_interval:?} before next attempt");
                    sleep(current_interval).await;

                    current_interval = self.next_interval(current_interval);
                }
            }
        }
    }

    fn next_interval(&self, current: Duration) -> Duration {
        let scaled = current.as_secs_f64() * self.backoff_multiplier;
        std::cmp::min(Duration::from_secs_f64(scaled), self.max_interval)
    }
}

impl Default for ReconnectManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Reconnect settings, as read from the `[rpc.reconnect]` config table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub enabled: bool,
    pub min_interval_ms: u64,
    pub max_interval_ms: u64,
    pub backoff_multiplier: f64,
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_interval_ms: 1_000,
            max_interval_ms: 60_000,
            backoff_multiplier: 2.0,
            max_attempts: None,
        }
    }
}

impl ReconnectConfig {
    pub fn create_manager(&self) -> ReconnectManager {
        let mut manager = ReconnectManager::new()
            .min_interval(Duration::from_millis(self.min_interval_ms))
            .max_interval(Duration::from_millis(self.max_interval_ms))
            .backoff_multiplier(self.backoff_multiplier);

        if let Some(max) = self.max_attempts {
            manager = manager.max_attempts(max);
        }

        manager
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_reconnect_manager_builder() {
        let manager = ReconnectManager::new()
            .min_interval(Duration::from_millis(500))
            .max_interval(Duration::from_secs(30))
            .backoff_multiplier(1.5)
            .max_attempts(5);

        assert_eq!(manager.min_interval, Duration::from_millis(500));
        assert_eq!(manager.max_interval, Duration::from_secs(30));
        assert_eq!(manager.max_attempts, Some(5));
    }

    #[test]
    fn test_backoff_is_capped() {
        let manager = ReconnectManager::new()
            .min_interval(Duration::from_secs(1))
            .max_interval(Duration::from_secs(3));

        assert_eq!(manager.next_interval(Duration::from_secs(1)), Duration::from_secs(2));
        assert_eq!(manager.next_interval(Duration::from_secs(2)), Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_reconnect_with_max_attempts() {
        let manager = ReconnectManager::new()
            .min_interval(Duration::from_millis(5))
            .max_attempts(3);

        let attempt_count = Arc::new(AtomicU32::new(0));
        let attempt_count_clone = attempt_count.clone();

        let result = manager
            .reconnect_loop(|| {
                let count = attempt_count_clone.fetch_add(1, Ordering::SeqCst);
                async move { Err::<(), _>(format!("Simulated connection failure #{}", count + 1)) }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(attempt_count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_reconnect_success_after_failures() {
        let manager = ReconnectManager::new().min_interval(Duration::from_millis(5));

        let attempt_count = Arc::new(AtomicU32::new(0));
        let attempt_count_clone = attempt_count.clone();

        let result = manager
            .reconnect_loop(|| {
                let count = attempt_count_clone.fetch_add(1, Ordering::SeqCst);
                async move {
                    if count < 2 {
                        Err(format!("Simulated connection failure #{}", count + 1))
                    } else {
                        Ok(())
                    }
                }
            })
            .await;

        assert!(result.is_ok());
        assert_eq!(attempt_count.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_reconnect_config() {
        let config = ReconnectConfig::default();
        assert!(config.enabled);

        let manager = config.create_manager();
        assert_eq!(manager.min_interval, Duration::from_secs(1));
        assert_eq!(manager.max_interval, Duration::from_secs(60));
    }
}

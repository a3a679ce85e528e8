//! Reconnection delay between registration attempts

use deskrelay_connection::CancellationToken;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Reconnection configuration
///
/// The default is a fixed 1 second delay with unlimited attempts.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Initial backoff duration
    pub initial_backoff: Duration,
    /// Maximum backoff duration
    pub max_backoff: Duration,
    /// Backoff multiplier (1.0 keeps the delay fixed)
    pub multiplier: f64,
    /// Maximum number of consecutive failed attempts (None = unlimited)
    pub max_attempts: Option<usize>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            multiplier: 1.0,
            max_attempts: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum ReconnectError {
    #[error("Max reconnection attempts reached")]
    MaxAttemptsReached,

    #[error("Reconnection cancelled")]
    Cancelled,
}

pub struct ReconnectManager {
    config: ReconnectConfig,
    current_backoff: Duration,
    attempt: usize,
}

impl ReconnectManager {
    pub fn new(config: ReconnectConfig) -> Self {
        Self {
            current_backoff: config.initial_backoff,
            config,
            attempt: 0,
        }
    }

    /// Wait before the next attempt, returning early if `cancel` fires
    pub async fn wait(&mut self, cancel: &CancellationToken) -> Result<(), ReconnectError> {
        self.attempt += 1;

        if let Some(max_attempts) = self.config.max_attempts {
            if self.attempt > max_attempts {
                return Err(ReconnectError::MaxAttemptsReached);
            }
        }

        debug!(
            "Waiting {:?} before reconnection attempt {}",
            self.current_backoff, self.attempt
        );

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ReconnectError::Cancelled),
            _ = tokio::time::sleep(self.current_backoff) => {}
        }

        let next_backoff = Duration::from_secs_f64(
            self.current_backoff.as_secs_f64() * self.config.multiplier.max(1.0),
        );
        self.current_backoff = next_backoff.min(self.config.max_backoff);

        Ok(())
    }

    /// Reset backoff (call after a successful relay session)
    pub fn reset(&mut self) {
        self.current_backoff = self.config.initial_backoff;
        self.attempt = 0;
    }

    pub fn attempt(&self) -> usize {
        self.attempt
    }

    pub fn current_backoff(&self) -> Duration {
        self.current_backoff
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_default_delay_is_fixed() {
        let mut manager = ReconnectManager::new(ReconnectConfig {
            initial_backoff: Duration::from_millis(5),
            ..Default::default()
        });
        let cancel = CancellationToken::new();

        manager.wait(&cancel).await.unwrap();
        manager.wait(&cancel).await.unwrap();
        assert_eq!(manager.attempt(), 2);
        assert_eq!(manager.current_backoff(), Duration::from_millis(5));
    }

    #[tokio::test]
    async fn test_backoff_grows_to_cap() {
        let mut manager = ReconnectManager::new(ReconnectConfig {
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(30),
            multiplier: 2.0,
            max_attempts: None,
        });
        let cancel = CancellationToken::new();

        manager.wait(&cancel).await.unwrap();
        assert_eq!(manager.current_backoff(), Duration::from_millis(20));
        manager.wait(&cancel).await.unwrap();
        assert_eq!(manager.current_backoff(), Duration::from_millis(30));

        manager.reset();
        assert_eq!(manager.attempt(), 0);
        assert_eq!(manager.current_backoff(), Duration::from_millis(10));
    }

    #[tokio::test]
    async fn test_max_attempts() {
        let mut manager = ReconnectManager::new(ReconnectConfig {
            initial_backoff: Duration::from_millis(1),
            max_attempts: Some(2),
            ..Default::default()
        });
        let cancel = CancellationToken::new();

        assert!(manager.wait(&cancel).await.is_ok());
        assert!(manager.wait(&cancel).await.is_ok());
        assert!(matches!(
            manager.wait(&cancel).await,
            Err(ReconnectError::MaxAttemptsReached)
        ));
    }

    #[tokio::test]
    async fn test_wait_is_cancellable() {
        let mut manager = ReconnectManager::new(ReconnectConfig {
            initial_backoff: Duration::from_secs(60),
            ..Default::default()
        });
        let cancel = CancellationToken::new();
        cancel.cancel();

        let started = std::time::Instant::now();
        assert!(matches!(
            manager.wait(&cancel).await,
            Err(ReconnectError::Cancelled)
        ));
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}

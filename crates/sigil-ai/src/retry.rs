//! Retry decorator for transient provider failures

use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::{
    error::{Error, Result, is_transient_error},
    provider::Provider,
    stream::ChunkStream,
    types::{Message, ToolDef},
};

/// Retry configuration
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts after the initial call
    pub max_retries: u32,
    /// Initial delay between retries
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryConfig {
    /// Calculate the backoff delay for a given attempt (0-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay = self.initial_delay.as_secs_f64() * 2f64.powi(attempt as i32);
        Duration::from_secs_f64(delay.min(self.max_delay.as_secs_f64()))
    }
}

/// Transparent retry decorator around a [`Provider`].
///
/// Transient failures (429, 5xx, connection refused, timeout, EOF, reset by
/// peer) are retried with exponential backoff; fatal errors and cancellation
/// surface immediately.
pub struct RetryProvider<P> {
    inner: P,
    config: RetryConfig,
}

impl<P: Provider> RetryProvider<P> {
    pub fn new(inner: P) -> Self {
        Self {
            inner,
            config: RetryConfig::default(),
        }
    }

    pub fn with_config(inner: P, config: RetryConfig) -> Self {
        Self { inner, config }
    }
}

#[async_trait]
impl<P: Provider> Provider for RetryProvider<P> {
    async fn chat(
        &self,
        messages: &[Message],
        tools: &[ToolDef],
        cancel: CancellationToken,
    ) -> Result<ChunkStream> {
        let mut attempt = 0u32;

        loop {
            if cancel.is_cancelled() {
                return Err(Error::Aborted);
            }

            match self.inner.chat(messages, tools, cancel.clone()).await {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    let message = e.to_string();
                    let retryable = e.is_transient() || is_transient_error(&message);

                    if !retryable || attempt >= self.config.max_retries {
                        return Err(e);
                    }

                    let delay = self.config.delay_for_attempt(attempt);
                    tracing::warn!(
                        "Provider call failed (attempt {}/{}): {}. Retrying in {:?}...",
                        attempt + 1,
                        self.config.max_retries + 1,
                        message,
                        delay
                    );
                    attempt += 1;

                    tokio::select! {
                        _ = cancel.cancelled() => return Err(Error::Aborted),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }
}

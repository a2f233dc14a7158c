//! Model provider implementations

pub mod anthropic;

use std::future::Future;
use std::time::Duration;

use crate::{CompleteOptions, Completion, Context, Result};
use async_trait::async_trait;

/// A language-model backend the turn engine can ask for a completion
#[async_trait]
pub trait ModelGateway: Send + Sync {
    /// Send the conversation and return the model's answer or tool requests
    async fn complete(&self, context: &Context, options: &CompleteOptions) -> Result<Completion>;
}

/// Retry policy for transient provider failures
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Number of retries after the first attempt
    pub max_retries: u32,
    /// Fixed delay between attempts
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 1,
            backoff: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    /// Never retry
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            backoff: Duration::ZERO,
        }
    }

    /// Run `op`, retrying retryable errors up to `max_retries` times
    pub async fn run<T, F, Fut>(&self, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0u32;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < self.max_retries => {
                    attempt += 1;
                    tracing::warn!(
                        "Model request failed (attempt {}/{}): {}. Retrying in {:?}...",
                        attempt,
                        self.max_retries + 1,
                        e,
                        self.backoff
                    );
                    tokio::time::sleep(self.backoff).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

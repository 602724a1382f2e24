//! Bounded retries for live calls against the remote API
use backon::{BackoffBuilder, ConstantBuilder};
use std::{future::Future, time::Duration};

/// How often, and how far apart, a live call is attempted
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryConfig {
    /// Total number of attempts, including the first one
    pub attempts: usize,
    /// Delay between attempts
    pub delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: 3,
            delay: Duration::from_secs(1),
        }
    }
}

impl RetryConfig {
    #[must_use]
    pub fn attempts(mut self, attempts: usize) -> Self {
        self.attempts = attempts;
        self
    }

    #[must_use]
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

/// Outcome of a failed attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attempt<E> {
    /// Try again if attempts remain
    Retry(E),
    /// Give up immediately and report this error
    Stop(E),
}

impl<E> Attempt<E> {
    pub fn into_inner(self) -> E {
        match self {
            Attempt::Retry(e) | Attempt::Stop(e) => e,
        }
    }
}

/// Run `op` until it succeeds, stops, or runs out of attempts
///
/// The error of the last attempt is returned when attempts run out.
pub async fn retry<T, E, F, Fut>(config: &RetryConfig, mut op: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, Attempt<E>>>,
    E: std::fmt::Display,
{
    let mut delays = ConstantBuilder::default()
        .with_delay(config.delay)
        .with_max_times(config.attempts.saturating_sub(1))
        .build();
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(Attempt::Stop(err)) => return Err(err),
            Err(Attempt::Retry(err)) => match delays.next() {
                Some(delay) => {
                    tracing::debug!(error = %err, ?delay, "attempt failed, retrying");
                    tokio::time::sleep(delay).await;
                }
                None => return Err(err),
            },
        }
    }
}

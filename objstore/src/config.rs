//! Configuration of an [`ObjectStore`](crate::ObjectStore)
pub use crate::{backoff::BackoffConfig, informer::InformerConfig, retry::RetryConfig, watcher::Config as WatcherConfig};

/// Configuration of an [`ObjectStore`](crate::ObjectStore)
///
/// ```
/// use objstore::{Config, RetryConfig};
/// let config = Config::default()
///     .retry(RetryConfig::default().attempts(5))
///     .prewarm(false);
/// assert_eq!(config.retry.attempts, 5);
/// ```
#[derive(Clone, Debug, PartialEq)]
pub struct Config {
    /// Retries of live gets
    pub retry: RetryConfig,
    /// Throttling of keys whose live fetch failed or found nothing
    pub backoff: BackoffConfig,
    /// Informers started for watched coordinates
    pub informer: InformerConfig,
    /// Size of the notification mailbox
    pub notification_capacity: usize,
    /// Create informer factories for every namespace up front
    pub prewarm: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            backoff: BackoffConfig::default(),
            informer: InformerConfig::default(),
            notification_capacity: 64,
            prewarm: true,
        }
    }
}

impl Config {
    #[must_use]
    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    #[must_use]
    pub fn backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    #[must_use]
    pub fn informer(mut self, informer: InformerConfig) -> Self {
        self.informer = informer;
        self
    }

    #[must_use]
    pub fn notification_capacity(mut self, capacity: usize) -> Self {
        self.notification_capacity = capacity;
        self
    }

    #[must_use]
    pub fn prewarm(mut self, prewarm: bool) -> Self {
        self.prewarm = prewarm;
        self
    }
}

//! Backoff state for repeated attempts
use backon::{Backoff, BackoffBuilder, ExponentialBuilder};
use objstore_core::Key;
use parking_lot::Mutex;
use std::{
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

/// Parameters of an exponential backoff
#[derive(Clone, Debug, PartialEq)]
pub struct BackoffConfig {
    /// The first delay
    pub initial: Duration,
    /// Multiplier applied after every step
    pub factor: f32,
    /// Fraction of the current delay added at random on top of it
    pub jitter: f64,
    /// Number of growth steps, after which the cap is returned
    pub max_steps: usize,
    /// Upper bound of the un-jittered delay
    pub cap: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            factor: 2.0,
            jitter: 0.1,
            max_steps: 50,
            cap: Duration::from_secs(600),
        }
    }
}

impl BackoffConfig {
    #[must_use]
    pub fn initial(mut self, initial: Duration) -> Self {
        self.initial = initial;
        self
    }

    #[must_use]
    pub fn factor(mut self, factor: f32) -> Self {
        self.factor = factor;
        self
    }

    #[must_use]
    pub fn jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }

    #[must_use]
    pub fn max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps;
        self
    }

    #[must_use]
    pub fn cap(mut self, cap: Duration) -> Self {
        self.cap = cap;
        self
    }

    /// A backon builder growing like this config, without jitter
    pub fn builder(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(self.initial)
            .with_factor(self.factor)
            .with_max_delay(self.cap)
            .with_max_times(self.max_steps)
    }

    pub(crate) fn jittered(&self, delay: Duration) -> Duration {
        if self.jitter <= 0.0 {
            return delay;
        }
        delay + delay.mul_f64(self.jitter * rand::random::<f64>())
    }
}

/// A [`Backoff`] that can also be reset.
///
/// Implemented by [`ResettableBackoffWrapper`].
pub trait ResettableBackoff: Backoff {
    fn reset(&mut self);
}

/// Implements [`ResettableBackoff`] by reconstructing the backing [`Backoff`] each time [`Self::reset`] has been called.
#[derive(Debug)]
pub struct ResettableBackoffWrapper<B: BackoffBuilder> {
    backoff_builder: B,
    current_backoff: Option<B::Backoff>,
}

impl<B: BackoffBuilder> ResettableBackoffWrapper<B> {
    pub fn new(backoff_builder: B) -> Self {
        Self {
            backoff_builder,
            current_backoff: None,
        }
    }
}

impl<B: BackoffBuilder + Clone> Iterator for ResettableBackoffWrapper<B> {
    type Item = Duration;

    fn next(&mut self) -> Option<Self::Item> {
        self.current_backoff
            .get_or_insert_with(|| self.backoff_builder.clone().build())
            .next()
    }
}

impl<B: BackoffBuilder + Clone> ResettableBackoff for ResettableBackoffWrapper<B> {
    fn reset(&mut self) {
        self.current_backoff = None;
    }
}

/// Retry state for one [`Key`]
///
/// Callers use the waiting flag to avoid overlapping attempts for the same key, and
/// [`BackoffEntry::wait`] to space out attempts.
pub struct BackoffEntry {
    key: Key,
    waiting: AtomicBool,
    config: BackoffConfig,
    backoff: Mutex<ResettableBackoffWrapper<ExponentialBuilder>>,
}

impl BackoffEntry {
    pub fn new(key: Key, config: BackoffConfig) -> Self {
        let backoff = ResettableBackoffWrapper::new(config.builder());
        Self {
            key,
            waiting: AtomicBool::new(false),
            config,
            backoff: Mutex::new(backoff),
        }
    }

    pub fn key(&self) -> &Key {
        &self.key
    }

    pub fn is_waiting(&self) -> bool {
        self.waiting.load(Ordering::Acquire)
    }

    pub fn set_waiting(&self, waiting: bool) {
        self.waiting.store(waiting, Ordering::Release);
    }

    /// Advance one step and return how long to wait before the next attempt
    ///
    /// Once the steps run out the cap is returned on every call.
    pub fn wait(&self) -> Duration {
        let base = self.backoff.lock().next().unwrap_or(self.config.cap);
        self.config.jittered(base)
    }

    /// Start growing from the initial delay again
    pub fn reset(&self) {
        self.backoff.lock().reset();
    }
}

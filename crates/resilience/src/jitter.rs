//! Random source for backoff jitter

use std::sync::Arc;

use rand::Rng;

/// Uniform random source used to spread retry delays.
pub trait JitterSource: Send + Sync + 'static {
    /// Draw a value uniformly from `[low, high]`.
    fn sample(&self, low: f64, high: f64) -> f64;
}

/// Jitter drawn from the thread-local RNG.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadRngJitter;

impl JitterSource for ThreadRngJitter {
    fn sample(&self, low: f64, high: f64) -> f64 {
        if high <= low {
            return low;
        }
        rand::thread_rng().gen_range(low..=high)
    }
}

/// Shared jitter handle.
pub type SharedJitter = Arc<dyn JitterSource>;

pub(crate) fn thread_rng_jitter() -> SharedJitter {
    Arc::new(ThreadRngJitter)
}

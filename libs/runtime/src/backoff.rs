use std::sync::Mutex;
use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBackoff, ExponentialBuilder};

const MIN_DELAY: Duration = Duration::from_millis(100);
const MAX_DELAY: Duration = Duration::from_secs(30);

fn builder() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(MIN_DELAY)
        .with_max_delay(MAX_DELAY)
        .with_jitter()
        .without_max_times()
}

/// Restart backoff for one controller. Grows exponentially across
/// consecutive failed runs, reset to the minimum when the controller reports
/// a successful pass.
pub struct RestartBackoff {
    inner: Mutex<ExponentialBackoff>,
}

impl RestartBackoff {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(builder().build()),
        }
    }

    pub fn next_delay(&self) -> Duration {
        let mut inner = self.inner.lock().expect("backoff lock poisoned");
        inner.next().unwrap_or(MAX_DELAY)
    }

    pub fn reset(&self) {
        let mut inner = self.inner.lock().expect("backoff lock poisoned");
        *inner = builder().build();
    }
}

impl Default for RestartBackoff {
    fn default() -> Self {
        Self::new()
    }
}

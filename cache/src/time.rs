//! Clock sources used for expiration, refresh and load timing.

use once_cell::sync::Lazy;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

// The single, static reference point for all time calculations in the cache.
// It is initialized lazily on its first use.
static CACHE_EPOCH: Lazy<Instant> = Lazy::new(Instant::now);

/// A source of monotonic time, in nanoseconds since an arbitrary origin.
///
/// The cache never looks at wall-clock time directly; every expiration and
/// refresh decision goes through the configured ticker. Tests use
/// [`ManualTicker`] to move time forward deterministically.
pub trait Ticker: Send + Sync {
  /// Returns the number of nanoseconds elapsed since this ticker's origin.
  fn read(&self) -> u64;
}

impl<T: Ticker + ?Sized> Ticker for Arc<T> {
  #[inline]
  fn read(&self) -> u64 {
    (**self).read()
  }
}

/// The default ticker, backed by [`Instant`].
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemTicker;

impl Ticker for SystemTicker {
  #[inline]
  fn read(&self) -> u64 {
    duration_to_nanos(now_duration())
  }
}

/// A ticker that only moves when told to.
///
/// Share it with the cache through an `Arc` so the test keeps a handle:
///
/// ```
/// use std::sync::Arc;
/// use std::time::Duration;
/// use fibre_loading_cache::{CacheBuilder, ManualTicker};
///
/// let ticker = Arc::new(ManualTicker::new());
/// let cache = CacheBuilder::new()
///   .expire_after_write(Duration::from_secs(1))
///   .ticker(ticker.clone())
///   .build()
///   .unwrap();
///
/// cache.insert("k", 1);
/// ticker.advance(Duration::from_secs(2));
/// assert!(cache.get_if_present(&"k").is_none());
/// ```
#[derive(Debug, Default)]
pub struct ManualTicker {
  nanos: AtomicU64,
}

impl ManualTicker {
  pub fn new() -> Self {
    Self::default()
  }

  /// Moves the ticker forward by `duration`.
  pub fn advance(&self, duration: Duration) {
    self
      .nanos
      .fetch_add(duration_to_nanos(duration), Ordering::SeqCst);
  }

  /// Sets the ticker to an absolute reading.
  pub fn set(&self, nanos: u64) {
    self.nanos.store(nanos, Ordering::SeqCst);
  }
}

impl Ticker for ManualTicker {
  #[inline]
  fn read(&self) -> u64 {
    self.nanos.load(Ordering::SeqCst)
  }
}

/// A helper to get the current time as a `Duration` since the epoch.
#[inline]
pub(crate) fn now_duration() -> Duration {
  Instant::now().saturating_duration_since(*CACHE_EPOCH)
}

/// Converts a duration to nanoseconds, saturating at `u64::MAX`.
#[inline]
pub(crate) fn duration_to_nanos(duration: Duration) -> u64 {
  u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX)
}

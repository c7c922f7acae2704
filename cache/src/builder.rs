use crate::config::{CacheConfig, Weigher};
use crate::error::BuildError;
use crate::handles::{Cache, LoadingCache};
use crate::listener::RemovalListener;
use crate::loader::CacheLoader;
use crate::reference::{KeyStrength, ValueStrength};
use crate::shared::CacheShared;
use crate::time::{self, SystemTicker, Ticker};

use core::fmt;
use std::hash::{BuildHasher, Hash};
use std::sync::Arc;
use std::time::Duration;

/// The number of entries each cache is sized for up front.
const DEFAULT_INITIAL_CAPACITY: usize = 16;

/// A builder for creating `Cache` and `LoadingCache` instances.
///
/// Every setting is optional. Without any, the cache is unbounded, never
/// expires entries and holds keys and values strongly.
///
/// ```
/// use std::time::Duration;
/// use fibre_loading_cache::CacheBuilder;
///
/// let cache = CacheBuilder::<String, Vec<u8>>::new()
///   .maximum_weight(1 << 20)
///   .weigher(|_key, value| value.len() as u32)
///   .expire_after_access(Duration::from_secs(300))
///   .build()
///   .unwrap();
///
/// cache.insert("blob".to_string(), vec![0; 1024]);
/// assert_eq!(cache.weighted_size(), 1024);
/// ```
pub struct CacheBuilder<K, V, H = ahash::RandomState> {
  initial_capacity: usize,
  concurrency_level: usize,
  maximum_size: Option<u64>,
  maximum_weight: Option<u64>,
  weigher: Option<Weigher<K, V>>,
  expire_after_write: Option<Duration>,
  expire_after_access: Option<Duration>,
  refresh_after_write: Option<Duration>,
  key_strength: Option<KeyStrength>,
  value_strength: Option<ValueStrength>,
  listener: Option<Arc<dyn RemovalListener<K, V>>>,
  ticker: Option<Arc<dyn Ticker>>,
  hasher: H,
  // Setter misuse is reported by `build`, not by the setter itself.
  misconfigured: Option<BuildError>,
}

// Manual Debug implementation for CacheBuilder.
impl<K, V, H> fmt::Debug for CacheBuilder<K, V, H> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("CacheBuilder")
      .field("initial_capacity", &self.initial_capacity)
      .field("concurrency_level", &self.concurrency_level)
      .field("maximum_size", &self.maximum_size)
      .field("maximum_weight", &self.maximum_weight)
      .field("has_weigher", &self.weigher.is_some())
      .field("expire_after_write", &self.expire_after_write)
      .field("expire_after_access", &self.expire_after_access)
      .field("refresh_after_write", &self.refresh_after_write)
      .field("key_strength", &self.key_strength)
      .field("value_strength", &self.value_strength)
      .field("has_listener", &self.listener.is_some())
      .finish_non_exhaustive()
  }
}

// --- General Configuration Methods ---
// This impl block has no restrictive bounds on K or V.
impl<K, V, H> CacheBuilder<K, V, H> {
  /// Sets how many entries the cache is sized for initially. The table grows
  /// past this as needed.
  pub fn initial_capacity(mut self, capacity: usize) -> Self {
    self.initial_capacity = capacity;
    self
  }

  /// Sets the expected number of concurrently writing threads.
  ///
  /// The cache is split into the smallest power of two of segments that
  /// covers this number, each with its own lock. Defaults to four times the
  /// number of CPUs.
  pub fn concurrency_level(mut self, level: usize) -> Self {
    self.concurrency_level = level;
    self
  }

  /// Bounds the cache to roughly `size` entries.
  ///
  /// The bound is divided evenly between segments and enforced per segment,
  /// so an entry may be evicted while the cache as a whole is below `size`.
  pub fn maximum_size(mut self, size: u64) -> Self {
    self.maximum_size = Some(size);
    self
  }

  /// Bounds the summed weight of all entries. Requires a [`weigher`].
  ///
  /// [`weigher`]: CacheBuilder::weigher
  pub fn maximum_weight(mut self, weight: u64) -> Self {
    self.maximum_weight = Some(weight);
    self
  }

  /// Sets the function computing each entry's weight. It is called once, when
  /// the entry is written. Zero-weight entries are never evicted for size.
  pub fn weigher<F>(mut self, weigher: F) -> Self
  where
    F: Fn(&K, &V) -> u32 + Send + Sync + 'static,
  {
    self.weigher = Some(Arc::new(weigher));
    self
  }

  /// Expires entries once `duration` has passed since they were written.
  pub fn expire_after_write(mut self, duration: Duration) -> Self {
    self.expire_after_write = Some(duration);
    self
  }

  /// Expires entries once `duration` has passed since they were last read or
  /// written.
  pub fn expire_after_access(mut self, duration: Duration) -> Self {
    self.expire_after_access = Some(duration);
    self
  }

  /// Reloads entries that are read more than `duration` after being written.
  ///
  /// The reading thread performs the reload; other readers keep getting the
  /// old value until it completes. A failed reload keeps the old value.
  /// Only valid for caches built with a loader.
  pub fn refresh_after_write(mut self, duration: Duration) -> Self {
    self.refresh_after_write = Some(duration);
    self
  }

  /// Holds keys weakly: an entry is collected once no one outside the cache
  /// holds its key.
  ///
  /// Keys must then be shared with the cache through `Arc`s, see
  /// [`Cache::insert_shared`] and [`LoadingCache::get_shared`]. Calls that
  /// take the key by value or by reference can still read existing entries,
  /// but cannot create one: `insert` stores nothing and the loading calls
  /// fail with [`CacheError::KeyNotRetained`]. Keys are still compared by
  /// value.
  ///
  /// [`CacheError::KeyNotRetained`]: crate::CacheError::KeyNotRetained
  pub fn weak_keys(mut self) -> Self {
    self.set_key_strength(KeyStrength::Weak);
    self
  }

  /// Holds values weakly: an entry is collected once no one outside the cache
  /// holds the `Arc` returned for its value.
  ///
  /// Write values with [`Cache::insert_arc`] and keep the `Arc`; a plain
  /// `insert` hands the cache the only reference.
  pub fn weak_values(mut self) -> Self {
    self.set_value_strength(ValueStrength::Weak);
    self
  }

  /// Holds values softly: they stay cached until
  /// [`Cache::release_soft_values`] signals memory pressure, after which only
  /// values still in use elsewhere survive.
  pub fn soft_values(mut self) -> Self {
    self.set_value_strength(ValueStrength::Soft);
    self
  }

  /// Sets the listener notified of every removal.
  ///
  /// Notifications are delivered on the thread of a cache operation after
  /// its segment lock is released. A panicking listener is logged and
  /// ignored.
  pub fn removal_listener<L>(mut self, listener: L) -> Self
  where
    L: RemovalListener<K, V> + 'static,
  {
    self.listener = Some(Arc::new(listener));
    self
  }

  /// Sets the time source for expiration, refresh and load timing.
  pub fn ticker<T>(mut self, ticker: T) -> Self
  where
    T: Ticker + 'static,
  {
    self.ticker = Some(Arc::new(ticker));
    self
  }

  /// Sets the hasher for the cache.
  pub fn hasher<H2>(self, hasher: H2) -> CacheBuilder<K, V, H2> {
    CacheBuilder {
      initial_capacity: self.initial_capacity,
      concurrency_level: self.concurrency_level,
      maximum_size: self.maximum_size,
      maximum_weight: self.maximum_weight,
      weigher: self.weigher,
      expire_after_write: self.expire_after_write,
      expire_after_access: self.expire_after_access,
      refresh_after_write: self.refresh_after_write,
      key_strength: self.key_strength,
      value_strength: self.value_strength,
      listener: self.listener,
      ticker: self.ticker,
      hasher,
      misconfigured: self.misconfigured,
    }
  }

  fn set_key_strength(&mut self, strength: KeyStrength) {
    match self.key_strength {
      Some(current) => {
        self
          .misconfigured
          .get_or_insert(BuildError::KeyStrengthAlreadySet(current.name()));
      }
      None => self.key_strength = Some(strength),
    }
  }

  fn set_value_strength(&mut self, strength: ValueStrength) {
    match self.value_strength {
      Some(current) => {
        self
          .misconfigured
          .get_or_insert(BuildError::ValueStrengthAlreadySet(current.name()));
      }
      None => self.value_strength = Some(strength),
    }
  }

  /// Checks the settings for conflicts.
  fn validate(&self, has_loader: bool) -> Result<(), BuildError> {
    if let Some(err) = &self.misconfigured {
      return Err(err.clone());
    }
    if self.concurrency_level == 0 {
      return Err(BuildError::ZeroConcurrency);
    }
    if self.maximum_size.is_some() && self.maximum_weight.is_some() {
      return Err(BuildError::ConflictingBounds);
    }
    match (&self.weigher, self.maximum_weight) {
      (Some(_), None) => return Err(BuildError::WeigherWithoutMaximumWeight),
      (None, Some(_)) => return Err(BuildError::MaximumWeightWithoutWeigher),
      _ => {}
    }
    if self.refresh_after_write.is_some() && !has_loader {
      return Err(BuildError::RefreshWithoutLoader);
    }
    Ok(())
  }

  /// Normalises the settings into the immutable form the cache runs with.
  fn into_config(self) -> (CacheConfig<K, V>, H) {
    let config = CacheConfig {
      initial_capacity: self.initial_capacity,
      concurrency_level: self.concurrency_level,
      maximum_weight: self.maximum_size.or(self.maximum_weight),
      weigher: self.weigher,
      expire_after_write: self.expire_after_write.map(time::duration_to_nanos),
      expire_after_access: self.expire_after_access.map(time::duration_to_nanos),
      refresh_after_write: self.refresh_after_write.map(time::duration_to_nanos),
      key_strength: self.key_strength.unwrap_or_default(),
      value_strength: self.value_strength.unwrap_or_default(),
      ticker: self.ticker.unwrap_or_else(|| Arc::new(SystemTicker)),
      listener: self.listener,
    };
    (config, self.hasher)
  }
}

// --- Default Constructor ---
impl<K, V> CacheBuilder<K, V, ahash::RandomState> {
  /// Creates a new `CacheBuilder` with default settings.
  pub fn new() -> Self {
    Self {
      initial_capacity: DEFAULT_INITIAL_CAPACITY,
      concurrency_level: (num_cpus::get() * 4).max(1),
      maximum_size: None,
      maximum_weight: None,
      weigher: None,
      expire_after_write: None,
      expire_after_access: None,
      refresh_after_write: None,
      key_strength: None,
      value_strength: None,
      listener: None,
      ticker: None,
      hasher: ahash::RandomState::new(),
      misconfigured: None,
    }
  }
}

impl<K, V> Default for CacheBuilder<K, V, ahash::RandomState> {
  fn default() -> Self {
    Self::new()
  }
}

// --- Build Methods ---
impl<K, V, H> CacheBuilder<K, V, H>
where
  K: Eq + Hash + Send + Sync + 'static,
  V: Send + Sync + 'static,
  H: BuildHasher + Send + Sync + 'static,
{
  /// Builds a `Cache` without a loader.
  pub fn build(self) -> Result<Cache<K, V, H>, BuildError> {
    self.validate(false)?;
    let (config, hasher) = self.into_config();
    Ok(Cache {
      shared: Arc::new(CacheShared::new(config, hasher, None)),
    })
  }

  /// Builds a `LoadingCache` that computes missing values with `loader`.
  pub fn build_with_loader<L>(self, loader: L) -> Result<LoadingCache<K, V, H>, BuildError>
  where
    L: CacheLoader<K, V> + 'static,
  {
    self.validate(true)?;
    let (config, hasher) = self.into_config();
    let loader: Arc<dyn CacheLoader<K, V>> = Arc::new(loader);
    let shared = Arc::new(CacheShared::new(config, hasher, Some(loader)));
    Ok(LoadingCache {
      cache: Cache { shared },
    })
  }
}

use crate::error::CacheError;
use crate::handles::Cache;

use std::collections::HashMap;
use std::hash::{BuildHasher, Hash};
use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

/// A [`Cache`] that computes missing values with its [`CacheLoader`].
///
/// Every `Cache` method is available through `Deref`.
///
/// [`CacheLoader`]: crate::CacheLoader
#[derive(Debug)]
pub struct LoadingCache<K, V, H = ahash::RandomState> {
  pub(crate) cache: Cache<K, V, H>,
}

impl<K, V, H> Clone for LoadingCache<K, V, H> {
  fn clone(&self) -> Self {
    Self {
      cache: self.cache.clone(),
    }
  }
}

impl<K, V, H> Deref for LoadingCache<K, V, H> {
  type Target = Cache<K, V, H>;

  fn deref(&self) -> &Self::Target {
    &self.cache
  }
}

impl<K, V, H> LoadingCache<K, V, H>
where
  K: Eq + Hash,
  H: BuildHasher,
{
  /// Like [`get`](LoadingCache::get), but a newly created entry keeps the
  /// given `Arc` as its key. Use this with weak keys: the entry then lives as
  /// long as some clone of `key` does.
  pub fn get_shared(&self, key: &Arc<K>) -> Result<Arc<V>, CacheError> {
    self.cache.shared.get_with_loader(key.as_ref(), || key.clone(), None)
  }

  /// Returns the underlying cache handle.
  pub fn as_cache(&self) -> &Cache<K, V, H> {
    &self.cache
  }
}

impl<K, V, H> LoadingCache<K, V, H>
where
  K: Eq + Hash + Clone,
  H: BuildHasher,
{
  /// Returns the value for `key`, loading it if needed.
  ///
  /// Concurrent calls for the same missing key run the loader once; the
  /// others block until it finishes and share its outcome. Failures are not
  /// cached, so the next call tries again.
  ///
  /// With weak keys a miss gives [`CacheError::KeyNotRetained`] instead of
  /// loading a value that would be collected at once; use
  /// [`get_shared`](LoadingCache::get_shared).
  pub fn get(&self, key: &K) -> Result<Arc<V>, CacheError> {
    self.cache.shared.get_with_loader(key, || Arc::new(key.clone()), None)
  }

  /// Like [`get`](LoadingCache::get), but waits at most `timeout` for another
  /// thread's load. Gives [`CacheError::Timeout`] if it takes longer; the load
  /// itself carries on.
  pub fn get_timeout(&self, key: &K, timeout: Duration) -> Result<Arc<V>, CacheError> {
    self
      .cache
      .shared
      .get_with_loader(key, || Arc::new(key.clone()), Some(timeout))
  }

  /// Returns values for all of `keys`, loading the missing ones.
  ///
  /// Missing keys are loaded in one [`load_all`] call when the loader supports
  /// it. Fails as a whole if any key fails; values loaded along the way stay
  /// cached. With weak keys, use [`get_all_shared`](LoadingCache::get_all_shared).
  ///
  /// [`load_all`]: crate::CacheLoader::load_all
  pub fn get_all<'a, I>(&self, keys: I) -> Result<HashMap<K, Arc<V>>, CacheError>
  where
    I: IntoIterator<Item = &'a K>,
    K: 'a,
  {
    self.cache.shared.get_all(keys.into_iter().map(|key| (key, None)))
  }

  /// Like [`get_all`](LoadingCache::get_all), but new entries keep the given
  /// key `Arc`s.
  pub fn get_all_shared<'a, I>(&self, keys: I) -> Result<HashMap<K, Arc<V>>, CacheError>
  where
    I: IntoIterator<Item = &'a Arc<K>>,
    K: 'a,
  {
    self
      .cache
      .shared
      .get_all(keys.into_iter().map(|key| (&**key, Some(key))))
  }

  /// Reloads `key` now.
  ///
  /// The current value, if any, stays readable until the new one is stored.
  /// On failure the current value is kept and the error is returned. If a load
  /// for the key is already running, this waits for it instead.
  pub fn refresh(&self, key: &K) -> Result<(), CacheError> {
    self.cache.shared.refresh(Arc::new(key.clone())).map(|_| ())
  }
}

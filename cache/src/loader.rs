use crate::error::{BoxError, CacheError};

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use std::thread::{self, Thread, ThreadId};
use std::time::{Duration, Instant};

/// Computes values for a [`LoadingCache`](crate::LoadingCache).
///
/// Loaders run on the thread that first requested the key, after the segment
/// lock has been released. Concurrent requests for the same key wait for that
/// one load instead of starting their own.
pub trait CacheLoader<K, V>: Send + Sync {
  /// Computes the value for `key`.
  ///
  /// `Ok(None)` means "no value" and surfaces as
  /// [`CacheError::NullValue`]; nothing is cached.
  fn load(&self, key: &K) -> Result<Option<V>, BoxError>;

  /// Computes values for many keys at once.
  ///
  /// Return `None` when bulk loading is not supported; the cache then loads
  /// each key individually. A returned map may omit keys (they are loaded
  /// individually afterwards) and may contain extra keys, which are cached
  /// too.
  fn load_all(&self, keys: &[K]) -> Option<Result<HashMap<K, V>, BoxError>> {
    let _ = keys;
    None
  }

  /// Computes a replacement for `old`. Used by `refresh` and by
  /// refresh-after-write; defaults to [`load`](CacheLoader::load).
  fn reload(&self, key: &K, old: &V) -> Result<Option<V>, BoxError> {
    let _ = old;
    self.load(key)
  }
}

impl<K, V, L: CacheLoader<K, V> + ?Sized> CacheLoader<K, V> for Arc<L> {
  fn load(&self, key: &K) -> Result<Option<V>, BoxError> {
    (**self).load(key)
  }

  fn load_all(&self, keys: &[K]) -> Option<Result<HashMap<K, V>, BoxError>> {
    (**self).load_all(keys)
  }

  fn reload(&self, key: &K, old: &V) -> Result<Option<V>, BoxError> {
    (**self).reload(key, old)
  }
}

/// A [`CacheLoader`] built from a closure. See [`loader_fn`].
pub struct FnLoader<F, E> {
  f: F,
  _error: PhantomData<fn() -> E>,
}

/// Adapts `Fn(&K) -> Result<V, E>` into a [`CacheLoader`].
///
/// ```
/// use fibre_loading_cache::{loader_fn, CacheBuilder};
///
/// let cache = CacheBuilder::<u32, u32>::new()
///   .build_with_loader(loader_fn(|k: &u32| Ok::<_, std::io::Error>(k * 2)))
///   .unwrap();
/// assert_eq!(*cache.get(&21).unwrap(), 42);
/// ```
pub fn loader_fn<K, V, E, F>(f: F) -> FnLoader<F, E>
where
  F: Fn(&K) -> Result<V, E> + Send + Sync,
  E: Into<BoxError>,
{
  FnLoader {
    f,
    _error: PhantomData,
  }
}

impl<K, V, E, F> CacheLoader<K, V> for FnLoader<F, E>
where
  F: Fn(&K) -> Result<V, E> + Send + Sync,
  E: Into<BoxError>,
{
  fn load(&self, key: &K) -> Result<Option<V>, BoxError> {
    (self.f)(key).map(Some).map_err(Into::into)
  }
}

impl<F, E> fmt::Debug for FnLoader<F, E> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("FnLoader").finish_non_exhaustive()
  }
}

// --- Single-flight coordination ---

/// The internal state of a value being loaded.
enum State<V> {
  Computing,
  Complete(Result<Arc<V>, CacheError>),
}

/// The internal, mutex-protected core of the LoadFuture.
struct Inner<V> {
  state: State<V>,
  waiters: Vec<Thread>,
}

/// A single-assignment result that many threads can block on.
///
/// One `LoadFuture` exists per in-flight load. The thread that installed it
/// (the owner) runs the loader; everybody else parks in [`wait`] until the
/// owner calls [`complete`].
///
/// [`wait`]: LoadFuture::wait
/// [`complete`]: LoadFuture::complete
pub(crate) struct LoadFuture<V> {
  inner: Mutex<Inner<V>>,
  owner: ThreadId,
  started_at: u64,
}

impl<V> LoadFuture<V> {
  /// Creates a new `LoadFuture` in the "Computing" state, owned by the
  /// calling thread.
  pub(crate) fn new(started_at: u64) -> Self {
    Self {
      inner: Mutex::new(Inner {
        state: State::Computing,
        waiters: Vec::new(),
      }),
      owner: thread::current().id(),
      started_at,
    }
  }

  /// Ticker reading taken when the load started.
  pub(crate) fn started_at(&self) -> u64 {
    self.started_at
  }

  pub(crate) fn is_done(&self) -> bool {
    matches!(self.inner.lock().state, State::Complete(_))
  }

  /// Completes the future, waking all waiters. Only the first call has any
  /// effect; returns whether this call was it.
  pub(crate) fn complete(&self, result: Result<Arc<V>, CacheError>) -> bool {
    let waiters = {
      let mut inner = self.inner.lock();
      if let State::Complete(_) = inner.state {
        return false;
      }
      inner.state = State::Complete(result);
      std::mem::take(&mut inner.waiters)
    };
    for waiter in waiters {
      waiter.unpark();
    }
    true
  }

  /// Blocks until the load completes, or until `timeout` elapses.
  ///
  /// Waiting on a load the current thread owns can never finish, so it is
  /// reported as [`CacheError::RecursiveLoad`] instead.
  pub(crate) fn wait(&self, timeout: Option<Duration>) -> Result<Arc<V>, CacheError> {
    let me = thread::current();
    if me.id() == self.owner {
      if let State::Complete(result) = &self.inner.lock().state {
        return result.clone();
      }
      return Err(CacheError::RecursiveLoad);
    }

    let deadline = timeout.and_then(|t| Instant::now().checked_add(t));
    let mut registered = false;
    loop {
      {
        let mut inner = self.inner.lock();
        if let State::Complete(result) = &inner.state {
          return result.clone();
        }
        if !registered {
          inner.waiters.push(me.clone());
          registered = true;
        }
      }

      match deadline {
        Some(deadline) => {
          let now = Instant::now();
          if now >= deadline {
            return Err(CacheError::Timeout(timeout.unwrap_or_default()));
          }
          thread::park_timeout(deadline - now);
        }
        None => thread::park(),
      }
    }
  }
}

impl<V> fmt::Debug for LoadFuture<V> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("LoadFuture")
      .field("done", &self.is_done())
      .field("owner", &self.owner)
      .finish()
  }
}

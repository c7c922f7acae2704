use std::fmt;
use std::sync::Arc;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Describes the reason an entry was removed from the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum RemovalCause {
  /// The entry was removed by `invalidate`, `invalidate_many` or
  /// `invalidate_all`.
  Explicit,
  /// The entry's value was overwritten by `insert`, a completed load or a
  /// refresh.
  Replaced,
  /// The key or value was reclaimed because nothing else held it.
  Collected,
  /// The entry outlived its write or access expiration.
  Expired,
  /// The entry was evicted to keep the cache within its maximum weight.
  Size,
}

impl RemovalCause {
  /// Returns `true` for removals the user did not ask for directly.
  ///
  /// `Explicit` and `Replaced` are the only causes that are not evictions.
  pub fn was_evicted(&self) -> bool {
    matches!(
      self,
      RemovalCause::Collected | RemovalCause::Expired | RemovalCause::Size
    )
  }
}

impl fmt::Display for RemovalCause {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      RemovalCause::Explicit => write!(f, "explicitly invalidated"),
      RemovalCause::Replaced => write!(f, "replaced by a new value"),
      RemovalCause::Collected => write!(f, "key or value was reclaimed"),
      RemovalCause::Expired => write!(f, "expired"),
      RemovalCause::Size => write!(f, "evicted due to size"),
    }
  }
}

/// A record of one removal, handed to the [`RemovalListener`].
///
/// The key and value are `None` when they had already been reclaimed by the
/// time the entry was removed (only possible with weak keys or weak/soft
/// values).
pub struct RemovalNotification<K, V> {
  key: Option<Arc<K>>,
  value: Option<Arc<V>>,
  cause: RemovalCause,
}

impl<K, V> RemovalNotification<K, V> {
  pub(crate) fn new(key: Option<Arc<K>>, value: Option<Arc<V>>, cause: RemovalCause) -> Self {
    Self { key, value, cause }
  }

  pub fn key(&self) -> Option<&Arc<K>> {
    self.key.as_ref()
  }

  pub fn value(&self) -> Option<&Arc<V>> {
    self.value.as_ref()
  }

  pub fn cause(&self) -> RemovalCause {
    self.cause
  }

  pub fn was_evicted(&self) -> bool {
    self.cause.was_evicted()
  }

  /// Splits the notification into its parts.
  pub fn into_parts(self) -> (Option<Arc<K>>, Option<Arc<V>>, RemovalCause) {
    (self.key, self.value, self.cause)
  }
}

impl<K: fmt::Debug, V: fmt::Debug> fmt::Debug for RemovalNotification<K, V> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("RemovalNotification")
      .field("key", &self.key)
      .field("value", &self.value)
      .field("cause", &self.cause)
      .finish()
  }
}

/// A listener that can be registered with the cache to receive a
/// notification for every removed entry.
///
/// Notifications are queued while the segment lock is held and delivered
/// afterwards, on whichever thread performs the next cache operation. The
/// listener therefore never runs under a segment lock and may call back into
/// the cache. A panicking listener is logged and skipped; it does not affect
/// the operation that triggered it.
pub trait RemovalListener<K, V>: Send + Sync {
  fn on_removal(&self, notification: RemovalNotification<K, V>);
}

impl<K, V, F> RemovalListener<K, V> for F
where
  F: Fn(RemovalNotification<K, V>) + Send + Sync,
{
  fn on_removal(&self, notification: RemovalNotification<K, V>) {
    self(notification)
  }
}

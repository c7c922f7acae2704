//! How keys and values are held by an entry.

use crate::loader::LoadFuture;

use equivalent::Equivalent;
use std::fmt;
use std::sync::{Arc, Weak};

/// How strongly the cache holds its keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KeyStrength {
  /// The cache keeps keys alive.
  #[default]
  Strong,
  /// The cache holds keys through `Weak`; an entry is collected once no
  /// other `Arc` to its key exists. Lookups still compare keys by equality.
  Weak,
}

impl KeyStrength {
  pub(crate) fn name(&self) -> &'static str {
    match self {
      KeyStrength::Strong => "strong",
      KeyStrength::Weak => "weak",
    }
  }
}

/// How strongly the cache holds its values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ValueStrength {
  /// The cache keeps values alive.
  #[default]
  Strong,
  /// Values stay cached only while a caller still holds the returned `Arc`.
  Weak,
  /// Values are kept alive until `release_soft_values` is called, after which
  /// they behave like weak values.
  Soft,
}

impl ValueStrength {
  pub(crate) fn name(&self) -> &'static str {
    match self {
      ValueStrength::Strong => "strong",
      ValueStrength::Weak => "weak",
      ValueStrength::Soft => "soft",
    }
  }
}

/// Result of comparing a lookup key against a stored key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum KeyMatch {
  Match,
  NoMatch,
  /// The stored key was weak and has been dropped.
  Cleared,
}

pub(crate) enum KeyReference<K> {
  Strong(Arc<K>),
  Weak(Weak<K>),
}

impl<K> KeyReference<K> {
  pub(crate) fn new(key: Arc<K>, strength: KeyStrength) -> Self {
    match strength {
      KeyStrength::Strong => KeyReference::Strong(key),
      KeyStrength::Weak => KeyReference::Weak(Arc::downgrade(&key)),
    }
  }

  pub(crate) fn get(&self) -> Option<Arc<K>> {
    match self {
      KeyReference::Strong(key) => Some(key.clone()),
      KeyReference::Weak(key) => key.upgrade(),
    }
  }

  pub(crate) fn matches<Q>(&self, key: &Q) -> KeyMatch
  where
    Q: Equivalent<K> + ?Sized,
  {
    let found = match self {
      KeyReference::Strong(stored) => key.equivalent(stored.as_ref()),
      KeyReference::Weak(stored) => match stored.upgrade() {
        Some(stored) => key.equivalent(stored.as_ref()),
        None => return KeyMatch::Cleared,
      },
    };
    if found {
      KeyMatch::Match
    } else {
      KeyMatch::NoMatch
    }
  }

  pub(crate) fn is_cleared(&self) -> bool {
    match self {
      KeyReference::Strong(_) => false,
      KeyReference::Weak(key) => key.strong_count() == 0,
    }
  }
}

/// A value that stays pinned until memory pressure is signalled.
pub(crate) struct SoftReference<V> {
  retained: Option<Arc<V>>,
  weak: Weak<V>,
}

/// A load in progress, remembering the value it will replace.
pub(crate) struct LoadingReference<V> {
  pub(crate) future: Arc<LoadFuture<V>>,
  pub(crate) previous: Box<ValueReference<V>>,
}

/// The state machine behind an entry's value.
///
/// `Loading` may only be entered from `Unset` (first load) or from a live
/// reference (refresh), so `previous` is never itself `Loading`.
pub(crate) enum ValueReference<V> {
  Unset,
  Strong(Arc<V>),
  Weak(Weak<V>),
  Soft(SoftReference<V>),
  Loading(LoadingReference<V>),
}

impl<V> ValueReference<V> {
  pub(crate) fn new(value: Arc<V>, strength: ValueStrength) -> Self {
    match strength {
      ValueStrength::Strong => ValueReference::Strong(value),
      ValueStrength::Weak => ValueReference::Weak(Arc::downgrade(&value)),
      ValueStrength::Soft => ValueReference::Soft(SoftReference {
        weak: Arc::downgrade(&value),
        retained: Some(value),
      }),
    }
  }

  pub(crate) fn loading(future: Arc<LoadFuture<V>>, previous: ValueReference<V>) -> Self {
    debug_assert!(!previous.is_loading(), "loading references do not nest");
    ValueReference::Loading(LoadingReference {
      future,
      previous: Box::new(previous),
    })
  }

  /// The current value; `None` when unset, cleared, or loading for the first
  /// time. A refresh in progress yields the stale value.
  pub(crate) fn get(&self) -> Option<Arc<V>> {
    match self {
      ValueReference::Unset => None,
      ValueReference::Strong(value) => Some(value.clone()),
      ValueReference::Weak(value) => value.upgrade(),
      ValueReference::Soft(soft) => soft.retained.clone().or_else(|| soft.weak.upgrade()),
      ValueReference::Loading(loading) => loading.previous.get(),
    }
  }

  pub(crate) fn is_loading(&self) -> bool {
    matches!(self, ValueReference::Loading(_))
  }

  /// Whether the reference holds, or held, a real value. A first-time load
  /// placeholder is not active; a refresh is.
  pub(crate) fn is_active(&self) -> bool {
    match self {
      ValueReference::Unset => false,
      ValueReference::Loading(loading) => loading.previous.is_active(),
      _ => true,
    }
  }

  /// Whether a weak or soft value has been dropped.
  pub(crate) fn is_cleared(&self) -> bool {
    match self {
      ValueReference::Weak(value) => value.strong_count() == 0,
      ValueReference::Soft(soft) => soft.retained.is_none() && soft.weak.strong_count() == 0,
      ValueReference::Loading(loading) => loading.previous.is_cleared(),
      _ => false,
    }
  }

  pub(crate) fn loading_future(&self) -> Option<&Arc<LoadFuture<V>>> {
    match self {
      ValueReference::Loading(loading) => Some(&loading.future),
      _ => None,
    }
  }

  /// Drops the pin on a soft value. Returns `true` if the value is now gone.
  pub(crate) fn release_soft(&mut self) -> bool {
    match self {
      ValueReference::Soft(soft) => {
        soft.retained = None;
        soft.weak.strong_count() == 0
      }
      ValueReference::Loading(loading) => loading.previous.release_soft(),
      _ => false,
    }
  }

  /// Replaces a `Loading` reference with the value it was refreshing.
  pub(crate) fn take_previous(self) -> ValueReference<V> {
    match self {
      ValueReference::Loading(loading) => *loading.previous,
      other => other,
    }
  }
}

impl<V> fmt::Debug for ValueReference<V> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      ValueReference::Unset => f.write_str("Unset"),
      ValueReference::Strong(_) => f.write_str("Strong"),
      ValueReference::Weak(_) => f.write_str("Weak"),
      ValueReference::Soft(soft) => {
        write!(f, "Soft(retained: {})", soft.retained.is_some())
      }
      ValueReference::Loading(loading) => {
        f.debug_tuple("Loading").field(&loading.previous).finish()
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn weak_value_clears_when_last_arc_drops() {
    let value = Arc::new(String::from("v"));
    let reference = ValueReference::new(value.clone(), ValueStrength::Weak);
    assert_eq!(reference.get().as_deref().map(String::as_str), Some("v"));
    drop(value);
    assert!(reference.get().is_none());
    assert!(reference.is_cleared());
    assert!(reference.is_active());
  }

  #[test]
  fn soft_value_survives_until_released() {
    let mut reference = ValueReference::new(Arc::new(5), ValueStrength::Soft);
    assert_eq!(reference.get().map(|v| *v), Some(5));
    assert!(!reference.is_cleared());

    let held = reference.get();
    assert!(!reference.release_soft(), "an outside Arc keeps it alive");
    assert!(reference.get().is_some());
    drop(held);
    assert!(reference.get().is_none());
    assert!(reference.is_cleared());
  }

  #[test]
  fn loading_exposes_previous_value() {
    let future = Arc::new(LoadFuture::new(0));
    let first = ValueReference::loading(future.clone(), ValueReference::Unset);
    assert!(first.get().is_none());
    assert!(!first.is_active());
    assert!(first.is_loading());

    let stale = ValueReference::new(Arc::new(1), ValueStrength::Strong);
    let refresh = ValueReference::loading(future, stale);
    assert_eq!(refresh.get().map(|v| *v), Some(1));
    assert!(refresh.is_active());
    assert!(matches!(refresh.take_previous(), ValueReference::Strong(_)));
  }

  #[test]
  fn weak_keys_compare_by_value_and_report_clearing() {
    let key = Arc::new(String::from("k"));
    let reference = KeyReference::new(key.clone(), KeyStrength::Weak);
    assert_eq!(reference.matches("k"), KeyMatch::Match);
    assert_eq!(reference.matches("x"), KeyMatch::NoMatch);
    drop(key);
    assert_eq!(reference.matches("k"), KeyMatch::Cleared);
    assert!(reference.is_cleared());
  }
}

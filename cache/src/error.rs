use std::error::Error as StdError;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// The error type loaders return.
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// Errors that can occur when building a cache.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BuildError {
  /// `concurrency_level` was set to zero.
  #[error("concurrency level must be greater than zero")]
  ZeroConcurrency,
  /// A weigher was supplied but no `maximum_weight` to measure against.
  #[error("a weigher requires maximum_weight to be set")]
  WeigherWithoutMaximumWeight,
  /// `maximum_weight` was set without a weigher. Use `maximum_size` to count
  /// entries instead.
  #[error("maximum_weight requires a weigher; use maximum_size to bound by entry count")]
  MaximumWeightWithoutWeigher,
  /// Both `maximum_size` and `maximum_weight` were configured.
  #[error("maximum_size and maximum_weight are mutually exclusive")]
  ConflictingBounds,
  /// Key strength was configured twice.
  #[error("key strength was already set to {0}")]
  KeyStrengthAlreadySet(&'static str),
  /// Value strength was configured twice, e.g. `weak_values` and
  /// `soft_values`.
  #[error("value strength was already set to {0}")]
  ValueStrengthAlreadySet(&'static str),
  /// `refresh_after_write` only makes sense for a loading cache.
  #[error("refresh_after_write requires a loader; use build_with_loader")]
  RefreshWithoutLoader,
}

/// Errors returned by cache lookups that may load.
///
/// The type is cheap to clone so one failure can be handed to every thread
/// that waited on the same load.
#[derive(Debug, Clone, Error)]
pub enum CacheError {
  /// The loader returned an error.
  #[error("loader failed: {0}")]
  Load(Arc<dyn StdError + Send + Sync + 'static>),
  /// The loader returned `Ok(None)`, or a bulk load omitted a requested key.
  #[error("loader returned no value for the requested key")]
  NullValue,
  /// The caller gave up waiting on another thread's load.
  #[error("timed out after {0:?} waiting for a load to complete")]
  Timeout(Duration),
  /// The loader asked the cache for the key it is currently loading.
  #[error("recursive load detected: the loader requested its own key")]
  RecursiveLoad,
  /// The loader or weigher panicked.
  #[error("loader panicked")]
  LoaderPanicked,
  /// A weak-keyed cache was asked to create an entry for a key that nobody
  /// outside the cache holds, so the entry would be collected at once. Pass
  /// the key as a shared `Arc`, e.g. through `get_shared`.
  #[error("weak key is not held outside the cache; pass it as a shared Arc")]
  KeyNotRetained,
}

impl CacheError {
  pub(crate) fn load(err: BoxError) -> Self {
    CacheError::Load(Arc::from(err))
  }

  /// Returns the loader's own error, if that is what this wraps.
  pub fn source_error(&self) -> Option<&(dyn StdError + Send + Sync + 'static)> {
    match self {
      CacheError::Load(err) => Some(err.as_ref()),
      _ => None,
    }
  }
}

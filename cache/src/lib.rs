//! A segmented, concurrent, in-memory loading cache.
//!
//! # Features
//! - **Segmented Locking**: The table is split into independently locked
//!   segments; reads take a shared lock and never block each other.
//! - **Single-Flight Loading**: A `LoadingCache` runs its loader once per
//!   missing key no matter how many threads ask for it concurrently.
//! - **Bounded Size**: Entry-count or weight bounds, enforced per segment with
//!   LRU eviction.
//! - **Expiration**: Expire entries after write and/or after access, and
//!   refresh them after write.
//! - **Reference Strength**: Weak keys, weak values and soft values that are
//!   let go under memory pressure.
//! - **Removal Notifications**: A listener is told about every removal and
//!   its cause, always outside of any cache lock.
//! - **Statistics**: Hit, miss, load and eviction counters with derived rates.
//!
//! Maintenance is piggybacked on ordinary reads and writes; there are no
//! background threads.
//!
//! ```
//! use fibre_loading_cache::{loader_fn, CacheBuilder, BoxError};
//!
//! let cache = CacheBuilder::new()
//!   .maximum_size(10_000)
//!   .build_with_loader(loader_fn(|id: &u64| Ok::<_, BoxError>(format!("user-{id}"))))
//!   .unwrap();
//!
//! assert_eq!(*cache.get(&7).unwrap(), "user-7");
//! assert_eq!(cache.stats().miss_count, 1);
//! ```

// Public modules that form the API
pub mod builder;
pub mod error;
pub mod handles;
pub mod iter;
pub mod listener;
pub mod loader;
pub mod metrics;
pub mod reference;
pub mod time;

// Internal, crate-only modules
mod config;
mod entry;
mod notification;
mod segment;
mod shared;
mod store;
mod table;

// Re-export the primary user-facing types for convenience
pub use builder::CacheBuilder;
pub use config::Weigher;
pub use error::{BoxError, BuildError, CacheError};
pub use handles::{Cache, LoadingCache};
pub use iter::{Iter, Keys};
pub use listener::{RemovalCause, RemovalListener, RemovalNotification};
pub use loader::{loader_fn, CacheLoader, FnLoader};
pub use metrics::CacheStats;
pub use reference::{KeyStrength, ValueStrength};
pub use time::{ManualTicker, SystemTicker, Ticker};

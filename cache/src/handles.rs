//! The user-facing cache handles.
//!
//! Both handles are cheap to clone; clones share the same underlying cache.

mod loading;
mod sync;

pub use loading::LoadingCache;
pub use sync::Cache;

#![allow(dead_code)]

use fibre_loading_cache::{RemovalCause, RemovalNotification};

use parking_lot::Mutex;
use std::sync::Arc;

/// Every notification a listener has received, in delivery order.
pub type Events<K, V> = Arc<Mutex<Vec<RemovalNotification<K, V>>>>;

/// Builds a listener that records what it is told.
pub fn recording_listener<K, V>(
) -> (Events<K, V>, impl Fn(RemovalNotification<K, V>) + Send + Sync + 'static)
where
  K: Send + Sync + 'static,
  V: Send + Sync + 'static,
{
  let events: Events<K, V> = Arc::new(Mutex::new(Vec::new()));
  let sink = events.clone();
  (events, move |notification| sink.lock().push(notification))
}

pub fn causes<K, V>(events: &Events<K, V>) -> Vec<RemovalCause> {
  events.lock().iter().map(|n| n.cause()).collect()
}

/// The keys that were removed for `cause`, in order.
pub fn keys_removed_for<K: Clone, V>(events: &Events<K, V>, cause: RemovalCause) -> Vec<K> {
  events
    .lock()
    .iter()
    .filter(|n| n.cause() == cause)
    .filter_map(|n| n.key().map(|k| k.as_ref().clone()))
    .collect()
}

pub const SECOND: u64 = 1_000_000_000;

/// Installs a test-friendly tracing subscriber. Set `RUST_LOG` to see the
/// cache's internal events.
pub fn init_tracing() {
  let _ = tracing_subscriber::fmt()
    .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
    .with_test_writer()
    .try_init();
}

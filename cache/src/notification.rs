use crate::listener::{RemovalListener, RemovalNotification};

use crossbeam_queue::ArrayQueue;
use parking_lot::Mutex;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

/// How many notifications may wait before producers deliver them themselves.
const NOTIFICATION_QUEUE_CAPACITY: usize = 1024;

/// A bounded queue of removal notifications with at most one consumer at a
/// time.
///
/// Producers are cache operations that have just released a segment lock.
/// They push what they collected and then try to drain. The drain guard is a
/// `try_lock`, so a listener that re-enters the cache never blocks on its own
/// delivery; the notifications it produces are picked up by the drain loop
/// already running further up its stack.
pub(crate) struct RemovalQueue<K, V> {
  queue: ArrayQueue<RemovalNotification<K, V>>,
  listener: Arc<dyn RemovalListener<K, V>>,
  draining: Mutex<()>,
}

impl<K, V> RemovalQueue<K, V> {
  pub(crate) fn new(listener: Arc<dyn RemovalListener<K, V>>) -> Self {
    Self {
      queue: ArrayQueue::new(NOTIFICATION_QUEUE_CAPACITY),
      listener,
      draining: Mutex::new(()),
    }
  }

  /// Enqueues notifications and delivers whatever is pending. Must not be
  /// called with a segment lock held.
  pub(crate) fn publish(&self, notifications: Vec<RemovalNotification<K, V>>) {
    for notification in notifications {
      let mut notification = notification;
      loop {
        match self.queue.push(notification) {
          Ok(()) => break,
          Err(rejected) => {
            notification = rejected;
            if !self.drain() {
              // Another thread holds the drain guard (possibly ours, from
              // inside a listener). Deliver directly rather than spin.
              self.deliver(notification);
              break;
            }
          }
        }
      }
    }
    self.drain();
  }

  /// Delivers queued notifications until the queue is empty. Returns `false`
  /// if another consumer is already draining.
  pub(crate) fn drain(&self) -> bool {
    let Some(_guard) = self.draining.try_lock() else {
      return false;
    };
    while let Some(notification) = self.queue.pop() {
      self.deliver(notification);
    }
    true
  }

  fn deliver(&self, notification: RemovalNotification<K, V>) {
    let cause = notification.cause();
    let listener = &self.listener;
    if panic::catch_unwind(AssertUnwindSafe(|| listener.on_removal(notification))).is_err() {
      tracing::warn!(%cause, "removal listener panicked; notification dropped");
    }
  }

  pub(crate) fn len(&self) -> usize {
    self.queue.len()
  }
}

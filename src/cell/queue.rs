use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio::sync::Notify;

/// Fetch queues, one per pyramid level.
///
/// Each level is served last-in first-out so the most recently requested
/// cells load first. Coarser (higher) levels always take precedence over
/// finer ones.
pub(crate) struct FetchQueues<T> {
    levels: Mutex<Vec<VecDeque<T>>>,
    notify: Notify,
    shutdown: AtomicBool,
}

impl<T> FetchQueues<T> {
    /// Create queues for `num_levels` levels (at least one).
    pub fn new(num_levels: usize) -> Self {
        let levels = (0..num_levels.max(1)).map(|_| VecDeque::new()).collect();
        Self {
            levels: Mutex::new(levels),
            notify: Notify::new(),
            shutdown: AtomicBool::new(false),
        }
    }

    /// Enqueue an item for `level`. Ignored after shutdown.
    ///
    /// Entries of that level matched by `is_same` are removed first, so a
    /// re-requested item moves to the front of the line instead of being
    /// queued twice.
    pub fn push(&self, level: usize, item: T, is_same: impl Fn(&T) -> bool) {
        if self.is_shut_down() {
            return;
        }
        let added = {
            let mut levels = self.levels.lock();
            let last = levels.len() - 1;
            let queue = &mut levels[level.min(last)];
            let before = queue.len();
            queue.retain(|queued| !is_same(queued));
            let added = queue.len() == before;
            queue.push_back(item);
            added
        };
        if added {
            self.notify.notify_one();
        }
    }

    /// Take the next item without waiting.
    pub fn try_pop(&self) -> Option<T> {
        let mut levels = self.levels.lock();
        levels.iter_mut().rev().find_map(|queue| queue.pop_back())
    }

    /// Wait for the next item. Returns `None` once shut down.
    pub async fn pop(&self) -> Option<T> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.is_shut_down() {
                return None;
            }
            if let Some(item) = self.try_pop() {
                return Some(item);
            }

            notified.await;
        }
    }

    /// Drop all queued items and release every waiting consumer.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.levels.lock().iter_mut().for_each(VecDeque::clear);
        self.notify.notify_waiters();
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Total number of queued items.
    pub fn len(&self) -> usize {
        self.levels.lock().iter().map(VecDeque::len).sum()
    }
}

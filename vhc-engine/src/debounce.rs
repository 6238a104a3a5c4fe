//! Per-key debounced write scheduling
//!
//! Free-text and numeric edits are buffered behind a per-key timer before
//! being persisted. Scheduling a key cancels its pending timer; an
//! explicit flush path bypasses the timer for user-initiated acceptance;
//! dropping the map cancels everything so no write fires against an id
//! that is no longer relevant.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::Mutex;
use std::time::Duration;

use tokio::task::JoinHandle;

/// Cancelable per-key timer map
pub struct DebounceMap<K: Eq + Hash + Clone + Send + 'static> {
    window: Duration,
    timers: Mutex<HashMap<K, JoinHandle<()>>>,
}

impl<K: Eq + Hash + Clone + Send + 'static> DebounceMap<K> {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            timers: Mutex::new(HashMap::new()),
        }
    }

    /// Schedule `write` to run after the debounce window, replacing any
    /// pending timer for the same key. The write future should read
    /// current state when it fires, not capture stale values.
    pub fn schedule<F>(&self, key: K, write: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let window = self.window;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(window).await;
            write.await;
        });

        let mut timers = self.timers.lock().unwrap();
        if let Some(previous) = timers.insert(key, handle) {
            previous.abort();
        }
    }

    /// Cancel any pending timer for the key and run `write` immediately.
    pub async fn flush_now<F, T>(&self, key: &K, write: F) -> T
    where
        F: Future<Output = T>,
    {
        self.cancel(key);
        write.await
    }

    /// Cancel a single pending timer.
    pub fn cancel(&self, key: &K) {
        if let Some(handle) = self.timers.lock().unwrap().remove(key) {
            handle.abort();
        }
    }

    /// Cancel every pending timer.
    pub fn cancel_all(&self) {
        let mut timers = self.timers.lock().unwrap();
        for (_, handle) in timers.drain() {
            handle.abort();
        }
    }

    /// Number of timers currently tracked (finished ones included until
    /// their key is rescheduled or canceled).
    pub fn pending(&self) -> usize {
        self.timers.lock().unwrap().len()
    }
}

impl<K: Eq + Hash + Clone + Send + 'static> Drop for DebounceMap<K> {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_rapid_schedules_collapse_to_one_write() {
        let map = DebounceMap::new(Duration::from_millis(650));
        let writes = Arc::new(AtomicUsize::new(0));

        for _ in 0..5 {
            let writes = writes.clone();
            map.schedule("labour", async move {
                writes.fetch_add(1, Ordering::SeqCst);
            });
            tokio::time::advance(Duration::from_millis(100)).await;
        }
        tokio::time::advance(Duration::from_millis(700)).await;
        tokio::task::yield_now().await;

        assert_eq!(writes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_prevents_write() {
        let map = DebounceMap::new(Duration::from_millis(650));
        let writes = Arc::new(AtomicUsize::new(0));

        let w = writes.clone();
        map.schedule("labour", async move {
            w.fetch_add(1, Ordering::SeqCst);
        });
        map.cancel(&"labour");

        tokio::time::advance(Duration::from_millis(1000)).await;
        tokio::task::yield_now().await;
        assert_eq!(writes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_now_bypasses_timer_and_cancels_pending() {
        let map = DebounceMap::new(Duration::from_millis(650));
        let writes = Arc::new(AtomicUsize::new(0));

        let w = writes.clone();
        map.schedule("labour", async move {
            w.fetch_add(1, Ordering::SeqCst);
        });

        let w = writes.clone();
        map.flush_now(&"labour", async move {
            w.fetch_add(1, Ordering::SeqCst);
        })
        .await;
        assert_eq!(writes.load(Ordering::SeqCst), 1, "immediate write ran");

        tokio::time::advance(Duration::from_millis(1000)).await;
        tokio::task::yield_now().await;
        assert_eq!(writes.load(Ordering::SeqCst), 1, "debounced write was canceled");
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_cancels_everything() {
        let writes = Arc::new(AtomicUsize::new(0));
        {
            let map = DebounceMap::new(Duration::from_millis(650));
            for key in ["a", "b", "c"] {
                let w = writes.clone();
                map.schedule(key, async move {
                    w.fetch_add(1, Ordering::SeqCst);
                });
            }
            assert_eq!(map.pending(), 3);
        }
        tokio::time::advance(Duration::from_millis(1000)).await;
        tokio::task::yield_now().await;
        assert_eq!(writes.load(Ordering::SeqCst), 0);
    }
}

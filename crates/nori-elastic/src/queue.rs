/// Lock-free multi-producer/multi-consumer FIFO for pending tasks.
///
/// Storage is a `crossbeam_queue::SegQueue`. Next to it sits a pending
/// counter updated with `SeqCst`, which the dispatcher's wake/release
/// handshake reads: a producer bumps it after pushing and then checks for
/// a free activation slot, an idle activation frees its slot and then
/// checks the counter, so one of the two always sees the other.
///
/// The counter is incremented after the push and decremented after a pop,
/// so it can dip below zero for an instant when a consumer wins the race
/// against the producer's increment. `len` clamps it.
use crossbeam_queue::SegQueue;
use crossbeam_utils::CachePadded;
use std::sync::atomic::{AtomicIsize, Ordering};

pub struct TaskQueue<T> {
    inner: SegQueue<T>,
    pending: CachePadded<AtomicIsize>,
}

impl<T> TaskQueue<T> {
    pub fn new() -> Self {
        Self {
            inner: SegQueue::new(),
            pending: CachePadded::new(AtomicIsize::new(0)),
        }
    }

    /// Appends `value` at the tail. Never blocks.
    pub fn push(&self, value: T) {
        self.inner.push(value);
        self.pending.fetch_add(1, Ordering::SeqCst);
    }

    /// Removes the head value, or returns `None` if the queue is empty.
    pub fn try_pop(&self) -> Option<T> {
        let value = self.inner.pop()?;
        self.pending.fetch_sub(1, Ordering::SeqCst);
        Some(value)
    }

    /// Number of queued values. May be momentarily stale under concurrent
    /// pushes and pops.
    pub fn len(&self) -> usize {
        self.pending.load(Ordering::SeqCst).max(0) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Emptiness of the underlying storage, independent of the pending
    /// counter. Meaningful once producers and consumers are quiescent.
    pub fn is_drained(&self) -> bool {
        self.inner.is_empty()
    }
}

impl<T> Default for TaskQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for TaskQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskQueue").field("len", &self.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_empty_queue() {
        let q: TaskQueue<u32> = TaskQueue::new();
        assert!(q.is_empty());
        assert!(q.is_drained());
        assert_eq!(q.len(), 0);
        assert_eq!(q.try_pop(), None);
    }

    #[test]
    fn test_fifo_single_thread() {
        let q = TaskQueue::new();
        for i in 0..100 {
            q.push(i);
        }
        assert_eq!(q.len(), 100);

        for i in 0..100 {
            assert_eq!(q.try_pop(), Some(i));
        }
        assert_eq!(q.try_pop(), None);
        assert!(q.is_drained());
        assert_eq!(q.len(), 0);
    }

    #[test]
    fn test_interleaved_push_pop() {
        let q = TaskQueue::new();
        q.push("a");
        q.push("b");
        assert_eq!(q.try_pop(), Some("a"));
        q.push("c");
        assert_eq!(q.try_pop(), Some("b"));
        assert_eq!(q.try_pop(), Some("c"));
        assert_eq!(q.try_pop(), None);
        assert!(q.is_drained());
    }

    #[test]
    fn test_concurrent_producers_and_consumers_drain() {
        const PRODUCERS: usize = 4;
        const CONSUMERS: usize = 4;
        const PER_PRODUCER: usize = 10_000;

        let q = Arc::new(TaskQueue::new());
        let popped = Arc::new(AtomicUsize::new(0));

        let producers: Vec<_> = (0..PRODUCERS)
            .map(|p| {
                let q = q.clone();
                thread::spawn(move || {
                    for i in 0..PER_PRODUCER {
                        q.push((p, i));
                    }
                })
            })
            .collect();

        let consumers: Vec<_> = (0..CONSUMERS)
            .map(|_| {
                let q = q.clone();
                let popped = popped.clone();
                thread::spawn(move || {
                    let mut seen: Vec<Vec<usize>> = vec![Vec::new(); PRODUCERS];
                    while popped.load(Ordering::SeqCst) < PRODUCERS * PER_PRODUCER {
                        if let Some((p, i)) = q.try_pop() {
                            seen[p].push(i);
                            popped.fetch_add(1, Ordering::SeqCst);
                        } else {
                            thread::yield_now();
                        }
                    }
                    seen
                })
            })
            .collect();

        for handle in producers {
            handle.join().unwrap();
        }

        let mut total = 0;
        for handle in consumers {
            let seen = handle.join().unwrap();
            for per_producer in seen {
                // Each consumer observes a producer's values in push order
                assert!(per_producer.windows(2).all(|w| w[0] < w[1]));
                total += per_producer.len();
            }
        }

        assert_eq!(total, PRODUCERS * PER_PRODUCER);
        assert_eq!(q.len(), 0);
        assert!(q.is_empty());
        assert!(q.is_drained());
    }

    #[test]
    fn test_len_tracks_pushes_and_pops() {
        let q = TaskQueue::new();
        q.push(1);
        q.push(2);
        q.push(3);
        assert_eq!(q.len(), 3);
        q.try_pop();
        assert_eq!(q.len(), 2);
        assert!(!q.is_empty());
        assert!(!q.is_drained());
    }

    #[test]
    fn test_drop_releases_remaining_values_once() {
        struct Tracked(Arc<AtomicUsize>);
        impl Drop for Tracked {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let drops = Arc::new(AtomicUsize::new(0));
        {
            let q = TaskQueue::new();
            for _ in 0..10 {
                q.push(Tracked(drops.clone()));
            }
            // Popped values are dropped by the caller, not the queue
            drop(q.try_pop());
            drop(q.try_pop());
            assert_eq!(drops.load(Ordering::SeqCst), 2);
        }
        assert_eq!(drops.load(Ordering::SeqCst), 10);
    }
}

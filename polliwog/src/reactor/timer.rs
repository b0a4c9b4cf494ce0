//! Ordered timer table with a lock-free operation buffer.
//!
//! Mutators never touch the map: they enqueue `TimerOp` records on a
//! multi-producer FIFO and only the reactor drains it, holding the table
//! lock. FIFO order is what makes cancellation sound: a `Remove` submitted
//! after its `Insert` is always applied after it.

use crossbeam_deque::{Injector, Steal};
use parking_lot::Mutex;
use smallvec::SmallVec;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::Waker;
use std::time::{Duration, Instant};

/// Timer ids are unique for the lifetime of the process, assigned in
/// insertion order so that entries with equal deadlines fire oldest-first.
static NEXT_ID: AtomicU64 = AtomicU64::new(0);

/// Stack capacity for per-turn timer batches; larger batches spill to the
/// heap.
const SPILL_TO_HEAP_THRESHOLD: usize = 16;

/// Deadlines are compared against `now + BIAS` so an entry that matured at
/// exactly `now` counts as ready, and a just-elapsed short sleep can never
/// round down to a zero-length wait and spin.
const BIAS: Duration = Duration::from_nanos(1);

#[derive(Debug)]
pub(crate) enum TimerOp {
    Insert {
        id: u64,
        when: Instant,
        waker: Waker,
    },
    Remove {
        id: u64,
        when: Instant,
    },
}

#[derive(Debug, Default)]
pub(crate) struct Timers {
    /// Ordered `(deadline, id) -> continuation` map. Ties on deadline
    /// resolve by id, i.e. by insertion order.
    entries: Mutex<BTreeMap<(Instant, u64), Waker>>,

    /// Pending operations from mutator threads, not yet applied to the map.
    ops: Injector<TimerOp>,
}

impl Timers {
    /// Queue an insertion and hand back the assigned id. The entry becomes
    /// observable on the next drain.
    pub(crate) fn insert(&self, when: Instant, waker: &Waker) -> u64 {
        let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
        self.ops.push(TimerOp::Insert {
            id,
            when,
            waker: waker.clone(),
        });
        id
    }

    /// Queue a removal. If the entry is still pending when the reactor
    /// drains the buffer, its continuation is dropped without being resumed.
    pub(crate) fn remove(&self, when: Instant, id: u64) {
        self.ops.push(TimerOp::Remove { id, when });
    }

    /// Apply pending ops, collect matured continuations into `wakers`, and
    /// compute the next sleep bound.
    ///
    /// Returns `None` when at least one timer matured ("don't sleep"),
    /// `Some(delta)` for the gap to the earliest pending deadline, and
    /// `Some(ZERO)` when the table is empty (poll without sleeping).
    pub(crate) fn process(&self, wakers: &mut Vec<Waker>) -> Option<Duration> {
        let mut entries = self.entries.lock();
        self.drain_ops(&mut entries);

        let now = Instant::now() + BIAS;

        let mut ready: SmallVec<[(Instant, u64); SPILL_TO_HEAP_THRESHOLD]> = SmallVec::new();
        let mut next_pending = None;
        for (&key, _) in entries.iter() {
            if key.0 <= now {
                ready.push(key);
            } else {
                // The map is ordered, so the first non-ready deadline is the
                // earliest pending one.
                next_pending = Some(key.0);
                break;
            }
        }

        // A timer fires at most once: matured entries leave the table as
        // their continuations are collected.
        let mut matured: SmallVec<[Waker; SPILL_TO_HEAP_THRESHOLD]> = SmallVec::new();
        for key in &ready {
            if let Some(waker) = entries.remove(key) {
                matured.push(waker);
            }
        }

        let next_wake = if ready.is_empty() {
            Some(match next_pending {
                Some(when) => when.saturating_duration_since(now),
                None => Duration::ZERO,
            })
        } else {
            None
        };

        drop(entries);
        wakers.extend(matured);
        next_wake
    }

    fn drain_ops(&self, entries: &mut BTreeMap<(Instant, u64), Waker>) {
        loop {
            match self.ops.steal() {
                Steal::Success(TimerOp::Insert { id, when, waker }) => {
                    entries.insert((when, id), waker);
                }
                Steal::Success(TimerOp::Remove { id, when }) => {
                    entries.remove(&(when, id));
                }
                Steal::Retry => continue,
                Steal::Empty => break,
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::counting_waker;

    #[test]
    fn empty_table_requests_an_immediate_poll() {
        let timers = Timers::default();
        let mut wakers = Vec::new();
        assert_eq!(timers.process(&mut wakers), Some(Duration::ZERO));
        assert!(wakers.is_empty());
    }

    #[test]
    fn matured_entry_is_collected_and_removed() {
        let timers = Timers::default();
        let (waker, count) = counting_waker();
        timers.insert(Instant::now(), &waker);

        let mut wakers = Vec::new();
        assert_eq!(timers.process(&mut wakers), None);
        assert_eq!(wakers.len(), 1);
        assert_eq!(timers.len(), 0);

        // A second pass must not observe the fired entry again.
        wakers.clear();
        assert_eq!(timers.process(&mut wakers), Some(Duration::ZERO));
        assert!(wakers.is_empty());
        assert_eq!(count.get(), 0);
    }

    #[test]
    fn deadline_equal_to_now_counts_as_ready() {
        let timers = Timers::default();
        let (waker, _count) = counting_waker();
        let now = Instant::now();
        timers.insert(now, &waker);

        let mut wakers = Vec::new();
        assert_eq!(timers.process(&mut wakers), None);
        assert_eq!(wakers.len(), 1);
    }

    #[test]
    fn pending_entry_bounds_the_sleep() {
        let timers = Timers::default();
        let (waker, _count) = counting_waker();
        timers.insert(Instant::now() + Duration::from_secs(5), &waker);

        let mut wakers = Vec::new();
        let next = timers.process(&mut wakers).unwrap();
        assert!(wakers.is_empty());
        assert!(next > Duration::from_secs(4) && next <= Duration::from_secs(5));
    }

    #[test]
    fn removal_before_drain_drops_the_continuation() {
        let timers = Timers::default();
        let (waker, count) = counting_waker();
        let when = Instant::now() + Duration::from_millis(100);
        let id = timers.insert(when, &waker);
        timers.remove(when, id);

        let mut wakers = Vec::new();
        assert_eq!(timers.process(&mut wakers), Some(Duration::ZERO));
        assert!(wakers.is_empty());
        assert_eq!(timers.len(), 0);
        assert_eq!(count.get(), 0);
    }

    #[test]
    fn equal_deadlines_fire_in_insertion_order() {
        let timers = Timers::default();
        let when = Instant::now();
        let (first, first_count) = counting_waker();
        let (second, second_count) = counting_waker();
        timers.insert(when, &first);
        timers.insert(when, &second);

        let mut wakers = Vec::new();
        timers.process(&mut wakers);
        assert_eq!(wakers.len(), 2);

        wakers.remove(0).wake();
        assert_eq!((first_count.get(), second_count.get()), (1, 0));
        wakers.remove(0).wake();
        assert_eq!((first_count.get(), second_count.get()), (1, 1));
    }
}

//! Per-task completion objects and the table that owns them.
//!
//! A [`FutureSlot`] collects the out-of-order per-item results for one task
//! and signals completion once every `request_id` in `0..N` has arrived. A
//! [`FutureTable`] is the `Streamer`'s map from `task_id` to slot; it is
//! consulted by the collector on every incoming response and by the reaper
//! that ages out abandoned entries.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::error::{PredictionFailure, StreamerError};
use crate::ids::{RequestId, TaskId};

type Slot<Res> = Result<Res, PredictionFailure>;

struct Inner<Res> {
    expected: usize,
    received: usize,
    results: Vec<Option<Slot<Res>>>,
    created_at: Instant,
}

/// The per-task completion object callers await.
///
/// Cloning a `FutureSlot` is cheap (it is a handle to shared state); the
/// `Streamer`, the collector, and the caller each hold a clone.
pub struct FutureSlot<Res> {
    task_id: TaskId,
    inner: Mutex<Inner<Res>>,
    notify: Notify,
}

impl<Res> FutureSlot<Res> {
    fn new(task_id: TaskId, expected: usize) -> Self {
        FutureSlot {
            task_id,
            inner: Mutex::new(Inner {
                expected,
                received: 0,
                results: (0..expected).map(|_| None).collect(),
                created_at: Instant::now(),
            }),
            notify: Notify::new(),
        }
    }

    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    /// Record one item's result. Called by the collector at most `expected`
    /// times, each with a distinct `request_id`. Out-of-range or duplicate
    /// request_ids are dropped rather than panicking — the transport doesn't
    /// duplicate by contract, but a malformed message shouldn't take the
    /// collector down.
    ///
    /// Returns `true` the one time this call is what completes the slot, so
    /// the caller (the collector) knows to remove it from the `FutureTable`
    /// immediately rather than leaving it for the reaper.
    pub fn append(&self, request_id: RequestId, result: Slot<Res>) -> bool {
        let mut inner = self.inner.lock();
        let Some(slot) = inner.results.get_mut(request_id.0) else {
            return false;
        };
        if slot.is_some() {
            return false;
        }
        *slot = Some(result);
        inner.received += 1;
        let done = inner.received == inner.expected;
        drop(inner);
        if done {
            self.notify.notify_waiters();
        }
        done
    }

    /// Non-blocking completion query.
    pub fn done(&self) -> bool {
        let inner = self.inner.lock();
        inner.received == inner.expected
    }

    fn age(&self) -> Duration {
        self.inner.lock().created_at.elapsed()
    }

    fn take_results(&self) -> Vec<Slot<Res>> {
        let mut inner = self.inner.lock();
        inner
            .results
            .iter_mut()
            .map(|slot| slot.take().expect("all slots filled on completion"))
            .collect()
    }

    /// Block until every item has arrived or `timeout` elapses.
    ///
    /// On completion, returns a `request_id`-ordered vector of length
    /// `expected`, one slot per item (`Ok` on success, `Err(PredictionFailure)`
    /// if the worker's predictor failed for that batch). On timeout, returns
    /// `StreamerError::Timeout`; per contract this should be called exactly
    /// once per `FutureSlot`.
    pub async fn await_result(&self, timeout: Duration) -> Result<Vec<Slot<Res>>, StreamerError> {
        if self.done() {
            return Ok(self.take_results());
        }

        let wait = async {
            loop {
                let notified = self.notify.notified();
                tokio::pin!(notified);
                // `enable` registers this waiter before we check `done`, so a
                // completion that lands between the check and the `.await`
                // below can't be missed.
                notified.as_mut().enable();
                if self.done() {
                    break;
                }
                notified.await;
            }
        };

        match tokio::time::timeout(timeout, wait).await {
            Ok(()) => Ok(self.take_results()),
            Err(_) => Err(StreamerError::Timeout(self.task_id)),
        }
    }
}

/// Owns every in-flight task's [`FutureSlot`] for one `Streamer`.
///
/// Entries are inserted at submission time and removed in one of two ways:
/// the collector removes an entry the instant its `append` call completes
/// the slot (so a caller blocked in `await_result` — however long its
/// timeout — is never affected by reaping, since its `Arc<FutureSlot>` keeps
/// it alive independent of the table), and a periodic reaper sweeps entries
/// that are both *incomplete* and *abandoned* — no one outside the table
/// still holds a reference to them — past `max_age` (see
/// [`FutureTable::reap`]). This is the systems-language stand-in for the
/// source's weak back-reference: the table is the sole owner once a caller
/// has dropped its handle, and a lookup against an already-removed
/// `task_id` simply returns `None` so the collector can drop the message.
pub struct FutureTable<Res> {
    slots: Mutex<HashMap<TaskId, Arc<FutureSlot<Res>>>>,
}

impl<Res> FutureTable<Res> {
    pub fn new() -> Self {
        FutureTable {
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub fn insert(&self, task_id: TaskId, expected: usize) -> Arc<FutureSlot<Res>> {
        let slot = Arc::new(FutureSlot::new(task_id, expected));
        self.slots.lock().insert(task_id, slot.clone());
        slot
    }

    /// Looked up by the collector on every incoming response; returns `None`
    /// for an unknown (already-completed or never-existed) task_id so the
    /// caller can silently drop the message per the core's contract.
    pub fn get(&self, task_id: TaskId) -> Option<Arc<FutureSlot<Res>>> {
        self.slots.lock().get(&task_id).cloned()
    }

    pub fn remove(&self, task_id: TaskId) {
        self.slots.lock().remove(&task_id);
    }

    /// Remove entries that are both older than `max_age` and *abandoned* —
    /// nothing outside the table still holds a reference to the slot.
    ///
    /// A caller that is still inside `await_result` (for however long its
    /// own timeout runs, even one longer than `max_age`) holds its own
    /// `Arc<FutureSlot>` the whole time, so `Arc::strong_count` is above the
    /// table's own count and the slot is never reaped out from under it. A
    /// slot only reaches `strong_count() == 1` (the table's own clone) once
    /// the submitter has given up on it — e.g. `predict`'s local `Arc`
    /// dropped after a `Timeout` — which is exactly the "caller abandoned
    /// the Future" case this sweep targets. Completed slots are normally
    /// gone already (the collector removes them the instant `append`
    /// reports completion); this is a backstop for slots whose predictor
    /// never responds at all. Returns the number of entries removed, for
    /// logging.
    pub fn reap(&self, max_age: Duration) -> usize {
        let mut slots = self.slots.lock();
        let before = slots.len();
        slots.retain(|_, slot| {
            let abandoned = Arc::strong_count(slot) <= 1;
            !(abandoned && slot.age() >= max_age)
        });
        before - slots.len()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }
}

impl<Res> Default for FutureTable<Res> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc as StdArc;

    #[tokio::test]
    async fn completes_on_nth_append_regardless_of_order() {
        let slot: StdArc<FutureSlot<i32>> = StdArc::new(FutureSlot::new(TaskId(0), 3));
        slot.append(RequestId(2), Ok(30));
        assert!(!slot.done());
        slot.append(RequestId(0), Ok(10));
        slot.append(RequestId(1), Ok(20));
        assert!(slot.done());

        let results = slot.await_result(Duration::from_millis(50)).await.unwrap();
        let values: Vec<i32> = results.into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(values, vec![10, 20, 30]);
    }

    #[tokio::test]
    async fn times_out_when_incomplete() {
        let slot: FutureSlot<i32> = FutureSlot::new(TaskId(1), 2);
        slot.append(RequestId(0), Ok(1));
        let err = slot.await_result(Duration::from_millis(20)).await;
        assert!(matches!(err, Err(StreamerError::Timeout(TaskId(1)))));
    }

    #[tokio::test]
    async fn duplicate_and_out_of_range_appends_are_dropped() {
        let slot: FutureSlot<i32> = FutureSlot::new(TaskId(2), 1);
        slot.append(RequestId(5), Ok(99)); // out of range
        assert!(!slot.done());
        slot.append(RequestId(0), Ok(1));
        slot.append(RequestId(0), Ok(2)); // duplicate, ignored
        let results = slot.await_result(Duration::from_millis(20)).await.unwrap();
        assert_eq!(results[0].as_ref().unwrap(), &1);
    }

    #[tokio::test]
    async fn unknown_task_id_lookup_returns_none() {
        let table: FutureTable<i32> = FutureTable::new();
        table.insert(TaskId(7), 1);
        assert!(table.get(TaskId(7)).is_some());
        table.remove(TaskId(7));
        assert!(table.get(TaskId(7)).is_none());
        assert!(table.get(TaskId(999)).is_none());
    }

    #[tokio::test]
    async fn reap_ages_out_abandoned_slots() {
        let table: FutureTable<i32> = FutureTable::new();
        table.insert(TaskId(1), 2); // Arc discarded: table is the sole owner
        assert_eq!(table.len(), 1);
        tokio::time::sleep(Duration::from_millis(20)).await;
        let removed = table.reap(Duration::from_millis(5));
        assert_eq!(removed, 1);
        assert_eq!(table.len(), 0);
    }

    #[tokio::test]
    async fn reap_never_evicts_a_slot_someone_still_holds() {
        let table: FutureTable<i32> = FutureTable::new();
        // Simulates a caller whose `await_result(timeout)` is still running
        // with a timeout longer than `max_age`: it keeps its own `Arc`, so
        // the slot must survive reaping no matter how old it gets.
        let held = table.insert(TaskId(1), 2);
        tokio::time::sleep(Duration::from_millis(20)).await;
        let removed = table.reap(Duration::from_millis(5));
        assert_eq!(removed, 0);
        assert_eq!(table.len(), 1);
        drop(held);
    }

    #[tokio::test]
    async fn append_reports_completion_exactly_once() {
        let slot: FutureSlot<i32> = FutureSlot::new(TaskId(0), 2);
        assert!(!slot.append(RequestId(0), Ok(1)));
        assert!(slot.append(RequestId(1), Ok(2)));
        // A duplicate append after completion is dropped, not re-reported.
        assert!(!slot.append(RequestId(0), Ok(99)));
    }
}

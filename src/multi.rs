//! Multi-stream coordination: a one-shot start barrier and the table of
//! combined-snapshot slots that sums the streams of one test.

use crate::event::Timestamp;
use crate::snapshot::{CombinedSnapshot, TransferSnapshot};
use crate::sync::Monitor;
use log::{debug, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const INTERRUPT_POLL: Duration = Duration::from_millis(10);

/// How the members of a group agree on their common start time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StartMode {
    /// Every member waits until all `thread_count` have arrived; the last
    /// arrival stamps the start (parallel senders)
    Barrier,
    /// The first member to register stamps the start and nobody waits
    /// (receivers, whose streams connect one by one)
    FirstArrival,
}

#[derive(Debug, Default)]
struct BarrierState {
    arrived: usize,
    start_time: Option<Timestamp>,
}

/// Shared by every channel of one logical multi-stream test.
///
/// Created through [`Reporter::create_coordinator`](crate::Reporter::create_coordinator)
/// and passed to each [`Reporter::create_channel`](crate::Reporter::create_channel)
/// call of the group.
///
/// Per-stream snapshots are matched to a slot by `(kind, start)`. A slot is
/// emitted as a [`CombinedSnapshot`] once `thread_count` streams have
/// contributed to it. When no slot is free the fold is dropped and counted
/// (see [`Coordinator::dropped_folds`]); a final fold instead evicts the
/// oldest interval slot so the group's total is never lost.
#[derive(Debug)]
pub struct Coordinator {
    thread_count: usize,
    group_id: i64,
    start_mode: StartMode,
    barrier: Monitor<BarrierState>,
    slots: Mutex<Vec<Option<CombinedSnapshot>>>,
    members: AtomicUsize,
    dropped_folds: AtomicU64,
    last_final: Mutex<Option<CombinedSnapshot>>,
    interrupted: Arc<AtomicBool>,
}

impl Coordinator {
    pub(crate) fn new(
        thread_count: usize,
        group_id: i64,
        start_mode: StartMode,
        slot_count: usize,
        interrupted: Arc<AtomicBool>,
    ) -> Self {
        Self {
            thread_count,
            group_id,
            start_mode,
            barrier: Monitor::new(BarrierState::default()),
            slots: Mutex::new(vec![None; slot_count]),
            members: AtomicUsize::new(0),
            dropped_folds: AtomicU64::new(0),
            last_final: Mutex::new(None),
            interrupted,
        }
    }

    pub fn thread_count(&self) -> usize {
        self.thread_count
    }

    pub fn group_id(&self) -> i64 {
        self.group_id
    }

    pub fn start_mode(&self) -> StartMode {
        self.start_mode
    }

    /// The shared start time, once fixed.
    pub fn start_time(&self) -> Option<Timestamp> {
        self.barrier.lock().start_time
    }

    /// Registers one more member and returns the group's start time,
    /// waiting at the barrier when the start mode asks for it.
    pub(crate) fn join(&self) -> Timestamp {
        self.members.fetch_add(1, Ordering::AcqRel);
        match self.start_mode {
            StartMode::Barrier => self.arrive_and_wait(),
            StartMode::FirstArrival => self.join_first_arrival(),
        }
    }

    /// Blocks until `thread_count` callers have arrived. The last one
    /// records the start time and wakes the rest; every caller gets the same
    /// value. Once fired, later arrivals return immediately.
    ///
    /// An interrupt releases waiters early with the time of the interrupt.
    pub fn arrive_and_wait(&self) -> Timestamp {
        let mut state = self.barrier.lock();
        if let Some(start) = state.start_time {
            return start;
        }
        state.arrived += 1;
        if state.arrived >= self.thread_count {
            let start = Timestamp::now();
            state.start_time = Some(start);
            self.barrier.broadcast();
            debug!("group {} started with {} streams", self.group_id, state.arrived);
            return start;
        }

        loop {
            if let Some(start) = state.start_time {
                return start;
            }
            if self.interrupted.load(Ordering::Acquire) {
                let start = Timestamp::now();
                state.start_time = Some(start);
                self.barrier.broadcast();
                warn!(
                    "group {} barrier released by interrupt with {}/{} streams",
                    self.group_id, state.arrived, self.thread_count
                );
                return start;
            }
            self.barrier.wait_for(&mut state, INTERRUPT_POLL);
        }
    }

    fn join_first_arrival(&self) -> Timestamp {
        let mut state = self.barrier.lock();
        state.arrived += 1;
        *state.start_time.get_or_insert_with(Timestamp::now)
    }

    /// Removes one member. Returns `true` for the last one.
    pub(crate) fn leave(&self) -> bool {
        self.members.fetch_sub(1, Ordering::AcqRel) == 1
    }

    /// Folds one stream's snapshot into its slot and returns the combined
    /// snapshot once the slot is complete. A single-stream group is never
    /// summed.
    pub fn fold(&self, snapshot: &TransferSnapshot) -> Option<CombinedSnapshot> {
        if self.thread_count <= 1 {
            return None;
        }
        let mut slots = self.slots.lock();
        let found = slots
            .iter()
            .position(|slot| matches!(slot, Some(c) if c.kind == snapshot.kind && c.start == snapshot.start));
        let index = match found.or_else(|| slots.iter().position(Option::is_none)) {
            Some(index) => index,
            None if snapshot.is_final() => match evict_oldest_interval(&mut slots) {
                Some(index) => {
                    warn!("group {}: evicted an open interval slot for the final sum", self.group_id);
                    index
                }
                None => return self.drop_fold(snapshot),
            },
            None => return self.drop_fold(snapshot),
        };

        let slot = slots[index].get_or_insert_with(|| self.empty_slot(snapshot));
        accumulate(slot, snapshot);
        if slot.contributions < self.thread_count {
            return None;
        }
        let combined = slots[index].take()?;
        drop(slots);
        if combined.is_final() {
            *self.last_final.lock() = Some(combined.clone());
        }
        Some(combined)
    }

    /// Emits whatever the final slot holds and clears every other slot.
    /// Used when the group's last stream is gone but fewer than
    /// `thread_count` ever contributed.
    pub fn flush_final(&self) -> Option<CombinedSnapshot> {
        let mut slots = self.slots.lock();
        let mut flushed = None;
        for slot in slots.iter_mut() {
            match slot.take() {
                Some(c) if c.is_final() => flushed = Some(c),
                Some(c) => debug!(
                    "group {}: discarding partial interval {:?}-{:?} ({} of {})",
                    self.group_id, c.start, c.end, c.contributions, self.thread_count
                ),
                None => {}
            }
        }
        drop(slots);
        if let Some(ref combined) = flushed {
            *self.last_final.lock() = Some(combined.clone());
        }
        flushed
    }

    /// The group's final combined snapshot, once emitted.
    pub fn final_sum(&self) -> Option<CombinedSnapshot> {
        self.last_final.lock().clone()
    }

    /// Number of folds dropped because every slot was taken.
    pub fn dropped_folds(&self) -> u64 {
        self.dropped_folds.load(Ordering::Relaxed)
    }

    fn drop_fold(&self, snapshot: &TransferSnapshot) -> Option<CombinedSnapshot> {
        self.dropped_folds.fetch_add(1, Ordering::Relaxed);
        warn!(
            "group {}: no free combined slot, dropping {:?} window at {:?} from transfer {}",
            self.group_id, snapshot.kind, snapshot.start, snapshot.transfer_id
        );
        None
    }

    fn empty_slot(&self, snapshot: &TransferSnapshot) -> CombinedSnapshot {
        CombinedSnapshot {
            group_id: self.group_id,
            kind: snapshot.kind,
            protocol: snapshot.protocol,
            role: snapshot.role,
            unit_format: snapshot.unit_format,
            start: snapshot.start,
            end: snapshot.end,
            bytes: 0,
            datagrams: 0,
            sequence_total: 0,
            errors: 0,
            out_of_order: 0,
            jitter: 0.0,
            contributions: 0,
        }
    }
}

fn accumulate(slot: &mut CombinedSnapshot, snapshot: &TransferSnapshot) {
    slot.end = slot.end.max(snapshot.end);
    slot.bytes += snapshot.bytes;
    slot.datagrams += snapshot.datagrams;
    slot.sequence_total += snapshot.sequence_total;
    slot.errors += snapshot.errors;
    slot.out_of_order += snapshot.out_of_order;
    slot.jitter = slot.jitter.max(snapshot.jitter);
    slot.contributions += 1;
}

fn evict_oldest_interval(slots: &mut [Option<CombinedSnapshot>]) -> Option<usize> {
    let index = slots
        .iter()
        .enumerate()
        .filter_map(|(i, slot)| slot.as_ref().filter(|c| !c.is_final()).map(|c| (i, c.start)))
        .min_by_key(|&(_, start)| start)
        .map(|(i, _)| i)?;
    slots[index] = None;
    Some(index)
}

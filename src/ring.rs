//! Fixed-capacity single-producer/single-consumer ring of packet events.
//!
//! Both positions are monotonically increasing counters; the slot of a
//! counter is `counter % capacity`. The ring is empty when the counters are
//! equal and full when they are `capacity` apart, so every slot is usable
//! and full/empty are never ambiguous.
//!
//! The producer writes a slot and only then publishes it by advancing the
//! producer counter with release ordering. The consumer observes the counter
//! with acquire ordering, copies the slot out and then advances the consumer
//! counter with release ordering, which is what hands the slot back.

use crate::event::PacketEvent;
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicUsize, Ordering};

pub(crate) struct Ring {
    slots: Box<[UnsafeCell<PacketEvent>]>,
    /// Events published so far (written by the producer only)
    produced: AtomicUsize,
    /// Events consumed so far (written by the consumer only)
    consumed: AtomicUsize,
}

// SAFETY: a slot is written only by the single producer while it lies
// outside `consumed..produced`, and read only by the single consumer while
// it lies inside. The counters' release/acquire pairs order those accesses.
// Callers uphold the single-producer and single-consumer roles: the
// producer side is reachable only through `&mut ChannelHandle`, the consumer
// side only while holding the channel's statistics lock.
unsafe impl Sync for Ring {}

impl Ring {
    pub(crate) fn new(capacity: usize) -> Self {
        let slots = (0..capacity)
            .map(|_| UnsafeCell::new(PacketEvent::default()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            slots,
            produced: AtomicUsize::new(0),
            consumed: AtomicUsize::new(0),
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Events published but not yet consumed.
    pub(crate) fn len(&self) -> usize {
        let consumed = self.consumed.load(Ordering::Acquire);
        let produced = self.produced.load(Ordering::Acquire);
        produced.wrapping_sub(consumed)
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Producer side. Hands the event back when the slot it would use has
    /// not been consumed yet.
    ///
    /// Must only be called by the single producer.
    pub(crate) fn try_push(&self, event: PacketEvent) -> Result<(), PacketEvent> {
        let produced = self.produced.load(Ordering::Relaxed);
        let consumed = self.consumed.load(Ordering::Acquire);
        if produced.wrapping_sub(consumed) >= self.capacity() {
            return Err(event);
        }
        let slot = &self.slots[produced % self.capacity()];
        // SAFETY: the slot is outside the consumer's readable window and we
        // are the only producer.
        unsafe {
            *slot.get() = event;
        }
        // Publishing MUST come after the slot write.
        self.produced.store(produced.wrapping_add(1), Ordering::Release);
        Ok(())
    }

    /// Consumer side. Never touches the slot at the producer position.
    ///
    /// Must only be called by the single consumer.
    pub(crate) fn pop(&self) -> Option<PacketEvent> {
        let consumed = self.consumed.load(Ordering::Relaxed);
        let produced = self.produced.load(Ordering::Acquire);
        if consumed == produced {
            return None;
        }
        let slot = &self.slots[consumed % self.capacity()];
        // SAFETY: the slot was published by the release store we just
        // acquired, and the producer will not reuse it before we advance.
        let event = unsafe { *slot.get() };
        self.consumed.store(consumed.wrapping_add(1), Ordering::Release);
        Some(event)
    }
}

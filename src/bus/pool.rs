// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Fixed-capacity lock-free pool of fabric message records
//! OWNERS: @kernel-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Host unit tests + bus property suite
//! PUBLIC API: (crate) MessagePool, MESSAGE_POOL, MSG_POOL_CAPACITY
//! DEPENDS_ON: bus::Message record layout, smp::wait_check during exhaustion
//! INVARIANTS: Free-list head packs {slot, generation}; every successful head
//!             exchange bumps the generation (ABA defense); a record is
//!             reachable from the free list or from pending consumers, never
//!             both; release requires completion == 0
//! ADR: docs/rfcs/RFC-0024-kernel-ipi-message-fabric.md

use core::mem;
use core::sync::atomic::{AtomicUsize, Ordering};

use super::Message;

/// Two outstanding broadcasts per core (one synchronous, one asynchronous)
/// cover the worst concurrent demand.
pub(crate) const MSG_POOL_CAPACITY: usize = 2 * crate::smp::MAX_CPUS;

/// Low bits of the head word hold slot-plus-one (0 terminates); the rest is
/// a generation stamp.
const HEAD_SLOT_BITS: usize = 16;
const HEAD_SLOT_MASK: usize = (1 << HEAD_SLOT_BITS) - 1;

static_assertions::const_assert!(MSG_POOL_CAPACITY < HEAD_SLOT_MASK);

static POOL_EXHAUSTED_EVENTS: AtomicUsize = AtomicUsize::new(0);
static POOL_EXHAUSTED_WARNED: AtomicUsize = AtomicUsize::new(0);

const fn pack_head(slot: usize, generation: usize) -> usize {
    (generation << HEAD_SLOT_BITS) | slot
}

const fn head_slot(head: usize) -> usize {
    head & HEAD_SLOT_MASK
}

const fn head_generation(head: usize) -> usize {
    head >> HEAD_SLOT_BITS
}

/// Lock-free free list threaded through the records' own `free_next` words.
pub(crate) struct MessagePool {
    head: AtomicUsize,
    records: [Message; MSG_POOL_CAPACITY],
}

/// Global record pool backing every broadcast.
pub(crate) static MESSAGE_POOL: MessagePool = MessagePool::new();

impl MessagePool {
    pub(crate) const fn new() -> Self {
        let mut records = [const { Message::idle(0) }; MSG_POOL_CAPACITY];
        let mut index = 0;
        // Chain slot i to slot i+1; the final record keeps the 0 terminator.
        while index + 1 < MSG_POOL_CAPACITY {
            records[index] = Message::idle(index + 2);
            index += 1;
        }
        Self {
            head: AtomicUsize::new(pack_head(1, 0)),
            records,
        }
    }

    /// Pops a free record, spinning while the pool is exhausted.
    ///
    /// Exhaustion is backpressure, not an error: the spin services this
    /// core's own inbound queue via `wait_check` so the in-flight messages
    /// we are waiting on can complete and release their records.
    pub(crate) fn acquire(&self) -> &Message {
        let mut starved = false;
        loop {
            let head = self.head.load(Ordering::Acquire);
            let slot = head_slot(head);
            if slot == 0 {
                if !starved {
                    starved = true;
                    POOL_EXHAUSTED_EVENTS.fetch_add(1, Ordering::AcqRel);
                    if POOL_EXHAUSTED_WARNED.swap(1, Ordering::AcqRel) == 0 {
                        log_warn!(target: "bus", "message pool exhausted; spinning");
                        #[cfg(feature = "bus_trace_ring")]
                        super::trace::maybe_dump_exhausted("pool-exhausted");
                    }
                    #[cfg(feature = "bus_trace_ring")]
                    super::trace::record_exhaustion(crate::smp::cpu_current_id());
                }
                crate::smp::wait_check();
                continue;
            }
            let record = &self.records[slot - 1];
            let next_slot = record.free_next.load(Ordering::Relaxed);
            let new_head = pack_head(next_slot, head_generation(head).wrapping_add(1));
            if self
                .head
                .compare_exchange_weak(head, new_head, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                debug_assert_eq!(record.completion_snapshot(), 0);
                return record;
            }
        }
    }

    /// Returns `msg` to the free list.
    ///
    /// The record must be quiescent; pushing a record that still has
    /// pending consumers would let two flights own it at once.
    pub(crate) fn release(&self, msg: &Message) {
        let pending = msg.completion_snapshot();
        if pending != 0 {
            log_error!(
                target: "bus",
                "PANIC: release with {} pending targets",
                pending
            );
            panic!("bus: release of in-flight message");
        }
        let slot = self.slot_of(msg);
        loop {
            let head = self.head.load(Ordering::Acquire);
            msg.free_next.store(head_slot(head), Ordering::Relaxed);
            let new_head = pack_head(slot, head_generation(head).wrapping_add(1));
            if self
                .head
                .compare_exchange_weak(head, new_head, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return;
            }
        }
    }

    fn slot_of(&self, msg: &Message) -> usize {
        let base = self.records.as_ptr() as usize;
        let addr = msg as *const Message as usize;
        debug_assert!(addr >= base);
        let offset = addr - base;
        debug_assert_eq!(offset % mem::size_of::<Message>(), 0);
        let index = offset / mem::size_of::<Message>();
        debug_assert!(index < MSG_POOL_CAPACITY);
        index + 1
    }

    /// Walks the free list and counts reachable records.
    ///
    /// Racy under contention; only meaningful while the fabric is
    /// quiescent, which is how selftests use it.
    pub(crate) fn selftest_free_count(&self) -> usize {
        let mut count = 0;
        let mut slot = head_slot(self.head.load(Ordering::Acquire));
        while slot != 0 && count < MSG_POOL_CAPACITY {
            count += 1;
            slot = self.records[slot - 1].free_next.load(Ordering::Relaxed);
        }
        count
    }
}

/// Times the pool ran dry since boot.
pub(crate) fn exhaustion_events() -> usize {
    POOL_EXHAUSTED_EVENTS.load(Ordering::Acquire)
}

#[cfg(test)]
pub(crate) fn reset_exhaustion_counters() {
    POOL_EXHAUSTED_EVENTS.store(0, Ordering::Release);
    POOL_EXHAUSTED_WARNED.store(0, Ordering::Release);
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::Ordering;

    #[test]
    fn fresh_pool_has_full_free_list() {
        static POOL: MessagePool = MessagePool::new();
        assert_eq!(POOL.selftest_free_count(), MSG_POOL_CAPACITY);
    }

    #[test]
    fn acquire_hands_out_distinct_records() {
        static POOL: MessagePool = MessagePool::new();
        let mut held: std::vec::Vec<&Message> = std::vec::Vec::new();
        for _ in 0..MSG_POOL_CAPACITY {
            let msg = POOL.acquire();
            assert!(held.iter().all(|other| !core::ptr::eq(*other, msg)));
            held.push(msg);
        }
        assert_eq!(POOL.selftest_free_count(), 0);
        for msg in held {
            POOL.release(msg);
        }
        assert_eq!(POOL.selftest_free_count(), MSG_POOL_CAPACITY);
    }

    #[test]
    fn release_order_is_independent_of_acquire_order() {
        static POOL: MessagePool = MessagePool::new();
        let first = POOL.acquire();
        let second = POOL.acquire();
        let third = POOL.acquire();
        POOL.release(second);
        POOL.release(first);
        POOL.release(third);
        assert_eq!(POOL.selftest_free_count(), MSG_POOL_CAPACITY);
    }

    #[test]
    fn concurrent_acquire_never_double_hands_a_record() {
        static POOL: MessagePool = MessagePool::new();
        const THREADS: usize = 4;
        const ROUNDS: usize = 200;

        std::thread::scope(|scope| {
            for _ in 0..THREADS {
                scope.spawn(|| {
                    for _ in 0..ROUNDS {
                        let msg = POOL.acquire();
                        // Claim the record through its completion word; a
                        // double hand-out makes the second claim fail.
                        assert!(msg
                            .completion
                            .compare_exchange(0, 7, Ordering::AcqRel, Ordering::Acquire)
                            .is_ok());
                        std::thread::yield_now();
                        msg.completion.store(0, Ordering::Release);
                        POOL.release(msg);
                    }
                });
            }
        });
        assert_eq!(POOL.selftest_free_count(), MSG_POOL_CAPACITY);
    }

    #[test]
    fn exhausted_pool_blocks_until_a_release() {
        // The exhaustion spin polls the global fabric via wait_check, so
        // serialize with the scenario tests.
        let _guard = crate::test_sync::TEST_LOCK.lock();
        static POOL: MessagePool = MessagePool::new();
        reset_exhaustion_counters();

        let mut held = std::vec::Vec::new();
        for _ in 0..MSG_POOL_CAPACITY {
            held.push(POOL.acquire());
        }
        let victim = held.pop().unwrap();

        std::thread::scope(|scope| {
            scope.spawn(|| {
                std::thread::sleep(std::time::Duration::from_millis(20));
                POOL.release(victim);
            });
            let reborn = POOL.acquire();
            assert!(core::ptr::eq(reborn, victim));
            POOL.release(reborn);
        });

        assert!(exhaustion_events() >= 1);
        for msg in held {
            POOL.release(msg);
        }
        assert_eq!(POOL.selftest_free_count(), MSG_POOL_CAPACITY);
    }

    #[test]
    fn test_reject_release_of_in_flight_record() {
        static POOL: MessagePool = MessagePool::new();
        let msg = POOL.acquire();
        msg.completion.store(2, Ordering::Release);

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            POOL.release(msg);
        }));
        assert!(result.is_err());

        // Repair for the remaining assertions.
        msg.completion.store(0, Ordering::Release);
        POOL.release(msg);
        assert_eq!(POOL.selftest_free_count(), MSG_POOL_CAPACITY);
    }
}

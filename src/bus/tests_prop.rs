// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![cfg(test)]
//! CONTEXT: Property-based tests for the message fabric
//! OWNERS: @kernel-team
//! NOTE: Tests only; no kernel logic. Ensures pool conservation and drain
//! ordering hold across arbitrary interleavings, not just the hand-picked
//! unit scenarios.
//!
//! TEST_SCOPE:
//!   - Record conservation across arbitrary acquire/release sequences
//!   - Per-target submission order for arbitrary batch sizes
//!   - CoreSet algebra against a plain-bitmask model
//!
//! TEST_SCENARIOS:
//!   - pool_conserves_records_across_interleavings(): no sequence of ops loses or duplicates a record
//!   - drain_runs_batch_in_submission_order(): n queued invokes run in post order on the target
//!   - core_set_matches_mask_model(): set ops mirror raw bitmask arithmetic

use core::sync::atomic::{AtomicUsize, Ordering};

use proptest::prelude::*;

use super::pool::{MessagePool, MSG_POOL_CAPACITY};
use super::{drain_pending, invoke_on, BroadcastOutcome, DeliveryMode, Message};
use crate::smp::{set_current_cpu_for_test, set_online_mask_for_test};
use crate::test_sync::TEST_LOCK;
use crate::types::{CoreSet, CpuId};

#[derive(Clone, Copy, Debug)]
enum PoolOp {
    Acquire,
    ReleaseOldest,
    ReleaseNewest,
}

fn arb_pool_op() -> impl Strategy<Value = PoolOp> {
    prop_oneof![
        Just(PoolOp::Acquire),
        Just(PoolOp::ReleaseOldest),
        Just(PoolOp::ReleaseNewest),
    ]
}

#[derive(Clone, Copy, Debug)]
enum SetOp {
    Insert(u16),
    Remove(u16),
}

fn arb_set_op() -> impl Strategy<Value = SetOp> {
    prop_oneof![
        (0u16..4).prop_map(SetOp::Insert),
        (0u16..4).prop_map(SetOp::Remove),
    ]
}

static BATCH_CURSOR: AtomicUsize = AtomicUsize::new(0);
static BATCH_ORDER: [AtomicUsize; 8] = [const { AtomicUsize::new(0) }; 8];

proptest! {
    #[test]
    fn pool_conserves_records_across_interleavings(ops in proptest::collection::vec(arb_pool_op(), 1..64)) {
        static POOL: MessagePool = MessagePool::new();
        let mut held: std::vec::Vec<&Message> = std::vec::Vec::new();

        for op in ops {
            match op {
                // Never exhaust: with no concurrent releaser the acquire
                // spin would never return.
                PoolOp::Acquire => {
                    if held.len() < MSG_POOL_CAPACITY {
                        let msg = POOL.acquire();
                        prop_assert!(held.iter().all(|other| !core::ptr::eq(*other, msg)));
                        held.push(msg);
                    }
                }
                PoolOp::ReleaseOldest => {
                    if !held.is_empty() {
                        POOL.release(held.remove(0));
                    }
                }
                PoolOp::ReleaseNewest => {
                    if let Some(msg) = held.pop() {
                        POOL.release(msg);
                    }
                }
            }
            prop_assert_eq!(POOL.selftest_free_count(), MSG_POOL_CAPACITY - held.len());
        }

        for msg in held.drain(..) {
            POOL.release(msg);
        }
        prop_assert_eq!(POOL.selftest_free_count(), MSG_POOL_CAPACITY);
    }

    #[test]
    fn drain_runs_batch_in_submission_order(batch in 1usize..=6) {
        let _guard = TEST_LOCK.lock();
        super::reset_fabric_for_test();
        set_online_mask_for_test(0b1111);
        set_current_cpu_for_test(CpuId::BOOT);
        BATCH_CURSOR.store(0, Ordering::Release);
        for slot in BATCH_ORDER.iter() {
            slot.store(0, Ordering::Release);
        }

        let target = CpuId::from_raw(3);
        for index in 0..batch {
            let outcome = invoke_on(
                target,
                move || {
                    let at = BATCH_CURSOR.fetch_add(1, Ordering::AcqRel);
                    BATCH_ORDER[at].store(index + 1, Ordering::Release);
                },
                DeliveryMode::Asynchronous,
            );
            prop_assert_eq!(outcome, BroadcastOutcome::Posted);
        }

        set_current_cpu_for_test(target);
        prop_assert!(drain_pending(target));
        set_current_cpu_for_test(CpuId::BOOT);

        prop_assert_eq!(BATCH_CURSOR.load(Ordering::Acquire), batch);
        for index in 0..batch {
            prop_assert_eq!(BATCH_ORDER[index].load(Ordering::Acquire), index + 1);
        }
        prop_assert_eq!(
            super::selftest_pool_free_count(),
            super::selftest_pool_capacity()
        );
    }

    #[test]
    fn core_set_matches_mask_model(ops in proptest::collection::vec(arb_set_op(), 0..32)) {
        let mut set = CoreSet::EMPTY;
        let mut model: usize = 0;

        for op in ops {
            match op {
                SetOp::Insert(cpu) => {
                    set = set.insert(CpuId::from_raw(cpu));
                    model |= 1usize << cpu;
                }
                SetOp::Remove(cpu) => {
                    set = set.remove(CpuId::from_raw(cpu));
                    model &= !(1usize << cpu);
                }
            }
            prop_assert_eq!(set.as_mask(), model);
            prop_assert_eq!(set.count(), model.count_ones());
            prop_assert_eq!(set.is_empty(), model == 0);
        }

        let mut seen: usize = 0;
        let mut last: Option<u16> = None;
        for cpu in set.iter() {
            if let Some(prev) = last {
                prop_assert!(cpu.as_raw() > prev);
            }
            last = Some(cpu.as_raw());
            seen |= 1usize << cpu.as_index();
        }
        prop_assert_eq!(seen, model);
    }
}

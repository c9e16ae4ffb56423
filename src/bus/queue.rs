// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Per-core inbound queues of intrusive fabric entries
//! OWNERS: @kernel-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Host unit tests + bus property suite
//! PUBLIC API: (crate) QueueEntry, push(), take_all_reversed(), next_of(), is_empty()
//! DEPENDS_ON: smp::MAX_CPUS, bus::Message storage lifetime
//! INVARIANTS: Entries are pushed with Release and detached with Acquire;
//!             an entry is on at most one inbound list at a time; detached
//!             chains are core-local and returned in submission order
//! ADR: docs/rfcs/RFC-0024-kernel-ipi-message-fabric.md

use core::ptr;
use core::sync::atomic::{AtomicPtr, Ordering};

use crate::smp::MAX_CPUS;
use crate::types::CpuId;

use super::Message;

/// Intrusive link embedded in each message, one per possible target core.
///
/// `msg` is written by the sender while it still owns the message
/// exclusively; the Release push of the entry publishes it to the drainer.
pub(crate) struct QueueEntry {
    next: AtomicPtr<QueueEntry>,
    msg: AtomicPtr<Message>,
}

impl QueueEntry {
    pub(crate) const fn new() -> Self {
        Self {
            next: AtomicPtr::new(ptr::null_mut()),
            msg: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Message served by this entry. Valid only between detach and the
    /// completion decrement for the entry.
    pub(crate) fn message(&self) -> &'static Message {
        let raw = self.msg.load(Ordering::Relaxed);
        debug_assert!(!raw.is_null());
        // SAFETY: the sender stored a pointer to a pool record before the
        // publishing push; pool records have static storage duration.
        unsafe { &*raw }
    }
}

/// One lock-free inbound list head per possible core.
static INBOUND_HEADS: [AtomicPtr<QueueEntry>; MAX_CPUS] =
    [const { AtomicPtr::new(ptr::null_mut()) }; MAX_CPUS];

/// Publishes `entry` (serving `msg`) onto `target`'s inbound list.
pub(crate) fn push(target: CpuId, entry: &'static QueueEntry, msg: &'static Message) {
    entry
        .msg
        .store(msg as *const Message as *mut Message, Ordering::Relaxed);
    let head = &INBOUND_HEADS[target.as_index()];
    let entry_ptr = entry as *const QueueEntry as *mut QueueEntry;
    let mut current = head.load(Ordering::Relaxed);
    loop {
        entry.next.store(current, Ordering::Relaxed);
        match head.compare_exchange_weak(current, entry_ptr, Ordering::Release, Ordering::Relaxed)
        {
            Ok(_) => return,
            Err(observed) => current = observed,
        }
    }
}

/// Detaches `cpu`'s whole inbound list and returns it in submission order.
///
/// Head-push produces newest-first; the local reversal restores per-target
/// FIFO before any entry is dispatched. Returns null when the list was
/// empty.
pub(crate) fn take_all_reversed(cpu: CpuId) -> *mut QueueEntry {
    let head = &INBOUND_HEADS[cpu.as_index()];
    let mut chain = head.swap(ptr::null_mut(), Ordering::Acquire);
    let mut fifo: *mut QueueEntry = ptr::null_mut();
    while !chain.is_null() {
        // SAFETY: the chain is detached; only this core walks it.
        let entry = unsafe { &*chain };
        let next = entry.next.load(Ordering::Relaxed);
        entry.next.store(fifo, Ordering::Relaxed);
        fifo = chain;
        chain = next;
    }
    fifo
}

/// Successor of a detached entry. Snapshot this before dispatching the
/// entry; after the completion decrement the entry may be reused.
pub(crate) fn next_of(entry: &QueueEntry) -> *mut QueueEntry {
    entry.next.load(Ordering::Relaxed)
}

#[cfg(test)]
pub(crate) fn is_empty(cpu: CpuId) -> bool {
    INBOUND_HEADS[cpu.as_index()].load(Ordering::Acquire).is_null()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_sync::TEST_LOCK;

    fn leaked_entry() -> &'static QueueEntry {
        std::boxed::Box::leak(std::boxed::Box::new(QueueEntry::new()))
    }

    static DUMMY_MSG: Message = Message::idle(0);

    #[test]
    fn take_all_restores_submission_order() {
        let _guard = TEST_LOCK.lock();
        let cpu = CpuId::from_raw(3);
        assert!(is_empty(cpu));

        let first = leaked_entry();
        let second = leaked_entry();
        let third = leaked_entry();
        push(cpu, first, &DUMMY_MSG);
        push(cpu, second, &DUMMY_MSG);
        push(cpu, third, &DUMMY_MSG);

        let mut cursor = take_all_reversed(cpu);
        let expected: [*const QueueEntry; 3] = [first, second, third];
        for entry in expected {
            assert_eq!(cursor as *const QueueEntry, entry);
            cursor = next_of(unsafe { &*cursor });
        }
        assert!(cursor.is_null());
        assert!(is_empty(cpu));
    }

    #[test]
    fn take_all_on_empty_queue_returns_null() {
        let _guard = TEST_LOCK.lock();
        let cpu = CpuId::from_raw(2);
        assert!(take_all_reversed(cpu).is_null());
    }

    #[test]
    fn detached_entry_resolves_its_message() {
        let _guard = TEST_LOCK.lock();
        let cpu = CpuId::from_raw(3);
        let entry = leaked_entry();
        push(cpu, entry, &DUMMY_MSG);

        let cursor = take_all_reversed(cpu);
        assert!(!cursor.is_null());
        let detached = unsafe { &*cursor };
        assert!(core::ptr::eq(detached.message(), &DUMMY_MSG));
        assert!(is_empty(cpu));
    }
}

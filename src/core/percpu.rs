// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Late-initialized typed per-CPU state (lock-free read path)
//! OWNERS: @kernel-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Host unit tests + QEMU selftest (idle telemetry)
//! PUBLIC API: ProcessorSpecific<T>, PerCoreData, PerCoreSlot
//! DEPENDS_ON: smp::MAX_CPUS, smp::cpu_current_id(), heap (initialize only)
//! INVARIANTS: Each slot is published at most once per CPU; readers observe
//!             either null or a fully constructed value; published values
//!             are leaked and live forever; the public accessors resolve
//!             the calling CPU only (no cross-core path)
//! ADR: docs/rfcs/RFC-0024-kernel-ipi-message-fabric.md

extern crate alloc;

use alloc::boxed::Box;
use core::marker::PhantomData;
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::smp::MAX_CPUS;
use crate::types::CpuId;

/// Identity of a typed per-CPU slot, one per `PerCoreData` impl.
///
/// Grows as subsystems adopt typed per-CPU state; the discriminant indexes
/// `PER_CORE_SLOTS` directly.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(usize)]
pub enum PerCoreSlot {
    IdleTelemetry = 0,
}

pub const PER_CORE_SLOT_COUNT: usize = 1;

/// Typed state owned by a single CPU; lookups hand out only the calling
/// core's instance.
pub trait PerCoreData: Default + Sync + Sized + 'static {
    const SLOT: PerCoreSlot;
}

static PER_CORE_SLOTS: [[AtomicUsize; PER_CORE_SLOT_COUNT]; MAX_CPUS] =
    [const { [const { AtomicUsize::new(0) }; PER_CORE_SLOT_COUNT] }; MAX_CPUS];

/// Handle to one typed slot, filled in per core during bring-up.
///
/// `initialize` heap-allocates during bring-up; `get` is a single atomic
/// load on the hot path. Every public accessor resolves the calling CPU;
/// another core's instance is not reachable through this handle. Reading
/// an uninitialized slot is a boot ordering bug and panics.
pub struct ProcessorSpecific<T: PerCoreData> {
    _marker: PhantomData<fn() -> T>,
}

impl<T: PerCoreData> ProcessorSpecific<T> {
    pub const fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }

    /// Publishes the calling CPU's instance, constructed via `Default`.
    pub fn initialize(&self) {
        self.initialize_for(crate::smp::cpu_current_id());
    }

    /// Reads the calling CPU's instance.
    pub fn get(&self) -> &'static T {
        match self.try_get() {
            Some(value) => value,
            None => panic!("percpu: read before initialize"),
        }
    }

    /// Reads the calling CPU's instance if it has been initialized.
    pub fn try_get(&self) -> Option<&'static T> {
        self.try_get_for(crate::smp::cpu_current_id())
    }

    fn initialize_for(&self, cpu: CpuId) {
        let idx = cpu.as_index();
        if idx >= MAX_CPUS {
            panic!("percpu: cpu index out of range");
        }
        let leaked: &'static T = Box::leak(Box::new(T::default()));
        let raw = leaked as *const T as usize;
        let slot = &PER_CORE_SLOTS[idx][T::SLOT as usize];
        if slot
            .compare_exchange(0, raw, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            log_error!(
                target: "percpu",
                "PANIC: double init of slot {} on cpu{}",
                T::SLOT as usize,
                idx
            );
            panic!("percpu: slot initialized twice");
        }
    }

    fn try_get_for(&self, cpu: CpuId) -> Option<&'static T> {
        let idx = cpu.as_index();
        if idx >= MAX_CPUS {
            return None;
        }
        let raw = PER_CORE_SLOTS[idx][T::SLOT as usize].load(Ordering::Acquire);
        if raw == 0 {
            return None;
        }
        // SAFETY: a nonzero word was published exactly once by initialize
        // and the pointee is leaked.
        Some(unsafe { &*(raw as *const T) })
    }
}

#[cfg(test)]
pub(crate) fn reset_for_test() {
    // Leaks any published values; tests only care about slot occupancy.
    for per_cpu in PER_CORE_SLOTS.iter() {
        for slot in per_cpu.iter() {
            slot.store(0, Ordering::Release);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::smp::set_current_cpu_for_test;
    use crate::test_sync::TEST_LOCK;

    #[derive(Default)]
    struct Counter {
        hits: AtomicUsize,
    }

    impl PerCoreData for Counter {
        const SLOT: PerCoreSlot = PerCoreSlot::IdleTelemetry;
    }

    static COUNTER: ProcessorSpecific<Counter> = ProcessorSpecific::new();

    #[test]
    fn initialize_then_get_roundtrip() {
        let _guard = TEST_LOCK.lock();
        reset_for_test();
        set_current_cpu_for_test(CpuId::from_raw(2));

        COUNTER.initialize();
        COUNTER.get().hits.fetch_add(1, Ordering::AcqRel);
        COUNTER.get().hits.fetch_add(1, Ordering::AcqRel);
        assert_eq!(COUNTER.get().hits.load(Ordering::Acquire), 2);
    }

    #[test]
    fn initialize_publishes_the_calling_core_only() {
        let _guard = TEST_LOCK.lock();
        reset_for_test();
        set_current_cpu_for_test(CpuId::BOOT);

        COUNTER.initialize();
        COUNTER.get().hits.fetch_add(7, Ordering::AcqRel);

        // No other core's slot was published, and the caller only ever
        // touched its own instance.
        for raw in 1..MAX_CPUS as u16 {
            assert!(COUNTER.try_get_for(CpuId::from_raw(raw)).is_none());
        }
        assert_eq!(COUNTER.get().hits.load(Ordering::Acquire), 7);
    }

    #[test]
    fn accessors_resolve_to_the_calling_core() {
        let _guard = TEST_LOCK.lock();
        reset_for_test();

        set_current_cpu_for_test(CpuId::BOOT);
        COUNTER.initialize();
        COUNTER.get().hits.fetch_add(7, Ordering::AcqRel);

        set_current_cpu_for_test(CpuId::from_raw(1));
        COUNTER.initialize();
        assert_eq!(COUNTER.get().hits.load(Ordering::Acquire), 0);

        set_current_cpu_for_test(CpuId::BOOT);
        assert_eq!(COUNTER.get().hits.load(Ordering::Acquire), 7);
    }

    #[test]
    fn test_reject_double_initialize() {
        let _guard = TEST_LOCK.lock();
        reset_for_test();
        set_current_cpu_for_test(CpuId::from_raw(3));

        COUNTER.initialize();
        let result = std::panic::catch_unwind(|| COUNTER.initialize());
        assert!(result.is_err());
    }

    #[test]
    fn test_reject_get_before_initialize() {
        let _guard = TEST_LOCK.lock();
        reset_for_test();
        set_current_cpu_for_test(CpuId::from_raw(1));

        let result = std::panic::catch_unwind(|| {
            let _ = COUNTER.get();
        });
        assert!(result.is_err());
    }

    #[test]
    fn try_get_rejects_out_of_range_cpu() {
        let _guard = TEST_LOCK.lock();
        assert!(COUNTER
            .try_get_for(CpuId::from_raw(MAX_CPUS as u16))
            .is_none());
    }
}

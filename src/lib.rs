// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: TASK-0031 axon kernel library root (module graph, allocator, heap handoff)
//! OWNERS: @kernel-team
//! STATUS: In Progress
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Host unit tests per module + property suite; QEMU marker selftests
//! PUBLIC API: init_heap() plus the bus/smp/percpu/trap module surfaces
//! DEPENDS_ON: linked_list_allocator (kernel heap), spin (locks)
//! INVARIANTS: no_std applies to the kernel target only; host builds lean on std
//!             so the unit suites can use threads as cores
//! ADR: docs/rfcs/RFC-0024-kernel-ipi-message-fabric.md

#![cfg_attr(target_os = "none", no_std)]

extern crate alloc;

#[macro_use]
#[path = "diag/log.rs"]
pub mod log;

pub mod arch;
#[path = "core/boot.rs"]
pub mod boot;
pub mod bus;
pub mod determinism;
pub mod hal;
#[path = "core/kmain.rs"]
pub mod kmain;
#[path = "diag/liveness.rs"]
pub mod liveness;
pub mod panic;
#[path = "core/percpu.rs"]
pub mod percpu;
pub mod selftest;
#[path = "core/smp.rs"]
pub mod smp;
pub mod trap;
pub mod types;
pub mod uart;

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
#[global_allocator]
static ALLOCATOR: linked_list_allocator::LockedHeap = linked_list_allocator::LockedHeap::empty();

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
const KERNEL_HEAP_SIZE: usize = 256 * 1024;

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
static mut KERNEL_HEAP: [u8; KERNEL_HEAP_SIZE] = [0; KERNEL_HEAP_SIZE];

/// Hands the allocator its backing storage.
///
/// Runs once on the boot hart before anything allocates; secondaries come up
/// after the heap exists.
#[cfg(all(target_arch = "riscv64", target_os = "none"))]
pub fn init_heap() {
    #[allow(static_mut_refs)]
    // SAFETY: single-threaded early boot; the array is never referenced again
    // outside the allocator.
    unsafe {
        ALLOCATOR.lock().init(KERNEL_HEAP.as_mut_ptr(), KERNEL_HEAP_SIZE);
    }
}

#[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
pub fn init_heap() {}

#[cfg(test)]
pub(crate) mod test_sync {
    //! Host tests share the global pool, queues and percpu slots; suites that
    //! reset them take this lock first.

    pub(crate) static TEST_LOCK: spin::Mutex<()> = spin::Mutex::new(());
}

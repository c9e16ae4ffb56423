// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: TASK-0031 SMP scaffolding for the message fabric (CPU identity, online mask, secondary boot, IPI signaling)
//! OWNERS: @kernel-team
//! STATUS: In Progress
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Host unit tests + QEMU SMP marker path + kernel selftests
//! PUBLIC API: cpu_current_id(), cpu_online_mask(), smp_active(), start_secondary_harts(), signal_core(), wait_check(), halt(), handle_ssoft_fabric()
//! DEPENDS_ON: sbi-rt (HSM/sPI), bus::drain_pending, per-hart trap stack-top table consumed by trap install path
//! INVARIANTS: bounded CPU set, atomic online-mask updates, guarded tp->stack CPU-ID resolution, deterministic markers
//! ADR: docs/rfcs/RFC-0024-kernel-ipi-message-fabric.md

use core::sync::atomic::{AtomicUsize, Ordering};

use crate::types::CpuId;
#[cfg(all(target_arch = "riscv64", target_os = "none"))]
use crate::types::HartId;

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
use sbi_rt as sbi;

/// Fixed CPU ceiling for deterministic bring-up and bounded per-CPU state.
pub const MAX_CPUS: usize = 4;

const SECONDARY_STACK_SIZE: usize = 16 * 1024;
#[cfg(all(target_arch = "riscv64", target_os = "none"))]
const SBI_ERR_INVALID_PARAM: usize = (-3isize) as usize;
#[cfg(all(target_arch = "riscv64", target_os = "none"))]
const SBI_ERR_ALREADY_AVAILABLE: usize = (-6isize) as usize;
#[cfg(all(target_arch = "riscv64", target_os = "none"))]
const SBI_ERR_ALREADY_STARTED: usize = (-7isize) as usize;

#[derive(Clone, Copy)]
#[repr(align(16))]
#[allow(dead_code)]
struct HartStack([u8; SECONDARY_STACK_SIZE]);

const EMPTY_HART_STACK: HartStack = HartStack([0; SECONDARY_STACK_SIZE]);

// Dedicated secondary-hart stacks used as SBI HSM `hart_start` opaque stack tops.
#[link_section = ".bss"]
static mut SECONDARY_HART_STACKS: [HartStack; MAX_CPUS - 1] = [EMPTY_HART_STACK; MAX_CPUS - 1];

/// Per-hart trap stack table used by trap-vector installation paths.
#[no_mangle]
pub static __hart_trap_stack_tops: [AtomicUsize; MAX_CPUS] =
    [const { AtomicUsize::new(0) }; MAX_CPUS];

static CPU_ONLINE_MASK: AtomicUsize = AtomicUsize::new(0);
static SIGNAL_REQUESTED: [AtomicUsize; MAX_CPUS] = [const { AtomicUsize::new(0) }; MAX_CPUS];
static SIGNAL_IPI_SENT_OK: [AtomicUsize; MAX_CPUS] = [const { AtomicUsize::new(0) }; MAX_CPUS];
static SSOFT_TRAPS: [AtomicUsize; MAX_CPUS] = [const { AtomicUsize::new(0) }; MAX_CPUS];
static SSOFT_DRAINED: [AtomicUsize; MAX_CPUS] = [const { AtomicUsize::new(0) }; MAX_CPUS];
static SELFTEST_FORCE_IPI_SEND_FAIL: AtomicUsize = AtomicUsize::new(0);

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
core::arch::global_asm!(
    r#"
    .section .text.__secondary_hart_start, "ax", @progbits
    .globl __secondary_hart_start
    .type  __secondary_hart_start, @function
    .align 4
__secondary_hart_start:
    /* SBI HSM contract: a0=hartid, a1=opaque. We pass stack-top via opaque. */
    mv    sp, a1
    .option push
    .option norelax
    la    gp, __global_pointer$
    .option pop
    tail  __secondary_hart_rust
    .size __secondary_hart_start, .-__secondary_hart_start
"#
);

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
extern "C" {
    fn __secondary_hart_start();
}

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
#[no_mangle]
extern "C" fn __secondary_hart_rust(hartid: usize, stack_top: usize) -> ! {
    crate::kmain::kmain_secondary(HartId::from_raw(hartid as u16), stack_top)
}

/// Per-CPU signal/trap counters backing selftests and bring-up markers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SignalEvidence {
    pub signal_requested_count: usize,
    pub ipi_send_ok_count: usize,
    pub ssoft_trap_count: usize,
    pub ssoft_drained_count: usize,
}

/// Result of servicing a supervisor software interrupt.
#[must_use = "soft-interrupt outcomes must be handled"]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SoftIrqOutcome {
    /// The inbound fabric queue held work and was drained.
    Drained,
    /// The queue was empty; the signal raced an earlier poll.
    Idle,
}

#[inline]
fn cpu_from_tp_hint_raw(raw_tp: usize, online_mask: usize) -> Option<CpuId> {
    if raw_tp >= MAX_CPUS {
        return None;
    }
    let cpu = CpuId::from_raw(raw_tp as u16);
    let bit = 1usize << cpu.as_index();
    if online_mask == 0 || (online_mask & bit) != 0 {
        Some(cpu)
    } else {
        None
    }
}

#[inline]
fn resolve_cpu_id(tp_hint: Option<CpuId>, stack_cpu: Option<CpuId>) -> CpuId {
    match (tp_hint, stack_cpu) {
        (Some(tp), Some(stack_cpu)) if tp == stack_cpu => tp,
        (_, Some(stack_cpu)) => stack_cpu,
        (Some(tp), None) if tp.is_boot() => tp,
        _ => CpuId::BOOT,
    }
}

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
fn cpu_from_stack_pointer(sp: usize) -> Option<CpuId> {
    for idx in 1..MAX_CPUS {
        let cpu = CpuId::from_raw(idx as u16);
        let Some(top) = secondary_stack_top(cpu) else {
            continue;
        };
        let base = top.saturating_sub(SECONDARY_STACK_SIZE);
        if sp >= base && sp <= top {
            return Some(cpu);
        }
    }
    None
}

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
#[inline]
fn cpu_from_tp_hint() -> Option<CpuId> {
    let raw_tp: usize;
    // SAFETY: reading `tp` register is side-effect free and does not violate memory safety.
    unsafe {
        core::arch::asm!(
            "mv {o}, tp",
            o = out(reg) raw_tp,
            options(nomem, nostack, preserves_flags)
        );
    }
    cpu_from_tp_hint_raw(raw_tp, cpu_online_mask())
}

#[cfg(all(not(all(target_arch = "riscv64", target_os = "none")), test))]
std::thread_local! {
    static TEST_CPU_ID: core::cell::Cell<u16> = const { core::cell::Cell::new(0) };
}

/// Pins the calling test thread to a logical CPU identity.
///
/// Host tests use one thread per simulated core; the override keeps
/// `cpu_current_id()` coherent on each of them.
#[cfg(all(not(all(target_arch = "riscv64", target_os = "none")), test))]
pub fn set_current_cpu_for_test(cpu: CpuId) {
    TEST_CPU_ID.with(|cell| cell.set(cpu.as_raw()));
}

#[cfg(all(not(all(target_arch = "riscv64", target_os = "none")), test))]
fn host_cpu_id() -> CpuId {
    TEST_CPU_ID.with(|cell| CpuId::from_raw(cell.get()))
}

#[cfg(all(not(all(target_arch = "riscv64", target_os = "none")), not(test)))]
fn host_cpu_id() -> CpuId {
    CpuId::BOOT
}

#[inline]
pub fn cpu_current_id() -> CpuId {
    // S-mode must not rely on mhartid CSR reads (illegal on typical firmware).
    // We use a guarded hybrid path:
    //   tp-hint -> stack-range verification/fallback -> BOOT fallback.
    #[cfg(all(target_arch = "riscv64", target_os = "none"))]
    {
        let tp_hint = cpu_from_tp_hint();
        let sp = crate::arch::riscv::read_sp();
        let stack_cpu = cpu_from_stack_pointer(sp);
        resolve_cpu_id(tp_hint, stack_cpu)
    }
    #[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
    {
        host_cpu_id()
    }
}

#[inline]
pub fn cpu_online_mask() -> usize {
    CPU_ONLINE_MASK.load(Ordering::Acquire)
}

#[inline]
pub fn cpu_is_online(cpu: CpuId) -> bool {
    let bit = 1usize << cpu.as_index();
    cpu_online_mask() & bit != 0
}

/// True once more than one core participates in the fabric.
#[inline]
pub fn smp_active() -> bool {
    cpu_online_mask().count_ones() > 1
}

/// Emits deterministic online markers exactly once per CPU.
pub fn mark_cpu_online(cpu: CpuId) {
    let idx = cpu.as_index();
    if idx >= MAX_CPUS {
        return;
    }
    let bit = 1usize << idx;
    let previous = CPU_ONLINE_MASK.fetch_or(bit, Ordering::AcqRel);
    if previous & bit == 0 {
        log_info!(target: "smp", "KINIT: cpu{} online", idx);
    }
}

/// Replaces the online mask wholesale so tests can model core topologies.
#[cfg(test)]
pub fn set_online_mask_for_test(mask: usize) {
    CPU_ONLINE_MASK.store(mask, Ordering::Release);
}

pub fn register_trap_stack_top(cpu: CpuId, stack_top: usize) {
    let idx = cpu.as_index();
    if idx >= MAX_CPUS {
        return;
    }
    __hart_trap_stack_tops[idx].store(stack_top, Ordering::Release);
}

pub fn trap_stack_top_for_current() -> usize {
    let idx = cpu_current_id().as_index();
    if idx < MAX_CPUS {
        let top = __hart_trap_stack_tops[idx].load(Ordering::Acquire);
        if top != 0 {
            return top;
        }
    }
    linker_boot_stack_top()
}

/// Initializes boot CPU online/stack state for trap entry.
pub fn init_boot_hart_state() {
    let boot_cpu = CpuId::BOOT;
    register_trap_stack_top(boot_cpu, linker_boot_stack_top());
    mark_cpu_online(boot_cpu);
}

fn linker_boot_stack_top() -> usize {
    #[cfg(all(target_arch = "riscv64", target_os = "none"))]
    {
        extern "C" {
            static __stack_top: u8;
        }
        // SAFETY: linker symbol points to static stack end in kernel image.
        unsafe { &__stack_top as *const u8 as usize }
    }
    #[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
    {
        0
    }
}

#[cfg_attr(not(all(target_arch = "riscv64", target_os = "none")), allow(dead_code))]
fn secondary_stack_top(cpu: CpuId) -> Option<usize> {
    let idx = cpu.as_index();
    if idx == 0 || idx >= MAX_CPUS {
        return None;
    }
    // SAFETY: bounded index and static storage lifetime.
    let base = unsafe { core::ptr::addr_of!(SECONDARY_HART_STACKS[idx - 1]) as usize };
    Some(base + SECONDARY_STACK_SIZE)
}

/// Starts secondary harts via SBI HSM and returns the expected-online bitmask.
pub fn start_secondary_harts() -> usize {
    let boot = CpuId::BOOT;
    #[cfg_attr(not(all(target_arch = "riscv64", target_os = "none")), allow(unused_mut))]
    let mut expected_mask = 1usize << boot.as_index();

    #[cfg(all(target_arch = "riscv64", target_os = "none"))]
    {
        for idx in 1..MAX_CPUS {
            let hart = HartId::from_raw(idx as u16);
            let cpu = CpuId::from_hart(hart);
            let Some(stack_top) = secondary_stack_top(cpu) else {
                continue;
            };

            let ret = sbi::hart_start(hart.as_index(), __secondary_hart_start as usize, stack_top);
            match ret.error {
                0 | SBI_ERR_ALREADY_AVAILABLE | SBI_ERR_ALREADY_STARTED => {
                    register_trap_stack_top(cpu, stack_top);
                    expected_mask |= 1usize << idx;
                }
                SBI_ERR_INVALID_PARAM => {
                    // No further harts are addressable in this environment.
                    break;
                }
                _ => {
                    log_error!(
                        target: "smp",
                        "KINIT: hart{} start failed err=0x{:x}",
                        idx,
                        ret.error
                    );
                    if idx == 1 {
                        panic!("SMP bring-up failed: hart1 not startable");
                    }
                }
            }
        }
    }

    expected_mask
}

pub fn wait_for_online_mask(expected_mask: usize, spin_budget: usize) -> bool {
    for _ in 0..spin_budget {
        if cpu_online_mask() & expected_mask == expected_mask {
            return true;
        }
        core::hint::spin_loop();
    }
    false
}

/// Sends a fabric IPI to `target`.
///
/// Returns `false` without side effects for out-of-range or offline
/// targets. Delivery is fire-and-forget: a suppressed or lost IPI only
/// delays the target until its next `wait_check()` poll.
pub fn signal_core(target: CpuId) -> bool {
    let idx = target.as_index();
    if idx >= MAX_CPUS || !cpu_is_online(target) {
        return false;
    }
    SIGNAL_REQUESTED[idx].fetch_add(1, Ordering::AcqRel);

    #[cfg(all(target_arch = "riscv64", target_os = "none"))]
    {
        if idx < usize::BITS as usize {
            if SELFTEST_FORCE_IPI_SEND_FAIL.load(Ordering::Acquire) == 0 {
                let ret = sbi::send_ipi(1usize << idx, 0);
                if ret.error == 0 {
                    SIGNAL_IPI_SENT_OK[idx].fetch_add(1, Ordering::AcqRel);
                }
            }
        }
    }

    true
}

/// Spin-wait hook: hints the pipeline and services this core's inbound queue.
///
/// Every busy loop that can be entered while broadcasts are in flight must
/// call this, or a synchronous sender on another core may wait on us
/// indefinitely.
#[inline]
pub fn wait_check() {
    crate::arch::riscv::pause_hint();
    if smp_active() {
        let _ = crate::bus::drain_pending(cpu_current_id());
    }
}

/// Parks the calling core until the next interrupt.
#[inline]
pub fn halt() {
    crate::arch::riscv::wait_for_interrupt();
}

/// Services a supervisor software interrupt for `cpu`.
///
/// The pending bit must already be acknowledged by the trap path; this
/// only records evidence and drains the fabric queue.
#[inline]
pub fn handle_ssoft_fabric(cpu: CpuId) -> SoftIrqOutcome {
    record_ssoft_trap(cpu);
    if crate::bus::drain_pending(cpu) {
        let idx = cpu.as_index();
        if idx < MAX_CPUS {
            SSOFT_DRAINED[idx].fetch_add(1, Ordering::AcqRel);
        }
        SoftIrqOutcome::Drained
    } else {
        SoftIrqOutcome::Idle
    }
}

#[inline]
pub fn record_ssoft_trap(cpu: CpuId) {
    let idx = cpu.as_index();
    if idx >= MAX_CPUS {
        return;
    }
    SSOFT_TRAPS[idx].fetch_add(1, Ordering::AcqRel);
}

#[inline]
pub fn signal_evidence(cpu: CpuId) -> SignalEvidence {
    let idx = cpu.as_index();
    if idx >= MAX_CPUS {
        return SignalEvidence::default();
    }
    SignalEvidence {
        signal_requested_count: SIGNAL_REQUESTED[idx].load(Ordering::Acquire),
        ipi_send_ok_count: SIGNAL_IPI_SENT_OK[idx].load(Ordering::Acquire),
        ssoft_trap_count: SSOFT_TRAPS[idx].load(Ordering::Acquire),
        ssoft_drained_count: SSOFT_DRAINED[idx].load(Ordering::Acquire),
    }
}

pub fn selftest_force_ipi_send_failure(enable: bool) {
    SELFTEST_FORCE_IPI_SEND_FAIL.store(enable as usize, Ordering::Release);
}

pub fn reset_selftest_counters() {
    for counter in &SIGNAL_REQUESTED {
        counter.store(0, Ordering::Release);
    }
    for counter in &SIGNAL_IPI_SENT_OK {
        counter.store(0, Ordering::Release);
    }
    for counter in &SSOFT_TRAPS {
        counter.store(0, Ordering::Release);
    }
    for counter in &SSOFT_DRAINED {
        counter.store(0, Ordering::Release);
    }
    SELFTEST_FORCE_IPI_SEND_FAIL.store(0, Ordering::Release);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_sync::TEST_LOCK;

    #[test]
    fn test_reject_invalid_signal_target_cpu() {
        let _guard = TEST_LOCK.lock();
        reset_selftest_counters();
        set_online_mask_for_test(1usize << CpuId::BOOT.as_index());

        let invalid = CpuId::from_raw(MAX_CPUS as u16);
        assert!(!signal_core(invalid));
        assert_eq!(signal_evidence(CpuId::BOOT).signal_requested_count, 0);
    }

    #[test]
    fn test_reject_offline_cpu_signal() {
        let _guard = TEST_LOCK.lock();
        reset_selftest_counters();
        set_online_mask_for_test(1usize << CpuId::BOOT.as_index());

        let offline = CpuId::from_raw(1);
        assert!(!signal_core(offline));
        assert_eq!(signal_evidence(offline).signal_requested_count, 0);
    }

    #[test]
    fn test_signal_records_request_for_online_target() {
        let _guard = TEST_LOCK.lock();
        reset_selftest_counters();
        let target = CpuId::from_raw(1);
        set_online_mask_for_test(
            (1usize << CpuId::BOOT.as_index()) | (1usize << target.as_index()),
        );

        assert!(signal_core(target));
        assert_eq!(signal_evidence(target).signal_requested_count, 1);
    }

    #[test]
    fn test_ssoft_on_empty_queue_reports_idle() {
        let _guard = TEST_LOCK.lock();
        reset_selftest_counters();
        let cpu = CpuId::from_raw(1);
        set_online_mask_for_test(0b11);

        assert_eq!(handle_ssoft_fabric(cpu), SoftIrqOutcome::Idle);
        let evidence = signal_evidence(cpu);
        assert_eq!(evidence.ssoft_trap_count, 1);
        assert_eq!(evidence.ssoft_drained_count, 0);
    }

    #[test]
    fn test_expected_online_mask_includes_boot() {
        let _guard = TEST_LOCK.lock();
        // Host builds start no harts; the boot bit alone is expected.
        assert_eq!(start_secondary_harts(), 1usize << CpuId::BOOT.as_index());
    }

    #[test]
    fn test_smp_active_tracks_online_mask() {
        let _guard = TEST_LOCK.lock();
        set_online_mask_for_test(0b1);
        assert!(!smp_active());
        set_online_mask_for_test(0b11);
        assert!(smp_active());
        set_online_mask_for_test(0b1);
    }

    #[test]
    fn test_cpu_identity_override_is_thread_local() {
        let _guard = TEST_LOCK.lock();
        set_current_cpu_for_test(CpuId::from_raw(2));
        assert_eq!(cpu_current_id(), CpuId::from_raw(2));
        set_current_cpu_for_test(CpuId::BOOT);
        assert_eq!(cpu_current_id(), CpuId::BOOT);
    }

    #[test]
    fn test_reject_tp_hint_for_offline_cpu() {
        let _guard = TEST_LOCK.lock();
        let online_mask = 1usize << CpuId::BOOT.as_index();
        assert_eq!(cpu_from_tp_hint_raw(1, online_mask), None);
    }

    #[test]
    fn test_cpu_id_resolution_prefers_stack_on_tp_mismatch() {
        let tp_hint = Some(CpuId::BOOT);
        let stack_cpu = Some(CpuId::from_raw(1));
        assert_eq!(resolve_cpu_id(tp_hint, stack_cpu), CpuId::from_raw(1));
    }

    #[test]
    fn test_cpu_id_resolution_uses_boot_when_only_tp_non_boot_exists() {
        let tp_hint = Some(CpuId::from_raw(1));
        let stack_cpu = None;
        assert_eq!(resolve_cpu_id(tp_hint, stack_cpu), CpuId::BOOT);
    }
}

// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Early boot path for the AXON fabric kernel
//! OWNERS: @kernel-boot-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: No tests (boot path proven via QEMU marker contract)
//! PUBLIC API: early_boot_init()
//! DEPENDS_ON: arch::riscv::clear_bss, trap::install_trap_vector, init_heap
//! INVARIANTS: Single-invocation; interrupts masked; minimal diagnostics on OS path
//! ADR: docs/rfcs/RFC-0024-kernel-ipi-message-fabric.md

#[cfg(not(test))]
extern "C" {
    static mut __bss_start: u8;
    static mut __bss_end: u8;
}

// The boot hart enters here from OpenSBI. Secondary harts take the
// `smp::__secondary_hart_start` trampoline instead and never run this path.
#[cfg(all(target_arch = "riscv64", target_os = "none"))]
core::arch::global_asm!(
    r#"
    .section .text._start, "ax", @progbits
    .globl _start
    .align 4
_start:
    la   sp, __stack_top
    /* RISC-V ABI: initialize gp for small-data accesses (Rust may rely on it).
     * Use PC-relative addressing (kernel is linked above 2GiB). */
    .option push
    .option norelax
    la   gp, __global_pointer$
    .option pop
    j    start_rust
"#
);

/// Rust landing pad for the boot hart.
#[cfg(all(target_arch = "riscv64", target_os = "none"))]
#[no_mangle]
pub extern "C" fn start_rust() -> ! {
    early_boot_init();
    crate::kmain::kmain()
}

/// Perform the machine initialisation required before the kernel can run.
///
/// # Safety
///
/// This must only be invoked once on the boot CPU before any Rust code that
/// relies on initialised memory or traps executes. Callers must ensure the
/// stack is valid and interrupts are masked until setup completes.
pub fn early_boot_init() {
    // SAFETY: called once during early boot, before interrupts/threads.
    unsafe {
        zero_bss();
    }
    // Stage-policy: no heavy diagnostics in early boot on OS path.
    log_info!(target: "boot", "boot: ok");

    // SAFETY: privileged context, trap vector install once.
    unsafe {
        crate::trap::install_trap_vector();
        // Arm first tick only when timer IRQs are enabled; default bring-up runs without timer
        // preemption to simplify early sequencing.
        #[cfg(feature = "timer_irq")]
        crate::trap::timer_arm(crate::trap::DEFAULT_TICK_CYCLES);
    }
    log_info!(target: "boot", "traps: ok");

    log_debug!(target: "boot", "A: before heap init");
    crate::init_heap();
    log_debug!(target: "boot", "B: after heap init");
    log_info!(target: "boot", "boot: handing off to kmain");
}

unsafe fn zero_bss() {
    #[cfg(not(test))]
    {
        crate::arch::riscv::clear_bss(
            core::ptr::addr_of_mut!(__bss_start),
            core::ptr::addr_of_mut!(__bss_end),
        );
    }
}

// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! RISC-V specific helpers used across the AXON kernel.
//!
//! The implementation follows the Sv39 privileged specification and is
//! written such that host builds can still exercise high level logic via
//! the lightweight `#[cfg(not(target_arch = "riscv64"))]` stubs.

/// Page granularity assumed by flush payloads.
pub const PAGE_SIZE: usize = 4096;

/// Ranges longer than this are flushed with one full `sfence.vma` instead
/// of a per-page loop.
const FULL_FLUSH_THRESHOLD_PAGES: usize = 64;

bitflags::bitflags! {
    /// S-mode interrupt bits shared by the `sie` and `sip` CSRs.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct SMode: usize {
        const SOFT = 1 << 1;
        const TIMER = 1 << 5;
        const EXTERNAL = 1 << 9;
    }
}

/// Clears the `.bss` region defined by the linker.
#[inline]
pub fn clear_bss(start: *mut u8, end: *mut u8) {
    #[cfg(target_arch = "riscv64")]
    unsafe {
        let mut ptr = start;
        while ptr < end {
            core::ptr::write_volatile(ptr, 0);
            ptr = ptr.add(1);
        }
    }
    #[cfg(not(target_arch = "riscv64"))]
    {
        let len = end as usize - start as usize;
        let slice = unsafe { core::slice::from_raw_parts_mut(start, len) };
        for byte in slice {
            *byte = 0;
        }
    }
}

/// Enables supervisor timer interrupts.
#[inline]
pub fn enable_timer_interrupts() {
    #[cfg(target_arch = "riscv64")]
    unsafe {
        core::arch::asm!(
            "csrs sie, {0}",
            in(reg) SMode::TIMER.bits(),
            options(nostack, preserves_flags)
        );
    }
}

/// Enables supervisor software interrupts (IPI delivery).
#[inline]
pub fn enable_software_interrupts() {
    #[cfg(target_arch = "riscv64")]
    unsafe {
        core::arch::asm!(
            "csrs sie, {0}",
            in(reg) SMode::SOFT.bits(),
            options(nostack, preserves_flags)
        );
    }
}

/// Acknowledges a pending supervisor software interrupt.
///
/// Must run before draining the fabric queue; a signal arriving after the
/// clear re-raises SSIP and re-enters the handler.
#[inline]
pub fn clear_soft_pending() {
    #[cfg(target_arch = "riscv64")]
    unsafe {
        core::arch::asm!(
            "csrc sip, {0}",
            in(reg) SMode::SOFT.bits(),
            options(nostack, preserves_flags)
        );
    }
}

/// Reads the timer CSR (nsec on virt is based on a 10 MHz counter).
#[inline]
pub fn read_time() -> u64 {
    #[cfg(target_arch = "riscv64")]
    unsafe {
        let value: u64;
        core::arch::asm!("csrr {0}, time", out(reg) value, options(nomem, nostack, preserves_flags));
        value
    }
    #[cfg(not(target_arch = "riscv64"))]
    {
        0
    }
}

/// Programs the CLINT timer compare register.
#[inline]
pub fn set_timer(deadline: u64) {
    #[cfg(target_arch = "riscv64")]
    unsafe {
        const CLINT_BASE: usize = 0x0200_0000;
        const MTIMECMP: *mut u64 = (CLINT_BASE + 0x4000) as *mut u64;
        core::ptr::write_volatile(MTIMECMP, deadline);
    }
    #[cfg(not(target_arch = "riscv64"))]
    {
        let _ = deadline;
    }
}

/// Reads the current stack pointer.
#[inline]
pub fn read_sp() -> usize {
    #[cfg(target_arch = "riscv64")]
    unsafe {
        let sp: usize;
        core::arch::asm!("mv {0}, sp", out(reg) sp, options(nomem, nostack, preserves_flags));
        sp
    }
    #[cfg(not(target_arch = "riscv64"))]
    {
        let probe = 0u8;
        &probe as *const u8 as usize
    }
}

/// Issues a WFI instruction or yields on the host.
#[inline]
pub fn wait_for_interrupt() {
    #[cfg(target_arch = "riscv64")]
    unsafe {
        core::arch::asm!("wfi", options(nomem, nostack, preserves_flags));
    }
    #[cfg(not(target_arch = "riscv64"))]
    {
        core::hint::spin_loop();
    }
}

/// Spin-wait hint for busy loops.
#[inline]
pub fn pause_hint() {
    #[cfg(target_arch = "riscv64")]
    unsafe {
        // Zihintpause encoding; executes as `fence w, 0` (a no-op) on cores
        // without the extension.
        core::arch::asm!(".word 0x0100000f", options(nomem, nostack, preserves_flags));
    }
    #[cfg(not(target_arch = "riscv64"))]
    {
        core::hint::spin_loop();
    }
}

/// Invalidates local translation entries covering `pages` pages at `base`.
#[inline]
pub fn flush_address_range(base: usize, pages: usize) {
    if pages == 0 {
        return;
    }
    #[cfg(target_arch = "riscv64")]
    unsafe {
        if pages > FULL_FLUSH_THRESHOLD_PAGES {
            core::arch::asm!("sfence.vma", options(nostack, preserves_flags));
            return;
        }
        let mut addr = base;
        for _ in 0..pages {
            core::arch::asm!("sfence.vma {0}", in(reg) addr, options(nostack, preserves_flags));
            addr = addr.wrapping_add(PAGE_SIZE);
        }
    }
    #[cfg(not(target_arch = "riscv64"))]
    {
        let _ = (base, FULL_FLUSH_THRESHOLD_PAGES);
    }
}

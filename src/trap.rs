// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0
//! Trap handling: external ASM prologue/epilogue + safe Rust core,
//! fabric soft-interrupt dispatch, SBI timer handling.

#![allow(clippy::identity_op)]

#[cfg(test)]
extern crate alloc;

use core::fmt::{self, Write};
use spin::Mutex;

#[cfg(test)]
use alloc::string::String;

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
#[allow(unused_imports)]
use sbi_rt as sbi;

// ——— include low-level vector from assembly (OS target only) ———
#[cfg(all(target_arch = "riscv64", target_os = "none"))]
core::arch::global_asm!(
    include_str!("arch/riscv/trap.S"),
    TF_SIZE    = const core::mem::size_of::<TrapFrame>(),
    OFF_SEPC   = const 32*8,
    OFF_SSTATUS= const 33*8,
    OFF_SCAUSE = const 34*8,
    OFF_STVAL  = const 35*8,
);

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
extern "C" {
    fn __trap_vector();
}

// ——— diagnostics ———

static LAST_TRAP: Mutex<Option<TrapFrame>> = Mutex::new(None);
static TRAP_DIAG_COUNT: Mutex<usize> = Mutex::new(0);

// ——— minimal trap ring buffer (debug diagnostics) ———
const TRAP_RING_LEN: usize = 64;
static TRAP_RING: Mutex<[Option<TrapFrame>; TRAP_RING_LEN]> = Mutex::new([None; TRAP_RING_LEN]);
static TRAP_RING_IDX: Mutex<usize> = Mutex::new(0);

#[inline]
pub(crate) fn uart_write_hex(u: &mut crate::uart::RawUart, value: usize) {
    let nibbles = core::mem::size_of::<usize>() * 2;
    let lut = b"0123456789abcdef";
    let mut i = nibbles;
    while i > 0 {
        i -= 1;
        let shift = i * 4;
        let nib = ((value >> shift) & 0xF) as u8;
        let ch = lut[nib as usize] as char;
        let buf = [ch as u8];
        let s = unsafe { core::str::from_utf8_unchecked(&buf) };
        let _ = u.write_str(s);
    }
}

#[cfg_attr(not(all(target_arch = "riscv64", target_os = "none")), allow(dead_code))]
#[inline]
fn uart_print_exc(scause: usize, sepc: usize, stval: usize) {
    let mut u = crate::uart::raw_writer();
    let _ = u.write_str("EXC: scause=0x");
    uart_write_hex(&mut u, scause);
    let _ = u.write_str(" sepc=0x");
    uart_write_hex(&mut u, sepc);
    let _ = u.write_str(" stval=0x");
    uart_write_hex(&mut u, stval);
    let _ = u.write_str("\n");
}

const INTERRUPT_FLAG: usize = usize::MAX - (usize::MAX >> 1);

// ——— trap frame ———

/// Saved register state for an S-mode trap.
/// Must match `arch/riscv/trap.S` save/restore layout.
#[repr(C)]
#[derive(Clone, Copy, Default)]
pub struct TrapFrame {
    /// x0..x31 (x0 is always 0; we never write it).
    pub x: [usize; 32],
    pub sepc: usize,
    pub sstatus: usize,
    pub scause: usize,
    pub stval: usize,
}

pub fn record(frame: &TrapFrame) {
    *LAST_TRAP.lock() = Some(*frame);
    // Push into ring
    let mut idx = TRAP_RING_IDX.lock();
    let mut ring = TRAP_RING.lock();
    ring[*idx % TRAP_RING_LEN] = Some(*frame);
    *idx = (*idx + 1) % TRAP_RING_LEN;
}

pub fn last_trap() -> Option<TrapFrame> {
    *LAST_TRAP.lock()
}

#[inline]
pub fn is_interrupt(scause: usize) -> bool {
    scause & INTERRUPT_FLAG != 0
}

pub fn describe_cause(scause: usize) -> &'static str {
    let code = scause & (usize::MAX >> 1);
    if is_interrupt(scause) {
        match code {
            1 => "SupervisorSoftInt",
            5 => "SupervisorTimerInt",
            9 => "SupervisorExternalInt",
            _ => "Interrupt",
        }
    } else {
        match code {
            0 => "InstructionAddressMisaligned",
            1 => "InstructionAccessFault",
            2 => "IllegalInstruction",
            3 => "Breakpoint",
            4 => "LoadAddressMisaligned",
            5 => "LoadAccessFault",
            6 => "StoreAMOAddressMisaligned",
            7 => "StoreAMOAccessFault",
            8 => "EnvironmentCallFromUMode",
            9 => "EnvironmentCallFromSMode",
            12 => "InstructionPageFault",
            13 => "LoadPageFault",
            15 => "StoreAMOPageFault",
            _ => "Exception",
        }
    }
}

#[cfg_attr(not(all(target_arch = "riscv64", target_os = "none")), allow(dead_code))]
pub fn fmt_trap<W: Write>(frame: &TrapFrame, f: &mut W) -> fmt::Result {
    writeln!(f, " sepc=0x{:016x}", frame.sepc)?;
    writeln!(
        f,
        " scause=0x{:016x} ({})",
        frame.scause,
        describe_cause(frame.scause)
    )?;
    writeln!(f, " stval=0x{:016x}", frame.stval)?;
    writeln!(f, " a0..a7 = {:016x?}", &frame.x[10..=17])
}

// ——— SBI timer utilities ———

/// Default tick in cycles (10 ms for 10 MHz mtimer on QEMU virt).
#[cfg_attr(not(all(target_arch = "riscv64", target_os = "none")), allow(dead_code))]
pub const DEFAULT_TICK_CYCLES: u64 = 100_000;

/// Arm S-mode timer via SBI for `now + delta_cycles`.
#[inline]
#[allow(dead_code)]
#[cfg(all(target_arch = "riscv64", target_os = "none", feature = "timer_irq"))]
pub fn timer_arm(delta_cycles: u64) {
    let now = riscv::register::time::read() as u64;
    sbi::set_timer(now.wrapping_add(delta_cycles));
}

#[allow(dead_code)]
#[cfg(not(all(target_arch = "riscv64", target_os = "none", feature = "timer_irq")))]
pub fn timer_arm(_delta_cycles: u64) {}

/// Install trap vector; call once during early boot (before enabling SIE).
#[cfg(all(target_arch = "riscv64", target_os = "none"))]
pub unsafe fn install_trap_vector() {
    // SAFETY: must be called early and exactly once per hart; SSCRATCH becomes well-defined.
    unsafe {
        riscv::register::sscratch::write(0);
        riscv::register::stvec::write(
            __trap_vector as usize,
            riscv::register::mtvec::TrapMode::Direct,
        );
    }
}

#[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
pub unsafe fn install_trap_vector() {}

/// Enable supervisor software interrupts so fabric signals deliver as traps.
///
/// Polling via `smp::wait_check` keeps the fabric live even without this,
/// but a parked core then only drains on its next poll.
#[cfg(all(target_arch = "riscv64", target_os = "none"))]
pub unsafe fn enable_fabric_interrupts() {
    crate::arch::riscv::enable_software_interrupts();
    // SAFETY: requires the trap vector installed on this hart.
    unsafe {
        riscv::register::sstatus::set_sie();
    }
}

#[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
pub unsafe fn enable_fabric_interrupts() {}

/// Enable supervisor timer interrupts after arming the first timer.
/// Gated behind `timer_irq` feature to avoid dead_code in default builds.
#[allow(dead_code)]
#[cfg(all(target_arch = "riscv64", target_os = "none", feature = "timer_irq"))]
pub unsafe fn enable_timer_interrupts() {
    use riscv::register::{sie, sstatus};
    // SAFETY: requires trap vector installed and first timer armed.
    unsafe {
        sie::set_stimer();
        sstatus::set_sie();
    }
}

/// Disable supervisor timer interrupts.
/// Gated behind `timer_irq` feature to avoid dead_code in default builds.
#[cfg_attr(not(test), inline)]
#[allow(dead_code)]
#[cfg(all(target_arch = "riscv64", target_os = "none", feature = "timer_irq"))]
pub unsafe fn disable_timer_interrupts() {
    use riscv::register::{sie, sstatus};
    // SAFETY: caller must ensure trap vector is installed and interrupts are masked appropriately elsewhere when needed.
    unsafe {
        sstatus::clear_sie();
        sie::clear_stimer();
    }
}

// ——— Rust trap handler called from assembly ———

#[no_mangle]
extern "C" fn __trap_rust(frame: &mut TrapFrame) {
    // Liveness heartbeat on every trap entry
    crate::liveness::bump();
    if is_interrupt(frame.scause) {
        const S_SOFT_INT: usize = 1;
        const S_TIMER_INT: usize = 5;
        let code = frame.scause & (usize::MAX >> 1);
        if code == S_SOFT_INT {
            // Ack before draining; a signal landing after the clear
            // re-raises SSIP instead of being lost.
            crate::arch::riscv::clear_soft_pending();
            let cpu = crate::smp::cpu_current_id();
            if crate::smp::handle_ssoft_fabric(cpu) == crate::smp::SoftIrqOutcome::Idle {
                log_trace!(target: "trap", "spurious SSIP on cpu{}", cpu.as_index());
            }
            return;
        }
        if code == S_TIMER_INT {
            #[cfg(all(target_arch = "riscv64", target_os = "none", feature = "timer_irq"))]
            {
                let next = riscv::register::time::read() as u64 + DEFAULT_TICK_CYCLES;
                sbi::set_timer(next);
            }
        }
        return;
    }

    // Exception path: the kernel has no recoverable faults, so emit
    // bounded diagnostics and die loudly.
    {
        let mut count = TRAP_DIAG_COUNT.lock();
        if *count < 8 {
            use core::fmt::Write as _;
            let mut u = crate::uart::raw_writer();
            let _ = write!(
                u,
                "EXC: scause=0x{:x} sepc=0x{:x}\n",
                frame.scause as u64, frame.sepc as u64
            );
            #[cfg(all(target_arch = "riscv64", target_os = "none"))]
            {
                let stval_now = riscv::register::stval::read();
                let _ = write!(u, "EXC: stval=0x{:x}\n", stval_now as u64);
            }
            *count += 1;
        }
    }

    #[cfg(all(target_arch = "riscv64", target_os = "none"))]
    {
        let stval_now = riscv::register::stval::read();
        uart_print_exc(frame.scause, frame.sepc, stval_now);
        if stval_now < 0x1000 {
            record(frame);
            panic!(
                "NULL-DEREF: sepc=0x{:x} stval=0x{:x}",
                frame.sepc, stval_now
            );
        }
    }
    record(frame);
    panic!("EXC: scause=0x{:x} sepc=0x{:x}", frame.scause, frame.sepc);
}

// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Hardware abstraction layer traits.

pub mod virt;

/// Abstraction for a monotonic timer.
pub trait Timer {
    /// Returns the current time in nanoseconds.
    fn now(&self) -> u64;
    /// Programs the next wake-up time in nanoseconds.
    fn set_wakeup(&self, deadline: u64);
}

/// UART abstraction used for kernel logging.
#[allow(dead_code)]
pub trait Uart {
    /// Writes a single byte to the UART.
    fn write_byte(&self, byte: u8);
}

/// Interrupt controller primitive.
#[allow(dead_code)]
pub trait IrqCtl {
    /// Enables the interrupt line.
    fn enable(&self, irq: usize);
    /// Disables the interrupt line.
    fn disable(&self, irq: usize);
}

/// TLB management operations.
#[allow(dead_code)]
pub trait Tlb {
    /// Flushes the entire translation cache.
    fn flush_all(&self);
    /// Invalidates `pages` pages of translations starting at `base`.
    fn flush_range(&self, base: usize, pages: usize);
}

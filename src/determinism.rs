// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Deterministic boot knobs shared across the kernel
//! OWNERS: @kernel-team
//! PUBLIC API: seed(), set_seed(), fixed_tick_ns(), set_fixed_tick_ns(), spin_budget(), set_spin_budget()
//! DEPENDS_ON: core::sync::atomic
//! INVARIANTS: Relaxed atomics sufficient; default values stable across boots
//! ADR: docs/adr/0001-runtime-roles-and-boundaries.md
//!
//! The AXON bring-up environment runs both on the host and inside QEMU.
//! For reproducibility the kernel exposes a deterministic seed, a fixed
//! timer quantum and a bounded spin budget that higher level code
//! (including selftests) can consume.

use core::sync::atomic::{AtomicU64, Ordering};

#[cfg_attr(not(test), allow(dead_code))]
const DEFAULT_SEED: u64 = 0x61786f6e; // ASCII "axon"
const DEFAULT_TICK_NS: u64 = 1_000_000; // 1 ms slice
const DEFAULT_SPIN_BUDGET: u64 = 1_000_000; // bring-up wait iterations

#[cfg_attr(not(test), allow(dead_code))]
static SEED: AtomicU64 = AtomicU64::new(DEFAULT_SEED);
static FIXED_TICK_NS: AtomicU64 = AtomicU64::new(DEFAULT_TICK_NS);
static SPIN_BUDGET: AtomicU64 = AtomicU64::new(DEFAULT_SPIN_BUDGET);

/// Returns the deterministic seed for pseudo random number generators.
#[cfg_attr(not(test), allow(dead_code))]
#[inline]
pub fn seed() -> u64 {
    SEED.load(Ordering::Relaxed)
}

/// Overrides the deterministic seed.
///
/// This is primarily used by unit tests to exercise different execution
/// paths while still allowing reproducible runs.
#[cfg_attr(not(test), allow(dead_code))]
#[inline]
pub fn set_seed(value: u64) {
    SEED.store(value, Ordering::Relaxed);
}

/// Returns the fixed timer quantum used for deterministic tick delivery.
#[inline]
pub fn fixed_tick_ns() -> u64 {
    FIXED_TICK_NS.load(Ordering::Relaxed)
}

/// Overrides the fixed timer quantum in nanoseconds.
#[cfg_attr(not(test), allow(dead_code))]
#[inline]
pub fn set_fixed_tick_ns(value: u64) {
    FIXED_TICK_NS.store(value, Ordering::Relaxed);
}

/// Returns the iteration budget for bounded bring-up and selftest waits.
///
/// Broadcast completion itself never consults this; only diagnostics and
/// secondary bring-up use bounded waits.
#[inline]
pub fn spin_budget() -> u64 {
    SPIN_BUDGET.load(Ordering::Relaxed)
}

/// Overrides the bounded-wait iteration budget.
#[cfg_attr(not(test), allow(dead_code))]
#[inline]
pub fn set_spin_budget(value: u64) {
    SPIN_BUDGET.store(value, Ordering::Relaxed);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seed_roundtrip() {
        set_seed(42);
        assert_eq!(seed(), 42);
    }

    #[test]
    fn tick_roundtrip() {
        set_fixed_tick_ns(1234);
        assert_eq!(fixed_tick_ns(), 1234);
    }

    #[test]
    fn spin_budget_roundtrip() {
        set_spin_budget(77);
        assert_eq!(spin_budget(), 77);
    }
}

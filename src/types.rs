// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Minimal newtypes shared across the message fabric (debug-friendly, low overhead)
//! OWNERS: @kernel-team
//! PUBLIC API: HartId, CpuId, CoreSet, AsHandle, PageCount
//! DEPENDS_ON: smp::MAX_CPUS (CoreSet bounds)
//! INVARIANTS: Prevent type confusion between hardware harts, logical CPUs and target sets
//! ADR: docs/adr/0001-runtime-roles-and-boundaries.md
//!
//! ## Newtype Rationale (TASK-0031)
//!
//! Rust newtypes provide **zero-cost type safety** at compile time:
//! - Prevent accidental mixing of hart IDs, CPU indices and raw bitmasks
//! - Make ownership explicit (who can create/destroy these handles?)
//! - Keep target-set arithmetic in one audited place (`CoreSet`)

use core::fmt;
use core::num::NonZeroU32;

/// Hardware hart identifier as reported by RISC-V (`mhartid`).
///
/// We keep this distinct from fabric-facing CPU IDs so call-sites cannot
/// accidentally mix hardware identity with logical message routing.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct HartId(u16);

impl HartId {
    #[inline]
    pub const fn from_raw(raw: u16) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn as_raw(self) -> u16 {
        self.0
    }

    #[inline]
    pub const fn as_index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for HartId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_raw())
    }
}

/// Logical CPU identifier used by the message fabric and per-CPU kernel state.
///
/// Currently a 1:1 mapping from `HartId`, but remains a dedicated type to keep
/// future topology/affinity changes explicit.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct CpuId(u16);

impl CpuId {
    pub const BOOT: Self = Self(0);

    #[inline]
    pub const fn from_raw(raw: u16) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn from_hart(hart: HartId) -> Self {
        Self(hart.as_raw())
    }

    #[inline]
    pub const fn as_raw(self) -> u16 {
        self.0
    }

    #[inline]
    pub const fn as_index(self) -> usize {
        self.0 as usize
    }

    #[inline]
    pub const fn is_boot(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for CpuId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_raw())
    }
}

/// Set of target CPUs for a broadcast, backed by a bitmask.
///
/// **Ownership**: Callers build sets from `smp::cpu_online_mask()` or
/// explicit IDs; the fabric only reads them.
/// **Invariant**: Bits at or above `smp::MAX_CPUS` are never set by the
/// constructors below.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct CoreSet(usize);

impl CoreSet {
    pub const EMPTY: Self = Self(0);

    /// Creates a set from a raw online-mask style bitmask.
    #[inline]
    pub const fn from_mask(mask: usize) -> Self {
        Self(mask)
    }

    /// Creates a set containing exactly one CPU.
    #[inline]
    pub const fn single(cpu: CpuId) -> Self {
        Self(1usize << cpu.as_index())
    }

    /// Returns the raw bitmask.
    #[inline]
    pub const fn as_mask(self) -> usize {
        self.0
    }

    #[inline]
    pub const fn contains(self, cpu: CpuId) -> bool {
        self.0 & (1usize << cpu.as_index()) != 0
    }

    #[inline]
    #[must_use]
    pub const fn insert(self, cpu: CpuId) -> Self {
        Self(self.0 | (1usize << cpu.as_index()))
    }

    #[inline]
    #[must_use]
    pub const fn remove(self, cpu: CpuId) -> Self {
        Self(self.0 & !(1usize << cpu.as_index()))
    }

    /// Number of CPUs in the set.
    #[inline]
    pub const fn count(self) -> u32 {
        self.0.count_ones()
    }

    #[inline]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Iterates member CPUs in ascending ID order.
    #[inline]
    pub fn iter(self) -> CoreSetIter {
        CoreSetIter { rest: self.0 }
    }
}

impl fmt::Display for CoreSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Iterator over the members of a `CoreSet`, lowest CPU ID first.
#[derive(Copy, Clone, Debug)]
pub struct CoreSetIter {
    rest: usize,
}

impl Iterator for CoreSetIter {
    type Item = CpuId;

    #[inline]
    fn next(&mut self) -> Option<CpuId> {
        if self.rest == 0 {
            return None;
        }
        let idx = self.rest.trailing_zeros() as u16;
        self.rest &= self.rest - 1;
        Some(CpuId::from_raw(idx))
    }
}

impl IntoIterator for CoreSet {
    type Item = CpuId;
    type IntoIter = CoreSetIter;

    #[inline]
    fn into_iter(self) -> CoreSetIter {
        self.iter()
    }
}

/// Handle referencing a tracked address space.
///
/// The fabric carries this opaquely in flush payloads; only the owning
/// address-space manager interprets it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct AsHandle(NonZeroU32);

impl AsHandle {
    /// Constructs a handle from a raw value.
    #[inline]
    pub const fn from_raw(raw: u32) -> Option<Self> {
        match NonZeroU32::new(raw) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }

    /// Returns the raw representation of the handle.
    #[inline]
    pub const fn to_raw(self) -> u32 {
        self.0.get()
    }
}

impl fmt::Display for AsHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_raw())
    }
}

/// Length of a flush request in whole pages.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct PageCount(usize);

impl PageCount {
    #[inline]
    pub const fn from_raw(raw: usize) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn as_raw(self) -> usize {
        self.0
    }

    #[inline]
    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// Byte length of the covered range, `None` on overflow.
    #[inline]
    pub const fn checked_bytes(self) -> Option<usize> {
        self.0.checked_mul(crate::arch::riscv::PAGE_SIZE)
    }
}

impl fmt::Display for PageCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_raw())
    }
}

// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0
//
//! CONTEXT: Low-noise, bounded fabric trace ring for bring-up triage
//! OWNERS: @kernel-team
//! STATUS: Experimental (debug feature only)
//! API_STABILITY: Unstable
//! TEST_COVERAGE: No tests
//!
//! This module is intentionally tiny:
//! - Records a fixed number of fabric events in-memory (no heap).
//! - Emits no UART output unless explicitly dumped.

use core::sync::atomic::{AtomicUsize, Ordering};

use super::DeliveryMode;
use crate::types::{CoreSet, CpuId};

#[derive(Clone, Copy)]
#[repr(C)]
pub struct TraceEvent {
    /// Monotonic sequence number (wraps).
    pub seq: u32,
    /// Event kind.
    pub kind: u8,
    /// Delivery mode (0=sync, 1=async) for broadcast events, else 0.
    pub mode: u8,
    /// Acting CPU.
    pub cpu: u16,
    /// Target mask for broadcast events, else 0.
    pub mask: u32,
    /// Targets signaled / entries drained in the batch.
    pub count: u16,
    /// Reserved.
    pub _rsv: u16,
    /// Optional extra.
    pub extra: u32,
}

impl TraceEvent {
    pub const fn empty() -> Self {
        Self {
            seq: 0,
            kind: 0,
            mode: 0,
            cpu: 0,
            mask: 0,
            count: 0,
            _rsv: 0,
            extra: 0,
        }
    }
}

const KIND_BROADCAST: u8 = 1;
const KIND_DRAIN: u8 = 2;
const KIND_RELEASE: u8 = 3;
const KIND_EXHAUST: u8 = 4;

// Power-of-two ring size for cheap masking.
// Fabric traffic is far sparser than IPC, so a small ring still spans
// "bring-up -> failure" without overwriting; DUMP_COUNT bounds the output.
const RING_SIZE: usize = 2048;
const RING_MASK: usize = RING_SIZE - 1;
const DUMP_COUNT: usize = 256;

static WRITE_SEQ: AtomicUsize = AtomicUsize::new(0);
static mut RING: [TraceEvent; RING_SIZE] = [TraceEvent::empty(); RING_SIZE];

// One-shot dump trigger for pool-exhaustion triage. The first dump is
// usually enough to see who is holding records; repeated dumps drown the
// UART and perturb timing-sensitive bring-up tests.
static EXHAUST_DUMPED: AtomicUsize = AtomicUsize::new(0);

pub fn maybe_dump_exhausted(tag: &str) {
    if EXHAUST_DUMPED.swap(1, Ordering::Relaxed) == 0 {
        dump_uart(tag);
    }
}

#[inline]
fn mode_code(mode: DeliveryMode) -> u8 {
    match mode {
        DeliveryMode::Synchronous => 0,
        DeliveryMode::Asynchronous => 1,
    }
}

#[inline]
fn push(mut ev: TraceEvent) {
    let seq = WRITE_SEQ.fetch_add(1, Ordering::Relaxed);
    ev.seq = seq as u32;
    let idx = seq & RING_MASK;
    unsafe {
        RING[idx] = ev;
    }
}

pub fn record_broadcast(cpu: CpuId, targets: CoreSet, mode: DeliveryMode) {
    push(TraceEvent {
        kind: KIND_BROADCAST,
        mode: mode_code(mode),
        cpu: cpu.as_raw(),
        mask: targets.as_mask() as u32,
        count: targets.count() as u16,
        ..TraceEvent::empty()
    });
}

pub fn record_drain(cpu: CpuId, batch: usize) {
    push(TraceEvent {
        kind: KIND_DRAIN,
        cpu: cpu.as_raw(),
        count: batch.min(u16::MAX as usize) as u16,
        ..TraceEvent::empty()
    });
}

pub fn record_release(cpu: CpuId) {
    push(TraceEvent {
        kind: KIND_RELEASE,
        cpu: cpu.as_raw(),
        ..TraceEvent::empty()
    });
}

pub fn record_exhaustion(cpu: CpuId) {
    push(TraceEvent {
        kind: KIND_EXHAUST,
        cpu: cpu.as_raw(),
        ..TraceEvent::empty()
    });
}

pub fn dump_uart(tag: &str) {
    use core::fmt::Write as _;
    let mut u = crate::uart::raw_writer();
    let _ = writeln!(u, "BUS-TRACE dump tag={}", tag);
    let end = WRITE_SEQ.load(Ordering::Relaxed);
    let start = end.saturating_sub(DUMP_COUNT);
    for seq in start..end {
        let idx = seq & RING_MASK;
        let ev = unsafe { RING[idx] };
        if ev.seq != seq as u32 {
            continue;
        }
        let kind = match ev.kind {
            KIND_BROADCAST => "bcast",
            KIND_DRAIN => "drain",
            KIND_RELEASE => "free",
            KIND_EXHAUST => "exhaust",
            _ => "unk",
        };
        let _ = writeln!(
            u,
            "BUS-TRACE {} seq=0x{:x} cpu={} mode={} mask=0x{:x} n=0x{:x} x=0x{:x}",
            kind, ev.seq, ev.cpu, ev.mode, ev.mask, ev.count, ev.extra
        );
    }
}

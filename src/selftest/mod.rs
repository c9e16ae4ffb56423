// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! In-kernel selftest harness executed during deterministic boot.

use core::sync::atomic::{AtomicUsize, Ordering};

use crate::{
    bus::{self, BroadcastOutcome, DeliveryMode},
    determinism,
    hal::{virt::VirtMachine, IrqCtl, Timer as _, Tlb, Uart},
    smp,
    types::{AsHandle, CoreSet, CpuId, PageCount},
    uart,
};

pub mod assert;

static INVOKE_RUNS: AtomicUsize = AtomicUsize::new(0);

const FLUSH_SPACE: AsHandle = match AsHandle::from_raw(1) {
    Some(space) => space,
    None => panic!("flush space handle must be nonzero"),
};

fn count_invoke() {
    INVOKE_RUNS.fetch_add(1, Ordering::SeqCst);
}

/// Borrowed references to kernel subsystems used by selftests.
pub struct Context<'a> {
    pub hal: &'a VirtMachine,
}

/// Entrypoint invoked by the kernel after core initialisation completes.
pub fn entry(ctx: &mut Context<'_>) {
    uart::write_line("SELFTEST: begin");
    test_time(ctx);
    uart::write_line("SELFTEST: time ok");
    test_flush_fanout();
    uart::write_line("SELFTEST: flush ok");
    test_invoke_fanout();
    uart::write_line("SELFTEST: invoke ok");
    test_async_invoke();
    uart::write_line("SELFTEST: async ok");
    test_pool_reuse();
    uart::write_line("SELFTEST: pool ok");
    #[cfg(feature = "failpoints")]
    {
        test_polling_liveness();
        uart::write_line("SELFTEST: failpoint ok");
    }
    uart::write_line("SELFTEST: end");
}

fn test_time(ctx: &Context<'_>) {
    use crate::st_assert;

    uart::write_line("SELFTEST: time step0: acquire timer handle");
    let timer = ctx.hal.timer();
    let start = timer.now();
    uart::write_line("SELFTEST: time step1: read start time");
    st_assert!(start > 0, "timer must advance past zero");
    let second = timer.now();
    uart::write_line("SELFTEST: time step2: verify monotonic now() >= start");
    st_assert!(second >= start, "timer monotonic");
    let deadline = second + determinism::fixed_tick_ns();
    timer.set_wakeup(deadline);
    uart::write_line("SELFTEST: time step3: program wakeup");

    let uart = ctx.hal.uart();
    let _: &dyn crate::hal::Uart = uart;
    uart.write_byte(b'\0');
    uart::write_line("SELFTEST: time step4: uart byte and flush TLB");
    ctx.hal.tlb().flush_all();
    ctx.hal.tlb().flush_range(0x8000_0000, 4);
    uart::write_line("SELFTEST: time step5: disable/enable IRQ line 0");
    ctx.hal.irq().disable(0);
    ctx.hal.irq().enable(0);
    uart::write_line("SELFTEST: time step6: time test complete");
}

fn test_flush_fanout() {
    use crate::{st_assert, st_expect_eq};

    uart::write_line("SELFTEST: flush step0: reset fabric counters");
    bus::reset_selftest_counters();
    let online = CoreSet::from_mask(smp::cpu_online_mask());
    let remote_count = online.count() as usize - 1;

    uart::write_line("SELFTEST: flush step1: synchronous flush on every online core");
    let outcome = bus::flush_range_all(FLUSH_SPACE, 0x4000, PageCount::from_raw(8));
    st_assert!(matches!(outcome, BroadcastOutcome::Completed), "sync flush completes");

    uart::write_line("SELFTEST: flush step2: verify per-core evidence");
    let boot = bus::bus_evidence(CpuId::BOOT);
    st_expect_eq!(boot.broadcasts_sent, 1usize);
    st_expect_eq!(boot.inline_runs, 1usize);
    st_expect_eq!(boot.flushes_applied, 1usize);
    st_expect_eq!(boot.entries_queued, remote_count);
    st_expect_eq!(boot.releases, 1usize);
    for cpu in online.iter() {
        if cpu.is_boot() {
            continue;
        }
        let evidence = bus::bus_evidence(cpu);
        st_assert!(evidence.entries_drained == 1, "core {} drained exactly once", cpu.as_index());
        st_assert!(evidence.flushes_applied == 1, "core {} applied the flush", cpu.as_index());
    }

    uart::write_line("SELFTEST: flush step3: verify recorded flush and pool reuse");
    let last = bus::selftest_last_flush();
    st_assert!(last.is_some(), "flush recorded");
    if let Some(flush) = last {
        st_expect_eq!(flush.space.to_raw(), FLUSH_SPACE.to_raw());
        st_expect_eq!(flush.base, 0x4000usize);
        st_expect_eq!(flush.pages.as_raw(), 8usize);
    }
    st_expect_eq!(bus::selftest_pool_free_count(), bus::selftest_pool_capacity());
}

fn test_invoke_fanout() {
    use crate::{st_assert, st_expect_eq};

    uart::write_line("SELFTEST: invoke step0: reset fabric counters");
    bus::reset_selftest_counters();
    INVOKE_RUNS.store(0, Ordering::SeqCst);
    let online = CoreSet::from_mask(smp::cpu_online_mask());

    uart::write_line("SELFTEST: invoke step1: run a callable on every online core");
    let outcome = bus::invoke_all(count_invoke, DeliveryMode::Synchronous);
    st_assert!(matches!(outcome, BroadcastOutcome::Completed), "sync invoke completes");
    st_expect_eq!(INVOKE_RUNS.load(Ordering::SeqCst), online.count() as usize);

    uart::write_line("SELFTEST: invoke step2: per-core run evidence");
    for cpu in online.iter() {
        let evidence = bus::bus_evidence(cpu);
        st_assert!(evidence.invokes_run == 1, "core {} ran the callable once", cpu.as_index());
    }
    st_expect_eq!(bus::selftest_pool_free_count(), bus::selftest_pool_capacity());
}

fn test_async_invoke() {
    use crate::{st_assert, st_expect_eq};

    uart::write_line("SELFTEST: async step0: post an asynchronous invoke to the other cores");
    bus::reset_selftest_counters();
    INVOKE_RUNS.store(0, Ordering::SeqCst);
    let online = CoreSet::from_mask(smp::cpu_online_mask());
    let remote_count = online.count() as usize - 1;

    let outcome = bus::invoke_others(count_invoke, DeliveryMode::Asynchronous);
    if remote_count == 0 {
        st_assert!(matches!(outcome, BroadcastOutcome::Completed), "empty target set completes");
        uart::write_line("SELFTEST: async step1: single core online, nothing posted");
        return;
    }
    st_assert!(matches!(outcome, BroadcastOutcome::Posted), "async posts without waiting");

    uart::write_line("SELFTEST: async step1: wait for targets to finish on their own time");
    let budget = determinism::spin_budget();
    let mut spins: u64 = 0;
    while INVOKE_RUNS.load(Ordering::SeqCst) < remote_count
        || bus::selftest_pool_free_count() < bus::selftest_pool_capacity()
    {
        smp::wait_check();
        spins += 1;
        st_assert!(spins < budget, "async targets finish within the spin budget");
    }
    st_expect_eq!(INVOKE_RUNS.load(Ordering::SeqCst), remote_count);
    uart::write_line("SELFTEST: async step2: terminal decrement returned the record");
    st_expect_eq!(bus::selftest_pool_free_count(), bus::selftest_pool_capacity());
}

fn test_pool_reuse() {
    use crate::{st_assert, st_expect_eq};

    uart::write_line("SELFTEST: pool step0: recycle every record through self-flushes");
    let capacity = bus::selftest_pool_capacity();
    let me = smp::cpu_current_id();
    for _ in 0..capacity * 2 {
        let outcome = bus::flush_range(
            CoreSet::single(me),
            FLUSH_SPACE,
            0x8000,
            PageCount::from_raw(1),
            DeliveryMode::Synchronous,
        );
        st_assert!(matches!(outcome, BroadcastOutcome::Completed), "self flush completes inline");
        st_expect_eq!(bus::selftest_pool_free_count(), capacity);
    }
}

#[cfg(feature = "failpoints")]
fn test_polling_liveness() {
    use crate::{st_assert, st_expect_eq};

    uart::write_line("SELFTEST: failpoint step0: suppress the next fabric doorbell");
    let online = CoreSet::from_mask(smp::cpu_online_mask());
    let me = smp::cpu_current_id();
    let target = match online.iter().find(|cpu| *cpu != me) {
        Some(cpu) => cpu,
        None => {
            uart::write_line("SELFTEST: failpoint step0: single core online, skipping");
            return;
        }
    };
    bus::reset_selftest_counters();
    smp::reset_selftest_counters();
    INVOKE_RUNS.store(0, Ordering::SeqCst);
    let before = smp::signal_evidence(target);
    bus::failpoints::deny_signals(1);

    uart::write_line("SELFTEST: failpoint step1: synchronous invoke rides the poll path");
    let outcome = bus::invoke_on(target, count_invoke, DeliveryMode::Synchronous);
    st_assert!(matches!(outcome, BroadcastOutcome::Completed), "delivery survives a lost doorbell");
    st_expect_eq!(INVOKE_RUNS.load(Ordering::SeqCst), 1usize);

    uart::write_line("SELFTEST: failpoint step2: confirm no doorbell was sent");
    let after = smp::signal_evidence(target);
    st_expect_eq!(after.signal_requested_count, before.signal_requested_count);
    st_expect_eq!(after.ipi_send_ok_count, before.ipi_send_ok_count);
    bus::failpoints::reset();
}

// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: TASK-0031 inter-processor message fabric (broadcast, per-core drain, completion)
//! OWNERS: @kernel-team
//! STATUS: In Progress
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Host unit tests (threads as cores) + property suite + QEMU selftests
//! PUBLIC API: broadcast(), flush_range(), flush_range_all(), invoke_on(), invoke_all(), invoke_others(), drain_pending(), bus_evidence()
//! DEPENDS_ON: bus::pool (record ownership), bus::queue (inbound lists), smp::signal_core/wait_check, arch::riscv::flush_address_range
//! INVARIANTS: completion counts from |targets| to 0 and never underflows;
//!             a record is retired exactly once (synchronous sender or the
//!             terminal asynchronous decrement); self-targets run inline;
//!             synchronous waits service the caller's own queue
//! ADR: docs/rfcs/RFC-0024-kernel-ipi-message-fabric.md

pub(crate) mod pool;
pub(crate) mod queue;
mod tests_prop;

#[cfg(feature = "bus_trace_ring")]
pub mod trace;

#[cfg(not(feature = "bus_trace_ring"))]
mod trace {
    use crate::types::{CoreSet, CpuId};

    use super::DeliveryMode;

    #[inline]
    pub(super) fn record_broadcast(_cpu: CpuId, _targets: CoreSet, _mode: DeliveryMode) {}
    #[inline]
    pub(super) fn record_drain(_cpu: CpuId, _batch: usize) {}
    #[inline]
    pub(super) fn record_release(_cpu: CpuId) {}
}

use core::cell::UnsafeCell;
use core::mem::{self, MaybeUninit};
use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use crate::smp::MAX_CPUS;
use crate::types::{AsHandle, CoreSet, CpuId, PageCount};

/// Kind tag of an in-flight message, derived from the payload variant.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageKind {
    FlushRange,
    Invoke,
}

/// Whether the sender waits for completion.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeliveryMode {
    /// `broadcast` returns once every target has executed the payload.
    Synchronous,
    /// `broadcast` returns after signaling; completion is unobservable.
    Asynchronous,
}

/// Translation-range invalidation request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FlushRange {
    pub space: AsHandle,
    pub base: usize,
    pub pages: PageCount,
}

/// Inline storage capacity for broadcast callables, in pointer words.
pub const INVOKE_STORAGE_WORDS: usize = 8;

/// A callable captured inline in a message record.
///
/// The fabric never heap-allocates on the message path; captures larger or
/// more aligned than the inline buffer are rejected at compile time.
pub struct InlineInvoke {
    storage: MaybeUninit<[usize; INVOKE_STORAGE_WORDS]>,
    call: unsafe fn(*const ()),
    drop_fn: unsafe fn(*mut ()),
}

impl InlineInvoke {
    pub fn new<F>(callable: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        const {
            assert!(
                mem::size_of::<F>() <= mem::size_of::<[usize; INVOKE_STORAGE_WORDS]>(),
                "broadcast callable exceeds inline storage"
            );
            assert!(
                mem::align_of::<F>() <= mem::align_of::<[usize; INVOKE_STORAGE_WORDS]>(),
                "broadcast callable over-aligned for inline storage"
            );
        }
        let mut storage = MaybeUninit::uninit();
        // SAFETY: the const assertions bound size and alignment of F.
        unsafe {
            (storage.as_mut_ptr() as *mut F).write(callable);
        }
        Self {
            storage,
            call: Self::call_raw::<F>,
            drop_fn: Self::drop_raw::<F>,
        }
    }

    unsafe fn call_raw<F: Fn()>(raw: *const ()) {
        (*(raw as *const F))()
    }

    unsafe fn drop_raw<F>(raw: *mut ()) {
        core::ptr::drop_in_place(raw as *mut F);
    }

    /// Runs the captured callable.
    fn invoke(&self) {
        // SAFETY: storage holds a live F for the whole in-flight window.
        unsafe { (self.call)(self.storage.as_ptr() as *const ()) }
    }

    /// Drops the captured callable.
    ///
    /// # Safety
    /// Must run exactly once, after the last `invoke`.
    unsafe fn destruct(&mut self) {
        (self.drop_fn)(self.storage.as_mut_ptr() as *mut ());
    }
}

/// Work carried by a message. `None` marks an idle pooled record and is a
/// fatal error to dispatch or broadcast.
pub enum Payload {
    None,
    FlushRange(FlushRange),
    Invoke(InlineInvoke),
}

impl Payload {
    /// Kind tag derived from the variant so tag and storage cannot drift.
    pub fn kind(&self) -> Option<MessageKind> {
        match self {
            Payload::None => None,
            Payload::FlushRange(_) => Some(MessageKind::FlushRange),
            Payload::Invoke(_) => Some(MessageKind::Invoke),
        }
    }

    /// Runs the variant destructor and resets the payload to idle.
    ///
    /// # Safety
    /// Caller must own the payload exclusively (post-completion).
    unsafe fn destruct_in_place(&mut self) {
        if let Payload::Invoke(invoke) = self {
            invoke.destruct();
        }
        *self = Payload::None;
    }
}

struct MessageBody {
    mode: DeliveryMode,
    payload: Payload,
}

/// A pooled fabric message.
///
/// Life cycle: `Free -> InFlight(|targets|) -> ... -> InFlight(0) -> Free`.
/// While free, only `free_next` is meaningful; while in flight, `completion`
/// pins the record and `body` stays immutable until the final owner retires
/// it. One queue entry per possible target is embedded so queueing never
/// allocates.
pub(crate) struct Message {
    completion: AtomicU32,
    free_next: AtomicUsize,
    body: UnsafeCell<MessageBody>,
    entries: [queue::QueueEntry; MAX_CPUS],
}

// SAFETY: `body` is written only by the exclusive owner (the sender before
// publication, the retiring core after completion); everything else is
// atomic.
unsafe impl Sync for Message {}

impl Message {
    pub(crate) const fn idle(free_next: usize) -> Self {
        Self {
            completion: AtomicU32::new(0),
            free_next: AtomicUsize::new(free_next),
            body: UnsafeCell::new(MessageBody {
                mode: DeliveryMode::Asynchronous,
                payload: Payload::None,
            }),
            entries: [const { queue::QueueEntry::new() }; MAX_CPUS],
        }
    }

    pub(crate) fn completion_snapshot(&self) -> u32 {
        self.completion.load(Ordering::Acquire)
    }

    fn entry_for(&self, target: CpuId) -> &queue::QueueEntry {
        &self.entries[target.as_index()]
    }
}

static_assertions::const_assert!(mem::size_of::<Message>() <= 256);
static_assertions::assert_impl_all!(Message: Sync);

/// Result of posting a broadcast.
#[must_use = "broadcast outcomes must be handled"]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BroadcastOutcome {
    /// Every target has executed the payload (synchronous, or empty set).
    Completed,
    /// The flight is published; targets complete it on their own time.
    Posted,
}

/// Per-CPU fabric counters backing selftests and bring-up markers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BusEvidence {
    pub broadcasts_sent: usize,
    pub entries_queued: usize,
    pub inline_runs: usize,
    pub entries_drained: usize,
    pub flushes_applied: usize,
    pub invokes_run: usize,
    pub releases: usize,
}

static BROADCASTS_SENT: [AtomicUsize; MAX_CPUS] = [const { AtomicUsize::new(0) }; MAX_CPUS];
static ENTRIES_QUEUED: [AtomicUsize; MAX_CPUS] = [const { AtomicUsize::new(0) }; MAX_CPUS];
static INLINE_RUNS: [AtomicUsize; MAX_CPUS] = [const { AtomicUsize::new(0) }; MAX_CPUS];
static ENTRIES_DRAINED: [AtomicUsize; MAX_CPUS] = [const { AtomicUsize::new(0) }; MAX_CPUS];
static FLUSHES_APPLIED: [AtomicUsize; MAX_CPUS] = [const { AtomicUsize::new(0) }; MAX_CPUS];
static INVOKES_RUN: [AtomicUsize; MAX_CPUS] = [const { AtomicUsize::new(0) }; MAX_CPUS];
static RELEASES: [AtomicUsize; MAX_CPUS] = [const { AtomicUsize::new(0) }; MAX_CPUS];
static LAST_FLUSH_SPACE: AtomicUsize = AtomicUsize::new(0);
static LAST_FLUSH_BASE: AtomicUsize = AtomicUsize::new(0);
static LAST_FLUSH_PAGES: AtomicUsize = AtomicUsize::new(0);

#[inline]
fn record_counter(table: &[AtomicUsize; MAX_CPUS], cpu: CpuId) {
    let idx = cpu.as_index();
    if idx < MAX_CPUS {
        table[idx].fetch_add(1, Ordering::AcqRel);
    }
}

/// Broadcasts `payload` to `targets` and completes per `mode`.
///
/// An empty target set completes immediately without touching the pool. A
/// self-target executes inline during this call; remote targets are queued
/// and signaled. Targeting an offline core is a caller error.
pub fn broadcast(targets: CoreSet, payload: Payload, mode: DeliveryMode) -> BroadcastOutcome {
    if matches!(payload, Payload::None) {
        log_error!(target: "bus", "PANIC: broadcast of idle payload");
        panic!("bus: broadcast of idle payload");
    }
    let target_count = targets.count();
    if target_count == 0 {
        return BroadcastOutcome::Completed;
    }
    debug_assert!(target_count as usize <= MAX_CPUS);
    debug_assert!(
        targets.as_mask() & !crate::smp::cpu_online_mask() == 0,
        "broadcast to offline target"
    );

    let self_cpu = crate::smp::cpu_current_id();
    let msg = pool::MESSAGE_POOL.acquire();
    // SAFETY: acquire grants exclusive ownership; nothing references the
    // record until the pushes below publish it.
    unsafe {
        let body = &mut *msg.body.get();
        body.mode = mode;
        body.payload = payload;
    }
    msg.completion.store(target_count, Ordering::Release);

    record_counter(&BROADCASTS_SENT, self_cpu);
    trace::record_broadcast(self_cpu, targets, mode);

    for target in targets.iter() {
        if target == self_cpu {
            continue;
        }
        queue::push(target, msg.entry_for(target), msg);
        record_counter(&ENTRIES_QUEUED, self_cpu);
        signal_target(target);
    }

    if targets.contains(self_cpu) {
        // Self-targets run inline; queueing to our own list would only
        // delay the work until the next poll.
        dispatch(msg, self_cpu);
        record_counter(&INLINE_RUNS, self_cpu);
        complete_one(msg, self_cpu);
    }

    match mode {
        DeliveryMode::Synchronous => {
            wait_for_completion(msg, self_cpu);
            retire(msg, self_cpu);
            BroadcastOutcome::Completed
        }
        DeliveryMode::Asynchronous => BroadcastOutcome::Posted,
    }
}

/// Flushes a translation range on an explicit target set.
pub fn flush_range(
    targets: CoreSet,
    space: AsHandle,
    base: usize,
    pages: PageCount,
    mode: DeliveryMode,
) -> BroadcastOutcome {
    broadcast(
        targets,
        Payload::FlushRange(FlushRange { space, base, pages }),
        mode,
    )
}

/// Synchronously flushes a translation range on every online core, the
/// caller included (its flush runs inline).
pub fn flush_range_all(space: AsHandle, base: usize, pages: PageCount) -> BroadcastOutcome {
    let targets = CoreSet::from_mask(crate::smp::cpu_online_mask());
    flush_range(targets, space, base, pages, DeliveryMode::Synchronous)
}

/// Runs `callable` once on a single core; the caller itself is allowed.
pub fn invoke_on<F>(target: CpuId, callable: F, mode: DeliveryMode) -> BroadcastOutcome
where
    F: Fn() + Send + Sync + 'static,
{
    broadcast(
        CoreSet::single(target),
        Payload::Invoke(InlineInvoke::new(callable)),
        mode,
    )
}

/// Runs `callable` once on every online core, the caller included.
pub fn invoke_all<F>(callable: F, mode: DeliveryMode) -> BroadcastOutcome
where
    F: Fn() + Send + Sync + 'static,
{
    broadcast(
        CoreSet::from_mask(crate::smp::cpu_online_mask()),
        Payload::Invoke(InlineInvoke::new(callable)),
        mode,
    )
}

/// Runs `callable` once on every online core except the caller.
pub fn invoke_others<F>(callable: F, mode: DeliveryMode) -> BroadcastOutcome
where
    F: Fn() + Send + Sync + 'static,
{
    let targets =
        CoreSet::from_mask(crate::smp::cpu_online_mask()).remove(crate::smp::cpu_current_id());
    broadcast(targets, Payload::Invoke(InlineInvoke::new(callable)), mode)
}

/// Drains `cpu`'s inbound queue until it is observed empty.
///
/// Entries are processed in per-target submission order: dispatch first,
/// then the completion decrement; after its decrement an entry must not be
/// touched because the record may already be reused. Returns whether any
/// entry was processed.
pub fn drain_pending(cpu: CpuId) -> bool {
    let mut did_work = false;
    loop {
        let mut cursor = queue::take_all_reversed(cpu);
        if cursor.is_null() {
            break;
        }
        did_work = true;
        let mut batch = 0usize;
        while !cursor.is_null() {
            // SAFETY: the chain is detached; only this core walks it.
            let entry = unsafe { &*cursor };
            cursor = queue::next_of(entry);
            let msg = entry.message();
            dispatch(msg, cpu);
            record_counter(&ENTRIES_DRAINED, cpu);
            batch += 1;
            complete_one(msg, cpu);
        }
        trace::record_drain(cpu, batch);
    }
    if did_work {
        crate::liveness::bump();
    }
    did_work
}

fn signal_target(target: CpuId) {
    #[cfg(feature = "failpoints")]
    if failpoints::take_signal_denial() {
        log_debug!(
            target: "bus",
            "failpoint: suppressed signal to cpu{}",
            target.as_index()
        );
        return;
    }
    if !crate::smp::signal_core(target) {
        log_warn!(
            target: "bus",
            "signal to offline cpu{} dropped",
            target.as_index()
        );
    }
}

fn dispatch(msg: &'static Message, cpu: CpuId) {
    // SAFETY: in-flight bodies are immutable; concurrent dispatchers only
    // read.
    let body = unsafe { &*msg.body.get() };
    match &body.payload {
        Payload::FlushRange(flush) => {
            crate::arch::riscv::flush_address_range(flush.base, flush.pages.as_raw());
            record_counter(&FLUSHES_APPLIED, cpu);
            LAST_FLUSH_SPACE.store(flush.space.to_raw() as usize, Ordering::Release);
            LAST_FLUSH_BASE.store(flush.base, Ordering::Release);
            LAST_FLUSH_PAGES.store(flush.pages.as_raw(), Ordering::Release);
        }
        Payload::Invoke(invoke) => {
            invoke.invoke();
            record_counter(&INVOKES_RUN, cpu);
        }
        Payload::None => {
            log_error!(
                target: "bus",
                "PANIC: dispatch of idle payload on cpu{}",
                cpu.as_index()
            );
            panic!("bus: dispatch of idle payload");
        }
    }
}

/// Consumes one pending share of `msg`.
///
/// The terminal decrement of an asynchronous flight retires the record;
/// synchronous flights leave that to the waiting sender so its completion
/// poll can never observe a reused record.
fn complete_one(msg: &'static Message, cpu: CpuId) {
    // Read the mode while our pending share still pins the record.
    // SAFETY: see dispatch.
    let mode = unsafe { (*msg.body.get()).mode };
    let previous = msg.completion.fetch_sub(1, Ordering::AcqRel);
    if previous == 0 {
        log_error!(
            target: "bus",
            "PANIC: completion underflow on cpu{}",
            cpu.as_index()
        );
        panic!("bus: completion counter underflow");
    }
    if previous == 1 && matches!(mode, DeliveryMode::Asynchronous) {
        retire(msg, cpu);
    }
}

/// Spins until every target has completed `msg`.
///
/// Two cores broadcasting synchronously at each other must keep serving
/// their own queues while they wait or neither completes. The wait is
/// unbounded: target polling is a system liveness precondition.
fn wait_for_completion(msg: &'static Message, self_cpu: CpuId) {
    while msg.completion.load(Ordering::Acquire) != 0 {
        crate::arch::riscv::pause_hint();
        let _ = drain_pending(self_cpu);
    }
}

/// Destroys the payload and returns the record to the pool.
fn retire(msg: &'static Message, cpu: CpuId) {
    // SAFETY: reached only by the synchronous sender after observing zero
    // or by the terminal asynchronous decrement; either way we are the
    // last owner.
    unsafe {
        (*msg.body.get()).payload.destruct_in_place();
    }
    record_counter(&RELEASES, cpu);
    trace::record_release(cpu);
    pool::MESSAGE_POOL.release(msg);
}

#[inline]
pub fn bus_evidence(cpu: CpuId) -> BusEvidence {
    let idx = cpu.as_index();
    if idx >= MAX_CPUS {
        return BusEvidence::default();
    }
    BusEvidence {
        broadcasts_sent: BROADCASTS_SENT[idx].load(Ordering::Acquire),
        entries_queued: ENTRIES_QUEUED[idx].load(Ordering::Acquire),
        inline_runs: INLINE_RUNS[idx].load(Ordering::Acquire),
        entries_drained: ENTRIES_DRAINED[idx].load(Ordering::Acquire),
        flushes_applied: FLUSHES_APPLIED[idx].load(Ordering::Acquire),
        invokes_run: INVOKES_RUN[idx].load(Ordering::Acquire),
        releases: RELEASES[idx].load(Ordering::Acquire),
    }
}

/// Most recent flush dispatched anywhere, for selftest verification.
pub fn selftest_last_flush() -> Option<FlushRange> {
    let raw = LAST_FLUSH_SPACE.load(Ordering::Acquire) as u32;
    AsHandle::from_raw(raw).map(|space| FlushRange {
        space,
        base: LAST_FLUSH_BASE.load(Ordering::Acquire),
        pages: PageCount::from_raw(LAST_FLUSH_PAGES.load(Ordering::Acquire)),
    })
}

/// Free records currently in the pool; meaningful only while quiescent.
pub fn selftest_pool_free_count() -> usize {
    pool::MESSAGE_POOL.selftest_free_count()
}

/// Capacity of the record pool.
pub fn selftest_pool_capacity() -> usize {
    pool::MSG_POOL_CAPACITY
}

pub fn reset_selftest_counters() {
    for table in [
        &BROADCASTS_SENT,
        &ENTRIES_QUEUED,
        &INLINE_RUNS,
        &ENTRIES_DRAINED,
        &FLUSHES_APPLIED,
        &INVOKES_RUN,
        &RELEASES,
    ] {
        for counter in table.iter() {
            counter.store(0, Ordering::Release);
        }
    }
    LAST_FLUSH_SPACE.store(0, Ordering::Release);
    LAST_FLUSH_BASE.store(0, Ordering::Release);
    LAST_FLUSH_PAGES.store(0, Ordering::Release);
}

#[cfg(feature = "failpoints")]
pub mod failpoints {
    //! Deterministic fault injection for fabric selftests.

    use core::sync::atomic::{AtomicUsize, Ordering};

    static DENY_SIGNALS: AtomicUsize = AtomicUsize::new(0);

    /// Suppresses the next `count` IPI sends. Delivery still completes
    /// because targets poll their queues via `wait_check`.
    pub fn deny_signals(count: usize) {
        DENY_SIGNALS.store(count, Ordering::Release);
    }

    pub(super) fn take_signal_denial() -> bool {
        DENY_SIGNALS
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| v.checked_sub(1))
            .is_ok()
    }

    pub fn reset() {
        DENY_SIGNALS.store(0, Ordering::Release);
    }
}

#[cfg(test)]
pub(crate) fn reset_fabric_for_test() {
    reset_selftest_counters();
    crate::smp::reset_selftest_counters();
    pool::reset_exhaustion_counters();
    #[cfg(feature = "failpoints")]
    failpoints::reset();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::smp::{set_current_cpu_for_test, set_online_mask_for_test};
    use crate::test_sync::TEST_LOCK;
    use core::sync::atomic::AtomicBool;

    fn handle(raw: u32) -> AsHandle {
        AsHandle::from_raw(raw).unwrap()
    }

    #[test]
    fn sync_flush_broadcast_reaches_all_targets() {
        let _guard = TEST_LOCK.lock();
        reset_fabric_for_test();
        set_online_mask_for_test(0b1111);
        set_current_cpu_for_test(CpuId::BOOT);

        let stop = AtomicBool::new(false);
        std::thread::scope(|scope| {
            for raw in 1u16..4 {
                let stop = &stop;
                scope.spawn(move || {
                    let cpu = CpuId::from_raw(raw);
                    set_current_cpu_for_test(cpu);
                    while !stop.load(Ordering::Acquire) {
                        let _ = drain_pending(cpu);
                        std::thread::yield_now();
                    }
                });
            }

            let outcome = flush_range(
                CoreSet::from_mask(0b1110),
                handle(1),
                0x1000,
                PageCount::from_raw(8),
                DeliveryMode::Synchronous,
            );
            assert_eq!(outcome, BroadcastOutcome::Completed);
            stop.store(true, Ordering::Release);
        });

        for raw in 1u16..4 {
            let evidence = bus_evidence(CpuId::from_raw(raw));
            assert_eq!(evidence.flushes_applied, 1);
            assert_eq!(evidence.entries_drained, 1);
        }
        let sender = bus_evidence(CpuId::BOOT);
        assert_eq!(sender.broadcasts_sent, 1);
        assert_eq!(sender.entries_queued, 3);
        assert_eq!(sender.inline_runs, 0);
        assert_eq!(sender.releases, 1);

        let flush = selftest_last_flush().unwrap();
        assert_eq!(flush.space, handle(1));
        assert_eq!(flush.base, 0x1000);
        assert_eq!(flush.pages.as_raw(), 8);

        assert_eq!(selftest_pool_free_count(), selftest_pool_capacity());
    }

    #[test]
    fn sync_invoke_runs_once_per_target() {
        let _guard = TEST_LOCK.lock();
        reset_fabric_for_test();
        set_online_mask_for_test(0b1111);
        set_current_cpu_for_test(CpuId::BOOT);

        static HITS: AtomicUsize = AtomicUsize::new(0);
        HITS.store(0, Ordering::Release);

        let stop = AtomicBool::new(false);
        std::thread::scope(|scope| {
            for raw in 1u16..4 {
                let stop = &stop;
                scope.spawn(move || {
                    let cpu = CpuId::from_raw(raw);
                    set_current_cpu_for_test(cpu);
                    while !stop.load(Ordering::Acquire) {
                        let _ = drain_pending(cpu);
                        std::thread::yield_now();
                    }
                });
            }

            let outcome = broadcast(
                CoreSet::from_mask(0b1110),
                Payload::Invoke(InlineInvoke::new(|| {
                    HITS.fetch_add(1, Ordering::AcqRel);
                })),
                DeliveryMode::Synchronous,
            );
            assert_eq!(outcome, BroadcastOutcome::Completed);
            stop.store(true, Ordering::Release);
        });

        assert_eq!(HITS.load(Ordering::Acquire), 3);
        assert_eq!(selftest_pool_free_count(), selftest_pool_capacity());
    }

    #[test]
    fn async_invoke_posts_then_completes_on_drain() {
        let _guard = TEST_LOCK.lock();
        reset_fabric_for_test();
        set_online_mask_for_test(0b1111);
        set_current_cpu_for_test(CpuId::BOOT);

        static HITS: AtomicUsize = AtomicUsize::new(0);
        HITS.store(0, Ordering::Release);

        let outcome = broadcast(
            CoreSet::from_mask(0b1110),
            Payload::Invoke(InlineInvoke::new(|| {
                HITS.fetch_add(1, Ordering::AcqRel);
            })),
            DeliveryMode::Asynchronous,
        );
        assert_eq!(outcome, BroadcastOutcome::Posted);
        // Single-threaded here: nothing has drained yet.
        assert_eq!(HITS.load(Ordering::Acquire), 0);
        assert_eq!(selftest_pool_free_count(), selftest_pool_capacity() - 1);

        for raw in 1u16..4 {
            let cpu = CpuId::from_raw(raw);
            set_current_cpu_for_test(cpu);
            assert!(drain_pending(cpu));
        }
        set_current_cpu_for_test(CpuId::BOOT);

        assert_eq!(HITS.load(Ordering::Acquire), 3);
        // The terminal decrement released the record.
        assert_eq!(selftest_pool_free_count(), selftest_pool_capacity());
    }

    #[test]
    fn per_target_fifo_is_preserved() {
        let _guard = TEST_LOCK.lock();
        reset_fabric_for_test();
        set_online_mask_for_test(0b0011);
        set_current_cpu_for_test(CpuId::BOOT);

        static SEQ: AtomicUsize = AtomicUsize::new(0);
        static FIRST_AT: AtomicUsize = AtomicUsize::new(0);
        static SECOND_AT: AtomicUsize = AtomicUsize::new(0);
        SEQ.store(0, Ordering::Release);
        FIRST_AT.store(0, Ordering::Release);
        SECOND_AT.store(0, Ordering::Release);

        let target = CpuId::from_raw(1);
        let first = invoke_on(
            target,
            || {
                FIRST_AT.store(SEQ.fetch_add(1, Ordering::AcqRel) + 1, Ordering::Release);
            },
            DeliveryMode::Asynchronous,
        );
        let second = invoke_on(
            target,
            || {
                SECOND_AT.store(SEQ.fetch_add(1, Ordering::AcqRel) + 1, Ordering::Release);
            },
            DeliveryMode::Asynchronous,
        );
        assert_eq!(first, BroadcastOutcome::Posted);
        assert_eq!(second, BroadcastOutcome::Posted);

        set_current_cpu_for_test(target);
        assert!(drain_pending(target));
        set_current_cpu_for_test(CpuId::BOOT);

        assert_eq!(FIRST_AT.load(Ordering::Acquire), 1);
        assert_eq!(SECOND_AT.load(Ordering::Acquire), 2);
        assert_eq!(selftest_pool_free_count(), selftest_pool_capacity());
    }

    #[test]
    fn self_only_sync_broadcast_completes_inline() {
        let _guard = TEST_LOCK.lock();
        reset_fabric_for_test();
        set_online_mask_for_test(0b0001);
        set_current_cpu_for_test(CpuId::BOOT);

        static HITS: AtomicUsize = AtomicUsize::new(0);
        HITS.store(0, Ordering::Release);

        let outcome = invoke_on(
            CpuId::BOOT,
            || {
                HITS.fetch_add(1, Ordering::AcqRel);
            },
            DeliveryMode::Synchronous,
        );
        assert_eq!(outcome, BroadcastOutcome::Completed);
        assert_eq!(HITS.load(Ordering::Acquire), 1);

        let evidence = bus_evidence(CpuId::BOOT);
        assert_eq!(evidence.inline_runs, 1);
        assert_eq!(evidence.entries_queued, 0);
        assert!(queue::is_empty(CpuId::BOOT));
        assert_eq!(selftest_pool_free_count(), selftest_pool_capacity());
    }

    #[test]
    fn self_only_async_broadcast_retires_via_terminal_decrement() {
        let _guard = TEST_LOCK.lock();
        reset_fabric_for_test();
        set_online_mask_for_test(0b0001);
        set_current_cpu_for_test(CpuId::BOOT);

        static HITS: AtomicUsize = AtomicUsize::new(0);
        HITS.store(0, Ordering::Release);

        let outcome = invoke_on(
            CpuId::BOOT,
            || {
                HITS.fetch_add(1, Ordering::AcqRel);
            },
            DeliveryMode::Asynchronous,
        );
        assert_eq!(outcome, BroadcastOutcome::Posted);
        // The inline self-run already happened during the call.
        assert_eq!(HITS.load(Ordering::Acquire), 1);
        assert_eq!(bus_evidence(CpuId::BOOT).releases, 1);
        assert_eq!(selftest_pool_free_count(), selftest_pool_capacity());
    }

    #[test]
    fn crossed_sync_broadcasts_do_not_deadlock() {
        let _guard = TEST_LOCK.lock();
        reset_fabric_for_test();
        set_online_mask_for_test(0b0011);
        set_current_cpu_for_test(CpuId::BOOT);

        static HITS: AtomicUsize = AtomicUsize::new(0);
        HITS.store(0, Ordering::Release);

        std::thread::scope(|scope| {
            scope.spawn(|| {
                let cpu = CpuId::from_raw(1);
                set_current_cpu_for_test(cpu);
                let outcome = invoke_on(
                    CpuId::BOOT,
                    || {
                        HITS.fetch_add(1, Ordering::AcqRel);
                    },
                    DeliveryMode::Synchronous,
                );
                assert_eq!(outcome, BroadcastOutcome::Completed);
            });

            let outcome = invoke_on(
                CpuId::from_raw(1),
                || {
                    HITS.fetch_add(1, Ordering::AcqRel);
                },
                DeliveryMode::Synchronous,
            );
            assert_eq!(outcome, BroadcastOutcome::Completed);
        });

        assert_eq!(HITS.load(Ordering::Acquire), 2);
        assert_eq!(selftest_pool_free_count(), selftest_pool_capacity());
    }

    #[test]
    fn invoke_all_covers_caller_and_remote() {
        let _guard = TEST_LOCK.lock();
        reset_fabric_for_test();
        set_online_mask_for_test(0b0011);
        set_current_cpu_for_test(CpuId::BOOT);

        static HITS: AtomicUsize = AtomicUsize::new(0);
        HITS.store(0, Ordering::Release);

        let outcome = invoke_all(
            || {
                HITS.fetch_add(1, Ordering::AcqRel);
            },
            DeliveryMode::Asynchronous,
        );
        assert_eq!(outcome, BroadcastOutcome::Posted);
        assert_eq!(HITS.load(Ordering::Acquire), 1);

        let cpu1 = CpuId::from_raw(1);
        set_current_cpu_for_test(cpu1);
        assert!(drain_pending(cpu1));
        set_current_cpu_for_test(CpuId::BOOT);

        assert_eq!(HITS.load(Ordering::Acquire), 2);
        assert_eq!(selftest_pool_free_count(), selftest_pool_capacity());
    }

    #[test]
    fn invoke_others_excludes_the_caller() {
        let _guard = TEST_LOCK.lock();
        reset_fabric_for_test();
        set_online_mask_for_test(0b0011);
        set_current_cpu_for_test(CpuId::BOOT);

        static HITS: AtomicUsize = AtomicUsize::new(0);
        HITS.store(0, Ordering::Release);

        let outcome = invoke_others(
            || {
                HITS.fetch_add(1, Ordering::AcqRel);
            },
            DeliveryMode::Asynchronous,
        );
        assert_eq!(outcome, BroadcastOutcome::Posted);
        assert_eq!(HITS.load(Ordering::Acquire), 0);
        assert_eq!(bus_evidence(CpuId::BOOT).inline_runs, 0);

        let cpu1 = CpuId::from_raw(1);
        set_current_cpu_for_test(cpu1);
        assert!(drain_pending(cpu1));
        set_current_cpu_for_test(CpuId::BOOT);

        assert_eq!(HITS.load(Ordering::Acquire), 1);
        assert_eq!(selftest_pool_free_count(), selftest_pool_capacity());
    }

    #[test]
    fn empty_target_set_completes_without_pool_touch() {
        let _guard = TEST_LOCK.lock();
        reset_fabric_for_test();
        set_online_mask_for_test(0b0001);
        set_current_cpu_for_test(CpuId::BOOT);

        let outcome = broadcast(
            CoreSet::EMPTY,
            Payload::FlushRange(FlushRange {
                space: handle(9),
                base: 0,
                pages: PageCount::from_raw(1),
            }),
            DeliveryMode::Synchronous,
        );
        assert_eq!(outcome, BroadcastOutcome::Completed);
        assert_eq!(bus_evidence(CpuId::BOOT).broadcasts_sent, 0);
        assert_eq!(selftest_pool_free_count(), selftest_pool_capacity());
    }

    #[test]
    fn invoke_capture_is_dropped_on_release() {
        let _guard = TEST_LOCK.lock();
        reset_fabric_for_test();
        set_online_mask_for_test(0b0011);
        set_current_cpu_for_test(CpuId::BOOT);

        let probe = std::sync::Arc::new(());
        let captured = std::sync::Arc::clone(&probe);
        let outcome = invoke_on(
            CpuId::from_raw(1),
            move || {
                let _ = &captured;
            },
            DeliveryMode::Asynchronous,
        );
        assert_eq!(outcome, BroadcastOutcome::Posted);
        assert_eq!(std::sync::Arc::strong_count(&probe), 2);

        let cpu1 = CpuId::from_raw(1);
        set_current_cpu_for_test(cpu1);
        assert!(drain_pending(cpu1));
        set_current_cpu_for_test(CpuId::BOOT);

        assert_eq!(std::sync::Arc::strong_count(&probe), 1);
        assert_eq!(selftest_pool_free_count(), selftest_pool_capacity());
    }

    #[test]
    fn completion_counts_down_and_terminal_decrement_frees() {
        let _guard = TEST_LOCK.lock();
        reset_fabric_for_test();

        let msg = pool::MESSAGE_POOL.acquire();
        msg.completion.store(2, Ordering::Release);

        complete_one(msg, CpuId::BOOT);
        assert_eq!(msg.completion_snapshot(), 1);
        assert_eq!(selftest_pool_free_count(), selftest_pool_capacity() - 1);

        // Idle bodies default to asynchronous mode, so the terminal
        // decrement retires the record.
        complete_one(msg, CpuId::BOOT);
        assert_eq!(selftest_pool_free_count(), selftest_pool_capacity());
        assert_eq!(bus_evidence(CpuId::BOOT).releases, 1);
    }

    #[test]
    fn sync_terminal_decrement_leaves_release_to_sender() {
        let _guard = TEST_LOCK.lock();
        reset_fabric_for_test();

        let msg = pool::MESSAGE_POOL.acquire();
        // SAFETY: exclusively owned between acquire and release.
        unsafe {
            (*msg.body.get()).mode = DeliveryMode::Synchronous;
        }
        msg.completion.store(1, Ordering::Release);

        complete_one(msg, CpuId::from_raw(1));
        assert_eq!(msg.completion_snapshot(), 0);
        assert_eq!(
            selftest_pool_free_count(),
            selftest_pool_capacity() - 1,
            "sync flights stay owned until the sender retires them"
        );

        retire(msg, CpuId::BOOT);
        assert_eq!(selftest_pool_free_count(), selftest_pool_capacity());
    }

    #[test]
    fn test_reject_completion_underflow() {
        let _guard = TEST_LOCK.lock();
        reset_fabric_for_test();

        let msg = pool::MESSAGE_POOL.acquire();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            complete_one(msg, CpuId::BOOT);
        }));
        assert!(result.is_err());

        // Repair the wrapped counter so the pool stays usable.
        msg.completion.store(0, Ordering::Release);
        pool::MESSAGE_POOL.release(msg);
        assert_eq!(selftest_pool_free_count(), selftest_pool_capacity());
    }

    #[test]
    fn test_reject_idle_payload_broadcast() {
        let _guard = TEST_LOCK.lock();
        reset_fabric_for_test();
        set_online_mask_for_test(0b0001);
        set_current_cpu_for_test(CpuId::BOOT);

        let result = std::panic::catch_unwind(|| {
            let _ = broadcast(
                CoreSet::single(CpuId::BOOT),
                Payload::None,
                DeliveryMode::Synchronous,
            );
        });
        assert!(result.is_err());
        assert_eq!(selftest_pool_free_count(), selftest_pool_capacity());
    }

    #[cfg(feature = "failpoints")]
    #[test]
    fn suppressed_signal_still_completes_via_polling() {
        let _guard = TEST_LOCK.lock();
        reset_fabric_for_test();
        set_online_mask_for_test(0b0011);
        set_current_cpu_for_test(CpuId::BOOT);

        static HITS: AtomicUsize = AtomicUsize::new(0);
        HITS.store(0, Ordering::Release);

        failpoints::deny_signals(1);
        let target = CpuId::from_raw(1);
        let outcome = invoke_on(
            target,
            || {
                HITS.fetch_add(1, Ordering::AcqRel);
            },
            DeliveryMode::Asynchronous,
        );
        assert_eq!(outcome, BroadcastOutcome::Posted);
        assert_eq!(
            crate::smp::signal_evidence(target).signal_requested_count,
            0,
            "the failpoint swallowed the signal before smp saw it"
        );

        // Polling stands in for the lost IPI.
        set_current_cpu_for_test(target);
        crate::smp::wait_check();
        set_current_cpu_for_test(CpuId::BOOT);

        assert_eq!(HITS.load(Ordering::Acquire), 1);
        assert_eq!(selftest_pool_free_count(), selftest_pool_capacity());
    }

    #[test]
    fn payload_kind_tracks_variant() {
        let flush = Payload::FlushRange(FlushRange {
            space: handle(3),
            base: 0x2000,
            pages: PageCount::from_raw(2),
        });
        assert_eq!(flush.kind(), Some(MessageKind::FlushRange));
        let invoke = Payload::Invoke(InlineInvoke::new(|| {}));
        assert_eq!(invoke.kind(), Some(MessageKind::Invoke));
        assert_eq!(Payload::None.kind(), None);
    }
}

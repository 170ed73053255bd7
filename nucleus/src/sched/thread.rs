/*
 * SPDX-License-Identifier: BlueOak-1.0.0
 * Copyright (c) Anillo OS authors
 */

//! Threads.
//!
//! A thread is a first-class kernel object: saved execution context,
//! lifecycle state machine, reference count, and a fixed vector of hook
//! slots through which interested parties (the scheduler above all)
//! observe and implement transitions. Threads live in an arena and are
//! named by generational handles, so a stale handle fails lookup cleanly
//! instead of touching freed memory.
//!
//! Lock order: a thread's lock is taken before any wait-queue lock, never
//! after one.

use {
    super::{
        timer::{TimerId, TimerQueue},
        wait_queue::{WaitQueue, Waiter, WaiterToken},
    },
    crate::error::{Result, Status},
    alloc::{boxed::Box, sync::Arc, vec::Vec},
    bitflags::bitflags,
    core::{
        fmt,
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    },
    machine::{
        cpu::{CpuId, ExecutionContext},
        memory::VirtAddr,
        synchronization::{interface::Mutex, IRQSafeSpinLock},
        time::Instant,
    },
};

//--------------------------------------------------------------------------------------------------
// Public Definitions
//--------------------------------------------------------------------------------------------------

/// Generational thread handle: (slot, generation). Stale handles miss.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId {
    slot: u32,
    generation: u32,
}

/// Execution state. `Dead` is terminal.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ExecState {
    Running,
    Suspended,
    Dead,
}

bitflags! {
    /// Transitive state flags.
    pub struct ThreadFlags: u32 {
        const PENDING_SUSPEND          = 1 << 0;
        const PENDING_BLOCK            = 1 << 1;
        const PENDING_DEATH            = 1 << 2;
        const BLOCKED                  = 1 << 3;
        const INTERRUPTED              = 1 << 4;
        const HOLDING_WAITQ_LOCK       = 1 << 5;
        const EXIT_DATA_COPIED         = 1 << 6;
        const DEALLOCATE_STACK_ON_EXIT = 1 << 7;
    }
}

/// Why a wait returned.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum WakeOutcome {
    /// The awaited event occurred.
    Normal,
    /// The armed timeout elapsed first.
    Timeout,
    /// The thread was killed while parked.
    Killed,
}

/// Timeout specification for [`Thread::wait`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Timeout {
    None,
    RelativeNs(u64),
    AbsoluteNs(u64),
}

/// What a hook callback reports back.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum HookResult {
    /// This slot handled the transition; stop scanning.
    Handled,
    /// The transition target is gone; stop scanning, nothing later runs.
    PermanentOutage,
    /// Not interested; keep scanning.
    NotHandled,
}

/// Lifecycle moments a hook slot can subscribe to.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum HookKind {
    Suspend,
    Resume,
    Kill,
    Block,
    Unblock,
    Interrupted,
    EndingInterrupt,
    BusError,
    PageFault,
    FloatingPointException,
    IllegalInstruction,
    DebugTrap,
    DivisionByZero,
}

/// A hook callback; the captured environment stands in for the owner's
/// opaque context word.
pub type HookFn = Arc<dyn Fn(&Thread) -> HookResult + Send + Sync>;

/// One slot's bundle of callbacks, discriminated by presence.
#[derive(Clone, Default)]
pub struct HookSlot {
    pub owner_id: u64,
    pub suspend: Option<HookFn>,
    pub resume: Option<HookFn>,
    pub kill: Option<HookFn>,
    pub block: Option<HookFn>,
    pub unblock: Option<HookFn>,
    pub interrupted: Option<HookFn>,
    pub ending_interrupt: Option<HookFn>,
    pub bus_error: Option<HookFn>,
    pub page_fault: Option<HookFn>,
    pub floating_point_exception: Option<HookFn>,
    pub illegal_instruction: Option<HookFn>,
    pub debug_trap: Option<HookFn>,
    pub division_by_zero: Option<HookFn>,
}

/// Hook slots per thread.
pub const HOOK_SLOTS: usize = 8;

/// A kernel thread.
pub struct Thread {
    id: ThreadId,
    refs: AtomicUsize,
    timers: &'static TimerQueue,
    inner: IRQSafeSpinLock<ThreadInner>,
    suspend_waitq: Arc<WaitQueue>,
    block_waitq: Arc<WaitQueue>,
    death_waitq: Arc<WaitQueue>,
    destroy_waitq: Arc<WaitQueue>,
}

/// The thread arena.
pub struct ThreadTable {
    timers: &'static TimerQueue,
    inner: IRQSafeSpinLock<TableInner>,
}

//--------------------------------------------------------------------------------------------------
// Private Definitions
//--------------------------------------------------------------------------------------------------

struct ThreadInner {
    state: ExecState,
    flags: ThreadFlags,
    block_count: u32,
    context: Box<ExecutionContext>,
    stack_base: VirtAddr,
    stack_pages: usize,
    /// Which queue the thread is parked on, if any.
    parked_on: Option<Arc<WaitQueue>>,
    /// Wake outcome posted by a waker before or after the park committed.
    wake: Option<WakeOutcome>,
    hooks: [Option<HookSlot>; HOOK_SLOTS],
    pending_timer: Option<TimerId>,
    pending_timeout: Timeout,
    exit_payload: Option<Box<[u8]>>,
    pending_signals: u64,
    block_signals: bool,
    /// CPU the thread last ran on (queue affinity on wake).
    last_cpu: Option<CpuId>,
}

struct TableInner {
    slots: Vec<Slot>,
    free: Vec<u32>,
}

struct Slot {
    generation: u32,
    occupant: Option<Arc<Thread>>,
}

//--------------------------------------------------------------------------------------------------
// Public Code
//--------------------------------------------------------------------------------------------------

impl ThreadId {
    pub const fn from_raw(raw: u64) -> Self {
        Self {
            slot: raw as u32,
            generation: (raw >> 32) as u32,
        }
    }

    pub const fn raw(self) -> u64 {
        ((self.generation as u64) << 32) | self.slot as u64
    }

    pub const fn slot(self) -> u32 {
        self.slot
    }

    fn token(self) -> WaiterToken {
        WaiterToken(self.raw())
    }
}

impl fmt::Debug for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "thread {}.{}", self.slot, self.generation)
    }
}

impl HookSlot {
    fn callback(&self, kind: HookKind) -> Option<&HookFn> {
        match kind {
            HookKind::Suspend => self.suspend.as_ref(),
            HookKind::Resume => self.resume.as_ref(),
            HookKind::Kill => self.kill.as_ref(),
            HookKind::Block => self.block.as_ref(),
            HookKind::Unblock => self.unblock.as_ref(),
            HookKind::Interrupted => self.interrupted.as_ref(),
            HookKind::EndingInterrupt => self.ending_interrupt.as_ref(),
            HookKind::BusError => self.bus_error.as_ref(),
            HookKind::PageFault => self.page_fault.as_ref(),
            HookKind::FloatingPointException => self.floating_point_exception.as_ref(),
            HookKind::IllegalInstruction => self.illegal_instruction.as_ref(),
            HookKind::DebugTrap => self.debug_trap.as_ref(),
            HookKind::DivisionByZero => self.division_by_zero.as_ref(),
        }
    }
}

impl Thread {
    pub fn id(&self) -> ThreadId {
        self.id
    }

    pub fn execution_state(&self) -> ExecState {
        self.inner.lock(|i| i.state)
    }

    pub fn flags(&self) -> ThreadFlags {
        self.inner.lock(|i| i.flags)
    }

    /// Runnable from the scheduler's point of view.
    pub fn should_run(&self) -> bool {
        self.inner
            .lock(|i| i.state == ExecState::Running && !i.flags.contains(ThreadFlags::BLOCKED))
    }

    //----------------------------------------------------------------------------------------------
    // Reference counting
    //----------------------------------------------------------------------------------------------

    pub fn retain(&self) {
        self.refs.fetch_add(1, Ordering::Relaxed);
    }

    /// Drop one reference, returning how many remain. At zero the caller
    /// (the kernel) schedules the deferred reaper; freeing is deferred
    /// because the scheduler may still hold a transient pointer.
    pub fn release(&self) -> usize {
        let prev = self.refs.fetch_sub(1, Ordering::AcqRel);
        assert!(prev > 0, "thread over-released");
        prev - 1
    }

    pub fn ref_count(&self) -> usize {
        self.refs.load(Ordering::Relaxed)
    }

    //----------------------------------------------------------------------------------------------
    // Hooks
    //----------------------------------------------------------------------------------------------

    /// Claim the lowest free hook slot. `None` when all eight are taken.
    pub fn register_hooks(&self, slot: HookSlot) -> Option<usize> {
        self.inner.lock(|i| {
            let index = i.hooks.iter().position(|s| s.is_none())?;
            i.hooks[index] = Some(slot);
            Some(index)
        })
    }

    /// Drop every slot owned by `owner_id`.
    pub fn unregister_hooks(&self, owner_id: u64) -> bool {
        self.inner.lock(|i| {
            let mut any = false;
            for slot in i.hooks.iter_mut() {
                if slot.as_ref().map(|s| s.owner_id) == Some(owner_id) {
                    *slot = None;
                    any = true;
                }
            }
            any
        })
    }

    /// Scan slots 0..8 for `kind`, stopping at the first `Handled` or
    /// `PermanentOutage`.
    fn run_hooks(&self, kind: HookKind) -> HookResult {
        let callbacks: [Option<HookFn>; HOOK_SLOTS] = self.inner.lock(|i| {
            core::array::from_fn(|n| {
                i.hooks[n]
                    .as_ref()
                    .and_then(|slot| slot.callback(kind).cloned())
            })
        });

        for callback in callbacks.into_iter().flatten() {
            match callback(self) {
                HookResult::NotHandled => continue,
                decided => return decided,
            }
        }
        HookResult::NotHandled
    }

    /// Deliver a synchronous fault to the thread's hooks.
    pub fn deliver_fault(&self, kind: HookKind) -> HookResult {
        debug_assert!(matches!(
            kind,
            HookKind::BusError
                | HookKind::PageFault
                | HookKind::FloatingPointException
                | HookKind::IllegalInstruction
                | HookKind::DebugTrap
                | HookKind::DivisionByZero
        ));
        self.run_hooks(kind)
    }

    //----------------------------------------------------------------------------------------------
    // Lifecycle
    //----------------------------------------------------------------------------------------------

    /// Request suspension. For the calling thread this parks inside the
    /// suspend hook; for another thread it marks the state and lets that
    /// thread's scheduler act on it.
    pub fn suspend(&self) -> Result<()> {
        self.inner.lock(|i| match i.state {
            ExecState::Dead => Err(Status::PermanentOutage),
            ExecState::Suspended => Err(Status::AlreadyInProgress),
            ExecState::Running => {
                i.flags.insert(ThreadFlags::PENDING_SUSPEND);
                i.state = ExecState::Suspended;
                i.flags.remove(ThreadFlags::PENDING_SUSPEND);
                Ok(())
            }
        })?;

        self.suspend_waitq.wake_all();
        self.run_hooks(HookKind::Suspend);
        Ok(())
    }

    /// [`Self::suspend`] with the wait flag: the caller parks on the
    /// target's suspend queue until the suspension has actually landed
    /// (on another CPU it may be deferred to the next interrupt
    /// boundary).
    pub fn suspend_and_wait(&self, current: &Arc<Thread>, timeout: Timeout) -> Result<()> {
        match self.suspend() {
            Ok(()) | Err(Status::AlreadyInProgress) => {}
            Err(other) => return Err(other),
        }
        loop {
            if self.execution_state() != ExecState::Running {
                return Ok(());
            }
            current.prepare_wait(&self.suspend_waitq, timeout)?;
            if self.execution_state() != ExecState::Running {
                current.cancel_wait();
                return Ok(());
            }
            current.commit_wait()?;
        }
    }

    /// Undo a suspension (or a pending one). `PermanentOutage` if dead.
    pub fn resume(&self) -> Result<()> {
        let fire = self.inner.lock(|i| match i.state {
            ExecState::Dead => Err(Status::PermanentOutage),
            ExecState::Running => {
                if i.flags.contains(ThreadFlags::PENDING_SUSPEND) {
                    i.flags.remove(ThreadFlags::PENDING_SUSPEND);
                    Ok(false)
                } else {
                    Err(Status::AlreadyInProgress)
                }
            }
            ExecState::Suspended => {
                i.state = ExecState::Running;
                if i.wake.is_none() {
                    i.wake = Some(WakeOutcome::Normal);
                }
                Ok(true)
            }
        })?;

        if fire {
            self.run_hooks(HookKind::Resume);
        }
        Ok(())
    }

    /// Raise the block count; the first level marks the thread blocked.
    pub fn block(&self) -> Result<()> {
        let first = self.inner.lock(|i| {
            if i.state == ExecState::Dead {
                return Err(Status::PermanentOutage);
            }
            i.block_count += 1;
            let first = i.block_count == 1;
            if first {
                i.flags.insert(ThreadFlags::BLOCKED);
            }
            Ok(first)
        })?;

        if first {
            self.run_hooks(HookKind::Block);
        }
        Ok(())
    }

    /// Lower the block count; only the transition to zero wakes anything.
    pub fn unblock(&self) -> Result<()> {
        let last = self.inner.lock(|i| {
            if i.block_count == 0 {
                return Err(Status::InvalidArgument);
            }
            i.block_count -= 1;
            let last = i.block_count == 0;
            if last {
                i.flags.remove(ThreadFlags::BLOCKED);
            }
            Ok(last)
        })?;

        if last {
            self.run_hooks(HookKind::Unblock);
            self.block_waitq.wake_all();
        }
        Ok(())
    }

    /// Kill the thread. Idempotent for already-dying threads.
    pub fn kill(&self) -> Result<()> {
        let cleanup = self.inner.lock(|i| {
            if i.state == ExecState::Dead || i.flags.contains(ThreadFlags::PENDING_DEATH) {
                return Err(Status::AlreadyInProgress);
            }
            i.flags.insert(ThreadFlags::PENDING_DEATH);
            i.state = ExecState::Dead;
            if i.wake.is_none() {
                i.wake = Some(WakeOutcome::Killed);
            }
            Ok((i.parked_on.take(), i.pending_timer.take()))
        });

        let (parked_on, timer) = match cleanup {
            Ok(c) => c,
            Err(e) => return Err(e),
        };
        if let Some(queue) = parked_on {
            queue.remove(self.id.token());
        }
        if let Some(timer) = timer {
            self.timers.cancel(timer);
        }

        self.run_hooks(HookKind::Kill);
        self.death_waitq.wake_all();
        log::trace!("{:?} killed", self.id);
        Ok(())
    }

    /// Record the exit payload and kill the calling thread. The scheduler
    /// never returns control to a dead thread, so in kernel context
    /// nothing after this runs.
    pub fn exit(&self, payload: &[u8], copy: bool) {
        self.inner.lock(|i| {
            if copy {
                i.exit_payload = Some(payload.into());
                i.flags.insert(ThreadFlags::EXIT_DATA_COPIED);
            }
        });
        let _ = self.kill();
    }

    /// Exit payload recorded by [`Self::exit`], if any.
    pub fn exit_payload(&self) -> Option<Box<[u8]>> {
        self.inner.lock(|i| i.exit_payload.clone())
    }

    //----------------------------------------------------------------------------------------------
    // Waiting
    //----------------------------------------------------------------------------------------------

    /// Park on `queue` until woken, with an optional timeout.
    ///
    /// Equivalent to [`Self::prepare_wait`] + [`Self::commit_wait`];
    /// callers that must re-check a condition after registering (channels)
    /// use the split form and cancel on a lost race.
    pub fn wait(self: &Arc<Self>, queue: &Arc<WaitQueue>, timeout: Timeout) -> Result<()> {
        self.prepare_wait(queue, timeout)?;
        self.commit_wait()
    }

    /// Register as a waiter and arm the timeout, without suspending yet.
    /// A wake arriving between this and [`Self::commit_wait`] is not lost.
    pub fn prepare_wait(self: &Arc<Self>, queue: &Arc<WaitQueue>, timeout: Timeout) -> Result<()> {
        let this = Arc::clone(self);
        let waker = move || {
            this.resume_with(WakeOutcome::Normal);
        };

        self.inner.lock(|i| {
            if i.state == ExecState::Dead {
                return Err(Status::PermanentOutage);
            }
            debug_assert!(i.parked_on.is_none(), "thread already waiting");
            // Arming a new wait cancels any pending timer.
            if let Some(old) = i.pending_timer.take() {
                self.timers.cancel(old);
            }
            i.parked_on = Some(Arc::clone(queue));
            i.wake = None;
            i.pending_timeout = timeout;

            i.flags.insert(ThreadFlags::HOLDING_WAITQ_LOCK);
            queue.with_locked(|q| q.add_locked(Waiter::new(self.id.token(), waker)));
            i.flags.remove(ThreadFlags::HOLDING_WAITQ_LOCK);

            let deadline = match timeout {
                Timeout::None => None,
                Timeout::RelativeNs(ns) => {
                    Some(self.timers.clock().now() + Duration::from_nanos(ns))
                }
                Timeout::AbsoluteNs(ns) => Some(Instant::from_nanos(ns)),
            };
            if let Some(deadline) = deadline {
                let thread = Arc::clone(self);
                let timed_queue = Arc::clone(queue);
                i.pending_timer = Some(self.timers.arm(deadline, move || {
                    // Only deliver the timeout if the waker has not already
                    // claimed the waiter.
                    if timed_queue.remove(thread.id.token()) {
                        thread.resume_with(WakeOutcome::Timeout);
                    }
                }));
            }
            Ok(())
        })
    }

    /// Suspend until the wake prepared by [`Self::prepare_wait`] arrives,
    /// then report its outcome.
    pub fn commit_wait(self: &Arc<Self>) -> Result<()> {
        let park = self.inner.lock(|i| {
            if i.wake.is_some() || i.state == ExecState::Dead {
                // Already woken (or killed) before the park committed.
                false
            } else {
                i.state = ExecState::Suspended;
                true
            }
        });

        if park {
            self.suspend_waitq.wake_all();
            self.run_hooks(HookKind::Suspend);
        }

        let outcome = self.inner.lock(|i| {
            let outcome = i.wake.take().unwrap_or(WakeOutcome::Normal);
            i.parked_on = None;
            if let Some(timer) = i.pending_timer.take() {
                self.timers.cancel(timer);
            }
            i.pending_timeout = Timeout::None;
            outcome
        });

        match outcome {
            WakeOutcome::Normal => Ok(()),
            WakeOutcome::Timeout => Err(Status::Timeout),
            WakeOutcome::Killed => Err(Status::PermanentOutage),
        }
    }

    /// Abandon a prepared wait (the condition turned true while
    /// registering).
    pub fn cancel_wait(&self) {
        let (queue, timer) = self
            .inner
            .lock(|i| (i.parked_on.take(), i.pending_timer.take()));
        if let Some(queue) = queue {
            queue.remove(self.id.token());
        }
        if let Some(timer) = timer {
            self.timers.cancel(timer);
        }
        self.inner.lock(|i| i.wake = None);
    }

    /// The queue this thread is parked on, if any.
    pub fn parked_on(&self) -> Option<Arc<WaitQueue>> {
        self.inner.lock(|i| i.parked_on.clone())
    }

    fn resume_with(&self, outcome: WakeOutcome) {
        let fire = self.inner.lock(|i| {
            if i.state == ExecState::Dead {
                return false;
            }
            if i.wake.is_none() {
                i.wake = Some(outcome);
            }
            if i.state == ExecState::Suspended {
                i.state = ExecState::Running;
                true
            } else {
                // Not parked yet; commit_wait will observe the wake.
                false
            }
        });
        if fire {
            self.run_hooks(HookKind::Resume);
        }
    }

    //----------------------------------------------------------------------------------------------
    // Interrupts and signals
    //----------------------------------------------------------------------------------------------

    pub fn interrupt(&self) {
        self.inner.lock(|i| i.flags.insert(ThreadFlags::INTERRUPTED));
        self.run_hooks(HookKind::Interrupted);
    }

    pub fn end_interrupt(&self) {
        self.inner.lock(|i| i.flags.remove(ThreadFlags::INTERRUPTED));
        self.run_hooks(HookKind::EndingInterrupt);
    }

    /// Post one signal bit. Delivery interrupts the thread unless signals
    /// are blocked; the bit stays pending either way.
    pub fn post_signal(&self, signal: u8) -> Result<()> {
        if signal >= 64 {
            return Err(Status::InvalidArgument);
        }
        let deliver = self.inner.lock(|i| {
            if i.state == ExecState::Dead {
                return Err(Status::PermanentOutage);
            }
            i.pending_signals |= 1 << signal;
            Ok(!i.block_signals)
        })?;
        if deliver {
            self.interrupt();
        }
        Ok(())
    }

    /// Drain the pending-signal mask.
    pub fn take_signals(&self) -> u64 {
        self.inner.lock(|i| core::mem::take(&mut i.pending_signals))
    }

    pub fn set_block_signals(&self, block: bool) {
        self.inner.lock(|i| i.block_signals = block);
    }

    //----------------------------------------------------------------------------------------------
    // Context and stack
    //----------------------------------------------------------------------------------------------

    /// Mutate the saved context (only while the thread is off-CPU).
    pub fn with_context<R>(&self, f: impl FnOnce(&mut ExecutionContext) -> R) -> R {
        self.inner.lock(|i| f(&mut i.context))
    }

    /// Stable pointer to the saved context, for the switch paths.
    ///
    /// Only the scheduler of the CPU that owns the switch may dereference
    /// it, and only while the thread is not running elsewhere.
    pub fn context_ptr(&self) -> *mut ExecutionContext {
        self.inner.lock(|i| &mut *i.context as *mut ExecutionContext)
    }

    pub fn stack(&self) -> (VirtAddr, usize) {
        self.inner.lock(|i| (i.stack_base, i.stack_pages))
    }

    pub fn last_cpu(&self) -> Option<CpuId> {
        self.inner.lock(|i| i.last_cpu)
    }

    pub fn set_last_cpu(&self, cpu: CpuId) {
        self.inner.lock(|i| i.last_cpu = Some(cpu));
    }

    //----------------------------------------------------------------------------------------------
    // Event queues
    //----------------------------------------------------------------------------------------------

    pub fn suspend_waitq(&self) -> &Arc<WaitQueue> {
        &self.suspend_waitq
    }

    pub fn block_waitq(&self) -> &Arc<WaitQueue> {
        &self.block_waitq
    }

    pub fn death_waitq(&self) -> &Arc<WaitQueue> {
        &self.death_waitq
    }

    pub fn destroy_waitq(&self) -> &Arc<WaitQueue> {
        &self.destroy_waitq
    }
}

impl ThreadTable {
    pub fn new(timers: &'static TimerQueue) -> Self {
        Self {
            timers,
            inner: IRQSafeSpinLock::new(TableInner {
                slots: Vec::new(),
                free: Vec::new(),
            }),
        }
    }

    /// Create a thread in the `Suspended` state with one reference held by
    /// the creator.
    pub fn create(
        &self,
        context: ExecutionContext,
        stack_base: VirtAddr,
        stack_pages: usize,
        deallocate_stack_on_exit: bool,
    ) -> Arc<Thread> {
        self.inner.lock(|table| {
            let slot = match table.free.pop() {
                Some(slot) => slot,
                None => {
                    table.slots.push(Slot {
                        generation: 0,
                        occupant: None,
                    });
                    (table.slots.len() - 1) as u32
                }
            };
            let generation = table.slots[slot as usize].generation;
            let id = ThreadId { slot, generation };

            let mut flags = ThreadFlags::empty();
            if deallocate_stack_on_exit {
                flags.insert(ThreadFlags::DEALLOCATE_STACK_ON_EXIT);
            }
            let thread = Arc::new(Thread {
                id,
                refs: AtomicUsize::new(1),
                timers: self.timers,
                inner: IRQSafeSpinLock::new(ThreadInner {
                    state: ExecState::Suspended,
                    flags,
                    block_count: 0,
                    context: Box::new(context),
                    stack_base,
                    stack_pages,
                    parked_on: None,
                    wake: None,
                    hooks: core::array::from_fn(|_| None),
                    pending_timer: None,
                    pending_timeout: Timeout::None,
                    exit_payload: None,
                    pending_signals: 0,
                    block_signals: false,
                    last_cpu: None,
                }),
                suspend_waitq: Arc::new(WaitQueue::new()),
                block_waitq: Arc::new(WaitQueue::new()),
                death_waitq: Arc::new(WaitQueue::new()),
                destroy_waitq: Arc::new(WaitQueue::new()),
            });
            table.slots[slot as usize].occupant = Some(Arc::clone(&thread));
            thread
        })
    }

    /// Resolve a handle. Stale generations miss cleanly.
    pub fn lookup(&self, id: ThreadId) -> Option<Arc<Thread>> {
        self.inner.lock(|table| {
            let slot = table.slots.get(id.slot as usize)?;
            if slot.generation != id.generation {
                return None;
            }
            slot.occupant.clone()
        })
    }

    /// Tear a thread out of the arena (deferred-reaper path). The slot's
    /// generation advances so stale handles miss.
    pub fn remove(&self, id: ThreadId) -> Option<Arc<Thread>> {
        let thread = self.inner.lock(|table| {
            let slot = table.slots.get_mut(id.slot as usize)?;
            if slot.generation != id.generation {
                return None;
            }
            let occupant = slot.occupant.take()?;
            slot.generation = slot.generation.wrapping_add(1);
            table.free.push(id.slot);
            Some(occupant)
        })?;
        thread.destroy_waitq.wake_all();
        Some(thread)
    }

    /// Live threads.
    pub fn len(&self) -> usize {
        self.inner
            .lock(|table| table.slots.iter().filter(|s| s.occupant.is_some()).count())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

//--------------------------------------------------------------------------------------------------
// Testing
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use {
        super::*,
        machine::{hosted::HostedClock, memory::Address},
        std::sync::atomic::AtomicU32,
    };

    fn table() -> ThreadTable {
        let clock = HostedClock::leak();
        let timers: &'static TimerQueue = Box::leak(Box::new(TimerQueue::new(clock)));
        ThreadTable::new(timers)
    }

    fn spawn(table: &ThreadTable) -> Arc<Thread> {
        table.create(ExecutionContext::default(), Address::new(0), 0, false)
    }

    #[test]
    fn fresh_threads_start_suspended() {
        let table = table();
        let t = spawn(&table);
        assert_eq!(t.execution_state(), ExecState::Suspended);
        assert_eq!(t.ref_count(), 1);

        t.resume().unwrap();
        assert_eq!(t.execution_state(), ExecState::Running);
        assert_eq!(t.resume(), Err(Status::AlreadyInProgress));
    }

    #[test]
    fn dead_is_terminal() {
        let table = table();
        let t = spawn(&table);
        t.kill().unwrap();
        assert_eq!(t.execution_state(), ExecState::Dead);
        assert_eq!(t.kill(), Err(Status::AlreadyInProgress));
        assert_eq!(t.resume(), Err(Status::PermanentOutage));
        assert_eq!(t.suspend(), Err(Status::PermanentOutage));
        assert_eq!(t.block(), Err(Status::PermanentOutage));
    }

    #[test]
    fn block_nests() {
        let table = table();
        let t = spawn(&table);
        t.resume().unwrap();

        t.block().unwrap();
        t.block().unwrap();
        assert!(!t.should_run());
        t.unblock().unwrap();
        assert!(!t.should_run());
        t.unblock().unwrap();
        assert!(t.should_run());
        assert_eq!(t.unblock(), Err(Status::InvalidArgument));
    }

    #[test]
    fn stale_handles_miss() {
        let table = table();
        let t = spawn(&table);
        let id = t.id();
        assert!(table.lookup(id).is_some());

        table.remove(id).unwrap();
        assert!(table.lookup(id).is_none());

        // The slot is recycled under a new generation.
        let t2 = spawn(&table);
        assert_eq!(t2.id().slot(), id.slot());
        assert_ne!(t2.id(), id);
        assert!(table.lookup(t2.id()).is_some());
        assert!(table.lookup(id).is_none());
    }

    #[test]
    fn hook_slots_scan_in_order_and_stop_on_handled() {
        let table = table();
        let t = spawn(&table);
        let fired = Arc::new(AtomicU32::new(0));

        let early = Arc::clone(&fired);
        let index0 = t
            .register_hooks(HookSlot {
                owner_id: 1,
                resume: Some(Arc::new(move |_| {
                    early.fetch_or(0b01, Ordering::SeqCst);
                    HookResult::Handled
                })),
                ..Default::default()
            })
            .unwrap();
        let late = Arc::clone(&fired);
        let index1 = t
            .register_hooks(HookSlot {
                owner_id: 2,
                resume: Some(Arc::new(move |_| {
                    late.fetch_or(0b10, Ordering::SeqCst);
                    HookResult::Handled
                })),
                ..Default::default()
            })
            .unwrap();
        assert_eq!((index0, index1), (0, 1));

        t.resume().unwrap();
        // Slot 0 handled the transition; slot 1 never ran.
        assert_eq!(fired.load(Ordering::SeqCst), 0b01);

        assert!(t.unregister_hooks(1));
        t.suspend().unwrap();
        t.resume().unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 0b11);
    }

    #[test]
    fn fault_hooks_deliver_by_kind() {
        let table = table();
        let t = spawn(&table);
        let hits = Arc::new(AtomicU32::new(0));

        let h = Arc::clone(&hits);
        t.register_hooks(HookSlot {
            owner_id: 9,
            page_fault: Some(Arc::new(move |_| {
                h.fetch_add(1, Ordering::SeqCst);
                HookResult::Handled
            })),
            ..Default::default()
        })
        .unwrap();

        assert_eq!(t.deliver_fault(HookKind::PageFault), HookResult::Handled);
        // No one subscribed to bus errors.
        assert_eq!(t.deliver_fault(HookKind::BusError), HookResult::NotHandled);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn only_eight_hook_slots() {
        let table = table();
        let t = spawn(&table);
        for owner in 0..HOOK_SLOTS as u64 {
            assert!(t
                .register_hooks(HookSlot {
                    owner_id: owner,
                    ..Default::default()
                })
                .is_some());
        }
        assert!(t
            .register_hooks(HookSlot {
                owner_id: 99,
                ..Default::default()
            })
            .is_none());
    }

    #[test]
    fn wake_before_commit_is_not_lost() {
        let table = table();
        let t = spawn(&table);
        t.resume().unwrap();

        let queue = Arc::new(WaitQueue::new());
        t.prepare_wait(&queue, Timeout::None).unwrap();
        // The event fires while the thread is still on its way down.
        queue.wake_all();
        // Committing returns immediately with the normal outcome.
        t.commit_wait().unwrap();
        assert!(t.parked_on().is_none());
        assert_eq!(t.execution_state(), ExecState::Running);
    }

    #[test]
    fn cancel_wait_unregisters() {
        let table = table();
        let t = spawn(&table);
        t.resume().unwrap();

        let queue = Arc::new(WaitQueue::new());
        t.prepare_wait(&queue, Timeout::RelativeNs(1_000_000)).unwrap();
        assert!(t.parked_on().is_some());
        t.cancel_wait();
        assert!(t.parked_on().is_none());
        assert_eq!(queue.wake_all(), 0);
    }

    #[test]
    fn signals_respect_block_flag() {
        let table = table();
        let t = spawn(&table);
        t.resume().unwrap();

        t.set_block_signals(true);
        t.post_signal(3).unwrap();
        assert!(!t.flags().contains(ThreadFlags::INTERRUPTED));

        t.set_block_signals(false);
        t.post_signal(7).unwrap();
        assert!(t.flags().contains(ThreadFlags::INTERRUPTED));
        assert_eq!(t.take_signals(), (1 << 3) | (1 << 7));
        assert_eq!(t.take_signals(), 0);

        assert_eq!(t.post_signal(64), Err(Status::InvalidArgument));
    }

    #[test]
    fn suspend_and_wait_observes_the_suspension() {
        let table = table();
        let target = spawn(&table);
        let caller = spawn(&table);
        target.resume().unwrap();
        caller.resume().unwrap();

        target.suspend_and_wait(&caller, Timeout::None).unwrap();
        assert_eq!(target.execution_state(), ExecState::Suspended);
        // Waiting on an already-suspended thread is a no-op.
        target.suspend_and_wait(&caller, Timeout::None).unwrap();
    }

    #[test]
    fn exit_records_payload_and_kills() {
        let table = table();
        let t = spawn(&table);
        t.resume().unwrap();

        t.exit(b"done", true);
        assert_eq!(t.execution_state(), ExecState::Dead);
        assert!(t.flags().contains(ThreadFlags::EXIT_DATA_COPIED));
        assert_eq!(t.exit_payload().as_deref(), Some(&b"done"[..]));
    }
}

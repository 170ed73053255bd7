/*
 * SPDX-License-Identifier: BlueOak-1.0.0
 * Copyright (c) Anillo OS authors
 */

//! Global kernel state.
//!
//! Everything the nucleus owns hangs off one [`Kernel`] value constructed
//! by [`kernel_init`] before any thread runs: frame regions from the
//! firmware memory map, the kernel address space and pool, the timer
//! queue, the thread arena, the per-CPU scheduler, the global namespace,
//! and the futex table. After construction the globals are immutable or
//! individually locked; there is no other mutable global state.

use {
    crate::{
        error::Result,
        ipc::{
            channel::{self, ChannelEnd},
            monitor::FutexTable,
            server_channel::Namespace,
        },
        mm::{AddressSpace, FrameAllocator, MemoryPool},
        process::{Descriptor, Process, ProcessId, BINARY_CHANNEL_DESCRIPTOR},
        sched::{
            deferred::DeferredReaper,
            scheduler::Scheduler,
            thread::{Thread, ThreadTable},
            timer::TimerQueue,
        },
    },
    alloc::{boxed::Box, collections::BTreeMap, sync::Arc, vec::Vec},
    core::{
        sync::atomic::{AtomicU64, Ordering},
        time::Duration,
    },
    machine::{
        cpu::{interface::CpuOps, ExecutionContext, InterruptFrame},
        memory::{
            mmu::{
                interface::{DirectMap, TlbMaintenance},
                PageFlags,
            },
            PhysAddr, VirtAddr,
        },
        synchronization::{interface::Mutex, IRQSafeSpinLock},
        time::interface::MonotonicClock,
    },
    once_cell::race::OnceBox,
};

//--------------------------------------------------------------------------------------------------
// Public Definitions
//--------------------------------------------------------------------------------------------------

/// The machine seams, as registered by the architecture shim (or the
/// hosted model).
#[derive(Copy, Clone)]
pub struct Machine {
    pub dmap: &'static dyn DirectMap,
    pub tlb: &'static dyn TlbMaintenance,
    pub clock: &'static dyn MonotonicClock,
    pub cpu: &'static dyn CpuOps,
}

/// Boot-time layout handed over by the loader.
pub struct BootLayout {
    /// Usable RAM spans from the firmware memory map.
    pub memory_map: Vec<(PhysAddr, usize)>,
    /// Virtual span managed for kernel allocations.
    pub kernel_virt_base: VirtAddr,
    pub kernel_virt_pages: usize,
    /// Virtual span handed to each user address space.
    pub user_virt_base: VirtAddr,
    pub user_virt_pages: usize,
    /// Preemption quantum.
    pub quantum: Duration,
}

/// What a process loader supplies: segments to map and the initial thread
/// context (PC, and the stack pointer with the entry already arranged the
/// way the architecture expects).
pub struct ProcessImage {
    pub segments: Vec<LoadSegment>,
    pub entry_pc: u64,
    pub entry_sp: u64,
}

/// One (physical source, virtual destination) load pair.
pub struct LoadSegment {
    pub source: PhysAddr,
    pub destination: VirtAddr,
    pub pages: usize,
    pub flags: PageFlags,
}

/// The tri-subsystem nucleus state.
pub struct Kernel {
    pub machine: Machine,
    pub frames: &'static FrameAllocator,
    pub kernel_space: Arc<AddressSpace>,
    pub pool: MemoryPool,
    pub timers: &'static TimerQueue,
    pub threads: ThreadTable,
    pub scheduler: &'static Scheduler,
    pub reaper: DeferredReaper,
    pub global_namespace: Namespace,
    pub futexes: &'static FutexTable,
    user_virt: (VirtAddr, usize),
    processes: IRQSafeSpinLock<BTreeMap<ProcessId, Arc<Process>>>,
    next_process: AtomicU64,
}

//--------------------------------------------------------------------------------------------------
// Public Code
//--------------------------------------------------------------------------------------------------

static KERNEL: OnceBox<&'static Kernel> = OnceBox::new();

/// Construct the kernel and install it as the global instance. Called
/// once from the boot path, before any thread runs.
pub fn kernel_init(machine: Machine, layout: BootLayout) -> &'static Kernel {
    let kernel = Kernel::new(machine, layout);
    KERNEL
        .set(Box::new(kernel))
        .unwrap_or_else(|_| panic!("kernel initialized twice"));
    kernel
}

/// The installed kernel, if [`kernel_init`] has run.
pub fn kernel() -> Option<&'static Kernel> {
    KERNEL.get().copied()
}

impl Kernel {
    /// Construct kernel state without installing it globally (tests build
    /// several).
    pub fn new(machine: Machine, layout: BootLayout) -> &'static Kernel {
        let frames: &'static FrameAllocator = Box::leak(Box::new(FrameAllocator::new(
            machine.dmap,
            &layout.memory_map,
        )));
        let kernel_space = Arc::new(
            AddressSpace::new(
                machine.dmap,
                machine.tlb,
                frames,
                layout.kernel_virt_base,
                layout.kernel_virt_pages,
                None,
            )
            .expect("no memory for the kernel address space"),
        );
        let pool = MemoryPool::new(Arc::clone(&kernel_space), frames, machine.dmap);
        let timers: &'static TimerQueue = Box::leak(Box::new(TimerQueue::new(machine.clock)));
        let scheduler: &'static Scheduler =
            Box::leak(Box::new(Scheduler::new(machine.cpu, layout.quantum)));
        let futexes: &'static FutexTable = Box::leak(Box::new(FutexTable::new(machine.dmap)));

        let kernel = Box::leak(Box::new(Kernel {
            machine,
            frames,
            kernel_space,
            pool,
            timers,
            threads: ThreadTable::new(timers),
            scheduler,
            reaper: DeferredReaper::new(),
            global_namespace: Namespace::new(),
            futexes,
            user_virt: (layout.user_virt_base, layout.user_virt_pages),
            processes: IRQSafeSpinLock::new(BTreeMap::new()),
            next_process: AtomicU64::new(1),
        }));
        log::debug!(
            "kernel up: {} free pages, {} cpus",
            kernel.frames.free_pages(),
            machine.cpu.count()
        );
        kernel
    }

    //----------------------------------------------------------------------------------------------
    // Threads
    //----------------------------------------------------------------------------------------------

    /// Create a thread (suspended) and hand it to the scheduler.
    pub fn spawn_thread(
        &'static self,
        context: ExecutionContext,
        stack_base: VirtAddr,
        stack_pages: usize,
        deallocate_stack_on_exit: bool,
    ) -> Arc<Thread> {
        let thread = self
            .threads
            .create(context, stack_base, stack_pages, deallocate_stack_on_exit);
        self.scheduler.adopt(&thread);
        thread
    }

    /// Drop a reference; queue the thread for deferred reclamation when
    /// the count reaches zero.
    pub fn release_thread(&self, thread: &Arc<Thread>) {
        if thread.release() == 0 {
            self.reaper.schedule(thread.id());
        }
    }

    //----------------------------------------------------------------------------------------------
    // Tick
    //----------------------------------------------------------------------------------------------

    /// The preemption interrupt: expire timers, then hand the frame to the
    /// scheduler's delayed switch path.
    pub fn tick(&self, frame: &mut InterruptFrame) {
        self.timers.fire_due();
        self.scheduler.preempt(frame);
    }

    //----------------------------------------------------------------------------------------------
    // Processes
    //----------------------------------------------------------------------------------------------

    /// Build a process from a loader image. Returns the process plus the
    /// loader's end of the binary channel; the process's own end sits at
    /// descriptor 0.
    pub fn create_process(
        &'static self,
        image: &ProcessImage,
        parent: Option<&Process>,
    ) -> Result<(Arc<Process>, Arc<ChannelEnd>)> {
        let (user_base, user_pages) = self.user_virt;
        let space = Arc::new(AddressSpace::new(
            self.machine.dmap,
            self.machine.tlb,
            self.frames,
            user_base,
            user_pages,
            Some(Arc::clone(&self.kernel_space)),
        )?);

        for segment in &image.segments {
            space.map_fixed(
                segment.source,
                segment.destination,
                segment.pages,
                segment.flags,
            )?;
        }

        let id = ProcessId(self.next_process.fetch_add(1, Ordering::Relaxed));
        let process = Process::new(
            id,
            space,
            parent.map(|p| Arc::clone(p.children_namespace())),
        );

        let mut context = ExecutionContext::at_entry(image.entry_pc, image.entry_sp);
        context.privileged = false;
        let thread = self.spawn_thread(context, VirtAddr::new(image.entry_sp as usize), 0, false);
        process.add_thread(thread.id());

        let (process_end, loader_end) = channel::create_pair();
        process
            .with_descriptors(|d| d.insert_at(BINARY_CHANNEL_DESCRIPTOR, Descriptor::Channel(process_end)))
            .expect("fresh descriptor table has index 0 free");

        self.processes
            .lock(|p| p.insert(id, Arc::clone(&process)));
        log::debug!("process {:?} created with {:?}", id, thread.id());
        Ok((process, loader_end))
    }

    pub fn process(&self, id: ProcessId) -> Option<Arc<Process>> {
        self.processes.lock(|p| p.get(&id).cloned())
    }

    pub fn remove_process(&self, id: ProcessId) -> Option<Arc<Process>> {
        self.processes.lock(|p| p.remove(&id))
    }
}

//--------------------------------------------------------------------------------------------------
// Testing
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use {
        super::*,
        machine::{
            hosted::{HostedClock, HostedCpu, HostedMemory},
            memory::{Address, Granule},
        },
    };

    pub(crate) fn hosted_kernel(phys_pages: usize) -> &'static Kernel {
        let mem = HostedMemory::leak(phys_pages);
        let machine = Machine {
            dmap: mem,
            tlb: mem,
            clock: HostedClock::leak(),
            cpu: Box::leak(Box::new(HostedCpu::default())),
        };
        let (base, pages) = mem.boot_region();
        Kernel::new(
            machine,
            BootLayout {
                memory_map: alloc::vec![(base, pages)],
                kernel_virt_base: Address::new(0xffff_9000_0000_0000),
                kernel_virt_pages: 256,
                user_virt_base: Address::new(0x0000_2000_0000),
                user_virt_pages: 256,
                quantum: Duration::from_millis(1),
            },
        )
    }

    #[test]
    fn kernel_builds_from_boot_layout() {
        let k = hosted_kernel(512);
        assert!(k.frames.free_pages() > 0);
        assert!(k.threads.is_empty());
        assert!(k.reaper.is_idle());
    }

    #[test]
    fn thread_release_feeds_the_reaper() {
        let k = hosted_kernel(512);
        let t = k.spawn_thread(ExecutionContext::default(), Address::new(0), 0, false);
        let id = t.id();
        t.kill().unwrap();
        k.release_thread(&t);
        drop(t);
        assert_eq!(k.reaper.run_pending(&k.threads), 1);
        assert!(k.threads.lookup(id).is_none());
    }

    #[test]
    fn process_creation_wires_binary_channel_and_segments() {
        let k = hosted_kernel(512);

        // Stage a page of "binary" in physical memory.
        let source = k.frames.allocate(1).unwrap();
        unsafe { *k.machine.dmap.ptr_of(source) = 0xEB };

        let destination = Address::new(0x0000_2000_0000 + 4 * Granule::SIZE);
        let image = ProcessImage {
            segments: alloc::vec![LoadSegment {
                source,
                destination,
                pages: 1,
                flags: PageFlags::UNPRIVILEGED,
            }],
            entry_pc: destination.as_usize() as u64,
            entry_sp: 0x0000_2000_0000 as u64 + 64 * Granule::SIZE as u64,
        };
        let (process, loader_end) = k.create_process(&image, None).unwrap();

        // Segment is mapped where asked.
        assert_eq!(process.space().translate(destination), Some(source));
        // Exactly one descriptor: the binary channel at index 0.
        assert_eq!(process.with_descriptors(|d| d.len()), 1);
        let binary = process.channel(BINARY_CHANNEL_DESCRIPTOR).unwrap();
        assert_eq!(
            binary.peer().map(|p| p.endpoint_id()),
            Some(loader_end.endpoint_id())
        );
        // One initial thread, suspended until the loader resumes it.
        assert_eq!(process.threads().len(), 1);
    }

    #[test]
    fn global_install_is_once() {
        // Only exercise the accessor; the global may or may not be set
        // depending on test order, and double-install panics are the
        // documented contract.
        let _ = kernel();
    }
}

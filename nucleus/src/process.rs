/*
 * SPDX-License-Identifier: BlueOak-1.0.0
 * Copyright (c) Anillo OS authors
 */

//! Processes and descriptor tables.
//!
//! A process owns an address space, a descriptor table mapping small
//! integers to kernel objects, a local server-channel namespace, and the
//! namespace it exposes to its children. A freshly loaded binary finds
//! exactly one descriptor populated: the binary channel, at index 0.

use {
    crate::{
        error::{Result, Status},
        ipc::{
            channel::ChannelEnd,
            message::SharedMapping,
            server_channel::{Namespace, Realm, ServerChannel},
        },
        mm::AddressSpace,
        sched::thread::ThreadId,
    },
    alloc::{sync::Arc, vec::Vec},
    machine::synchronization::{interface::Mutex, IRQSafeSpinLock},
};

//--------------------------------------------------------------------------------------------------
// Public Definitions
//--------------------------------------------------------------------------------------------------

/// Process identifier.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProcessId(pub u64);

/// The descriptor index every process's binary channel occupies.
pub const BINARY_CHANNEL_DESCRIPTOR: u64 = 0;

/// A kernel object reachable from user space through a small integer.
#[derive(Clone)]
pub enum Descriptor {
    Channel(Arc<ChannelEnd>),
    ServerChannel(Arc<ServerChannel>),
    Mapping(Arc<SharedMapping>),
}

/// Per-process descriptor table.
#[derive(Default)]
pub struct DescriptorTable {
    slots: Vec<Option<Descriptor>>,
}

/// A user process.
pub struct Process {
    id: ProcessId,
    space: Arc<AddressSpace>,
    descriptors: IRQSafeSpinLock<DescriptorTable>,
    /// This process's own (local-realm) namespace.
    namespace: Namespace,
    /// Namespace this process exposes to its children.
    children_namespace: Arc<Namespace>,
    /// The parent's children-namespace, if there is a parent.
    parent_namespace: Option<Arc<Namespace>>,
    threads: IRQSafeSpinLock<Vec<ThreadId>>,
}

//--------------------------------------------------------------------------------------------------
// Public Code
//--------------------------------------------------------------------------------------------------

impl DescriptorTable {
    /// Store an object in the lowest free slot.
    pub fn insert(&mut self, descriptor: Descriptor) -> u64 {
        match self.slots.iter().position(Option::is_none) {
            Some(free) => {
                self.slots[free] = Some(descriptor);
                free as u64
            }
            None => {
                self.slots.push(Some(descriptor));
                (self.slots.len() - 1) as u64
            }
        }
    }

    /// Store an object at a caller-chosen slot (boot-time wiring).
    pub fn insert_at(&mut self, did: u64, descriptor: Descriptor) -> Result<()> {
        let index = did as usize;
        if self.slots.len() <= index {
            self.slots.resize(index + 1, None);
        }
        if self.slots[index].is_some() {
            return Err(Status::AlreadyInProgress);
        }
        self.slots[index] = Some(descriptor);
        Ok(())
    }

    pub fn get(&self, did: u64) -> Option<Descriptor> {
        self.slots.get(did as usize)?.clone()
    }

    /// Remove and return; the caller owns the object afterwards.
    pub fn take(&mut self, did: u64) -> Option<Descriptor> {
        self.slots.get_mut(did as usize)?.take()
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Process {
    pub(crate) fn new(
        id: ProcessId,
        space: Arc<AddressSpace>,
        parent_namespace: Option<Arc<Namespace>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            space,
            descriptors: IRQSafeSpinLock::new(DescriptorTable::default()),
            namespace: Namespace::new(),
            children_namespace: Arc::new(Namespace::new()),
            parent_namespace,
            threads: IRQSafeSpinLock::new(Vec::new()),
        })
    }

    pub fn id(&self) -> ProcessId {
        self.id
    }

    pub fn space(&self) -> &Arc<AddressSpace> {
        &self.space
    }

    /// Run `f` against the descriptor table.
    pub fn with_descriptors<R>(&self, f: impl FnOnce(&mut DescriptorTable) -> R) -> R {
        self.descriptors.lock(f)
    }

    /// Resolve a descriptor to a channel endpoint.
    pub fn channel(&self, did: u64) -> Result<Arc<ChannelEnd>> {
        match self.with_descriptors(|d| d.get(did)) {
            Some(Descriptor::Channel(end)) => Ok(end),
            Some(_) => Err(Status::InvalidArgument),
            None => Err(Status::NoSuchResource),
        }
    }

    /// Resolve a descriptor to a server channel.
    pub fn server_channel(&self, did: u64) -> Result<Arc<ServerChannel>> {
        match self.with_descriptors(|d| d.get(did)) {
            Some(Descriptor::ServerChannel(server)) => Ok(server),
            Some(_) => Err(Status::InvalidArgument),
            None => Err(Status::NoSuchResource),
        }
    }

    /// The namespace a realm resolves to, from this process's point of
    /// view. `Global` is owned by the kernel and resolved there.
    pub fn realm_namespace(&self, realm: Realm) -> Result<&Namespace> {
        match realm {
            Realm::Local => Ok(&self.namespace),
            Realm::Children => Ok(&self.children_namespace),
            Realm::Parent => self
                .parent_namespace
                .as_deref()
                .ok_or(Status::NoSuchResource),
            Realm::Global => Err(Status::InvalidArgument),
        }
    }

    /// Namespace handed to children as their `Parent` realm.
    pub fn children_namespace(&self) -> &Arc<Namespace> {
        &self.children_namespace
    }

    pub fn add_thread(&self, thread: ThreadId) {
        self.threads.lock(|t| t.push(thread));
    }

    pub fn threads(&self) -> Vec<ThreadId> {
        self.threads.lock(|t| t.clone())
    }
}

//--------------------------------------------------------------------------------------------------
// Testing
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use {super::*, crate::ipc::channel::create_pair};

    #[test]
    fn descriptor_slots_recycle_lowest_first() {
        let mut table = DescriptorTable::default();
        let (a, _keep_a) = create_pair();
        let (b, _keep_b) = create_pair();
        let (c, _keep_c) = create_pair();

        let d0 = table.insert(Descriptor::Channel(a));
        let d1 = table.insert(Descriptor::Channel(b));
        assert_eq!((d0, d1), (0, 1));

        assert!(table.take(d0).is_some());
        assert!(table.take(d0).is_none());
        let d2 = table.insert(Descriptor::Channel(c));
        assert_eq!(d2, 0);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn insert_at_refuses_occupied_slots() {
        let mut table = DescriptorTable::default();
        let (a, _keep_a) = create_pair();
        let (b, _keep_b) = create_pair();

        table
            .insert_at(BINARY_CHANNEL_DESCRIPTOR, Descriptor::Channel(a))
            .unwrap();
        assert_eq!(
            table.insert_at(BINARY_CHANNEL_DESCRIPTOR, Descriptor::Channel(b)),
            Err(Status::AlreadyInProgress)
        );
    }
}

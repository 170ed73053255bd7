/*
 * SPDX-License-Identifier: BlueOak-1.0.0
 * Copyright (c) Anillo OS authors
 */

//! Named rendezvous points.
//!
//! A server channel lives in a realm's namespace under a unique name.
//! Connecting atomically creates a channel pair, queues one end for the
//! server (waking a blocked accepter) and hands the other end back to the
//! caller. Closing the server wakes every pending accepter with a
//! permanent outage.

use {
    super::channel::{self, ChannelEnd},
    crate::{
        error::{Result, Status},
        sched::{
            thread::{Thread, Timeout},
            wait_queue::WaitQueue,
        },
    },
    alloc::{
        collections::{BTreeMap, VecDeque},
        string::String,
        sync::Arc,
    },
    machine::synchronization::{interface::Mutex, IRQSafeSpinLock},
};

//--------------------------------------------------------------------------------------------------
// Public Definitions
//--------------------------------------------------------------------------------------------------

/// Scope within which a server-channel name resolves.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Realm {
    /// The calling process's own namespace.
    Local,
    /// The system-wide namespace.
    Global,
    /// The parent process's namespace.
    Parent,
    /// The shared namespace the process exposes to its children.
    Children,
}

/// A named rendezvous.
pub struct ServerChannel {
    name: String,
    inner: IRQSafeSpinLock<ServerInner>,
    accept_waitq: Arc<WaitQueue>,
}

impl core::fmt::Debug for ServerChannel {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ServerChannel")
            .field("name", &self.name)
            .finish()
    }
}

/// One realm's name registry.
pub struct Namespace {
    entries: IRQSafeSpinLock<BTreeMap<String, Arc<ServerChannel>>>,
}

//--------------------------------------------------------------------------------------------------
// Private Definitions
//--------------------------------------------------------------------------------------------------

struct ServerInner {
    pending: VecDeque<Arc<ChannelEnd>>,
    closed: bool,
}

//--------------------------------------------------------------------------------------------------
// Public Code
//--------------------------------------------------------------------------------------------------

impl ServerChannel {
    fn new(name: String) -> Arc<Self> {
        Arc::new(Self {
            name,
            inner: IRQSafeSpinLock::new(ServerInner {
                pending: VecDeque::new(),
                closed: false,
            }),
            accept_waitq: Arc::new(WaitQueue::new()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Atomically create a connected pair: one end queued for the server,
    /// the other returned to the caller.
    pub fn connect(&self) -> Result<Arc<ChannelEnd>> {
        let (server_end, client_end) = channel::create_pair();
        self.inner.lock(|i| {
            if i.closed {
                return Err(Status::PermanentOutage);
            }
            i.pending.push_back(server_end);
            Ok(())
        })?;
        self.accept_waitq.wake_one();
        log::trace!("client connected to '{}'", self.name);
        Ok(client_end)
    }

    /// Dequeue a pending client, parking if there is none (unless
    /// `no_wait`).
    pub fn accept(
        &self,
        current: &Arc<Thread>,
        no_wait: bool,
        timeout: Timeout,
    ) -> Result<Arc<ChannelEnd>> {
        loop {
            enum Verdict {
                Client(Arc<ChannelEnd>),
                Closed,
                Empty,
            }
            let verdict = self.inner.lock(|i| {
                if let Some(client) = i.pending.pop_front() {
                    Verdict::Client(client)
                } else if i.closed {
                    Verdict::Closed
                } else {
                    Verdict::Empty
                }
            });

            match verdict {
                Verdict::Client(client) => return Ok(client),
                Verdict::Closed => return Err(Status::PermanentOutage),
                Verdict::Empty if no_wait => return Err(Status::WouldBlock),
                Verdict::Empty => {
                    current.prepare_wait(&self.accept_waitq, timeout)?;
                    let wait = self.inner.lock(|i| i.pending.is_empty() && !i.closed);
                    if wait {
                        current.commit_wait()?;
                    } else {
                        current.cancel_wait();
                    }
                }
            }
        }
    }

    /// Pending, not-yet-accepted clients.
    pub fn backlog(&self) -> usize {
        self.inner.lock(|i| i.pending.len())
    }

    /// Tear the rendezvous down; every parked accepter observes
    /// `PermanentOutage`.
    pub fn close(&self) {
        self.inner.lock(|i| {
            i.closed = true;
            i.pending.clear();
        });
        self.accept_waitq.wake_all();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock(|i| i.closed)
    }
}

impl Namespace {
    pub fn new() -> Self {
        Self {
            entries: IRQSafeSpinLock::new(BTreeMap::new()),
        }
    }

    /// Register a server channel under `name`. One per name.
    pub fn create(&self, name: &str) -> Result<Arc<ServerChannel>> {
        if name.is_empty() {
            return Err(Status::InvalidArgument);
        }
        self.entries.lock(|entries| {
            if entries.contains_key(name) {
                // Name in use.
                return Err(Status::AlreadyInProgress);
            }
            let server = ServerChannel::new(String::from(name));
            entries.insert(String::from(name), Arc::clone(&server));
            Ok(server)
        })
    }

    /// Resolve a name.
    pub fn lookup(&self, name: &str) -> Result<Arc<ServerChannel>> {
        self.entries
            .lock(|entries| entries.get(name).cloned())
            .ok_or(Status::NoSuchResource)
    }

    /// Unregister and close.
    pub fn remove(&self, name: &str) -> Result<()> {
        let server = self
            .entries
            .lock(|entries| entries.remove(name))
            .ok_or(Status::NoSuchResource)?;
        server.close();
        Ok(())
    }
}

impl Default for Namespace {
    fn default() -> Self {
        Self::new()
    }
}

//--------------------------------------------------------------------------------------------------
// Testing
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            ipc::{
                channel::{ReceiveFlags, SendFlags},
                message::Message,
            },
            sched::{thread::ThreadTable, timer::TimerQueue},
        },
        machine::{cpu::ExecutionContext, hosted::HostedClock, memory::Address},
    };

    fn current() -> Arc<Thread> {
        let clock = HostedClock::leak();
        let timers: &'static TimerQueue = Box::leak(Box::new(TimerQueue::new(clock)));
        let table = ThreadTable::new(timers);
        let t = table.create(ExecutionContext::default(), Address::new(0), 0, false);
        t.resume().unwrap();
        core::mem::forget(table);
        t
    }

    #[test]
    fn names_are_exclusive_per_namespace() {
        let ns = Namespace::new();
        ns.create("svc.console").unwrap();
        assert_eq!(ns.create("svc.console").unwrap_err(), Status::AlreadyInProgress);
        assert_eq!(ns.create("").unwrap_err(), Status::InvalidArgument);
        assert!(ns.lookup("svc.console").is_ok());
        assert_eq!(ns.lookup("svc.missing").unwrap_err(), Status::NoSuchResource);
    }

    #[test]
    fn connect_then_accept_yields_connected_pair() {
        let t = current();
        let ns = Namespace::new();
        let server = ns.create("svc.echo").unwrap();

        let client_end = server.connect().unwrap();
        assert_eq!(server.backlog(), 1);
        let server_end = server.accept(&t, true, Timeout::None).unwrap();
        assert_eq!(server.backlog(), 0);

        // The two ends really are peers.
        client_end
            .send(&t, Message::new(&b"hello"[..]), SendFlags::NO_WAIT, Timeout::None)
            .unwrap();
        let got = server_end
            .receive(&t, ReceiveFlags::NO_WAIT, Timeout::None)
            .unwrap();
        assert_eq!(got.body(), b"hello");
    }

    #[test]
    fn accept_without_clients_would_block() {
        let t = current();
        let ns = Namespace::new();
        let server = ns.create("svc.idle").unwrap();
        assert_eq!(
            server.accept(&t, true, Timeout::None).unwrap_err(),
            Status::WouldBlock
        );
    }

    #[test]
    fn close_fails_accepters_and_connects() {
        let t = current();
        let ns = Namespace::new();
        let server = ns.create("svc.gone").unwrap();
        server.connect().unwrap();

        ns.remove("svc.gone").unwrap();
        assert!(server.is_closed());
        assert_eq!(
            server.accept(&t, true, Timeout::None).unwrap_err(),
            Status::PermanentOutage
        );
        assert_eq!(server.connect().unwrap_err(), Status::PermanentOutage);
        // The name is free again.
        ns.create("svc.gone").unwrap();
    }
}

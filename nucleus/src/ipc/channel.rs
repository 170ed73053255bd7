/*
 * SPDX-License-Identifier: BlueOak-1.0.0
 * Copyright (c) Anillo OS authors
 */

//! Bidirectional capability channels.
//!
//! A channel is a pair of endpoints, each with a bounded inbound FIFO fed
//! exclusively by its peer. Message IDs are minted per pair under the
//! receiving queue's lock, so IDs on an endpoint are strictly increasing
//! in delivery order. Peer-close is sticky: pending messages drain, then
//! receives report the outage forever; sends fail immediately.
//!
//! Blocking follows the prepare/re-check/commit wait protocol, so a wake
//! arriving while a sender or receiver is still on its way into the queue
//! is never lost.

use {
    super::{
        message::{ConversationId, Message, MessageId},
        monitor::{ChannelEvents, Monitor},
    },
    crate::{
        error::{Result, Status},
        sched::{
            thread::{Thread, Timeout},
            wait_queue::WaitQueue,
        },
    },
    alloc::{
        collections::VecDeque,
        sync::{Arc, Weak},
    },
    bitflags::bitflags,
    core::sync::atomic::{AtomicU64, Ordering},
    machine::synchronization::{interface::Mutex, IRQSafeSpinLock},
};

//--------------------------------------------------------------------------------------------------
// Public Definitions
//--------------------------------------------------------------------------------------------------

/// Inbound queue depth of each endpoint; the producer's credit budget.
pub const QUEUE_DEPTH: usize = 16;

bitflags! {
    /// Flags for [`ChannelEnd::send`].
    pub struct SendFlags: u32 {
        /// Fail with `WouldBlock` instead of parking on a full queue.
        const NO_WAIT            = 1 << 0;
        /// Mint a fresh conversation ID and stamp the message with it.
        const START_CONVERSATION = 1 << 1;
    }
}

bitflags! {
    /// Flags for [`ChannelEnd::receive`].
    pub struct ReceiveFlags: u32 {
        /// Fail with `WouldBlock` instead of parking on an empty queue.
        const NO_WAIT = 1 << 0;
    }
}

/// What a successful send reports back.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SendReceipt {
    pub message: MessageId,
    pub conversation: ConversationId,
}

/// A rejected send. The message comes back to the caller, so transferred
/// capabilities inside it are not lost.
pub struct SendRejected {
    pub status: Status,
    pub message: Message,
}

/// Pre-receive peek results: enough to size buffers and to re-request the
/// same message.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ReceiveSizes {
    pub body: usize,
    pub attachments: usize,
    pub message: MessageId,
}

/// One endpoint of a channel pair.
pub struct ChannelEnd {
    endpoint_id: u64,
    shared: Arc<ChannelShared>,
    inner: IRQSafeSpinLock<EndInner>,
    message_arrived: Arc<WaitQueue>,
    space_available: Arc<WaitQueue>,
    peer_closed_waitq: Arc<WaitQueue>,
    deleted_waitq: Arc<WaitQueue>,
}

impl core::fmt::Debug for ChannelEnd {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ChannelEnd")
            .field("endpoint_id", &self.endpoint_id)
            .finish()
    }
}

//--------------------------------------------------------------------------------------------------
// Private Definitions
//--------------------------------------------------------------------------------------------------

/// Counters shared by both ends of a pair.
struct ChannelShared {
    next_conversation: AtomicU64,
    next_message: AtomicU64,
}

struct EndInner {
    queue: VecDeque<Message>,
    /// Remaining producer credit for this inbound queue.
    credits: usize,
    peer: Option<Weak<ChannelEnd>>,
    closed: bool,
    peer_closed: bool,
    monitor: Option<Arc<Monitor>>,
}

static NEXT_ENDPOINT_ID: AtomicU64 = AtomicU64::new(1);

enum SendVerdict {
    Sent(SendReceipt),
    Closed,
    Full,
}

enum ReceiveVerdict {
    Got(Message),
    Drained,
    Empty,
}

//--------------------------------------------------------------------------------------------------
// Public Code
//--------------------------------------------------------------------------------------------------

/// Create a connected pair of endpoints.
pub fn create_pair() -> (Arc<ChannelEnd>, Arc<ChannelEnd>) {
    let shared = Arc::new(ChannelShared {
        next_conversation: AtomicU64::new(1),
        next_message: AtomicU64::new(1),
    });
    let make = |shared: &Arc<ChannelShared>| {
        Arc::new(ChannelEnd {
            endpoint_id: NEXT_ENDPOINT_ID.fetch_add(1, Ordering::Relaxed),
            shared: Arc::clone(shared),
            inner: IRQSafeSpinLock::new(EndInner {
                queue: VecDeque::new(),
                credits: QUEUE_DEPTH,
                peer: None,
                closed: false,
                peer_closed: false,
                monitor: None,
            }),
            message_arrived: Arc::new(WaitQueue::new()),
            space_available: Arc::new(WaitQueue::new()),
            peer_closed_waitq: Arc::new(WaitQueue::new()),
            deleted_waitq: Arc::new(WaitQueue::new()),
        })
    };
    let a = make(&shared);
    let b = make(&shared);
    a.inner.lock(|i| i.peer = Some(Arc::downgrade(&b)));
    b.inner.lock(|i| i.peer = Some(Arc::downgrade(&a)));
    (a, b)
}

impl ChannelEnd {
    pub fn endpoint_id(&self) -> u64 {
        self.endpoint_id
    }

    /// The connected peer, while it still exists.
    pub fn peer(&self) -> Option<Arc<ChannelEnd>> {
        self.inner.lock(|i| i.peer.as_ref().and_then(Weak::upgrade))
    }

    /// Mint a conversation ID. Both peers draw from one per-pair counter,
    /// so IDs never collide and always increase.
    pub fn mint_conversation(&self) -> ConversationId {
        ConversationId(self.shared.next_conversation.fetch_add(1, Ordering::Relaxed))
    }

    /// Move `message` to the peer's inbound queue. On failure the message
    /// is returned alongside the status.
    pub fn send(
        &self,
        current: &Arc<Thread>,
        mut message: Message,
        flags: SendFlags,
        timeout: Timeout,
    ) -> core::result::Result<SendReceipt, SendRejected> {
        let reject = |status, message| Err(SendRejected { status, message });

        let peer = match self.peer() {
            Some(peer) => peer,
            None => return reject(Status::PermanentOutage, message),
        };
        if self.inner.lock(|i| i.closed) {
            return reject(Status::PermanentOutage, message);
        }
        if flags.contains(SendFlags::START_CONVERSATION) {
            if !message.conversation().is_none() {
                return reject(Status::InvalidArgument, message);
            }
            message.set_conversation(self.mint_conversation());
        }

        let mut slot = Some(message);
        loop {
            let verdict = peer.inner.lock(|p| {
                if p.closed {
                    return SendVerdict::Closed;
                }
                if p.credits == 0 {
                    return SendVerdict::Full;
                }
                let mut message = slot.take().expect("message consumed twice");
                // Stamped under the queue lock: IDs increase in queue order.
                message.set_id(MessageId(
                    self.shared.next_message.fetch_add(1, Ordering::Relaxed),
                ));
                let receipt = SendReceipt {
                    message: message.id(),
                    conversation: message.conversation(),
                };
                p.credits -= 1;
                p.queue.push_back(message);
                SendVerdict::Sent(receipt)
            });

            match verdict {
                SendVerdict::Sent(receipt) => {
                    peer.message_arrived.wake_one();
                    peer.notify_monitor(ChannelEvents::MESSAGE_ARRIVED);
                    log::trace!(
                        "endpoint {} -> {}: message {:?}",
                        self.endpoint_id,
                        peer.endpoint_id,
                        receipt.message
                    );
                    return Ok(receipt);
                }
                SendVerdict::Closed => {
                    return reject(Status::PermanentOutage, slot.take().unwrap())
                }
                SendVerdict::Full if flags.contains(SendFlags::NO_WAIT) => {
                    return reject(Status::WouldBlock, slot.take().unwrap())
                }
                SendVerdict::Full => {
                    if let Err(status) = current.prepare_wait(&peer.space_available, timeout) {
                        return reject(status, slot.take().unwrap());
                    }
                    let wait = peer.inner.lock(|p| p.credits == 0 && !p.closed);
                    if wait {
                        if let Err(status) = current.commit_wait() {
                            return reject(status, slot.take().unwrap());
                        }
                    } else {
                        current.cancel_wait();
                    }
                }
            }
        }
    }

    /// Take the next inbound message. Pending messages drain even after
    /// the peer closed; only then does the outage surface.
    pub fn receive(
        &self,
        current: &Arc<Thread>,
        flags: ReceiveFlags,
        timeout: Timeout,
    ) -> Result<Message> {
        loop {
            let verdict = self.inner.lock(|i| match i.queue.pop_front() {
                Some(message) => {
                    i.credits += 1;
                    ReceiveVerdict::Got(message)
                }
                None => {
                    let peer_gone = i.peer.as_ref().map_or(true, |p| p.upgrade().is_none());
                    if i.closed || i.peer_closed || peer_gone {
                        ReceiveVerdict::Drained
                    } else {
                        ReceiveVerdict::Empty
                    }
                }
            });

            match verdict {
                ReceiveVerdict::Got(message) => {
                    self.space_available.wake_one();
                    self.notify_monitor(ChannelEvents::QUEUE_SPACE_AVAILABLE);
                    return Ok(message);
                }
                ReceiveVerdict::Drained => return Err(Status::PermanentOutage),
                ReceiveVerdict::Empty if flags.contains(ReceiveFlags::NO_WAIT) => {
                    return Err(Status::WouldBlock)
                }
                ReceiveVerdict::Empty => {
                    current.prepare_wait(&self.message_arrived, timeout)?;
                    let wait = self
                        .inner
                        .lock(|i| i.queue.is_empty() && !i.closed && !i.peer_closed);
                    if wait {
                        current.commit_wait()?;
                    } else {
                        current.cancel_wait();
                    }
                }
            }
        }
    }

    /// Pre-receive peek: sizes of the next message without consuming it.
    pub fn peek(&self) -> Result<ReceiveSizes> {
        self.inner.lock(|i| match i.queue.front() {
            Some(message) => Ok(ReceiveSizes {
                body: message.body().len(),
                attachments: message.attachments().len(),
                message: message.id(),
            }),
            None => {
                if i.closed || i.peer_closed {
                    Err(Status::PermanentOutage)
                } else {
                    Err(Status::WouldBlock)
                }
            }
        })
    }

    /// Inspect the next message in place without consuming it; the
    /// syscall layer uses this to compute exact wire-format sizes.
    pub fn peek_with<R>(&self, f: impl FnOnce(&Message) -> R) -> Result<R> {
        self.inner.lock(|i| match i.queue.front() {
            Some(message) => Ok(f(message)),
            None => {
                if i.closed || i.peer_closed {
                    Err(Status::PermanentOutage)
                } else {
                    Err(Status::WouldBlock)
                }
            }
        })
    }

    /// Consume the previously peeked message, and only that one. A
    /// `TemporaryOutage` means a concurrent consumer raced us to it;
    /// restart from [`Self::peek`].
    pub fn receive_matching(&self, id: MessageId) -> Result<Message> {
        let verdict = self.inner.lock(|i| match i.queue.front() {
            Some(front) if front.id() == id => {
                i.credits += 1;
                Ok(i.queue.pop_front().unwrap())
            }
            _ => Err(Status::TemporaryOutage),
        });
        let message = verdict?;
        self.space_available.wake_one();
        self.notify_monitor(ChannelEvents::QUEUE_SPACE_AVAILABLE);
        Ok(message)
    }

    /// Close this endpoint. Sticky: every later send on either end fails,
    /// and the peer's receivers drain before seeing the outage.
    pub fn close(&self) {
        let peer = self.peer();
        let already = self.inner.lock(|i| core::mem::replace(&mut i.closed, true));
        if already {
            return;
        }

        // Unblock our own parked receivers and the peer's parked senders;
        // they re-check and observe the close.
        self.message_arrived.wake_all();
        self.space_available.wake_all();

        if let Some(peer) = peer {
            peer.inner.lock(|p| p.peer_closed = true);
            peer.message_arrived.wake_all();
            peer.peer_closed_waitq.wake_all();
            peer.notify_monitor(ChannelEvents::PEER_CLOSED);
        }
        log::trace!("endpoint {} closed", self.endpoint_id);
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock(|i| i.closed)
    }

    pub fn is_peer_closed(&self) -> bool {
        self.inner
            .lock(|i| i.peer_closed || i.peer.as_ref().map_or(true, |p| p.upgrade().is_none()))
    }

    /// Pending inbound messages.
    pub fn queued(&self) -> usize {
        self.inner.lock(|i| i.queue.len())
    }

    /// Attach an event monitor to this endpoint.
    pub fn set_monitor(&self, monitor: Option<Arc<Monitor>>) {
        self.inner.lock(|i| i.monitor = monitor);
    }

    pub fn monitor(&self) -> Option<Arc<Monitor>> {
        self.inner.lock(|i| i.monitor.clone())
    }

    fn notify_monitor(&self, events: ChannelEvents) {
        if let Some(monitor) = self.monitor() {
            monitor.notify(events);
        }
    }

    //----------------------------------------------------------------------------------------------
    // Event queues
    //----------------------------------------------------------------------------------------------

    pub fn message_arrived_waitq(&self) -> &Arc<WaitQueue> {
        &self.message_arrived
    }

    pub fn space_available_waitq(&self) -> &Arc<WaitQueue> {
        &self.space_available
    }

    pub fn peer_closed_waitq(&self) -> &Arc<WaitQueue> {
        &self.peer_closed_waitq
    }

    pub fn deleted_waitq(&self) -> &Arc<WaitQueue> {
        &self.deleted_waitq
    }
}

impl core::fmt::Debug for SendRejected {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        write!(f, "SendRejected({:?})", self.status)
    }
}

impl Drop for ChannelEnd {
    fn drop(&mut self) {
        // The last handle is gone; the peer sees a close, observers see a
        // deletion.
        let peer = self.inner.lock(|i| i.peer.as_ref().and_then(Weak::upgrade));
        if let Some(peer) = peer {
            peer.inner.lock(|p| p.peer_closed = true);
            peer.message_arrived.wake_all();
            peer.peer_closed_waitq.wake_all();
            peer.notify_monitor(ChannelEvents::PEER_CLOSED);
        }
        if let Some(monitor) = self.inner.lock(|i| i.monitor.clone()) {
            monitor.notify(ChannelEvents::ITEM_DELETED);
        }
        self.deleted_waitq.wake_all();
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
            ipc::message::Attachment,
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
        // Keep the arena alive for the duration of the test.
        core::mem::forget(table);
        t
    }

    fn send_nw(
        end: &Arc<ChannelEnd>,
        t: &Arc<Thread>,
        m: Message,
    ) -> core::result::Result<SendReceipt, SendRejected> {
        end.send(t, m, SendFlags::NO_WAIT, Timeout::None)
    }

    fn recv_nw(end: &Arc<ChannelEnd>, t: &Arc<Thread>) -> Result<Message> {
        end.receive(t, ReceiveFlags::NO_WAIT, Timeout::None)
    }

    #[test]
    fn messages_arrive_in_order_with_increasing_ids() {
        let t = current();
        let (a, b) = create_pair();

        let r1 = send_nw(&a, &t, Message::new(&b"one"[..])).unwrap();
        let r2 = send_nw(&a, &t, Message::new(&b"two"[..])).unwrap();
        assert!(r2.message > r1.message);

        let m1 = recv_nw(&b, &t).unwrap();
        let m2 = recv_nw(&b, &t).unwrap();
        assert_eq!(m1.body(), b"one");
        assert_eq!(m2.body(), b"two");
        assert!(m2.id() > m1.id());
        assert_eq!(recv_nw(&b, &t).unwrap_err(), Status::WouldBlock);
    }

    #[test]
    fn conversations_stamp_and_roundtrip() {
        let t = current();
        let (a, b) = create_pair();

        let receipt = a
            .send(
                &t,
                Message::new(&b"ping"[..]),
                SendFlags::NO_WAIT | SendFlags::START_CONVERSATION,
                Timeout::None,
            )
            .unwrap();
        assert!(!receipt.conversation.is_none());

        let ping = recv_nw(&b, &t).unwrap();
        assert_eq!(ping.conversation(), receipt.conversation);

        // Reply within the conversation from the other side.
        send_nw(&b, &t, Message::reply_to(ping.conversation(), &b"pong"[..])).unwrap();
        let pong = recv_nw(&a, &t).unwrap();
        assert_eq!(pong.conversation(), receipt.conversation);

        // Minting from either peer keeps increasing.
        let c1 = b.mint_conversation();
        let c2 = a.mint_conversation();
        assert!(c2 > c1);
        assert!(c1 > receipt.conversation);
    }

    #[test]
    fn full_queue_reports_would_block() {
        let t = current();
        let (a, b) = create_pair();

        for n in 0..QUEUE_DEPTH {
            send_nw(&a, &t, Message::new(alloc::vec![n as u8])).unwrap();
        }
        let rejected = send_nw(&a, &t, Message::new(&b"over"[..])).unwrap_err();
        assert_eq!(rejected.status, Status::WouldBlock);
        // The message comes back intact.
        assert_eq!(rejected.message.body(), b"over");

        // Draining one restores one credit.
        recv_nw(&b, &t).unwrap();
        send_nw(&a, &t, Message::new(&b"fits"[..])).unwrap();
    }

    #[test]
    fn peer_close_drains_then_reports_outage() {
        let t = current();
        let (a, b) = create_pair();

        for body in [&b"one"[..], &b"two"[..], &b"three"[..]] {
            send_nw(&a, &t, Message::new(body)).unwrap();
        }
        a.close();

        assert!(b.is_peer_closed());
        assert_eq!(recv_nw(&b, &t).unwrap().body(), b"one");
        assert_eq!(recv_nw(&b, &t).unwrap().body(), b"two");
        assert_eq!(recv_nw(&b, &t).unwrap().body(), b"three");
        assert_eq!(recv_nw(&b, &t).unwrap_err(), Status::PermanentOutage);

        // Sticky in both directions.
        assert_eq!(
            send_nw(&b, &t, Message::new(&b"late"[..])).unwrap_err().status,
            Status::PermanentOutage
        );
        assert_eq!(
            send_nw(&a, &t, Message::new(&b"later"[..])).unwrap_err().status,
            Status::PermanentOutage
        );
    }

    #[test]
    fn dropping_an_end_counts_as_close() {
        let t = current();
        let (a, b) = create_pair();
        send_nw(&a, &t, Message::new(&b"last words"[..])).unwrap();
        drop(a);

        assert_eq!(recv_nw(&b, &t).unwrap().body(), b"last words");
        assert_eq!(recv_nw(&b, &t).unwrap_err(), Status::PermanentOutage);
    }

    #[test]
    fn two_phase_receive_matches_or_restarts() {
        let t = current();
        let (a, b) = create_pair();
        send_nw(&a, &t, Message::new(&b"first"[..])).unwrap();
        send_nw(&a, &t, Message::new(&b"second"[..])).unwrap();

        let sizes = b.peek().unwrap();
        assert_eq!(sizes.body, 5);

        // A concurrent consumer races the peeked message away.
        let stolen = recv_nw(&b, &t).unwrap();
        assert_eq!(stolen.id(), sizes.message);
        assert_eq!(
            b.receive_matching(sizes.message).unwrap_err(),
            Status::TemporaryOutage
        );

        // Restart from peek succeeds.
        let sizes = b.peek().unwrap();
        let m = b.receive_matching(sizes.message).unwrap();
        assert_eq!(m.body(), b"second");
    }

    #[test]
    fn transferred_endpoint_keeps_routing_to_its_peer() {
        let t = current();
        let (a, b) = create_pair();
        let (c, d) = create_pair();

        let mut carrier = Message::new(&b"take this"[..]);
        carrier.attach(Attachment::Channel(Arc::clone(&c)));
        send_nw(&a, &t, carrier).unwrap();

        let mut received = recv_nw(&b, &t).unwrap();
        let moved = match received.detach_attachment(0).unwrap() {
            Attachment::Channel(end) => end,
            _ => panic!("expected a channel attachment"),
        };

        // Closing the original handle must not tear down the transferred
        // endpoint: the receiver now owns it.
        drop(c);
        send_nw(&moved, &t, Message::new(&b"x"[..])).unwrap();
        assert_eq!(recv_nw(&d, &t).unwrap().body(), b"x");
    }

    #[test]
    fn monitors_see_channel_events() {
        use crate::ipc::monitor::TriggerMode;
        let t = current();
        let (a, b) = create_pair();
        let monitor = Monitor::new(TriggerMode::Level, ChannelEvents::all());
        b.set_monitor(Some(Arc::clone(&monitor)));

        send_nw(&a, &t, Message::new(&b"m"[..])).unwrap();
        assert!(monitor.poll().contains(ChannelEvents::MESSAGE_ARRIVED));

        a.close();
        assert!(monitor.poll().contains(ChannelEvents::PEER_CLOSED));
    }
}

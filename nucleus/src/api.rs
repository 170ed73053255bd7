/*
 * SPDX-License-Identifier: BlueOak-1.0.0
 * Copyright (c) Anillo OS authors
 */

//! The syscall-facing surface.
//!
//! The architecture shim decodes the ABI, resolves the calling process and
//! thread, copies user buffers across, and calls in here. Everything in
//! this module therefore works on kernel slices and descriptor indices,
//! never on raw user pointers.
//!
//! Receive is two-phase for variable-sized messages: a call with
//! insufficient buffers reports the required sizes through the header and
//! fails with `TooBig` without consuming; the caller reallocates and
//! retries, matching the peeked message ID so a concurrent consumer
//! cannot race it ahead (`TemporaryOutage` says restart from the peek).

use {
    crate::{
        error::{Result, Status},
        ipc::{
            channel::{self, ChannelEnd, SendFlags, SendReceipt},
            message::{
                wire, Attachment, ConversationId, DataBlob, Message, MessageId,
            },
            monitor::{ChannelEvents, Monitor, TriggerMode},
            server_channel::Realm,
        },
        kernel::{Kernel, ProcessImage},
        process::{Descriptor, Process, ProcessId},
        sched::thread::{Thread, ThreadId, Timeout},
    },
    alloc::{sync::Arc, vec::Vec},
    machine::{cpu::ExecutionContext, memory::VirtAddr},
};

//--------------------------------------------------------------------------------------------------
// Public Definitions
//--------------------------------------------------------------------------------------------------

/// An attachment as described by the sender, in descriptor terms.
pub enum OutboundAttachment {
    Null,
    /// Transfer this channel descriptor to the receiver. The sender's
    /// descriptor slot is consumed.
    Channel { did: u64 },
    /// Share this mapping descriptor; its reference count goes up.
    Mapping { did: u64 },
    /// Copy these bytes along with the message.
    DataInline(Vec<u8>),
    /// Share `length` bytes backed by a mapping descriptor.
    DataShared { did: u64, length: usize },
}

/// A message as described by the sender.
pub struct OutboundMessage {
    /// Conversation to reply within; `NONE` plus the start-conversation
    /// flag mints a fresh one.
    pub conversation: ConversationId,
    pub body: Vec<u8>,
    pub attachments: Vec<OutboundAttachment>,
}

/// Caller-supplied receive buffers.
pub struct ReceiveBuffers<'a> {
    pub body: &'a mut [u8],
    pub attachments: &'a mut [u8],
}

//--------------------------------------------------------------------------------------------------
// Channels
//--------------------------------------------------------------------------------------------------

/// `channel_create_pair`: two connected endpoints in the caller's table.
pub fn channel_create_pair(process: &Process) -> Result<(u64, u64)> {
    let (a, b) = channel::create_pair();
    Ok(process.with_descriptors(|d| {
        (
            d.insert(Descriptor::Channel(a)),
            d.insert(Descriptor::Channel(b)),
        )
    }))
}

/// `channel_send`: serialize descriptors into a message and move it to
/// the peer.
pub fn channel_send(
    process: &Process,
    current: &Arc<Thread>,
    did: u64,
    flags: SendFlags,
    timeout: Timeout,
    outbound: OutboundMessage,
) -> Result<SendReceipt> {
    let end = process.channel(did)?;

    let mut message = Message::reply_to(outbound.conversation, outbound.body);
    if let Err(status) = collect_attachments(process, &mut message, outbound.attachments) {
        restore_transfers(process, message);
        return Err(status);
    }

    match end.send(current, message, flags, timeout) {
        Ok(receipt) => Ok(receipt),
        Err(rejected) => {
            // Hand transferred capabilities back before reporting.
            restore_transfers(process, rejected.message);
            Err(rejected.status)
        }
    }
}

/// `channel_receive`: two-phase receive into caller buffers.
///
/// `match_id` is the match-message-ID retry flag: after a `TooBig` round,
/// pass the reported message ID so only that message is consumed.
/// Inline data blobs land in the attachments buffer; their wire entries
/// carry the offset from the start of that buffer.
pub fn channel_receive(
    process: &Process,
    current: &Arc<Thread>,
    did: u64,
    no_wait: bool,
    match_id: Option<MessageId>,
    timeout: Timeout,
    out: &mut wire::Header,
    buffers: &mut ReceiveBuffers,
) -> Result<()> {
    let end = process.channel(did)?;

    let message = loop {
        // Phase one: size the frontmost (or matched) message.
        let (needed_body, needed_attachments, front_id) =
            match end.peek_with(|m| (m.body().len(), attachments_wire_len(m), m.id())) {
                Ok(sizes) => sizes,
                Err(Status::WouldBlock) if !no_wait => {
                    current.prepare_wait(end.message_arrived_waitq(), timeout)?;
                    let still_empty =
                        matches!(end.peek(), Err(Status::WouldBlock));
                    if still_empty {
                        current.commit_wait()?;
                    } else {
                        current.cancel_wait();
                    }
                    continue;
                }
                Err(status) => return Err(status),
            };

        if let Some(wanted) = match_id {
            if wanted != front_id {
                return Err(Status::TemporaryOutage);
            }
        }

        if needed_body > buffers.body.len() || needed_attachments > buffers.attachments.len() {
            out.body_length = needed_body as u64;
            out.attachments_length = needed_attachments as u64;
            return Err(Status::TooBig);
        }

        // Phase two: consume exactly the message we sized.
        match end.receive_matching(front_id) {
            Ok(message) => break message,
            // Raced away; restart from the peek unless the caller pinned
            // a specific message.
            Err(Status::TemporaryOutage) if match_id.is_none() => continue,
            Err(status) => return Err(status),
        }
    };

    deliver(process, &end, message, out, buffers)
}

/// `channel_close`.
pub fn channel_close(process: &Process, did: u64, _force: bool) -> Result<()> {
    let end = match process.with_descriptors(|d| d.take(did)) {
        Some(Descriptor::Channel(end)) => end,
        Some(other) => {
            // Wrong kind; put it back.
            process.with_descriptors(|d| d.insert_at(did, other)).ok();
            return Err(Status::InvalidArgument);
        }
        None => return Err(Status::NoSuchResource),
    };
    end.close();
    Ok(())
}

/// `channel_conversation_create`: mint a conversation ID without sending.
pub fn channel_conversation_create(process: &Process, did: u64) -> Result<u64> {
    Ok(process.channel(did)?.mint_conversation().0)
}

//--------------------------------------------------------------------------------------------------
// Server channels
//--------------------------------------------------------------------------------------------------

/// `server_channel_create`: register a named rendezvous in a realm.
pub fn server_channel_create(
    kernel: &Kernel,
    process: &Process,
    name: &str,
    realm: Realm,
) -> Result<u64> {
    let namespace = match realm {
        Realm::Global => &kernel.global_namespace,
        other => process.realm_namespace(other)?,
    };
    let server = namespace.create(name)?;
    Ok(process.with_descriptors(|d| d.insert(Descriptor::ServerChannel(server))))
}

/// `server_channel_connect`: resolve a name and return a fresh connected
/// endpoint.
pub fn server_channel_connect(
    kernel: &Kernel,
    process: &Process,
    name: &str,
    realm: Realm,
) -> Result<u64> {
    let namespace = match realm {
        Realm::Global => &kernel.global_namespace,
        other => process.realm_namespace(other)?,
    };
    let client = namespace.lookup(name)?.connect()?;
    Ok(process.with_descriptors(|d| d.insert(Descriptor::Channel(client))))
}

/// `server_channel_accept`.
pub fn server_channel_accept(
    process: &Process,
    current: &Arc<Thread>,
    did: u64,
    no_wait: bool,
    timeout: Timeout,
) -> Result<u64> {
    let server = process.server_channel(did)?;
    let end = server.accept(current, no_wait, timeout)?;
    Ok(process.with_descriptors(|d| d.insert(Descriptor::Channel(end))))
}

//--------------------------------------------------------------------------------------------------
// Threads
//--------------------------------------------------------------------------------------------------

/// `thread_create`: a suspended thread entering at `entry` on the given
/// stack.
pub fn thread_create(
    kernel: &'static Kernel,
    stack_base: VirtAddr,
    stack_pages: usize,
    entry: u64,
) -> Result<u64> {
    let sp = (stack_base.as_usize() + stack_pages * machine::memory::Granule::SIZE) as u64;
    let context = ExecutionContext::at_entry(entry, sp);
    let thread = kernel.spawn_thread(context, stack_base, stack_pages, true);
    Ok(thread.id().raw())
}

fn thread_by_raw(kernel: &Kernel, raw: u64) -> Result<Arc<Thread>> {
    kernel
        .threads
        .lookup(ThreadId::from_raw(raw))
        .ok_or(Status::NoSuchResource)
}

/// `thread_resume`.
pub fn thread_resume(kernel: &Kernel, raw: u64) -> Result<()> {
    thread_by_raw(kernel, raw)?.resume()
}

/// `thread_suspend`.
pub fn thread_suspend(kernel: &Kernel, raw: u64) -> Result<()> {
    thread_by_raw(kernel, raw)?.suspend()
}

/// `thread_kill`.
pub fn thread_kill(kernel: &Kernel, raw: u64) -> Result<()> {
    thread_by_raw(kernel, raw)?.kill()
}

/// `thread_signal`.
pub fn thread_signal(kernel: &Kernel, raw: u64, signal: u8) -> Result<()> {
    thread_by_raw(kernel, raw)?.post_signal(signal)
}

//--------------------------------------------------------------------------------------------------
// Futexes
//--------------------------------------------------------------------------------------------------

/// `futex_wait`.
pub fn futex_wait(
    kernel: &Kernel,
    process: &Process,
    current: &Arc<Thread>,
    addr: VirtAddr,
    expected: u64,
    timeout: Timeout,
) -> Result<()> {
    kernel
        .futexes
        .wait(current, process.space(), addr, expected, timeout)
}

/// `futex_wake`.
pub fn futex_wake(
    kernel: &Kernel,
    process: &Process,
    addr: VirtAddr,
    count: usize,
) -> Result<usize> {
    kernel.futexes.wake(process.space(), addr, count)
}

/// `futex_associate`: arm a channel's monitor for a one-shot futex wake.
/// A channel without a monitor gets an edge-triggered one watching
/// everything.
pub fn futex_associate(
    kernel: &'static Kernel,
    process: &Process,
    did: u64,
    addr: VirtAddr,
) -> Result<()> {
    let end = process.channel(did)?;
    let phys = process
        .space()
        .translate(addr)
        .ok_or(Status::InvalidArgument)?;
    let monitor = match end.monitor() {
        Some(monitor) => monitor,
        None => {
            let monitor = Monitor::new(TriggerMode::Edge, ChannelEvents::all());
            end.set_monitor(Some(Arc::clone(&monitor)));
            monitor
        }
    };
    monitor.arm_futex_wake(kernel.futexes, phys);
    Ok(())
}

//--------------------------------------------------------------------------------------------------
// Processes
//--------------------------------------------------------------------------------------------------

/// `process_create`: load an image into a fresh process. The caller gets
/// the process handle plus the loader end of the binary channel.
pub fn process_create(
    kernel: &'static Kernel,
    caller: &Process,
    image: &ProcessImage,
) -> Result<(u64, u64)> {
    let (process, loader_end) = kernel.create_process(image, Some(caller))?;
    let loader_did = caller.with_descriptors(|d| d.insert(Descriptor::Channel(loader_end)));
    Ok((process.id().0, loader_did))
}

/// Resolve a process handle.
pub fn process_by_handle(kernel: &Kernel, handle: u64) -> Result<Arc<Process>> {
    kernel
        .process(ProcessId(handle))
        .ok_or(Status::NoSuchResource)
}

//--------------------------------------------------------------------------------------------------
// Private Code
//--------------------------------------------------------------------------------------------------

/// Turn descriptor-level attachments into kernel attachments, consuming
/// transferred descriptors from the sender's table.
fn collect_attachments(
    process: &Process,
    message: &mut Message,
    outbound: Vec<OutboundAttachment>,
) -> Result<()> {
    for attachment in outbound {
        let collected = match attachment {
            OutboundAttachment::Null => Attachment::Null,
            OutboundAttachment::Channel { did } => {
                match process.with_descriptors(|d| d.take(did)) {
                    Some(Descriptor::Channel(end)) => Attachment::Channel(end),
                    Some(other) => {
                        process.with_descriptors(|d| d.insert_at(did, other)).ok();
                        return Err(Status::InvalidArgument);
                    }
                    None => return Err(Status::NoSuchResource),
                }
            }
            OutboundAttachment::Mapping { did } => match process.with_descriptors(|d| d.get(did)) {
                Some(Descriptor::Mapping(mapping)) => Attachment::Mapping(mapping),
                Some(_) => return Err(Status::InvalidArgument),
                None => return Err(Status::NoSuchResource),
            },
            OutboundAttachment::DataInline(bytes) => Attachment::Data(DataBlob::Inline(bytes)),
            OutboundAttachment::DataShared { did, length } => {
                match process.with_descriptors(|d| d.get(did)) {
                    Some(Descriptor::Mapping(mapping)) => {
                        Attachment::Data(DataBlob::Shared(mapping, length))
                    }
                    Some(_) => return Err(Status::InvalidArgument),
                    None => return Err(Status::NoSuchResource),
                }
            }
        };
        message.attach(collected);
    }
    Ok(())
}

/// Give transferred channel descriptors back to the sender after a
/// rejected send.
fn restore_transfers(process: &Process, mut message: Message) {
    let count = message.attachments().len();
    for index in 0..count {
        if let Some(Attachment::Channel(end)) = message.detach_attachment(index) {
            process.with_descriptors(|d| d.insert(Descriptor::Channel(end)));
        }
    }
}

/// Wire bytes the attachment table of `message` needs, inline blob
/// payloads included.
fn attachments_wire_len(message: &Message) -> usize {
    let entries: Vec<wire::Attachment> = message
        .attachments()
        .iter()
        .map(|attachment| match attachment {
            Attachment::Null => wire::Attachment::Null,
            Attachment::Channel(_) => wire::Attachment::Channel { descriptor: 0 },
            Attachment::Mapping(_) => wire::Attachment::Mapping { mapping: 0 },
            Attachment::Data(DataBlob::Inline(bytes)) => wire::Attachment::DataInline {
                address: 0,
                length: bytes.len() as u64,
            },
            Attachment::Data(DataBlob::Shared(_, length)) => wire::Attachment::DataShared {
                mapping: 0,
                length: *length as u64,
            },
        })
        .collect();
    let inline_tail: usize = message
        .attachments()
        .iter()
        .map(|attachment| match attachment {
            Attachment::Data(DataBlob::Inline(bytes)) => {
                (bytes.len() + wire::ATTACHMENT_ALIGN - 1) & !(wire::ATTACHMENT_ALIGN - 1)
            }
            _ => 0,
        })
        .sum();
    wire::encoded_len(&entries) + inline_tail
}

/// Materialize a received message into the caller's buffers and
/// descriptor table.
fn deliver(
    process: &Process,
    end: &Arc<ChannelEnd>,
    mut message: Message,
    out: &mut wire::Header,
    buffers: &mut ReceiveBuffers,
) -> Result<()> {
    let body = message.body().to_vec();
    buffers.body[..body.len()].copy_from_slice(&body);

    // Entries first, inline payloads packed after them.
    let count = message.attachments().len();
    let mut entries = Vec::with_capacity(count);
    let mut inline: Vec<(usize, Vec<u8>)> = Vec::new();
    for index in 0..count {
        let entry = match message.detach_attachment(index).unwrap() {
            Attachment::Null => wire::Attachment::Null,
            Attachment::Channel(moved) => wire::Attachment::Channel {
                descriptor: process.with_descriptors(|d| d.insert(Descriptor::Channel(moved))),
            },
            Attachment::Mapping(mapping) => {
                let id = mapping.id();
                process.with_descriptors(|d| d.insert(Descriptor::Mapping(mapping)));
                wire::Attachment::Mapping { mapping: id }
            }
            Attachment::Data(DataBlob::Inline(bytes)) => {
                let length = bytes.len() as u64;
                inline.push((entries.len(), bytes));
                // Offset patched below, once the table size is known.
                wire::Attachment::DataInline { address: 0, length }
            }
            Attachment::Data(DataBlob::Shared(mapping, length)) => {
                let id = mapping.id();
                process.with_descriptors(|d| d.insert(Descriptor::Mapping(mapping)));
                wire::Attachment::DataShared {
                    mapping: id,
                    length: length as u64,
                }
            }
        };
        entries.push(entry);
    }

    let table_len = wire::encoded_len(&entries);
    let mut cursor = table_len;
    for (entry_index, bytes) in &inline {
        if let wire::Attachment::DataInline { address, .. } = &mut entries[*entry_index] {
            *address = cursor as u64;
        }
        cursor += (bytes.len() + wire::ATTACHMENT_ALIGN - 1) & !(wire::ATTACHMENT_ALIGN - 1);
    }

    let encoded = wire::encode_attachments(&entries);
    buffers.attachments[..encoded.len()].copy_from_slice(&encoded);
    let mut cursor = table_len;
    for (_, bytes) in inline {
        buffers.attachments[cursor..cursor + bytes.len()].copy_from_slice(&bytes);
        cursor += (bytes.len() + wire::ATTACHMENT_ALIGN - 1) & !(wire::ATTACHMENT_ALIGN - 1);
    }

    *out = wire::Header {
        conversation_id: message.conversation().0,
        message_id: message.id().0,
        peer_id: end.peer().map(|p| p.endpoint_id()).unwrap_or(0),
        body_length: body.len() as u64,
        attachments_length: cursor as u64,
        body_address: 0,
        attachments_address: 0,
    };
    Ok(())
}

//--------------------------------------------------------------------------------------------------
// Testing
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            ipc::message::SharedMapping,
            kernel::{BootLayout, Machine},
        },
        core::time::Duration,
        machine::{
            hosted::{HostedClock, HostedCpu, HostedMemory},
            memory::{mmu::PageFlags, Address},
        },
    };

    struct Harness {
        kernel: &'static Kernel,
        process: Arc<Process>,
        current: Arc<Thread>,
    }

    fn harness() -> Harness {
        let mem = HostedMemory::leak(512);
        let machine = Machine {
            dmap: mem,
            tlb: mem,
            clock: HostedClock::leak(),
            cpu: Box::leak(Box::new(HostedCpu::default())),
        };
        let (base, pages) = mem.boot_region();
        let kernel = Kernel::new(
            machine,
            BootLayout {
                memory_map: vec![(base, pages)],
                kernel_virt_base: Address::new(0xffff_9000_0000_0000),
                kernel_virt_pages: 128,
                user_virt_base: Address::new(0x0000_2000_0000),
                user_virt_pages: 128,
                quantum: Duration::from_millis(1),
            },
        );
        let image = ProcessImage {
            segments: vec![],
            entry_pc: 0x0000_2000_0000,
            entry_sp: 0x0000_2000_0000,
        };
        let (process, _loader) = kernel.create_process(&image, None).unwrap();
        let current = kernel.spawn_thread(ExecutionContext::default(), Address::new(0), 0, false);
        current.resume().unwrap();
        Harness {
            kernel,
            process,
            current,
        }
    }

    fn simple_outbound(body: &[u8]) -> OutboundMessage {
        OutboundMessage {
            conversation: ConversationId::NONE,
            body: body.to_vec(),
            attachments: Vec::new(),
        }
    }

    #[test]
    fn send_receive_through_descriptors() {
        let h = harness();
        let (tx, rx) = channel_create_pair(&h.process).unwrap();

        let receipt = channel_send(
            &h.process,
            &h.current,
            tx,
            SendFlags::NO_WAIT,
            Timeout::None,
            simple_outbound(b"payload"),
        )
        .unwrap();
        assert!(receipt.message.0 > 0);

        let mut body = [0u8; 64];
        let mut attachments = [0u8; 64];
        let mut header = wire::Header::default();
        channel_receive(
            &h.process,
            &h.current,
            rx,
            true,
            None,
            Timeout::None,
            &mut header,
            &mut ReceiveBuffers {
                body: &mut body,
                attachments: &mut attachments,
            },
        )
        .unwrap();
        assert_eq!(header.body_length, 7);
        assert_eq!(&body[..7], b"payload");
        assert_eq!(header.message_id, receipt.message.0);
    }

    #[test]
    fn too_big_reports_sizes_without_consuming() {
        let h = harness();
        let (tx, rx) = channel_create_pair(&h.process).unwrap();
        channel_send(
            &h.process,
            &h.current,
            tx,
            SendFlags::NO_WAIT,
            Timeout::None,
            simple_outbound(b"a larger message body"),
        )
        .unwrap();

        let mut tiny = [0u8; 4];
        let mut attachments = [0u8; 64];
        let mut header = wire::Header::default();
        let err = channel_receive(
            &h.process,
            &h.current,
            rx,
            true,
            None,
            Timeout::None,
            &mut header,
            &mut ReceiveBuffers {
                body: &mut tiny,
                attachments: &mut attachments,
            },
        )
        .unwrap_err();
        assert_eq!(err, Status::TooBig);
        assert_eq!(header.body_length, 21);

        // Retry with the reported size and the peeked ID still succeeds.
        let mut body = vec![0u8; header.body_length as usize];
        let sizes = h.process.channel(rx).unwrap().peek().unwrap();
        channel_receive(
            &h.process,
            &h.current,
            rx,
            true,
            Some(sizes.message),
            Timeout::None,
            &mut header,
            &mut ReceiveBuffers {
                body: &mut body,
                attachments: &mut attachments,
            },
        )
        .unwrap();
        assert_eq!(&body[..], b"a larger message body");
    }

    #[test]
    fn channel_attachment_transfers_descriptor() {
        let h = harness();
        let (tx, rx) = channel_create_pair(&h.process).unwrap();
        let (moved, kept) = channel_create_pair(&h.process).unwrap();

        channel_send(
            &h.process,
            &h.current,
            tx,
            SendFlags::NO_WAIT,
            Timeout::None,
            OutboundMessage {
                conversation: ConversationId::NONE,
                body: b"carrier".to_vec(),
                attachments: vec![OutboundAttachment::Channel { did: moved }],
            },
        )
        .unwrap();
        // The sender's slot is gone; closing "the original" is a miss and
        // cannot affect the transferred endpoint.
        assert!(h.process.channel(moved).is_err());
        assert_eq!(
            channel_close(&h.process, moved, false),
            Err(Status::NoSuchResource)
        );

        let mut body = [0u8; 64];
        let mut attachments = [0u8; 128];
        let mut header = wire::Header::default();
        channel_receive(
            &h.process,
            &h.current,
            rx,
            true,
            None,
            Timeout::None,
            &mut header,
            &mut ReceiveBuffers {
                body: &mut body,
                attachments: &mut attachments,
            },
        )
        .unwrap();

        let table =
            wire::decode_attachments(&attachments[..header.attachments_length as usize]).unwrap();
        let new_did = match table[0] {
            wire::Attachment::Channel { descriptor } => descriptor,
            _ => panic!("expected channel attachment"),
        };

        // The rematerialized endpoint still routes to `kept`.
        channel_send(
            &h.process,
            &h.current,
            new_did,
            SendFlags::NO_WAIT,
            Timeout::None,
            simple_outbound(b"x"),
        )
        .unwrap();
        let sizes = h.process.channel(kept).unwrap().peek().unwrap();
        assert_eq!(sizes.body, 1);
    }

    #[test]
    fn rejected_send_restores_transferred_descriptors() {
        let h = harness();
        let (tx, _rx) = channel_create_pair(&h.process).unwrap();
        let (moved, _kept) = channel_create_pair(&h.process).unwrap();

        // Fill the queue so the next send is rejected.
        for _ in 0..crate::ipc::QUEUE_DEPTH {
            channel_send(
                &h.process,
                &h.current,
                tx,
                SendFlags::NO_WAIT,
                Timeout::None,
                simple_outbound(b"fill"),
            )
            .unwrap();
        }
        let err = channel_send(
            &h.process,
            &h.current,
            tx,
            SendFlags::NO_WAIT,
            Timeout::None,
            OutboundMessage {
                conversation: ConversationId::NONE,
                body: Vec::new(),
                attachments: vec![OutboundAttachment::Channel { did: moved }],
            },
        )
        .unwrap_err();
        assert_eq!(err, Status::WouldBlock);
        // The capability is back in the sender's table (possibly under a
        // fresh index; the original slot was freed first).
        let restored = h.process.with_descriptors(|d| d.get(moved));
        assert!(matches!(restored, Some(Descriptor::Channel(_))));
    }

    #[test]
    fn inline_data_lands_in_attachment_buffer() {
        let h = harness();
        let (tx, rx) = channel_create_pair(&h.process).unwrap();
        channel_send(
            &h.process,
            &h.current,
            tx,
            SendFlags::NO_WAIT,
            Timeout::None,
            OutboundMessage {
                conversation: ConversationId::NONE,
                body: Vec::new(),
                attachments: vec![
                    OutboundAttachment::DataInline(b"BLOB".to_vec()),
                    OutboundAttachment::Null,
                ],
            },
        )
        .unwrap();

        let mut body = [0u8; 8];
        let mut attachments = [0u8; 128];
        let mut header = wire::Header::default();
        channel_receive(
            &h.process,
            &h.current,
            rx,
            true,
            None,
            Timeout::None,
            &mut header,
            &mut ReceiveBuffers {
                body: &mut body,
                attachments: &mut attachments,
            },
        )
        .unwrap();

        let used = header.attachments_length as usize;
        let table = wire::decode_attachments(&attachments[..used]).unwrap();
        match table[0] {
            wire::Attachment::DataInline { address, length } => {
                assert_eq!(length, 4);
                let start = address as usize;
                assert_eq!(&attachments[start..start + 4], b"BLOB");
            }
            _ => panic!("expected inline data"),
        }
        assert_eq!(table[1], wire::Attachment::Null);
    }

    #[test]
    fn mapping_attachments_share_not_move(){
        let h = harness();
        let (tx, rx) = channel_create_pair(&h.process).unwrap();
        let mapping = SharedMapping::new(4);
        let mapping_id = mapping.id();
        let mdid =
            h.process.with_descriptors(|d| d.insert(Descriptor::Mapping(Arc::clone(&mapping))));

        channel_send(
            &h.process,
            &h.current,
            tx,
            SendFlags::NO_WAIT,
            Timeout::None,
            OutboundMessage {
                conversation: ConversationId::NONE,
                body: Vec::new(),
                attachments: vec![OutboundAttachment::Mapping { did: mdid }],
            },
        )
        .unwrap();
        // Sharing, not transfer: the sender keeps its descriptor.
        assert!(matches!(
            h.process.with_descriptors(|d| d.get(mdid)),
            Some(Descriptor::Mapping(_))
        ));

        let mut body = [0u8; 8];
        let mut attachments = [0u8; 64];
        let mut header = wire::Header::default();
        channel_receive(
            &h.process,
            &h.current,
            rx,
            true,
            None,
            Timeout::None,
            &mut header,
            &mut ReceiveBuffers {
                body: &mut body,
                attachments: &mut attachments,
            },
        )
        .unwrap();
        let table =
            wire::decode_attachments(&attachments[..header.attachments_length as usize]).unwrap();
        assert_eq!(table[0], wire::Attachment::Mapping { mapping: mapping_id });
    }

    #[test]
    fn server_channel_surface_roundtrip() {
        let h = harness();
        let sdid = server_channel_create(h.kernel, &h.process, "svc.api", Realm::Global).unwrap();
        let client_did =
            server_channel_connect(h.kernel, &h.process, "svc.api", Realm::Global).unwrap();
        let accepted_did =
            server_channel_accept(&h.process, &h.current, sdid, true, Timeout::None).unwrap();

        channel_send(
            &h.process,
            &h.current,
            client_did,
            SendFlags::NO_WAIT,
            Timeout::None,
            simple_outbound(b"hi"),
        )
        .unwrap();
        let sizes = h.process.channel(accepted_did).unwrap().peek().unwrap();
        assert_eq!(sizes.body, 2);

        assert_eq!(
            server_channel_create(h.kernel, &h.process, "svc.api", Realm::Global).unwrap_err(),
            Status::AlreadyInProgress
        );
    }

    #[test]
    fn thread_surface_maps_errors() {
        let h = harness();
        let raw = thread_create(h.kernel, Address::new(0x3000_0000), 4, 0x1000).unwrap();
        thread_resume(h.kernel, raw).unwrap();
        assert_eq!(thread_resume(h.kernel, raw), Err(Status::AlreadyInProgress));
        thread_suspend(h.kernel, raw).unwrap();
        thread_resume(h.kernel, raw).unwrap();
        thread_signal(h.kernel, raw, 5).unwrap();
        thread_kill(h.kernel, raw).unwrap();
        assert_eq!(thread_kill(h.kernel, raw), Err(Status::AlreadyInProgress));
        assert_eq!(thread_resume(h.kernel, 0xdead_beef), Err(Status::NoSuchResource));
    }

    #[test]
    fn futex_surface_checks_value() {
        let h = harness();
        // Back one user page so the futex word exists.
        let addr = h.process.space().allocate(1, PageFlags::empty()).unwrap();
        // Word starts zeroed; a mismatched expectation refuses to park.
        assert_eq!(
            futex_wait(h.kernel, &h.process, &h.current, addr, 7, Timeout::None),
            Err(Status::WouldBlock)
        );
        assert_eq!(futex_wake(h.kernel, &h.process, addr, 1).unwrap(), 0);
    }
}

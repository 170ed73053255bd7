/*
 * SPDX-License-Identifier: BlueOak-1.0.0
 * Copyright (c) Anillo OS authors
 */

//! Kernel message records and their user-facing wire format.
//!
//! A message is a conversation tag, a per-pair message ID, body bytes, and
//! an ordered sequence of attachments. Attachments are transferable
//! capabilities: sub-channel endpoints move their ownership to the
//! receiver, shared mappings gain a reference, data blobs are either
//! inlined copies or references onto a shared region.

use {
    super::channel::ChannelEnd,
    alloc::{sync::Arc, vec::Vec},
    bit_field::BitField,
    core::sync::atomic::{AtomicU64, Ordering},
    static_assertions::const_assert_eq,
};

//--------------------------------------------------------------------------------------------------
// Public Definitions
//--------------------------------------------------------------------------------------------------

/// Tag for a logical multi-message exchange. Zero means "none".
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ConversationId(pub u64);

/// Per-channel-pair message sequence number; strictly increasing in
/// delivery order. Zero means "not yet stamped".
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct MessageId(pub u64);

/// A reference-counted shared memory region handed around in messages.
#[derive(Debug)]
pub struct SharedMapping {
    id: u64,
    pages: usize,
}

/// The payload of a data attachment.
#[derive(Clone, Debug)]
pub enum DataBlob {
    /// An owned, inlined copy.
    Inline(Vec<u8>),
    /// `length` bytes backed by a shared region.
    Shared(Arc<SharedMapping>, usize),
}

/// One transferable capability carried by a message.
#[derive(Clone, Debug)]
pub enum Attachment {
    Null,
    /// A channel endpoint; ownership moves to the receiver.
    Channel(Arc<ChannelEnd>),
    /// A shared memory region; the reference count moves up by one.
    Mapping(Arc<SharedMapping>),
    /// Bytes, inline or share-backed.
    Data(DataBlob),
}

/// A kernel message record.
#[derive(Debug)]
pub struct Message {
    conversation: ConversationId,
    id: MessageId,
    body: Vec<u8>,
    attachments: Vec<Attachment>,
}

//--------------------------------------------------------------------------------------------------
// Public Code
//--------------------------------------------------------------------------------------------------

static NEXT_MAPPING_ID: AtomicU64 = AtomicU64::new(1);

impl SharedMapping {
    pub fn new(pages: usize) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_MAPPING_ID.fetch_add(1, Ordering::Relaxed),
            pages,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn pages(&self) -> usize {
        self.pages
    }
}

impl ConversationId {
    pub const NONE: ConversationId = ConversationId(0);

    pub fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl Message {
    /// A message with no conversation tag.
    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        Self {
            conversation: ConversationId::NONE,
            id: MessageId(0),
            body: body.into(),
            attachments: Vec::new(),
        }
    }

    /// A reply within an existing conversation.
    pub fn reply_to(conversation: ConversationId, body: impl Into<Vec<u8>>) -> Self {
        Self {
            conversation,
            ..Self::new(body)
        }
    }

    pub fn attach(&mut self, attachment: Attachment) {
        self.attachments.push(attachment);
    }

    pub fn conversation(&self) -> ConversationId {
        self.conversation
    }

    pub fn id(&self) -> MessageId {
        self.id
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn attachments(&self) -> &[Attachment] {
        &self.attachments
    }

    /// Take ownership of one attachment, leaving `Null` in its place. The
    /// underlying resource now belongs to the caller; releasing the
    /// message no longer affects it.
    pub fn detach_attachment(&mut self, index: usize) -> Option<Attachment> {
        let slot = self.attachments.get_mut(index)?;
        Some(core::mem::replace(slot, Attachment::Null))
    }

    pub(crate) fn set_conversation(&mut self, conversation: ConversationId) {
        self.conversation = conversation;
    }

    pub(crate) fn set_id(&mut self, id: MessageId) {
        self.id = id;
    }
}

//--------------------------------------------------------------------------------------------------
// Wire format
//--------------------------------------------------------------------------------------------------

/// The kernel<->user message boundary.
pub mod wire {
    use super::*;

    /// Fixed-size message header exchanged with user space.
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
    #[repr(C)]
    pub struct Header {
        pub conversation_id: u64,
        pub message_id: u64,
        pub peer_id: u64,
        pub body_length: u64,
        pub attachments_length: u64,
        pub body_address: u64,
        pub attachments_address: u64,
    }

    /// Bytes in an encoded header.
    pub const HEADER_BYTES: usize = 56;
    const_assert_eq!(core::mem::size_of::<Header>(), HEADER_BYTES);

    /// Attachment discriminators on the wire.
    pub const TYPE_NULL: u8 = 1;
    pub const TYPE_CHANNEL: u8 = 2;
    pub const TYPE_MAPPING: u8 = 3;
    pub const TYPE_DATA: u8 = 4;

    /// Entry alignment inside the attachment buffer.
    pub const ATTACHMENT_ALIGN: usize = 4;

    const ENTRY_HEADER_BYTES: usize = 5;
    const DATA_FLAG_SHARED: u32 = 1 << 0;

    /// One attachment as crossed to/from user space. Kernel objects have
    /// already been swapped for descriptor/mapping IDs at this point.
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub enum Attachment {
        Null,
        Channel { descriptor: u64 },
        Mapping { mapping: u64 },
        DataInline { address: u64, length: u64 },
        DataShared { mapping: u64, length: u64 },
    }

    impl Header {
        pub fn encode(&self) -> [u8; HEADER_BYTES] {
            let mut out = [0u8; HEADER_BYTES];
            let fields = [
                self.conversation_id,
                self.message_id,
                self.peer_id,
                self.body_length,
                self.attachments_length,
                self.body_address,
                self.attachments_address,
            ];
            for (n, field) in fields.iter().enumerate() {
                out[n * 8..(n + 1) * 8].copy_from_slice(&field.to_le_bytes());
            }
            out
        }

        pub fn decode(bytes: &[u8]) -> Option<Self> {
            if bytes.len() < HEADER_BYTES {
                return None;
            }
            let mut fields = [0u64; 7];
            for (n, field) in fields.iter_mut().enumerate() {
                *field = u64::from_le_bytes(bytes[n * 8..(n + 1) * 8].try_into().ok()?);
            }
            Some(Self {
                conversation_id: fields[0],
                message_id: fields[1],
                peer_id: fields[2],
                body_length: fields[3],
                attachments_length: fields[4],
                body_address: fields[5],
                attachments_address: fields[6],
            })
        }
    }

    impl Attachment {
        fn wire_type(&self) -> u8 {
            match self {
                Attachment::Null => TYPE_NULL,
                Attachment::Channel { .. } => TYPE_CHANNEL,
                Attachment::Mapping { .. } => TYPE_MAPPING,
                Attachment::DataInline { .. } | Attachment::DataShared { .. } => TYPE_DATA,
            }
        }

        fn payload(&self) -> Vec<u8> {
            let mut out = Vec::new();
            match *self {
                Attachment::Null => {}
                Attachment::Channel { descriptor } => {
                    out.extend_from_slice(&descriptor.to_le_bytes())
                }
                Attachment::Mapping { mapping } => out.extend_from_slice(&mapping.to_le_bytes()),
                Attachment::DataInline { address, length } => {
                    out.extend_from_slice(&0u32.to_le_bytes());
                    out.extend_from_slice(&address.to_le_bytes());
                    out.extend_from_slice(&length.to_le_bytes());
                }
                Attachment::DataShared { mapping, length } => {
                    out.extend_from_slice(&DATA_FLAG_SHARED.to_le_bytes());
                    out.extend_from_slice(&mapping.to_le_bytes());
                    out.extend_from_slice(&length.to_le_bytes());
                }
            }
            out
        }
    }

    /// Bytes the encoded table for `attachments` will occupy.
    pub fn encoded_len(attachments: &[Attachment]) -> usize {
        let mut total = 0usize;
        for attachment in attachments {
            let entry = ENTRY_HEADER_BYTES + attachment.payload().len();
            total += (entry + ATTACHMENT_ALIGN - 1) & !(ATTACHMENT_ALIGN - 1);
        }
        total
    }

    /// Densely pack an attachment table.
    pub fn encode_attachments(attachments: &[Attachment]) -> Vec<u8> {
        let mut out = Vec::with_capacity(encoded_len(attachments));
        for (n, attachment) in attachments.iter().enumerate() {
            let payload = attachment.payload();
            let entry = ENTRY_HEADER_BYTES + payload.len();
            let padded = (entry + ATTACHMENT_ALIGN - 1) & !(ATTACHMENT_ALIGN - 1);
            let last = n == attachments.len() - 1;

            out.push(attachment.wire_type());
            out.extend_from_slice(&(payload.len() as u16).to_le_bytes());
            let next = if last { 0u16 } else { padded as u16 };
            out.extend_from_slice(&next.to_le_bytes());
            out.extend_from_slice(&payload);
            out.resize(out.len() + (padded - entry), 0);
        }
        out
    }

    /// Walk an encoded table back into attachments. `None` on malformed
    /// input.
    pub fn decode_attachments(mut bytes: &[u8]) -> Option<Vec<Attachment>> {
        let mut out = Vec::new();
        while !bytes.is_empty() {
            if bytes.len() < ENTRY_HEADER_BYTES {
                return None;
            }
            let kind = bytes[0];
            let length = u16::from_le_bytes(bytes[1..3].try_into().ok()?) as usize;
            let next = u16::from_le_bytes(bytes[3..5].try_into().ok()?) as usize;
            let payload = bytes.get(ENTRY_HEADER_BYTES..ENTRY_HEADER_BYTES + length)?;

            out.push(match kind {
                TYPE_NULL => Attachment::Null,
                TYPE_CHANNEL => Attachment::Channel {
                    descriptor: u64::from_le_bytes(payload.get(0..8)?.try_into().ok()?),
                },
                TYPE_MAPPING => Attachment::Mapping {
                    mapping: u64::from_le_bytes(payload.get(0..8)?.try_into().ok()?),
                },
                TYPE_DATA => {
                    let flags = u32::from_le_bytes(payload.get(0..4)?.try_into().ok()?);
                    let word1 = u64::from_le_bytes(payload.get(4..12)?.try_into().ok()?);
                    let length = u64::from_le_bytes(payload.get(12..20)?.try_into().ok()?);
                    if flags.get_bit(0) {
                        Attachment::DataShared {
                            mapping: word1,
                            length,
                        }
                    } else {
                        Attachment::DataInline {
                            address: word1,
                            length,
                        }
                    }
                }
                _ => return None,
            });

            if next == 0 {
                break;
            }
            if next % ATTACHMENT_ALIGN != 0 || next > bytes.len() {
                return None;
            }
            bytes = &bytes[next..];
        }
        Some(out)
    }
}

//--------------------------------------------------------------------------------------------------
// Testing
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::{wire, *};

    #[test]
    fn detach_leaves_null_in_place() {
        let mut m = Message::new(&b"hi"[..]);
        m.attach(Attachment::Mapping(SharedMapping::new(4)));
        m.attach(Attachment::Data(DataBlob::Inline(b"blob".to_vec())));

        let taken = m.detach_attachment(0).unwrap();
        assert!(matches!(taken, Attachment::Mapping(_)));
        assert!(matches!(m.attachments()[0], Attachment::Null));
        assert!(matches!(m.attachments()[1], Attachment::Data(_)));
        assert!(m.detach_attachment(5).is_none());
    }

    #[test]
    fn shared_mapping_ids_are_unique() {
        let a = SharedMapping::new(1);
        let b = SharedMapping::new(1);
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn header_layout_is_seven_words() {
        let header = wire::Header {
            conversation_id: 1,
            message_id: 2,
            peer_id: 3,
            body_length: 4,
            attachments_length: 5,
            body_address: 6,
            attachments_address: 7,
        };
        let bytes = header.encode();
        assert_eq!(bytes.len(), wire::HEADER_BYTES);
        assert_eq!(wire::Header::decode(&bytes), Some(header));
        assert_eq!(wire::Header::decode(&bytes[..55]), None);
    }

    #[test]
    fn attachment_table_walks_and_aligns() {
        let table = [
            wire::Attachment::Channel { descriptor: 42 },
            wire::Attachment::Null,
            wire::Attachment::DataShared {
                mapping: 9,
                length: 4096,
            },
            wire::Attachment::DataInline {
                address: 0x1000,
                length: 16,
            },
        ];
        let bytes = wire::encode_attachments(&table);
        assert_eq!(bytes.len(), wire::encoded_len(&table));
        assert_eq!(bytes.len() % wire::ATTACHMENT_ALIGN, 0);
        assert_eq!(wire::decode_attachments(&bytes).unwrap(), table);

        assert!(wire::decode_attachments(&[0xff, 0, 0, 0, 0]).is_none());
        assert_eq!(wire::decode_attachments(&[]).unwrap(), Vec::new());
    }
}

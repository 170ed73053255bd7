/*
 * SPDX-License-Identifier: BlueOak-1.0.0
 * Copyright (c) Anillo OS authors
 */

//! Inter-process capability channels.
//!
//! [`message`] defines the record and its wire format, [`channel`] the
//! endpoint pairs, [`server_channel`] the named rendezvous, and
//! [`monitor`] the event/futex bridge used by user-space event loops.

pub mod channel;
pub mod message;
pub mod monitor;
pub mod server_channel;

pub use {
    channel::{
        create_pair, ChannelEnd, ReceiveFlags, ReceiveSizes, SendFlags, SendReceipt, SendRejected,
        QUEUE_DEPTH,
    },
    message::{Attachment, ConversationId, DataBlob, Message, MessageId, SharedMapping},
    monitor::{ChannelEvents, FutexTable, Monitor, TriggerMode},
    server_channel::{Namespace, Realm, ServerChannel},
};

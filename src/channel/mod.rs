//! Logical message channels multiplexed over one datagram stream.
//!
//! Each channel is an independent lane with its own delivery guarantees.
//! [`ReliableChannel`] retransmits messages until they are acked and delivers
//! them in order, including large blocks fragmented across many packets.
//! [`UnreliableChannel`] batches whatever fits under a byte budget and never
//! retries. Ordering is never preserved *across* channels.

mod reliable;
mod unreliable;

pub use reliable::ReliableChannel;
pub use unreliable::UnreliableChannel;

use thiserror::Error;
use web_time::{Duration, Instant};

use crate::{message::Message, packet::ChannelPacketData, seq::Seq};

/// Most channels a single connection may multiplex.
pub const MAX_CHANNELS: usize = 64;

/// Delivery guarantees of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    /// Every message arrives, in the order it was sent. Large blocks are
    /// fragmented and reassembled.
    ReliableOrdered,
    /// Best-effort delivery in whatever order packets land. Messages that
    /// don't fit the current packet are dropped, not deferred.
    UnreliableUnordered,
}

/// Per-channel tuning knobs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelConfig {
    /// Delivery guarantees.
    pub kind: ChannelKind,
    /// Slots in the send queue.
    pub send_queue_size: usize,
    /// Slots in the receive queue.
    pub receive_queue_size: usize,
    /// Sent-packet records kept for walking packet acks back to messages.
    pub sent_packet_buffer_size: usize,
    /// Most messages one packet may carry for this channel.
    pub max_messages_per_packet: usize,
    /// Byte cap this channel must respect within each packet, or [`None`]
    /// for no cap beyond the packet itself.
    pub packet_budget: Option<usize>,
    /// Largest block a message may carry, in bytes.
    pub max_block_size: usize,
    /// Bytes per block fragment.
    pub fragment_size: usize,
    /// How long to wait before resending an unacked message.
    pub message_resend: Duration,
    /// How long to wait before resending an unacked block fragment.
    pub fragment_resend: Duration,
    /// Refuse block messages on this channel entirely.
    pub disable_blocks: bool,
}

impl ChannelConfig {
    /// Creates the default configuration for a channel kind.
    #[must_use]
    pub fn new(kind: ChannelKind) -> Self {
        Self {
            kind,
            send_queue_size: 1024,
            receive_queue_size: 1024,
            sent_packet_buffer_size: 1024,
            max_messages_per_packet: 256,
            packet_budget: None,
            max_block_size: 256 * 1024,
            fragment_size: 1024,
            message_resend: Duration::from_millis(100),
            fragment_resend: Duration::from_millis(250),
            disable_blocks: false,
        }
    }

    /// Most fragments a block on this channel may split into.
    #[must_use]
    pub fn max_fragments_per_block(&self) -> usize {
        self.max_block_size.div_ceil(self.fragment_size)
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self::new(ChannelKind::ReliableOrdered)
    }
}

/// Unrecoverable per-channel failure.
///
/// The first error latches: every later operation on the channel is a no-op
/// until the connection is torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ChannelError {
    /// A message was sent while the send queue had no free slot.
    #[error("send queue is full")]
    SendQueueFull,
    /// A block message was sent on a channel configured without blocks.
    #[error("blocks are disabled on this channel")]
    BlocksDisabled,
    /// The peer and this channel disagree about protocol state; the session
    /// cannot recover.
    #[error("channel has desynced")]
    Desync,
    /// A received message failed to deserialize.
    #[error("failed to serialize a received message")]
    FailedToSerialize,
    /// The channel exceeded its memory allowance.
    #[error("out of memory")]
    OutOfMemory,
}

/// Running totals of channel activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelCounters {
    /// Messages accepted into the send queue.
    pub messages_sent: u64,
    /// Messages handed to the application.
    pub messages_received: u64,
    /// Block fragments written into packets.
    pub fragments_sent: u64,
    /// Block fragments accepted from packets.
    pub fragments_received: u64,
}

/// A channel of either kind, dispatched by configuration.
#[derive(Debug)]
pub enum Channel<M: Message> {
    /// See [`ReliableChannel`].
    Reliable(ReliableChannel<M>),
    /// See [`UnreliableChannel`].
    Unreliable(UnreliableChannel<M>),
}

impl<M: Message> Channel<M> {
    /// Creates a channel of the kind named by `config`.
    #[must_use]
    pub fn new(config: ChannelConfig, index: usize, now: Instant) -> Self {
        match config.kind {
            ChannelKind::ReliableOrdered => {
                Self::Reliable(ReliableChannel::new(config, index, now))
            }
            ChannelKind::UnreliableUnordered => {
                Self::Unreliable(UnreliableChannel::new(config, index))
            }
        }
    }

    /// Whether the send queue has room for another message.
    #[must_use]
    pub fn can_send_message(&self) -> bool {
        match self {
            Self::Reliable(channel) => channel.can_send_message(),
            Self::Unreliable(channel) => channel.can_send_message(),
        }
    }

    /// Queues a message to be sent across this channel.
    pub fn send_message(&mut self, message: M) {
        match self {
            Self::Reliable(channel) => channel.send_message(message),
            Self::Unreliable(channel) => channel.send_message(message),
        }
    }

    /// Pops the next received message, if one is ready.
    pub fn receive_message(&mut self) -> Option<M> {
        match self {
            Self::Reliable(channel) => channel.receive_message(),
            Self::Unreliable(channel) => channel.receive_message(),
        }
    }

    pub(crate) fn get_packet_data(
        &mut self,
        packet_sequence: Seq,
        available_bits: usize,
    ) -> Option<(ChannelPacketData<M>, usize)> {
        match self {
            Self::Reliable(channel) => channel.get_packet_data(packet_sequence, available_bits),
            Self::Unreliable(channel) => channel.get_packet_data(available_bits),
        }
    }

    pub(crate) fn process_packet_data(&mut self, data: ChannelPacketData<M>, packet_sequence: Seq) {
        match self {
            Self::Reliable(channel) => channel.process_packet_data(data, packet_sequence),
            Self::Unreliable(channel) => channel.process_packet_data(data),
        }
    }

    /// Applies a packet-level ack. Channels that did not contribute to the
    /// acked packet ignore it.
    pub fn process_ack(&mut self, packet_sequence: Seq) {
        match self {
            Self::Reliable(channel) => channel.process_ack(packet_sequence),
            Self::Unreliable(_) => {}
        }
    }

    /// Advances the channel's clock.
    pub fn advance_time(&mut self, now: Instant) {
        match self {
            Self::Reliable(channel) => channel.advance_time(now),
            Self::Unreliable(_) => {}
        }
    }

    /// Drops all channel state, including any latched error.
    pub fn reset(&mut self) {
        match self {
            Self::Reliable(channel) => channel.reset(),
            Self::Unreliable(channel) => channel.reset(),
        }
    }

    /// The latched channel error, if any.
    #[must_use]
    pub fn error(&self) -> Option<ChannelError> {
        match self {
            Self::Reliable(channel) => channel.error(),
            Self::Unreliable(channel) => channel.error(),
        }
    }

    /// Activity counters.
    #[must_use]
    pub fn counters(&self) -> &ChannelCounters {
        match self {
            Self::Reliable(channel) => channel.counters(),
            Self::Unreliable(channel) => channel.counters(),
        }
    }

    /// Rough bytes of memory held by queued messages and block scratch.
    #[must_use]
    pub fn memory_used(&self) -> usize {
        match self {
            Self::Reliable(channel) => channel.memory_used(),
            Self::Unreliable(channel) => channel.memory_used(),
        }
    }
}

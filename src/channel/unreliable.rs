//! See [`UnreliableChannel`].

use std::collections::VecDeque;

use tracing::{trace, warn};

use crate::{
    channel::{ChannelConfig, ChannelCounters, ChannelError, ChannelKind},
    message::Message,
    packet::{
        message_kind_bits, serialize_message_block, ChannelPacketData,
        CONSERVATIVE_MESSAGE_HEADER_BITS,
    },
    seq::Seq,
    stream::{MeasureStream, Stream},
};

const GIVE_UP_BITS: usize = 4 * 8;

/// Channel that batches messages into the next packet, best effort.
///
/// Messages queue only until the next packet is generated: whatever fits the
/// packet's remaining budget goes out once and is forgotten, whatever does
/// not fit is dropped on the floor rather than deferred. Blocks are not
/// fragmented here; a block message is serialized inline and must fit in one
/// packet.
#[derive(Debug)]
pub struct UnreliableChannel<M: Message> {
    config: ChannelConfig,
    index: usize,
    error: Option<ChannelError>,
    send_queue: VecDeque<M>,
    receive_queue: VecDeque<M>,
    counters: ChannelCounters,
}

impl<M: Message> UnreliableChannel<M> {
    /// Creates the channel.
    ///
    /// # Panics
    ///
    /// Panics if `config.kind` is not [`ChannelKind::UnreliableUnordered`].
    #[must_use]
    pub fn new(config: ChannelConfig, index: usize) -> Self {
        assert!(config.kind == ChannelKind::UnreliableUnordered);
        Self {
            send_queue: VecDeque::with_capacity(config.send_queue_size),
            receive_queue: VecDeque::with_capacity(config.receive_queue_size),
            config,
            index,
            error: None,
            counters: ChannelCounters::default(),
        }
    }

    /// The latched channel error, if any.
    #[must_use]
    pub const fn error(&self) -> Option<ChannelError> {
        self.error
    }

    /// Activity counters.
    #[must_use]
    pub const fn counters(&self) -> &ChannelCounters {
        &self.counters
    }

    /// Whether the send queue has room for another message.
    #[must_use]
    pub fn can_send_message(&self) -> bool {
        self.send_queue.len() < self.config.send_queue_size
    }

    /// Drops all queued messages and any latched error, keeping the config.
    pub fn reset(&mut self) {
        self.error = None;
        self.send_queue.clear();
        self.receive_queue.clear();
        self.counters = ChannelCounters::default();
    }

    fn set_error(&mut self, error: ChannelError) {
        if self.error.is_none() {
            warn!(channel = self.index, "channel error: {error}");
            self.error = Some(error);
        }
    }

    /// Queues `message` for the next generated packet.
    pub fn send_message(&mut self, message: M) {
        if self.error.is_some() {
            return;
        }
        if !self.can_send_message() {
            self.set_error(ChannelError::SendQueueFull);
            return;
        }
        if message.is_block() && self.config.disable_blocks {
            self.set_error(ChannelError::BlocksDisabled);
            return;
        }
        self.send_queue.push_back(message);
        self.counters.messages_sent += 1;
    }

    /// Pops a received message, if any.
    pub fn receive_message(&mut self) -> Option<M> {
        if self.error.is_some() {
            return None;
        }
        let message = self.receive_queue.pop_front()?;
        self.counters.messages_received += 1;
        Some(message)
    }

    /// Drains the send queue into one [`ChannelPacketData`], measuring each
    /// message (with any inline block) and dropping those that do not fit.
    pub(crate) fn get_packet_data(
        &mut self,
        mut available_bits: usize,
    ) -> Option<(ChannelPacketData<M>, usize)> {
        if self.error.is_some() || self.send_queue.is_empty() {
            return None;
        }

        if let Some(budget) = self.config.packet_budget {
            available_bits = available_bits.min(budget * 8);
        }

        let kind_bits = message_kind_bits::<M>();
        let mut used_bits = CONSERVATIVE_MESSAGE_HEADER_BITS;
        let mut messages = Vec::new();

        while let Some(mut message) = self.send_queue.pop_front() {
            if available_bits.saturating_sub(used_bits) < GIVE_UP_BITS {
                self.send_queue.push_front(message);
                break;
            }

            let mut measure = MeasureStream::new();
            let mut measure_result = message.serialize(&mut measure);
            if measure_result.is_ok() && message.is_block() {
                measure_result = serialize_message_block(
                    &mut measure,
                    &mut message,
                    self.config.max_block_size,
                );
            }
            if measure_result.is_err() {
                // unmeasurable message; drop it and move on
                continue;
            }
            let measured = measure.bits_processed();

            let message_bits = measured + kind_bits;
            if used_bits + message_bits > available_bits {
                // does not fit this packet: dropped, not deferred
                trace!(
                    channel = self.index,
                    message_bits,
                    remaining = available_bits - used_bits,
                    "dropping unreliable message over budget"
                );
                continue;
            }

            used_bits += message_bits;
            messages.push((Seq(0), message));

            if messages.len() == self.config.max_messages_per_packet {
                break;
            }
        }

        if messages.is_empty() {
            return None;
        }
        Some((
            ChannelPacketData::Messages {
                channel_index: self.index,
                messages,
            },
            used_bits,
        ))
    }

    /// Accepts received messages until the receive queue is full; the rest
    /// are dropped.
    pub(crate) fn process_packet_data(&mut self, data: ChannelPacketData<M>) {
        if self.error.is_some() {
            return;
        }
        match data {
            ChannelPacketData::Failed { .. } => self.set_error(ChannelError::FailedToSerialize),
            ChannelPacketData::Messages { messages, .. } => {
                for (_, message) in messages {
                    if self.receive_queue.len() < self.config.receive_queue_size {
                        self.receive_queue.push_back(message);
                    }
                }
            }
            ChannelPacketData::Block { .. } => {
                // fragmented transfer has no meaning on an unreliable channel
                self.set_error(ChannelError::Desync);
            }
        }
    }

    /// Rough bytes of memory held by queued messages.
    #[must_use]
    pub fn memory_used(&self) -> usize {
        let blocks: usize = self
            .send_queue
            .iter()
            .chain(self.receive_queue.iter())
            .filter_map(|message| message.block().map(bytes::Bytes::len))
            .sum();
        blocks
            + (self.send_queue.len() + self.receive_queue.len()) * core::mem::size_of::<M>()
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use crate::StreamError;

    use super::*;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum TestMessage {
        Value(u32),
        Blob(Bytes),
    }

    impl Message for TestMessage {
        fn kind(&self) -> u16 {
            match self {
                Self::Value(_) => 0,
                Self::Blob(_) => 1,
            }
        }

        fn num_kinds() -> u16 {
            2
        }

        fn create(kind: u16) -> Option<Self> {
            match kind {
                0 => Some(Self::Value(0)),
                1 => Some(Self::Blob(Bytes::new())),
                _ => None,
            }
        }

        fn serialize(&mut self, stream: &mut impl Stream) -> Result<(), StreamError> {
            match self {
                Self::Value(value) => stream.serialize_bits(value, 32),
                Self::Blob(_) => Ok(()),
            }
        }

        fn is_block(&self) -> bool {
            matches!(self, Self::Blob(_))
        }

        fn block(&self) -> Option<&Bytes> {
            match self {
                Self::Blob(data) => Some(data),
                _ => None,
            }
        }

        fn attach_block(&mut self, block: Bytes) {
            if let Self::Blob(data) = self {
                *data = block;
            }
        }
    }

    fn channel() -> UnreliableChannel<TestMessage> {
        UnreliableChannel::new(ChannelConfig::new(ChannelKind::UnreliableUnordered), 0)
    }

    #[test]
    fn round_trip() {
        let mut sender = channel();
        let mut receiver = channel();

        for i in 0..10 {
            sender.send_message(TestMessage::Value(i));
        }
        let (data, _) = sender.get_packet_data(8 * 1024 * 8).unwrap();
        receiver.process_packet_data(data);

        for i in 0..10 {
            assert_eq!(Some(TestMessage::Value(i)), receiver.receive_message());
        }
        assert_eq!(None, receiver.receive_message());
    }

    #[test]
    fn over_budget_messages_dropped_not_deferred() {
        let mut config = ChannelConfig::new(ChannelKind::UnreliableUnordered);
        // a 200 byte budget fits four ~43 byte messages plus overhead
        config.packet_budget = Some(200);
        let mut sender: UnreliableChannel<TestMessage> = UnreliableChannel::new(config, 0);

        for _ in 0..50 {
            sender.send_message(TestMessage::Blob(Bytes::from(vec![0xAB; 40])));
        }
        let (data, _) = sender.get_packet_data(usize::MAX).unwrap();
        let ChannelPacketData::Messages { messages, .. } = data else {
            panic!("expected messages entry");
        };
        assert_eq!(4, messages.len());

        // everything else was dropped, not deferred: the next packet is empty
        assert!(sender.get_packet_data(usize::MAX).is_none());
    }

    #[test]
    fn block_serialized_inline() {
        let mut sender = channel();
        let mut receiver = channel();

        let blob: Vec<u8> = (0..200).collect();
        sender.send_message(TestMessage::Blob(Bytes::from(blob.clone())));
        let (data, _) = sender.get_packet_data(8 * 1024 * 8).unwrap();
        receiver.process_packet_data(data);

        let Some(TestMessage::Blob(received)) = receiver.receive_message() else {
            panic!("expected block message");
        };
        assert_eq!(blob, received.to_vec());
    }

    #[test]
    fn receive_queue_overflow_drops_silently() {
        let mut config = ChannelConfig::new(ChannelKind::UnreliableUnordered);
        config.receive_queue_size = 4;
        let mut receiver: UnreliableChannel<TestMessage> = UnreliableChannel::new(config, 0);

        let messages = (0..8).map(|i| (Seq(0), TestMessage::Value(i))).collect();
        receiver.process_packet_data(ChannelPacketData::Messages {
            channel_index: 0,
            messages,
        });

        let mut received = 0;
        while receiver.receive_message().is_some() {
            received += 1;
        }
        assert_eq!(4, received);
        assert_eq!(None, receiver.error());
    }

    #[test]
    fn send_queue_overflow_latches_error() {
        let mut config = ChannelConfig::new(ChannelKind::UnreliableUnordered);
        config.send_queue_size = 2;
        let mut sender: UnreliableChannel<TestMessage> = UnreliableChannel::new(config, 0);

        sender.send_message(TestMessage::Value(0));
        sender.send_message(TestMessage::Value(1));
        assert_eq!(None, sender.error());
        sender.send_message(TestMessage::Value(2));
        assert_eq!(Some(ChannelError::SendQueueFull), sender.error());
    }
}

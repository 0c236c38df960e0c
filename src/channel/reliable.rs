//! See [`ReliableChannel`].

use bitvec::vec::BitVec;
use bytes::Bytes;
use tracing::{debug, trace, warn};
use web_time::Instant;

use crate::{
    channel::{ChannelConfig, ChannelCounters, ChannelError, ChannelKind},
    message::Message,
    packet::{
        message_kind_bits, ChannelPacketData, CONSERVATIVE_FRAGMENT_HEADER_BITS,
        CONSERVATIVE_MESSAGE_HEADER_BITS,
    },
    seq::Seq,
    seq_buf::SeqBuf,
    stream::{MeasureStream, Stream},
};

// a scan candidate must leave at least this many bits of headroom
const GIVE_UP_BITS: usize = 4 * 8;

#[derive(Debug)]
struct SendEntry<M> {
    message: M,
    measured_bits: usize,
    next_send_at: Instant,
    is_block: bool,
}

#[derive(Debug)]
struct ReceiveEntry<M> {
    message: M,
}

#[derive(Debug, Clone)]
enum SentPacketInfo {
    Messages(Vec<Seq>),
    Fragment { message_id: Seq, fragment_id: usize },
}

#[derive(Debug)]
struct SentPacket {
    acked: bool,
    info: SentPacketInfo,
}

#[derive(Debug)]
struct SendBlock {
    message_id: Seq,
    block_size: usize,
    num_fragments: usize,
    num_acked: usize,
    acked: BitVec,
    next_send_at: Vec<Instant>,
}

#[derive(Debug)]
struct ReceiveBlock<M> {
    message_id: Seq,
    num_fragments: usize,
    num_received: usize,
    received: BitVec,
    block_size: usize,
    data: Vec<u8>,
    message: Option<M>,
}

/// Channel that delivers every message exactly once, in send order.
///
/// Outgoing messages wait in a send queue until a packet that contained them
/// is acked; each generated packet records which message ids it carried so a
/// packet-level ack can be walked back to the messages (and block fragments)
/// it covered. Incoming messages land in a sparse receive window and are
/// handed to the application strictly in id order.
///
/// A message carrying a block is transferred as the only thing in flight on
/// the channel: once it reaches the head of the send queue, the channel emits
/// nothing but its fragments until every fragment is acked. This bounds
/// receive-side reassembly memory to one block and keeps fragment scheduling
/// trivial; callers that need concurrent large transfers should use several
/// channels.
#[derive(Debug)]
pub struct ReliableChannel<M: Message> {
    config: ChannelConfig,
    index: usize,
    now: Instant,
    error: Option<ChannelError>,

    send_queue: SeqBuf<SendEntry<M>>,
    receive_queue: SeqBuf<ReceiveEntry<M>>,
    sent_packets: SeqBuf<SentPacket>,

    next_send_id: Seq,
    next_receive_id: Seq,
    oldest_unacked_id: Seq,

    send_block: Option<SendBlock>,
    receive_block: Option<ReceiveBlock<M>>,

    counters: ChannelCounters,
}

impl<M: Message> ReliableChannel<M> {
    /// Creates the channel.
    ///
    /// # Panics
    ///
    /// Panics if `config.kind` is not [`ChannelKind::ReliableOrdered`].
    #[must_use]
    pub fn new(config: ChannelConfig, index: usize, now: Instant) -> Self {
        assert!(config.kind == ChannelKind::ReliableOrdered);
        Self {
            send_queue: SeqBuf::new(config.send_queue_size),
            receive_queue: SeqBuf::new(config.receive_queue_size),
            sent_packets: SeqBuf::new(config.sent_packet_buffer_size),
            config,
            index,
            now,
            error: None,
            next_send_id: Seq::default(),
            next_receive_id: Seq::default(),
            oldest_unacked_id: Seq::default(),
            send_block: None,
            receive_block: None,
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
        self.send_queue.available(self.next_send_id)
    }

    /// Whether any queued message is still waiting to be sent or acked.
    #[must_use]
    pub fn has_messages_to_send(&self) -> bool {
        self.oldest_unacked_id != self.next_send_id
    }

    /// Advances the channel clock. Resend timers compare against this.
    pub fn advance_time(&mut self, now: Instant) {
        self.now = now;
    }

    /// Drops all channel state, including any latched error, keeping the
    /// config and clock.
    pub fn reset(&mut self) {
        self.error = None;
        self.send_queue.reset();
        self.receive_queue.reset();
        self.sent_packets.reset();
        self.next_send_id = Seq::default();
        self.next_receive_id = Seq::default();
        self.oldest_unacked_id = Seq::default();
        self.send_block = None;
        self.receive_block = None;
        self.counters = ChannelCounters::default();
    }

    fn set_error(&mut self, error: ChannelError) {
        if self.error.is_none() {
            warn!(channel = self.index, "channel error: {error}");
            self.error = Some(error);
        }
    }

    /// Queues `message` for delivery, assigning it the next message id.
    ///
    /// On a full send queue the channel latches
    /// [`ChannelError::SendQueueFull`] and the message is dropped; sending a
    /// block message on a channel with blocks disabled latches
    /// [`ChannelError::BlocksDisabled`].
    pub fn send_message(&mut self, message: M) {
        if self.error.is_some() {
            return;
        }
        if !self.can_send_message() {
            self.set_error(ChannelError::SendQueueFull);
            return;
        }
        if message.is_block() {
            if self.config.disable_blocks {
                self.set_error(ChannelError::BlocksDisabled);
                return;
            }
            let block_size = message.block().map_or(0, Bytes::len);
            debug_assert!(block_size > 0 && block_size <= self.config.max_block_size);
        }

        let mut message = message;
        let mut measure = MeasureStream::new();
        if message.serialize(&mut measure).is_err() {
            self.set_error(ChannelError::FailedToSerialize);
            return;
        }

        let id = self.next_send_id.get_inc();
        let is_block = message.is_block();
        self.send_queue.insert(
            id,
            SendEntry {
                message,
                measured_bits: measure.bits_processed(),
                next_send_at: self.now,
                is_block,
            },
        );
        self.counters.messages_sent += 1;
    }

    /// Pops the next message in id order, or [`None`] if it has not arrived
    /// yet. This is what enforces in-order delivery.
    pub fn receive_message(&mut self) -> Option<M> {
        if self.error.is_some() {
            return None;
        }
        let entry = self.receive_queue.remove(self.next_receive_id)?;
        self.next_receive_id = self.next_receive_id.wrapping_add(1);
        self.counters.messages_received += 1;
        Some(entry.message)
    }

    fn sending_block(&self) -> bool {
        self.send_queue
            .get(self.oldest_unacked_id)
            .is_some_and(|entry| entry.is_block)
    }

    /// Fills at most one [`ChannelPacketData`] for the packet being built,
    /// returning it with the bits it will consume.
    ///
    /// While the head of the send queue is a block message the channel is in
    /// block mode and only emits fragments; otherwise it scans the send
    /// window for messages that fit `available_bits` and are due a (re)send.
    pub(crate) fn get_packet_data(
        &mut self,
        packet_sequence: Seq,
        available_bits: usize,
    ) -> Option<(ChannelPacketData<M>, usize)> {
        if self.error.is_some() || !self.has_messages_to_send() {
            return None;
        }

        if self.sending_block() {
            return self.get_fragment_to_send(packet_sequence);
        }

        let (message_ids, used_bits) = self.get_messages_to_send(available_bits);
        if message_ids.is_empty() {
            return None;
        }

        let messages = message_ids
            .iter()
            .map(|&id| {
                let entry = self
                    .send_queue
                    .get(id)
                    .expect("picked ids are present in the send queue");
                (id, entry.message.clone())
            })
            .collect();
        self.sent_packets.insert(
            packet_sequence,
            SentPacket {
                acked: false,
                info: SentPacketInfo::Messages(message_ids),
            },
        );

        Some((
            ChannelPacketData::Messages {
                channel_index: self.index,
                messages,
            },
            used_bits,
        ))
    }

    // Walks the send window from the oldest unacked id, greedily taking
    // messages that are due and fit. The scan gives up after examining a
    // send queue's worth of candidates that do not fit, keeping it O(N).
    fn get_messages_to_send(&mut self, mut available_bits: usize) -> (Vec<Seq>, usize) {
        debug_assert!(self.has_messages_to_send());

        if let Some(budget) = self.config.packet_budget {
            available_bits = available_bits.min(budget * 8);
        }

        let kind_bits = message_kind_bits::<M>();
        // never scan further ahead than the peer's receive window can hold
        let message_limit = self
            .config
            .send_queue_size
            .min(self.config.receive_queue_size);

        let mut message_ids = Vec::new();
        let mut previous_id = Seq::default();
        let mut used_bits = CONSERVATIVE_MESSAGE_HEADER_BITS;
        let mut give_up_counter = 0usize;

        for i in 0..message_limit {
            if available_bits.saturating_sub(used_bits) < GIVE_UP_BITS {
                break;
            }
            if give_up_counter > self.config.send_queue_size {
                break;
            }

            let message_id = self.oldest_unacked_id.wrapping_add(i as u16);
            let Some(entry) = self.send_queue.get_mut(message_id) else {
                continue;
            };
            if entry.is_block {
                // fragments are only ever emitted for the head block; a block
                // further down the window waits its turn
                break;
            }

            if entry.next_send_at <= self.now && available_bits >= entry.measured_bits {
                let mut message_bits = entry.measured_bits + kind_bits;
                if message_ids.is_empty() {
                    message_bits += 16;
                } else {
                    message_bits += relative_seq_bits(previous_id, message_id);
                }

                if used_bits + message_bits > available_bits {
                    give_up_counter += 1;
                    continue;
                }

                used_bits += message_bits;
                message_ids.push(message_id);
                entry.next_send_at = self.now + self.config.message_resend;
                previous_id = message_id;
            }

            if message_ids.len() == self.config.max_messages_per_packet {
                break;
            }
        }

        (message_ids, used_bits)
    }

    // Picks the next unacked, due fragment of the head block, starting a new
    // block transfer if the head block has none in progress.
    fn get_fragment_to_send(
        &mut self,
        packet_sequence: Seq,
    ) -> Option<(ChannelPacketData<M>, usize)> {
        let message_id = self.oldest_unacked_id;
        let entry = self
            .send_queue
            .get(message_id)
            .expect("head of send queue is present in block mode");
        debug_assert!(entry.is_block);
        let block = entry.message.block()?;
        let block_size = block.len();

        let starting_new_block = self
            .send_block
            .as_ref()
            .map_or(true, |send_block| send_block.message_id != message_id);
        if starting_new_block {
            let num_fragments = block_size.div_ceil(self.config.fragment_size);
            debug_assert!(
                num_fragments >= 1 && num_fragments <= self.config.max_fragments_per_block()
            );
            trace!(
                channel = self.index,
                message_id = %message_id,
                num_fragments,
                "starting block send"
            );
            self.send_block = Some(SendBlock {
                message_id,
                block_size,
                num_fragments,
                num_acked: 0,
                acked: BitVec::repeat(false, num_fragments),
                next_send_at: vec![self.now; num_fragments],
            });
        }

        let send_block = self
            .send_block
            .as_mut()
            .expect("send block state was just ensured");
        let num_fragments = send_block.num_fragments;
        let fragment_id = (0..num_fragments)
            .find(|&i| !send_block.acked[i] && send_block.next_send_at[i] <= self.now)?;
        send_block.next_send_at[fragment_id] = self.now + self.config.fragment_resend;

        let start = fragment_id * self.config.fragment_size;
        let end = block_size.min(start + self.config.fragment_size);
        let fragment = block.slice(start..end);

        let mut bits = CONSERVATIVE_FRAGMENT_HEADER_BITS + (end - start) * 8;
        let message = if fragment_id == 0 {
            bits += entry.measured_bits + message_kind_bits::<M>();
            Some(entry.message.clone())
        } else {
            None
        };

        self.sent_packets.insert(
            packet_sequence,
            SentPacket {
                acked: false,
                info: SentPacketInfo::Fragment {
                    message_id,
                    fragment_id,
                },
            },
        );
        self.counters.fragments_sent += 1;

        Some((
            ChannelPacketData::Block {
                channel_index: self.index,
                message_id,
                num_fragments,
                fragment_id,
                fragment,
                message,
            },
            bits,
        ))
    }

    /// Applies one received channel entry.
    pub(crate) fn process_packet_data(
        &mut self,
        data: ChannelPacketData<M>,
        _packet_sequence: Seq,
    ) {
        if self.error.is_some() {
            return;
        }
        match data {
            ChannelPacketData::Failed { .. } => self.set_error(ChannelError::FailedToSerialize),
            ChannelPacketData::Messages { messages, .. } => self.process_messages(messages),
            ChannelPacketData::Block {
                message_id,
                num_fragments,
                fragment_id,
                fragment,
                message,
                ..
            } => self.process_fragment(message_id, num_fragments, fragment_id, &fragment, message),
        }
    }

    fn process_messages(&mut self, messages: Vec<(Seq, M)>) {
        let min_id = self.next_receive_id;
        let max_id = self
            .next_receive_id
            .wrapping_add(self.config.receive_queue_size as u16 - 1);

        for (message_id, message) in messages {
            if message_id < min_id {
                // already delivered and dequeued
                continue;
            }
            if message_id > max_id {
                debug!(
                    channel = self.index,
                    message_id = %message_id,
                    max_id = %max_id,
                    "message id beyond receive window"
                );
                self.set_error(ChannelError::Desync);
                return;
            }
            if self.receive_queue.exists(message_id) {
                continue;
            }
            self.receive_queue.insert(message_id, ReceiveEntry { message });
        }
    }

    fn process_fragment(
        &mut self,
        message_id: Seq,
        num_fragments: usize,
        fragment_id: usize,
        fragment: &Bytes,
        message: Option<M>,
    ) {
        debug_assert!(!self.config.disable_blocks);

        // blocks are delivered strictly in order within the message stream
        if message_id != self.next_receive_id {
            return;
        }

        if num_fragments > self.config.max_fragments_per_block() || fragment_id >= num_fragments {
            self.set_error(ChannelError::Desync);
            return;
        }

        if self.receive_block.is_none() {
            self.receive_block = Some(ReceiveBlock {
                message_id,
                num_fragments,
                num_received: 0,
                received: BitVec::repeat(false, num_fragments),
                block_size: 0,
                data: vec![0; num_fragments * self.config.fragment_size],
                message: None,
            });
        }

        {
            let receive_block = self
                .receive_block
                .as_ref()
                .expect("receive block state was just ensured");
            if num_fragments != receive_block.num_fragments
                || receive_block.message_id != message_id
            {
                self.set_error(ChannelError::Desync);
                return;
            }
            if receive_block.received[fragment_id] {
                return;
            }
        }
        if fragment_id != num_fragments - 1 && fragment.len() != self.config.fragment_size {
            self.set_error(ChannelError::Desync);
            return;
        }
        if fragment_id == num_fragments - 1 {
            let block_size = (num_fragments - 1) * self.config.fragment_size + fragment.len();
            if block_size > self.config.max_block_size {
                self.set_error(ChannelError::Desync);
                return;
            }
        }

        let receive_block = self
            .receive_block
            .as_mut()
            .expect("receive block state was just ensured");
        let start = fragment_id * self.config.fragment_size;
        receive_block.data[start..start + fragment.len()].copy_from_slice(fragment);
        receive_block.received.set(fragment_id, true);
        receive_block.num_received += 1;
        if fragment_id == 0 {
            receive_block.message = message;
        }
        if fragment_id == num_fragments - 1 {
            receive_block.block_size =
                (num_fragments - 1) * self.config.fragment_size + fragment.len();
        }
        self.counters.fragments_received += 1;
        trace!(
            channel = self.index,
            message_id = %message_id,
            fragment_id,
            progress = receive_block.num_received,
            total = num_fragments,
            "received block fragment"
        );

        if receive_block.num_received == receive_block.num_fragments {
            let receive_block = self
                .receive_block
                .take()
                .expect("receive block state is active");
            let Some(mut message) = receive_block.message else {
                self.set_error(ChannelError::Desync);
                return;
            };
            let mut data = receive_block.data;
            data.truncate(receive_block.block_size);
            message.attach_block(Bytes::from(data));
            self.receive_queue.insert(message_id, ReceiveEntry { message });
        }
    }

    /// Walks a packet-level ack back to the messages or block fragment the
    /// packet carried, releasing acked messages from the send queue.
    pub fn process_ack(&mut self, packet_sequence: Seq) {
        let Some(entry) = self.sent_packets.get_mut(packet_sequence) else {
            return;
        };
        if entry.acked {
            return;
        }
        entry.acked = true;

        match entry.info.clone() {
            SentPacketInfo::Messages(message_ids) => {
                for message_id in message_ids {
                    if self.send_queue.remove(message_id).is_some() {
                        self.update_oldest_unacked();
                    }
                }
            }
            SentPacketInfo::Fragment {
                message_id,
                fragment_id,
            } => {
                let Some(send_block) = self.send_block.as_mut() else {
                    return;
                };
                if send_block.message_id != message_id || send_block.acked[fragment_id] {
                    return;
                }
                send_block.acked.set(fragment_id, true);
                send_block.num_acked += 1;
                if send_block.num_acked == send_block.num_fragments {
                    trace!(
                        channel = self.index,
                        message_id = %message_id,
                        "block fully acked"
                    );
                    self.send_block = None;
                    self.send_queue.remove(message_id);
                    self.update_oldest_unacked();
                }
            }
        }
    }

    fn update_oldest_unacked(&mut self) {
        let stop = self.next_send_id;
        while self.oldest_unacked_id != stop && !self.send_queue.exists(self.oldest_unacked_id) {
            self.oldest_unacked_id = self.oldest_unacked_id.wrapping_add(1);
        }
        debug_assert!(self.oldest_unacked_id <= stop);
    }

    /// Rough bytes of memory held by this channel's scratch and queues.
    #[must_use]
    pub fn memory_used(&self) -> usize {
        let receive_scratch = self
            .receive_block
            .as_ref()
            .map_or(0, |receive_block| receive_block.data.len());
        let send_scratch = self
            .send_block
            .as_ref()
            .map_or(0, |send_block| send_block.block_size);
        let queues = (self.config.send_queue_size + self.config.receive_queue_size)
            * core::mem::size_of::<M>();
        receive_scratch + send_scratch + queues
    }
}

// wire cost of encoding `current` relative to `previous`
fn relative_seq_bits(previous: Seq, current: Seq) -> usize {
    let mut measure = MeasureStream::new();
    let mut current = current;
    measure
        .serialize_seq_relative(previous, &mut current)
        .expect("measuring never runs out of space");
    measure.bits_processed()
}

#[cfg(test)]
mod tests {
    use web_time::Duration;

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

        fn serialize(&mut self, stream: &mut impl Stream) -> Result<(), crate::StreamError> {
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

    fn channel_at(now: Instant) -> ReliableChannel<TestMessage> {
        ReliableChannel::new(ChannelConfig::new(ChannelKind::ReliableOrdered), 0, now)
    }

    fn channel() -> ReliableChannel<TestMessage> {
        channel_at(Instant::now())
    }

    #[test]
    fn round_trip_in_order() {
        let mut sender = channel();
        let mut receiver = channel();

        for i in 0..5 {
            sender.send_message(TestMessage::Value(i));
        }

        let (data, bits) = sender.get_packet_data(Seq(0), 8 * 1024 * 8).unwrap();
        assert!(bits > 0);
        receiver.process_packet_data(data, Seq(0));

        for i in 0..5 {
            assert_eq!(Some(TestMessage::Value(i)), receiver.receive_message());
        }
        assert_eq!(None, receiver.receive_message());
    }

    #[test]
    fn out_of_order_entries_deliver_in_order() {
        let mut sender = channel();
        let mut receiver = channel();

        for i in 0..4 {
            sender.send_message(TestMessage::Value(i));
        }
        let (first, _) = sender.get_packet_data(Seq(0), 8 * 1024 * 8).unwrap();

        // resend eligibility comes back after the resend interval
        sender.advance_time(Instant::now() + Duration::from_millis(200));
        let (second, _) = sender.get_packet_data(Seq(1), 8 * 1024 * 8).unwrap();

        // deliver the later copy first; delivery order must not change
        receiver.process_packet_data(second, Seq(1));
        receiver.process_packet_data(first, Seq(0));

        for i in 0..4 {
            assert_eq!(Some(TestMessage::Value(i)), receiver.receive_message());
        }
    }

    #[test]
    fn ack_releases_messages_and_stops_resend() {
        let mut sender = channel();
        for i in 0..3 {
            sender.send_message(TestMessage::Value(i));
        }
        let (_, _) = sender.get_packet_data(Seq(0), 8 * 1024 * 8).unwrap();
        assert!(sender.has_messages_to_send());

        sender.process_ack(Seq(0));
        assert!(!sender.has_messages_to_send());

        // nothing left to send even after the resend timer fires
        sender.advance_time(Instant::now() + Duration::from_secs(1));
        assert!(sender.get_packet_data(Seq(1), 8 * 1024 * 8).is_none());
    }

    #[test]
    fn unacked_messages_resend_after_interval() {
        let start = Instant::now();
        let mut sender = channel_at(start);
        sender.send_message(TestMessage::Value(7));

        let (_, _) = sender.get_packet_data(Seq(0), 8 * 1024 * 8).unwrap();
        // too soon: the message is not yet due again
        assert!(sender.get_packet_data(Seq(1), 8 * 1024 * 8).is_none());

        sender.advance_time(start + Duration::from_millis(150));
        assert!(sender.get_packet_data(Seq(2), 8 * 1024 * 8).is_some());
    }

    #[test]
    fn out_of_window_id_latches_desync() {
        let mut receiver = channel();
        let far_id = Seq(receiver.config.receive_queue_size as u16 + 10);
        receiver.process_packet_data(
            ChannelPacketData::Messages {
                channel_index: 0,
                messages: vec![(far_id, TestMessage::Value(1))],
            },
            Seq(0),
        );
        assert_eq!(Some(ChannelError::Desync), receiver.error());
        assert_eq!(None, receiver.receive_message());
    }

    #[test]
    fn send_queue_overflow_latches_error() {
        let mut config = ChannelConfig::new(ChannelKind::ReliableOrdered);
        config.send_queue_size = 4;
        let mut sender: ReliableChannel<TestMessage> =
            ReliableChannel::new(config, 0, Instant::now());

        for i in 0..4 {
            sender.send_message(TestMessage::Value(i));
        }
        assert_eq!(None, sender.error());
        sender.send_message(TestMessage::Value(99));
        assert_eq!(Some(ChannelError::SendQueueFull), sender.error());
    }

    #[test]
    fn blocks_disabled_latches_error() {
        let mut config = ChannelConfig::new(ChannelKind::ReliableOrdered);
        config.disable_blocks = true;
        let mut sender: ReliableChannel<TestMessage> =
            ReliableChannel::new(config, 0, Instant::now());

        sender.send_message(TestMessage::Blob(Bytes::from(vec![1, 2, 3])));
        assert_eq!(Some(ChannelError::BlocksDisabled), sender.error());
    }

    #[test]
    fn block_transfers_fragment_by_fragment() {
        let start = Instant::now();
        let mut sender = channel_at(start);
        let mut receiver = channel_at(start);

        let block: Vec<u8> = (0..3000u32).map(|i| (i % 256) as u8).collect();
        sender.send_message(TestMessage::Blob(Bytes::from(block.clone())));

        // fragments go out one per packet, gated by the resend timer
        let mut packet_seq = 0;
        let mut now = start;
        loop {
            let Some((data, _)) = sender.get_packet_data(Seq(packet_seq), 8 * 1024 * 8) else {
                now += Duration::from_millis(300);
                sender.advance_time(now);
                continue;
            };
            receiver.process_packet_data(data, Seq(packet_seq));
            sender.process_ack(Seq(packet_seq));
            packet_seq += 1;
            if !sender.has_messages_to_send() {
                break;
            }
        }
        assert_eq!(3, packet_seq);

        let Some(TestMessage::Blob(received)) = receiver.receive_message() else {
            panic!("expected reassembled block message");
        };
        assert_eq!(block, received.to_vec());
    }

    #[test]
    fn block_excludes_messages_until_acked() {
        let start = Instant::now();
        let mut sender = channel_at(start);

        sender.send_message(TestMessage::Blob(Bytes::from(vec![7u8; 2000])));
        for i in 0..3 {
            sender.send_message(TestMessage::Value(i));
        }

        // while the block is head of queue, only fragments come out
        let (data, _) = sender.get_packet_data(Seq(0), 8 * 1024 * 8).unwrap();
        assert!(matches!(data, ChannelPacketData::Block { .. }));
        let (data, _) = sender.get_packet_data(Seq(1), 8 * 1024 * 8).unwrap();
        assert!(matches!(data, ChannelPacketData::Block { .. }));
        // both fragments in flight, none acked: nothing more to emit
        assert!(sender.get_packet_data(Seq(2), 8 * 1024 * 8).is_none());

        sender.process_ack(Seq(0));
        sender.process_ack(Seq(1));

        // block complete: small messages may flow
        sender.advance_time(start + Duration::from_millis(1));
        let (data, _) = sender.get_packet_data(Seq(3), 8 * 1024 * 8).unwrap();
        assert!(matches!(data, ChannelPacketData::Messages { .. }));
    }

    #[test]
    fn duplicate_fragment_ignored() {
        let mut receiver = channel();
        let fragment = Bytes::from(vec![1u8; 1024]);

        receiver.process_packet_data(
            ChannelPacketData::Block {
                channel_index: 0,
                message_id: Seq(0),
                num_fragments: 2,
                fragment_id: 0,
                fragment: fragment.clone(),
                message: Some(TestMessage::Blob(Bytes::new())),
            },
            Seq(0),
        );
        receiver.process_packet_data(
            ChannelPacketData::Block {
                channel_index: 0,
                message_id: Seq(0),
                num_fragments: 2,
                fragment_id: 0,
                fragment,
                message: Some(TestMessage::Blob(Bytes::new())),
            },
            Seq(1),
        );

        assert_eq!(1, receiver.counters().fragments_received);
        assert_eq!(None, receiver.error());
    }

    #[test]
    fn fragment_count_mismatch_latches_desync() {
        let mut receiver = channel();
        receiver.process_packet_data(
            ChannelPacketData::Block {
                channel_index: 0,
                message_id: Seq(0),
                num_fragments: 4,
                fragment_id: 0,
                fragment: Bytes::from(vec![1u8; 1024]),
                message: Some(TestMessage::Blob(Bytes::new())),
            },
            Seq(0),
        );
        receiver.process_packet_data(
            ChannelPacketData::Block {
                channel_index: 0,
                message_id: Seq(0),
                num_fragments: 3,
                fragment_id: 1,
                fragment: Bytes::from(vec![1u8; 1024]),
                message: None,
            },
            Seq(1),
        );
        assert_eq!(Some(ChannelError::Desync), receiver.error());
    }
}

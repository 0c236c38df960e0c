//! See [`Connection`].

use thiserror::Error;
use tracing::{debug, warn};
use web_time::Instant;

use crate::{
    channel::{Channel, ChannelConfig, ChannelError, ChannelKind, MAX_CHANNELS},
    message::Message,
    packet::{
        self, ChannelPacketData, CONSERVATIVE_CHANNEL_HEADER_BITS,
        CONSERVATIVE_PACKET_HEADER_BITS,
    },
    seq::Seq,
};

/// Connection-wide tuning knobs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    /// Configurations of the channels multiplexed on this connection, at
    /// most [`MAX_CHANNELS`].
    pub channels: Vec<ChannelConfig>,
    /// Largest connection payload generated into one datagram, in bytes.
    pub max_packet_size: usize,
    /// Memory ceiling for the connection's queues and scratch buffers. A
    /// peer that pushes the connection past this is disconnected rather than
    /// allowed to exhaust the process.
    pub max_memory_usage: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            channels: vec![ChannelConfig::new(ChannelKind::ReliableOrdered)],
            max_packet_size: 8 * 1024,
            max_memory_usage: 4 * 1024 * 1024,
        }
    }
}

/// Unrecoverable connection failure.
///
/// Latches like channel errors do: the caller polls
/// [`Connection::error`] after [`Connection::advance_time`] and tears the
/// session down on any value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ConnectionError {
    /// A channel latched an error; see [`Connection::channel_error`].
    #[error("a channel is in an error state")]
    Channel,
    /// A received packet could not be parsed at all.
    #[error("failed to read packet")]
    ReadPacketFailed,
    /// The connection exceeded [`ConnectionConfig::max_memory_usage`].
    #[error("out of memory")]
    OutOfMemory,
}

/// Multiplexes up to [`MAX_CHANNELS`] message channels onto one datagram
/// stream.
///
/// The connection does no I/O and keeps no clock of its own: the caller
/// pairs it with an [`Endpoint`](crate::Endpoint) (or any transport that
/// numbers packets and reports acks), pumping
/// [`Connection::generate_packet`] into the transport's send path,
/// transport payloads into [`Connection::process_packet`], and transport
/// acks into [`Connection::process_acks`].
#[derive(Debug)]
pub struct Connection<M: Message> {
    config: ConnectionConfig,
    channels: Vec<Channel<M>>,
    error: Option<ConnectionError>,
}

impl<M: Message> Connection<M> {
    /// Creates a connection with one channel per entry in
    /// `config.channels`.
    ///
    /// # Panics
    ///
    /// Panics if there are zero channels or more than [`MAX_CHANNELS`].
    #[must_use]
    pub fn new(config: ConnectionConfig, now: Instant) -> Self {
        assert!(!config.channels.is_empty() && config.channels.len() <= MAX_CHANNELS);
        let channels = config
            .channels
            .iter()
            .enumerate()
            .map(|(index, channel_config)| Channel::new(channel_config.clone(), index, now))
            .collect();
        Self {
            config,
            channels,
            error: None,
        }
    }

    /// The latched connection error, if any.
    #[must_use]
    pub const fn error(&self) -> Option<ConnectionError> {
        self.error
    }

    /// The latched error of one channel, if any.
    ///
    /// # Panics
    ///
    /// Panics if `channel_index` is out of range.
    #[must_use]
    pub fn channel_error(&self, channel_index: usize) -> Option<ChannelError> {
        self.channels[channel_index].error()
    }

    /// Whether `channel_index`'s send queue has room for another message.
    ///
    /// # Panics
    ///
    /// Panics if `channel_index` is out of range.
    #[must_use]
    pub fn can_send_message(&self, channel_index: usize) -> bool {
        self.channels[channel_index].can_send_message()
    }

    /// Queues `message` on a channel.
    ///
    /// # Panics
    ///
    /// Panics if `channel_index` is out of range.
    pub fn send_message(&mut self, channel_index: usize, message: M) {
        self.channels[channel_index].send_message(message);
    }

    /// Pops the next received message from a channel, if one is ready.
    ///
    /// # Panics
    ///
    /// Panics if `channel_index` is out of range.
    pub fn receive_message(&mut self, channel_index: usize) -> Option<M> {
        self.channels[channel_index].receive_message()
    }

    /// Builds the payload for outgoing packet `packet_sequence` into `buf`,
    /// returning the bytes written.
    ///
    /// Each channel contributes at most one entry, all under a shared bit
    /// budget derived from `buf`'s length. An empty payload (entry count
    /// zero) is still produced so that ack information keeps flowing on an
    /// otherwise idle connection.
    pub fn generate_packet(&mut self, packet_sequence: Seq, buf: &mut [u8]) -> usize {
        if self.error.is_some() {
            return 0;
        }

        let max_bytes = buf.len().min(self.config.max_packet_size);
        let mut available_bits = max_bytes
            .saturating_mul(8)
            .saturating_sub(CONSERVATIVE_PACKET_HEADER_BITS);

        let mut entries = Vec::new();
        for channel in &mut self.channels {
            let Some((data, bits)) = channel.get_packet_data(packet_sequence, available_bits)
            else {
                continue;
            };
            available_bits = available_bits.saturating_sub(bits + CONSERVATIVE_CHANNEL_HEADER_BITS);
            entries.push(data);
        }

        // the bit writer wants a whole number of words
        let mut scratch = vec![0u8; (max_bytes + 3) & !3];
        match packet::write_packet(&self.config.channels, &mut entries, &mut scratch) {
            Ok(written) if written <= buf.len() => {
                buf[..written].copy_from_slice(&scratch[..written]);
                written
            }
            Ok(written) => {
                warn!(written, capacity = buf.len(), "generated packet overran its buffer");
                debug_assert!(false, "generated packet overran its buffer");
                0
            }
            Err(err) => {
                // budget arithmetic guarantees a fit; treat anything else as
                // a packet-sized bug rather than corrupting the stream
                warn!("failed to write packet: {err}");
                debug_assert!(false, "generated packet did not fit: {err}");
                0
            }
        }
    }

    /// Parses one received connection payload and dispatches each channel
    /// entry, returning whether the packet was accepted.
    ///
    /// An unparseable payload latches [`ConnectionError::ReadPacketFailed`].
    pub fn process_packet(&mut self, packet_sequence: Seq, data: &[u8]) -> bool {
        if self.error.is_some() {
            debug!("ignoring packet while in error state");
            return false;
        }

        let entries: Vec<ChannelPacketData<M>> =
            match packet::read_packet(&self.config.channels, data) {
                Ok(entries) => entries,
                Err(err) => {
                    warn!("failed to read packet: {err}");
                    self.error = Some(ConnectionError::ReadPacketFailed);
                    return false;
                }
            };

        for entry in entries {
            let channel_index = entry.channel_index();
            debug_assert!(channel_index < self.channels.len());
            let channel = &mut self.channels[channel_index];
            channel.process_packet_data(entry, packet_sequence);
            if channel.error().is_some() {
                return false;
            }
        }
        true
    }

    /// Forwards packet-level acks to every channel.
    ///
    /// Channels consult their own sent-packet records and ignore sequences
    /// they did not contribute to, so the fan-out is harmless.
    pub fn process_acks(&mut self, acks: &[Seq]) {
        for &ack in acks {
            for channel in &mut self.channels {
                channel.process_ack(ack);
            }
        }
    }

    /// Advances channel clocks and surfaces latched failures.
    ///
    /// The caller should poll [`Connection::error`] after this and
    /// disconnect on any value.
    pub fn advance_time(&mut self, now: Instant) {
        for channel in &mut self.channels {
            channel.advance_time(now);
        }
        if self.error.is_some() {
            return;
        }
        if self.channels.iter().any(|channel| channel.error().is_some()) {
            self.error = Some(ConnectionError::Channel);
            return;
        }
        if self.memory_used() > self.config.max_memory_usage {
            warn!(
                used = self.memory_used(),
                max = self.config.max_memory_usage,
                "connection exceeded its memory ceiling"
            );
            self.error = Some(ConnectionError::OutOfMemory);
        }
    }

    /// Activity counters of one channel.
    ///
    /// # Panics
    ///
    /// Panics if `channel_index` is out of range.
    #[must_use]
    pub fn channel_counters(&self, channel_index: usize) -> &crate::ChannelCounters {
        self.channels[channel_index].counters()
    }

    /// Rough bytes of memory held by this connection's channels.
    #[must_use]
    pub fn memory_used(&self) -> usize {
        self.channels.iter().map(Channel::memory_used).sum()
    }

    /// Drops all connection and channel state, including latched errors.
    ///
    /// Both ends must reset together (for example around a reconnect); a
    /// one-sided reset desyncs the message id streams.
    pub fn reset(&mut self) {
        self.error = None;
        for channel in &mut self.channels {
            channel.reset();
        }
    }
}

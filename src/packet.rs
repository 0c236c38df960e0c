//! Wire format of connection payloads: per-channel entries of messages or
//! one block fragment, bit-packed behind the endpoint's framing.
//!
//! A connection payload is a count of channel entries followed by the
//! entries. Each entry names its channel and is either the *messages* form
//! (a batch of messages, ids relative-encoded on reliable channels) or the
//! *block* form (exactly one fragment of a block message, with the block
//! message's own fields piggybacked on fragment 0). The two forms never mix
//! within an entry.

use tracing::debug;

use crate::{
    channel::{ChannelConfig, ChannelKind},
    message::Message,
    seq::Seq,
    stream::{bits_required, ReadStream, Stream, StreamError, WriteStream},
};

/// Bits reserved for the entry count when budgeting a packet.
pub const CONSERVATIVE_PACKET_HEADER_BITS: usize = 16;
/// Bits reserved per channel entry when budgeting a packet.
pub const CONSERVATIVE_CHANNEL_HEADER_BITS: usize = 32;
/// Bits reserved for the messages-form preamble when budgeting messages.
pub const CONSERVATIVE_MESSAGE_HEADER_BITS: usize = 32;
/// Bits reserved for the block-form preamble when budgeting a fragment.
pub const CONSERVATIVE_FRAGMENT_HEADER_BITS: usize = 64;

/// One channel's contribution to a connection payload.
#[derive(Debug, Clone)]
pub enum ChannelPacketData<M> {
    /// A batch of messages. On reliable channels each message travels with
    /// its id; on unreliable channels ids are meaningless and not sent.
    Messages {
        /// Index of the owning channel.
        channel_index: usize,
        /// `(id, message)` pairs, ids in ascending wrap order.
        messages: Vec<(Seq, M)>,
    },
    /// One fragment of a block message in flight on a reliable channel.
    Block {
        /// Index of the owning channel.
        channel_index: usize,
        /// Id of the block message being transferred.
        message_id: Seq,
        /// Total fragments in the block.
        num_fragments: usize,
        /// Which fragment this is.
        fragment_id: usize,
        /// The fragment's bytes.
        fragment: bytes::Bytes,
        /// The block message's fields; present only on fragment 0.
        message: Option<M>,
    },
    /// A received entry whose message data could not be deserialized. The
    /// owning channel escalates this to
    /// [`ChannelError::FailedToSerialize`](crate::ChannelError::FailedToSerialize).
    Failed {
        /// Index of the owning channel.
        channel_index: usize,
    },
}

impl<M> ChannelPacketData<M> {
    /// Index of the channel this entry belongs to.
    #[must_use]
    pub fn channel_index(&self) -> usize {
        match self {
            Self::Messages { channel_index, .. }
            | Self::Block { channel_index, .. }
            | Self::Failed { channel_index } => *channel_index,
        }
    }
}

fn serialize_channel_index<S: Stream>(
    stream: &mut S,
    channel_index: &mut usize,
    num_channels: usize,
) -> Result<(), StreamError> {
    if num_channels > 1 {
        let mut index = *channel_index as i32;
        stream.serialize_int(&mut index, 0, num_channels as i32 - 1)?;
        *channel_index = index as usize;
    } else {
        *channel_index = 0;
    }
    Ok(())
}

fn serialize_message_kind<M: Message, S: Stream>(
    stream: &mut S,
    kind: &mut u16,
) -> Result<(), StreamError> {
    if M::num_kinds() > 1 {
        let mut k = i32::from(*kind);
        stream.serialize_int(&mut k, 0, i32::from(M::num_kinds()) - 1)?;
        *kind = k as u16;
    } else {
        *kind = 0;
    }
    Ok(())
}

/// Serializes a block carried inline by a message on an unreliable channel:
/// the block size, then its bytes, byte-aligned.
pub(crate) fn serialize_message_block<M: Message, S: Stream>(
    stream: &mut S,
    message: &mut M,
    max_block_size: usize,
) -> Result<(), StreamError> {
    if S::IS_READING {
        let mut block_size = 0i32;
        stream.serialize_int(&mut block_size, 1, max_block_size as i32)?;
        let mut data = vec![0u8; block_size as usize];
        stream.serialize_bytes(&mut data)?;
        message.attach_block(bytes::Bytes::from(data));
    } else {
        // write and measure both take this path; the buffer must be attached
        let block = message.block().ok_or(StreamError::MalformedPacket)?;
        let mut block_size = block.len() as i32;
        let mut data = block.to_vec();
        stream.serialize_int(&mut block_size, 1, max_block_size as i32)?;
        stream.serialize_bytes(&mut data)?;
    }
    Ok(())
}

fn write_messages<M: Message, S: Stream>(
    stream: &mut S,
    config: &ChannelConfig,
    messages: &mut [(Seq, M)],
) -> Result<(), StreamError> {
    let mut has_messages = !messages.is_empty();
    stream.serialize_bool(&mut has_messages)?;
    if !has_messages {
        return Ok(());
    }

    let mut count = messages.len() as i32;
    stream.serialize_int(&mut count, 1, config.max_messages_per_packet as i32)?;

    if config.kind == ChannelKind::ReliableOrdered {
        let mut first_id = messages[0].0 .0;
        stream.serialize_u16(&mut first_id)?;
        for i in 1..messages.len() {
            let previous = messages[i - 1].0;
            let mut id = messages[i].0;
            stream.serialize_seq_relative(previous, &mut id)?;
        }
    }

    for (_, message) in messages.iter_mut() {
        let mut kind = message.kind();
        serialize_message_kind::<M, S>(stream, &mut kind)?;
        message.serialize(stream)?;
        if config.kind == ChannelKind::UnreliableUnordered && message.is_block() {
            serialize_message_block(stream, message, config.max_block_size)?;
        }
    }
    Ok(())
}

fn read_messages<M: Message>(
    stream: &mut ReadStream<'_>,
    config: &ChannelConfig,
) -> Result<Vec<(Seq, M)>, StreamError> {
    let mut has_messages = false;
    stream.serialize_bool(&mut has_messages)?;
    if !has_messages {
        return Ok(Vec::new());
    }

    let mut count = 0i32;
    stream.serialize_int(&mut count, 1, config.max_messages_per_packet as i32)?;
    let count = count as usize;

    let mut ids = vec![Seq::default(); count];
    if config.kind == ChannelKind::ReliableOrdered {
        let mut first_id = 0u16;
        stream.serialize_u16(&mut first_id)?;
        ids[0] = Seq(first_id);
        for i in 1..count {
            let previous = ids[i - 1];
            let mut id = Seq::default();
            stream.serialize_seq_relative(previous, &mut id)?;
            ids[i] = id;
        }
    }

    let mut messages = Vec::with_capacity(count);
    for id in ids {
        let mut kind = 0u16;
        serialize_message_kind::<M, _>(stream, &mut kind)?;
        let mut message = M::create(kind).ok_or(StreamError::InvalidMessageKind)?;
        message.serialize(stream)?;
        if config.kind == ChannelKind::UnreliableUnordered && message.is_block() {
            serialize_message_block(stream, &mut message, config.max_block_size)?;
        }
        messages.push((id, message));
    }
    Ok(messages)
}

fn write_block_fragment<M: Message, S: Stream>(
    stream: &mut S,
    config: &ChannelConfig,
    message_id: Seq,
    num_fragments: usize,
    fragment_id: usize,
    fragment: &[u8],
    message: Option<&mut M>,
) -> Result<(), StreamError> {
    let mut id = message_id.0;
    stream.serialize_u16(&mut id)?;

    let mut count = num_fragments as i32;
    stream.serialize_int(&mut count, 1, config.max_fragments_per_block() as i32)?;

    if num_fragments > 1 {
        let mut frag = fragment_id as i32;
        stream.serialize_int(&mut frag, 0, num_fragments as i32 - 1)?;
    }

    let mut fragment_size = fragment.len() as i32;
    stream.serialize_int(&mut fragment_size, 1, config.fragment_size as i32)?;

    let mut data = fragment.to_vec();
    stream.serialize_bytes(&mut data)?;

    if fragment_id == 0 {
        let message = message.ok_or(StreamError::MalformedPacket)?;
        let mut kind = message.kind();
        serialize_message_kind::<M, S>(stream, &mut kind)?;
        message.serialize(stream)?;
    }
    Ok(())
}

#[allow(clippy::type_complexity)]
fn read_block_fragment<M: Message>(
    stream: &mut ReadStream<'_>,
    config: &ChannelConfig,
) -> Result<(Seq, usize, usize, bytes::Bytes, Option<M>), StreamError> {
    if config.disable_blocks {
        return Err(StreamError::MalformedPacket);
    }

    let mut id = 0u16;
    stream.serialize_u16(&mut id)?;

    let mut count = 0i32;
    stream.serialize_int(&mut count, 1, config.max_fragments_per_block() as i32)?;
    let num_fragments = count as usize;

    let mut fragment_id = 0usize;
    if num_fragments > 1 {
        let mut frag = 0i32;
        stream.serialize_int(&mut frag, 0, num_fragments as i32 - 1)?;
        fragment_id = frag as usize;
    }

    let mut fragment_size = 0i32;
    stream.serialize_int(&mut fragment_size, 1, config.fragment_size as i32)?;

    let mut data = vec![0u8; fragment_size as usize];
    stream.serialize_bytes(&mut data)?;

    let message = if fragment_id == 0 {
        let mut kind = 0u16;
        serialize_message_kind::<M, _>(stream, &mut kind)?;
        let mut message = M::create(kind).ok_or(StreamError::InvalidMessageKind)?;
        if !message.is_block() {
            return Err(StreamError::MalformedPacket);
        }
        message.serialize(stream)?;
        Some(message)
    } else {
        None
    };

    Ok((
        Seq(id),
        num_fragments,
        fragment_id,
        bytes::Bytes::from(data),
        message,
    ))
}

/// Serializes channel entries into `buf`, returning the bytes written.
///
/// `buf` must be a multiple of 4 bytes long.
///
/// # Errors
///
/// Errors if the entries do not fit, which means the per-channel bit
/// budgeting upstream was violated.
pub(crate) fn write_packet<M: Message>(
    channels: &[ChannelConfig],
    entries: &mut [ChannelPacketData<M>],
    buf: &mut [u8],
) -> Result<usize, StreamError> {
    let mut stream = WriteStream::new(buf);
    let num_channels = channels.len();

    let mut num_entries = entries.len() as i32;
    stream.serialize_int(&mut num_entries, 0, num_channels as i32)?;

    for entry in entries.iter_mut() {
        match entry {
            ChannelPacketData::Messages {
                channel_index,
                messages,
            } => {
                serialize_channel_index(&mut stream, channel_index, num_channels)?;
                let mut is_block = false;
                stream.serialize_bool(&mut is_block)?;
                write_messages(&mut stream, &channels[*channel_index], messages)?;
            }
            ChannelPacketData::Block {
                channel_index,
                message_id,
                num_fragments,
                fragment_id,
                fragment,
                message,
            } => {
                serialize_channel_index(&mut stream, channel_index, num_channels)?;
                let mut is_block = true;
                stream.serialize_bool(&mut is_block)?;
                write_block_fragment(
                    &mut stream,
                    &channels[*channel_index],
                    *message_id,
                    *num_fragments,
                    *fragment_id,
                    fragment,
                    message.as_mut(),
                )?;
            }
            ChannelPacketData::Failed { .. } => {
                debug_assert!(false, "never write a failed entry");
                return Err(StreamError::MalformedPacket);
            }
        }
    }

    stream.flush();
    Ok(stream.bytes_processed())
}

/// Parses channel entries out of a received connection payload.
///
/// A structural failure (bad framing, bad block fragment) fails the whole
/// packet. A failure *inside* a message body is confined to its entry, which
/// is returned as [`ChannelPacketData::Failed`] so the owning channel latches
/// the error; nothing after a failed entry can be trusted, so parsing stops
/// there.
///
/// # Errors
///
/// Errors if the payload framing is malformed.
pub(crate) fn read_packet<M: Message>(
    channels: &[ChannelConfig],
    data: &[u8],
) -> Result<Vec<ChannelPacketData<M>>, StreamError> {
    let mut stream = ReadStream::new(data);
    let num_channels = channels.len();

    let mut num_entries = 0i32;
    stream.serialize_int(&mut num_entries, 0, num_channels as i32)?;

    let mut entries = Vec::with_capacity(num_entries as usize);
    for _ in 0..num_entries {
        let mut channel_index = 0usize;
        serialize_channel_index(&mut stream, &mut channel_index, num_channels)?;

        let mut is_block = false;
        stream.serialize_bool(&mut is_block)?;

        let config = &channels[channel_index];
        if is_block {
            let (message_id, num_fragments, fragment_id, fragment, message) =
                read_block_fragment::<M>(&mut stream, config)?;
            entries.push(ChannelPacketData::Block {
                channel_index,
                message_id,
                num_fragments,
                fragment_id,
                fragment,
                message,
            });
        } else {
            match read_messages::<M>(&mut stream, config) {
                Ok(messages) => entries.push(ChannelPacketData::Messages {
                    channel_index,
                    messages,
                }),
                Err(err) => {
                    debug!(channel_index, "message data failed to deserialize: {err}");
                    entries.push(ChannelPacketData::Failed { channel_index });
                    break;
                }
            }
        }
    }
    Ok(entries)
}

/// Bits needed to encode a message kind tag.
pub(crate) fn message_kind_bits<M: Message>() -> usize {
    if M::num_kinds() > 1 {
        bits_required(0, i64::from(M::num_kinds()) - 1) as usize
    } else {
        0
    }
}

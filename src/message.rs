//! User-defined messages and the factory that constructs them.
//!
//! Applications define one closed set of message kinds per connection,
//! usually as an enum with one variant per kind. The trait doubles as the
//! factory: [`Message::create`] builds a default-valued message for a wire
//! tag so the read path can deserialize into it.
//!
//! A *block message* additionally carries a large byte buffer. On reliable
//! channels the buffer is fragmented across many datagrams and reassembled on
//! the far side; on unreliable channels it is serialized inline and the whole
//! message must fit in one datagram.

use bytes::Bytes;

use crate::stream::{Stream, StreamError};

/// A unit of application data queued on a channel.
///
/// Messages are owned: the send queue holds the message until it is acked
/// (reliable) or written into a packet (unreliable), in-flight packet records
/// refer to it by id, and the receive queue owns it until the application
/// takes it. `Clone` covers the brief overlap where a message is both queued
/// and being serialized into a packet.
pub trait Message: Clone {
    /// Wire tag of this message, in `0..Self::num_kinds()`.
    fn kind(&self) -> u16;

    /// Number of distinct message kinds. Must be at least 1.
    fn num_kinds() -> u16;

    /// Constructs a default-valued message for a wire tag, or [`None`] if the
    /// tag names no known kind.
    fn create(kind: u16) -> Option<Self>;

    /// Serializes this message's fields (not its block, if any).
    ///
    /// Called with a write stream when packing into a packet, a read stream
    /// when parsing out of one, and a measure stream when costing the message
    /// for packet budgeting. One function covers all three; branch on
    /// [`Stream::IS_WRITING`] / [`Stream::IS_READING`] where a value must be
    /// computed on one path and validated on the other.
    ///
    /// # Errors
    ///
    /// Errors must be propagated with `?`; a read-side failure condemns the
    /// whole packet.
    fn serialize(&mut self, stream: &mut impl Stream) -> Result<(), StreamError>;

    /// Whether this kind of message carries a block. Must be consistent for
    /// a given kind regardless of whether the buffer is attached yet.
    fn is_block(&self) -> bool {
        false
    }

    /// The attached block buffer, if any.
    fn block(&self) -> Option<&Bytes> {
        None
    }

    /// Attaches a block buffer to this message.
    ///
    /// Called on the receive path once a fragmented block has been
    /// reassembled. The default does nothing, which is only correct for
    /// non-block messages.
    fn attach_block(&mut self, _block: Bytes) {}
}

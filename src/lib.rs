#![doc = include_str!("../README.md")]

pub mod bits;
pub mod channel;
pub mod connection;
pub mod endpoint;
pub mod message;
pub mod packet;
pub mod seq;
pub mod seq_buf;
pub mod stream;

pub use {
    bits::{BitReader, BitWriter, BitsError},
    channel::{
        Channel, ChannelConfig, ChannelCounters, ChannelError, ChannelKind, ReliableChannel,
        UnreliableChannel, MAX_CHANNELS,
    },
    connection::{Connection, ConnectionConfig, ConnectionError},
    endpoint::{Endpoint, EndpointConfig, EndpointCounters},
    message::Message,
    seq::Seq,
    seq_buf::SeqBuf,
    stream::{bits_required, MeasureStream, ReadStream, Stream, StreamError, WriteStream},
};

use static_assertions::const_assert;

// channel indices must survive the 6-bit budget assumed by the packet layer
const_assert!(MAX_CHANNELS <= 64);

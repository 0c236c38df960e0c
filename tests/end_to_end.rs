//! Soak tests driving two full endpoint + connection stacks through a lossy
//! in-memory link.

use bytes::Bytes;
use rand::{rngs::StdRng, Rng, SeedableRng};
use web_time::{Duration, Instant};

use netchan::{
    ChannelConfig, ChannelError, ChannelKind, Connection, ConnectionConfig, ConnectionError,
    Endpoint, EndpointConfig, Message, Stream, StreamError,
};

#[derive(Debug, Clone, PartialEq, Eq)]
enum TestMessage {
    Ordinal(u32),
    Blob(Bytes),
}

impl Message for TestMessage {
    fn kind(&self) -> u16 {
        match self {
            Self::Ordinal(_) => 0,
            Self::Blob(_) => 1,
        }
    }

    fn num_kinds() -> u16 {
        2
    }

    fn create(kind: u16) -> Option<Self> {
        match kind {
            0 => Some(Self::Ordinal(0)),
            1 => Some(Self::Blob(Bytes::new())),
            _ => None,
        }
    }

    fn serialize(&mut self, stream: &mut impl Stream) -> Result<(), StreamError> {
        match self {
            Self::Ordinal(value) => stream.serialize_bits(value, 32),
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

struct Peer {
    endpoint: Endpoint,
    connection: Connection<TestMessage>,
}

fn peer(config: ConnectionConfig, now: Instant) -> Peer {
    Peer {
        endpoint: Endpoint::new(EndpointConfig::default(), now),
        connection: Connection::new(config, now),
    }
}

fn reliable_config() -> ConnectionConfig {
    ConnectionConfig {
        channels: vec![ChannelConfig::new(ChannelKind::ReliableOrdered)],
        ..ConnectionConfig::default()
    }
}

/// Generates one packet on `sender`, pushes its datagrams through a lossy
/// link into `receiver`, and routes any acks that came back.
fn exchange(sender: &mut Peer, receiver: &mut Peer, rng: &mut StdRng, loss: f64) {
    let mut buf = vec![0u8; 8 * 1024];
    let sequence = sender.endpoint.next_sequence();
    let len = sender.connection.generate_packet(sequence, &mut buf);
    if len == 0 {
        return;
    }

    let mut datagrams = Vec::new();
    sender
        .endpoint
        .send_packet(&buf[..len], |_, datagram| datagrams.push(datagram.to_vec()));

    let Peer {
        endpoint,
        connection,
    } = receiver;
    for datagram in datagrams {
        if rng.gen::<f64>() < loss {
            continue;
        }
        endpoint.receive_packet(&datagram, |sequence, payload| {
            connection.process_packet(sequence, payload)
        });
    }

    // acks for the receiver's own previously sent packets rode back on
    // the datagrams it just consumed
    receiver.connection.process_acks(receiver.endpoint.acks());
    receiver.endpoint.clear_acks();
}

#[test]
fn reliable_ordering_survives_heavy_loss() {
    let start = Instant::now();
    let mut a = peer(reliable_config(), start);
    let mut b = peer(reliable_config(), start);

    for i in 0..100 {
        a.connection.send_message(0, TestMessage::Ordinal(i));
    }

    let mut rng = StdRng::seed_from_u64(0x5105);
    let mut received = Vec::new();
    let mut now = start;

    for _ in 0..10_000 {
        now += Duration::from_millis(10);
        a.connection.advance_time(now);
        b.connection.advance_time(now);

        exchange(&mut a, &mut b, &mut rng, 0.5);
        exchange(&mut b, &mut a, &mut rng, 0.5);

        while let Some(message) = b.connection.receive_message(0) {
            let TestMessage::Ordinal(i) = message else {
                panic!("unexpected message {message:?}");
            };
            received.push(i);
        }
        if received.len() == 100 {
            break;
        }
    }

    assert_eq!((0..100).collect::<Vec<_>>(), received);
    assert_eq!(None, a.connection.error());
    assert_eq!(None, b.connection.error());
}

#[test]
fn large_block_survives_loss() {
    let mut config = reliable_config();
    config.channels[0].max_block_size = 65536;
    config.channels[0].fragment_size = 1024;

    let start = Instant::now();
    let mut a = peer(config.clone(), start);
    let mut b = peer(config, start);

    let block: Vec<u8> = (0..65536u32).map(|i| (i % 256) as u8).collect();
    a.connection
        .send_message(0, TestMessage::Blob(Bytes::from(block.clone())));

    let mut rng = StdRng::seed_from_u64(0x5202);
    let mut now = start;
    let mut received = None;

    for _ in 0..10_000 {
        now += Duration::from_millis(10);
        a.connection.advance_time(now);
        b.connection.advance_time(now);

        exchange(&mut a, &mut b, &mut rng, 0.1);
        exchange(&mut b, &mut a, &mut rng, 0.1);

        if let Some(message) = b.connection.receive_message(0) {
            received = Some(message);
            break;
        }
    }

    let Some(TestMessage::Blob(received)) = received else {
        panic!("block never arrived");
    };
    assert_eq!(block, received.to_vec());
    assert_eq!(None, a.connection.error());
    assert_eq!(None, b.connection.error());
}

#[test]
fn unreliable_budget_drops_overflow_within_tick() {
    let mut channel = ChannelConfig::new(ChannelKind::UnreliableUnordered);
    channel.packet_budget = Some(200);
    let config = ConnectionConfig {
        channels: vec![channel],
        ..ConnectionConfig::default()
    };

    let start = Instant::now();
    let mut a = peer(config.clone(), start);
    let mut b = peer(config, start);

    // ~43 bytes each on the wire once the inline block is counted
    for _ in 0..50 {
        a.connection
            .send_message(0, TestMessage::Blob(Bytes::from(vec![0xAB; 40])));
    }

    let mut rng = StdRng::seed_from_u64(0x5303);
    exchange(&mut a, &mut b, &mut rng, 0.0);

    let mut received = 0;
    while b.connection.receive_message(0).is_some() {
        received += 1;
    }
    assert_eq!(4, received);

    // the rest were dropped at generation time, not deferred
    exchange(&mut a, &mut b, &mut rng, 0.0);
    assert_eq!(None, b.connection.receive_message(0));
}

#[test]
fn receive_window_overrun_latches_desync() {
    let mut channel = ChannelConfig::new(ChannelKind::ReliableOrdered);
    channel.send_queue_size = 1024;
    channel.receive_queue_size = 256;
    let config = ConnectionConfig {
        channels: vec![channel],
        ..ConnectionConfig::default()
    };

    let start = Instant::now();
    let mut a = peer(config.clone(), start);
    let mut b = peer(config, start);

    for i in 0..400 {
        a.connection.send_message(0, TestMessage::Ordinal(i));
    }

    // b's application never calls receive_message, so b's delivery window
    // never moves; once a's acked messages carry it past 256 ids, b cannot
    // accept the next id without overwriting an undelivered slot
    let mut rng = StdRng::seed_from_u64(0x5404);
    let mut now = start;
    for _ in 0..50 {
        now += Duration::from_millis(10);
        a.connection.advance_time(now);
        b.connection.advance_time(now);
        exchange(&mut a, &mut b, &mut rng, 0.0);
        exchange(&mut b, &mut a, &mut rng, 0.0);
        if b.connection.error().is_some() {
            break;
        }
    }

    assert_eq!(Some(ChannelError::Desync), b.connection.channel_error(0));
    assert_eq!(Some(ConnectionError::Channel), b.connection.error());
}

#[test]
fn block_holds_back_small_messages_until_acked() {
    let start = Instant::now();
    let mut a = peer(reliable_config(), start);
    let mut b = peer(reliable_config(), start);

    let block: Vec<u8> = vec![0x42; 16 * 1024];
    a.connection
        .send_message(0, TestMessage::Blob(Bytes::from(block.clone())));
    for i in 0..10 {
        a.connection.send_message(0, TestMessage::Ordinal(i));
    }

    let mut rng = StdRng::seed_from_u64(0x5606);
    let mut now = start;
    let mut arrivals = Vec::new();

    for _ in 0..1_000 {
        now += Duration::from_millis(10);
        a.connection.advance_time(now);
        b.connection.advance_time(now);
        exchange(&mut a, &mut b, &mut rng, 0.0);
        exchange(&mut b, &mut a, &mut rng, 0.0);

        while let Some(message) = b.connection.receive_message(0) {
            arrivals.push(message);
        }
        if arrivals.len() == 11 {
            break;
        }
    }

    assert_eq!(11, arrivals.len());
    let TestMessage::Blob(first) = &arrivals[0] else {
        panic!("block must arrive before any small message");
    };
    assert_eq!(block, first.to_vec());
    assert_eq!(16, b.connection.channel_counters(0).fragments_received);
    for (i, message) in arrivals[1..].iter().enumerate() {
        assert_eq!(TestMessage::Ordinal(i as u32), *message);
    }
}

#[test]
fn ack_header_compresses_fully_acked_history() {
    let start = Instant::now();
    let mut a = peer(reliable_config(), start);
    let mut b = peer(reliable_config(), start);

    // enough round trips that b has received 33+ consecutive packets from a
    // and both sequence counters sit close together
    let mut rng = StdRng::seed_from_u64(0x5405);
    let mut now = start;
    for _ in 0..40 {
        now += Duration::from_millis(10);
        a.connection.advance_time(now);
        b.connection.advance_time(now);
        exchange(&mut a, &mut b, &mut rng, 0.0);
        exchange(&mut b, &mut a, &mut rng, 0.0);
    }

    // b's next datagram acks a fully-received history: every ack-bits byte
    // is 0xFF and elided, and the ack fits a one-byte delta
    let payload = [0u8; 1];
    let mut captured = Vec::new();
    b.endpoint
        .send_packet(&payload, |_, datagram| captured.push(datagram.to_vec()));
    let datagram = &captured[0];

    let header_len = datagram.len() - payload.len();
    assert_eq!(4, header_len, "header {:02x?}", &datagram[..header_len]);
    let prefix = datagram[0];
    assert_eq!(0, prefix & 0b0001_1110, "no ack-bits bytes present");
    assert_ne!(0, prefix & 0b0010_0000, "ack encoded as one-byte delta");
}

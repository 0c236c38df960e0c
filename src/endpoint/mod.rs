//! Reliable endpoint: per-datagram sequencing, acks and fragmentation.
//!
//! The endpoint frames every outgoing payload with a sequence number and a
//! compressed 33-ack header (the latest received sequence plus a 32-bit
//! bitfield), splits payloads above a size threshold into fragments, and
//! reassembles fragments on the receive side. It reports which of its own
//! sent sequences the peer has acknowledged, which the layer above uses to
//! drive retransmission.
//!
//! The endpoint is sans-IO: [`Endpoint::send_packet`] hands finished
//! datagrams to a `transmit` callback and [`Endpoint::receive_packet`] hands
//! deframed payloads to a `process` callback. Malformed, stale or duplicate
//! datagrams are dropped silently; a counter records each drop.

mod header;

pub use header::{
    FragmentHeader, HeaderError, PacketHeader, FRAGMENT_HEADER_BYTES, MAX_PACKET_HEADER_BYTES,
};

use bitvec::vec::BitVec;
use tracing::{debug, trace};
use web_time::{Duration, Instant};

use crate::{seq::Seq, seq_buf::SeqBuf};

/// Tuning knobs for an [`Endpoint`].
#[derive(Debug, Clone, PartialEq)]
pub struct EndpointConfig {
    /// Largest payload accepted by [`Endpoint::send_packet`], in bytes.
    pub max_packet_size: usize,
    /// Payloads larger than this many bytes are split into fragments.
    pub fragment_above: usize,
    /// Size of each fragment except possibly the last, in bytes.
    pub fragment_size: usize,
    /// Most fragments a single packet may be split into (at most 256).
    pub max_fragments: usize,
    /// Entries in the sent-packet ack tracking buffer.
    pub sent_packets_buffer_size: usize,
    /// Entries in the received-packet dedup buffer.
    pub received_packets_buffer_size: usize,
    /// Concurrent inbound packets that may be mid-reassembly.
    pub reassembly_buffer_size: usize,
    /// Most acks buffered for the layer above between
    /// [`Endpoint::clear_acks`] calls.
    pub ack_buffer_size: usize,
    /// Exponential smoothing factor applied to round-trip time samples.
    pub rtt_smoothing_factor: f64,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            max_packet_size: 16 * 1024,
            fragment_above: 1024,
            fragment_size: 1024,
            max_fragments: 16,
            sent_packets_buffer_size: 256,
            received_packets_buffer_size: 256,
            reassembly_buffer_size: 64,
            ack_buffer_size: 256,
            rtt_smoothing_factor: 0.0025,
        }
    }
}

/// Running totals of endpoint activity, including silently dropped input.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EndpointCounters {
    /// Payloads accepted for sending.
    pub packets_sent: u64,
    /// Datagrams handed to [`Endpoint::receive_packet`].
    pub packets_received: u64,
    /// Sent packets the peer acknowledged.
    pub packets_acked: u64,
    /// Received packets dropped as older than the dedup window.
    pub packets_stale: u64,
    /// Received datagrams dropped as unparseable.
    pub packets_invalid: u64,
    /// Send payloads rejected as over [`EndpointConfig::max_packet_size`].
    pub packets_too_large_to_send: u64,
    /// Received datagrams rejected as over [`EndpointConfig::max_packet_size`].
    pub packets_too_large_to_receive: u64,
    /// Fragments transmitted.
    pub fragments_sent: u64,
    /// Fragments accepted into reassembly.
    pub fragments_received: u64,
    /// Fragments dropped as malformed, duplicate or mismatched.
    pub fragments_invalid: u64,
}

#[derive(Debug)]
struct SentPacketData {
    acked: bool,
    send_time: Instant,
}

#[derive(Debug)]
struct ReceivedPacketData;

#[derive(Debug)]
struct Reassembly {
    num_fragments: usize,
    num_received: usize,
    received: BitVec,
    packet_header_bytes: usize,
    packet_bytes: usize,
    // layout: [MAX_PACKET_HEADER_BYTES slack][fragment 0][fragment 1]...
    // the regular header from fragment 0 is copied right-aligned into the
    // slack so the finished packet is one contiguous slice
    data: Vec<u8>,
}

/// One direction-pair of the datagram ack protocol.
///
/// See the [module-level documentation](self).
#[derive(Debug)]
pub struct Endpoint {
    config: EndpointConfig,
    sequence: Seq,
    now: Instant,
    rtt_seconds: f64,
    sent_packets: SeqBuf<SentPacketData>,
    received_packets: SeqBuf<ReceivedPacketData>,
    reassembly: SeqBuf<Reassembly>,
    acks: Vec<Seq>,
    counters: EndpointCounters,
}

impl Endpoint {
    /// Creates an endpoint from its config.
    ///
    /// # Panics
    ///
    /// Panics if the config is inconsistent: a max-size packet must fit in
    /// `max_fragments` fragments, and `max_fragments` must fit the one-byte
    /// wire encoding.
    #[must_use]
    pub fn new(config: EndpointConfig, now: Instant) -> Self {
        assert!(config.max_fragments <= 256);
        assert!(config.max_packet_size <= config.max_fragments * config.fragment_size);
        Self {
            sequence: Seq::default(),
            now,
            rtt_seconds: 0.0,
            sent_packets: SeqBuf::new(config.sent_packets_buffer_size),
            received_packets: SeqBuf::new(config.received_packets_buffer_size),
            reassembly: SeqBuf::new(config.reassembly_buffer_size),
            acks: Vec::with_capacity(config.ack_buffer_size),
            counters: EndpointCounters::default(),
            config,
        }
    }

    /// Sequence number the next sent packet will carry.
    #[must_use]
    pub const fn next_sequence(&self) -> Seq {
        self.sequence
    }

    /// Advances the endpoint clock. Round-trip times are measured against
    /// this.
    pub fn advance_time(&mut self, now: Instant) {
        self.now = now;
    }

    /// Smoothed round-trip time estimate, zero until the first ack arrives.
    #[must_use]
    pub fn rtt(&self) -> Duration {
        Duration::from_secs_f64(self.rtt_seconds)
    }

    /// Sequences of our sent packets the peer has acked since the last
    /// [`Endpoint::clear_acks`].
    #[must_use]
    pub fn acks(&self) -> &[Seq] {
        &self.acks
    }

    /// Forgets the pending acks, making room for new ones.
    pub fn clear_acks(&mut self) {
        self.acks.clear();
    }

    /// Activity counters.
    #[must_use]
    pub const fn counters(&self) -> &EndpointCounters {
        &self.counters
    }

    /// Restores the endpoint to its initial state, keeping the config and
    /// clock.
    pub fn reset(&mut self) {
        self.sequence = Seq::default();
        self.rtt_seconds = 0.0;
        self.sent_packets.reset();
        self.received_packets.reset();
        self.reassembly.reset();
        self.acks.clear();
        self.counters = EndpointCounters::default();
    }

    // ack = most recent received sequence; bit i of ack_bits set iff
    // sequence (ack - i) is in the received buffer
    fn generate_ack_bits(&self) -> (Seq, u32) {
        let ack = self.received_packets.next_seq().wrapping_sub(1);
        let mut ack_bits = 0u32;
        for i in 0..32u16 {
            if self.received_packets.exists(ack.wrapping_sub(i)) {
                ack_bits |= 1 << i;
            }
        }
        (ack, ack_bits)
    }

    /// Frames `payload` and hands the resulting datagram(s) to `transmit`.
    ///
    /// Payloads at most [`EndpointConfig::fragment_above`] bytes go out as a
    /// single datagram; larger ones are split into fragments that share one
    /// sequence number, with fragment 0 carrying the packet header for the
    /// whole packet. Oversized payloads are dropped with a counter bump.
    pub fn send_packet(&mut self, payload: &[u8], mut transmit: impl FnMut(Seq, &[u8])) {
        if payload.len() > self.config.max_packet_size {
            debug!(
                len = payload.len(),
                max = self.config.max_packet_size,
                "packet too large to send"
            );
            self.counters.packets_too_large_to_send += 1;
            return;
        }

        let sequence = self.sequence.get_inc();
        let (ack, ack_bits) = self.generate_ack_bits();
        self.sent_packets.insert(
            sequence,
            SentPacketData {
                acked: false,
                send_time: self.now,
            },
        );

        let mut packet_header = [0u8; MAX_PACKET_HEADER_BYTES];
        let header_bytes = header::write_packet_header(
            &mut packet_header,
            PacketHeader {
                sequence,
                ack,
                ack_bits,
            },
        );

        if payload.len() <= self.config.fragment_above {
            trace!(%sequence, len = payload.len(), "sending packet");
            let mut datagram = Vec::with_capacity(header_bytes + payload.len());
            datagram.extend_from_slice(&packet_header[..header_bytes]);
            datagram.extend_from_slice(payload);
            transmit(sequence, &datagram);
        } else {
            let num_fragments = payload.len().div_ceil(self.config.fragment_size);
            debug_assert!(num_fragments >= 1 && num_fragments <= self.config.max_fragments);
            trace!(%sequence, num_fragments, "sending fragmented packet");

            let mut datagram = Vec::with_capacity(
                FRAGMENT_HEADER_BYTES + MAX_PACKET_HEADER_BYTES + self.config.fragment_size,
            );
            for (fragment_id, chunk) in payload.chunks(self.config.fragment_size).enumerate() {
                datagram.clear();
                datagram.push(1);
                datagram.extend_from_slice(&sequence.0.to_le_bytes());
                datagram.push(fragment_id as u8);
                datagram.push((num_fragments - 1) as u8);
                if fragment_id == 0 {
                    datagram.extend_from_slice(&packet_header[..header_bytes]);
                }
                datagram.extend_from_slice(chunk);
                transmit(sequence, &datagram);
                self.counters.fragments_sent += 1;
            }
        }

        self.counters.packets_sent += 1;
    }

    /// Deframes one received datagram.
    ///
    /// Regular packets have their payload handed to `process`; if `process`
    /// returns `true` the packet is recorded as received (and will be acked
    /// back to the peer), and the ack information it carried is applied to
    /// our sent-packet records. Fragments are buffered until their packet is
    /// complete, then the reassembled packet takes the same path.
    pub fn receive_packet(&mut self, datagram: &[u8], mut process: impl FnMut(Seq, &[u8]) -> bool) {
        self.receive_inner(datagram, &mut process);
    }

    fn receive_inner(&mut self, datagram: &[u8], process: &mut impl FnMut(Seq, &[u8]) -> bool) {
        if datagram.is_empty() {
            self.counters.packets_invalid += 1;
            return;
        }
        if datagram.len() > self.config.max_packet_size + MAX_PACKET_HEADER_BYTES {
            debug!(len = datagram.len(), "packet too large to receive");
            self.counters.packets_too_large_to_receive += 1;
            return;
        }

        self.counters.packets_received += 1;

        if datagram[0] & 1 == 0 {
            self.receive_regular(datagram, process);
        } else {
            self.receive_fragment(datagram, process);
        }
    }

    fn receive_regular(&mut self, datagram: &[u8], process: &mut impl FnMut(Seq, &[u8]) -> bool) {
        let (header, header_bytes) = match header::read_packet_header(datagram) {
            Ok(parsed) => parsed,
            Err(err) => {
                debug!("dropping invalid packet: {err}");
                self.counters.packets_invalid += 1;
                return;
            }
        };

        if !self.received_packets.is_fresh(header.sequence) {
            trace!(sequence = %header.sequence, "dropping stale packet");
            self.counters.packets_stale += 1;
            return;
        }

        if !process(header.sequence, &datagram[header_bytes..]) {
            return;
        }

        self.received_packets
            .insert(header.sequence, ReceivedPacketData);

        let mut ack_bits = header.ack_bits;
        for i in 0..32u16 {
            if ack_bits & 1 != 0 {
                let acked_seq = header.ack.wrapping_sub(i);
                if let Some(sent) = self.sent_packets.get_mut(acked_seq) {
                    if !sent.acked && self.acks.len() < self.config.ack_buffer_size {
                        trace!(sequence = %acked_seq, "packet acked");
                        sent.acked = true;
                        let sample = self
                            .now
                            .saturating_duration_since(sent.send_time)
                            .as_secs_f64();
                        if self.rtt_seconds == 0.0 {
                            self.rtt_seconds = sample;
                        } else {
                            self.rtt_seconds +=
                                (sample - self.rtt_seconds) * self.config.rtt_smoothing_factor;
                        }
                        self.acks.push(acked_seq);
                        self.counters.packets_acked += 1;
                    }
                }
            }
            ack_bits >>= 1;
        }
    }

    fn receive_fragment(&mut self, datagram: &[u8], process: &mut impl FnMut(Seq, &[u8]) -> bool) {
        let fragment = match header::read_fragment_header(
            datagram,
            self.config.max_fragments,
            self.config.fragment_size,
        ) {
            Ok(parsed) => parsed,
            Err(err) => {
                debug!("dropping invalid fragment: {err}");
                self.counters.fragments_invalid += 1;
                return;
            }
        };

        if !self.reassembly.exists(fragment.sequence) {
            let scratch_len =
                MAX_PACKET_HEADER_BYTES + fragment.num_fragments * self.config.fragment_size;
            let inserted = self.reassembly.insert(
                fragment.sequence,
                Reassembly {
                    num_fragments: fragment.num_fragments,
                    num_received: 0,
                    received: BitVec::repeat(false, fragment.num_fragments),
                    packet_header_bytes: 0,
                    packet_bytes: 0,
                    data: vec![0; scratch_len],
                },
            );
            if inserted.is_none() {
                debug!(sequence = %fragment.sequence, "dropping fragment of stale packet");
                self.counters.fragments_invalid += 1;
                return;
            }
        }

        let entry = self
            .reassembly
            .get_mut(fragment.sequence)
            .expect("entry was just found or inserted");

        if fragment.num_fragments != entry.num_fragments {
            debug!(
                sequence = %fragment.sequence,
                expected = entry.num_fragments,
                got = fragment.num_fragments,
                "dropping fragment with mismatched fragment count"
            );
            self.counters.fragments_invalid += 1;
            return;
        }
        if entry.received[fragment.fragment_id] {
            trace!(
                sequence = %fragment.sequence,
                fragment_id = fragment.fragment_id,
                "dropping duplicate fragment"
            );
            return;
        }

        let payload = &datagram[fragment.payload_offset..];
        if fragment.fragment_id == 0 {
            // keep the embedded regular header, right-aligned in the slack,
            // so the reassembled packet is contiguous
            let header_start = MAX_PACKET_HEADER_BYTES - fragment.packet_header_bytes;
            entry.data[header_start..MAX_PACKET_HEADER_BYTES].copy_from_slice(
                &datagram[FRAGMENT_HEADER_BYTES..FRAGMENT_HEADER_BYTES + fragment.packet_header_bytes],
            );
            entry.packet_header_bytes = fragment.packet_header_bytes;
        }
        if fragment.fragment_id == fragment.num_fragments - 1 {
            entry.packet_bytes =
                (entry.num_fragments - 1) * self.config.fragment_size + payload.len();
        }

        let at = MAX_PACKET_HEADER_BYTES + fragment.fragment_id * self.config.fragment_size;
        entry.data[at..at + payload.len()].copy_from_slice(payload);
        entry.received.set(fragment.fragment_id, true);
        entry.num_received += 1;
        self.counters.fragments_received += 1;
        trace!(
            sequence = %fragment.sequence,
            fragment_id = fragment.fragment_id,
            progress = entry.num_received,
            total = entry.num_fragments,
            "received fragment"
        );

        if entry.num_received == entry.num_fragments {
            let entry = self
                .reassembly
                .remove(fragment.sequence)
                .expect("complete reassembly entry must exist");
            let start = MAX_PACKET_HEADER_BYTES - entry.packet_header_bytes;
            let end = MAX_PACKET_HEADER_BYTES + entry.packet_bytes;
            trace!(sequence = %fragment.sequence, "completed reassembly");
            self.receive_inner(&entry.data[start..end], process);
            // the recursive call counted the reassembled packet again
            self.counters.packets_received -= 1;
        }
    }
}

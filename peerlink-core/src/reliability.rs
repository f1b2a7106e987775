//! Reliable delivery per connection: sequence numbering, acks, retransmission
//! with exponential backoff, and an in-order receive window with dedupe.
//!
//! Sequence numbers are `u32` and wrap; every comparison goes through
//! `wrapping_sub` against a reference point.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use crate::config::EngineConfig;
use crate::wire::{DataFrame, RpcHeader};

/// Offsets at or above this are treated as "behind" the reference point.
const HALF_SEQ_SPACE: u32 = 1 << 31;

/// Highest backoff exponent applied; beyond this the cap always wins anyway.
const MAX_BACKOFF_SHIFT: u32 = 16;

/// RTT estimator and retransmit timeout (RFC 6298).
///
/// First sample: `srtt = R`, `rttvar = R/2`. Later samples:
/// `rttvar = 3/4·rttvar + 1/4·|srtt − R|`, `srtt = 7/8·srtt + 1/8·R`.
/// `rto = srtt + 4·rttvar`, clamped to `[min_rto, max_rto]`.
#[derive(Debug, Clone)]
pub struct RetransmitTimer {
    min_rto: Duration,
    max_rto: Duration,
    srtt: Option<Duration>,
    rttvar: Duration,
    rto: Duration,
}

impl RetransmitTimer {
    pub fn new(initial_rto: Duration, min_rto: Duration, max_rto: Duration) -> Self {
        Self {
            min_rto,
            max_rto,
            srtt: None,
            rttvar: Duration::ZERO,
            rto: initial_rto.clamp(min_rto, max_rto),
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(config.initial_rto(), config.min_rto(), config.max_rto())
    }

    pub fn record_rtt_sample(&mut self, sample: Duration) {
        match self.srtt {
            None => {
                self.srtt = Some(sample);
                self.rttvar = sample / 2;
            }
            Some(srtt) => {
                let diff = sample.abs_diff(srtt);
                self.rttvar = self.rttvar * 3 / 4 + diff / 4;
                self.srtt = Some(srtt * 7 / 8 + sample / 8);
            }
        }
        let srtt = self.srtt.unwrap_or(sample);
        self.rto = (srtt + self.rttvar * 4).clamp(self.min_rto, self.max_rto);
    }

    /// Current timeout for a packet that has not been retransmitted yet.
    pub fn rto(&self) -> Duration {
        self.rto
    }

    pub fn srtt(&self) -> Option<Duration> {
        self.srtt
    }

    /// Timeout after `retries` retransmissions: `rto · 2^retries`, capped at `max_rto`.
    pub fn backed_off(&self, retries: u32) -> Duration {
        let factor = 1u32 << retries.min(MAX_BACKOFF_SHIFT);
        self.rto.saturating_mul(factor).min(self.max_rto)
    }
}

/// A reliable datagram waiting for its ack.
#[derive(Debug, Clone)]
pub struct InFlightPacket {
    pub seq: u32,
    /// Encoded once; retransmissions resend these exact bytes.
    pub datagram: Vec<u8>,
    pub sent_at: Instant,
    pub retries: u32,
}

/// A packet reached `max_retries` retransmissions and came due again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("sequence {seq} unacknowledged after {retries} retransmissions")]
pub struct RetriesExhausted {
    pub seq: u32,
    pub retries: u32,
}

/// Sending half: queue, window and retransmission.
#[derive(Debug)]
pub struct ReliableSender {
    next_seq: u32,
    in_flight: VecDeque<InFlightPacket>,
    /// Frames without a sequence number yet.
    pending: VecDeque<DataFrame>,
    window: usize,
    max_retries: u32,
    timer: RetransmitTimer,
}

impl ReliableSender {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            next_seq: 0,
            in_flight: VecDeque::new(),
            pending: VecDeque::new(),
            window: config.send_window,
            max_retries: config.max_retries,
            timer: RetransmitTimer::from_config(config),
        }
    }

    /// Queue a message. It gets a sequence number once the window has room.
    pub fn enqueue(&mut self, message_id: i64, payload: Vec<u8>) {
        self.push(message_id, None, payload);
    }

    /// Queue an RPC call; it shares the sequence space and ordering with messages.
    pub fn enqueue_rpc(&mut self, method_id: i64, header: RpcHeader, arg_data: Vec<u8>) {
        self.push(method_id, Some(header), arg_data);
    }

    fn push(&mut self, message_id: i64, rpc: Option<RpcHeader>, payload: Vec<u8>) {
        self.pending.push_back(DataFrame {
            message_id,
            seq: None,
            rpc,
            payload,
        });
    }

    /// Move queued messages into the window; returns datagrams to transmit now.
    pub fn poll_transmit(&mut self, now: Instant) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        while self.in_flight.len() < self.window {
            let Some(mut frame) = self.pending.pop_front() else {
                break;
            };
            let seq = self.next_seq;
            frame.seq = Some(seq);
            let datagram = match frame.encode() {
                Ok(d) => d,
                Err(e) => {
                    tracing::warn!(message_id = frame.message_id, error = %e, "Dropping unencodable reliable message");
                    continue;
                }
            };
            self.next_seq = self.next_seq.wrapping_add(1);
            out.push(datagram.clone());
            self.in_flight.push_back(InFlightPacket {
                seq,
                datagram,
                sent_at: now,
                retries: 0,
            });
        }
        out
    }

    /// Process an ack. Returns false when `seq` was not in flight (duplicate or stale ack).
    pub fn on_ack(&mut self, seq: u32, now: Instant) -> bool {
        let Some(pos) = self.in_flight.iter().position(|p| p.seq == seq) else {
            return false;
        };
        if let Some(packet) = self.in_flight.remove(pos) {
            // Karn: ambiguous samples from retransmitted packets are skipped.
            if packet.retries == 0 {
                self.timer
                    .record_rtt_sample(now.saturating_duration_since(packet.sent_at));
            }
        }
        true
    }

    /// Datagrams whose retransmit deadline has passed, in sequence order.
    pub fn poll_retransmit(&mut self, now: Instant) -> Result<Vec<Vec<u8>>, RetriesExhausted> {
        let mut out = Vec::new();
        for packet in self.in_flight.iter_mut() {
            let deadline = packet.sent_at + self.timer.backed_off(packet.retries);
            if now < deadline {
                continue;
            }
            if packet.retries >= self.max_retries {
                return Err(RetriesExhausted {
                    seq: packet.seq,
                    retries: packet.retries,
                });
            }
            packet.retries += 1;
            packet.sent_at = now;
            out.push(packet.datagram.clone());
        }
        Ok(out)
    }

    /// Drop all queued and in-flight state.
    pub fn clear(&mut self) {
        self.in_flight.clear();
        self.pending.clear();
    }

    pub fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }

    pub fn queued_len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_idle(&self) -> bool {
        self.in_flight.is_empty() && self.pending.is_empty()
    }

    pub fn timer(&self) -> &RetransmitTimer {
        &self.timer
    }
}

/// What the receiver did with a reliable segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Receipt {
    /// In-order: this message plus any buffered successors, ready for the application.
    Delivered(Vec<DataFrame>),
    /// Ahead of the next expected sequence; held until the gap fills.
    Buffered,
    /// Already delivered or already buffered.
    Duplicate,
    /// Too far ahead to buffer; dropped without ack.
    OutOfWindow,
}

impl Receipt {
    /// Whether the sender should get an ack for this segment.
    pub fn should_ack(&self) -> bool {
        !matches!(self, Receipt::OutOfWindow)
    }
}

/// Receiving half: reorder buffer and duplicate suppression.
#[derive(Debug)]
pub struct ReliableReceiver {
    next_expected: u32,
    window: u32,
    buffer: HashMap<u32, DataFrame>,
}

impl ReliableReceiver {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            next_expected: 0,
            window: config.receive_window,
            buffer: HashMap::new(),
        }
    }

    /// Accept the reliable frame numbered `seq`.
    pub fn on_segment(&mut self, seq: u32, frame: DataFrame) -> Receipt {
        let offset = seq.wrapping_sub(self.next_expected);
        if offset == 0 {
            let mut ready = vec![frame];
            self.next_expected = self.next_expected.wrapping_add(1);
            while let Some(next) = self.buffer.remove(&self.next_expected) {
                ready.push(next);
                self.next_expected = self.next_expected.wrapping_add(1);
            }
            return Receipt::Delivered(ready);
        }
        if offset >= HALF_SEQ_SPACE {
            return Receipt::Duplicate;
        }
        if offset >= self.window {
            return Receipt::OutOfWindow;
        }
        if self.buffer.contains_key(&seq) {
            return Receipt::Duplicate;
        }
        self.buffer.insert(seq, frame);
        Receipt::Buffered
    }

    pub fn next_expected(&self) -> u32 {
        self.next_expected
    }

    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

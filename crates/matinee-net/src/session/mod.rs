//! Session managers — the protocol engine proper.
//!
//! Shared plumbing lives here: the priority-ordered outbound queue, the
//! per-destination credit table for heavy traffic, and application-level
//! fragmentation (splitter + reassembler). The Server and Client variants
//! build their pump and receive loops on top.

pub mod client;
pub mod server;

pub use client::ClientSession;
pub use server::ServerSession;

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use bytes::{Bytes, BytesMut};
use dashmap::DashMap;

use matinee_core::packet::Packet;
use matinee_core::payload::{self, SplitHead};
use matinee_core::tags;
use matinee_core::wire::{self, WireError};

/// Micros since the Unix epoch, for latency probes.
pub(crate) fn now_micros() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

// ── Outbound queue ────────────────────────────────────────────────────────────

/// One logical outbound message: possibly several packets written as an
/// atomic burst, addressed to the destinations still pending transmission.
pub(crate) struct OutboundEntry {
    pub packets: Vec<Packet>,
    /// Destinations not yet served. Entry is done when this empties.
    pub dests: Vec<i64>,
    pub priority: i32,
    /// For server forwarding: the peer this message originated from.
    pub source: i64,
    /// Set on fragments so an abort can purge unsent parts.
    pub split_id: Option<u64>,
}

impl OutboundEntry {
    pub fn payload_bytes(&self) -> u64 {
        self.packets.iter().map(|p| p.len() as u64).sum()
    }

    pub fn is_heavy(&self) -> bool {
        self.packets.iter().any(|p| tags::is_heavy(p.tag()))
    }
}

/// Priority-ordered outbound queue. Non-zero priority entries are spliced
/// ahead of the first strictly-lower-priority one; zero is FIFO append.
pub(crate) struct OutboundQueue {
    queue: Mutex<VecDeque<OutboundEntry>>,
}

impl OutboundQueue {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
        }
    }

    pub fn push(&self, entry: OutboundEntry) {
        let mut queue = self.queue.lock().unwrap();
        if entry.priority != 0 {
            if let Some(idx) = queue.iter().position(|q| q.priority < entry.priority) {
                queue.insert(idx, entry);
                return;
            }
        }
        queue.push_back(entry);
    }

    pub fn lock(&self) -> MutexGuard<'_, VecDeque<OutboundEntry>> {
        self.queue.lock().unwrap()
    }

    /// Remove every not-yet-sent entry of a split. Returns the removed
    /// entries so the caller can tell whether the head was still queued.
    pub fn purge_split(&self, split_id: u64) -> Vec<OutboundEntry> {
        let mut queue = self.queue.lock().unwrap();
        let mut removed = Vec::new();
        queue.retain_mut(|entry| {
            if entry.split_id == Some(split_id) {
                removed.push(OutboundEntry {
                    packets: std::mem::take(&mut entry.packets),
                    dests: std::mem::take(&mut entry.dests),
                    priority: entry.priority,
                    source: entry.source,
                    split_id: entry.split_id,
                });
                false
            } else {
                true
            }
        });
        removed
    }

    pub fn queued_bytes(&self) -> u64 {
        self.queue
            .lock()
            .unwrap()
            .iter()
            .map(|e| e.payload_bytes())
            .sum()
    }
}

// ── Credit flow control ───────────────────────────────────────────────────────

/// Stop-and-wait credit tracking, evaluated independently per destination.
/// Heavy packets are held while a destination's unconfirmed-byte counter
/// exceeds the ceiling; byte confirmations from that destination release it.
pub(crate) struct CreditTable {
    ceiling: u64,
    unconfirmed: DashMap<i64, u64>,
}

impl CreditTable {
    pub fn new(ceiling: u64) -> Self {
        Self {
            ceiling,
            unconfirmed: DashMap::new(),
        }
    }

    pub fn can_send(&self, dest: i64) -> bool {
        self.unconfirmed.get(&dest).map(|c| *c).unwrap_or(0) <= self.ceiling
    }

    pub fn record_sent(&self, dest: i64, bytes: u64) {
        *self.unconfirmed.entry(dest).or_insert(0) += bytes;
    }

    pub fn confirm(&self, dest: i64, bytes: u64) {
        if let Some(mut counter) = self.unconfirmed.get_mut(&dest) {
            *counter = counter.saturating_sub(bytes);
        }
    }

    /// Drop all state for a departed destination.
    pub fn forget(&self, dest: i64) {
        self.unconfirmed.remove(&dest);
    }
}

// ── Application-level fragmentation ───────────────────────────────────────────

/// Splits messages above the session threshold into a `SPLIT_HEAD` packet
/// plus `SPLIT_PART` packets. This threshold is larger than, and independent
/// of, the frame-level ceiling in the channel layer.
pub(crate) struct Splitter {
    next_id: AtomicU64,
    threshold: usize,
}

impl Splitter {
    pub fn new(threshold: usize) -> Self {
        Self {
            next_id: AtomicU64::new(1),
            threshold,
        }
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// Fragment a packet. Returns the split id, the head packet, and the
    /// part packets in transmission order.
    pub fn fragment(&self, packet: &Packet) -> (u64, Packet, Vec<Packet>) {
        let split_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let payload = packet.payload();
        let part_count = payload.len().div_ceil(self.threshold);

        let head = payload::to_packet(
            tags::SPLIT_HEAD,
            &SplitHead {
                split_id,
                original_tag: packet.tag(),
                part_count: part_count as u32,
                total_size: payload.len() as u64,
            },
        );

        let parts = (0..part_count)
            .map(|i| {
                let start = i * self.threshold;
                let end = (start + self.threshold).min(payload.len());
                Packet::new(
                    tags::SPLIT_PART,
                    wire::encode_split_part(split_id, &payload[start..end]),
                )
            })
            .collect();

        (split_id, head, parts)
    }
}

/// Reassembles application-level splits, keyed per sender so concurrent
/// splits from different peers never mix.
pub(crate) struct Reassembler {
    active: Mutex<HashMap<(i64, u64), Assembly>>,
}

struct Assembly {
    head: SplitHead,
    buf: BytesMut,
    received: u32,
}

impl Reassembler {
    pub fn new() -> Self {
        Self {
            active: Mutex::new(HashMap::new()),
        }
    }

    pub fn on_head(&self, sender: i64, head: SplitHead) {
        let mut active = self.active.lock().unwrap();
        active.insert(
            (sender, head.split_id),
            Assembly {
                buf: BytesMut::with_capacity(head.total_size as usize),
                received: 0,
                head,
            },
        );
    }

    /// Feed one `SPLIT_PART` payload. Returns the reassembled packet once
    /// all announced parts arrived.
    pub fn on_part(&self, sender: i64, part_payload: &Bytes) -> Result<Option<Packet>, WireError> {
        let (split_id, chunk) = wire::decode_split_part(part_payload)?;
        let mut active = self.active.lock().unwrap();
        let key = (sender, split_id);
        let Some(assembly) = active.get_mut(&key) else {
            tracing::warn!(sender, split_id, "split part without head, dropping");
            return Ok(None);
        };
        assembly.buf.extend_from_slice(&chunk);
        assembly.received += 1;
        if assembly.received < assembly.head.part_count {
            return Ok(None);
        }
        let assembly = active.remove(&key).unwrap();
        Ok(Some(Packet::new(
            assembly.head.original_tag,
            assembly.buf.freeze(),
        )))
    }

    /// Discard partial state for an aborted split.
    pub fn on_abort(&self, sender: i64, split_id: u64) {
        if self.active.lock().unwrap().remove(&(sender, split_id)).is_some() {
            tracing::debug!(sender, split_id, "split aborted, partial state dropped");
        }
    }

    /// Drop everything a departed sender left behind.
    pub fn forget_sender(&self, sender: i64) {
        self.active.lock().unwrap().retain(|(s, _), _| *s != sender);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(label: u8, priority: i32) -> OutboundEntry {
        OutboundEntry {
            packets: vec![Packet::new(1, vec![label])],
            dests: vec![1],
            priority,
            source: 0,
            split_id: None,
        }
    }

    #[test]
    fn outbound_queue_never_sends_lower_before_queued_higher() {
        let queue = OutboundQueue::new();
        for (label, priority) in [(b'a', 0), (b'b', 2), (b'c', 1), (b'd', 2), (b'e', 0)] {
            queue.push(entry(label, priority));
        }
        let order: Vec<u8> = queue
            .lock()
            .iter()
            .map(|e| e.packets[0].payload()[0])
            .collect();
        // Both priority-2 entries in insertion order, then 1, then FIFO zeros.
        assert_eq!(order, vec![b'b', b'd', b'c', b'a', b'e']);
    }

    #[test]
    fn purge_split_removes_only_that_split() {
        let queue = OutboundQueue::new();
        let mut part = entry(b'p', 0);
        part.split_id = Some(7);
        queue.push(part);
        queue.push(entry(b'x', 0));
        let mut other = entry(b'q', 0);
        other.split_id = Some(8);
        queue.push(other);

        let removed = queue.purge_split(7);
        assert_eq!(removed.len(), 1);
        assert_eq!(queue.lock().len(), 2);
    }

    #[test]
    fn credit_blocks_only_above_ceiling() {
        let credit = CreditTable::new(1000);
        assert!(credit.can_send(5));
        credit.record_sent(5, 1000);
        assert!(credit.can_send(5));
        credit.record_sent(5, 1);
        assert!(!credit.can_send(5));
        // Independent per destination.
        assert!(credit.can_send(6));

        credit.confirm(5, 500);
        assert!(credit.can_send(5));
    }

    #[test]
    fn split_then_reassemble_is_byte_exact() {
        let splitter = Splitter::new(1000);
        let payload: Vec<u8> = (0..4321u32).map(|i| (i * 3) as u8).collect();
        let original = Packet::new(tags::VIDEO_PACKET, payload.clone());

        let (split_id, head, parts) = splitter.fragment(&original);
        assert_eq!(parts.len(), 5);

        let reassembler = Reassembler::new();
        let head: SplitHead = payload::parse(tags::SPLIT_HEAD, &head).unwrap();
        assert_eq!(head.split_id, split_id);
        assert_eq!(head.part_count, 5);
        assert_eq!(head.total_size, 4321);
        reassembler.on_head(3, head);

        let mut done = None;
        for part in &parts {
            assert!(done.is_none(), "completed before the final part");
            done = reassembler.on_part(3, part.payload()).unwrap();
        }
        let done = done.expect("reassembly must complete on the last part");
        assert_eq!(done.tag(), tags::VIDEO_PACKET);
        assert_eq!(&done.payload()[..], &payload[..]);
    }

    #[test]
    fn reassembler_keys_per_sender() {
        let splitter = Splitter::new(100);
        let a = Packet::new(tags::VIDEO_PACKET, vec![0xaa; 250]);
        let b = Packet::new(tags::AUDIO_PACKET, vec![0xbb; 250]);
        let (_, head_a, parts_a) = splitter.fragment(&a);
        let (_, head_b, parts_b) = splitter.fragment(&b);

        let reassembler = Reassembler::new();
        reassembler.on_head(1, payload::parse(tags::SPLIT_HEAD, &head_a).unwrap());
        reassembler.on_head(2, payload::parse(tags::SPLIT_HEAD, &head_b).unwrap());

        // Interleave parts from both senders.
        for (pa, pb) in parts_a.iter().zip(parts_b.iter()) {
            let done_a = reassembler.on_part(1, pa.payload()).unwrap();
            let done_b = reassembler.on_part(2, pb.payload()).unwrap();
            if let Some(done) = done_a {
                assert_eq!(&done.payload()[..], &a.payload()[..]);
            }
            if let Some(done) = done_b {
                assert_eq!(&done.payload()[..], &b.payload()[..]);
            }
        }
    }

    #[test]
    fn abort_discards_partial_state() {
        let splitter = Splitter::new(100);
        let original = Packet::new(tags::VIDEO_PACKET, vec![1u8; 300]);
        let (split_id, head, parts) = splitter.fragment(&original);

        let reassembler = Reassembler::new();
        reassembler.on_head(4, payload::parse(tags::SPLIT_HEAD, &head).unwrap());
        reassembler.on_part(4, parts[0].payload()).unwrap();
        reassembler.on_abort(4, split_id);

        // Remaining parts no longer complete anything.
        for part in &parts[1..] {
            assert!(reassembler.on_part(4, part.payload()).unwrap().is_none());
        }
    }
}

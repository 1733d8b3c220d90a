//! Framed channel — turns one stream socket into a packet channel.
//!
//! Two background loops per channel: the writer pulls from a priority-ordered
//! egress queue and emits length-prefixed frames, splitting any payload above
//! the frame ceiling into a `FRAME_SPLIT` control frame plus N part frames;
//! the reader mirrors the reassembly and feeds a bounded ingress queue. A
//! `MULTI_PACKET` control frame makes the reader deposit the next N logical
//! packets contiguously. Any I/O error or zero-byte read is terminal for the
//! channel: both loops stop and `connected()` turns false. An orderly
//! `close()` first drains egress that was queued before the call, so a final
//! message (a handshake denial, a disconnect notice) still reaches the wire.
//! No retries here — higher layers observe the disconnect and decide what
//! to do.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Notify;

use matinee_core::packet::Packet;
use matinee_core::tags;
use matinee_core::wire::{self, FrameDecoder, FrameSplit};

#[derive(Debug, Clone, Copy)]
pub struct ChannelOptions {
    pub max_frame_payload: usize,
    pub poll_interval: Duration,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            max_frame_payload: wire::DEFAULT_MAX_FRAME_PAYLOAD,
            poll_interval: Duration::from_millis(10),
        }
    }
}

/// One priority bucket in the egress queue. A multi-packet entry is written
/// to the wire contiguously, nothing interleaves inside it.
struct Queued {
    packets: Vec<Packet>,
    priority: i32,
}

struct Shared {
    egress: Mutex<VecDeque<Queued>>,
    ingress: Mutex<VecDeque<Packet>>,
    connected: AtomicBool,
    /// Orderly close requested: the writer drains what is already queued,
    /// then tears the socket down.
    draining: AtomicBool,
    // One stop signal per loop. `notify_one` stores a permit, so a close
    // that lands before the loop parks is still observed.
    reader_stop: Notify,
    writer_stop: Notify,
    opts: ChannelOptions,
}

/// Cheap-to-clone handle over one socket's packet channel.
#[derive(Clone)]
pub struct FramedChannel {
    shared: Arc<Shared>,
}

impl FramedChannel {
    /// Take ownership of a stream and spawn its reader and writer loops.
    pub fn spawn<S>(stream: S, opts: ChannelOptions) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let shared = Arc::new(Shared {
            egress: Mutex::new(VecDeque::new()),
            ingress: Mutex::new(VecDeque::new()),
            connected: AtomicBool::new(true),
            draining: AtomicBool::new(false),
            reader_stop: Notify::new(),
            writer_stop: Notify::new(),
            opts,
        });

        let (read_half, write_half) = tokio::io::split(stream);
        tokio::spawn(writer_loop(shared.clone(), write_half));
        tokio::spawn(reader_loop(shared.clone(), read_half));

        Self { shared }
    }

    /// Enqueue one packet. Higher priority is spliced ahead of strictly lower
    /// priority entries; priority 0 is pure FIFO. Dropped if disconnected.
    pub fn send(&self, packet: Packet, priority: i32) {
        self.send_group(vec![packet], priority);
    }

    /// Enqueue several packets as one atomic burst: they hit the wire
    /// back-to-back, preceded by a `MULTI_PACKET` grouping frame.
    pub fn send_group(&self, packets: Vec<Packet>, priority: i32) {
        if packets.is_empty() {
            return;
        }
        if !self.connected() || self.shared.draining.load(Ordering::Acquire) {
            tracing::trace!(count = packets.len(), "dropping send on closing channel");
            return;
        }
        let mut egress = self.shared.egress.lock().unwrap();
        splice(&mut egress, Queued { packets, priority });
    }

    /// Pop the next received packet, arrival order.
    pub fn receive(&self) -> Option<Packet> {
        self.shared.ingress.lock().unwrap().pop_front()
    }

    pub fn connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }

    /// True when no received packet is waiting. The registry sweep must not
    /// collect a disconnected channel until this is true.
    pub fn ingress_empty(&self) -> bool {
        self.shared.ingress.lock().unwrap().is_empty()
    }

    /// Bytes sitting in the egress queue, for stats events.
    pub fn queued_bytes(&self) -> u64 {
        let egress = self.shared.egress.lock().unwrap();
        egress
            .iter()
            .flat_map(|q| q.packets.iter())
            .map(|p| p.len() as u64)
            .sum()
    }

    /// Tear the channel down. Already-queued egress is written out first,
    /// then both loops stop and the socket closes. New sends are dropped
    /// from the moment this is called.
    pub fn close(&self) {
        self.shared.draining.store(true, Ordering::Release);
        self.shared.writer_stop.notify_one();
        self.shared.reader_stop.notify_one();
    }
}

/// Insert an entry ahead of the first strictly-lower-priority one, keeping
/// FIFO order among equal priorities. Priority 0 appends.
fn splice(queue: &mut VecDeque<Queued>, entry: Queued) {
    if entry.priority != 0 {
        if let Some(idx) = queue.iter().position(|q| q.priority < entry.priority) {
            queue.insert(idx, entry);
            return;
        }
    }
    queue.push_back(entry);
}

// ── Writer loop ───────────────────────────────────────────────────────────────

async fn writer_loop<W>(shared: Arc<Shared>, mut writer: tokio::io::WriteHalf<W>)
where
    W: AsyncWrite + Send + 'static,
{
    let mut out = BytesMut::new();
    loop {
        if !shared.connected.load(Ordering::Acquire) {
            break;
        }
        let next = shared.egress.lock().unwrap().pop_front();
        let Some(entry) = next else {
            if shared.draining.load(Ordering::Acquire) {
                // Orderly close and nothing left to write.
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep(shared.opts.poll_interval) => {}
                _ = shared.writer_stop.notified() => {}
            }
            continue;
        };

        out.clear();
        encode_entry(&entry, shared.opts.max_frame_payload, &mut out);
        if let Err(e) = writer.write_all(&out).await {
            tracing::debug!(error = %e, "channel write failed, disconnecting");
            break;
        }
    }
    shared.connected.store(false, Ordering::Release);
    shared.reader_stop.notify_one();
    let _ = writer.shutdown().await;
}

/// Encode one egress entry into wire frames: a grouping frame when the entry
/// carries several packets, then each packet either whole or as a frame-level
/// split when it exceeds the ceiling.
fn encode_entry(entry: &Queued, max_payload: usize, out: &mut BytesMut) {
    if entry.packets.len() > 1 {
        wire::encode_frame(
            &Packet::new(tags::MULTI_PACKET, wire::encode_multi(entry.packets.len() as u32)),
            out,
        );
    }
    for packet in &entry.packets {
        if packet.len() <= max_payload {
            wire::encode_frame(packet, out);
            continue;
        }
        let parts = packet.len().div_ceil(max_payload);
        let split = FrameSplit {
            tag: packet.tag(),
            parts: parts as u32,
            total: packet.len() as u32,
        };
        wire::encode_frame(&Packet::new(tags::FRAME_SPLIT, split.encode()), out);
        let payload = packet.payload();
        for i in 0..parts {
            let start = i * max_payload;
            let end = (start + max_payload).min(payload.len());
            wire::encode_frame(&Packet::new(packet.tag(), payload.slice(start..end)), out);
        }
    }
}

// ── Reader loop ───────────────────────────────────────────────────────────────

async fn reader_loop<R>(shared: Arc<Shared>, mut reader: tokio::io::ReadHalf<R>)
where
    R: AsyncRead + Send + 'static,
{
    let mut decoder = FrameDecoder::new(shared.opts.max_frame_payload);
    let mut buf = vec![0u8; 16 * 1024];
    // In-progress frame-level reassembly: announced split + accumulated parts.
    let mut split: Option<(FrameSplit, u32, BytesMut)> = None;
    // In-progress contiguous group: packets collected until the count is met.
    let mut group: Option<(u32, Vec<Packet>)> = None;

    'outer: loop {
        let n = tokio::select! {
            result = reader.read(&mut buf) => match result {
                Ok(0) => {
                    tracing::debug!("peer closed, disconnecting channel");
                    shared.connected.store(false, Ordering::Release);
                    break;
                }
                Ok(n) => n,
                Err(e) => {
                    tracing::debug!(error = %e, "channel read failed, disconnecting");
                    shared.connected.store(false, Ordering::Release);
                    break;
                }
            },
            // Orderly close: stop reading but leave `connected` to the
            // writer, which still has queued egress to drain.
            _ = shared.reader_stop.notified() => break,
        };

        decoder.extend(&buf[..n]);
        loop {
            match decoder.next_frame() {
                Ok(None) => break,
                Ok(Some(frame)) => {
                    handle_frame(&shared, frame, &mut split, &mut group);
                }
                Err(e) => {
                    tracing::warn!(error = %e, "malformed frame, disconnecting channel");
                    shared.connected.store(false, Ordering::Release);
                    break 'outer;
                }
            }
        }
    }

    shared.writer_stop.notify_one();
}

fn handle_frame(
    shared: &Shared,
    frame: Packet,
    split: &mut Option<(FrameSplit, u32, BytesMut)>,
    group: &mut Option<(u32, Vec<Packet>)>,
) {
    // A pending split consumes the next frames as parts.
    if let Some((announced, received, acc)) = split.as_mut() {
        if frame.tag() != announced.tag {
            tracing::warn!(
                expected = announced.tag,
                got = frame.tag(),
                "split part tag mismatch, discarding split"
            );
            *split = None;
            return;
        }
        acc.extend_from_slice(frame.payload());
        *received += 1;
        if *received == announced.parts {
            let (announced, _, acc) = split.take().unwrap();
            deliver(shared, Packet::new(announced.tag, acc.freeze()), group);
        }
        return;
    }

    match frame.tag() {
        tags::FRAME_SPLIT => match FrameSplit::decode(frame.payload()) {
            Ok(announced) if announced.parts > 0 => {
                *split = Some((announced, 0, BytesMut::with_capacity(announced.total as usize)));
            }
            Ok(announced) => {
                deliver(shared, Packet::empty(announced.tag), group);
            }
            Err(e) => tracing::warn!(error = %e, "bad FRAME_SPLIT payload, dropping"),
        },
        tags::MULTI_PACKET => match wire::decode_multi(frame.payload()) {
            Ok(0) => {}
            Ok(count) => *group = Some((count, Vec::with_capacity(count as usize))),
            Err(e) => tracing::warn!(error = %e, "bad MULTI_PACKET payload, dropping"),
        },
        _ => deliver(shared, frame, group),
    }
}

/// Place one logical packet on the ingress queue, or hold it until its group
/// completes so the whole group lands under one lock hold.
fn deliver(shared: &Shared, packet: Packet, group: &mut Option<(u32, Vec<Packet>)>) {
    if let Some((count, collected)) = group.as_mut() {
        collected.push(packet);
        if collected.len() as u32 == *count {
            let (_, collected) = group.take().unwrap();
            shared.ingress.lock().unwrap().extend(collected);
        }
        return;
    }
    shared.ingress.lock().unwrap().push_back(packet);
}

#[cfg(test)]
mod tests {
    use super::*;
    use matinee_core::wire::FrameDecoder;

    fn opts(max: usize) -> ChannelOptions {
        ChannelOptions {
            max_frame_payload: max,
            poll_interval: Duration::from_millis(1),
        }
    }

    /// Read and decode every frame the channel wrote to `side`.
    async fn drain_frames(
        side: &mut tokio::io::DuplexStream,
        max: usize,
        expected: usize,
    ) -> Vec<Packet> {
        let mut decoder = FrameDecoder::new(max);
        let mut frames = Vec::new();
        let mut buf = vec![0u8; 4096];
        while frames.len() < expected {
            let n = side.read(&mut buf).await.unwrap();
            assert!(n > 0, "stream closed early");
            decoder.extend(&buf[..n]);
            while let Some(frame) = decoder.next_frame().unwrap() {
                frames.push(frame);
            }
        }
        frames
    }

    #[test]
    fn splice_orders_by_priority_then_fifo() {
        let mut queue = VecDeque::new();
        for (label, priority) in [(b'a', 0), (b'b', 5), (b'c', 5), (b'd', 9), (b'e', 0)] {
            splice(
                &mut queue,
                Queued {
                    packets: vec![Packet::new(1, vec![label])],
                    priority,
                },
            );
        }
        let order: Vec<u8> = queue.iter().map(|q| q.packets[0].payload()[0]).collect();
        // 9 first, then the two 5s in insertion order, then the FIFO zeros.
        assert_eq!(order, vec![b'd', b'b', b'c', b'a', b'e']);
    }

    #[tokio::test]
    async fn small_packet_round_trips() {
        let (near, far) = tokio::io::duplex(64 * 1024);
        let a = FramedChannel::spawn(near, opts(1024));
        let b = FramedChannel::spawn(far, opts(1024));

        a.send(Packet::new(tags::PLAYLIST_ADD_REQUEST, &b"hello"[..]), 0);
        let got = wait_for_packet(&b).await;
        assert_eq!(got.tag(), tags::PLAYLIST_ADD_REQUEST);
        assert_eq!(&got.payload()[..], b"hello");
    }

    #[tokio::test]
    async fn oversized_payload_emits_split_head_and_parts() {
        // Max-frame 1024, 5000-byte video payload: four full parts plus one tail.
        let (near, mut far) = tokio::io::duplex(64 * 1024);
        let channel = FramedChannel::spawn(near, opts(1024));

        let payload: Vec<u8> = (0..5000u32).map(|i| i as u8).collect();
        channel.send(Packet::new(tags::VIDEO_PACKET, payload.clone()), 0);

        let frames = drain_frames(&mut far, 1024, 6).await;
        assert_eq!(frames[0].tag(), tags::FRAME_SPLIT);
        let split = FrameSplit::decode(frames[0].payload()).unwrap();
        assert_eq!(split.parts, 5);
        assert_eq!(split.total, 5000);
        assert_eq!(split.tag, tags::VIDEO_PACKET);

        let mut reassembled = Vec::new();
        for part in &frames[1..6] {
            assert_eq!(part.tag(), tags::VIDEO_PACKET);
            assert!(part.len() <= 1024);
            reassembled.extend_from_slice(part.payload());
        }
        assert_eq!(reassembled, payload);
    }

    #[tokio::test]
    async fn split_then_reassemble_is_byte_exact() {
        let (near, far) = tokio::io::duplex(256 * 1024);
        let a = FramedChannel::spawn(near, opts(1024));
        let b = FramedChannel::spawn(far, opts(1024));

        let payload: Vec<u8> = (0..50_000u32).map(|i| (i * 7) as u8).collect();
        a.send(Packet::new(tags::VIDEO_PACKET, payload.clone()), 0);

        let got = wait_for_packet(&b).await;
        assert_eq!(got.tag(), tags::VIDEO_PACKET);
        assert_eq!(&got.payload()[..], &payload[..]);
    }

    #[tokio::test]
    async fn grouped_packets_arrive_contiguously() {
        let (near, mut far) = tokio::io::duplex(64 * 1024);
        let channel = FramedChannel::spawn(near, opts(1024));

        channel.send_group(
            vec![
                Packet::new(tags::USER_ID, &b"x"[..]),
                Packet::new(tags::PLAY_START, &b"y"[..]),
                Packet::new(tags::STREAM_META, &b"z"[..]),
            ],
            0,
        );

        let frames = drain_frames(&mut far, 1024, 4).await;
        assert_eq!(frames[0].tag(), tags::MULTI_PACKET);
        assert_eq!(wire::decode_multi(frames[0].payload()).unwrap(), 3);
        assert_eq!(frames[1].tag(), tags::USER_ID);
        assert_eq!(frames[2].tag(), tags::PLAY_START);
        assert_eq!(frames[3].tag(), tags::STREAM_META);
    }

    #[tokio::test]
    async fn close_drains_queued_egress_before_teardown() {
        let (near, far) = tokio::io::duplex(64 * 1024);
        let a = FramedChannel::spawn(near, opts(1024));
        let b = FramedChannel::spawn(far, opts(1024));

        // Queue, then close immediately: the packet must still cross.
        a.send(Packet::new(tags::HELLO_DENY, &b"no entry"[..]), 1);
        a.close();

        let got = wait_for_packet(&b).await;
        assert_eq!(got.tag(), tags::HELLO_DENY);
        assert_eq!(&got.payload()[..], b"no entry");

        // Sends after close are dropped, and the channel winds down.
        a.send(Packet::empty(tags::KEEP_ALIVE), 0);
        for _ in 0..500 {
            if !a.connected() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("channel never finished closing");
    }

    #[tokio::test]
    async fn close_stops_the_reader() {
        let (near, mut far) = tokio::io::duplex(64 * 1024);
        let channel = FramedChannel::spawn(near, opts(1024));

        channel.close();
        for _ in 0..500 {
            if !channel.connected() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        assert!(!channel.connected());

        // Once both loops exit they drop their stream halves, so raw writes
        // into the channel start failing. A reader still parked in `read()`
        // would keep the stream alive and ingest this frame instead.
        let mut out = BytesMut::new();
        wire::encode_frame(&Packet::new(tags::STREAM_META, &b"late"[..]), &mut out);
        for _ in 0..500 {
            if far.write_all(&out).await.is_err() {
                assert!(channel.receive().is_none());
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("reader kept the stream alive after close");
    }

    #[tokio::test]
    async fn peer_close_marks_disconnected() {
        let (near, far) = tokio::io::duplex(1024);
        let channel = FramedChannel::spawn(near, opts(1024));
        assert!(channel.connected());

        drop(far);
        for _ in 0..100 {
            if !channel.connected() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("channel never noticed the peer closing");
    }

    async fn wait_for_packet(channel: &FramedChannel) -> Packet {
        for _ in 0..500 {
            if let Some(p) = channel.receive() {
                return p;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("no packet arrived");
    }
}

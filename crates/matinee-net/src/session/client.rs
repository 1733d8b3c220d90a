//! Client session manager — one connection to the authority.
//!
//! Dials, performs the `HELLO`/`WELCOME` handshake, mirrors the user
//! directory, and runs the outbound pump and receive loop. Addressed sends
//! carry a destination prefix the authority fans out; inbound messages
//! arrive with the prefix rewritten to the originating peer's id.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use dashmap::DashMap;
use tokio::sync::broadcast;

use matinee_core::event::AppEvent;
use matinee_core::packet::Packet;
use matinee_core::payload::{
    self, Hello, HelloDeny, UserInfo, UserJoin, UserLeave, UserRename, Welcome, AUTHORITY_ID,
};
use matinee_core::tags;
use matinee_core::wire;

use crate::channel::ChannelOptions;
use crate::listener::dial;
use crate::registry::{ConnectionHandle, ConnectionRegistry};
use crate::Context;

use super::{now_micros, CreditTable, OutboundEntry, OutboundQueue, Reassembler, Splitter};

struct ClientInner {
    ctx: Context,
    conn: ConnectionHandle,
    local_id: i64,
    users: DashMap<i64, UserInfo>,
    outbound: OutboundQueue,
    credit: CreditTable,
    splitter: Splitter,
    reassembler: Reassembler,
    staged: Mutex<Vec<Packet>>,
    split_dests: DashMap<u64, Vec<i64>>,
    latency_micros: AtomicU64,
    last_keepalive: Mutex<Instant>,
    shutdown: broadcast::Sender<()>,
}

/// Handle to a connected client session.
#[derive(Clone)]
pub struct ClientSession {
    inner: Arc<ClientInner>,
}

impl ClientSession {
    /// Dial `addr`, complete the handshake, and spawn the session tasks.
    pub async fn connect(
        ctx: Context,
        registry: &ConnectionRegistry,
        addr: &str,
        username: &str,
        password: Option<String>,
    ) -> Result<Self> {
        let session_cfg = &ctx.config.session;
        let opts = ChannelOptions {
            max_frame_payload: session_cfg.max_frame_payload,
            poll_interval: Duration::from_millis(session_cfg.poll_interval_ms),
        };
        let poll = opts.poll_interval;
        let timeout = Duration::from_millis(session_cfg.keepalive_timeout_ms);

        let conn = dial(addr, registry, opts).await?;
        conn.channel().send(
            payload::to_packet(tags::HELLO, &Hello {
                username: username.to_string(),
                password,
            }),
            1,
        );

        let welcome = match await_handshake_reply(&conn, poll, timeout).await {
            Ok(reply) => reply,
            Err(e) => {
                ctx.events.raise(AppEvent::ConnectionFailed {
                    reason: e.to_string(),
                });
                conn.channel().close();
                return Err(e);
            }
        };

        let users = DashMap::new();
        for user in welcome.users {
            users.insert(user.id, user);
        }
        tracing::info!(user_id = welcome.user_id, peer = addr, "handshake complete");

        let (shutdown_tx, _) = broadcast::channel(1);
        let inner = Arc::new(ClientInner {
            conn,
            local_id: welcome.user_id,
            users,
            outbound: OutboundQueue::new(),
            credit: CreditTable::new(session_cfg.unconfirmed_ceiling),
            splitter: Splitter::new(session_cfg.split_threshold),
            reassembler: Reassembler::new(),
            staged: Mutex::new(Vec::new()),
            split_dests: DashMap::new(),
            latency_micros: AtomicU64::new(0),
            last_keepalive: Mutex::new(Instant::now()),
            shutdown: shutdown_tx,
            ctx,
        });

        tokio::spawn(pump_loop(inner.clone()));
        tokio::spawn(probe_loop(inner.clone()));
        tokio::spawn(receive_loop(inner.clone()));

        inner.ctx.events.raise(AppEvent::Connected {
            user_id: inner.local_id,
        });
        Ok(Self { inner })
    }

    pub fn local_id(&self) -> i64 {
        self.inner.local_id
    }

    pub fn connected(&self) -> bool {
        self.inner.conn.channel().connected()
    }

    /// Most recent round-trip latency to the authority, in microseconds.
    pub fn latency_micros(&self) -> u64 {
        self.inner.latency_micros.load(Ordering::Relaxed)
    }

    /// Snapshot of the mirrored user directory.
    pub fn users(&self) -> Vec<UserInfo> {
        self.inner.users.iter().map(|u| u.value().clone()).collect()
    }

    pub fn remote_user_ids(&self) -> Vec<i64> {
        self.inner
            .users
            .iter()
            .map(|u| *u.key())
            .filter(|id| *id != self.inner.local_id)
            .collect()
    }

    /// Queue a packet for the given destinations. The local id delivers
    /// through the dispatch bus without touching the network.
    pub fn send(&self, packet: Packet, dests: &[i64], priority: i32) {
        let inner = &self.inner;
        if dests.contains(&inner.local_id) {
            inner.ctx.bus.publish(packet.share(), inner.local_id);
        }
        let remote: Vec<i64> = dests
            .iter()
            .copied()
            .filter(|d| *d != inner.local_id)
            .collect();
        if remote.is_empty() {
            return;
        }

        if packet.len() > inner.splitter.threshold() {
            let (split_id, head, parts) = inner.splitter.fragment(&packet);
            inner.split_dests.insert(split_id, remote.clone());
            inner.outbound.push(OutboundEntry {
                packets: vec![head],
                dests: remote.clone(),
                priority,
                source: inner.local_id,
                split_id: Some(split_id),
            });
            for part in parts {
                inner.outbound.push(OutboundEntry {
                    packets: vec![part],
                    dests: remote.clone(),
                    priority,
                    source: inner.local_id,
                    split_id: Some(split_id),
                });
            }
            return;
        }

        inner.outbound.push(OutboundEntry {
            packets: vec![packet],
            dests: remote,
            priority,
            source: inner.local_id,
            split_id: None,
        });
    }

    /// Stage a packet for a later atomic `flush`.
    pub fn queue(&self, packet: Packet) {
        self.inner.staged.lock().unwrap().push(packet);
    }

    /// Send everything staged since the last flush as one burst.
    pub fn flush(&self, dests: &[i64], priority: i32) {
        let inner = &self.inner;
        let staged = std::mem::take(&mut *inner.staged.lock().unwrap());
        if staged.is_empty() {
            return;
        }
        if dests.contains(&inner.local_id) {
            for packet in &staged {
                inner.ctx.bus.publish(packet.share(), inner.local_id);
            }
        }
        let remote: Vec<i64> = dests
            .iter()
            .copied()
            .filter(|d| *d != inner.local_id)
            .collect();
        if remote.is_empty() {
            return;
        }
        inner.outbound.push(OutboundEntry {
            packets: staged,
            dests: remote,
            priority,
            source: inner.local_id,
            split_id: None,
        });
    }

    /// Drop the unsent fragments of a queued split and, when the head is
    /// already on the wire, tell the recipients to discard partial state.
    pub fn abort_send(&self, split_id: u64) {
        let inner = &self.inner;
        let removed = inner.outbound.purge_split(split_id);
        let head_still_queued = removed
            .iter()
            .any(|e| e.packets.first().map(|p| p.tag()) == Some(tags::SPLIT_HEAD));
        let Some((_, dests)) = inner.split_dests.remove(&split_id) else {
            return;
        };
        if !head_still_queued {
            tracing::debug!(split_id, "aborting announced split, notifying recipients");
            inner.outbound.push(OutboundEntry {
                packets: vec![Packet::new(tags::SPLIT_ABORT, wire::encode_u64(split_id))],
                dests,
                priority: 1,
                source: inner.local_id,
                split_id: None,
            });
        }
    }

    /// Announce a new username to the authority, which rebroadcasts it.
    pub fn rename(&self, name: &str) {
        self.inner
            .conn
            .channel()
            .send(Packet::new(tags::USERNAME, name.as_bytes().to_vec()), 0);
    }

    /// Orderly shutdown: tell the authority, then tear the session down.
    pub fn disconnect(&self) {
        self.inner
            .conn
            .channel()
            .send(Packet::empty(tags::DISCONNECT), 1);
        let _ = self.inner.shutdown.send(());
        self.inner.conn.channel().close();
    }
}

/// Wait for `WELCOME` or `HELLO_DENY`. Any other tag is a violation.
async fn await_handshake_reply(
    conn: &ConnectionHandle,
    poll: Duration,
    timeout: Duration,
) -> Result<Welcome> {
    let deadline = Instant::now() + timeout;
    let reply = loop {
        if let Some(packet) = conn.channel().receive() {
            break packet;
        }
        if !conn.channel().connected() {
            bail!("connection lost during handshake");
        }
        if Instant::now() > deadline {
            bail!("handshake timed out");
        }
        tokio::time::sleep(poll).await;
    };

    match reply.tag() {
        tags::WELCOME => Ok(payload::parse(tags::WELCOME, &reply)?),
        tags::HELLO_DENY => {
            let deny: HelloDeny = payload::parse(tags::HELLO_DENY, &reply)?;
            bail!("handshake denied: {}", deny.reason)
        }
        other => bail!("expected WELCOME, got tag {other}"),
    }
}

// ── Outbound pump ─────────────────────────────────────────────────────────────

/// Single physical link, per-destination credit. An entry goes out when at
/// least one destination has credit; blocked destinations stay queued.
async fn pump_loop(inner: Arc<ClientInner>) {
    let poll = Duration::from_millis(inner.ctx.config.session.poll_interval_ms);
    let mut shutdown = inner.shutdown.subscribe();
    loop {
        tokio::select! {
            _ = shutdown.recv() => return,
            _ = tokio::time::sleep(poll) => {}
        }
        if !inner.conn.channel().connected() {
            return;
        }
        pump_once(&inner);
    }
}

fn pump_once(inner: &ClientInner) {
    let mut queue = inner.outbound.lock();
    let mut i = 0;
    while i < queue.len() {
        let Some(mut entry) = queue.remove(i) else { break };
        let heavy = entry.is_heavy();
        let bytes = entry.payload_bytes();

        let sendable: Vec<i64> = if heavy {
            entry
                .dests
                .iter()
                .copied()
                .filter(|d| inner.credit.can_send(*d))
                .collect()
        } else {
            entry.dests.clone()
        };

        if sendable.is_empty() {
            queue.insert(i, entry);
            i += 1;
            continue;
        }

        // The authority consumes one destination prefix per packet, so every
        // addressed packet in the burst gets its own.
        let prefix = Packet::new(tags::USER_ID, wire::encode_user_ids(&sendable));
        let mut group = Vec::with_capacity(entry.packets.len() * 2);
        for packet in &entry.packets {
            if !tags::is_unaddressed(packet.tag()) {
                group.push(prefix.share());
            }
            group.push(packet.share());
        }
        inner.conn.channel().send_group(group, entry.priority);

        if heavy {
            for dest in &sendable {
                inner.credit.record_sent(*dest, bytes);
            }
        }

        entry.dests.retain(|d| !sendable.contains(d));
        if entry.dests.is_empty() {
            // fully sent
        } else {
            queue.insert(i, entry);
            i += 1;
        }
    }
}

// ── Latency probes ────────────────────────────────────────────────────────────

async fn probe_loop(inner: Arc<ClientInner>) {
    let mut interval = tokio::time::interval(Duration::from_millis(
        inner.ctx.config.session.latency_probe_interval_ms,
    ));
    let mut shutdown = inner.shutdown.subscribe();
    loop {
        tokio::select! {
            _ = shutdown.recv() => return,
            _ = interval.tick() => {}
        }
        if !inner.conn.channel().connected() {
            return;
        }
        // Timestamp goes out as-is; the authority echoes it untouched.
        inner.conn.channel().send(
            Packet::new(tags::LATENCY_PROBE, wire::encode_u64(now_micros())),
            1,
        );
    }
}

// ── Receive loop ──────────────────────────────────────────────────────────────

async fn receive_loop(inner: Arc<ClientInner>) {
    let poll = Duration::from_millis(inner.ctx.config.session.poll_interval_ms);
    let timeout = Duration::from_millis(inner.ctx.config.session.keepalive_timeout_ms);
    let mut shutdown = inner.shutdown.subscribe();
    let mut pending_source: Option<i64> = None;

    loop {
        let Some(packet) = inner.conn.channel().receive() else {
            if !inner.conn.channel().connected() {
                drop_session(&inner, "connection closed");
                return;
            }
            if inner.last_keepalive.lock().unwrap().elapsed() > timeout {
                drop_session(&inner, "keep-alive timeout");
                return;
            }
            tokio::select! {
                _ = shutdown.recv() => return,
                _ = tokio::time::sleep(poll) => {}
            }
            continue;
        };

        match packet.tag() {
            tags::USER_ID => match wire::decode_user_ids(packet.payload()) {
                Ok(ids) => pending_source = ids.first().copied(),
                Err(e) => tracing::warn!(error = %e, "bad USER_ID prefix"),
            },
            tags::KEEP_ALIVE => {
                *inner.last_keepalive.lock().unwrap() = Instant::now();
            }
            tags::LATENCY_PROBE => on_probe_echo(&inner, &packet),
            tags::USER_JOIN => on_user_join(&inner, packet),
            tags::USER_LEAVE => on_user_leave(&inner, packet),
            tags::USER_RENAME => on_user_rename(&inner, packet),
            _ => {
                let source = pending_source.take().unwrap_or(AUTHORITY_ID);
                deliver(&inner, source, packet);
            }
        }
    }
}

/// Session-level demux of an addressed message: reassembly, credit
/// bookkeeping, then the dispatch bus.
fn deliver(inner: &ClientInner, source: i64, packet: Packet) {
    match packet.tag() {
        tags::BYTE_CONFIRM => match wire::decode_u64(tags::BYTE_CONFIRM, packet.payload()) {
            Ok(bytes) => inner.credit.confirm(source, bytes),
            Err(e) => tracing::warn!(source, error = %e, "bad BYTE_CONFIRM"),
        },
        tags::SPLIT_HEAD => match payload::parse(tags::SPLIT_HEAD, &packet) {
            Ok(head) => inner.reassembler.on_head(source, head),
            Err(e) => tracing::warn!(source, error = %e, "bad SPLIT_HEAD"),
        },
        tags::SPLIT_PART => {
            confirm_bytes(inner, source, packet.len() as u64);
            match inner.reassembler.on_part(source, packet.payload()) {
                Ok(Some(whole)) => {
                    inner.ctx.bus.publish(whole, source);
                }
                Ok(None) => {}
                Err(e) => tracing::warn!(source, error = %e, "bad SPLIT_PART"),
            }
        }
        tags::SPLIT_ABORT => match wire::decode_u64(tags::SPLIT_ABORT, packet.payload()) {
            Ok(split_id) => inner.reassembler.on_abort(source, split_id),
            Err(e) => tracing::warn!(source, error = %e, "bad SPLIT_ABORT"),
        },
        tag if tags::is_heavy(tag) => {
            confirm_bytes(inner, source, packet.len() as u64);
            inner.ctx.bus.publish(packet, source);
        }
        _ => {
            inner.ctx.bus.publish(packet, source);
        }
    }
}

/// Acknowledge received heavy bytes back to their sender, through the
/// authority's forwarding path.
fn confirm_bytes(inner: &ClientInner, sender: i64, bytes: u64) {
    inner.outbound.push(OutboundEntry {
        packets: vec![Packet::new(tags::BYTE_CONFIRM, wire::encode_u64(bytes))],
        dests: vec![sender],
        priority: 1,
        source: inner.local_id,
        split_id: None,
    });
}

fn on_probe_echo(inner: &ClientInner, packet: &Packet) {
    let Ok(sent) = wire::decode_u64(tags::LATENCY_PROBE, packet.payload()) else {
        tracing::warn!("bad latency probe echo");
        return;
    };
    let latency = now_micros().saturating_sub(sent);
    inner.latency_micros.store(latency, Ordering::Relaxed);
    inner.ctx.events.raise(AppEvent::Stats {
        latency_micros: latency,
        queued_bytes: inner.outbound.queued_bytes() + inner.conn.channel().queued_bytes(),
    });
}

fn on_user_join(inner: &ClientInner, packet: Packet) {
    match payload::parse::<UserJoin>(tags::USER_JOIN, &packet) {
        Ok(join) => {
            tracing::info!(user_id = join.user.id, name = %join.user.name, "user joined");
            inner.users.insert(join.user.id, join.user.clone());
            inner.ctx.events.raise(AppEvent::UserJoined { user: join.user });
            inner.ctx.bus.publish(packet, AUTHORITY_ID);
        }
        Err(e) => tracing::warn!(error = %e, "bad USER_JOIN"),
    }
}

fn on_user_leave(inner: &ClientInner, packet: Packet) {
    match payload::parse::<UserLeave>(tags::USER_LEAVE, &packet) {
        Ok(leave) => {
            tracing::info!(user_id = leave.user_id, "user left");
            inner.users.remove(&leave.user_id);
            inner.credit.forget(leave.user_id);
            inner.reassembler.forget_sender(leave.user_id);
            inner
                .ctx
                .events
                .raise(AppEvent::UserLeft { user_id: leave.user_id });
            inner.ctx.bus.publish(packet, AUTHORITY_ID);
        }
        Err(e) => tracing::warn!(error = %e, "bad USER_LEAVE"),
    }
}

fn on_user_rename(inner: &ClientInner, packet: Packet) {
    match payload::parse::<UserRename>(tags::USER_RENAME, &packet) {
        Ok(rename) => {
            if let Some(mut user) = inner.users.get_mut(&rename.user_id) {
                user.name = rename.name.clone();
            }
            inner.ctx.events.raise(AppEvent::UserRenamed {
                user_id: rename.user_id,
                name: rename.name,
            });
            inner.ctx.bus.publish(packet, AUTHORITY_ID);
        }
        Err(e) => tracing::warn!(error = %e, "bad USER_RENAME"),
    }
}

fn drop_session(inner: &ClientInner, reason: &str) {
    tracing::info!(reason, "client session ending");
    let _ = inner.shutdown.send(());
    inner.conn.channel().close();
    inner.ctx.events.raise(AppEvent::Disconnected {
        user_id: inner.local_id,
        reason: reason.into(),
    });
}

//! Server session manager — the authority's protocol engine.
//!
//! Owns the user directory, routes destination-prefixed messages between
//! peers, runs the outbound pump with priority and per-destination credit,
//! and emits keep-alives. The first packet on every inbound connection must
//! be the `HELLO` handshake; anything else tears the connection down.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Result;
use dashmap::DashMap;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};

use matinee_core::event::AppEvent;
use matinee_core::packet::Packet;
use matinee_core::payload::{
    self, Hello, HelloDeny, UserInfo, UserJoin, UserLeave, UserRename, Welcome, AUTHORITY_ID,
};
use matinee_core::tags;
use matinee_core::wire;

use crate::channel::{ChannelOptions, FramedChannel};
use crate::listener::{accept_loop, NewConnection};
use crate::registry::{ConnectionHandle, ConnectionRegistry};
use crate::Context;

use super::{CreditTable, OutboundEntry, OutboundQueue, Reassembler, Splitter};

struct UserEntry {
    info: UserInfo,
    conn: ConnectionHandle,
    last_seen: Mutex<Instant>,
}

struct ServerInner {
    ctx: Context,
    users: DashMap<i64, UserEntry>,
    next_user_id: AtomicI64,
    outbound: OutboundQueue,
    credit: CreditTable,
    splitter: Splitter,
    reassembler: Reassembler,
    staged: Mutex<Vec<Packet>>,
    /// Destinations already told about a split, for abort notification.
    split_dests: DashMap<u64, Vec<i64>>,
    shutdown: broadcast::Sender<()>,
}

/// Handle to the running authority session.
#[derive(Clone)]
pub struct ServerSession {
    inner: Arc<ServerInner>,
}

impl ServerSession {
    /// Bind the accept loop on `listener` and spawn every server task.
    pub fn start(ctx: Context, registry: ConnectionRegistry, listener: TcpListener) -> Result<Self> {
        let session_cfg = &ctx.config.session;
        let opts = ChannelOptions {
            max_frame_payload: session_cfg.max_frame_payload,
            poll_interval: Duration::from_millis(session_cfg.poll_interval_ms),
        };
        let (shutdown_tx, _) = broadcast::channel(1);

        let inner = Arc::new(ServerInner {
            users: DashMap::new(),
            next_user_id: AtomicI64::new(1),
            outbound: OutboundQueue::new(),
            credit: CreditTable::new(session_cfg.unconfirmed_ceiling),
            splitter: Splitter::new(session_cfg.split_threshold),
            reassembler: Reassembler::new(),
            staged: Mutex::new(Vec::new()),
            split_dests: DashMap::new(),
            shutdown: shutdown_tx.clone(),
            ctx,
        });

        let (notify_tx, mut notify_rx) = mpsc::unbounded_channel::<NewConnection>();
        tokio::spawn(accept_loop(
            listener,
            registry,
            opts,
            notify_tx,
            shutdown_tx.subscribe(),
        ));

        // Connection consumer: one handshake-then-receive task per socket.
        {
            let inner = inner.clone();
            let mut shutdown = shutdown_tx.subscribe();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = shutdown.recv() => return,
                        conn = notify_rx.recv() => match conn {
                            Some(conn) => {
                                tokio::spawn(connection_loop(inner.clone(), conn.handle));
                            }
                            None => return,
                        },
                    }
                }
            });
        }

        tokio::spawn(pump_loop(inner.clone()));
        tokio::spawn(keepalive_loop(inner.clone()));

        Ok(Self { inner })
    }

    /// Queue a packet for the given destinations. Id 0 is served locally
    /// through the dispatch bus before anything touches the network.
    pub fn send(&self, packet: Packet, dests: &[i64], priority: i32) {
        send_common(&self.inner, packet, dests, priority, AUTHORITY_ID);
    }

    /// Stage a packet for a later atomic `flush`.
    pub fn queue(&self, packet: Packet) {
        self.inner.staged.lock().unwrap().push(packet);
    }

    /// Send everything staged since the last flush as one burst: nothing
    /// interleaves between the staged packets on any destination's wire.
    pub fn flush(&self, dests: &[i64], priority: i32) {
        let staged = std::mem::take(&mut *self.inner.staged.lock().unwrap());
        if staged.is_empty() {
            return;
        }
        if dests.contains(&AUTHORITY_ID) {
            for packet in &staged {
                self.inner.ctx.bus.publish(packet.share(), AUTHORITY_ID);
            }
        }
        let remote: Vec<i64> = dests.iter().copied().filter(|d| *d != AUTHORITY_ID).collect();
        if remote.is_empty() {
            return;
        }
        self.inner.outbound.push(OutboundEntry {
            packets: staged,
            dests: remote,
            priority,
            source: AUTHORITY_ID,
            split_id: None,
        });
    }

    /// Drop the not-yet-sent fragments of a queued split and, when the head
    /// already went out, tell the informed recipients to discard state.
    pub fn abort_send(&self, split_id: u64) {
        abort_common(&self.inner, split_id, true);
    }

    /// Snapshot of the user directory, authority included.
    pub fn users(&self) -> Vec<UserInfo> {
        let mut users = vec![authority_info()];
        users.extend(self.inner.users.iter().map(|u| u.info.clone()));
        users
    }

    pub fn connected_user_ids(&self) -> Vec<i64> {
        self.inner.users.iter().map(|u| *u.key()).collect()
    }

    pub fn shutdown(&self) {
        let _ = self.inner.shutdown.send(());
        for user in self.inner.users.iter() {
            user.conn.channel().close();
        }
    }
}

fn authority_info() -> UserInfo {
    UserInfo {
        id: AUTHORITY_ID,
        name: "server".into(),
        may_add: true,
        may_control: true,
    }
}

// ── Shared send/abort paths ───────────────────────────────────────────────────

fn send_common(inner: &ServerInner, packet: Packet, dests: &[i64], priority: i32, source: i64) {
    if dests.contains(&AUTHORITY_ID) {
        // Local destination: synchronous delivery, no round trip.
        inner.ctx.bus.publish(packet.share(), source);
    }
    let remote: Vec<i64> = dests.iter().copied().filter(|d| *d != AUTHORITY_ID).collect();
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
            source,
            split_id: Some(split_id),
        });
        for part in parts {
            inner.outbound.push(OutboundEntry {
                packets: vec![part],
                dests: remote.clone(),
                priority,
                source,
                split_id: Some(split_id),
            });
        }
        return;
    }

    inner.outbound.push(OutboundEntry {
        packets: vec![packet],
        dests: remote,
        priority,
        source,
        split_id: None,
    });
}

fn abort_common(inner: &ServerInner, split_id: u64, notify_recipients: bool) {
    let removed = inner.outbound.purge_split(split_id);
    let head_still_queued = removed
        .iter()
        .any(|e| e.packets.first().map(|p| p.tag()) == Some(tags::SPLIT_HEAD));
    let Some((_, dests)) = inner.split_dests.remove(&split_id) else {
        return;
    };
    if notify_recipients && !head_still_queued {
        tracing::debug!(split_id, "aborting announced split, notifying recipients");
        inner.outbound.push(OutboundEntry {
            packets: vec![Packet::new(tags::SPLIT_ABORT, wire::encode_u64(split_id))],
            dests,
            priority: 1,
            source: AUTHORITY_ID,
            split_id: None,
        });
    }
}

// ── Outbound pump ─────────────────────────────────────────────────────────────

/// Drains the outbound queue: per entry, per destination, checks credit for
/// heavy traffic, writes the `USER_ID` source prefix plus the packets as one
/// burst on the destination's channel, and records unconfirmed bytes.
async fn pump_loop(inner: Arc<ServerInner>) {
    let poll = Duration::from_millis(inner.ctx.config.session.poll_interval_ms);
    let mut shutdown = inner.shutdown.subscribe();
    loop {
        tokio::select! {
            _ = shutdown.recv() => return,
            _ = tokio::time::sleep(poll) => {}
        }
        pump_once(&inner);
    }
}

fn pump_once(inner: &ServerInner) {
    let mut queue = inner.outbound.lock();
    let mut i = 0;
    while i < queue.len() {
        let Some(mut entry) = queue.remove(i) else { break };
        let heavy = entry.is_heavy();
        let bytes = entry.payload_bytes();

        let mut held = Vec::new();
        for dest in std::mem::take(&mut entry.dests) {
            let Some(user) = inner.users.get(&dest) else {
                tracing::trace!(dest, "dropping message for departed user");
                continue;
            };
            if heavy && !inner.credit.can_send(dest) {
                // Held back until a confirmation arrives.
                held.push(dest);
                continue;
            }
            transmit(user.conn.channel(), &entry, dest);
            if heavy {
                inner.credit.record_sent(dest, bytes);
            }
        }
        entry.dests = held;

        if entry.dests.is_empty() {
            // fully sent: entry stays removed
        } else {
            queue.insert(i, entry);
            i += 1;
        }
    }
}

/// Write one entry to one destination, contiguously. A receiver consumes one
/// source prefix per packet, so every addressed packet in the burst gets its
/// own; allow-listed tags travel bare.
fn transmit(channel: &FramedChannel, entry: &OutboundEntry, dest: i64) {
    let prefix = Packet::new(tags::USER_ID, wire::encode_user_ids(&[entry.source]));
    let mut group = Vec::with_capacity(entry.packets.len() * 2);
    for packet in &entry.packets {
        if !tags::is_unaddressed(packet.tag()) {
            group.push(prefix.share());
        }
        group.push(packet.share());
    }
    tracing::trace!(
        dest,
        source = entry.source,
        packets = entry.packets.len(),
        "transmitting entry"
    );
    channel.send_group(group, entry.priority);
}

// ── Keep-alive ────────────────────────────────────────────────────────────────

async fn keepalive_loop(inner: Arc<ServerInner>) {
    let mut interval = tokio::time::interval(Duration::from_millis(
        inner.ctx.config.session.keepalive_interval_ms,
    ));
    let mut shutdown = inner.shutdown.subscribe();
    loop {
        tokio::select! {
            _ = shutdown.recv() => return,
            _ = interval.tick() => {}
        }
        for user in inner.users.iter() {
            user.conn.channel().send(Packet::empty(tags::KEEP_ALIVE), 1);
        }
    }
}

// ── Per-connection receive loop ───────────────────────────────────────────────

async fn connection_loop(inner: Arc<ServerInner>, handle: ConnectionHandle) {
    let poll = Duration::from_millis(inner.ctx.config.session.poll_interval_ms);
    let timeout = Duration::from_millis(inner.ctx.config.session.keepalive_timeout_ms);

    let user_id = match handshake(&inner, &handle, poll, timeout).await {
        Ok(id) => id,
        Err(reason) => {
            tracing::warn!(connection_id = handle.id(), reason, "handshake failed");
            inner
                .ctx
                .events
                .raise(AppEvent::ConnectionFailed { reason });
            handle.channel().close();
            return;
        }
    };

    let mut pending_dests: Option<Vec<i64>> = None;
    loop {
        let Some(packet) = handle.channel().receive() else {
            if !handle.channel().connected() {
                break;
            }
            let stale = {
                let user = inner.users.get(&user_id);
                match user {
                    Some(u) => u.last_seen.lock().unwrap().elapsed() > timeout,
                    None => true, // removed elsewhere
                }
            };
            if stale {
                tracing::info!(user_id, "peer silent beyond keep-alive timeout");
                break;
            }
            tokio::time::sleep(poll).await;
            continue;
        };

        if let Some(user) = inner.users.get(&user_id) {
            *user.last_seen.lock().unwrap() = Instant::now();
        }

        match packet.tag() {
            tags::USER_ID => match wire::decode_user_ids(packet.payload()) {
                Ok(ids) => pending_dests = Some(ids),
                Err(e) => tracing::warn!(user_id, error = %e, "bad USER_ID prefix"),
            },
            tags::KEEP_ALIVE => {}
            tags::LATENCY_PROBE => {
                // Echo untouched so the client can measure its round trip.
                handle.channel().send(packet, 1);
            }
            tags::DISCONNECT => {
                tracing::info!(user_id, "orderly disconnect requested");
                break;
            }
            tags::USERNAME => rename_user(&inner, user_id, &packet),
            _ => {
                let dests = pending_dests.take().unwrap_or_else(|| vec![AUTHORITY_ID]);
                route(&inner, user_id, packet, &dests);
            }
        }
    }

    remove_user(&inner, user_id);
    handle.channel().close();
}

/// First packet must be `HELLO`. Returns the assigned user id.
async fn handshake(
    inner: &ServerInner,
    handle: &ConnectionHandle,
    poll: Duration,
    timeout: Duration,
) -> Result<i64, String> {
    let deadline = Instant::now() + timeout;
    let first = loop {
        if let Some(packet) = handle.channel().receive() {
            break packet;
        }
        if !handle.channel().connected() {
            return Err("connection lost during handshake".into());
        }
        if Instant::now() > deadline {
            return Err("handshake timed out".into());
        }
        tokio::time::sleep(poll).await;
    };

    if first.tag() != tags::HELLO {
        // Protocol violation: tear down, no deny packet for garbage.
        return Err(format!("expected HELLO, got tag {}", first.tag()));
    }
    let hello: Hello = payload::parse(tags::HELLO, &first)
        .map_err(|e| format!("malformed HELLO: {e}"))?;

    let playback = &inner.ctx.config.playback;
    if let Some(expected) = &playback.password {
        if hello.password.as_deref() != Some(expected.as_str()) {
            deny(handle, "wrong password");
            return Err("wrong password".into());
        }
    }
    if playback.max_users != 0 && inner.users.len() >= playback.max_users {
        deny(handle, "server full");
        return Err("server full".into());
    }

    let user_id = inner.next_user_id.fetch_add(1, Ordering::Relaxed);
    let info = UserInfo {
        id: user_id,
        name: hello.username,
        may_add: playback.guests_may_add,
        may_control: playback.guests_may_control,
    };

    // Welcome carries the directory as it was before this join.
    let mut directory = vec![authority_info()];
    directory.extend(inner.users.iter().map(|u| u.info.clone()));
    handle.channel().send(
        payload::to_packet(tags::WELCOME, &Welcome {
            user_id,
            users: directory,
        }),
        1,
    );

    let join = payload::to_packet(tags::USER_JOIN, &UserJoin { user: info.clone() });
    let others: Vec<i64> = inner.users.iter().map(|u| *u.key()).collect();
    if !others.is_empty() {
        send_common(inner, join, &others, 0, AUTHORITY_ID);
    }

    inner.users.insert(
        user_id,
        UserEntry {
            info: info.clone(),
            conn: handle.clone(),
            last_seen: Mutex::new(Instant::now()),
        },
    );
    inner.ctx.events.raise(AppEvent::UserJoined { user: info });
    tracing::info!(user_id, "user joined");
    Ok(user_id)
}

fn deny(handle: &ConnectionHandle, reason: &str) {
    handle.channel().send(
        payload::to_packet(tags::HELLO_DENY, &HelloDeny {
            reason: reason.into(),
        }),
        1,
    );
}

fn rename_user(inner: &ServerInner, user_id: i64, packet: &Packet) {
    let Ok(name) = std::str::from_utf8(packet.payload()) else {
        tracing::warn!(user_id, "rename payload is not utf-8");
        return;
    };
    let name = name.to_string();
    if let Some(mut user) = inner.users.get_mut(&user_id) {
        user.info.name = name.clone();
    } else {
        return;
    }
    let everyone: Vec<i64> = inner.users.iter().map(|u| *u.key()).collect();
    send_common(
        inner,
        payload::to_packet(tags::USER_RENAME, &UserRename {
            user_id,
            name: name.clone(),
        }),
        &everyone,
        0,
        AUTHORITY_ID,
    );
    inner
        .ctx
        .events
        .raise(AppEvent::UserRenamed { user_id, name });
}

/// Route one addressed message: id 0 delivers locally, everything else is
/// forwarded with the prefix rewritten to carry the source user id.
fn route(inner: &ServerInner, source: i64, packet: Packet, dests: &[i64]) {
    let remote: Vec<i64> = dests
        .iter()
        .copied()
        .filter(|d| *d != AUTHORITY_ID && *d != source)
        .collect();
    let local = dests.contains(&AUTHORITY_ID);

    if !remote.is_empty() {
        inner.outbound.push(OutboundEntry {
            packets: vec![packet.share()],
            dests: remote,
            priority: 0,
            source,
            split_id: None,
        });
    }
    if local {
        deliver_local(inner, source, packet);
    }
}

/// Local delivery on the authority: session-level reassembly, credit
/// bookkeeping, then the dispatch bus.
fn deliver_local(inner: &ServerInner, source: i64, packet: Packet) {
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

/// Acknowledge received heavy bytes back to their sender.
fn confirm_bytes(inner: &ServerInner, sender: i64, bytes: u64) {
    inner.outbound.push(OutboundEntry {
        packets: vec![Packet::new(tags::BYTE_CONFIRM, wire::encode_u64(bytes))],
        dests: vec![sender],
        priority: 1,
        source: AUTHORITY_ID,
        split_id: None,
    });
}

fn remove_user(inner: &ServerInner, user_id: i64) {
    let Some((_, entry)) = inner.users.remove(&user_id) else {
        return;
    };
    entry.conn.channel().close();
    inner.credit.forget(user_id);
    inner.reassembler.forget_sender(user_id);

    let rest: Vec<i64> = inner.users.iter().map(|u| *u.key()).collect();
    if !rest.is_empty() {
        send_common(
            inner,
            payload::to_packet(tags::USER_LEAVE, &UserLeave { user_id }),
            &rest,
            0,
            AUTHORITY_ID,
        );
    }
    inner.ctx.events.raise(AppEvent::UserLeft { user_id });
    inner.ctx.events.raise(AppEvent::Disconnected {
        user_id,
        reason: "connection closed".into(),
    });
    tracing::info!(user_id, "user removed");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn authority_is_id_zero_with_full_permissions() {
        let info = authority_info();
        assert_eq!(info.id, AUTHORITY_ID);
        assert!(info.may_add && info.may_control);
    }
}

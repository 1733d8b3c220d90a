//! Orchestration strategies.
//!
//! Three variants over one shared playlist model: Offline applies requests
//! directly, Client round-trips every mutation through the authority, Server
//! is the authority. Strategies receive protocol traffic through dispatch-bus
//! subscriptions that feed a per-strategy inbox, drained on `update()`.

pub mod client;
pub mod offline;
pub mod server;

pub use client::ClientStrategy;
pub use offline::OfflineStrategy;
pub use server::ServerStrategy;

use std::sync::Arc;

use tokio::sync::mpsc;

use matinee_core::packet::Packet;
use matinee_core::payload::UserInfo;
use matinee_net::bus::SubId;
use matinee_net::session::{ClientSession, ServerSession};
use matinee_net::Context;

use crate::model::SharedPlaylist;
use crate::probe::{ProbeStatus, SharedProbe};

/// What a strategy needs from the session layer: addressed sends, its own
/// peer id, and the user directory.
pub trait PacketSink: Send + Sync {
    fn send(&self, packet: Packet, dests: &[i64], priority: i32);
    fn local_id(&self) -> i64;
    fn users(&self) -> Vec<UserInfo>;
}

impl PacketSink for ClientSession {
    fn send(&self, packet: Packet, dests: &[i64], priority: i32) {
        ClientSession::send(self, packet, dests, priority);
    }

    fn local_id(&self) -> i64 {
        ClientSession::local_id(self)
    }

    fn users(&self) -> Vec<UserInfo> {
        ClientSession::users(self)
    }
}

impl PacketSink for ServerSession {
    fn send(&self, packet: Packet, dests: &[i64], priority: i32) {
        ServerSession::send(self, packet, dests, priority);
    }

    fn local_id(&self) -> i64 {
        matinee_core::payload::AUTHORITY_ID
    }

    fn users(&self) -> Vec<UserInfo> {
        ServerSession::users(self)
    }
}

/// One interface over the three variants. `update()` is polled once per tick
/// by the orchestrator; everything else is driven by local UI requests.
pub trait PlaylistStrategy: Send {
    /// Begin adding a local file. Returns the new item id; the item starts
    /// loading and advances as the probe reports.
    fn on_add_item_request(&mut self, filename: String) -> i64;
    fn on_delete_item_request(&mut self, media_id: i64);
    fn on_play_item_request(&mut self, media_id: i64);
    fn on_stop_item_request(&mut self, media_id: i64);
    fn on_move_item_request(&mut self, media_id: i64, to_index: usize);
    fn update(&mut self);
}

// ── Bus inbox ─────────────────────────────────────────────────────────────────

/// Per-strategy packet inbox. Bus handlers run on whatever task publishes;
/// they only push into the queue, the strategy drains it on its own tick.
pub(crate) struct Inbox {
    ctx: Context,
    subs: Vec<SubId>,
    rx: mpsc::UnboundedReceiver<(Packet, i64)>,
}

impl Inbox {
    pub fn subscribe(ctx: &Context, tags: &[i32]) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let subs = tags
            .iter()
            .map(|&tag| {
                let tx = tx.clone();
                ctx.bus.subscribe(
                    tag,
                    Arc::new(move |packet, source| {
                        let _ = tx.send((packet, source));
                    }),
                )
            })
            .collect();
        Self {
            ctx: ctx.clone(),
            subs,
            rx,
        }
    }

    pub fn drain(&mut self) -> Vec<(Packet, i64)> {
        let mut out = Vec::new();
        while let Ok(entry) = self.rx.try_recv() {
            out.push(entry);
        }
        out
    }
}

impl Drop for Inbox {
    fn drop(&mut self) {
        for sub in self.subs.drain(..) {
            self.ctx.bus.unsubscribe(sub);
        }
    }
}

// ── Probe polling ─────────────────────────────────────────────────────────────

/// Poll the probe for every loading item and advance terminal verdicts.
/// Returns the item ids that just finished loading (now pending).
pub(crate) fn poll_loading(model: &SharedPlaylist, probe: &SharedProbe) -> Vec<i64> {
    let queries: Vec<(i64, String)> = {
        let playlist = model.lock().unwrap();
        playlist
            .loading
            .iter()
            .map(|i| (i.item_id, i.filename.clone()))
            .collect()
    };
    if queries.is_empty() {
        return Vec::new();
    }

    let mut finished = Vec::new();
    let mut probe = probe.lock().unwrap();
    let mut playlist = model.lock().unwrap();
    for (item_id, filename) in queries {
        match probe.poll(item_id, &filename) {
            ProbeStatus::InProgress => {}
            ProbeStatus::Finished { duration_secs } => {
                playlist.probe_finished(item_id, duration_secs);
                finished.push(item_id);
            }
            ProbeStatus::Failed { reason } => {
                tracing::warn!(item_id, file = %filename, reason, "media probe failed");
                playlist.probe_failed(item_id);
            }
        }
    }
    finished
}

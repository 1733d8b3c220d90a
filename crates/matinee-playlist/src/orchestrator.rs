//! Orchestrator — owns the shared model and the active strategy.
//!
//! Strategy switching destroys the old variant first (its cleanup
//! unsubscribes it from the dispatch bus) and constructs the replacement
//! over the same shared model, so playlist state survives mode changes.

use std::sync::Arc;
use std::time::Duration;

use matinee_net::session::{ClientSession, ServerSession};
use matinee_net::Context;

use crate::model::{Playlist, SharedPlaylist};
use crate::probe::SharedProbe;
use crate::strategy::{ClientStrategy, OfflineStrategy, PlaylistStrategy, ServerStrategy};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Offline,
    Client,
    Server,
}

pub struct Orchestrator {
    ctx: Context,
    model: SharedPlaylist,
    probe: SharedProbe,
    strategy: Option<Box<dyn PlaylistStrategy>>,
    mode: Mode,
}

impl Orchestrator {
    /// Start in offline mode over a fresh model.
    pub fn new(ctx: Context, probe: SharedProbe) -> Self {
        let model = Playlist::shared();
        let strategy: Box<dyn PlaylistStrategy> =
            Box::new(OfflineStrategy::new(model.clone(), probe.clone()));
        Self {
            ctx,
            model,
            probe,
            strategy: Some(strategy),
            mode: Mode::Offline,
        }
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn model(&self) -> SharedPlaylist {
        self.model.clone()
    }

    /// Drop the active strategy (running its cleanup), then build the new
    /// one over the shared model.
    fn install(&mut self, mode: Mode, make: impl FnOnce(&Context, SharedPlaylist, SharedProbe) -> Box<dyn PlaylistStrategy>) {
        tracing::info!(from = ?self.mode, to = ?mode, "switching playlist strategy");
        self.strategy = None;
        self.strategy = Some(make(&self.ctx, self.model.clone(), self.probe.clone()));
        self.mode = mode;
    }

    pub fn switch_offline(&mut self) {
        self.install(Mode::Offline, |_, model, probe| {
            Box::new(OfflineStrategy::new(model, probe))
        });
    }

    pub fn switch_client(&mut self, session: ClientSession) {
        self.install(Mode::Client, |ctx, model, probe| {
            Box::new(ClientStrategy::new(ctx, model, probe, Arc::new(session)))
        });
    }

    pub fn switch_server(&mut self, session: ServerSession) {
        self.install(Mode::Server, |ctx, model, probe| {
            Box::new(ServerStrategy::new(ctx, model, probe, Arc::new(session)))
        });
    }

    /// One poll of the active strategy. Called on a fixed interval.
    pub fn tick(&mut self) {
        if let Some(strategy) = self.strategy.as_mut() {
            strategy.update();
        }
    }

    /// Drive `tick` until the shutdown signal fires.
    pub async fn run(mut self, poll: Duration, mut shutdown: tokio::sync::broadcast::Receiver<()>) {
        let mut interval = tokio::time::interval(poll);
        loop {
            tokio::select! {
                _ = shutdown.recv() => return,
                _ = interval.tick() => self.tick(),
            }
        }
    }

    // ── Request API, consumed by UI code ──────────────────────────────────────

    pub fn request_add(&mut self, filename: String) -> Option<i64> {
        self.strategy
            .as_mut()
            .map(|s| s.on_add_item_request(filename))
    }

    pub fn request_delete(&mut self, media_id: i64) {
        if let Some(strategy) = self.strategy.as_mut() {
            strategy.on_delete_item_request(media_id);
        }
    }

    pub fn request_play(&mut self, media_id: i64) {
        if let Some(strategy) = self.strategy.as_mut() {
            strategy.on_play_item_request(media_id);
        }
    }

    pub fn request_stop(&mut self, media_id: i64) {
        if let Some(strategy) = self.strategy.as_mut() {
            strategy.on_stop_item_request(media_id);
        }
    }

    pub fn request_move(&mut self, media_id: i64, to_index: usize) {
        if let Some(strategy) = self.strategy.as_mut() {
            strategy.on_move_item_request(media_id, to_index);
        }
    }
}

//! Shared playlist model.
//!
//! One mutable aggregate owned by the orchestrator and mutated only by the
//! active strategy on the polling task. Items live in per-state buckets;
//! `item_id` is random, unique, and never reused for the process lifetime;
//! `media_id` is authority-assigned and only meaningful on ready items.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use rand::Rng;

use matinee_core::payload::{ItemSnapshot, HOST_MISSING};

/// Sentinel for "no media id yet" on pending items and for the
/// `currently_playing` / `currently_starting` slots.
pub const NO_MEDIA: i64 = -1;

/// Media id recorded when the authority denied the add.
pub const MEDIA_DENIED: i64 = -2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemState {
    /// Local media probe in progress.
    Loading,
    /// Add request sent, awaiting authority confirmation.
    Pending,
    /// Confirmed, visible to all peers.
    Ready,
    /// Probe failed or add denied.
    Failed,
}

#[derive(Debug, Clone)]
pub struct PlaylistItem {
    pub item_id: i64,
    pub media_id: i64,
    pub host_user_id: i64,
    pub duration_secs: f64,
    pub filename: String,
    pub state: ItemState,
}

impl PlaylistItem {
    pub fn snapshot(&self) -> ItemSnapshot {
        ItemSnapshot {
            item_id: self.item_id,
            media_id: self.media_id,
            host_user_id: self.host_user_id,
            duration_secs: self.duration_secs,
            filename: self.filename.clone(),
        }
    }

    pub fn from_snapshot(snap: &ItemSnapshot, state: ItemState) -> Self {
        Self {
            item_id: snap.item_id,
            media_id: snap.media_id,
            host_user_id: snap.host_user_id,
            duration_secs: snap.duration_secs,
            filename: snap.filename.clone(),
            state,
        }
    }
}

/// Handle shared between the orchestrator and whichever strategy is active.
pub type SharedPlaylist = Arc<Mutex<Playlist>>;

#[derive(Debug, Default)]
pub struct Playlist {
    pub loading: Vec<PlaylistItem>,
    pub pending: Vec<PlaylistItem>,
    /// The authoritative ordered list every peer converges on.
    pub ready: Vec<PlaylistItem>,
    pub failed: Vec<PlaylistItem>,

    /// Media id of the item playing right now, `NO_MEDIA` when idle.
    pub currently_playing: i64,
    /// Media id of an in-flight playback start, `NO_MEDIA` when idle.
    pub currently_starting: i64,

    /// Optimistic local requests awaiting authority confirmation.
    pub pending_play: Option<i64>,
    pub pending_stop: Option<i64>,
    pub pending_deletes: HashSet<i64>,
    pub pending_moves: HashSet<i64>,

    used_item_ids: HashSet<i64>,
}

impl Playlist {
    pub fn new() -> Self {
        Self {
            currently_playing: NO_MEDIA,
            currently_starting: NO_MEDIA,
            ..Default::default()
        }
    }

    pub fn shared() -> SharedPlaylist {
        Arc::new(Mutex::new(Self::new()))
    }

    /// Draw a fresh item id. Never reused within the process, even after
    /// the item itself is gone.
    pub fn new_item_id(&mut self) -> i64 {
        let mut rng = rand::thread_rng();
        loop {
            let id = rng.gen_range(1..i64::MAX);
            if self.used_item_ids.insert(id) {
                return id;
            }
        }
    }

    // ── Local item lifecycle ──────────────────────────────────────────────────

    /// Start a local item in the loading bucket. Returns its item id.
    pub fn add_loading(&mut self, host_user_id: i64, filename: String) -> i64 {
        let item_id = self.new_item_id();
        self.loading.push(PlaylistItem {
            item_id,
            media_id: NO_MEDIA,
            host_user_id,
            duration_secs: 0.0,
            filename,
            state: ItemState::Loading,
        });
        item_id
    }

    /// Probe finished: loading → pending.
    pub fn probe_finished(&mut self, item_id: i64, duration_secs: f64) -> Option<&PlaylistItem> {
        let idx = self.loading.iter().position(|i| i.item_id == item_id)?;
        let mut item = self.loading.remove(idx);
        item.duration_secs = duration_secs;
        item.state = ItemState::Pending;
        self.pending.push(item);
        self.pending.last()
    }

    /// Probe failed: loading → failed.
    pub fn probe_failed(&mut self, item_id: i64) {
        if let Some(idx) = self.loading.iter().position(|i| i.item_id == item_id) {
            let mut item = self.loading.remove(idx);
            item.state = ItemState::Failed;
            self.failed.push(item);
        }
    }

    /// Authority confirmed a locally pending item: pending → ready, media id
    /// assigned. Appends to the end of the ready order.
    pub fn promote_pending(&mut self, item_id: i64, media_id: i64) -> bool {
        let Some(idx) = self.pending.iter().position(|i| i.item_id == item_id) else {
            return false;
        };
        let mut item = self.pending.remove(idx);
        item.media_id = media_id;
        item.state = ItemState::Ready;
        self.ready.push(item);
        true
    }

    /// Authority denied a locally pending item: pending → failed with the
    /// denied sentinel media id.
    pub fn deny_pending(&mut self, item_id: i64) -> bool {
        let Some(idx) = self.pending.iter().position(|i| i.item_id == item_id) else {
            return false;
        };
        let mut item = self.pending.remove(idx);
        item.media_id = MEDIA_DENIED;
        item.state = ItemState::Failed;
        self.failed.push(item);
        true
    }

    // ── Ready list ────────────────────────────────────────────────────────────

    /// Apply an add broadcast. A matching locally pending item is promoted in
    /// place; anything else appends a new ready item from the snapshot.
    pub fn apply_add(&mut self, snap: &ItemSnapshot) {
        if self.promote_pending(snap.item_id, snap.media_id) {
            return;
        }
        self.used_item_ids.insert(snap.item_id);
        self.ready
            .push(PlaylistItem::from_snapshot(snap, ItemState::Ready));
    }

    pub fn ready_item(&self, media_id: i64) -> Option<&PlaylistItem> {
        self.ready.iter().find(|i| i.media_id == media_id)
    }

    pub fn remove_ready(&mut self, media_id: i64) -> Option<PlaylistItem> {
        let idx = self.ready.iter().position(|i| i.media_id == media_id)?;
        Some(self.ready.remove(idx))
    }

    /// Move a ready item to `to_index` by rotating the affected sub-range in
    /// place, preserving the relative order of every untouched item.
    pub fn move_ready(&mut self, media_id: i64, to_index: usize) -> bool {
        let Some(from) = self.ready.iter().position(|i| i.media_id == media_id) else {
            return false;
        };
        if to_index >= self.ready.len() {
            return false;
        }
        match from.cmp(&to_index) {
            std::cmp::Ordering::Less => self.ready[from..=to_index].rotate_left(1),
            std::cmp::Ordering::Greater => self.ready[to_index..=from].rotate_right(1),
            std::cmp::Ordering::Equal => {}
        }
        true
    }

    /// Mark every ready item hosted by a departed user host-missing, except
    /// the exact item currently playing.
    pub fn mark_host_missing(&mut self, user_id: i64) {
        for item in &mut self.ready {
            if item.host_user_id == user_id && item.media_id != self.currently_playing {
                item.host_user_id = HOST_MISSING;
            }
        }
    }

    /// Ordered snapshots of the ready list, for full-playlist replies.
    pub fn ready_snapshots(&self) -> Vec<ItemSnapshot> {
        self.ready.iter().map(|i| i.snapshot()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ready(playlist: &mut Playlist, media_id: i64, host: i64) {
        let item_id = playlist.new_item_id();
        playlist.ready.push(PlaylistItem {
            item_id,
            media_id,
            host_user_id: host,
            duration_secs: 10.0,
            filename: format!("m{media_id}.mkv"),
            state: ItemState::Ready,
        });
    }

    fn order(playlist: &Playlist) -> Vec<i64> {
        playlist.ready.iter().map(|i| i.media_id).collect()
    }

    #[test]
    fn loading_to_pending_to_ready() {
        let mut playlist = Playlist::new();
        let item_id = playlist.add_loading(3, "film.mkv".into());

        playlist.probe_finished(item_id, 120.0).unwrap();
        assert!(playlist.loading.is_empty());
        assert_eq!(playlist.pending.len(), 1);
        assert_eq!(playlist.pending[0].media_id, NO_MEDIA);

        assert!(playlist.promote_pending(item_id, 77));
        assert_eq!(playlist.ready[0].media_id, 77);
        assert_eq!(playlist.ready[0].state, ItemState::Ready);
    }

    #[test]
    fn denied_item_lands_in_failed_with_sentinel() {
        let mut playlist = Playlist::new();
        let item_id = playlist.add_loading(3, "film.mkv".into());
        playlist.probe_finished(item_id, 1.0);
        assert!(playlist.deny_pending(item_id));
        assert_eq!(playlist.failed[0].media_id, MEDIA_DENIED);
    }

    #[test]
    fn move_rotates_subrange_both_directions() {
        let mut playlist = Playlist::new();
        for id in 1..=5 {
            ready(&mut playlist, id, 0);
        }
        // Forward: 2 to index 3 → 1 3 4 2 5.
        assert!(playlist.move_ready(2, 3));
        assert_eq!(order(&playlist), vec![1, 3, 4, 2, 5]);
        // Backward: 5 to index 0 → 5 1 3 4 2.
        assert!(playlist.move_ready(5, 0));
        assert_eq!(order(&playlist), vec![5, 1, 3, 4, 2]);
        // Out of range target is refused.
        assert!(!playlist.move_ready(5, 9));
    }

    #[test]
    fn host_missing_spares_the_playing_item() {
        let mut playlist = Playlist::new();
        ready(&mut playlist, 10, 4);
        ready(&mut playlist, 11, 4);
        ready(&mut playlist, 12, 5);
        playlist.currently_playing = 11;

        playlist.mark_host_missing(4);
        assert_eq!(playlist.ready[0].host_user_id, HOST_MISSING);
        assert_eq!(playlist.ready[1].host_user_id, 4);
        assert_eq!(playlist.ready[2].host_user_id, 5);
    }

    #[test]
    fn item_ids_are_never_reused() {
        let mut playlist = Playlist::new();
        let mut seen = HashSet::new();
        for _ in 0..1000 {
            assert!(seen.insert(playlist.new_item_id()));
        }
    }

    #[test]
    fn apply_add_prefers_local_pending_item() {
        let mut playlist = Playlist::new();
        let item_id = playlist.add_loading(3, "mine.mkv".into());
        playlist.probe_finished(item_id, 2.0);
        let snap = ItemSnapshot {
            item_id,
            media_id: 500,
            host_user_id: 3,
            duration_secs: 2.0,
            filename: "mine.mkv".into(),
        };
        playlist.apply_add(&snap);
        assert!(playlist.pending.is_empty());
        assert_eq!(playlist.ready.len(), 1);

        // A foreign snapshot appends.
        let foreign = ItemSnapshot {
            item_id: 999,
            media_id: 501,
            host_user_id: 8,
            duration_secs: 3.0,
            filename: "theirs.mkv".into(),
        };
        playlist.apply_add(&foreign);
        assert_eq!(order(&playlist), vec![500, 501]);
    }
}

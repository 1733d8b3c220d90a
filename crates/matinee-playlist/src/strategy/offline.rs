//! Offline strategy — no authority round trip.
//!
//! The local peer is its own authority: every request mutates the shared
//! model directly. Media ids are still assigned so a later switch to a
//! networked strategy finds a well-formed model.

use rand::Rng;

use matinee_core::payload::AUTHORITY_ID;

use crate::model::{SharedPlaylist, NO_MEDIA};
use crate::probe::SharedProbe;
use crate::strategy::{poll_loading, PlaylistStrategy};

pub struct OfflineStrategy {
    model: SharedPlaylist,
    probe: SharedProbe,
}

impl OfflineStrategy {
    pub fn new(model: SharedPlaylist, probe: SharedProbe) -> Self {
        tracing::info!("offline playlist strategy active");
        Self { model, probe }
    }
}

impl PlaylistStrategy for OfflineStrategy {
    fn on_add_item_request(&mut self, filename: String) -> i64 {
        self.model
            .lock()
            .unwrap()
            .add_loading(AUTHORITY_ID, filename)
    }

    fn on_delete_item_request(&mut self, media_id: i64) {
        let mut playlist = self.model.lock().unwrap();
        if playlist.remove_ready(media_id).is_some() {
            if playlist.currently_playing == media_id {
                playlist.currently_playing = NO_MEDIA;
            }
        } else {
            tracing::debug!(media_id, "delete for unknown item ignored");
        }
    }

    fn on_play_item_request(&mut self, media_id: i64) {
        let mut playlist = self.model.lock().unwrap();
        if playlist.ready_item(media_id).is_none() {
            tracing::debug!(media_id, "play for unknown item ignored");
            return;
        }
        playlist.currently_playing = media_id;
    }

    fn on_stop_item_request(&mut self, media_id: i64) {
        let mut playlist = self.model.lock().unwrap();
        if playlist.currently_playing == media_id {
            playlist.currently_playing = NO_MEDIA;
        }
    }

    fn on_move_item_request(&mut self, media_id: i64, to_index: usize) {
        if !self.model.lock().unwrap().move_ready(media_id, to_index) {
            tracing::debug!(media_id, to_index, "move refused");
        }
    }

    fn update(&mut self) {
        // Finished probes promote straight to ready; we are the authority.
        for item_id in poll_loading(&self.model, &self.probe) {
            let media_id = rand::thread_rng().gen_range(0..i64::MAX);
            let mut playlist = self.model.lock().unwrap();
            playlist.promote_pending(item_id, media_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Playlist;
    use crate::probe::{self, InstantProbe};

    fn strategy() -> OfflineStrategy {
        OfflineStrategy::new(
            Playlist::shared(),
            probe::shared(InstantProbe { duration_secs: 60.0 }),
        )
    }

    #[test]
    fn add_probes_then_goes_ready_with_media_id() {
        let mut offline = strategy();
        let item_id = offline.on_add_item_request("short.mkv".into());
        offline.update();

        let playlist = offline.model.lock().unwrap();
        assert!(playlist.loading.is_empty() && playlist.pending.is_empty());
        assert_eq!(playlist.ready.len(), 1);
        assert_eq!(playlist.ready[0].item_id, item_id);
        assert!(playlist.ready[0].media_id >= 0);
    }

    #[test]
    fn play_stop_and_delete_apply_directly() {
        let mut offline = strategy();
        offline.on_add_item_request("a.mkv".into());
        offline.update();
        let media_id = offline.model.lock().unwrap().ready[0].media_id;

        offline.on_play_item_request(media_id);
        assert_eq!(offline.model.lock().unwrap().currently_playing, media_id);

        offline.on_stop_item_request(media_id);
        assert_eq!(offline.model.lock().unwrap().currently_playing, NO_MEDIA);

        offline.on_delete_item_request(media_id);
        assert!(offline.model.lock().unwrap().ready.is_empty());
    }
}

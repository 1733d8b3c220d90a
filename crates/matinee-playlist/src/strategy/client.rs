//! Client strategy — every mutation round-trips through the authority.
//!
//! Requests go out as packets and the item is parked in a pending tracker;
//! only the authoritative broadcast (or an explicit denial) mutates the
//! shared model. When this peer is elected host it runs the participation
//! round before media delivery begins.

use std::sync::Arc;
use std::time::Duration;

use matinee_core::packet::Packet;
use matinee_core::payload::{
    self, AddBroadcast, AddDeny, AddRequest, MoveBroadcast, MoveDeny, MoveRequest, PlayConfirm,
    PlayDeny, PlayOrder, PlayRequest, PlayResponse, PlayStart, PlaylistSnapshot, RemoveBroadcast,
    RemoveRequest, StopBroadcast, StopRequest, StreamMeta, UserLeave, AUTHORITY_ID,
};
use matinee_core::tags;
use matinee_net::Context;

use crate::model::{ItemState, SharedPlaylist, NO_MEDIA};
use crate::participation::ParticipationTracker;
use crate::probe::SharedProbe;
use crate::strategy::{poll_loading, Inbox, PacketSink, PlaylistStrategy};

/// An in-flight hosting round on this peer: ordered to prepare, collecting
/// participation answers, then delivering to the accepted set.
struct HostingRound {
    media_id: i64,
    tracker: ParticipationTracker,
    announced: bool,
}

pub struct ClientStrategy {
    model: SharedPlaylist,
    probe: SharedProbe,
    sink: Arc<dyn PacketSink>,
    inbox: Inbox,
    participation_timeout: Duration,
    hosting: Option<HostingRound>,
    /// Receivers that accepted the current session this peer hosts.
    accepted_receivers: Vec<i64>,
}

impl ClientStrategy {
    pub fn new(ctx: &Context, model: SharedPlaylist, probe: SharedProbe, sink: Arc<dyn PacketSink>) -> Self {
        let inbox = Inbox::subscribe(
            ctx,
            &[
                tags::PLAYLIST_ADD_BROADCAST,
                tags::PLAYLIST_ADD_DENY,
                tags::PLAYLIST_REMOVE_BROADCAST,
                tags::PLAYLIST_MOVE_BROADCAST,
                tags::PLAYLIST_MOVE_DENY,
                tags::PLAYLIST_FULL,
                tags::PLAY_ORDER,
                tags::PLAY_START,
                tags::PLAY_DENY,
                tags::PLAY_CONFIRM,
                tags::STOP_BROADCAST,
                tags::SEEK_BROADCAST,
                tags::USER_LEAVE,
            ],
        );
        let mut strategy = Self {
            model,
            probe,
            sink,
            inbox,
            participation_timeout: Duration::from_millis(
                ctx.config.playback.participation_timeout_ms,
            ),
            hosting: None,
            accepted_receivers: Vec::new(),
        };
        strategy.resubmit_local_items();
        strategy.request_full_playlist();
        tracing::info!(local_id = strategy.sink.local_id(), "client playlist strategy active");
        strategy
    }

    /// Ready items carried over from a non-networked life of this process are
    /// not valid under an authority. Purge them and re-submit as fresh adds
    /// under our newly assigned id.
    fn resubmit_local_items(&mut self) {
        let local_id = self.sink.local_id();
        let resubmit: Vec<_> = {
            let mut playlist = self.model.lock().unwrap();
            let drained: Vec<_> = playlist.ready.drain(..).collect();
            drained
                .into_iter()
                .map(|mut item| {
                    item.host_user_id = local_id;
                    item.media_id = NO_MEDIA;
                    item.state = ItemState::Pending;
                    playlist.pending.push(item.clone());
                    item
                })
                .collect()
        };
        for item in resubmit {
            tracing::debug!(item_id = item.item_id, file = %item.filename, "re-submitting carried-over item");
            self.sink.send(
                payload::to_packet(tags::PLAYLIST_ADD_REQUEST, &AddRequest {
                    item: item.snapshot(),
                }),
                &[AUTHORITY_ID],
                0,
            );
        }
    }

    fn request_full_playlist(&self) {
        self.sink
            .send(Packet::empty(tags::PLAYLIST_FULL_REQUEST), &[AUTHORITY_ID], 0);
    }

    /// Receivers this peer hosts for: everyone but itself.
    fn receiver_set(&self) -> Vec<i64> {
        let local_id = self.sink.local_id();
        self.sink
            .users()
            .into_iter()
            .map(|u| u.id)
            .filter(|id| *id != local_id)
            .collect()
    }

    fn handle(&mut self, packet: Packet, source: i64) {
        match packet.tag() {
            tags::PLAYLIST_ADD_BROADCAST => {
                if let Ok(msg) = parse_logged::<AddBroadcast>(&packet) {
                    self.model.lock().unwrap().apply_add(&msg.item);
                }
            }
            tags::PLAYLIST_ADD_DENY => {
                if let Ok(msg) = parse_logged::<AddDeny>(&packet) {
                    tracing::warn!(item_id = msg.item_id, reason = %msg.reason, "add denied");
                    self.model.lock().unwrap().deny_pending(msg.item_id);
                }
            }
            tags::PLAYLIST_REMOVE_BROADCAST => {
                if let Ok(msg) = parse_logged::<RemoveBroadcast>(&packet) {
                    let mut playlist = self.model.lock().unwrap();
                    playlist.remove_ready(msg.media_id);
                    playlist.pending_deletes.remove(&msg.media_id);
                    if playlist.currently_playing == msg.media_id {
                        playlist.currently_playing = NO_MEDIA;
                    }
                }
            }
            tags::PLAYLIST_MOVE_BROADCAST => {
                if let Ok(msg) = parse_logged::<MoveBroadcast>(&packet) {
                    let mut playlist = self.model.lock().unwrap();
                    playlist.move_ready(msg.media_id, msg.to_index);
                    playlist.pending_moves.remove(&msg.media_id);
                }
            }
            tags::PLAYLIST_MOVE_DENY => {
                if let Ok(msg) = parse_logged::<MoveDeny>(&packet) {
                    tracing::warn!(media_id = msg.media_id, reason = %msg.reason, "move denied");
                    self.model.lock().unwrap().pending_moves.remove(&msg.media_id);
                }
            }
            tags::PLAYLIST_FULL => {
                if let Ok(msg) = parse_logged::<PlaylistSnapshot>(&packet) {
                    let mut playlist = self.model.lock().unwrap();
                    for snap in &msg.items {
                        if playlist.ready_item(snap.media_id).is_none() {
                            playlist.apply_add(snap);
                        }
                    }
                }
            }
            tags::PLAY_ORDER => {
                if let Ok(msg) = parse_logged::<PlayOrder>(&packet) {
                    self.on_play_order(msg.media_id);
                }
            }
            tags::PLAY_START => {
                if let Ok(msg) = parse_logged::<PlayStart>(&packet) {
                    self.on_play_start(msg);
                }
            }
            tags::PLAY_DENY => {
                if let Ok(msg) = parse_logged::<PlayDeny>(&packet) {
                    tracing::warn!(media_id = msg.media_id, reason = %msg.reason, "play denied");
                    self.model.lock().unwrap().pending_play = None;
                }
            }
            tags::PLAY_CONFIRM => {
                if let Ok(msg) = parse_logged::<PlayConfirm>(&packet) {
                    if let Some(round) = self.hosting.as_mut() {
                        round.tracker.on_response(source, msg.accept);
                    }
                }
            }
            tags::STOP_BROADCAST => {
                if let Ok(msg) = parse_logged::<StopBroadcast>(&packet) {
                    let mut playlist = self.model.lock().unwrap();
                    if playlist.currently_playing == msg.media_id {
                        playlist.currently_playing = NO_MEDIA;
                    }
                    playlist.pending_stop = None;
                    drop(playlist);
                    self.hosting = None;
                    self.accepted_receivers.clear();
                }
            }
            tags::SEEK_BROADCAST => {
                // As host, mark the discontinuity for the receivers before
                // delivery resumes at the new position.
                if self.hosting.as_ref().is_some_and(|h| h.announced) {
                    self.sink.send(
                        Packet::empty(tags::SEEK_DISCONTINUITY),
                        &self.accepted_receivers,
                        0,
                    );
                }
            }
            tags::USER_LEAVE => {
                if let Ok(msg) = parse_logged::<UserLeave>(&packet) {
                    self.model.lock().unwrap().mark_host_missing(msg.user_id);
                    if let Some(round) = self.hosting.as_mut() {
                        round.tracker.on_response(msg.user_id, false);
                    }
                }
            }
            other => tracing::trace!(tag = other, "unhandled packet in client strategy"),
        }
    }

    /// The authority elected this peer as host. Accept when the item is ours
    /// and ready; the participation round starts immediately.
    fn on_play_order(&mut self, media_id: i64) {
        let local_id = self.sink.local_id();
        let can_host = {
            let playlist = self.model.lock().unwrap();
            playlist
                .ready_item(media_id)
                .is_some_and(|i| i.host_user_id == local_id)
        };
        self.sink.send(
            payload::to_packet(tags::PLAY_RESPONSE, &PlayResponse {
                media_id,
                accept: can_host,
            }),
            &[AUTHORITY_ID],
            0,
        );
        if !can_host {
            tracing::warn!(media_id, "declining play order for item we do not host");
            return;
        }
        tracing::info!(media_id, "accepted play order, collecting participation");
        self.hosting = Some(HostingRound {
            media_id,
            tracker: ParticipationTracker::new(self.receiver_set(), self.participation_timeout),
            announced: false,
        });
    }

    fn on_play_start(&mut self, start: PlayStart) {
        {
            let mut playlist = self.model.lock().unwrap();
            playlist.currently_playing = start.media_id;
            playlist.currently_starting = NO_MEDIA;
            playlist.pending_play = None;
        }
        // Non-host receivers confirm participation to the host.
        if start.host_user_id != self.sink.local_id() {
            self.sink.send(
                payload::to_packet(tags::PLAY_CONFIRM, &PlayConfirm {
                    media_id: start.media_id,
                    accept: true,
                }),
                &[start.host_user_id],
                0,
            );
        }
    }

    /// Finalize a completed participation round: delivery targets only the
    /// accepted set, announced with stream metadata.
    fn finish_participation(&mut self) {
        let Some(round) = self.hosting.as_mut() else {
            return;
        };
        if round.announced || !round.tracker.is_complete() {
            return;
        }
        round.announced = true;
        let accepted = round.tracker.accepted().to_vec();
        tracing::info!(
            media_id = round.media_id,
            accepted = accepted.len(),
            declined = round.tracker.declined().len(),
            excluded = round.tracker.pending_count(),
            "participation round complete"
        );
        if !accepted.is_empty() {
            // Codec fields are filled in once the demuxer attaches.
            self.sink.send(
                payload::to_packet(tags::STREAM_META, &StreamMeta {
                    media_id: round.media_id,
                    video_codec: String::new(),
                    audio_codec: String::new(),
                }),
                &accepted,
                0,
            );
        }
        self.accepted_receivers = accepted;
    }

    /// Peers the current hosted session delivers to.
    pub fn accepted_receivers(&self) -> &[i64] {
        &self.accepted_receivers
    }
}

pub(crate) fn parse_logged<T: serde::de::DeserializeOwned>(packet: &Packet) -> Result<T, ()> {
    payload::parse(packet.tag(), packet).map_err(|e| {
        tracing::warn!(tag = packet.tag(), error = %e, "malformed playlist payload");
    })
}

impl PlaylistStrategy for ClientStrategy {
    fn on_add_item_request(&mut self, filename: String) -> i64 {
        let local_id = self.sink.local_id();
        self.model.lock().unwrap().add_loading(local_id, filename)
    }

    fn on_delete_item_request(&mut self, media_id: i64) {
        self.model.lock().unwrap().pending_deletes.insert(media_id);
        self.sink.send(
            payload::to_packet(tags::PLAYLIST_REMOVE_REQUEST, &RemoveRequest { media_id }),
            &[AUTHORITY_ID],
            0,
        );
    }

    fn on_play_item_request(&mut self, media_id: i64) {
        self.model.lock().unwrap().pending_play = Some(media_id);
        self.sink.send(
            payload::to_packet(tags::PLAY_REQUEST, &PlayRequest { media_id }),
            &[AUTHORITY_ID],
            0,
        );
    }

    fn on_stop_item_request(&mut self, media_id: i64) {
        self.model.lock().unwrap().pending_stop = Some(media_id);
        self.sink.send(
            payload::to_packet(tags::STOP_REQUEST, &StopRequest { media_id }),
            &[AUTHORITY_ID],
            0,
        );
    }

    fn on_move_item_request(&mut self, media_id: i64, to_index: usize) {
        self.model.lock().unwrap().pending_moves.insert(media_id);
        self.sink.send(
            payload::to_packet(tags::PLAYLIST_MOVE_REQUEST, &MoveRequest { media_id, to_index }),
            &[AUTHORITY_ID],
            0,
        );
    }

    fn update(&mut self) {
        // Finished probes become pending adds awaiting the authority.
        let finished = poll_loading(&self.model, &self.probe);
        self.submit_pending_adds(finished);

        for (packet, source) in self.inbox.drain() {
            self.handle(packet, source);
        }
        self.finish_participation();
    }
}

impl ClientStrategy {
    fn submit_pending_adds(&mut self, finished: Vec<i64>) {
        for item_id in finished {
            let snap = {
                let playlist = self.model.lock().unwrap();
                playlist
                    .pending
                    .iter()
                    .find(|i| i.item_id == item_id)
                    .map(|i| i.snapshot())
            };
            if let Some(item) = snap {
                self.sink.send(
                    payload::to_packet(tags::PLAYLIST_ADD_REQUEST, &AddRequest { item }),
                    &[AUTHORITY_ID],
                    0,
                );
            }
        }
    }
}

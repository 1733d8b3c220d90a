//! Server strategy — the authority.
//!
//! Single source of truth for media ids and ordering. Every accepted
//! mutation is rebroadcast to all peers including a synthetic self
//! destination, and the server's own model is mutated only when that
//! broadcast comes back through the dispatch bus. Server and clients
//! therefore apply the exact same message stream in the same order.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;

use matinee_core::packet::Packet;
use matinee_core::payload::{
    self, AddBroadcast, AddDeny, AddRequest, MoveBroadcast, MoveDeny, MoveRequest, PauseBroadcast,
    PauseRequest, PlayConfirm, PlayDeny, PlayOrder, PlayRequest, PlayResponse, PlayStart, PlaylistSnapshot,
    RemoveBroadcast, RemoveRequest, SeekBroadcast, SeekRequest, StopBroadcast, StopRequest,
    StreamMeta, UserInfo, AUTHORITY_ID, HOST_MISSING,
};
use matinee_core::tags;
use matinee_net::Context;

use crate::model::{SharedPlaylist, NO_MEDIA};
use crate::participation::ParticipationTracker;
use crate::probe::SharedProbe;
use crate::strategy::client::parse_logged;
use crate::strategy::{poll_loading, Inbox, PacketSink, PlaylistStrategy};

/// An in-flight playback start: order issued, awaiting the host's answer.
struct StartRound {
    media_id: i64,
    host_user_id: i64,
    issuer: i64,
}

/// Participation round for an item the server itself hosts.
struct HostingRound {
    media_id: i64,
    tracker: ParticipationTracker,
    announced: bool,
}

pub struct ServerStrategy {
    model: SharedPlaylist,
    probe: SharedProbe,
    sink: Arc<dyn PacketSink>,
    inbox: Inbox,
    participation_timeout: Duration,
    starting: Option<StartRound>,
    hosting: Option<HostingRound>,
    known_users: HashSet<i64>,
    accepted_receivers: Vec<i64>,
}

impl ServerStrategy {
    pub fn new(ctx: &Context, model: SharedPlaylist, probe: SharedProbe, sink: Arc<dyn PacketSink>) -> Self {
        let inbox = Inbox::subscribe(
            ctx,
            &[
                tags::PLAYLIST_ADD_REQUEST,
                tags::PLAYLIST_REMOVE_REQUEST,
                tags::PLAYLIST_MOVE_REQUEST,
                tags::PLAYLIST_FULL_REQUEST,
                tags::PLAY_REQUEST,
                tags::PLAY_RESPONSE,
                tags::PLAY_CONFIRM,
                tags::STOP_REQUEST,
                tags::SEEK_REQUEST,
                tags::PAUSE_REQUEST,
                // Own broadcasts come back through the bus for self-apply.
                tags::PLAYLIST_ADD_BROADCAST,
                tags::PLAYLIST_REMOVE_BROADCAST,
                tags::PLAYLIST_MOVE_BROADCAST,
                tags::PLAY_START,
                tags::STOP_BROADCAST,
            ],
        );
        let known_users = sink.users().into_iter().map(|u| u.id).collect();
        tracing::info!("server playlist strategy active");
        Self {
            model,
            probe,
            sink,
            inbox,
            participation_timeout: Duration::from_millis(
                ctx.config.playback.participation_timeout_ms,
            ),
            starting: None,
            hosting: None,
            known_users,
            accepted_receivers: Vec::new(),
        }
    }

    fn user(&self, id: i64) -> Option<UserInfo> {
        self.sink.users().into_iter().find(|u| u.id == id)
    }

    fn may_add(&self, id: i64) -> bool {
        id == AUTHORITY_ID || self.user(id).is_some_and(|u| u.may_add)
    }

    fn may_control(&self, id: i64) -> bool {
        id == AUTHORITY_ID || self.user(id).is_some_and(|u| u.may_control)
    }

    /// Send to every peer including the synthetic self destination, so the
    /// server's own apply rides the same path the clients observe.
    fn broadcast(&self, packet: Packet) {
        let ids: Vec<i64> = self.sink.users().into_iter().map(|u| u.id).collect();
        self.sink.send(packet, &ids, 0);
    }

    fn fresh_media_id() -> i64 {
        rand::thread_rng().gen_range(0..i64::MAX)
    }

    // ── Request arbitration ───────────────────────────────────────────────────

    fn on_add_request(&mut self, mut req: AddRequest, source: i64) {
        if !self.may_add(source) {
            self.sink.send(
                payload::to_packet(tags::PLAYLIST_ADD_DENY, &AddDeny {
                    item_id: req.item.item_id,
                    reason: "adding items is not permitted".into(),
                }),
                &[source],
                0,
            );
            return;
        }
        req.item.host_user_id = source;
        req.item.media_id = Self::fresh_media_id();
        tracing::info!(
            media_id = req.item.media_id,
            host = source,
            file = %req.item.filename,
            "playlist add accepted"
        );
        self.broadcast(payload::to_packet(
            tags::PLAYLIST_ADD_BROADCAST,
            &AddBroadcast { item: req.item },
        ));
    }

    fn on_remove_request(&mut self, req: RemoveRequest, source: i64) {
        if !self.may_add(source) {
            tracing::debug!(source, media_id = req.media_id, "remove refused, no permission");
            return;
        }
        let known = self.model.lock().unwrap().ready_item(req.media_id).is_some();
        if !known {
            tracing::debug!(media_id = req.media_id, "remove for unknown item ignored");
            return;
        }
        self.broadcast(payload::to_packet(
            tags::PLAYLIST_REMOVE_BROADCAST,
            &RemoveBroadcast { media_id: req.media_id },
        ));
    }

    fn on_move_request(&mut self, req: MoveRequest, source: i64) {
        let deny = |reason: &str| {
            self.sink.send(
                payload::to_packet(tags::PLAYLIST_MOVE_DENY, &MoveDeny {
                    media_id: req.media_id,
                    reason: reason.into(),
                }),
                &[source],
                0,
            );
        };
        if !self.may_add(source) {
            deny("moving items is not permitted");
            return;
        }
        {
            let playlist = self.model.lock().unwrap();
            if playlist.ready_item(req.media_id).is_none() {
                deny("unknown item");
                return;
            }
            if req.to_index >= playlist.ready.len() {
                deny("target index out of range");
                return;
            }
        }
        self.broadcast(payload::to_packet(
            tags::PLAYLIST_MOVE_BROADCAST,
            &MoveBroadcast {
                media_id: req.media_id,
                to_index: req.to_index,
            },
        ));
    }

    fn on_play_request(&mut self, req: PlayRequest, source: i64) {
        let deny = |sink: &Arc<dyn PacketSink>, reason: &str| {
            sink.send(
                payload::to_packet(tags::PLAY_DENY, &PlayDeny {
                    media_id: req.media_id,
                    reason: reason.into(),
                }),
                &[source],
                0,
            );
        };
        if !self.may_control(source) {
            deny(&self.sink, "playback control is not permitted");
            return;
        }
        if self.starting.is_some() {
            // One start at a time; no duplicate order goes out.
            deny(&self.sink, "a playback start is already in progress");
            return;
        }
        let host = {
            let playlist = self.model.lock().unwrap();
            match playlist.ready_item(req.media_id) {
                Some(item) => item.host_user_id,
                None => {
                    drop(playlist);
                    deny(&self.sink, "unknown item");
                    return;
                }
            }
        };
        if host == HOST_MISSING {
            deny(&self.sink, "the item's host is no longer connected");
            return;
        }

        self.model.lock().unwrap().currently_starting = req.media_id;
        self.starting = Some(StartRound {
            media_id: req.media_id,
            host_user_id: host,
            issuer: source,
        });

        if host == AUTHORITY_ID {
            // We host it ourselves: no order round trip, start immediately.
            self.accept_start(req.media_id, AUTHORITY_ID);
        } else {
            tracing::info!(media_id = req.media_id, host, issuer = source, "ordering host to prepare");
            self.sink.send(
                payload::to_packet(tags::PLAY_ORDER, &PlayOrder { media_id: req.media_id }),
                &[host],
                0,
            );
        }
    }

    fn on_play_response(&mut self, resp: PlayResponse, source: i64) {
        let Some(round) = self.starting.as_ref() else {
            tracing::debug!(source, "play response without a start in progress");
            return;
        };
        if round.media_id != resp.media_id || round.host_user_id != source {
            tracing::warn!(source, media_id = resp.media_id, "play response from unexpected peer");
            return;
        }
        if resp.accept {
            self.accept_start(resp.media_id, source);
        } else {
            let issuer = round.issuer;
            tracing::info!(media_id = resp.media_id, host = source, "host declined start");
            self.starting = None;
            self.model.lock().unwrap().currently_starting = NO_MEDIA;
            self.sink.send(
                payload::to_packet(tags::PLAY_DENY, &PlayDeny {
                    media_id: resp.media_id,
                    reason: "the host declined".into(),
                }),
                &[issuer],
                0,
            );
        }
    }

    /// Host accepted (or is the server itself): broadcast the start notice.
    /// State transitions happen when the notice comes back for self-apply.
    fn accept_start(&mut self, media_id: i64, host_user_id: i64) {
        tracing::info!(media_id, host = host_user_id, "playback starting");
        if host_user_id == AUTHORITY_ID {
            let receivers: Vec<i64> = self
                .sink
                .users()
                .into_iter()
                .map(|u| u.id)
                .filter(|id| *id != AUTHORITY_ID)
                .collect();
            self.hosting = Some(HostingRound {
                media_id,
                tracker: ParticipationTracker::new(receivers, self.participation_timeout),
                announced: false,
            });
        }
        self.broadcast(payload::to_packet(
            tags::PLAY_START,
            &PlayStart { media_id, host_user_id },
        ));
    }

    fn on_stop_request(&mut self, req: StopRequest, source: i64) {
        if !self.may_control(source) {
            tracing::debug!(source, "stop refused, no permission");
            return;
        }
        let playing = self.model.lock().unwrap().currently_playing;
        if playing != req.media_id {
            tracing::debug!(media_id = req.media_id, playing, "stop for non-playing item ignored");
            return;
        }
        self.broadcast(payload::to_packet(
            tags::STOP_BROADCAST,
            &StopBroadcast { media_id: req.media_id },
        ));
    }

    fn on_seek_request(&mut self, req: SeekRequest, source: i64) {
        if !self.may_control(source) {
            tracing::debug!(source, "seek refused, no permission");
            return;
        }
        self.broadcast(payload::to_packet(
            tags::SEEK_BROADCAST,
            &SeekBroadcast { position_secs: req.position_secs },
        ));
        // When we host the playing item, mark the stream discontinuity for
        // the receivers before delivery resumes at the new position.
        if self.hosting.as_ref().is_some_and(|h| h.announced) {
            self.sink.send(
                Packet::empty(tags::SEEK_DISCONTINUITY),
                &self.accepted_receivers,
                0,
            );
        }
    }

    fn on_pause_request(&mut self, req: PauseRequest, source: i64) {
        if !self.may_control(source) {
            tracing::debug!(source, "pause refused, no permission");
            return;
        }
        self.broadcast(payload::to_packet(
            tags::PAUSE_BROADCAST,
            &PauseBroadcast { paused: req.paused },
        ));
    }

    fn on_full_request(&self, source: i64) {
        let items = self.model.lock().unwrap().ready_snapshots();
        self.sink.send(
            payload::to_packet(tags::PLAYLIST_FULL, &PlaylistSnapshot { items }),
            &[source],
            0,
        );
    }

    // ── Self-apply of own broadcasts ──────────────────────────────────────────

    fn apply_broadcast(&mut self, packet: Packet) {
        match packet.tag() {
            tags::PLAYLIST_ADD_BROADCAST => {
                if let Ok(msg) = parse_logged::<AddBroadcast>(&packet) {
                    self.model.lock().unwrap().apply_add(&msg.item);
                }
            }
            tags::PLAYLIST_REMOVE_BROADCAST => {
                if let Ok(msg) = parse_logged::<RemoveBroadcast>(&packet) {
                    let mut playlist = self.model.lock().unwrap();
                    playlist.remove_ready(msg.media_id);
                    if playlist.currently_playing == msg.media_id {
                        playlist.currently_playing = NO_MEDIA;
                    }
                }
            }
            tags::PLAYLIST_MOVE_BROADCAST => {
                if let Ok(msg) = parse_logged::<MoveBroadcast>(&packet) {
                    self.model.lock().unwrap().move_ready(msg.media_id, msg.to_index);
                }
            }
            tags::PLAY_START => {
                if let Ok(msg) = parse_logged::<PlayStart>(&packet) {
                    {
                        let mut playlist = self.model.lock().unwrap();
                        playlist.currently_playing = msg.media_id;
                        playlist.currently_starting = NO_MEDIA;
                    }
                    self.starting = None;
                    // The server UI participates as a receiver too.
                    if msg.host_user_id != AUTHORITY_ID {
                        self.sink.send(
                            payload::to_packet(tags::PLAY_CONFIRM, &PlayConfirm {
                                media_id: msg.media_id,
                                accept: true,
                            }),
                            &[msg.host_user_id],
                            0,
                        );
                    }
                }
            }
            tags::STOP_BROADCAST => {
                if let Ok(msg) = parse_logged::<StopBroadcast>(&packet) {
                    let mut playlist = self.model.lock().unwrap();
                    if playlist.currently_playing == msg.media_id {
                        playlist.currently_playing = NO_MEDIA;
                    }
                    drop(playlist);
                    self.hosting = None;
                    self.accepted_receivers.clear();
                }
            }
            _ => {}
        }
    }

    fn handle(&mut self, packet: Packet, source: i64) {
        match packet.tag() {
            tags::PLAYLIST_ADD_REQUEST => {
                if let Ok(msg) = parse_logged::<AddRequest>(&packet) {
                    self.on_add_request(msg, source);
                }
            }
            tags::PLAYLIST_REMOVE_REQUEST => {
                if let Ok(msg) = parse_logged::<RemoveRequest>(&packet) {
                    self.on_remove_request(msg, source);
                }
            }
            tags::PLAYLIST_MOVE_REQUEST => {
                if let Ok(msg) = parse_logged::<MoveRequest>(&packet) {
                    self.on_move_request(msg, source);
                }
            }
            tags::PLAYLIST_FULL_REQUEST => self.on_full_request(source),
            tags::PLAY_REQUEST => {
                if let Ok(msg) = parse_logged::<PlayRequest>(&packet) {
                    self.on_play_request(msg, source);
                }
            }
            tags::PLAY_RESPONSE => {
                if let Ok(msg) = parse_logged::<PlayResponse>(&packet) {
                    self.on_play_response(msg, source);
                }
            }
            tags::PLAY_CONFIRM => {
                if let Ok(msg) = parse_logged::<PlayConfirm>(&packet) {
                    if let Some(round) = self.hosting.as_mut() {
                        round.tracker.on_response(source, msg.accept);
                    }
                }
            }
            tags::STOP_REQUEST => {
                if let Ok(msg) = parse_logged::<StopRequest>(&packet) {
                    self.on_stop_request(msg, source);
                }
            }
            tags::SEEK_REQUEST => {
                if let Ok(msg) = parse_logged::<SeekRequest>(&packet) {
                    self.on_seek_request(msg, source);
                }
            }
            tags::PAUSE_REQUEST => {
                if let Ok(msg) = parse_logged::<PauseRequest>(&packet) {
                    self.on_pause_request(msg, source);
                }
            }
            _ => self.apply_broadcast(packet),
        }
    }

    /// Compare the live directory against the last seen set and react to
    /// departures: host-missing marking and start-round cancellation.
    fn reconcile_users(&mut self) {
        let current: HashSet<i64> = self.sink.users().into_iter().map(|u| u.id).collect();
        let departed: Vec<i64> = self.known_users.difference(&current).copied().collect();
        for user_id in departed {
            tracing::info!(user_id, "user departed, marking hosted items");
            self.model.lock().unwrap().mark_host_missing(user_id);
            if let Some(round) = self.hosting.as_mut() {
                round.tracker.on_response(user_id, false);
            }
            if self.starting.as_ref().is_some_and(|r| r.host_user_id == user_id) {
                let round = self.starting.take().unwrap();
                self.model.lock().unwrap().currently_starting = NO_MEDIA;
                self.sink.send(
                    payload::to_packet(tags::PLAY_DENY, &PlayDeny {
                        media_id: round.media_id,
                        reason: "the host disconnected".into(),
                    }),
                    &[round.issuer],
                    0,
                );
            }
        }
        self.known_users = current;
    }

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
            excluded = round.tracker.pending_count(),
            "participation round complete"
        );
        if !accepted.is_empty() {
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

    pub fn accepted_receivers(&self) -> &[i64] {
        &self.accepted_receivers
    }
}

impl PlaylistStrategy for ServerStrategy {
    fn on_add_item_request(&mut self, filename: String) -> i64 {
        self.model
            .lock()
            .unwrap()
            .add_loading(AUTHORITY_ID, filename)
    }

    fn on_delete_item_request(&mut self, media_id: i64) {
        self.on_remove_request(RemoveRequest { media_id }, AUTHORITY_ID);
    }

    fn on_play_item_request(&mut self, media_id: i64) {
        self.on_play_request(PlayRequest { media_id }, AUTHORITY_ID);
    }

    fn on_stop_item_request(&mut self, media_id: i64) {
        self.on_stop_request(StopRequest { media_id }, AUTHORITY_ID);
    }

    fn on_move_item_request(&mut self, media_id: i64, to_index: usize) {
        self.on_move_request(MoveRequest { media_id, to_index }, AUTHORITY_ID);
    }

    fn update(&mut self) {
        // Server-local items skip the request hop once probed: they become
        // add requests from the authority itself.
        for item_id in poll_loading(&self.model, &self.probe) {
            let snap = {
                let playlist = self.model.lock().unwrap();
                playlist
                    .pending
                    .iter()
                    .find(|i| i.item_id == item_id)
                    .map(|i| i.snapshot())
            };
            if let Some(item) = snap {
                self.on_add_request(AddRequest { item }, AUTHORITY_ID);
            }
        }

        self.reconcile_users();
        for (packet, source) in self.inbox.drain() {
            self.handle(packet, source);
        }
        self.finish_participation();
    }
}

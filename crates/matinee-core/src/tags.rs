//! Wire type tags.
//!
//! Tags ARE the protocol. Every constant here is part of the wire format and
//! must never be renumbered once peers in the wild speak it.
//!
//! # Ranges
//!
//! - 1-9:   connection lifecycle (handshake, liveness, teardown)
//! - 10-19: user directory maintenance
//! - 20-29: session-level fragmentation control
//! - 30-39: frame-level control (never leaves the channel layer)
//! - 40-49: playback control
//! - 50-59: playlist control
//! - 60-69: playback-start protocol
//! - 80-89: media elementary streams

// ── Connection lifecycle ─────────────────────────────────────────────────────

/// First packet after connect: username + optional password, JSON.
pub const HELLO: i32 = 1;
/// Raw username payload, point-to-point during connect. Never addressed.
pub const USERNAME: i32 = 2;
/// Byte confirmation for credit flow control. Payload: u64 LE byte count.
pub const BYTE_CONFIRM: i32 = 3;
/// Server liveness beacon. Empty payload.
pub const KEEP_ALIVE: i32 = 4;
/// Client round-trip probe. Payload: u64 LE sender timestamp (micros).
pub const LATENCY_PROBE: i32 = 5;
/// Orderly teardown request. Empty payload.
pub const DISCONNECT: i32 = 6;
/// Destination prefix control frame. Payload: list of i64 LE peer ids.
pub const USER_ID: i32 = 7;
/// Handshake accepted: assigned id + current user directory, JSON.
pub const WELCOME: i32 = 8;
/// Handshake refused (bad password, server full). JSON reason.
pub const HELLO_DENY: i32 = 9;

// ── User directory ───────────────────────────────────────────────────────────

pub const USER_JOIN: i32 = 10;
pub const USER_LEAVE: i32 = 11;
pub const USER_RENAME: i32 = 12;

// ── Session-level fragmentation ──────────────────────────────────────────────

/// Announces an application-level split: JSON `SplitHead`.
pub const SPLIT_HEAD: i32 = 20;
/// One part of a split: u64 LE split id followed by raw bytes.
pub const SPLIT_PART: i32 = 21;
/// Abandons a split in flight: u64 LE split id.
pub const SPLIT_ABORT: i32 = 22;

// ── Frame-level control (channel internal) ───────────────────────────────────

/// The next N frames are parts of one oversized packet.
pub const FRAME_SPLIT: i32 = 30;
/// The next N packets must be deposited into the ingress queue together.
pub const MULTI_PACKET: i32 = 31;

// ── Playback control ─────────────────────────────────────────────────────────

pub const PAUSE_REQUEST: i32 = 40;
pub const PAUSE_BROADCAST: i32 = 41;
pub const SEEK_REQUEST: i32 = 42;
pub const SEEK_BROADCAST: i32 = 43;
/// Marks a discontinuity in the media stream after a seek.
pub const SEEK_DISCONTINUITY: i32 = 44;
/// Stream metadata announcement preceding media delivery.
pub const STREAM_META: i32 = 45;

// ── Playlist control ─────────────────────────────────────────────────────────

pub const PLAYLIST_ADD_REQUEST: i32 = 50;
pub const PLAYLIST_ADD_BROADCAST: i32 = 51;
pub const PLAYLIST_ADD_DENY: i32 = 52;
pub const PLAYLIST_REMOVE_REQUEST: i32 = 53;
pub const PLAYLIST_REMOVE_BROADCAST: i32 = 54;
pub const PLAYLIST_MOVE_REQUEST: i32 = 55;
pub const PLAYLIST_MOVE_BROADCAST: i32 = 56;
pub const PLAYLIST_MOVE_DENY: i32 = 57;
/// Late joiner asks the authority for the full ready list.
pub const PLAYLIST_FULL_REQUEST: i32 = 58;
pub const PLAYLIST_FULL: i32 = 59;

// ── Playback-start protocol ──────────────────────────────────────────────────

pub const PLAY_REQUEST: i32 = 60;
/// Authority orders the item's host to prepare playback.
pub const PLAY_ORDER: i32 = 61;
/// Host accepts or declines the order.
pub const PLAY_RESPONSE: i32 = 62;
/// Authority refuses a play request.
pub const PLAY_DENY: i32 = 63;
/// Broadcast: playback is starting (media id + host id).
pub const PLAY_START: i32 = 64;
/// Receiver accepts or declines participation in the session.
pub const PLAY_CONFIRM: i32 = 65;
pub const STOP_REQUEST: i32 = 66;
pub const STOP_BROADCAST: i32 = 67;

// ── Media elementary streams ─────────────────────────────────────────────────

pub const VIDEO_PACKET: i32 = 80;
pub const AUDIO_PACKET: i32 = 81;
pub const SUBTITLE_PACKET: i32 = 82;

// ── Classification ───────────────────────────────────────────────────────────

/// Heavy tags are subject to per-destination credit flow control: split
/// parts plus every media elementary-packet type.
pub fn is_heavy(tag: i32) -> bool {
    matches!(tag, SPLIT_PART | VIDEO_PACKET | AUDIO_PACKET | SUBTITLE_PACKET)
}

/// Tags that travel without a `USER_ID` destination prefix. These are either
/// strictly point-to-point during connection setup or pure liveness traffic.
pub fn is_unaddressed(tag: i32) -> bool {
    matches!(
        tag,
        HELLO | USERNAME | WELCOME | HELLO_DENY | KEEP_ALIVE | LATENCY_PROBE | DISCONNECT
    )
}

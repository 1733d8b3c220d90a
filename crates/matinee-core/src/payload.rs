//! Structured protocol payloads.
//!
//! Control traffic (handshake, user directory, playlist, playback-start) is
//! JSON-encoded; media payloads and the binary control payloads in `wire`
//! stay raw. Each schema maps to exactly one tag in `tags`.

use serde::{Deserialize, Serialize};

use crate::packet::Packet;

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("unexpected packet tag {got}, expected {expected}")]
    UnexpectedTag { expected: i32, got: i32 },

    #[error("malformed payload for tag {tag}: {source}")]
    Malformed {
        tag: i32,
        #[source]
        source: serde_json::Error,
    },

    #[error("handshake violation: {0}")]
    Handshake(String),
}

/// Serialize a schema into a packet with the given tag.
pub fn to_packet<T: Serialize>(tag: i32, value: &T) -> Packet {
    // Schemas are plain data; serialization cannot fail for them.
    let bytes = serde_json::to_vec(value).expect("payload serialization");
    Packet::new(tag, bytes)
}

/// Parse a packet's payload into a schema, verifying the tag first.
pub fn parse<T: for<'de> Deserialize<'de>>(expected: i32, packet: &Packet) -> Result<T, ProtocolError> {
    if packet.tag() != expected {
        return Err(ProtocolError::UnexpectedTag {
            expected,
            got: packet.tag(),
        });
    }
    serde_json::from_slice(packet.payload()).map_err(|source| ProtocolError::Malformed {
        tag: expected,
        source,
    })
}

// ── Users ─────────────────────────────────────────────────────────────────────

/// Id reserved for the authority itself.
pub const AUTHORITY_ID: i64 = 0;

/// Host id recorded on ready items whose host disconnected.
pub const HOST_MISSING: i64 = -1;

/// A participant as tracked in the user directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
    pub id: i64,
    pub name: String,
    /// May submit playlist additions.
    pub may_add: bool,
    /// May start/stop/seek playback.
    pub may_control: bool,
}

// ── Connection lifecycle ──────────────────────────────────────────────────────

/// `HELLO` — first packet a client sends after connect.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hello {
    pub username: String,
    pub password: Option<String>,
}

/// `WELCOME` — handshake accepted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Welcome {
    /// The id assigned to the joining peer.
    pub user_id: i64,
    /// Directory of everyone already present, authority included.
    pub users: Vec<UserInfo>,
}

/// `HELLO_DENY` — handshake refused. Recoverable by the issuer (re-prompt),
/// the connection is torn down afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloDeny {
    pub reason: String,
}

// ── User directory maintenance ────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserJoin {
    pub user: UserInfo,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserLeave {
    pub user_id: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRename {
    pub user_id: i64,
    pub name: String,
}

// ── Session-level fragmentation ───────────────────────────────────────────────

/// `SPLIT_HEAD` — announces an application-level split.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitHead {
    pub split_id: u64,
    pub original_tag: i32,
    pub part_count: u32,
    pub total_size: u64,
}

// ── Playlist ──────────────────────────────────────────────────────────────────

/// One playlist item as it travels on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemSnapshot {
    /// Locally generated, stable for the item's lifetime.
    pub item_id: i64,
    /// Authority-assigned. -1 until confirmed, -2 if the add was denied.
    pub media_id: i64,
    pub host_user_id: i64,
    pub duration_secs: f64,
    pub filename: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddRequest {
    pub item: ItemSnapshot,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddBroadcast {
    pub item: ItemSnapshot,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddDeny {
    pub item_id: i64,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoveRequest {
    pub media_id: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoveBroadcast {
    pub media_id: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MoveRequest {
    pub media_id: i64,
    /// Target index within the ready list.
    pub to_index: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MoveBroadcast {
    pub media_id: i64,
    pub to_index: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MoveDeny {
    pub media_id: i64,
    pub reason: String,
}

/// `PLAYLIST_FULL` — the authority's ordered ready list, sent on request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaylistSnapshot {
    pub items: Vec<ItemSnapshot>,
}

// ── Playback-start protocol ───────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayRequest {
    pub media_id: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayOrder {
    pub media_id: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayResponse {
    pub media_id: i64,
    pub accept: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayDeny {
    pub media_id: i64,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayStart {
    pub media_id: i64,
    pub host_user_id: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayConfirm {
    pub media_id: i64,
    pub accept: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopRequest {
    pub media_id: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopBroadcast {
    pub media_id: i64,
}

// ── Playback control ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PauseRequest {
    pub paused: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PauseBroadcast {
    pub paused: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeekRequest {
    pub position_secs: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeekBroadcast {
    pub position_secs: f64,
}

/// `STREAM_META` — announced by the host before media delivery begins.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamMeta {
    pub media_id: i64,
    pub video_codec: String,
    pub audio_codec: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tags;

    #[test]
    fn hello_round_trip() {
        let hello = Hello {
            username: "ada".into(),
            password: Some("hunter2".into()),
        };
        let packet = to_packet(tags::HELLO, &hello);
        let back: Hello = parse(tags::HELLO, &packet).unwrap();
        assert_eq!(back.username, "ada");
        assert_eq!(back.password.as_deref(), Some("hunter2"));
    }

    #[test]
    fn parse_rejects_wrong_tag() {
        let packet = to_packet(tags::HELLO, &Hello {
            username: "ada".into(),
            password: None,
        });
        let err = parse::<Welcome>(tags::WELCOME, &packet).unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::UnexpectedTag { expected, got }
                if expected == tags::WELCOME && got == tags::HELLO
        ));
    }

    #[test]
    fn parse_rejects_garbage_payload() {
        let packet = Packet::new(tags::SPLIT_HEAD, &b"not json"[..]);
        assert!(matches!(
            parse::<SplitHead>(tags::SPLIT_HEAD, &packet),
            Err(ProtocolError::Malformed { .. })
        ));
    }

    #[test]
    fn item_snapshot_round_trip() {
        let item = ItemSnapshot {
            item_id: 41,
            media_id: -1,
            host_user_id: 3,
            duration_secs: 5400.0,
            filename: "feature.mkv".into(),
        };
        let packet = to_packet(tags::PLAYLIST_ADD_REQUEST, &AddRequest { item: item.clone() });
        let back: AddRequest = parse(tags::PLAYLIST_ADD_REQUEST, &packet).unwrap();
        assert_eq!(back.item, item);
    }
}

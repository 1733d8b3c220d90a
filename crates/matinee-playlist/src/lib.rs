//! matinee-playlist — distributed playlist and playback orchestration.
//!
//! A shared playlist model, three interchangeable strategies over it
//! (Offline, Client, Server), the participation tracker for playback
//! start, and the media probe seam the orchestrator polls each tick.

pub mod model;
pub mod orchestrator;
pub mod participation;
pub mod probe;
pub mod strategy;

pub use model::{ItemState, Playlist, PlaylistItem, SharedPlaylist, NO_MEDIA};
pub use orchestrator::{Mode, Orchestrator};
pub use participation::ParticipationTracker;
pub use probe::{MediaProbe, ProbeStatus, SharedProbe};
pub use strategy::{PacketSink, PlaylistStrategy};

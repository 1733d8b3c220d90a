//! matinee-core — packet model, wire format, protocol payloads, config, events.
//!
//! Everything in this crate is shared by the transport engine (matinee-net),
//! the playlist orchestrator (matinee-playlist), and the daemon. It has no
//! socket code: it defines what travels on the wire, not how.

pub mod config;
pub mod event;
pub mod packet;
pub mod payload;
pub mod tags;
pub mod wire;

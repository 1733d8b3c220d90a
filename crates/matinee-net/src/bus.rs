//! Packet dispatch bus — process-wide typed publish/subscribe.
//!
//! Subscribers register per type tag. Publish scans the entry list linearly,
//! fans out to every subscriber of the matching tag, and bumps the entry's
//! hit counter; when a counter exceeds its predecessor's, the two entries
//! swap, so hot tags migrate toward the front of the scan.
//!
//! The table is guarded by a single mutex held across the whole fan-out.
//! Handlers must not call subscribe/unsubscribe synchronously from inside a
//! publish, or they will deadlock on that mutex.

use std::sync::{Arc, Mutex};

use matinee_core::packet::Packet;

/// Handler invoked with the packet and the id of the peer it came from.
pub type Handler = Arc<dyn Fn(Packet, i64) + Send + Sync>;

/// Token returned by `subscribe`, consumed by `unsubscribe`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubId {
    tag: i32,
    id: u64,
}

struct Entry {
    tag: i32,
    handlers: Vec<(u64, Handler)>,
    hits: u64,
}

struct BusState {
    entries: Vec<Entry>,
    next_id: u64,
}

pub struct PacketBus {
    state: Mutex<BusState>,
}

impl PacketBus {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(BusState {
                entries: Vec::new(),
                next_id: 1,
            }),
        }
    }

    pub fn subscribe(&self, tag: i32, handler: Handler) -> SubId {
        let mut state = self.state.lock().unwrap();
        let id = state.next_id;
        state.next_id += 1;
        if let Some(entry) = state.entries.iter_mut().find(|e| e.tag == tag) {
            entry.handlers.push((id, handler));
        } else {
            state.entries.push(Entry {
                tag,
                handlers: vec![(id, handler)],
                hits: 0,
            });
        }
        SubId { tag, id }
    }

    pub fn unsubscribe(&self, sub: SubId) {
        let mut state = self.state.lock().unwrap();
        if let Some(idx) = state.entries.iter().position(|e| e.tag == sub.tag) {
            state.entries[idx].handlers.retain(|(id, _)| *id != sub.id);
            if state.entries[idx].handlers.is_empty() {
                state.entries.remove(idx);
            }
        }
    }

    /// Fan a packet out to every subscriber of its tag. Returns how many
    /// handlers ran. All but the last handler receive a shared alias; the
    /// last receives the owning packet, saving one refcount bump.
    pub fn publish(&self, packet: Packet, source: i64) -> usize {
        let mut state = self.state.lock().unwrap();
        let Some(idx) = state.entries.iter().position(|e| e.tag == packet.tag()) else {
            tracing::trace!(tag = packet.tag(), "no subscriber for packet");
            return 0;
        };

        let delivered = {
            let entry = &state.entries[idx];
            let count = entry.handlers.len();
            for (_, handler) in &entry.handlers[..count - 1] {
                handler(packet.share(), source);
            }
            let (_, last) = &entry.handlers[count - 1];
            last(packet, source);
            count
        };

        state.entries[idx].hits += 1;
        if idx > 0 && state.entries[idx].hits > state.entries[idx - 1].hits {
            state.entries.swap(idx - 1, idx);
        }
        delivered
    }
}

impl Default for PacketBus {
    fn default() -> Self {
        Self::new()
    }
}

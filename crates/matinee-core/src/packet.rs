//! Packet — the atomic unit of matinee communication.
//!
//! A packet is a type tag plus a payload. Payload bytes live in a `Bytes`
//! buffer, so the same allocation can be handed to several destinations
//! without copying: `share()` bumps the refcount, `deep_clone()` makes an
//! exclusively-owned copy. Once a packet has been shared its bytes must be
//! treated as immutable — every alias sees the same allocation.

use bytes::Bytes;

/// A type-tagged byte buffer, immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    tag: i32,
    payload: Bytes,
}

impl Packet {
    /// Build a packet from a tag and payload bytes.
    pub fn new(tag: i32, payload: impl Into<Bytes>) -> Self {
        Self {
            tag,
            payload: payload.into(),
        }
    }

    /// A packet with an empty payload. Used for keep-alives and markers.
    pub fn empty(tag: i32) -> Self {
        Self {
            tag,
            payload: Bytes::new(),
        }
    }

    pub fn tag(&self) -> i32 {
        self.tag
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Payload length in bytes.
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// A new handle over the same payload allocation. Cheap: refcount bump,
    /// no copy. The caller chooses aliasing explicitly by calling this.
    pub fn share(&self) -> Packet {
        Packet {
            tag: self.tag,
            payload: self.payload.clone(),
        }
    }

    /// An exclusively-owned copy of the payload. The returned packet does
    /// not alias this one.
    pub fn deep_clone(&self) -> Packet {
        Packet {
            tag: self.tag,
            payload: Bytes::copy_from_slice(&self.payload),
        }
    }

    /// Consume the packet, keeping only the payload.
    pub fn into_payload(self) -> Bytes {
        self.payload
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn share_aliases_same_allocation() {
        let p = Packet::new(7, vec![1u8, 2, 3]);
        let alias = p.share();
        assert_eq!(alias.tag(), 7);
        // Bytes clones share the underlying buffer.
        assert_eq!(p.payload().as_ptr(), alias.payload().as_ptr());
    }

    #[test]
    fn deep_clone_copies() {
        let p = Packet::new(7, vec![1u8, 2, 3]);
        let copy = p.deep_clone();
        assert_eq!(copy.payload()[..], p.payload()[..]);
        assert_ne!(p.payload().as_ptr(), copy.payload().as_ptr());
    }

    #[test]
    fn empty_packet_has_no_payload() {
        let p = Packet::empty(42);
        assert!(p.is_empty());
        assert_eq!(p.len(), 0);
    }
}

//! matinee-net — the transport and session protocol stack.
//!
//! Leaf to root: framed channels over stream sockets, the connection
//! registry with reference-counted handles, listener/dialer loops, the
//! client/server session managers (fragmentation, priority, credit flow
//! control, keep-alive, user directory), and the typed packet dispatch bus.

pub mod bus;
pub mod channel;
pub mod listener;
pub mod registry;
pub mod session;

use std::sync::Arc;

use matinee_core::config::MatineeConfig;
use matinee_core::event::EventHub;

/// Everything a component needs from the process: configuration, the event
/// hub, and the dispatch bus. Constructed once at startup and passed by
/// handle — there are no process-wide singletons.
#[derive(Clone)]
pub struct Context {
    pub config: Arc<MatineeConfig>,
    pub events: EventHub,
    pub bus: Arc<bus::PacketBus>,
}

impl Context {
    pub fn new(config: MatineeConfig) -> Self {
        Self {
            config: Arc::new(config),
            events: EventHub::new(),
            bus: Arc::new(bus::PacketBus::new()),
        }
    }
}

//! Media probe seam.
//!
//! Probing (demux, duration discovery) is an external collaborator. The
//! orchestrator polls it once per tick for every loading item and advances
//! the item's lifecycle on a verdict.

use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, PartialEq)]
pub enum ProbeStatus {
    InProgress,
    Finished { duration_secs: f64 },
    Failed { reason: String },
}

pub trait MediaProbe: Send {
    /// Poll the probe for one loading item. Called once per orchestrator tick
    /// until a terminal status is returned.
    fn poll(&mut self, item_id: i64, filename: &str) -> ProbeStatus;
}

/// Probe handle shared across strategy switches.
pub type SharedProbe = Arc<Mutex<dyn MediaProbe>>;

/// Probe that reports every item finished immediately with a fixed duration.
/// Used by tests and headless setups without a demuxer attached.
pub struct InstantProbe {
    pub duration_secs: f64,
}

impl MediaProbe for InstantProbe {
    fn poll(&mut self, _item_id: i64, _filename: &str) -> ProbeStatus {
        ProbeStatus::Finished {
            duration_secs: self.duration_secs,
        }
    }
}

/// Wrap a probe for sharing.
pub fn shared(probe: impl MediaProbe + 'static) -> SharedProbe {
    Arc::new(Mutex::new(probe))
}

//! Connection registry — issues connection ids and owns live channels.
//!
//! Handles are reference-counted: many holders (queues, application code)
//! may keep one concurrently. A background sweep reclaims an entry only when
//! no outside handle exists AND the channel is disconnected AND its ingress
//! queue is drained — a disconnected channel with unread data is kept until
//! somebody drains it. Ids are monotonic and never recycled.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;

use crate::channel::FramedChannel;

struct HandleCore {
    id: u64,
    channel: FramedChannel,
}

/// Shared handle to one registered connection. Cloning bumps the refcount.
#[derive(Clone)]
pub struct ConnectionHandle {
    core: Arc<HandleCore>,
}

impl ConnectionHandle {
    pub fn id(&self) -> u64 {
        self.core.id
    }

    pub fn channel(&self) -> &FramedChannel {
        &self.core.channel
    }
}

/// Registry of live connections, shared across tasks.
#[derive(Clone)]
pub struct ConnectionRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    next_id: AtomicU64,
    entries: DashMap<u64, ConnectionHandle>,
    self_destruct: AtomicBool,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                next_id: AtomicU64::new(1),
                entries: DashMap::new(),
                self_destruct: AtomicBool::new(false),
            }),
        }
    }

    /// Register a channel and get back its handle. The registry keeps one
    /// reference of its own until the sweep reclaims the entry.
    pub fn register(&self, channel: FramedChannel) -> ConnectionHandle {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let handle = ConnectionHandle {
            core: Arc::new(HandleCore { id, channel }),
        };
        self.inner.entries.insert(id, handle.clone());
        tracing::debug!(connection_id = id, "connection registered");
        handle
    }

    pub fn lookup(&self, id: u64) -> Option<ConnectionHandle> {
        self.inner.entries.get(&id).map(|e| e.clone())
    }

    pub fn len(&self) -> usize {
        self.inner.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.is_empty()
    }

    /// Mark the registry collectible: its sweep task exits once no entries
    /// remain. For fire-and-forget owners like client sockets.
    pub fn allow_self_destruct(&self) {
        self.inner.self_destruct.store(true, Ordering::Release);
    }

    /// One reclaim pass. An entry goes away only when the registry holds the
    /// last handle, the channel is down, and the ingress backlog is drained.
    pub fn sweep(&self) {
        self.inner.entries.retain(|id, handle| {
            let idle = Arc::strong_count(&handle.core) == 1;
            let dead = !handle.channel().connected();
            let drained = handle.channel().ingress_empty();
            let keep = !(idle && dead && drained);
            if !keep {
                tracing::debug!(connection_id = id, "connection reclaimed");
            }
            keep
        });
    }

    /// Spawn the periodic sweep. Exits on self-destruct once empty.
    pub fn spawn_sweep(&self, interval: Duration) -> tokio::task::JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            loop {
                tick.tick().await;
                registry.sweep();
                if registry.inner.self_destruct.load(Ordering::Acquire)
                    && registry.inner.entries.is_empty()
                {
                    tracing::debug!("registry empty, sweep task exiting");
                    return;
                }
            }
        })
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

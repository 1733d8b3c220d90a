//! Listener and dialer — turn socket events into registry entries.
//!
//! The accept loop registers every inbound socket and pushes the new handle
//! onto a notification queue for the server session manager. The dialer is
//! the client-side mirror: one async connect producing one registry entry.

use std::net::SocketAddr;

use anyhow::{Context, Result};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};

use crate::channel::{ChannelOptions, FramedChannel};
use crate::registry::{ConnectionHandle, ConnectionRegistry};

/// Notification for a freshly accepted or dialed connection.
pub struct NewConnection {
    pub handle: ConnectionHandle,
    pub addr: SocketAddr,
}

/// Accept loop. Runs until the shutdown channel fires.
pub async fn accept_loop(
    listener: TcpListener,
    registry: ConnectionRegistry,
    opts: ChannelOptions,
    notify: mpsc::UnboundedSender<NewConnection>,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                tracing::info!("accept loop shutting down");
                return Ok(());
            }
            result = listener.accept() => {
                let (stream, addr) = match result {
                    Ok(r) => r,
                    Err(e) => {
                        tracing::warn!(error = %e, "accept failed");
                        continue;
                    }
                };
                if let Err(e) = stream.set_nodelay(true) {
                    tracing::debug!(error = %e, "set_nodelay failed");
                }
                let handle = registry.register(FramedChannel::spawn(stream, opts));
                tracing::info!(connection_id = handle.id(), peer = %addr, "inbound connection");
                if notify.send(NewConnection { handle, addr }).is_err() {
                    tracing::info!("connection consumer gone, accept loop exiting");
                    return Ok(());
                }
            }
        }
    }
}

/// Dial the authority and register the resulting channel.
pub async fn dial(
    addr: &str,
    registry: &ConnectionRegistry,
    opts: ChannelOptions,
) -> Result<ConnectionHandle> {
    let stream = TcpStream::connect(addr)
        .await
        .with_context(|| format!("failed to connect to {addr}"))?;
    if let Err(e) = stream.set_nodelay(true) {
        tracing::debug!(error = %e, "set_nodelay failed");
    }
    let peer = stream.peer_addr().ok();
    let handle = registry.register(FramedChannel::spawn(stream, opts));
    tracing::info!(connection_id = handle.id(), peer = ?peer, "outbound connection");
    Ok(handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use matinee_core::packet::Packet;
    use std::time::Duration;

    #[tokio::test]
    async fn accept_and_dial_exchange_packets() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let registry = ConnectionRegistry::new();
        let (notify_tx, mut notify_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = broadcast::channel(1);
        tokio::spawn(accept_loop(
            listener,
            registry.clone(),
            ChannelOptions::default(),
            notify_tx,
            shutdown_tx.subscribe(),
        ));

        let client = dial(&addr.to_string(), &registry, ChannelOptions::default())
            .await
            .unwrap();
        let inbound = notify_rx.recv().await.unwrap();

        client.channel().send(Packet::new(1, &b"hi"[..]), 0);
        for _ in 0..500 {
            if let Some(p) = inbound.handle.channel().receive() {
                assert_eq!(&p.payload()[..], b"hi");
                let _ = shutdown_tx.send(());
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("packet never crossed the loopback");
    }
}

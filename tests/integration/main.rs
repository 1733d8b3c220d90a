//! Matinee integration test harness.
//!
//! End-to-end tests over loopback TCP: a real authority session on
//! `127.0.0.1:0` and real client sessions dialing it. Each peer gets its
//! own `Context` (its own bus and event hub), exactly as separate
//! processes would.

use std::time::Duration;

use tokio::net::TcpListener;

use matinee_core::config::MatineeConfig;
use matinee_net::registry::ConnectionRegistry;
use matinee_net::session::{ClientSession, ServerSession};
use matinee_net::Context;

mod fragmentation;
mod handshake;
mod playlist;

// ── Harness ───────────────────────────────────────────────────────────────────

/// Config tightened for tests: fast polling, short timeouts.
pub fn test_config() -> MatineeConfig {
    let mut config = MatineeConfig::default();
    config.session.poll_interval_ms = 2;
    config.session.keepalive_interval_ms = 50;
    config.session.keepalive_timeout_ms = 2_000;
    config.session.latency_probe_interval_ms = 50;
    config.playback.participation_timeout_ms = 1_000;
    config
}

pub struct TestServer {
    pub ctx: Context,
    pub session: ServerSession,
    pub addr: String,
}

pub async fn start_server(config: MatineeConfig) -> TestServer {
    let ctx = Context::new(config);
    let registry = ConnectionRegistry::new();
    registry.spawn_sweep(Duration::from_millis(200));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let session = ServerSession::start(ctx.clone(), registry, listener).unwrap();
    TestServer { ctx, session, addr }
}

pub struct TestClient {
    pub ctx: Context,
    pub session: ClientSession,
}

pub async fn connect_client(config: MatineeConfig, addr: &str, name: &str) -> TestClient {
    let ctx = Context::new(config);
    let registry = ConnectionRegistry::new();
    registry.allow_self_destruct();
    registry.spawn_sweep(Duration::from_millis(200));
    let password = ctx.config.playback.password.clone();
    let session = ClientSession::connect(ctx.clone(), &registry, addr, name, password)
        .await
        .unwrap();
    TestClient { ctx, session }
}

/// Poll `check` until it returns true or the deadline passes.
pub async fn wait_until(what: &str, mut check: impl FnMut() -> bool) {
    for _ in 0..1000 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {what}");
}

//! Connection lifecycle: handshake, denial, protocol violation.

use crate::*;

use std::time::Duration;

use matinee_core::packet::Packet;
use matinee_core::tags;
use matinee_net::channel::ChannelOptions;
use matinee_net::listener::dial;

#[tokio::test(flavor = "multi_thread")]
async fn hello_welcome_builds_a_shared_directory() {
    let server = start_server(test_config()).await;

    let ada = connect_client(test_config(), &server.addr, "ada").await;
    let ben = connect_client(test_config(), &server.addr, "ben").await;

    assert_ne!(ada.session.local_id(), ben.session.local_id());
    assert!(ada.session.local_id() > 0 && ben.session.local_id() > 0);

    // The server directory holds the authority plus both peers; each client
    // mirror converges on the same view through the join broadcasts.
    wait_until("server directory to reach 3 users", || {
        server.session.users().len() == 3
    })
    .await;
    wait_until("ada's mirror to include ben", || {
        ada.session
            .users()
            .iter()
            .any(|u| u.id == ben.session.local_id() && u.name == "ben")
    })
    .await;
    // ben joined second, so his WELCOME already listed ada.
    assert!(ben
        .session
        .users()
        .iter()
        .any(|u| u.id == ada.session.local_id()));

    ada.session.disconnect();
    wait_until("ben to observe ada leaving", || {
        !ben.session
            .users()
            .iter()
            .any(|u| u.id == ada.session.local_id())
    })
    .await;
    server.session.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn wrong_password_is_denied() {
    let mut config = test_config();
    config.playback.password = Some("s3cret".into());
    let server = start_server(config).await;

    let ctx = Context::new(test_config());
    let registry = ConnectionRegistry::new();
    let result = ClientSession::connect(ctx, &registry, &server.addr, "eve", None).await;
    let err = result.err().expect("handshake must fail").to_string();
    assert!(err.contains("denied"), "unexpected error: {err}");
    server.session.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn non_hello_first_packet_tears_the_connection_down() {
    let server = start_server(test_config()).await;

    let registry = ConnectionRegistry::new();
    let opts = ChannelOptions {
        max_frame_payload: 64 * 1024,
        poll_interval: Duration::from_millis(2),
    };
    let conn = dial(&server.addr, &registry, opts).await.unwrap();
    conn.channel()
        .send(Packet::new(tags::KEEP_ALIVE, &b""[..]), 0);

    wait_until("server to drop the violating connection", || {
        !conn.channel().connected()
    })
    .await;
    server.session.shutdown();
}

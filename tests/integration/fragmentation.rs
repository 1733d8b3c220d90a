//! Fragmentation, credit flow control, and peer-to-peer routing.

use crate::*;

use std::sync::{Arc, Mutex};

use matinee_core::packet::Packet;
use matinee_core::payload::{self, StreamMeta};
use matinee_core::tags;

fn collect(ctx: &Context, tag: i32) -> Arc<Mutex<Vec<(Vec<u8>, i64)>>> {
    let seen: Arc<Mutex<Vec<(Vec<u8>, i64)>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    ctx.bus.subscribe(
        tag,
        Arc::new(move |packet: Packet, source| {
            sink.lock().unwrap().push((packet.payload().to_vec(), source));
        }),
    );
    seen
}

/// The worked 5000-byte scenario: with a 1024-byte frame ceiling the payload
/// crosses as five frame parts, arrives byte-exact, and the receiver's byte
/// confirmation releases the next heavy packet past the credit ceiling.
#[tokio::test(flavor = "multi_thread")]
async fn heavy_payload_round_trips_and_confirmation_releases_credit() {
    let mut config = test_config();
    config.session.max_frame_payload = 1024;
    // First 5000-byte send exceeds the ceiling; the second is held until
    // the receiver's BYTE_CONFIRM comes back.
    config.session.unconfirmed_ceiling = 4096;

    let server = start_server(config.clone()).await;
    let client = connect_client(config, &server.addr, "ada").await;
    let seen = collect(&client.ctx, tags::VIDEO_PACKET);

    let first: Vec<u8> = (0..5000u32).map(|i| i as u8).collect();
    let second: Vec<u8> = (0..5000u32).map(|i| (i * 3) as u8).collect();
    let dest = [client.session.local_id()];
    server
        .session
        .send(Packet::new(tags::VIDEO_PACKET, first.clone()), &dest, 0);
    server
        .session
        .send(Packet::new(tags::VIDEO_PACKET, second.clone()), &dest, 0);

    wait_until("both heavy payloads to arrive", || {
        seen.lock().unwrap().len() == 2
    })
    .await;
    let seen = seen.lock().unwrap();
    assert_eq!(seen[0].0, first);
    assert_eq!(seen[1].0, second);
    // Both originate from the authority.
    assert!(seen.iter().all(|(_, source)| *source == 0));
    server.session.shutdown();
}

/// Application-level split nested over frame-level split: a payload above
/// the session threshold crosses as SPLIT_HEAD plus parts, each part itself
/// frame-split, and reassembles byte-exact on the authority.
#[tokio::test(flavor = "multi_thread")]
async fn session_split_nests_over_frame_split() {
    let mut config = test_config();
    config.session.max_frame_payload = 1024;
    config.session.split_threshold = 8 * 1024;

    let server = start_server(config.clone()).await;
    let client = connect_client(config, &server.addr, "ada").await;
    let seen = collect(&server.ctx, tags::VIDEO_PACKET);

    let payload: Vec<u8> = (0..30_000u32).map(|i| (i * 7) as u8).collect();
    client
        .session
        .send(Packet::new(tags::VIDEO_PACKET, payload.clone()), &[0], 0);

    wait_until("the reassembled payload to reach the authority", || {
        !seen.lock().unwrap().is_empty()
    })
    .await;
    let seen = seen.lock().unwrap();
    assert_eq!(seen[0].0, payload);
    assert_eq!(seen[0].1, client.session.local_id());
    server.session.shutdown();
}

/// Peer-to-peer routing: the authority forwards an addressed message and
/// rewrites the destination prefix into the source user id.
#[tokio::test(flavor = "multi_thread")]
async fn forwarded_message_carries_the_source_id() {
    let server = start_server(test_config()).await;
    let ada = connect_client(test_config(), &server.addr, "ada").await;
    let ben = connect_client(test_config(), &server.addr, "ben").await;
    let seen = collect(&ben.ctx, tags::STREAM_META);

    let meta = StreamMeta {
        media_id: 7,
        video_codec: "h264".into(),
        audio_codec: "opus".into(),
    };
    ada.session.send(
        payload::to_packet(tags::STREAM_META, &meta),
        &[ben.session.local_id()],
        0,
    );

    wait_until("ben to receive the forwarded announcement", || {
        !seen.lock().unwrap().is_empty()
    })
    .await;
    let seen = seen.lock().unwrap();
    assert_eq!(seen[0].1, ada.session.local_id());
    let got: StreamMeta =
        payload::parse(tags::STREAM_META, &Packet::new(tags::STREAM_META, seen[0].0.clone()))
            .unwrap();
    assert_eq!(got.media_id, 7);
    assert_eq!(got.video_codec, "h264");
    server.session.shutdown();
}

/// A queue+flush burst crosses the authority whole: every packet of the
/// group is forwarded to the destination, each attributed to the sender.
#[tokio::test(flavor = "multi_thread")]
async fn flushed_burst_is_forwarded_in_full() {
    let server = start_server(test_config()).await;
    let ada = connect_client(test_config(), &server.addr, "ada").await;
    let ben = connect_client(test_config(), &server.addr, "ben").await;
    let seen = collect(&ben.ctx, tags::STREAM_META);

    for media_id in [1, 2] {
        ada.session.queue(payload::to_packet(tags::STREAM_META, &StreamMeta {
            media_id,
            video_codec: "h264".into(),
            audio_codec: "opus".into(),
        }));
    }
    ada.session.flush(&[ben.session.local_id()], 0);

    wait_until("both packets of the burst to reach ben", || {
        seen.lock().unwrap().len() == 2
    })
    .await;
    let seen = seen.lock().unwrap();
    assert!(seen.iter().all(|(_, source)| *source == ada.session.local_id()));
    let ids: Vec<i64> = seen
        .iter()
        .map(|(bytes, _)| {
            let meta: StreamMeta = payload::parse(
                tags::STREAM_META,
                &Packet::new(tags::STREAM_META, bytes.clone()),
            )
            .unwrap();
            meta.media_id
        })
        .collect();
    assert_eq!(ids, [1, 2]);
    server.session.shutdown();
}

/// A destination that departed before the pump ran is dropped without
/// stalling delivery to the peers still connected.
#[tokio::test(flavor = "multi_thread")]
async fn departed_destination_does_not_block_the_rest() {
    let server = start_server(test_config()).await;
    let ada = connect_client(test_config(), &server.addr, "ada").await;
    let ben = connect_client(test_config(), &server.addr, "ben").await;
    let seen = collect(&ada.ctx, tags::STREAM_META);

    let ben_id = ben.session.local_id();
    ben.session.disconnect();
    wait_until("the authority to drop ben", || {
        !server.session.connected_user_ids().contains(&ben_id)
    })
    .await;

    let meta = StreamMeta {
        media_id: 9,
        video_codec: String::new(),
        audio_codec: String::new(),
    };
    server.session.send(
        payload::to_packet(tags::STREAM_META, &meta),
        &[ben_id, ada.session.local_id()],
        0,
    );

    wait_until("ada to receive the announcement", || {
        !seen.lock().unwrap().is_empty()
    })
    .await;
    assert_eq!(seen.lock().unwrap()[0].1, 0);
    server.session.shutdown();
}

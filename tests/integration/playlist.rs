//! Distributed playlist convergence: add, move, denial, playback start.

use crate::*;

use std::time::Duration;

use matinee_playlist::model::{ItemState, SharedPlaylist, MEDIA_DENIED, NO_MEDIA};
use matinee_playlist::probe::{self, InstantProbe};
use matinee_playlist::Orchestrator;

fn orchestrator(ctx: &Context) -> Orchestrator {
    Orchestrator::new(
        ctx.clone(),
        probe::shared(InstantProbe { duration_secs: 42.0 }),
    )
}

/// Tick every orchestrator until `check` holds or the deadline passes.
/// `check` reads the shared models, never the orchestrators themselves.
async fn converge(what: &str, orchs: &mut [&mut Orchestrator], mut check: impl FnMut() -> bool) {
    for _ in 0..1000 {
        for orch in orchs.iter_mut() {
            orch.tick();
        }
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    panic!("timed out waiting for {what}");
}

fn ready_order(model: &SharedPlaylist) -> Vec<i64> {
    model
        .lock()
        .unwrap()
        .ready
        .iter()
        .map(|i| i.media_id)
        .collect()
}

#[tokio::test(flavor = "multi_thread")]
async fn client_add_converges_on_both_peers() {
    let server = start_server(test_config()).await;
    let client = connect_client(test_config(), &server.addr, "ada").await;

    let mut server_orch = orchestrator(&server.ctx);
    server_orch.switch_server(server.session.clone());
    let mut client_orch = orchestrator(&client.ctx);
    client_orch.switch_client(client.session.clone());
    let (server_model, client_model) = (server_orch.model(), client_orch.model());

    client_orch.request_add("film.mkv".into()).unwrap();
    converge(
        "the add to be confirmed on both peers",
        &mut [&mut server_orch, &mut client_orch],
        || {
            let s = ready_order(&server_model);
            s.len() == 1 && s == ready_order(&client_model)
        },
    )
    .await;

    let playlist = client_model.lock().unwrap();
    let item = &playlist.ready[0];
    assert_eq!(item.host_user_id, client.session.local_id());
    assert_eq!(item.duration_secs, 42.0);
    assert!(item.media_id >= 0, "authority assigns the media id");
    server.session.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn move_keeps_the_order_identical_everywhere() {
    let server = start_server(test_config()).await;
    let client = connect_client(test_config(), &server.addr, "ada").await;

    let mut server_orch = orchestrator(&server.ctx);
    server_orch.switch_server(server.session.clone());
    let mut client_orch = orchestrator(&client.ctx);
    client_orch.switch_client(client.session.clone());
    let (server_model, client_model) = (server_orch.model(), client_orch.model());

    client_orch.request_add("one.mkv".into()).unwrap();
    client_orch.request_add("two.mkv".into()).unwrap();
    converge(
        "both adds to be confirmed",
        &mut [&mut server_orch, &mut client_orch],
        || ready_order(&server_model).len() == 2 && ready_order(&client_model).len() == 2,
    )
    .await;
    let before = ready_order(&client_model);
    assert_eq!(before, ready_order(&server_model));

    client_orch.request_move(before[0], 1);
    let reversed = vec![before[1], before[0]];
    converge(
        "the move broadcast to land on both peers",
        &mut [&mut server_orch, &mut client_orch],
        || ready_order(&server_model) == reversed && ready_order(&client_model) == reversed,
    )
    .await;
    server.session.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn guest_add_is_denied_when_guests_may_not_add() {
    let mut config = test_config();
    config.playback.guests_may_add = false;
    let server = start_server(config).await;
    let client = connect_client(test_config(), &server.addr, "ada").await;

    let mut server_orch = orchestrator(&server.ctx);
    server_orch.switch_server(server.session.clone());
    let mut client_orch = orchestrator(&client.ctx);
    client_orch.switch_client(client.session.clone());
    let (server_model, client_model) = (server_orch.model(), client_orch.model());

    client_orch.request_add("refused.mkv".into()).unwrap();
    converge(
        "the denial to land on the client",
        &mut [&mut server_orch, &mut client_orch],
        || !client_model.lock().unwrap().failed.is_empty(),
    )
    .await;

    let playlist = client_model.lock().unwrap();
    assert_eq!(playlist.failed[0].state, ItemState::Failed);
    assert_eq!(playlist.failed[0].media_id, MEDIA_DENIED);
    assert!(ready_order(&server_model).is_empty());
    server.session.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn play_start_and_stop_run_the_full_round() {
    let server = start_server(test_config()).await;
    let client = connect_client(test_config(), &server.addr, "ada").await;

    let mut server_orch = orchestrator(&server.ctx);
    server_orch.switch_server(server.session.clone());
    let mut client_orch = orchestrator(&client.ctx);
    client_orch.switch_client(client.session.clone());
    let (server_model, client_model) = (server_orch.model(), client_orch.model());

    client_orch.request_add("feature.mkv".into()).unwrap();
    converge(
        "the add to be confirmed on both peers",
        &mut [&mut server_orch, &mut client_orch],
        || ready_order(&server_model).len() == 1 && ready_order(&client_model).len() == 1,
    )
    .await;
    let media_id = ready_order(&server_model)[0];

    // The client hosts the item; the authority's start request runs the
    // order/response round through it before anyone starts.
    server_orch.request_play(media_id);
    converge(
        "playback to start on both peers",
        &mut [&mut server_orch, &mut client_orch],
        || {
            server_model.lock().unwrap().currently_playing == media_id
                && client_model.lock().unwrap().currently_playing == media_id
        },
    )
    .await;
    assert_eq!(server_model.lock().unwrap().currently_starting, NO_MEDIA);

    client_orch.request_stop(media_id);
    converge(
        "playback to stop on both peers",
        &mut [&mut server_orch, &mut client_orch],
        || {
            server_model.lock().unwrap().currently_playing == NO_MEDIA
                && client_model.lock().unwrap().currently_playing == NO_MEDIA
        },
    )
    .await;
    server.session.shutdown();
}

//! End-to-end hook scenarios against the fully wired gateway (in-memory
//! state store, faked auth backends, real HTTP routing).

use crate::hooks::server::configure_routes;
use crate::hooks::AppState;
use crate::models::StreamType;
use crate::repository::stream_state::StreamStateStore;
use crate::tests::fixtures::{auth_record, gateway_state, DbBehavior};
use actix_web::{body::to_bytes, test, web, App};
use serde_json::{json, Value};
use std::time::Duration;

async fn post(state: AppState, path: &str, body: Value) -> (u16, Value) {
    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(state))
            .configure(configure_routes),
    )
    .await;

    let req = test::TestRequest::post()
        .uri(path)
        .set_json(&body)
        .to_request();
    let resp = test::call_service(&app, req).await;
    let status = resp.status().as_u16();
    let bytes = to_bytes(resp.into_body()).await.unwrap();
    (status, serde_json::from_slice(&bytes).unwrap())
}

fn publish_body(client_id: &str, token: &str) -> Value {
    json!({
        "action": "on_publish",
        "app": "live",
        "stream": "abc",
        "vhost": "vhost",
        "id": client_id,
        "params": format!("token={token}"),
        "schema": "rtmp"
    })
}

fn play_body(client_id: &str, token: &str) -> Value {
    json!({
        "action": "on_play",
        "app": "live",
        "stream": "abc",
        "vhost": "vhost",
        "id": client_id,
        "params": format!("token={token}"),
        "schema": "rtmp"
    })
}

/// S1: an authorized publish is allowed and installs the publisher state.
#[actix_web::test]
async fn publish_allowed() {
    let (state, mem, _) = gateway_state(DbBehavior::Row(auth_record()));

    let (status, body) = post(
        state,
        "/index/hook/on_publish",
        publish_body("cli1", "tok1"),
    )
    .await;

    assert_eq!(status, 200);
    assert_eq!(body, json!({"code": 0, "msg": "success"}));

    let publisher = mem.get_publisher_task("vhost/live/abc").await.unwrap();
    assert_eq!(publisher.client_id, "cli1");
    assert_eq!(mem.active_publisher_count().await, 1);
}

/// S2: a wrong token is denied; the decision layer reports it as code 4.
#[actix_web::test]
async fn publish_denied_wrong_token() {
    let (state, mem, _) = gateway_state(DbBehavior::Empty);

    let (status, body) = post(
        state,
        "/index/hook/on_publish",
        publish_body("cli1", "wrong"),
    )
    .await;

    assert_eq!(status, 200);
    assert_eq!(body["code"], 4);
    assert!(mem.get_publisher_task("vhost/live/abc").await.is_none());
}

/// S3: play with valid auth but no publisher is answered not-ready.
#[actix_web::test]
async fn play_without_publisher() {
    let (state, _, _) = gateway_state(DbBehavior::Row(auth_record()));

    let (status, body) = post(state, "/index/hook/on_play", play_body("cli2", "tok1")).await;

    assert_eq!(status, 503);
    assert_eq!(body["code"], 6);
}

/// S4: a player is bound to the exact node serving the publisher.
#[actix_web::test]
async fn play_binds_to_publisher_node() {
    let (state, mem, _) = gateway_state(DbBehavior::Row(auth_record()));

    post(
        state.clone(),
        "/index/hook/on_publish",
        publish_body("cli1", "tok1"),
    )
    .await;
    let (status, body) = post(state, "/index/hook/on_play", play_body("cli2", "tok1")).await;

    assert_eq!(status, 200);
    assert_eq!(body["code"], 0);

    let publisher = mem.get_publisher_task("vhost/live/abc").await.unwrap();
    let player = mem.get_task("vhost/live/abc", "cli2").await.unwrap();
    assert_eq!(player.task_type, StreamType::Player);
    assert_eq!(player.server_ip, publisher.server_ip);
    assert_eq!(player.server_port, publisher.server_port);
}

/// S5: the reaper retires a dead publisher and clears the derived state.
#[actix_web::test]
async fn reaper_reaps_dead_publisher() {
    let (state, mem, scheduler) = gateway_state(DbBehavior::Row(auth_record()));

    post(
        state.clone(),
        "/index/hook/on_publish",
        publish_body("cli1", "tok1"),
    )
    .await;
    post(state, "/index/hook/on_play", play_body("cli2", "tok1")).await;

    mem.backdate("vhost/live/abc", "cli1", Duration::from_secs(120));
    scheduler.run_cleanup_cycle().await;

    assert!(mem.get_publisher_task("vhost/live/abc").await.is_none());
    assert_eq!(mem.active_publisher_count().await, 0);
    assert_eq!(mem.player_count("vhost/live/abc").await, 0);
    assert!(mem.stream_client_ids("vhost/live/abc").await.is_empty());
}

/// S6 shape: a failing state backend turns into a non-success reply, not a
/// crash.
#[actix_web::test]
async fn state_backend_failure_answers_non_success() {
    let (state, mem, _) = gateway_state(DbBehavior::Row(auth_record()));
    mem.fail_next_register();

    let (status, body) = post(
        state,
        "/index/hook/on_publish",
        publish_body("cli1", "tok1"),
    )
    .await;

    assert_eq!(status, 200);
    assert_eq!(body["code"], 4);
}

/// Publisher exit cascades through the whole stream membership.
#[actix_web::test]
async fn publish_done_cascade() {
    let (state, mem, _) = gateway_state(DbBehavior::Row(auth_record()));

    post(
        state.clone(),
        "/index/hook/on_publish",
        publish_body("cli1", "tok1"),
    )
    .await;
    post(
        state.clone(),
        "/index/hook/on_play",
        play_body("cli2", "tok1"),
    )
    .await;

    let (status, body) = post(
        state,
        "/index/hook/on_publish_done",
        json!({
            "action": "on_publish_done",
            "app": "live", "stream": "abc", "vhost": "vhost", "id": "cli1"
        }),
    )
    .await;

    assert_eq!(status, 200);
    assert_eq!(body["code"], 0);
    assert!(mem.get_publisher_task("vhost/live/abc").await.is_none());
    assert!(mem.get_task("vhost/live/abc", "cli2").await.is_none());
    assert_eq!(mem.global_players(), 0);
}

/// A keep-alive connection serves sequential hooks independently.
#[actix_web::test]
async fn sequential_requests_on_one_service() {
    let (state, _, _) = gateway_state(DbBehavior::Row(auth_record()));
    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(state))
            .configure(configure_routes),
    )
    .await;

    let first = test::TestRequest::post()
        .uri("/index/hook/on_publish")
        .set_json(publish_body("cli1", "tok1"))
        .to_request();
    let resp = test::call_service(&app, first).await;
    assert_eq!(resp.status().as_u16(), 200);

    let second = test::TestRequest::post()
        .uri("/index/hook/on_play")
        .set_json(play_body("cli2", "tok1"))
        .to_request();
    let resp = test::call_service(&app, second).await;
    assert_eq!(resp.status().as_u16(), 200);
}

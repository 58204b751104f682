mod common;

use axum::http::{Method, StatusCode};
use chrono::DateTime;
use serde_json::json;

use common::*;

async fn run_tool_turn(test: &TestApp) -> String {
    let session_id = create_session(&test.app).await;
    let (status, payload) = chat(&test.app, &session_id, "List files in /tmp").await;
    assert_eq!(status, StatusCode::OK, "{payload}");
    session_id
}

async fn stop(test: &TestApp, session_id: &str) {
    let status = send_status(
        &test.app,
        Method::POST,
        &format!("/v1/sessions/{session_id}/stop"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn poll_paginates_with_an_exclusive_offset() {
    let test = TestApp::new().await;
    let session_id = run_tool_turn(&test).await;
    let path = format!("/v1/sessions/{session_id}/events/poll");

    let (status, payload) = send_json(&test.app, Method::GET, &format!("{path}?limit=2"), None).await;
    assert_eq!(status, StatusCode::OK);
    let data = &payload["data"];
    assert_eq!(offsets(data["events"].as_array().unwrap()), vec![0, 1]);
    assert_eq!(data["has_more"], true);

    let (_, payload) = send_json(
        &test.app,
        Method::GET,
        &format!("{path}?offset=1&limit=2"),
        None,
    )
    .await;
    assert_eq!(offsets(payload["data"]["events"].as_array().unwrap()), vec![2, 3]);
    assert_eq!(payload["data"]["has_more"], true);

    let (_, payload) = send_json(&test.app, Method::GET, &format!("{path}?offset=3"), None).await;
    assert_eq!(offsets(payload["data"]["events"].as_array().unwrap()), vec![4, 5]);
    assert_eq!(payload["data"]["has_more"], false);

    let (_, payload) = send_json(&test.app, Method::GET, &format!("{path}?offset=5"), None).await;
    assert_eq!(payload["data"]["events"], json!([]));
    assert_eq!(payload["data"]["has_more"], false);

    // Beyond the end is not a gap, just empty.
    let (status, payload) =
        send_json(&test.app, Method::GET, &format!("{path}?offset=10"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(payload["data"]["events"], json!([]));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn session_stream_replays_and_closes_after_a_stop() {
    let test = TestApp::new().await;
    let session_id = run_tool_turn(&test).await;
    stop(&test, &session_id).await;

    let response = send_request(
        &test.app,
        Method::GET,
        &format!("/v1/sessions/{session_id}/events"),
        None,
    )
    .await;
    let events = collect_sse(response).await;
    assert_eq!(events.len(), 7);
    assert_gapless_from(&events, 0);
    assert_eq!(events[6]["type"], "done");
    assert_eq!(events[6]["data"]["outcome"], "stopped");

    let response = send_request(
        &test.app,
        Method::GET,
        &format!("/v1/sessions/{session_id}/events?offset=3"),
        None,
    )
    .await;
    let events = collect_sse(response).await;
    assert_gapless_from(&events, 4);
    assert_eq!(events.len(), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn session_stream_follows_live_turns_until_stopped() {
    let test = TestApp::new().await;
    let session_id = create_session(&test.app).await;

    // Subscribe before anything happened, then drive a turn and a stop.
    let response = send_request(
        &test.app,
        Method::GET,
        &format!("/v1/sessions/{session_id}/events"),
        None,
    )
    .await;
    let collector = tokio::spawn(collect_sse(response));

    let (status, _) = chat(&test.app, &session_id, "Hello there").await;
    assert_eq!(status, StatusCode::OK);
    stop(&test, &session_id).await;

    let events = collector.await.expect("collector task");
    assert_eq!(event_types(&events), vec!["message.delta", "done", "done"]);
    assert_eq!(events[1]["data"]["outcome"], "completed");
    assert_eq!(events[2]["data"]["outcome"], "stopped");
    assert_gapless_from(&events, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn evicted_offsets_return_stream_gap() {
    let test = TestApp::with_config(|config| {
        config.event_retention = 4;
    })
    .await;
    let session_id = run_tool_turn(&test).await;
    stop(&test, &session_id).await;
    // Seven events total, of which only offsets 3..=6 are retained.
    let path = format!("/v1/sessions/{session_id}/events/poll");

    let (status, payload) = send_json(&test.app, Method::GET, &format!("{path}?offset=0"), None).await;
    assert_eq!(status, StatusCode::GONE);
    assert_eq!(payload["code"], 410);
    assert_eq!(payload["data"]["kind"], "stream_gap");
    assert_eq!(payload["data"]["requested"], 0);
    assert_eq!(payload["data"]["oldest"], 3);

    let (status, _) = send_json(&test.app, Method::GET, &path, None).await;
    assert_eq!(status, StatusCode::GONE);

    let (status, payload) = send_json(&test.app, Method::GET, &format!("{path}?offset=3"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(offsets(payload["data"]["events"].as_array().unwrap()), vec![4, 5, 6]);
    assert_eq!(payload["data"]["has_more"], false);

    let (_, payload) = send_json(
        &test.app,
        Method::GET,
        &format!("{path}?offset=3&limit=2"),
        None,
    )
    .await;
    assert_eq!(offsets(payload["data"]["events"].as_array().unwrap()), vec![4, 5]);
    assert_eq!(payload["data"]["has_more"], true);

    let (status, payload) = send_json(
        &test.app,
        Method::GET,
        &format!("/v1/sessions/{session_id}/events?offset=0"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::GONE, "{payload}");
    assert_eq!(payload["data"]["kind"], "stream_gap");

    let response = send_request(
        &test.app,
        Method::GET,
        &format!("/v1/sessions/{session_id}/events?offset=3"),
        None,
    )
    .await;
    let events = collect_sse(response).await;
    assert_gapless_from(&events, 4);
    assert_eq!(events.last().unwrap()["data"]["outcome"], "stopped");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn event_envelopes_carry_ids_and_timestamps() {
    let test = TestApp::new().await;
    let session_id = run_tool_turn(&test).await;

    let events = all_events(&test.app, &session_id).await;
    assert_eq!(events.len(), 6);
    for event in &events {
        let offset = event["offset"].as_u64().unwrap();
        assert_eq!(event["event_id"], format!("evt_{offset}"));
        assert_eq!(event["session_id"], session_id.as_str());
        let time = event["time"].as_str().unwrap();
        DateTime::parse_from_rfc3339(time).expect("rfc3339 event time");
    }

    let (_, payload) = send_json(&test.app, Method::GET, "/v1/sessions", None).await;
    assert_eq!(payload["data"]["sessions"][0]["event_count"], 6);
}

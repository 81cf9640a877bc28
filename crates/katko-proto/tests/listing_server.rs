//! End-to-end checks of the listing client against a fake nginx JSON
//! autoindex served by axum on an ephemeral port.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use axum::routing::get;
use axum::Router;
use chrono::NaiveDate;
use katko_proto::config::ListingConfig;
use katko_proto::listing::{ListingClient, ListingError};
use katko_proto::slot::{select_closest, SlotLabel};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

async fn spawn_server(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind ephemeral port");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });
    format!("http://{}", addr)
}

fn listing_config(base_url: String, retry_attempts: u32) -> ListingConfig {
    ListingConfig {
        base_url,
        retry_attempts,
        retry_base_delay_ms: 1,
        ..ListingConfig::default()
    }
}

async fn break_index() -> Json<serde_json::Value> {
    Json(json!([
        { "name": "1400", "type": "directory", "mtime": "Fri, 17 May 2024 10:00:00 GMT" },
        { "name": "1500", "type": "directory", "mtime": "Fri, 17 May 2024 10:00:00 GMT" },
        { "name": "index.html", "type": "file", "mtime": "Fri, 17 May 2024 10:00:00 GMT", "size": 120 }
    ]))
}

async fn slot_1500() -> Json<serde_json::Value> {
    // nginx sorts, but don't rely on it
    Json(json!([
        { "name": "003 - Loppujingle.mp3", "type": "file", "size": 1 },
        { "name": "001 - Alkujingle.mp3", "type": "file", "size": 1 },
        { "name": "old", "type": "directory" },
        { "name": "002 - Mainos - firmaB.flac", "type": "file", "size": 1 }
    ]))
}

#[tokio::test]
async fn selects_slot_and_lists_tracks_in_file_order() {
    let app = Router::new()
        .route("/katkot/", get(break_index))
        .route("/katkot/1500/", get(slot_1500));
    let base = spawn_server(app).await;
    let client = ListingClient::new(&listing_config(base.clone(), 1), true).unwrap();

    let slots = client.fetch_slots().await.unwrap();
    assert_eq!(slots.len(), 2);

    let now = NaiveDate::from_ymd_opt(2024, 5, 17)
        .unwrap()
        .and_hms_opt(14, 50, 0)
        .unwrap();
    let chosen = select_closest(&slots, now).unwrap();
    assert_eq!(chosen.as_str(), "1500");

    let tracks = client.fetch_tracks(chosen).await.unwrap();
    let names: Vec<&str> = tracks.iter().map(|t| t.name.as_str()).collect();
    assert_eq!(
        names,
        [
            "001 - Alkujingle.mp3",
            "002 - Mainos - firmaB.flac",
            "003 - Loppujingle.mp3"
        ]
    );
    assert_eq!(
        tracks[0].url,
        format!("{}/katkot/1500/001%20-%20Alkujingle.mp3", base)
    );
}

#[tokio::test]
async fn listing_order_is_kept_when_sorting_is_off() {
    let app = Router::new().route("/katkot/1500/", get(slot_1500));
    let base = spawn_server(app).await;
    let client = ListingClient::new(&listing_config(base, 1), false).unwrap();

    let slot: SlotLabel = "1500".parse().unwrap();
    let tracks = client.fetch_tracks(&slot).await.unwrap();
    assert_eq!(tracks.len(), 3);
    assert_eq!(tracks[0].name, "003 - Loppujingle.mp3");
}

async fn flaky(State(hits): State<Arc<AtomicUsize>>) -> impl IntoResponse {
    let n = hits.fetch_add(1, Ordering::SeqCst);
    if n < 2 {
        StatusCode::SERVICE_UNAVAILABLE.into_response()
    } else {
        Json(json!([{ "name": "0900", "type": "directory" }])).into_response()
    }
}

#[tokio::test]
async fn server_errors_are_retried_until_success() {
    let hits = Arc::new(AtomicUsize::new(0));
    let app = Router::new()
        .route("/katkot/", get(flaky))
        .with_state(hits.clone());
    let base = spawn_server(app).await;
    let client = ListingClient::new(&listing_config(base, 3), true).unwrap();

    let slots = client.fetch_slots().await.unwrap();
    assert_eq!(slots.len(), 1);
    assert_eq!(hits.load(Ordering::SeqCst), 3);
}

async fn always_down(State(hits): State<Arc<AtomicUsize>>) -> StatusCode {
    hits.fetch_add(1, Ordering::SeqCst);
    StatusCode::INTERNAL_SERVER_ERROR
}

#[tokio::test]
async fn retries_are_bounded() {
    let hits = Arc::new(AtomicUsize::new(0));
    let app = Router::new()
        .route("/katkot/", get(always_down))
        .with_state(hits.clone());
    let base = spawn_server(app).await;
    let client = ListingClient::new(&listing_config(base, 2), true).unwrap();

    let err = client.fetch_slots().await.unwrap_err();
    assert!(matches!(err, ListingError::Status { status, .. } if status.as_u16() == 500));
    assert_eq!(hits.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn missing_slot_is_not_retried() {
    let app = Router::new().route("/katkot/", get(break_index));
    let base = spawn_server(app).await;
    let client = ListingClient::new(&listing_config(base, 5), true).unwrap();

    let slot: SlotLabel = "1400".parse().unwrap();
    let err = client.fetch_tracks(&slot).await.unwrap_err();
    assert!(matches!(err, ListingError::Status { status, .. } if status.as_u16() == 404));
}

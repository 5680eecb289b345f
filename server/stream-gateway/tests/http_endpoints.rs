use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use http_body_util::BodyExt;
use tgstream_mtproto::emulated::EmulatedTelegram;
use tgstream_mtproto::DcId;
use tgstream_streamer::{Streamer, StreamerConfig};
use tower::ServiceExt;

use stream_gateway::{app, AppState};

const CHAT: i64 = -1_001_234_567_890;
const BIG_MSG: i32 = 1;
const SMALL_MSG: i32 = 2;
const TOKEN: &str = "bot-token";

fn fixture(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

async fn setup_app() -> (axum::Router, EmulatedTelegram, Vec<u8>) {
    let cluster = EmulatedTelegram::new(DcId(2), TOKEN);
    let big = fixture(3_000_000);
    cluster.add_document(CHAT, BIG_MSG, big.clone(), "video/mp4", "movie.mp4");
    cluster.add_document(CHAT, SMALL_MSG, fixture(1000), "video/mp4", "tiny.mp4");

    let streamer = Streamer::new(
        Arc::new(cluster.clone()),
        StreamerConfig::new(cluster.home_dc(), TOKEN),
    );
    streamer.connect_home().await.expect("home session");

    (app(AppState { streamer }), cluster, big)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn liveness_health_and_stats_endpoints() {
    let (app, _cluster, _big) = setup_app().await;

    let res = app
        .clone()
        .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body: serde_json::Value =
        serde_json::from_slice(&res.into_body().collect().await.unwrap().to_bytes()).unwrap();
    assert_eq!(body["status"], "running");
    assert_eq!(body["service"], "tgstream-gateway");
    assert!(body["version"].is_string());
    assert!(body["message"].is_string());

    let res = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/health")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body: serde_json::Value =
        serde_json::from_slice(&res.into_body().collect().await.unwrap().to_bytes()).unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["bot_connected"], true);

    let res = app
        .oneshot(
            Request::builder()
                .uri("/stats")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body: serde_json::Value =
        serde_json::from_slice(&res.into_body().collect().await.unwrap().to_bytes()).unwrap();
    assert_eq!(body["total_files"], 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn range_matrix() {
    let (app, _cluster, big) = setup_app().await;

    struct Case<'a> {
        name: &'a str,
        msg: i32,
        range: Option<&'a str>,
        expected_status: StatusCode,
        expected_content_length: Option<u64>,
        expected_content_range: Option<String>,
        expected_body: Option<Vec<u8>>,
    }

    let total = big.len() as u64;
    let last = total - 1;

    let cases = vec![
        Case {
            name: "no Range",
            msg: BIG_MSG,
            range: None,
            expected_status: StatusCode::OK,
            expected_content_length: Some(total),
            expected_content_range: None,
            expected_body: Some(big.clone()),
        },
        Case {
            name: "bytes=0-0",
            msg: BIG_MSG,
            range: Some("bytes=0-0"),
            expected_status: StatusCode::PARTIAL_CONTENT,
            expected_content_length: Some(1),
            expected_content_range: Some(format!("bytes 0-0/{total}")),
            expected_body: Some(vec![big[0]]),
        },
        Case {
            name: "tiny interior range",
            msg: BIG_MSG,
            range: Some("bytes=100-200"),
            expected_status: StatusCode::PARTIAL_CONTENT,
            expected_content_length: Some(101),
            expected_content_range: Some(format!("bytes 100-200/{total}")),
            expected_body: Some(big[100..=200].to_vec()),
        },
        Case {
            name: "unaligned tail range",
            msg: BIG_MSG,
            range: Some("bytes=1500000-2500000"),
            expected_status: StatusCode::PARTIAL_CONTENT,
            expected_content_length: Some(1_000_001),
            expected_content_range: Some(format!("bytes 1500000-2500000/{total}")),
            expected_body: Some(big[1_500_000..=2_500_000].to_vec()),
        },
        Case {
            name: "open ended",
            msg: BIG_MSG,
            range: Some("bytes=2999000-"),
            expected_status: StatusCode::PARTIAL_CONTENT,
            expected_content_length: Some(1000),
            expected_content_range: Some(format!("bytes 2999000-{last}/{total}")),
            expected_body: Some(big[2_999_000..].to_vec()),
        },
        Case {
            name: "suffix",
            msg: BIG_MSG,
            range: Some("bytes=-1"),
            expected_status: StatusCode::PARTIAL_CONTENT,
            expected_content_length: Some(1),
            expected_content_range: Some(format!("bytes {last}-{last}/{total}")),
            expected_body: Some(vec![big[last as usize]]),
        },
        Case {
            name: "explicit end at file size is strict",
            msg: BIG_MSG,
            range: Some("bytes=0-3000000"),
            expected_status: StatusCode::RANGE_NOT_SATISFIABLE,
            expected_content_length: None,
            expected_content_range: Some(format!("bytes */{total}")),
            expected_body: Some(vec![]),
        },
        Case {
            name: "start past the end",
            msg: SMALL_MSG,
            range: Some("bytes=2000-3000"),
            expected_status: StatusCode::RANGE_NOT_SATISFIABLE,
            expected_content_length: None,
            expected_content_range: Some("bytes */1000".to_string()),
            expected_body: Some(vec![]),
        },
        Case {
            name: "multi-range is rejected",
            msg: BIG_MSG,
            range: Some("bytes=0-0,2-2"),
            expected_status: StatusCode::RANGE_NOT_SATISFIABLE,
            expected_content_length: None,
            expected_content_range: Some(format!("bytes */{total}")),
            expected_body: Some(vec![]),
        },
        Case {
            name: "malformed range",
            msg: BIG_MSG,
            range: Some("bytes=abc-def"),
            expected_status: StatusCode::RANGE_NOT_SATISFIABLE,
            expected_content_length: None,
            expected_content_range: Some(format!("bytes */{total}")),
            expected_body: Some(vec![]),
        },
        Case {
            name: "wrong unit",
            msg: BIG_MSG,
            range: Some("items=0-1"),
            expected_status: StatusCode::RANGE_NOT_SATISFIABLE,
            expected_content_length: None,
            expected_content_range: Some(format!("bytes */{total}")),
            expected_body: Some(vec![]),
        },
    ];

    for case in cases {
        let mut req = Request::builder()
            .method(Method::GET)
            .uri(format!("/stream/{CHAT}/{}", case.msg));
        if let Some(range) = case.range {
            req = req.header(header::RANGE, range);
        }

        let res = app
            .clone()
            .oneshot(req.body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(res.status(), case.expected_status, "{}", case.name);

        if case.expected_status.is_success()
            || case.expected_status == StatusCode::PARTIAL_CONTENT
        {
            assert_eq!(
                res.headers()[header::ACCEPT_RANGES].to_str().unwrap(),
                "bytes",
                "{}: Accept-Ranges",
                case.name
            );
            // 206 exactly when the request carried a Range header.
            assert_eq!(
                res.status() == StatusCode::PARTIAL_CONTENT,
                case.range.is_some(),
                "{}: status/Range correlation",
                case.name
            );
        }

        if let Some(expected) = case.expected_content_length {
            assert_eq!(
                res.headers()[header::CONTENT_LENGTH].to_str().unwrap(),
                expected.to_string(),
                "{}: Content-Length",
                case.name
            );
        }

        match (
            case.expected_content_range.as_deref(),
            res.headers()
                .get(header::CONTENT_RANGE)
                .and_then(|v| v.to_str().ok()),
        ) {
            (None, None) => {}
            (Some(expected), Some(actual)) => {
                assert_eq!(actual, expected, "{}: Content-Range", case.name)
            }
            (expected, actual) => panic!(
                "{}: Content-Range mismatch expected={expected:?} actual={actual:?}",
                case.name
            ),
        }

        if let Some(expected_body) = case.expected_body {
            let body = res.into_body().collect().await.unwrap().to_bytes();
            assert_eq!(&body[..], &expected_body[..], "{}: body", case.name);
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn content_headers_for_media() {
    let (app, _cluster, _big) = setup_app().await;

    let res = app
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!("/stream/{CHAT}/{BIG_MSG}"))
                .header(header::RANGE, "bytes=0-99")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(
        res.headers()[header::CONTENT_TYPE].to_str().unwrap(),
        "video/mp4"
    );
    assert_eq!(
        res.headers()[header::CONTENT_DISPOSITION].to_str().unwrap(),
        "inline; filename=\"movie.mp4\""
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn generic_mime_is_guessed_from_the_filename() {
    let cluster = EmulatedTelegram::new(DcId(2), TOKEN);
    cluster.add_document(
        CHAT,
        1,
        fixture(5000),
        "application/octet-stream",
        "episode.mkv",
    );
    let streamer = Streamer::new(
        Arc::new(cluster.clone()),
        StreamerConfig::new(cluster.home_dc(), TOKEN),
    );
    streamer.connect_home().await.unwrap();
    let app = app(AppState { streamer });

    let res = app
        .oneshot(
            Request::builder()
                .uri(format!("/stream/{CHAT}/1"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(
        res.headers()[header::CONTENT_TYPE].to_str().unwrap(),
        "video/x-matroska"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn missing_media_is_404() {
    let (app, _cluster, _big) = setup_app().await;

    let res = app
        .oneshot(
            Request::builder()
                .uri(format!("/stream/{CHAT}/9999"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
    let body: serde_json::Value =
        serde_json::from_slice(&res.into_body().collect().await.unwrap().to_bytes()).unwrap();
    assert_eq!(body["status"], "error");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn not_ready_gateway_returns_503() {
    let cluster = EmulatedTelegram::new(DcId(2), TOKEN);
    cluster.add_document(CHAT, 1, fixture(100), "video/mp4", "a.mp4");
    // No connect_home: the listener is up before the bot is.
    let streamer = Streamer::new(
        Arc::new(cluster.clone()),
        StreamerConfig::new(cluster.home_dc(), TOKEN),
    );
    let app = app(AppState { streamer });

    let res = app
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!("/stream/{CHAT}/1"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::SERVICE_UNAVAILABLE);

    // Liveness still answers, readiness reports the truth.
    let res = app
        .oneshot(
            Request::builder()
                .uri("/health")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body: serde_json::Value =
        serde_json::from_slice(&res.into_body().collect().await.unwrap().to_bytes()).unwrap();
    assert_eq!(body["bot_connected"], false);
    assert_eq!(body["status"], "starting");
}

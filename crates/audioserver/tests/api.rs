//! HTTP API integration tests
//!
//! The router is driven with `oneshot`; the external tools are replaced by
//! in-process fakes so no ffmpeg or yt-dlp is needed.

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{header, Request, StatusCode},
    Router,
};
use http_body_util::BodyExt;
use serde_json::Value;
use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;
use vid2audio_server::{
    channel::ProgressEvent,
    config::Config,
    finalize::OutputStrategy,
    registry::ProcessHandle,
    routes::{build_router, AppState},
    tools::{DownloadOutput, DownloadRequest, Downloader, Invocation, ToolError, ToolSignal, Transcoder},
};

const BOUNDARY: &str = "vid2audio-test-boundary";

/// Writes a tiny artifact after reporting two progress points.
struct FakeTranscoder;

#[async_trait]
impl Transcoder for FakeTranscoder {
    async fn transcode(
        &self,
        invocation: &Invocation,
        signals: mpsc::UnboundedSender<ToolSignal>,
        _cancel: CancellationToken,
    ) -> Result<(), ToolError> {
        let _ = signals.send(ToolSignal::Started {
            command_line: format!("ffmpeg {}", invocation.args.join(" ")),
        });
        for pct in [30.0, 90.0] {
            let _ = signals.send(ToolSignal::Progress {
                percent: Some(pct),
                timemark: None,
            });
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        std::fs::write(&invocation.target, b"ID3")?;
        Ok(())
    }
}

#[derive(Default)]
struct FakeDownloader {
    installed: bool,
    calls: AtomicUsize,
}

#[async_trait]
impl Downloader for FakeDownloader {
    async fn locate(&self) -> Option<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.installed.then(|| "yt-dlp".to_string())
    }

    async fn download(
        &self,
        _program: &str,
        request: &DownloadRequest,
        _cancel: CancellationToken,
    ) -> Result<DownloadOutput, ToolError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let template = request.output_template.to_string_lossy().into_owned();
        std::fs::write(template.replace("%(ext)s", "mp4"), vec![0u8; 2048])?;
        Ok(DownloadOutput::default())
    }
}

struct TestServer {
    _dir: TempDir,
    state: AppState,
    downloader: Arc<FakeDownloader>,
}

impl TestServer {
    fn new(downloader_installed: bool) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::with_data_dir(dir.path().join("public"));
        config.output_strategy = OutputStrategy::Direct;
        config.ensure_dirs().unwrap();

        let downloader = Arc::new(FakeDownloader {
            installed: downloader_installed,
            ..Default::default()
        });
        let state = AppState::new(config, Arc::new(FakeTranscoder), downloader.clone(), false);
        Self {
            _dir: dir,
            state,
            downloader,
        }
    }

    fn router(&self) -> Router {
        build_router(self.state.clone())
    }

    fn output_dir(&self) -> PathBuf {
        self.state.config.output_dir.clone()
    }

    fn upload_dir(&self) -> PathBuf {
        self.state.config.upload_dir.clone()
    }
}

/// Helper to get response body as JSON
async fn body_json(body: Body) -> Value {
    let bytes = body.collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

fn multipart(video: Option<(&str, &[u8])>, fields: &[(&str, &str)]) -> Request<Body> {
    let mut body = Vec::new();
    if let Some((file_name, bytes)) = video {
        body.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"video\"; filename=\"{file_name}\"\r\nContent-Type: application/octet-stream\r\n\r\n"
            )
            .as_bytes(),
        );
        body.extend_from_slice(bytes);
        body.extend_from_slice(b"\r\n");
    }
    for (name, value) in fields {
        body.extend_from_slice(
            format!("--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n")
                .as_bytes(),
        );
    }
    body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());

    Request::post("/api/convert")
        .header(header::CONTENT_TYPE, format!("multipart/form-data; boundary={BOUNDARY}"))
        .body(Body::from(body))
        .unwrap()
}

fn json_post(uri: &str, body: Value) -> Request<Body> {
    Request::post(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

/// Collects events until the job's terminal event.
async fn drain_job(rx: &mut mpsc::UnboundedReceiver<ProgressEvent>) -> Vec<ProgressEvent> {
    let mut events = Vec::new();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for job events")
            .expect("hub dropped the connection");
        let done = event.is_terminal();
        events.push(event);
        if done {
            return events;
        }
    }
}

fn dir_len(dir: &std::path::Path) -> usize {
    std::fs::read_dir(dir).unwrap().count()
}

/// Input cleanup runs after the terminal event is sent.
async fn eventually_empty(dir: &std::path::Path) {
    for _ in 0..100 {
        if dir_len(dir) == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("{} still has files", dir.display());
}

#[tokio::test]
async fn health_reports_status_and_active_jobs() {
    let server = TestServer::new(true);
    let response = server
        .router()
        .oneshot(Request::get("/api/health").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response.into_body()).await;
    assert_eq!(json["status"], "ok");
    assert_eq!(json["ffmpeg"], false);
    assert_eq!(json["activeConversions"], 0);
}

#[tokio::test]
async fn history_lists_output_directory() {
    let server = TestServer::new(true);

    let response = server
        .router()
        .oneshot(Request::get("/api/history").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response.into_body()).await["history"], serde_json::json!([]));

    std::fs::write(server.output_dir().join("song.mp3"), b"ID3").unwrap();
    std::fs::write(server.output_dir().join(".temp-x.mp3"), b"partial").unwrap();

    let response = server
        .router()
        .oneshot(Request::get("/api/history").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let json = body_json(response.into_body()).await;
    let history = json["history"].as_array().unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0]["filename"], "song.mp3");
    assert_eq!(history[0]["size"], 3);
    assert_eq!(history[0]["downloadUrl"], "/output/song.mp3");
}

#[tokio::test]
async fn history_shows_temp_output_left_by_a_finished_job() {
    let server = TestServer::new(true);
    server.state.registry.register("x", ProcessHandle::new());
    std::fs::write(server.output_dir().join(".temp-x.mp3"), b"ID3").unwrap();

    let history = |server: &TestServer| {
        let router = server.router();
        async move {
            let response = router
                .oneshot(Request::get("/api/history").body(Body::empty()).unwrap())
                .await
                .unwrap();
            body_json(response.into_body()).await["history"].as_array().unwrap().clone()
        }
    };

    assert!(history(&server).await.is_empty());

    server.state.registry.unregister("x");
    let listed = history(&server).await;
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0]["filename"], ".temp-x.mp3");
    assert_eq!(listed[0]["downloadUrl"], "/output/.temp-x.mp3");
}

#[tokio::test]
async fn artifacts_are_served_under_output() {
    let server = TestServer::new(true);
    std::fs::write(server.output_dir().join("song.mp3"), b"ID3").unwrap();

    let response = server
        .router()
        .oneshot(Request::get("/output/song.mp3").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&bytes[..], b"ID3");
}

#[tokio::test]
async fn delete_missing_artifact_is_404() {
    let server = TestServer::new(true);
    std::fs::write(server.output_dir().join("keep.mp3"), b"ID3").unwrap();

    let response = server
        .router()
        .oneshot(Request::delete("/api/file/missing.mp3").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert!(body_json(response.into_body()).await["error"].is_string());
    assert_eq!(dir_len(&server.output_dir()), 1);
}

#[tokio::test]
async fn delete_removes_artifact() {
    let server = TestServer::new(true);
    std::fs::write(server.output_dir().join("gone.mp3"), b"ID3").unwrap();

    let response = server
        .router()
        .oneshot(Request::delete("/api/file/gone.mp3").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response.into_body()).await["success"], true);
    assert_eq!(dir_len(&server.output_dir()), 0);
}

#[tokio::test]
async fn delete_rejects_traversal() {
    let server = TestServer::new(true);
    let response = server
        .router()
        .oneshot(Request::delete("/api/file/..%2Fsecret.txt").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn unsupported_url_is_rejected_without_a_job() {
    let server = TestServer::new(true);
    let response = server
        .router()
        .oneshot(json_post(
            "/api/convert-bilibili",
            serde_json::json!({ "url": "https://www.youtube.com/watch?v=abc", "format": "mp3" }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(body_json(response.into_body()).await["error"].is_string());
    assert_eq!(server.downloader.calls.load(Ordering::SeqCst), 0);
    assert!(server.state.registry.is_empty());
    assert_eq!(dir_len(&server.upload_dir()), 0);
}

#[tokio::test]
async fn url_that_only_mentions_the_host_is_rejected() {
    let server = TestServer::new(true);
    for url in [
        "--exec=touch /tmp/pwned #bilibili.com",
        "https://evil.example/?x=bilibili.com",
        "https://bilibili.com.evil.example/video/BV1",
    ] {
        let response = server
            .router()
            .oneshot(json_post("/api/convert-bilibili", serde_json::json!({ "url": url })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{url}");
    }
    assert_eq!(server.downloader.calls.load(Ordering::SeqCst), 0);
    assert!(server.state.registry.is_empty());
}

#[tokio::test]
async fn missing_url_is_rejected() {
    let server = TestServer::new(true);
    let response = server
        .router()
        .oneshot(json_post("/api/convert-bilibili", serde_json::json!({ "format": "mp3" })))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn missing_downloader_returns_suggestion() {
    let server = TestServer::new(false);
    let response = server
        .router()
        .oneshot(json_post(
            "/api/convert-bilibili",
            serde_json::json!({ "url": "https://www.bilibili.com/video/BV1xx411c7mD" }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let json = body_json(response.into_body()).await;
    assert!(json["error"].is_string());
    assert!(json["suggestion"].as_str().unwrap().contains("yt-dlp"));
}

#[tokio::test]
async fn upload_without_video_is_rejected() {
    let server = TestServer::new(true);
    let response = server
        .router()
        .oneshot(multipart(None, &[("format", "mp3")]))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(body_json(response.into_body()).await["error"].is_string());
}

#[tokio::test]
async fn upload_with_unknown_format_is_rejected_and_discarded() {
    let server = TestServer::new(true);
    let response = server
        .router()
        .oneshot(multipart(Some(("clip.mp4", &b"not really a video"[..])), &[("format", "midi")]))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(dir_len(&server.upload_dir()), 0);
    assert!(server.state.registry.is_empty());
}

#[tokio::test]
async fn upload_with_unsupported_extension_is_rejected() {
    let server = TestServer::new(true);
    let response = server
        .router()
        .oneshot(multipart(Some(("notes.txt", &b"hello"[..])), &[]))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(dir_len(&server.upload_dir()), 0);
}

#[tokio::test]
async fn upload_runs_to_completion_on_its_connection() {
    let server = TestServer::new(true);
    let mut rx = server.state.hub.connect_as("client-a".to_string());

    let response = server
        .router()
        .oneshot(multipart(
            Some(("clip.mp4", &b"fake video bytes"[..])),
            &[("format", "mp3"), ("bitrate", "128k"), ("connectionId", "client-a")],
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response.into_body()).await;
    assert_eq!(json["success"], true);
    assert_eq!(json["originalName"], "clip.mp4");
    let task_id = json["taskId"].as_str().unwrap().to_string();

    let events = drain_job(&mut rx).await;
    assert!(matches!(events.first(), Some(ProgressEvent::ConversionStart { .. })));
    let progress: Vec<u8> = events
        .iter()
        .filter_map(|e| match e {
            ProgressEvent::ConversionProgress { progress, .. } => Some(*progress),
            _ => None,
        })
        .collect();
    assert!(!progress.is_empty());
    assert!(progress.windows(2).all(|w| w[0] < w[1]));

    match events.last() {
        Some(ProgressEvent::ConversionComplete { task_id: id, output_file }) => {
            assert_eq!(id, &task_id);
            assert_eq!(output_file, &format!("{task_id}.mp3"));
            assert!(server.output_dir().join(output_file).exists());
        }
        other => panic!("expected completion, got {other:?}"),
    }
    assert!(events.iter().all(|e| e.task_id() == Some(task_id.as_str())));
    eventually_empty(&server.upload_dir()).await;
    assert!(server.state.registry.is_empty());
}

#[tokio::test]
async fn concurrent_jobs_do_not_cross_deliver() {
    let server = TestServer::new(true);
    let mut rx_a = server.state.hub.connect_as("client-a".to_string());
    let mut rx_b = server.state.hub.connect_as("client-b".to_string());

    let (res_a, res_b) = tokio::join!(
        server.router().oneshot(multipart(
            Some(("a.mp4", &b"first"[..])),
            &[("format", "wav"), ("connectionId", "client-a")],
        )),
        server.router().oneshot(multipart(
            Some(("b.mkv", &b"second"[..])),
            &[("format", "flac"), ("socketId", "client-b")],
        )),
    );
    let task_a = body_json(res_a.unwrap().into_body()).await["taskId"]
        .as_str()
        .unwrap()
        .to_string();
    let task_b = body_json(res_b.unwrap().into_body()).await["taskId"]
        .as_str()
        .unwrap()
        .to_string();
    assert_ne!(task_a, task_b);

    let events_a = drain_job(&mut rx_a).await;
    let events_b = drain_job(&mut rx_b).await;
    assert!(events_a.iter().all(|e| e.task_id() == Some(task_a.as_str())));
    assert!(events_b.iter().all(|e| e.task_id() == Some(task_b.as_str())));
    assert_eq!(events_a.iter().filter(|e| e.is_terminal()).count(), 1);
    assert_eq!(events_b.iter().filter(|e| e.is_terminal()).count(), 1);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(rx_a.try_recv().is_err());
    assert!(rx_b.try_recv().is_err());
    assert!(server.output_dir().join(format!("{task_a}.wav")).exists());
    assert!(server.output_dir().join(format!("{task_b}.flac")).exists());
}

#[tokio::test]
async fn acquisition_downloads_then_converts() {
    let server = TestServer::new(true);
    let mut rx = server.state.hub.connect_as("client-a".to_string());

    let url = "https://www.bilibili.com/video/BV1xx411c7mD";
    let response = server
        .router()
        .oneshot(json_post(
            "/api/convert-bilibili",
            serde_json::json!({ "url": url, "format": "m4a", "sampleRate": 44100, "connectionId": "client-a" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response.into_body()).await;
    let task_id = json["taskId"].as_str().unwrap().to_string();
    assert!(task_id.starts_with("bilibili-"));
    assert_eq!(json["originalName"], format!("Bilibili video - {url}"));

    let events = drain_job(&mut rx).await;
    let progress: Vec<u8> = events
        .iter()
        .filter_map(|e| match e {
            ProgressEvent::ConversionProgress { progress, .. } => Some(*progress),
            _ => None,
        })
        .collect();
    assert_eq!(progress[..2], [10, 50]);
    assert!(progress.windows(2).all(|w| w[0] < w[1]));
    assert!(matches!(
        events.last(),
        Some(ProgressEvent::ConversionComplete { output_file, .. }) if output_file == &format!("{task_id}.m4a")
    ));
    eventually_empty(&server.upload_dir()).await;
}

use anyhow::Context;
use axum::{
    extract::{multipart::Field, DefaultBodyLimit, Multipart, Path, State},
    http::HeaderValue,
    routing::{delete, get, post},
    Json, Router,
};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{
    collections::HashMap,
    io,
    path::{Path as FsPath, PathBuf},
    sync::Arc,
};
use tokio::io::AsyncWriteExt;
use tokio_util::io::StreamReader;
use tower_http::{
    cors::{Any, CorsLayer},
    services::ServeDir,
    trace::TraceLayer,
};
use uuid::Uuid;

use crate::{
    acquire::AcquisitionOrchestrator,
    channel::{ConnectionId, ProgressHub},
    config::Config,
    convert::{ConversionOrchestrator, ConversionRequest},
    error::{AppError, AppResult},
    finalize::RealFs,
    job::{Job, JobReporter},
    library::{self, ArtifactEntry},
    registry::JobRegistry,
    tools::{AudioFormat, ConversionOptions, Downloader, Transcoder},
    ws,
};

pub const VIDEO_EXTENSIONS: &[&str] = &[
    "mp4", "avi", "mov", "mkv", "flv", "wmv", "webm", "m4v", "3gp", "mpeg", "mpg",
];

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub registry: JobRegistry,
    pub hub: ProgressHub,
    pub converter: Arc<ConversionOrchestrator>,
    pub acquirer: Arc<AcquisitionOrchestrator>,
    pub ffmpeg: bool,
}

impl AppState {
    pub fn new(
        config: Config,
        transcoder: Arc<dyn Transcoder>,
        downloader: Arc<dyn Downloader>,
        ffmpeg: bool,
    ) -> Self {
        let registry = JobRegistry::new();
        let converter = Arc::new(ConversionOrchestrator::new(
            transcoder,
            registry.clone(),
            config.output_strategy,
            Arc::new(RealFs),
        ));
        let acquirer = Arc::new(AcquisitionOrchestrator::new(
            downloader,
            converter.clone(),
            registry.clone(),
            config.upload_dir.clone(),
            config.output_dir.clone(),
        ));
        Self {
            config: Arc::new(config),
            registry,
            hub: ProgressHub::new(),
            converter,
            acquirer,
            ffmpeg,
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    let cors = match state.config.cors_origin.as_deref() {
        Some(origin) => match origin.parse::<HeaderValue>() {
            Ok(origin) => CorsLayer::new()
                .allow_origin(origin)
                .allow_methods(Any)
                .allow_headers(Any),
            Err(_) => {
                tracing::warn!(origin, "invalid CORS_ORIGIN, allowing any origin");
                CorsLayer::permissive()
            }
        },
        None => CorsLayer::permissive(),
    };

    Router::new()
        .route("/api/convert", post(submit_upload))
        .route("/api/convert-bilibili", post(submit_acquisition))
        .route("/api/history", get(history))
        .route("/api/file/{filename}", delete(delete_file))
        .route("/api/health", get(health))
        .route("/ws", get(ws::progress_ws))
        .nest_service("/output", ServeDir::new(&state.config.output_dir))
        .layer(DefaultBodyLimit::max(state.config.max_upload_bytes))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SubmitResponse {
    success: bool,
    message: &'static str,
    task_id: String,
    original_name: String,
}

/// Form and JSON fields arrive as strings or numbers; blanks mean unset.
fn text_of(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn options_from(bitrate: Option<String>, sample_rate: Option<String>, channels: Option<String>) -> ConversionOptions {
    let mut options = ConversionOptions::default();
    if let Some(bitrate) = bitrate {
        options.bitrate = bitrate;
    }
    options.sample_rate = sample_rate.and_then(|v| v.parse().ok());
    options.channels = channels.and_then(|v| v.parse().ok());
    options
}

fn format_from(value: Option<String>) -> AppResult<AudioFormat> {
    match value {
        None => Ok(AudioFormat::Mp3),
        Some(name) => AudioFormat::parse(&name)
            .ok_or_else(|| AppError::BadRequest(format!("unsupported output format: {name}"))),
    }
}

fn upload_extension(file_name: &str) -> Option<String> {
    let ext = FsPath::new(file_name).extension()?.to_str()?.to_ascii_lowercase();
    VIDEO_EXTENSIONS.contains(&ext.as_str()).then_some(ext)
}

async fn save_upload(field: Field<'_>, path: &FsPath) -> anyhow::Result<()> {
    let body = field.map(|chunk| chunk.map_err(io::Error::other));
    let mut reader = std::pin::pin!(StreamReader::new(body));
    let mut file = tokio::fs::File::create(path)
        .await
        .with_context(|| format!("failed to create upload at {}", path.display()))?;
    tokio::io::copy(&mut reader, &mut file)
        .await
        .context("failed to receive upload")?;
    file.flush().await?;
    Ok(())
}

struct Upload {
    task_id: String,
    path: PathBuf,
    original_name: String,
}

async fn submit_upload(State(state): State<AppState>, mut multipart: Multipart) -> AppResult<Json<SubmitResponse>> {
    let mut upload: Option<Upload> = None;
    let mut fields: HashMap<String, String> = HashMap::new();

    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(err) => {
                discard_upload(upload.as_ref()).await;
                return Err(AppError::BadRequest(format!("invalid upload: {err}")));
            }
        };
        let name = field.name().unwrap_or_default().to_string();

        if name == "video" && upload.is_none() {
            let original_name = field.file_name().unwrap_or_default().to_string();
            let Some(ext) = upload_extension(&original_name) else {
                return Err(AppError::BadRequest(format!(
                    "unsupported video file type, expected one of: {}",
                    VIDEO_EXTENSIONS.join(", ")
                )));
            };
            let task_id = Uuid::new_v4().to_string();
            let path = state.config.upload_dir.join(format!("{task_id}.{ext}"));
            let saved = save_upload(field, &path).await;
            upload = Some(Upload {
                task_id,
                path,
                original_name,
            });
            if let Err(err) = saved {
                discard_upload(upload.as_ref()).await;
                return Err(AppError::BadRequest(format!("{err:#}")));
            }
        } else if let Ok(text) = field.text().await {
            if !text.trim().is_empty() {
                fields.insert(name, text.trim().to_string());
            }
        }
    }

    let Some(upload) = upload else {
        return Err(AppError::BadRequest("no video file found in upload".to_string()));
    };

    let format = match format_from(fields.remove("format")) {
        Ok(format) => format,
        Err(err) => {
            discard_upload(Some(&upload)).await;
            return Err(err);
        }
    };
    let options = options_from(
        fields.remove("bitrate"),
        fields.remove("sampleRate"),
        fields.remove("channels"),
    );
    let connection: Option<ConnectionId> = fields
        .remove("connectionId")
        .or_else(|| fields.remove("socketId"));

    let request = ConversionRequest {
        input: upload.path.clone(),
        output: state
            .config
            .output_dir
            .join(format!("{}.{}", upload.task_id, format.extension())),
        format,
        options,
    };

    tracing::info!(
        task_id = %upload.task_id,
        original = %upload.original_name,
        format = format.extension(),
        "conversion accepted"
    );

    let converter = state.converter.clone();
    let mut reporter = JobReporter::new(Job::new(&upload.task_id), state.hub.clone(), connection);
    tokio::spawn(async move {
        let _ = converter.convert(request, &mut reporter).await;
    });

    Ok(Json(SubmitResponse {
        success: true,
        message: "conversion started",
        task_id: upload.task_id,
        original_name: upload.original_name,
    }))
}

async fn discard_upload(upload: Option<&Upload>) {
    if let Some(upload) = upload {
        if let Err(err) = tokio::fs::remove_file(&upload.path).await {
            tracing::warn!(path = %upload.path.display(), "failed to remove rejected upload: {err}");
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AcquisitionBody {
    url: Option<String>,
    format: Option<Value>,
    bitrate: Option<Value>,
    sample_rate: Option<Value>,
    channels: Option<Value>,
    #[serde(alias = "socketId")]
    connection_id: Option<String>,
}

async fn submit_acquisition(
    State(state): State<AppState>,
    Json(body): Json<AcquisitionBody>,
) -> AppResult<Json<SubmitResponse>> {
    let url = body.url.as_deref().map(str::trim).unwrap_or_default();
    if url.is_empty() {
        return Err(AppError::BadRequest("no video URL provided".to_string()));
    }
    let format = format_from(text_of(body.format.as_ref()))?;
    let options = options_from(
        text_of(body.bitrate.as_ref()),
        text_of(body.sample_rate.as_ref()),
        text_of(body.channels.as_ref()),
    );

    let prepared = state.acquirer.prepare(url).await?;
    let task_id = prepared.job_id.clone();
    let original_name = format!("Bilibili video - {}", prepared.url);
    tracing::info!(task_id = %task_id, url = %prepared.url, "acquisition accepted");

    let acquirer = state.acquirer.clone();
    let mut reporter = JobReporter::new(Job::new(&task_id), state.hub.clone(), body.connection_id);
    tokio::spawn(async move {
        let _ = acquirer.run(prepared, format, options, &mut reporter).await;
    });

    Ok(Json(SubmitResponse {
        success: true,
        message: "download started",
        task_id,
        original_name,
    }))
}

#[derive(Serialize)]
struct HistoryResponse {
    history: Vec<ArtifactEntry>,
}

async fn history(State(state): State<AppState>) -> AppResult<Json<HistoryResponse>> {
    let output_dir = state.config.output_dir.clone();
    let registry = state.registry.clone();
    let history = tokio::task::spawn_blocking(move || {
        library::list_artifacts(&output_dir, |job_id| registry.lookup(job_id).is_some())
    })
        .await
        .context("history task failed")??;
    Ok(Json(HistoryResponse { history }))
}

async fn delete_file(State(state): State<AppState>, Path(filename): Path<String>) -> AppResult<Json<Value>> {
    let output_dir = state.config.output_dir.clone();
    let name = filename.clone();
    tokio::task::spawn_blocking(move || library::delete_artifact(&output_dir, &name))
        .await
        .context("delete task failed")??;
    tracing::info!(filename = %filename, "artifact deleted");
    Ok(Json(serde_json::json!({ "success": true, "message": "file deleted" })))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: &'static str,
    ffmpeg: bool,
    active_conversions: usize,
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        ffmpeg: state.ffmpeg,
        active_conversions: state.registry.len(),
    })
}

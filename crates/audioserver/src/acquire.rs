//! Fetches a remote video with the downloader and hands it to conversion.

use crate::{
    convert::{ConversionOrchestrator, ConversionRequest},
    failure::{is_certificate_failure, JobFailure, DOWNLOADER_INSTALL_GUIDE},
    job::JobReporter,
    registry::{JobRegistry, ProcessHandle},
    tools::{AudioFormat, ConversionOptions, DownloadRequest, Downloader, ToolError},
};
use rand::Rng;
use std::{
    fs, io,
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio_util::sync::CancellationToken;
use url::Url;

/// Hosts accepted for acquisition, matched exactly or as a parent domain.
pub const SUPPORTED_HOSTS: &[&str] = &["bilibili.com", "b23.tv"];
pub const JOB_PREFIX: &str = "bilibili";
pub const DOWNLOAD_STARTED_PROGRESS: u8 = 10;
pub const DOWNLOAD_FINISHED_PROGRESS: u8 = 50;

const SUFFIX_CHARSET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
const SUFFIX_LEN: usize = 9;

/// An absolute http(s) URL whose host is, or is below, a supported host.
pub fn is_supported_url(url: &str) -> bool {
    let Ok(url) = Url::parse(url) else {
        return false;
    };
    if !matches!(url.scheme(), "http" | "https") {
        return false;
    }
    let Some(host) = url.host_str() else {
        return false;
    };
    let host = host.to_ascii_lowercase();
    SUPPORTED_HOSTS
        .iter()
        .any(|supported| host == *supported || host.ends_with(&format!(".{supported}")))
}

/// `bilibili-<unix millis>-<9 base36 chars>`.
pub fn generate_job_id() -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..SUFFIX_LEN)
        .map(|_| SUFFIX_CHARSET[rng.gen_range(0..SUFFIX_CHARSET.len())] as char)
        .collect();
    format!("{JOB_PREFIX}-{}-{suffix}", chrono::Utc::now().timestamp_millis())
}

fn files_with_prefix(dir: &Path, prefix: &str) -> io::Result<Vec<(PathBuf, u64)>> {
    let mut found = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_name().to_string_lossy().starts_with(prefix) {
            continue;
        }
        let meta = entry.metadata()?;
        if meta.is_file() {
            found.push((entry.path(), meta.len()));
        }
    }
    Ok(found)
}

/// Picks the largest file in `dir` whose name starts with `prefix`.
///
/// The downloader chooses the extension and may leave sidecars (thumbnails,
/// metadata) next to the media file; the media file is the largest.
pub fn locate_artifact(dir: &Path, prefix: &str) -> io::Result<Option<PathBuf>> {
    Ok(files_with_prefix(dir, prefix)?
        .into_iter()
        .max_by_key(|(_, size)| *size)
        .map(|(path, _)| path))
}

#[derive(Debug, thiserror::Error)]
pub enum AcquisitionError {
    #[error("only Bilibili video links are supported")]
    UnsupportedUrl,
    #[error("{}", DOWNLOADER_INSTALL_GUIDE)]
    DownloaderMissing,
}

/// A validated acquisition: the URL is supported and a downloader exists.
#[derive(Debug, Clone)]
pub struct PreparedAcquisition {
    pub job_id: String,
    pub url: String,
    pub program: String,
}

pub struct AcquisitionOrchestrator {
    downloader: Arc<dyn Downloader>,
    converter: Arc<ConversionOrchestrator>,
    registry: JobRegistry,
    upload_dir: PathBuf,
    output_dir: PathBuf,
}

impl AcquisitionOrchestrator {
    pub fn new(
        downloader: Arc<dyn Downloader>,
        converter: Arc<ConversionOrchestrator>,
        registry: JobRegistry,
        upload_dir: PathBuf,
        output_dir: PathBuf,
    ) -> Self {
        Self {
            downloader,
            converter,
            registry,
            upload_dir,
            output_dir,
        }
    }

    /// Checks everything that must hold before a job exists. Nothing is
    /// spawned for an unsupported URL.
    pub async fn prepare(&self, url: &str) -> Result<PreparedAcquisition, AcquisitionError> {
        let url = url.trim();
        if !is_supported_url(url) {
            return Err(AcquisitionError::UnsupportedUrl);
        }
        let program = self
            .downloader
            .locate()
            .await
            .ok_or(AcquisitionError::DownloaderMissing)?;
        Ok(PreparedAcquisition {
            job_id: generate_job_id(),
            url: url.to_string(),
            program,
        })
    }

    /// Downloads, locates the media file and converts it under the same job id.
    pub async fn run(
        &self,
        prepared: PreparedAcquisition,
        format: AudioFormat,
        options: ConversionOptions,
        reporter: &mut JobReporter,
    ) -> Result<PathBuf, JobFailure> {
        let job_id = prepared.job_id.clone();
        reporter.started("download started");
        reporter.progress_to(DOWNLOAD_STARTED_PROGRESS);

        let handle = ProcessHandle::new();
        self.registry.register(&job_id, handle.clone());
        let template = self.upload_dir.join(format!("{job_id}.%(ext)s"));
        tracing::info!(task_id = %job_id, url = %prepared.url, program = %prepared.program, "starting download");

        let downloaded = self.download(&prepared, template, handle.token()).await;
        self.registry.unregister(&job_id);

        let input = match downloaded.and_then(|()| self.locate(&job_id)) {
            Ok(input) => input,
            Err(failure) => {
                tracing::error!(task_id = %job_id, "download failed: {}", failure.original);
                reporter.failed(failure.clone());
                self.remove_leftovers(&job_id);
                return Err(failure);
            }
        };

        tracing::info!(task_id = %job_id, input = %input.display(), "download complete");
        reporter.progress_to(DOWNLOAD_FINISHED_PROGRESS);
        reporter
            .job_mut()
            .rescale(DOWNLOAD_FINISHED_PROGRESS, 100 - DOWNLOAD_FINISHED_PROGRESS);

        let request = ConversionRequest {
            input,
            output: self.output_dir.join(format!("{job_id}.{}", format.extension())),
            format,
            options,
        };
        let result = self.converter.convert(request, reporter).await;
        self.remove_leftovers(&job_id);
        result
    }

    async fn download(
        &self,
        prepared: &PreparedAcquisition,
        template: PathBuf,
        cancel: CancellationToken,
    ) -> Result<(), JobFailure> {
        let mut request = DownloadRequest {
            url: prepared.url.clone(),
            output_template: template,
            skip_certificate_check: false,
        };

        let mut result = self
            .downloader
            .download(&prepared.program, &request, cancel.clone())
            .await;
        if let Err(err) = &result {
            if is_certificate_failure(&err.to_string()) {
                tracing::warn!(task_id = %prepared.job_id, "certificate verification failed, retrying without it");
                request.skip_certificate_check = true;
                result = self.downloader.download(&prepared.program, &request, cancel).await;
            }
        }

        match result {
            Ok(output) => {
                if !output.stderr.trim().is_empty() {
                    tracing::debug!(task_id = %prepared.job_id, "downloader stderr: {}", output.stderr.trim());
                }
                if !output.stdout.trim().is_empty() {
                    tracing::debug!(task_id = %prepared.job_id, "downloader stdout: {}", output.stdout.trim());
                }
                Ok(())
            }
            Err(err @ ToolError::Spawn { .. }) => Err(JobFailure::download(format!(
                "{err}\n{DOWNLOADER_INSTALL_GUIDE}"
            ))),
            Err(err) => Err(JobFailure::download(err.to_string())),
        }
    }

    fn locate(&self, job_id: &str) -> Result<PathBuf, JobFailure> {
        match locate_artifact(&self.upload_dir, job_id) {
            Ok(Some(path)) => Ok(path),
            Ok(None) => Err(JobFailure::download("downloaded file not found")),
            Err(err) => Err(JobFailure::download(format!(
                "unable to scan upload directory: {err}"
            ))),
        }
    }

    /// Removes partial downloads and sidecars. Best effort.
    fn remove_leftovers(&self, job_id: &str) {
        let Ok(files) = files_with_prefix(&self.upload_dir, job_id) else {
            return;
        };
        for (path, _) in files {
            if let Err(err) = fs::remove_file(&path) {
                tracing::warn!(task_id = %job_id, path = %path.display(), "failed to remove leftover file: {err}");
            }
        }
    }
}

//! yt-dlp (or the legacy youtube-dl) as the downloading tool.

use super::{DownloadOutput, DownloadRequest, Downloader, StderrTail, ToolError};
use async_trait::async_trait;
use std::{process::Stdio, time::Duration};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_CANDIDATES: &[&str] = &["yt-dlp", "youtube-dl"];
pub const FORMAT_SELECTOR: &str = "bestvideo[ext=mp4]+bestaudio[ext=m4a]/best[ext=mp4]/best";
pub const USER_AGENT: &str =
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(600);

pub fn build_args(request: &DownloadRequest) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "-f".into(),
        FORMAT_SELECTOR.into(),
        "-o".into(),
        request.output_template.to_string_lossy().into_owned(),
        "--no-playlist".into(),
    ];
    if request.skip_certificate_check {
        args.push("--no-check-certificate".into());
    }
    args.extend(["--user-agent".to_string(), USER_AGENT.to_string()]);
    args.extend(["--".to_string(), request.url.clone()]);
    args
}

#[derive(Debug, Clone)]
pub struct YtDlp {
    candidates: Vec<String>,
    timeout: Duration,
}

impl Default for YtDlp {
    fn default() -> Self {
        Self::new(DEFAULT_CANDIDATES.iter().map(|c| c.to_string()).collect(), DEFAULT_TIMEOUT)
    }
}

impl YtDlp {
    /// Candidates are probed in order; the first that answers `--version` wins.
    pub fn new(candidates: Vec<String>, timeout: Duration) -> Self {
        Self { candidates, timeout }
    }
}

#[async_trait]
impl Downloader for YtDlp {
    async fn locate(&self) -> Option<String> {
        for candidate in &self.candidates {
            let output = Command::new(candidate)
                .arg("--version")
                .stdin(Stdio::null())
                .output()
                .await;
            match output {
                Ok(out) if out.status.success() => {
                    let version = String::from_utf8_lossy(&out.stdout).trim().to_string();
                    tracing::debug!(program = %candidate, %version, "found downloader");
                    return Some(candidate.clone());
                }
                _ => tracing::debug!(program = %candidate, "downloader not available"),
            }
        }
        None
    }

    async fn download(
        &self,
        program: &str,
        request: &DownloadRequest,
        cancel: CancellationToken,
    ) -> Result<DownloadOutput, ToolError> {
        let args = build_args(request);
        tracing::info!("running {program} {}", args.join(" "));

        let child = Command::new(program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ToolError::Spawn {
                tool: program.to_string(),
                source,
            })?;

        // Dropping the wait future drops the child, which kills it.
        let output = tokio::select! {
            _ = cancel.cancelled() => {
                return Err(ToolError::Cancelled { tool: program.to_string() });
            }
            waited = tokio::time::timeout(self.timeout, child.wait_with_output()) => match waited {
                Ok(output) => output?,
                Err(_) => {
                    return Err(ToolError::TimedOut {
                        tool: program.to_string(),
                        secs: self.timeout.as_secs(),
                    });
                }
            },
        };

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        if output.status.success() {
            return Ok(DownloadOutput { stdout, stderr });
        }

        let mut tail = StderrTail::default();
        tail.extend_from(&stderr);
        Err(ToolError::Exited {
            tool: program.to_string(),
            code: output.status.code().unwrap_or(-1),
            stderr: tail.joined(),
        })
    }
}

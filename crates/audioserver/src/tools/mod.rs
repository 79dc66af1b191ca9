//! Seams to the external tools.
//!
//! The orchestrators only talk to [`Transcoder`] and [`Downloader`]; the
//! process-backed implementations live in [`ffmpeg`] and [`ytdlp`].

pub mod console;
pub mod ffmpeg;
pub mod ytdlp;

use async_trait::async_trait;
use std::{collections::VecDeque, io, path::PathBuf};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub use ffmpeg::{AudioFormat, ConversionOptions, Ffmpeg};
pub use ytdlp::YtDlp;

const STDERR_TAIL_LINES: usize = 20;

#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("failed to spawn {tool}: {source}")]
    Spawn {
        tool: String,
        #[source]
        source: io::Error,
    },

    #[error("{tool} exited with code {code}: {stderr}")]
    Exited { tool: String, code: i32, stderr: String },

    #[error("{tool} was killed with signal SIGKILL")]
    Cancelled { tool: String },

    #[error("{tool} timed out after {secs}s")]
    TimedOut { tool: String, secs: u64 },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Lifecycle signals a tool reports while it runs.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolSignal {
    Started { command_line: String },
    Progress { percent: Option<f64>, timemark: Option<String> },
}

/// A fully constructed transcoder call.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub input: PathBuf,
    /// Where the tool writes. May differ from the final artifact path.
    pub target: PathBuf,
    pub args: Vec<String>,
}

#[async_trait]
pub trait Transcoder: Send + Sync {
    /// Runs the invocation to completion. Signals are sent while it runs;
    /// `Ok` is the end signal, `Err` the error signal.
    async fn transcode(
        &self,
        invocation: &Invocation,
        signals: mpsc::UnboundedSender<ToolSignal>,
        cancel: CancellationToken,
    ) -> Result<(), ToolError>;
}

#[derive(Debug, Clone)]
pub struct DownloadRequest {
    pub url: String,
    /// Output template; the tool substitutes the extension.
    pub output_template: PathBuf,
    pub skip_certificate_check: bool,
}

#[derive(Debug, Clone, Default)]
pub struct DownloadOutput {
    pub stdout: String,
    pub stderr: String,
}

#[async_trait]
pub trait Downloader: Send + Sync {
    /// Returns the program to run, or `None` when no downloader is installed.
    async fn locate(&self) -> Option<String>;

    async fn download(
        &self,
        program: &str,
        request: &DownloadRequest,
        cancel: CancellationToken,
    ) -> Result<DownloadOutput, ToolError>;
}

/// Keeps the last lines of a tool's stderr for error reports.
#[derive(Debug, Default)]
pub(crate) struct StderrTail {
    lines: VecDeque<String>,
}

impl StderrTail {
    pub(crate) fn push(&mut self, line: &str) {
        if self.lines.len() == STDERR_TAIL_LINES {
            self.lines.pop_front();
        }
        self.lines.push_back(line.to_string());
    }

    pub(crate) fn extend_from(&mut self, text: &str) {
        text.lines().filter(|l| !l.trim().is_empty()).for_each(|l| self.push(l));
    }

    pub(crate) fn joined(&self) -> String {
        self.lines.iter().map(String::as_str).collect::<Vec<_>>().join("\n")
    }
}

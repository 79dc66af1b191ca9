//! Terminal job errors and the classification of external tool output.
//!
//! The substrings matched here are a contract with the text ffmpeg and yt-dlp
//! print; update them together with the tools.

use crate::paths::DiagnosticsReport;
use serde::Serialize;

/// ffmpeg output when the source has no stream the audio-only output can map.
pub const NO_AUDIO_STREAM_SIGNATURES: &[&str] =
    &["does not contain any stream", "Output file does not contain"];

/// yt-dlp output when the TLS peer certificate cannot be verified.
pub const CERTIFICATE_FAILURE_SIGNATURE: &str = "CERTIFICATE_VERIFY_FAILED";

const NO_AUDIO_STREAM_MESSAGE: &str = "The input file has no audio stream.\n\n\
The video only contains a video track, so there is nothing to convert to audio.\n\n\
Solutions:\n\
1. Use a video file that contains an audio track\n\
2. Inspect the file with `ffprobe -i <file>` to list its streams\n\
3. If the file really has no audio, it cannot be converted";

pub const NO_AUDIO_STREAM_SOLUTION: &str =
    "Use a video file with an audio track, or inspect the file with ffprobe first";

pub const DOWNLOAD_SOLUTION: &str =
    "Check that the URL is correct and the video is reachable, and that yt-dlp is installed.";

pub const DOWNLOADER_INSTALL_GUIDE: &str = "yt-dlp or youtube-dl was not found. Install it first:\n\
macOS: brew install yt-dlp\n\
Linux: pip install yt-dlp\n\
Windows: pip install yt-dlp";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NoAudioStream,
    #[serde(rename = "download_error")]
    Download,
    Filesystem,
    Precondition,
    Unknown,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoAudioStream => "no_audio_stream",
            Self::Download => "download_error",
            Self::Filesystem => "filesystem",
            Self::Precondition => "precondition",
            Self::Unknown => "unknown",
        }
    }
}

pub fn classify_tool_failure(text: &str) -> ErrorKind {
    if NO_AUDIO_STREAM_SIGNATURES.iter().any(|sig| text.contains(sig)) {
        ErrorKind::NoAudioStream
    } else {
        ErrorKind::Unknown
    }
}

pub fn is_certificate_failure(text: &str) -> bool {
    text.contains(CERTIFICATE_FAILURE_SIGNATURE)
}

/// Everything a client needs to render a failed job.
#[derive(Debug, Clone)]
pub struct JobFailure {
    pub kind: ErrorKind,
    pub message: String,
    pub original: String,
    pub solution: String,
    pub details: Option<DiagnosticsReport>,
    pub input_file: Option<String>,
}

impl JobFailure {
    /// Builds the failure for a transcoder error, classified from its text.
    pub fn from_tool_output(original: impl Into<String>) -> Self {
        let original = original.into();
        match classify_tool_failure(&original) {
            ErrorKind::NoAudioStream => Self {
                kind: ErrorKind::NoAudioStream,
                message: NO_AUDIO_STREAM_MESSAGE.to_string(),
                solution: NO_AUDIO_STREAM_SOLUTION.to_string(),
                original,
                details: None,
                input_file: None,
            },
            kind => Self {
                kind,
                message: original.clone(),
                solution: String::new(),
                original,
                details: None,
                input_file: None,
            },
        }
    }

    pub fn download(original: impl Into<String>) -> Self {
        let original = original.into();
        Self {
            kind: ErrorKind::Download,
            message: format!("video download failed: {original}"),
            solution: DOWNLOAD_SOLUTION.to_string(),
            original,
            details: None,
            input_file: None,
        }
    }

    pub fn precondition(message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            kind: ErrorKind::Precondition,
            original: message.clone(),
            message,
            solution: String::new(),
            details: None,
            input_file: None,
        }
    }

    pub fn filesystem(message: impl Into<String>, solution: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            kind: ErrorKind::Filesystem,
            original: message.clone(),
            message,
            solution: solution.into(),
            details: None,
            input_file: None,
        }
    }

    pub fn with_details(mut self, details: DiagnosticsReport) -> Self {
        self.details = Some(details);
        self
    }

    pub fn with_input_file(mut self, input: impl Into<String>) -> Self {
        self.input_file = Some(input.into());
        self
    }
}

//! ffmpeg as the transcoding tool.

use super::{console::ConsoleLineCodec, Invocation, StderrTail, ToolError, ToolSignal, Transcoder};
use async_trait::async_trait;
use futures::StreamExt;
use serde::Deserialize;
use std::{path::Path, process::Stdio};
use tokio::{process::Command, sync::mpsc};
use tokio_util::{codec::FramedRead, sync::CancellationToken};

const TOOL: &str = "ffmpeg";
pub const DEFAULT_BITRATE: &str = "192k";
pub const FALLBACK_CODEC: &str = "libmp3lame";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioFormat {
    Mp3,
    Aac,
    Wav,
    Ogg,
    Flac,
    M4a,
}

impl AudioFormat {
    pub const ALL: [AudioFormat; 6] = [
        Self::Mp3,
        Self::Aac,
        Self::Wav,
        Self::Ogg,
        Self::Flac,
        Self::M4a,
    ];

    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "mp3" => Some(Self::Mp3),
            "aac" => Some(Self::Aac),
            "wav" => Some(Self::Wav),
            "ogg" => Some(Self::Ogg),
            "flac" => Some(Self::Flac),
            "m4a" => Some(Self::M4a),
            _ => None,
        }
    }

    pub fn codec(&self) -> &'static str {
        match self {
            Self::Mp3 => "libmp3lame",
            Self::Aac => "aac",
            Self::Wav => "pcm_s16le",
            Self::Ogg => "libvorbis",
            Self::Flac => "flac",
            Self::M4a => "aac",
        }
    }

    /// ffmpeg muxer passed to `-f`.
    pub fn muxer(&self) -> &'static str {
        match self {
            Self::Mp3 => "mp3",
            Self::Aac => "adts",
            Self::Wav => "wav",
            Self::Ogg => "ogg",
            Self::Flac => "flac",
            Self::M4a => "ipod",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            Self::Mp3 => "mp3",
            Self::Aac => "aac",
            Self::Wav => "wav",
            Self::Ogg => "ogg",
            Self::Flac => "flac",
            Self::M4a => "m4a",
        }
    }
}

/// Codec for a format name; unknown names fall back to mp3.
pub fn audio_codec(format: &str) -> &'static str {
    AudioFormat::parse(format).map_or(FALLBACK_CODEC, |f| f.codec())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversionOptions {
    pub bitrate: String,
    pub sample_rate: Option<u32>,
    pub channels: Option<u8>,
}

impl Default for ConversionOptions {
    fn default() -> Self {
        Self {
            bitrate: DEFAULT_BITRATE.to_string(),
            sample_rate: None,
            channels: None,
        }
    }
}

pub fn build_args(
    input: &Path,
    target: &Path,
    format: AudioFormat,
    options: &ConversionOptions,
) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "-hide_banner".into(),
        "-loglevel".into(),
        "info".into(),
        "-y".into(),
        "-i".into(),
        input.to_string_lossy().into_owned(),
        "-vn".into(),
        "-c:a".into(),
        format.codec().into(),
        "-b:a".into(),
        options.bitrate.clone(),
    ];
    if let Some(rate) = options.sample_rate {
        args.extend(["-ar".to_string(), rate.to_string()]);
    }
    if let Some(channels) = options.channels {
        args.extend(["-ac".to_string(), channels.to_string()]);
    }
    args.extend(["-f".to_string(), format.muxer().to_string()]);
    args.push(target.to_string_lossy().into_owned());
    args
}

/// Parse `HH:MM:SS.ms` to seconds.
pub fn parse_clock(value: &str) -> Option<f64> {
    let mut parts = value.trim().split(':');
    let hours: f64 = parts.next()?.parse().ok()?;
    let minutes: f64 = parts.next()?.parse().ok()?;
    let seconds: f64 = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some(hours * 3600.0 + minutes * 60.0 + seconds)
}

fn field<'a>(line: &'a str, key: &str) -> Option<&'a str> {
    let start = line.find(key)? + key.len();
    let rest = line[start..].trim_start();
    let end = rest.find([' ', ',']).unwrap_or(rest.len());
    Some(&rest[..end])
}

/// Turns ffmpeg's console output into progress signals.
#[derive(Debug, Default)]
pub struct ProgressParser {
    duration: Option<f64>,
}

impl ProgressParser {
    pub fn duration(&self) -> Option<f64> {
        self.duration
    }

    /// Returns a progress signal for stats lines, `None` for everything else.
    pub fn feed(&mut self, line: &str) -> Option<ToolSignal> {
        if self.duration.is_none() && line.trim_start().starts_with("Duration:") {
            self.duration = field(line, "Duration:").and_then(parse_clock).filter(|d| *d > 0.0);
            return None;
        }
        if !line.contains("time=") || !(line.contains("size=") || line.contains("frame=")) {
            return None;
        }
        let timemark = field(line, "time=")?;
        let elapsed = parse_clock(timemark);
        let percent = match (elapsed, self.duration) {
            (Some(elapsed), Some(total)) => Some(elapsed / total * 100.0),
            _ => None,
        };
        Some(ToolSignal::Progress {
            percent,
            timemark: Some(timemark.to_string()),
        })
    }
}

#[derive(Debug, Clone)]
pub struct Ffmpeg {
    program: String,
}

impl Ffmpeg {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn detect(&self) -> bool {
        let output = std::process::Command::new(&self.program)
            .arg("-version")
            .output();

        match output {
            Ok(out) => out.status.success(),
            Err(_) => false,
        }
    }
}

#[async_trait]
impl Transcoder for Ffmpeg {
    async fn transcode(
        &self,
        invocation: &Invocation,
        signals: mpsc::UnboundedSender<ToolSignal>,
        cancel: CancellationToken,
    ) -> Result<(), ToolError> {
        let mut child = Command::new(&self.program)
            .args(&invocation.args)
            .env("LC_ALL", "C")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ToolError::Spawn {
                tool: TOOL.to_string(),
                source,
            })?;

        let command_line = format!("{} {}", self.program, invocation.args.join(" "));
        let _ = signals.send(ToolSignal::Started { command_line });

        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| std::io::Error::other("ffmpeg stderr was not captured"))?;
        let mut lines = FramedRead::new(stderr, ConsoleLineCodec);
        let mut parser = ProgressParser::default();
        let mut tail = StderrTail::default();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = child.kill().await;
                    return Err(ToolError::Cancelled { tool: TOOL.to_string() });
                }
                line = lines.next() => match line {
                    Some(Ok(line)) => match parser.feed(&line) {
                        Some(progress) => {
                            let _ = signals.send(progress);
                        }
                        None => {
                            tracing::debug!(target: "ffmpeg", "{line}");
                            tail.push(&line);
                        }
                    },
                    Some(Err(err)) => {
                        tracing::warn!("error reading ffmpeg output: {err}");
                        break;
                    }
                    None => break,
                }
            }
        }

        // The pipe must keep draining until exit or ffmpeg blocks on a full buffer.
        let mut rest = lines.into_inner();
        let status = tokio::select! {
            _ = cancel.cancelled() => {
                let _ = child.kill().await;
                return Err(ToolError::Cancelled { tool: TOOL.to_string() });
            }
            status = async {
                if let Err(err) = tokio::io::copy(&mut rest, &mut tokio::io::sink()).await {
                    tracing::debug!("discarding ffmpeg output failed: {err}");
                }
                child.wait().await
            } => status?,
        };

        if status.success() {
            Ok(())
        } else {
            Err(ToolError::Exited {
                tool: TOOL.to_string(),
                code: status.code().unwrap_or(-1),
                stderr: tail.joined(),
            })
        }
    }
}

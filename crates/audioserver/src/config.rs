use anyhow::Context;
use std::{net::IpAddr, path::PathBuf, time::Duration};

use crate::{finalize::OutputStrategy, paths::ensure_dir, tools::ytdlp};

#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: PathBuf,
    pub upload_dir: PathBuf,
    pub output_dir: PathBuf,
    pub host: IpAddr,
    pub port: u16,
    pub ffmpeg_path: String,
    /// Downloader binaries probed in order.
    pub downloader_candidates: Vec<String>,
    pub max_upload_bytes: usize,
    pub cors_origin: Option<String>,
    pub output_strategy: OutputStrategy,
    pub download_timeout: Duration,
}

fn var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parsed<T: std::str::FromStr>(name: &str, default: T) -> anyhow::Result<T>
where
    T::Err: std::fmt::Display,
{
    match var(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|err| anyhow::anyhow!("invalid {name}={raw}: {err}")),
        None => Ok(default),
    }
}

fn megabytes(mb: usize) -> anyhow::Result<usize> {
    mb.checked_mul(1024 * 1024)
        .ok_or_else(|| anyhow::anyhow!("invalid MAX_UPLOAD_MB={mb}: too large"))
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let data_dir = PathBuf::from(var("DATA_DIR").unwrap_or_else(|| "public".to_string()));
        let mut config = Self::with_data_dir(data_dir);

        config.host = parsed("SERVER_HOST", config.host)?;
        config.port = parsed("SERVER_PORT", config.port)?;
        if let Some(path) = var("FFMPEG_PATH") {
            config.ffmpeg_path = path;
        }
        if let Some(path) = var("YTDLP_PATH") {
            config.downloader_candidates = vec![path];
        }
        let max_upload_mb: usize = parsed("MAX_UPLOAD_MB", 500)?;
        config.max_upload_bytes = megabytes(max_upload_mb)?;
        config.cors_origin = var("CORS_ORIGIN");
        config.output_strategy = parsed("OUTPUT_STRATEGY", config.output_strategy)?;
        config.download_timeout =
            Duration::from_secs(parsed("DOWNLOAD_TIMEOUT_SECS", config.download_timeout.as_secs())?);

        Ok(config)
    }

    /// Defaults rooted at `data_dir`.
    pub fn with_data_dir(data_dir: PathBuf) -> Self {
        Self {
            upload_dir: data_dir.join("uploads"),
            output_dir: data_dir.join("output"),
            data_dir,
            host: IpAddr::from([127, 0, 0, 1]),
            port: 3001,
            ffmpeg_path: "ffmpeg".to_string(),
            downloader_candidates: ytdlp::DEFAULT_CANDIDATES.iter().map(|c| c.to_string()).collect(),
            max_upload_bytes: 500 * 1024 * 1024,
            cors_origin: None,
            output_strategy: OutputStrategy::detect(),
            download_timeout: ytdlp::DEFAULT_TIMEOUT,
        }
    }

    pub fn ensure_dirs(&self) -> anyhow::Result<()> {
        for dir in [&self.upload_dir, &self.output_dir] {
            ensure_dir(dir)
                .with_context(|| format!("failed to create directory at {}", dir.display()))?;
        }
        Ok(())
    }
}

//! Where the transcoder writes, and how its output becomes the artifact.

use std::{
    fs, io,
    path::{Path, PathBuf},
    str::FromStr,
};

/// Filesystem operations used by finalization.
pub trait FileOps: Send + Sync {
    fn rename(&self, from: &Path, to: &Path) -> io::Result<()>;
    fn copy(&self, from: &Path, to: &Path) -> io::Result<u64>;
    fn remove(&self, path: &Path) -> io::Result<()>;
    fn exists(&self, path: &Path) -> bool;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RealFs;

impl FileOps for RealFs {
    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        fs::rename(from, to)
    }

    fn copy(&self, from: &Path, to: &Path) -> io::Result<u64> {
        fs::copy(from, to)
    }

    fn remove(&self, path: &Path) -> io::Result<()> {
        fs::remove_file(path)
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }
}

/// Name prefix of in-flight outputs: `.temp-<job id>.<ext>`.
pub const TEMP_PREFIX: &str = ".temp-";

/// The job id of a temp output name, if it is one.
pub fn temp_output_job(name: &str) -> Option<&str> {
    let rest = name.strip_prefix(TEMP_PREFIX)?;
    let id = rest.rsplit_once('.').map_or(rest, |(id, _)| id);
    (!id.is_empty()).then_some(id)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStrategy {
    /// The tool writes the final path itself.
    Direct,
    /// The tool writes a hidden sibling which is renamed into place.
    TempThenRename,
}

impl OutputStrategy {
    /// macOS gets write-then-rename; everything else writes directly.
    pub fn detect() -> Self {
        if cfg!(target_os = "macos") {
            Self::TempThenRename
        } else {
            Self::Direct
        }
    }

    pub fn write_target(&self, final_path: &Path, job_id: &str) -> PathBuf {
        match self {
            Self::Direct => final_path.to_path_buf(),
            Self::TempThenRename => {
                let name = match final_path.extension() {
                    Some(ext) => format!("{TEMP_PREFIX}{job_id}.{}", ext.to_string_lossy()),
                    None => format!("{TEMP_PREFIX}{job_id}"),
                };
                final_path.with_file_name(name)
            }
        }
    }

    /// Moves `written` to `final_path` when they differ and returns where the
    /// artifact ended up: rename, else copy and delete, else the temp path.
    pub fn finalize(&self, ops: &dyn FileOps, written: &Path, final_path: &Path) -> PathBuf {
        if written == final_path || !ops.exists(written) {
            return final_path.to_path_buf();
        }

        match ops.rename(written, final_path) {
            Ok(()) => return final_path.to_path_buf(),
            Err(err) => tracing::warn!(
                from = %written.display(),
                to = %final_path.display(),
                "rename failed, trying copy: {err}"
            ),
        }

        match ops.copy(written, final_path) {
            Ok(_) => {
                if let Err(err) = ops.remove(written) {
                    tracing::warn!(path = %written.display(), "failed to remove temp output: {err}");
                }
                final_path.to_path_buf()
            }
            Err(err) => {
                tracing::error!(
                    path = %written.display(),
                    "copy failed too, keeping artifact at temp path: {err}"
                );
                written.to_path_buf()
            }
        }
    }
}

impl FromStr for OutputStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "direct" => Ok(Self::Direct),
            "temp-rename" | "temp" | "rename" => Ok(Self::TempThenRename),
            other => Err(format!("unknown output strategy: {other}")),
        }
    }
}

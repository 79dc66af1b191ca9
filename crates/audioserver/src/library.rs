//! The output directory as the history of finished jobs.
//!
//! There is no index; listings reflect exactly what is on disk.

use crate::finalize::temp_output_job;
use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::{fs, io, path::Path};

pub const OUTPUT_PREFIX: &str = "/output";

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactEntry {
    pub filename: String,
    pub size: u64,
    pub created_at: DateTime<Utc>,
    pub download_url: String,
}

/// Lists artifacts newest first.
///
/// Hidden files are skipped, except a temp output whose job is no longer
/// active: finalization left the artifact there.
pub fn list_artifacts(
    dir: &Path,
    is_active: impl Fn(&str) -> bool,
) -> anyhow::Result<Vec<ArtifactEntry>> {
    let entries =
        fs::read_dir(dir).with_context(|| format!("failed to read output dir {}", dir.display()))?;

    let mut artifacts = Vec::new();
    for entry in entries {
        let entry = entry?;
        let filename = entry.file_name().to_string_lossy().into_owned();
        let stranded = temp_output_job(&filename).is_some_and(|job| !is_active(job));
        if filename.starts_with('.') && !stranded {
            continue;
        }
        let meta = entry.metadata()?;
        if !meta.is_file() {
            continue;
        }
        let created = meta.created().or_else(|_| meta.modified())?;
        artifacts.push(ArtifactEntry {
            download_url: format!("{OUTPUT_PREFIX}/{filename}"),
            filename,
            size: meta.len(),
            created_at: DateTime::<Utc>::from(created),
        });
    }

    artifacts.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.filename.cmp(&b.filename)));
    Ok(artifacts)
}

#[derive(Debug, thiserror::Error)]
pub enum DeleteError {
    #[error("invalid file name")]
    InvalidName,
    #[error("file not found")]
    NotFound,
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// A plain file name: no separators, no traversal.
pub fn is_plain_file_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && !name.contains("..")
        && !name.contains(['/', '\\'])
        && !name.contains('\0')
}

pub fn delete_artifact(dir: &Path, name: &str) -> Result<(), DeleteError> {
    if !is_plain_file_name(name) {
        return Err(DeleteError::InvalidName);
    }
    let path = dir.join(name);
    if !path.is_file() {
        return Err(DeleteError::NotFound);
    }
    fs::remove_file(&path)?;
    Ok(())
}

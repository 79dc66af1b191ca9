//! Output path sanitizing and advisory diagnostics.
//!
//! [`diagnose_path`] never aborts a job. Its report is logged before the
//! transcoder starts and attached to `conversionError` events on failure.

use regex::Regex;
use serde::Serialize;
use std::{
    fs,
    path::{Component, Path, PathBuf},
    sync::LazyLock,
    time::{SystemTime, UNIX_EPOCH},
};

pub const MAX_PATH_LEN: usize = 260;
pub const MAX_FILE_NAME_LEN: usize = 255;
const FILLER: &str = "_";

static ILLEGAL_CHARS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"[<>:"|?*\x00-\x1f]"#).expect("valid regex"));
static WHITESPACE_RUNS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").expect("valid regex"));

/// Replaces characters that are illegal in file names on common filesystems.
///
/// Applied to the output file name only. The result is stable under repeated
/// application.
pub fn sanitize_file_name(name: &str) -> String {
    let name = ILLEGAL_CHARS.replace_all(name, FILLER);
    let name = WHITESPACE_RUNS.replace_all(&name, FILLER);
    let name = name.replace("..", FILLER);
    let name = match name.strip_prefix('.') {
        Some(rest) => format!("{FILLER}{rest}"),
        None => name,
    };
    name.chars().take(MAX_FILE_NAME_LEN).collect()
}

/// Rebuilds `path` next to its parent with a sanitized file name.
pub fn sanitize_output_path(path: &Path) -> PathBuf {
    let Some(name) = path.file_name() else {
        return path.to_path_buf();
    };
    let clean = sanitize_file_name(&name.to_string_lossy());
    match path.parent() {
        Some(parent) => parent.join(clean),
        None => PathBuf::from(clean),
    }
}

/// Creates `dir` and its parents with mode 0755 where supported.
pub fn ensure_dir(dir: &Path) -> std::io::Result<()> {
    if dir.is_dir() {
        return Ok(());
    }
    let mut builder = fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o755);
    }
    builder.create(dir)
}

/// Lexical normalization: drops `.` segments, resolves `..` against earlier
/// segments and collapses repeated separators. Does not touch the filesystem.
pub fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                let can_pop = matches!(
                    out.components().next_back(),
                    Some(Component::Normal(_))
                );
                if can_pop {
                    out.pop();
                } else if !out.has_root() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    if out.as_os_str().is_empty() {
        out.push(".");
    }
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathIssue {
    NotAbsolute,
    TooLong(usize),
    IllegalCharacters,
    ParentMissing,
    ParentNotWritable,
    TargetLocked,
    WriteProbeFailed,
    NotNormalized,
}

impl PathIssue {
    pub fn message(&self) -> String {
        match self {
            Self::NotAbsolute => "path is not absolute".to_string(),
            Self::TooLong(len) => format!("path is too long ({len} characters)"),
            Self::IllegalCharacters => "file name contains illegal characters".to_string(),
            Self::ParentMissing => "output directory does not exist".to_string(),
            Self::ParentNotWritable => "output directory is not writable".to_string(),
            Self::TargetLocked => "output file already exists and cannot be removed".to_string(),
            Self::WriteProbeFailed => "unable to write a file in the output directory".to_string(),
            Self::NotNormalized => "path is not normalized".to_string(),
        }
    }

    pub fn suggestion(&self) -> &'static str {
        match self {
            Self::NotAbsolute => "resolve the path against the working directory",
            Self::TooLong(_) => "shorten the directory or file name",
            Self::IllegalCharacters => "remove special characters from the file name",
            Self::ParentMissing => "create the output directory",
            Self::ParentNotWritable => "check the directory permissions (chmod)",
            Self::TargetLocked => "check whether another process holds the file open",
            Self::WriteProbeFailed => "check free disk space and permissions",
            Self::NotNormalized => "normalize the path before use",
        }
    }
}

/// Advisory viability report for a candidate output path.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticsReport {
    pub path: String,
    pub is_valid: bool,
    pub issues: Vec<String>,
    pub suggestions: Vec<String>,
    #[serde(skip)]
    pub findings: Vec<PathIssue>,
}

impl DiagnosticsReport {
    fn new(path: &Path) -> Self {
        Self {
            path: path.display().to_string(),
            is_valid: true,
            issues: Vec::new(),
            suggestions: Vec::new(),
            findings: Vec::new(),
        }
    }

    fn record(&mut self, issue: PathIssue) {
        self.issues.push(issue.message());
        self.suggestions.push(issue.suggestion().to_string());
        self.findings.push(issue);
        self.is_valid = false;
    }

    pub fn has(&self, issue: PathIssue) -> bool {
        self.findings.contains(&issue)
    }
}

/// Runs every check against `path` and collects the findings. Each check
/// contributes independently.
///
/// Side effects: an existing file at `path` is removed, and a scratch file is
/// written and removed in the parent directory.
pub fn diagnose_path(path: &Path) -> DiagnosticsReport {
    let mut report = DiagnosticsReport::new(path);

    if !path.is_absolute() {
        report.record(PathIssue::NotAbsolute);
    }

    let len = path.as_os_str().to_string_lossy().chars().count();
    if len > MAX_PATH_LEN {
        report.record(PathIssue::TooLong(len));
    }

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    if ILLEGAL_CHARS.is_match(&file_name) {
        report.record(PathIssue::IllegalCharacters);
    }

    let parent = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(Path::new("."));
    if !parent.is_dir() {
        report.record(PathIssue::ParentMissing);
    } else if !is_writable(parent) {
        report.record(PathIssue::ParentNotWritable);
    }

    if path.exists() && fs::remove_file(path).is_err() {
        report.record(PathIssue::TargetLocked);
    }

    if !write_probe(parent) {
        report.record(PathIssue::WriteProbeFailed);
    }

    if normalize_lexically(path).as_os_str() != path.as_os_str() {
        report.record(PathIssue::NotNormalized);
    }

    report
}

#[cfg(unix)]
fn is_writable(dir: &Path) -> bool {
    nix::unistd::access(dir, nix::unistd::AccessFlags::W_OK).is_ok()
}

#[cfg(not(unix))]
fn is_writable(dir: &Path) -> bool {
    fs::metadata(dir)
        .map(|m| !m.permissions().readonly())
        .unwrap_or(false)
}

fn write_probe(dir: &Path) -> bool {
    let stamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let probe = dir.join(format!(".test-{stamp}.tmp"));
    fs::write(&probe, b"test").is_ok() && fs::remove_file(&probe).is_ok()
}

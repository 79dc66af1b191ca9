//! Drives one transcoder run from a validated input to a verified artifact.

use crate::{
    failure::JobFailure,
    finalize::{FileOps, OutputStrategy},
    job::JobReporter,
    paths::{diagnose_path, ensure_dir, sanitize_output_path},
    registry::{JobRegistry, ProcessHandle},
    tools::{ffmpeg::build_args, AudioFormat, ConversionOptions, Invocation, ToolSignal, Transcoder},
};
use std::{
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::sync::mpsc;

#[derive(Debug, Clone)]
pub struct ConversionRequest {
    pub input: PathBuf,
    /// Desired artifact path; its file name is sanitized before use.
    pub output: PathBuf,
    pub format: AudioFormat,
    pub options: ConversionOptions,
}

pub struct ConversionOrchestrator {
    transcoder: Arc<dyn Transcoder>,
    registry: JobRegistry,
    strategy: OutputStrategy,
    fs: Arc<dyn FileOps>,
}

impl ConversionOrchestrator {
    pub fn new(
        transcoder: Arc<dyn Transcoder>,
        registry: JobRegistry,
        strategy: OutputStrategy,
        fs: Arc<dyn FileOps>,
    ) -> Self {
        Self {
            transcoder,
            registry,
            strategy,
            fs,
        }
    }

    pub fn strategy(&self) -> OutputStrategy {
        self.strategy
    }

    /// Runs the conversion and reports every transition through `reporter`.
    ///
    /// Returns the artifact path on success. Errors have already been
    /// delivered to the client when this returns.
    pub async fn convert(
        &self,
        request: ConversionRequest,
        reporter: &mut JobReporter,
    ) -> Result<PathBuf, JobFailure> {
        let task_id = reporter.id().to_string();
        let input = absolute(&request.input);
        let output = sanitize_output_path(&absolute(&request.output));
        let output_dir = output.parent().map(Path::to_path_buf).unwrap_or_default();

        if let Err(err) = ensure_dir(&output_dir) {
            tracing::error!(task_id = %task_id, dir = %output_dir.display(), "failed to create output directory: {err}");
            let failure = JobFailure::filesystem(
                format!("unable to create output directory: {err}"),
                "check the permissions of the output location",
            )
            .with_input_file(input.display().to_string());
            reporter.failed(failure.clone());
            return Err(failure);
        }

        let diagnostics = diagnose_path(&output);
        if !diagnostics.is_valid {
            for (issue, suggestion) in diagnostics.issues.iter().zip(&diagnostics.suggestions) {
                tracing::warn!(task_id = %task_id, path = %output.display(), "{issue} ({suggestion})");
            }
        }

        if !self.fs.exists(&input) {
            let failure = JobFailure::precondition(format!(
                "input file does not exist: {}",
                input.display()
            ))
            .with_input_file(input.display().to_string());
            reporter.failed(failure.clone());
            return Err(failure);
        }

        let target = self.strategy.write_target(&output, &task_id);
        let invocation = Invocation {
            args: build_args(&input, &target, request.format, &request.options),
            input: input.clone(),
            target: target.clone(),
        };
        tracing::info!(
            task_id = %task_id,
            input = %input.display(),
            output = %output.display(),
            target = %target.display(),
            format = request.format.extension(),
            codec = request.format.codec(),
            bitrate = %request.options.bitrate,
            "starting conversion"
        );

        let handle = ProcessHandle::new();
        self.registry.register(&task_id, handle.clone());

        let (tx, mut rx) = mpsc::unbounded_channel();
        let signals = async {
            while let Some(signal) = rx.recv().await {
                match signal {
                    ToolSignal::Started { command_line } => {
                        tracing::info!(task_id = %reporter.id(), "ffmpeg command: {command_line}");
                        reporter.started("conversion started");
                    }
                    ToolSignal::Progress { percent, timemark } => {
                        reporter.progress(percent.unwrap_or(0.0), timemark);
                    }
                }
            }
        };
        let (result, ()) = tokio::join!(
            self.transcoder.transcode(&invocation, tx, handle.token()),
            signals
        );

        let failure = match result {
            Ok(()) => {
                let artifact = self.strategy.finalize(self.fs.as_ref(), &target, &output);
                if self.fs.exists(&artifact) {
                    self.registry.unregister(&task_id);
                    let name = artifact
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_default();
                    tracing::info!(task_id = %task_id, artifact = %artifact.display(), "conversion complete");
                    reporter.completed(&name);
                    if let Err(err) = self.fs.remove(&input) {
                        tracing::warn!(task_id = %task_id, input = %input.display(), "failed to delete input file: {err}");
                    }
                    return Ok(artifact);
                }
                JobFailure::filesystem(
                    "output file was not created",
                    "check free disk space and the permissions of the output directory",
                )
            }
            Err(err) => {
                tracing::error!(task_id = %task_id, input = %input.display(), output = %output.display(), "conversion failed: {err}");
                JobFailure::from_tool_output(err.to_string())
            }
        };

        self.registry.unregister(&task_id);
        let failure = failure
            .with_details(diagnose_path(&output))
            .with_input_file(input.display().to_string());
        reporter.failed(failure.clone());
        self.cleanup(&task_id, &[&input, &output, &target]);
        Err(failure)
    }

    fn cleanup(&self, task_id: &str, paths: &[&Path]) {
        for path in paths {
            if self.fs.exists(path) {
                if let Err(err) = self.fs.remove(path) {
                    tracing::warn!(task_id = %task_id, path = %path.display(), "cleanup failed: {err}");
                }
            }
        }
    }
}

fn absolute(path: &Path) -> PathBuf {
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}

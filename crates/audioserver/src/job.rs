//! Job lifecycle: `pending -> converting -> {completed | error}`.
//!
//! [`Job`] owns the transitions and turns each legal one into the event the
//! client should see. [`JobReporter`] pairs a job with the connection that
//! submitted it.

use crate::{
    channel::{ConnectionId, ProgressEvent, ProgressHub},
    failure::JobFailure,
};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Pending,
    Converting,
    Completed,
    Error,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Error)
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TransitionError {
    #[error("job {0} has already started")]
    AlreadyStarted(String),
    #[error("job {0} has not started")]
    NotStarted(String),
    #[error("job {0} already finished")]
    Finished(String),
}

#[derive(Debug)]
pub struct Job {
    id: String,
    state: JobState,
    progress: u8,
    reported: Option<u8>,
    base: u8,
    width: u8,
    output: Option<String>,
    error: Option<JobFailure>,
}

impl Job {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            state: JobState::Pending,
            progress: 0,
            reported: None,
            base: 0,
            width: 100,
            output: None,
            error: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    pub fn progress(&self) -> u8 {
        self.progress
    }

    pub fn output(&self) -> Option<&str> {
        self.output.as_deref()
    }

    pub fn error(&self) -> Option<&JobFailure> {
        self.error.as_ref()
    }

    /// Maps subsequent tool percentages into `base..=base+width`.
    pub fn rescale(&mut self, base: u8, width: u8) {
        self.base = base.min(100);
        self.width = width.min(100 - self.base);
    }

    pub fn start(&mut self, message: &str) -> Result<ProgressEvent, TransitionError> {
        match self.state {
            JobState::Pending => {
                self.state = JobState::Converting;
                Ok(ProgressEvent::ConversionStart {
                    task_id: self.id.clone(),
                    message: message.to_string(),
                })
            }
            JobState::Converting => Err(TransitionError::AlreadyStarted(self.id.clone())),
            _ => Err(TransitionError::Finished(self.id.clone())),
        }
    }

    /// Records a tool-reported percentage. Values are floored, clamped and
    /// rescaled; only values above the last reported one produce an event.
    pub fn advance(
        &mut self,
        percent: f64,
        timemark: Option<String>,
    ) -> Result<Option<ProgressEvent>, TransitionError> {
        let raw = if percent.is_finite() { percent.floor().clamp(0.0, 100.0) } else { 0.0 };
        let scaled = self.base as f64 + raw * self.width as f64 / 100.0;
        self.advance_to(scaled.floor() as u8, timemark)
    }

    pub fn advance_to(
        &mut self,
        progress: u8,
        timemark: Option<String>,
    ) -> Result<Option<ProgressEvent>, TransitionError> {
        match self.state {
            JobState::Converting => {}
            JobState::Pending => return Err(TransitionError::NotStarted(self.id.clone())),
            _ => return Err(TransitionError::Finished(self.id.clone())),
        }
        let progress = progress.min(100);
        if self.reported.is_some_and(|last| progress <= last) {
            return Ok(None);
        }
        self.progress = progress;
        self.reported = Some(progress);
        Ok(Some(ProgressEvent::ConversionProgress {
            task_id: self.id.clone(),
            progress,
            timemark,
        }))
    }

    pub fn complete(&mut self, output_file: &str) -> Result<ProgressEvent, TransitionError> {
        if self.state.is_terminal() {
            return Err(TransitionError::Finished(self.id.clone()));
        }
        self.state = JobState::Completed;
        self.progress = 100;
        self.output = Some(output_file.to_string());
        Ok(ProgressEvent::ConversionComplete {
            task_id: self.id.clone(),
            output_file: output_file.to_string(),
        })
    }

    pub fn fail(&mut self, failure: JobFailure) -> Result<ProgressEvent, TransitionError> {
        if self.state.is_terminal() {
            return Err(TransitionError::Finished(self.id.clone()));
        }
        self.state = JobState::Error;
        let event = ProgressEvent::error(&self.id, &failure);
        self.error = Some(failure);
        Ok(event)
    }
}

/// A job bound to the connection that submitted it.
pub struct JobReporter {
    job: Job,
    hub: ProgressHub,
    connection: Option<ConnectionId>,
}

impl JobReporter {
    pub fn new(job: Job, hub: ProgressHub, connection: Option<ConnectionId>) -> Self {
        Self { job, hub, connection }
    }

    pub fn job(&self) -> &Job {
        &self.job
    }

    pub fn job_mut(&mut self) -> &mut Job {
        &mut self.job
    }

    pub fn id(&self) -> &str {
        self.job.id()
    }

    pub fn started(&mut self, message: &str) {
        let result = self.job.start(message).map(Some);
        self.deliver(result);
    }

    pub fn progress(&mut self, percent: f64, timemark: Option<String>) {
        let result = self.job.advance(percent, timemark);
        self.deliver(result);
    }

    pub fn progress_to(&mut self, progress: u8) {
        let result = self.job.advance_to(progress, None);
        self.deliver(result);
    }

    pub fn completed(&mut self, output_file: &str) {
        let result = self.job.complete(output_file).map(Some);
        self.deliver(result);
    }

    pub fn failed(&mut self, failure: JobFailure) {
        let result = self.job.fail(failure).map(Some);
        self.deliver(result);
    }

    fn deliver(&self, result: Result<Option<ProgressEvent>, TransitionError>) {
        match result {
            Ok(Some(event)) => match &self.connection {
                Some(connection) => {
                    self.hub.emit(connection, event);
                }
                None => tracing::debug!(task_id = self.job.id(), "job has no connection, event dropped"),
            },
            Ok(None) => {}
            Err(err) => tracing::debug!(task_id = self.job.id(), "ignored transition: {err}"),
        }
    }
}

//! Per-connection push delivery of job events.
//!
//! Events are addressed to one connection id and never broadcast. Delivery is
//! at-most-once: an event for a connection that is gone is dropped.

use crate::{failure::JobFailure, paths::DiagnosticsReport};
use parking_lot::RwLock;
use serde::Serialize;
use std::{collections::HashMap, sync::Arc};
use tokio::sync::mpsc;
use uuid::Uuid;

pub type ConnectionId = String;

/// Wire format: `{"event": "<name>", "data": {...}}`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ProgressEvent {
    #[serde(rename_all = "camelCase")]
    Connected { connection_id: ConnectionId },
    #[serde(rename_all = "camelCase")]
    ConversionStart { task_id: String, message: String },
    #[serde(rename_all = "camelCase")]
    ConversionProgress {
        task_id: String,
        progress: u8,
        #[serde(skip_serializing_if = "Option::is_none")]
        timemark: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    ConversionComplete { task_id: String, output_file: String },
    #[serde(rename_all = "camelCase")]
    ConversionError {
        task_id: String,
        error: String,
        error_type: String,
        error_solution: String,
        original_error: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        details: Option<DiagnosticsReport>,
        #[serde(skip_serializing_if = "Option::is_none")]
        input_file: Option<String>,
    },
}

impl ProgressEvent {
    pub fn error(task_id: &str, failure: &JobFailure) -> Self {
        Self::ConversionError {
            task_id: task_id.to_string(),
            error: failure.message.clone(),
            error_type: failure.kind.as_str().to_string(),
            error_solution: failure.solution.clone(),
            original_error: failure.original.clone(),
            details: failure.details.clone(),
            input_file: failure.input_file.clone(),
        }
    }

    pub fn task_id(&self) -> Option<&str> {
        match self {
            Self::Connected { .. } => None,
            Self::ConversionStart { task_id, .. }
            | Self::ConversionProgress { task_id, .. }
            | Self::ConversionComplete { task_id, .. }
            | Self::ConversionError { task_id, .. } => Some(task_id),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::ConversionComplete { .. } | Self::ConversionError { .. }
        )
    }
}

/// Live client connections, keyed by connection id.
#[derive(Clone, Default)]
pub struct ProgressHub {
    connections: Arc<RwLock<HashMap<ConnectionId, mpsc::UnboundedSender<ProgressEvent>>>>,
}

impl ProgressHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new connection under a fresh id.
    pub fn connect(&self) -> (ConnectionId, mpsc::UnboundedReceiver<ProgressEvent>) {
        let id = Uuid::new_v4().to_string();
        let rx = self.connect_as(id.clone());
        (id, rx)
    }

    /// Registers a connection under a caller-chosen id, replacing any previous
    /// connection with the same id.
    pub fn connect_as(&self, id: ConnectionId) -> mpsc::UnboundedReceiver<ProgressEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.connections.write().insert(id, tx);
        rx
    }

    pub fn disconnect(&self, id: &str) {
        self.connections.write().remove(id);
    }

    pub fn is_connected(&self, id: &str) -> bool {
        self.connections.read().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.connections.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Delivers `event` to `connection`. Returns whether it was handed off.
    pub fn emit(&self, connection: &str, event: ProgressEvent) -> bool {
        let sender = self.connections.read().get(connection).cloned();
        match sender {
            Some(tx) => {
                if tx.send(event).is_ok() {
                    true
                } else {
                    tracing::debug!(connection, "connection closed, dropping event");
                    self.disconnect(connection);
                    false
                }
            }
            None => {
                tracing::debug!(connection, "no such connection, dropping event");
                false
            }
        }
    }
}

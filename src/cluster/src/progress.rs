//! Progress reporting for bootstrap runs.

use serde::{Deserialize, Serialize};

/// One progress update.
#[derive(Clone, Serialize, Deserialize, Debug)]
pub struct BootstrapProgress {
    pub percentage: u32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cluster_name: Option<String>,
}

impl BootstrapProgress {
    pub fn new(cluster_name: Option<String>, percentage: u32, message: String) -> Self {
        Self {
            percentage,
            message,
            phase: None,
            cluster_name,
        }
    }
}

/// Progress reporter for bootstrap runs.
pub trait ProgressReporter: Send + Sync + 'static {
    fn emit(&self, percentage: u32, message: String);

    /// Emit progress with phase metadata.
    fn emit_phase(&self, percentage: u32, message: String, _phase: &str) {
        self.emit(percentage, message);
    }
}

/// Channel-based progress reporter.
pub struct ChannelProgressReporter {
    sender: tokio::sync::mpsc::Sender<BootstrapProgress>,
    cluster_name: Option<String>,
}

impl ChannelProgressReporter {
    pub fn new(sender: tokio::sync::mpsc::Sender<BootstrapProgress>) -> Self {
        Self {
            sender,
            cluster_name: None,
        }
    }

    pub fn with_cluster_name(
        sender: tokio::sync::mpsc::Sender<BootstrapProgress>,
        cluster_name: String,
    ) -> Self {
        Self {
            sender,
            cluster_name: Some(cluster_name),
        }
    }
}

impl ProgressReporter for ChannelProgressReporter {
    fn emit(&self, percentage: u32, message: String) {
        let progress = BootstrapProgress::new(self.cluster_name.clone(), percentage, message);
        let _ = self.sender.try_send(progress);
    }

    fn emit_phase(&self, percentage: u32, message: String, phase: &str) {
        let mut progress = BootstrapProgress::new(self.cluster_name.clone(), percentage, message);
        progress.phase = Some(phase.to_string());
        let _ = self.sender.try_send(progress);
    }
}

/// Writes progress to the tracing log.
pub struct LogProgressReporter;

impl ProgressReporter for LogProgressReporter {
    fn emit(&self, percentage: u32, message: String) {
        tracing::info!("[{:>3}%] {}", percentage, message);
    }
}

/// Percentage for the start of step `index` of `total` within `[start, end]`.
pub fn step_progress(start: u32, end: u32, index: usize, total: usize) -> u32 {
    let span = end.saturating_sub(start);
    start + span.saturating_mul(index as u32) / (total.max(1) as u32)
}

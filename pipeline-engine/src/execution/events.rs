// Execution Events
// Progress reporting and event types for pipeline execution

use crate::models::{JobStatus, RunStatus, StepStatus};

use std::time::Duration;
use tokio::sync::mpsc;

/// Sender for execution progress events
pub type ProgressSender = mpsc::UnboundedSender<ExecutionEvent>;

/// Receiver for execution progress events
pub type ProgressReceiver = mpsc::UnboundedReceiver<ExecutionEvent>;

/// Create a new progress channel
pub fn progress_channel() -> (ProgressSender, ProgressReceiver) {
    mpsc::unbounded_channel()
}

/// Events emitted during pipeline execution
#[derive(Debug, Clone)]
pub enum ExecutionEvent {
    /// Run started
    RunStarted {
        run_id: String,
        pipeline_name: String,
        total_jobs: usize,
    },

    /// Run reached a terminal status
    RunCompleted {
        run_id: String,
        status: RunStatus,
        duration: Duration,
    },

    /// Job instance dispatched to a runner
    JobStarted {
        job_id: String,
        template_id: String,
        runner: String,
        total_steps: usize,
    },

    /// Job instance finished running
    JobCompleted {
        job_id: String,
        status: JobStatus,
        duration: Duration,
    },

    /// Job instance or template not run (dependency failed or filtered out)
    JobSkipped { job_id: String, status: JobStatus },

    /// Queued job instance cancelled before dispatch
    JobCancelled { job_id: String, reason: String },

    /// Step execution started
    StepStarted {
        job_id: String,
        step_name: String,
        step_index: usize,
    },

    /// Step output line (stdout/stderr)
    StepOutput {
        job_id: String,
        step_index: usize,
        output: String,
        is_error: bool,
    },

    /// Step execution completed
    StepCompleted {
        job_id: String,
        step_name: String,
        step_index: usize,
        status: StepStatus,
        duration: Duration,
        exit_code: Option<i32>,
    },

    /// Step was skipped (condition evaluated to false)
    StepSkipped {
        job_id: String,
        step_name: String,
        step_index: usize,
    },

    CacheRestored { job_id: String, key: String },

    CacheMiss { job_id: String, key: String },

    CacheSaved { job_id: String, key: String },

    /// Artifact registered in the run's registry
    ArtifactRegistered {
        job_id: String,
        name: String,
        paths: usize,
    },

    /// Log message (info, warning, error)
    Log {
        level: LogLevel,
        message: String,
        job_id: Option<String>,
    },
}

/// Log level for log events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl ExecutionEvent {
    /// Create an info log event
    pub fn info(message: impl Into<String>, job_id: Option<String>) -> Self {
        Self::Log {
            level: LogLevel::Info,
            message: message.into(),
            job_id,
        }
    }

    /// Create a warning log event
    pub fn warning(message: impl Into<String>, job_id: Option<String>) -> Self {
        Self::Log {
            level: LogLevel::Warning,
            message: message.into(),
            job_id,
        }
    }

    /// Create an error log event
    pub fn error(message: impl Into<String>, job_id: Option<String>) -> Self {
        Self::Log {
            level: LogLevel::Error,
            message: message.into(),
            job_id,
        }
    }

    /// Job instance this event belongs to, if any
    pub fn job_id(&self) -> Option<&str> {
        match self {
            Self::RunStarted { .. } | Self::RunCompleted { .. } => None,
            Self::JobStarted { job_id, .. }
            | Self::JobCompleted { job_id, .. }
            | Self::JobSkipped { job_id, .. }
            | Self::JobCancelled { job_id, .. }
            | Self::StepStarted { job_id, .. }
            | Self::StepOutput { job_id, .. }
            | Self::StepCompleted { job_id, .. }
            | Self::StepSkipped { job_id, .. }
            | Self::CacheRestored { job_id, .. }
            | Self::CacheMiss { job_id, .. }
            | Self::CacheSaved { job_id, .. }
            | Self::ArtifactRegistered { job_id, .. } => Some(job_id),
            Self::Log { job_id, .. } => job_id.as_deref(),
        }
    }
}

/// Helper trait for sending events, ignoring errors (fire-and-forget)
pub trait EventSender {
    fn send_event(&self, event: ExecutionEvent);
}

impl EventSender for ProgressSender {
    fn send_event(&self, event: ExecutionEvent) {
        let _ = self.send(event);
    }
}

impl EventSender for Option<ProgressSender> {
    fn send_event(&self, event: ExecutionEvent) {
        if let Some(sender) = self {
            let _ = sender.send(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_progress_channel() {
        let (tx, mut rx) = progress_channel();

        tx.send_event(ExecutionEvent::RunStarted {
            run_id: "run-1".to_string(),
            pipeline_name: "ci".to_string(),
            total_jobs: 2,
        });
        tx.send_event(ExecutionEvent::CacheMiss {
            job_id: "build (linux)".to_string(),
            key: "linux-abc".to_string(),
        });

        let event1 = rx.recv().await.unwrap();
        assert!(matches!(event1, ExecutionEvent::RunStarted { .. }));
        assert_eq!(event1.job_id(), None);

        let event2 = rx.recv().await.unwrap();
        assert_eq!(event2.job_id(), Some("build (linux)"));
    }

    #[test]
    fn test_optional_sender() {
        let sender: Option<ProgressSender> = None;
        // Should not panic
        sender.send_event(ExecutionEvent::info("test", None));
    }

    #[test]
    fn test_closed_receiver_is_ignored() {
        let (tx, rx) = progress_channel();
        drop(rx);
        tx.send_event(ExecutionEvent::warning("nobody listening", None));
    }
}

// Execution Engine Module
// Handles DAG construction, matrix expansion, job running and scheduling

pub mod cancel;
pub mod events;
pub mod executor;
pub mod graph;
pub mod matrix;
pub mod report;
pub mod runner;
pub mod workspace;

// Re-export key types
pub use cancel::CancelSignal;
pub use events::{
    progress_channel, EventSender, ExecutionEvent, LogLevel, ProgressReceiver, ProgressSender,
};
pub use executor::{ExecutorConfig, PipelineExecutor};
pub use graph::{ExecutionGraph, GraphError, GraphErrorKind, JobNode};
pub use matrix::{JobInstance, MatrixExpander};
pub use report::{FailureDetail, JobReport, RunReport, StepReport};
pub use runner::{InstanceCancel, JobRunner};
pub use workspace::{IsolatedWorkspace, SharedWorkspace, WorkspaceProvider};

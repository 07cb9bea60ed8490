// Pipeline Engine Library
// Job graph scheduling, matrix expansion, conditional steps, caching and artifacts

pub mod adapters;
pub mod artifacts;
pub mod cache;
pub mod context;
pub mod error;
pub mod execution;
pub mod filter;
pub mod models;
pub mod parser;
pub mod strategy;
pub mod utils;

// Re-export commonly used types
pub use error::{EngineError, EngineResult};

// Re-export model types
pub use models::{
    ArtifactSpec, CacheSpec, Condition, EventKind, JobStatus, JobTemplate, PipelineDefinition,
    RunStatus, SkipReason, Step, StepStatus,
};
pub use parser::PipelineParser;

// Re-export execution types
pub use context::{JobEnvironment, RunContext};
pub use execution::{
    CancelSignal, ExecutionEvent, ExecutionGraph, ExecutorConfig, GraphError, GraphErrorKind,
    IsolatedWorkspace, JobInstance, JobReport, JobRunner, MatrixExpander, PipelineExecutor,
    ProgressSender, RunReport, SharedWorkspace, WorkspaceProvider,
};

// Re-export adapter, cache and artifact types
pub use adapters::{ExecutorRegistry, StepExecutor, StepInvocation, StepOutcome};
pub use artifacts::{Artifact, ArtifactError, ArtifactRegistry, ArtifactStore};
pub use cache::{CacheError, CacheKeyResolver, CacheStore, LocalCacheStore};
pub use strategy::{PlatformStrategy, StrategyRegistry};

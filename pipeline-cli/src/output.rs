// Output formatting helpers for CLI commands

use pipeline_engine::{JobStatus, StepStatus};

/// Print a status message: "  Status message"
pub fn status(action: &str, message: &str) {
    eprintln!("\x1b[1;36m{:>12}\x1b[0m {}", action, message);
}

/// Print a success message with checkmark
pub fn success(message: &str) {
    eprintln!("\x1b[1;32m  \u{2713}\x1b[0m {}", message);
}

/// Print a failure message with X
pub fn failure(message: &str) {
    eprintln!("\x1b[1;31m  \u{2717}\x1b[0m {}", message);
}

/// Print a check/pass item
pub fn check(message: &str) {
    eprintln!("\x1b[32m  \u{2713}\x1b[0m {}", message);
}

/// Print a warning message
pub fn warning(message: &str) {
    eprintln!("\x1b[33m  !\x1b[0m {}", message);
}

/// Print an error message
pub fn error(message: &str) {
    eprintln!("\x1b[1;31merror:\x1b[0m {}", message);
}

/// Print an info message
pub fn info(message: &str) {
    eprintln!("\x1b[36m  i\x1b[0m {}", message);
}

/// Print a dim/muted message
pub fn dim(message: &str) {
    eprintln!("\x1b[2m{}\x1b[0m", message);
}

pub fn dim_success(message: &str) {
    eprintln!("\x1b[32m{}\x1b[0m", message);
}

pub fn dim_failure(message: &str) {
    eprintln!("\x1b[31m{}\x1b[0m", message);
}

/// Print step output (indented, prefixed with the job)
pub fn step_output(job: &str, line: &str) {
    println!("  {} | {}", job, line);
}

/// Print step error output (indented, red)
pub fn step_error(job: &str, line: &str) {
    eprintln!("\x1b[31m  {} | {}\x1b[0m", job, line);
}

/// Print a header line
pub fn header(message: &str) {
    eprintln!("\x1b[1m==> {}\x1b[0m", message);
}

pub fn job_symbol(status: &JobStatus) -> &'static str {
    match status {
        JobStatus::Succeeded => "OK",
        JobStatus::Failed => "FAIL",
        JobStatus::Cancelled => "CANCELLED",
        JobStatus::Skipped(_) => "SKIP",
        JobStatus::NotApplicable => "N/A",
    }
}

pub fn step_symbol(status: StepStatus) -> &'static str {
    match status {
        StepStatus::Succeeded => "OK",
        StepStatus::Failed => "FAIL",
        StepStatus::Skipped => "SKIP",
        StepStatus::Cancelled => "CANCELLED",
    }
}

/// Print a job line colored by status
pub fn job_line(status: &JobStatus, message: &str) {
    match status {
        JobStatus::Succeeded => dim_success(message),
        JobStatus::Failed => dim_failure(message),
        _ => dim(message),
    }
}

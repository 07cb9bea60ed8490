// Shell and Command Executors
// Run steps as child processes with captured output and timeouts

use super::{parse_set_output, AdapterError, OutputCallback, StepExecutor, StepInvocation, StepOutcome};

use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::task::JoinHandle;

/// How long to wait for output readers after a timed-out process was killed
const READER_GRACE: Duration = Duration::from_secs(2);

/// Shell types supported by the shell executor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shell {
    /// Default shell (sh on Unix, cmd on Windows)
    Default,
    /// Bash shell
    Bash,
}

impl Shell {
    /// Get the shell executable and arguments
    fn get_command(&self) -> (&'static str, &'static [&'static str]) {
        match self {
            Shell::Default => {
                if cfg!(target_os = "windows") {
                    ("cmd", &["/C"])
                } else {
                    ("sh", &["-c"])
                }
            }
            Shell::Bash => ("bash", &["-c"]),
        }
    }
}

/// Runs the step command as a shell script; args are appended, quoted
pub struct ShellAdapter {
    shell: Shell,
}

impl ShellAdapter {
    pub fn new() -> Self {
        Self {
            shell: Shell::Default,
        }
    }

    pub fn with_shell(shell: Shell) -> Self {
        Self { shell }
    }

    fn script(invocation: &StepInvocation) -> String {
        let mut script = invocation.command.clone();
        for arg in &invocation.args {
            script.push(' ');
            script.push_str(&quote(arg));
        }
        script
    }
}

impl Default for ShellAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl StepExecutor for ShellAdapter {
    async fn execute(&self, invocation: &StepInvocation) -> Result<StepOutcome, AdapterError> {
        let (shell_cmd, shell_args) = self.shell.get_command();

        let mut cmd = Command::new(shell_cmd);
        cmd.args(shell_args);
        cmd.arg(Self::script(invocation));

        run_process(cmd, shell_cmd, invocation).await
    }
}

/// Runs a program directly, resolved on `PATH` (or relative to the working directory)
///
/// The first word of the command is the program; remaining words and the step
/// args are passed as arguments without shell processing.
pub struct CommandAdapter;

impl CommandAdapter {
    pub fn new() -> Self {
        Self
    }
}

impl Default for CommandAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl StepExecutor for CommandAdapter {
    async fn execute(&self, invocation: &StepInvocation) -> Result<StepOutcome, AdapterError> {
        let mut words = invocation.command.split_whitespace();
        let program_name = words.next().unwrap_or_default().to_string();

        let search_path = invocation
            .env
            .get("PATH")
            .map(std::ffi::OsString::from)
            .or_else(|| std::env::var_os("PATH"));

        let program = which::which_in(&program_name, search_path, &invocation.working_dir)
            .map_err(|source| AdapterError::CommandNotFound {
                command: program_name.clone(),
                source,
            })?;

        let mut cmd = Command::new(&program);
        cmd.args(words);
        cmd.args(&invocation.args);

        run_process(cmd, &program_name, invocation).await
    }
}

/// Spawn, capture, enforce the timeout and collect outputs
async fn run_process(
    mut cmd: Command,
    display: &str,
    invocation: &StepInvocation,
) -> Result<StepOutcome, AdapterError> {
    cmd.current_dir(&invocation.working_dir);
    cmd.envs(&invocation.env);
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    // Dropping the future (cancellation) must not leave the process running
    cmd.kill_on_drop(true);

    let mut child = cmd.spawn().map_err(|source| AdapterError::Spawn {
        command: display.to_string(),
        source,
    })?;

    // Read output streams concurrently
    let stdout_handle = spawn_reader(child.stdout.take(), false, invocation.on_output.clone());
    let stderr_handle = spawn_reader(child.stderr.take(), true, invocation.on_output.clone());

    // Wait for completion with optional timeout
    let (exit_code, timed_out) = match invocation.timeout {
        Some(limit) => match tokio::time::timeout(limit, child.wait()).await {
            Ok(result) => (result.ok().and_then(|s| s.code()), false),
            Err(_) => {
                let _ = child.kill().await;
                (None, true)
            }
        },
        None => (child.wait().await.ok().and_then(|s| s.code()), false),
    };

    let stdout = collect(stdout_handle, timed_out).await;
    let mut stderr = collect(stderr_handle, timed_out).await;

    if let Some(limit) = invocation.timeout.filter(|_| timed_out) {
        if !stderr.is_empty() {
            stderr.push('\n');
        }
        stderr.push_str(&format!("Process timed out after {:?}", limit));
    }

    if let Some(path) = &invocation.log_path {
        write_log(path, &stdout, &stderr).await;
    }

    let outputs = parse_set_output(&stdout);

    Ok(StepOutcome {
        exit_code,
        success: exit_code == Some(0),
        stdout,
        stderr,
        outputs,
        log_path: invocation.log_path.clone(),
        timed_out,
    })
}

fn spawn_reader<R>(
    reader: Option<R>,
    is_stderr: bool,
    on_output: Option<OutputCallback>,
) -> JoinHandle<String>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut output = String::new();
        let Some(reader) = reader else {
            return output;
        };

        // Raw lines: invalid UTF-8 is replaced, never a reason to stop draining the pipe
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {}
                Err(e) => {
                    log::debug!("output stream closed: {}", e);
                    break;
                }
            }
            let line = String::from_utf8_lossy(&buf);
            let line = line.trim_end_matches(['\n', '\r']);
            if let Some(callback) = &on_output {
                callback(&line, is_stderr);
            }
            if !output.is_empty() {
                output.push('\n');
            }
            output.push_str(line);
        }
        output
    })
}

/// A killed shell may leave grandchildren holding the pipe open
async fn collect(handle: JoinHandle<String>, timed_out: bool) -> String {
    if timed_out {
        match tokio::time::timeout(READER_GRACE, handle).await {
            Ok(result) => result.unwrap_or_default(),
            Err(_) => String::new(),
        }
    } else {
        handle.await.unwrap_or_default()
    }
}

async fn write_log(path: &std::path::Path, stdout: &str, stderr: &str) {
    if let Some(parent) = path.parent() {
        if let Err(e) = tokio::fs::create_dir_all(parent).await {
            log::warn!("cannot create log directory {}: {}", parent.display(), e);
            return;
        }
    }

    let mut content = String::with_capacity(stdout.len() + stderr.len() + 1);
    content.push_str(stdout);
    if !stderr.is_empty() {
        if !content.is_empty() {
            content.push('\n');
        }
        content.push_str(stderr);
    }
    content.push('\n');

    if let Err(e) = tokio::fs::write(path, content).await {
        log::warn!("cannot write step log {}: {}", path.display(), e);
    }
}

/// POSIX single-quote an argument when it contains anything but safe characters
fn quote(arg: &str) -> String {
    let safe = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,+@%".contains(c));
    if safe || cfg!(target_os = "windows") {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

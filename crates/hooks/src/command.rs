use crate::environment::HookEnvironment;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;

#[derive(Debug, Error)]
pub enum HookError {
    #[error("Failed to spawn hook: {0}")]
    Spawn(String),
    #[error("Hook timed out after {0:?}")]
    Timeout(Duration),
    #[error("Hook I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid hook '{name}': {reason}")]
    InvalidConfig { name: String, reason: String },
}

/// What to run and how.
#[derive(Debug, Clone)]
pub enum HookProcess {
    /// `sh -c <command>`, with `stdin` piped to the process.
    Command { command: String, stdin: String },
    /// `sh -s`, with the script body piped to the shell.
    Script { script: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Spawn a hook in its own process group and wait for it. On timeout the
/// whole group is killed so background children do not outlive the hook.
pub async fn run_hook_process(
    process: &HookProcess,
    env: &HookEnvironment,
    cwd: Option<&PathBuf>,
    limit: Duration,
) -> Result<ProcessOutput, HookError> {
    let (args, input): (Vec<&str>, &str) = match process {
        HookProcess::Command { command, stdin } => (vec!["-c", command.as_str()], stdin.as_str()),
        HookProcess::Script { script } => (vec!["-s"], script.as_str()),
    };

    let mut cmd = tokio::process::Command::new("sh");
    cmd.args(&args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = cwd.filter(|d| d.is_dir()) {
        cmd.current_dir(dir);
    }
    for (key, value) in env.iter() {
        cmd.env(key, value);
    }
    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = cmd.spawn().map_err(|e| HookError::Spawn(e.to_string()))?;
    let pid = child.id();
    let stdin = child.stdin.take();

    // Feeding stdin and draining output run together under the timeout, so a
    // hook that never reads a large payload cannot stall the caller.
    let feed = async move {
        if let Some(mut stdin) = stdin {
            // A hook that ignores its input may close the pipe early.
            if let Err(e) = stdin.write_all(input.as_bytes()).await {
                tracing::debug!(error = %e, "Hook closed stdin before reading input");
            }
        }
    };
    let run = async move {
        let ((), output) = tokio::join!(feed, child.wait_with_output());
        output
    };

    match tokio::time::timeout(limit, run).await {
        Ok(result) => {
            let output = result?;
            Ok(ProcessOutput {
                exit_code: output.status.code(),
                stdout: String::from_utf8_lossy(&output.stdout).to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            })
        }
        Err(_) => {
            kill_group(pid);
            Err(HookError::Timeout(limit))
        }
    }
}

#[cfg(unix)]
fn kill_group(pid: Option<u32>) {
    if let Some(pid) = pid.and_then(|p| i32::try_from(p).ok()) {
        // SAFETY: pid came from a child we spawned as a group leader.
        unsafe {
            libc::killpg(pid, libc::SIGKILL);
        }
    }
}

#[cfg(not(unix))]
fn kill_group(_pid: Option<u32>) {}

// SPDX-License-Identifier: MIT OR Apache-2.0
//! Low-level process spawning shared by every adapter.

use mlld_core::MlldError;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};
use tracing::{debug, warn};

use crate::ExecOutcome;

/// Grace period between TERM and KILL when a deadline expires.
const KILL_GRACE: Duration = Duration::from_secs(2);

/// What to spawn.
#[derive(Debug, Clone, Default)]
pub struct ProcessSpec {
    /// Program to run.
    pub program: String,
    /// Arguments. Parameter *values* never appear here.
    pub args: Vec<String>,
    /// Extra environment variables (parent env is inherited).
    pub env: BTreeMap<String, String>,
    /// Working directory.
    pub cwd: Option<PathBuf>,
    /// Content piped to stdin; stdin is closed immediately when absent.
    pub stdin: Option<String>,
    /// Deadline for the whole call.
    pub timeout: Option<Duration>,
}

/// Spawn the process, feed stdin, and capture the complete outcome.
///
/// Stdout and stderr are captured separately. On deadline expiry the
/// process is terminated (TERM, then KILL after a grace period) and the
/// outcome reports `timed_out`.
///
/// # Errors
///
/// Fails when the binary cannot be spawned or a stdio channel breaks.
pub async fn run(spec: ProcessSpec) -> Result<ExecOutcome, MlldError> {
    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if let Some(cwd) = &spec.cwd {
        cmd.current_dir(cwd);
    }
    for (k, v) in &spec.env {
        cmd.env(k, v);
    }
    cmd.kill_on_drop(true);

    debug!(target: "mlld.exec", program = %spec.program, "spawn");
    let mut child = cmd.spawn().map_err(|err| {
        MlldError::execution(
            format!("failed to spawn '{}': {err}", spec.program),
            None,
        )
    })?;

    if let Some(mut stdin) = child.stdin.take() {
        if let Some(content) = &spec.stdin {
            stdin.write_all(content.as_bytes()).await?;
        }
        drop(stdin);
    }

    match spec.timeout {
        None => collect(child).await,
        Some(deadline) => {
            // Drain stdout/stderr concurrently with wait() so a chatty child
            // never blocks on a full pipe.
            let out_task = spawn_reader(child.stdout.take());
            let err_task = spawn_reader(child.stderr.take());
            let waited = tokio::time::timeout(deadline, child.wait()).await;
            let (exit_code, timed_out) = match waited {
                Ok(status) => (status?.code().unwrap_or(-1), false),
                Err(_) => {
                    warn!(target: "mlld.exec", program = %spec.program, "deadline expired");
                    terminate(&mut child).await;
                    (-1, true)
                }
            };
            let stdout = out_task.await.unwrap_or_default();
            let stderr = err_task.await.unwrap_or_default();
            Ok(ExecOutcome {
                stdout,
                stderr,
                exit_code,
                timed_out,
            })
        }
    }
}

async fn collect(child: Child) -> Result<ExecOutcome, MlldError> {
    let output = child.wait_with_output().await?;
    Ok(ExecOutcome {
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        exit_code: output.status.code().unwrap_or(-1),
        timed_out: false,
    })
}

fn spawn_reader<R>(reader: Option<R>) -> tokio::task::JoinHandle<String>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        use tokio::io::AsyncReadExt;
        let mut buf = String::new();
        if let Some(mut reader) = reader {
            let _ = reader.read_to_string(&mut buf).await;
        }
        buf
    })
}

/// TERM first, KILL after the grace period.
async fn terminate(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        let _ = Command::new("kill")
            .arg("-TERM")
            .arg(pid.to_string())
            .status()
            .await;
        if tokio::time::timeout(KILL_GRACE, child.wait()).await.is_ok() {
            return;
        }
    }
    let _ = child.kill().await;
    let _ = child.wait().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn captures_stdout_and_stderr_separately() {
        let outcome = run(ProcessSpec {
            program: "sh".into(),
            args: vec!["-c".into(), "echo out; echo err >&2".into()],
            ..ProcessSpec::default()
        })
        .await
        .unwrap();
        assert_eq!(outcome.stdout, "out\n");
        assert_eq!(outcome.stderr, "err\n");
        assert_eq!(outcome.exit_code, 0);
    }

    #[tokio::test]
    async fn reports_exit_code() {
        let outcome = run(ProcessSpec {
            program: "sh".into(),
            args: vec!["-c".into(), "exit 7".into()],
            ..ProcessSpec::default()
        })
        .await
        .unwrap();
        assert_eq!(outcome.exit_code, 7);
    }

    #[tokio::test]
    async fn stdin_reaches_the_child() {
        let outcome = run(ProcessSpec {
            program: "sh".into(),
            args: vec!["-c".into(), "cat".into()],
            stdin: Some("payload".into()),
            ..ProcessSpec::default()
        })
        .await
        .unwrap();
        assert_eq!(outcome.stdout, "payload");
    }

    #[tokio::test]
    async fn deadline_expiry_reports_timeout() {
        let outcome = run(ProcessSpec {
            program: "sh".into(),
            args: vec!["-c".into(), "sleep 30".into()],
            timeout: Some(Duration::from_millis(100)),
            ..ProcessSpec::default()
        })
        .await
        .unwrap();
        assert!(outcome.timed_out);
    }

    #[tokio::test]
    async fn missing_binary_is_a_spawn_error() {
        let err = run(ProcessSpec {
            program: "definitely-not-a-binary-mlld".into(),
            ..ProcessSpec::default()
        })
        .await
        .unwrap_err();
        assert!(err.to_string().contains("failed to spawn"));
    }
}

use anyhow::Result;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::warn;

/// Environment variables safe to pass through to child processes.
const ALLOWED_ENV_VARS: &[&str] = &[
    "PATH",
    "HOME",
    "USER",
    "LANG",
    "LC_ALL",
    "TZ",
    "TERM",
    "RUST_LOG",
    "TMPDIR",
    "XDG_RUNTIME_DIR",
];

/// Create a `Command` with a scrubbed environment.
///
/// Calls `env_clear()` then copies only the allowlisted environment
/// variables from the current process. This prevents accidental leakage
/// of API keys, tokens, and other secrets to child processes.
pub fn scrubbed_command(program: &str) -> Command {
    let mut cmd = Command::new(program);
    cmd.env_clear();
    for &var in ALLOWED_ENV_VARS {
        if let Ok(val) = std::env::var(var) {
            cmd.env(var, val);
        }
    }
    cmd
}

/// Outcome of a bounded external command run.
#[derive(Debug)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub truncated: bool,
}

/// Run an external program with an argv list, a wall-clock timeout and a
/// stdout byte cap. User-supplied content only ever appears as an argument,
/// never inside a shell string.
///
/// On timeout the child is killed and an error is returned. If stdout grows
/// past `max_output`, capture stops and the output is marked truncated.
pub async fn run_command(
    program: &str,
    args: &[&str],
    cwd: Option<&Path>,
    timeout: Duration,
    max_output: usize,
) -> Result<CommandOutput> {
    let mut cmd = scrubbed_command(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }

    let mut child = cmd
        .spawn()
        .map_err(|e| anyhow::anyhow!("failed to spawn '{}': {}", program, e))?;

    let mut stdout_pipe = child.stdout.take();
    let mut stderr_pipe = child.stderr.take();

    let capture = async {
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut truncated = false;

        if let Some(ref mut pipe) = stdout_pipe {
            let mut buf = [0u8; 8192];
            loop {
                let n = pipe.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                if stdout.len() + n > max_output {
                    let keep = max_output.saturating_sub(stdout.len());
                    stdout.extend_from_slice(&buf[..keep]);
                    truncated = true;
                    break;
                }
                stdout.extend_from_slice(&buf[..n]);
            }
        }
        if let Some(ref mut pipe) = stderr_pipe {
            // stderr is diagnostic only; cap it at the same bound
            let mut buf = [0u8; 8192];
            while stderr.len() < max_output {
                let n = pipe.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                let keep = n.min(max_output - stderr.len());
                stderr.extend_from_slice(&buf[..keep]);
            }
        }

        let status = child.wait().await?;
        anyhow::Ok((stdout, stderr, status, truncated))
    };

    match tokio::time::timeout(timeout, capture).await {
        Ok(result) => {
            let (stdout, stderr, status, truncated) = result?;
            Ok(CommandOutput {
                stdout: String::from_utf8_lossy(&stdout).into_owned(),
                stderr: String::from_utf8_lossy(&stderr).into_owned(),
                exit_code: status.code(),
                truncated,
            })
        }
        Err(_) => {
            warn!("command '{}' timed out after {:?}, killing", program, timeout);
            let _ = child.kill().await;
            Err(anyhow::anyhow!(
                "command '{}' timed out after {}s",
                program,
                timeout.as_secs()
            ))
        }
    }
}

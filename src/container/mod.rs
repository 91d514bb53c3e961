pub mod mounts;

use crate::config::{ContainerConfig, Paths};
use crate::errors::{OxiclawError, OxiclawResult};
use crate::groups::{RegisteredGroup, SessionMap};
use crate::utils::subprocess::scrubbed_command;
use crate::utils::{ensure_dir, truncate_utf8};
use mounts::MountAllowlist;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Fixed paths inside the sandbox.
const GROUP_MOUNT: &str = "/workspace/group";
const PROJECT_MOUNT: &str = "/workspace/project";
const IPC_MOUNT: &str = "/workspace/ipc";

/// Request written to the agent process's stdin.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ContainerRequest<'a> {
    prompt: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    session_id: Option<&'a str>,
    group_folder: &'a str,
    chat_jid: &'a str,
    is_main: bool,
}

/// Single JSON line the agent writes to stdout.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ContainerResponse {
    status: String,
    result: Option<String>,
    new_session_id: Option<String>,
    error: Option<String>,
}

/// The agent's reply for one run.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub result: String,
}

/// Per-group sandboxed agent launcher.
///
/// Groups never see each other's folders; only `main` gets the project
/// root. Runs for the same group serialize behind a per-group lock while
/// different groups proceed in parallel. Session ids rotate only on an
/// `ok` response.
pub struct ContainerRunner {
    config: ContainerConfig,
    paths: Paths,
    project_root: PathBuf,
    sessions: Arc<SessionMap>,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ContainerRunner {
    pub fn new(
        config: ContainerConfig,
        paths: Paths,
        project_root: PathBuf,
        sessions: Arc<SessionMap>,
    ) -> Self {
        Self {
            config,
            paths,
            project_root,
            sessions,
            locks: Mutex::new(HashMap::new()),
        }
    }

    async fn group_lock(&self, folder: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(folder.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Run the agent for a group. `use_group_session` continues the group's
    /// stored session; otherwise the run is isolated.
    pub async fn run(
        &self,
        group: &RegisteredGroup,
        prompt: &str,
        chat_jid: &str,
        use_group_session: bool,
    ) -> OxiclawResult<RunOutcome> {
        let lock = self.group_lock(&group.folder).await;
        let _guard = lock.lock().await;

        let session_id = if use_group_session {
            self.sessions.get(&group.folder).await
        } else {
            None
        };

        let request = ContainerRequest {
            prompt,
            session_id: session_id.as_deref(),
            group_folder: &group.folder,
            chat_jid,
            is_main: group.is_main(),
        };
        let request_json = serde_json::to_string(&request).map_err(|e| {
            OxiclawError::Internal(anyhow::anyhow!("request serialization: {e}"))
        })?;

        let response = self.spawn_and_capture(group, &request_json).await?;

        match response.status.as_str() {
            "ok" => {
                if use_group_session {
                    if let Some(new_id) = &response.new_session_id {
                        self.sessions
                            .set(&group.folder, new_id)
                            .await
                            .map_err(OxiclawError::Internal)?;
                        debug!("session rotated for group '{}'", group.folder);
                    }
                }
                Ok(RunOutcome {
                    result: response.result.unwrap_or_default(),
                })
            }
            _ => Err(OxiclawError::ContainerExit(
                response
                    .error
                    .unwrap_or_else(|| "agent returned an error".to_string()),
            )),
        }
    }

    fn build_args(&self, group: &RegisteredGroup) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "run".into(),
            "--rm".into(),
            "-i".into(),
            "--name".into(),
            format!(
                "oxiclaw-{}-{}",
                group.folder,
                chrono::Utc::now().timestamp_millis()
            ),
            "--memory".into(),
            self.config.memory.clone(),
        ];

        let group_dir = self.paths.group_dir(&group.folder);
        args.push("-v".into());
        args.push(format!("{}:{}", group_dir.display(), GROUP_MOUNT));

        if group.is_main() {
            args.push("-v".into());
            args.push(format!("{}:{}", self.project_root.display(), PROJECT_MOUNT));
        }

        let ipc_dir = self.paths.ipc_group_dir(&group.folder);
        args.push("-v".into());
        args.push(format!("{}:{}", ipc_dir.display(), IPC_MOUNT));

        let allowlist = MountAllowlist::load(&self.paths.mount_allowlist_file());
        for mount in allowlist.filter(&group.folder, &group.extra_mounts) {
            let suffix = if mount.readonly { ":ro" } else { "" };
            args.push("-v".into());
            args.push(format!("{}:{}{}", mount.host_path, mount.container_path, suffix));
        }

        for key in &self.config.env_passthrough {
            if let Ok(value) = std::env::var(key) {
                args.push("-e".into());
                args.push(format!("{key}={value}"));
            }
        }

        args.push(self.config.image.clone());
        args
    }

    async fn spawn_and_capture(
        &self,
        group: &RegisteredGroup,
        request_json: &str,
    ) -> OxiclawResult<ContainerResponse> {
        ensure_dir(self.paths.group_dir(&group.folder)).map_err(OxiclawError::Internal)?;
        ensure_dir(self.paths.ipc_group_dir(&group.folder)).map_err(OxiclawError::Internal)?;

        let args = self.build_args(group);
        info!(
            "starting container for group '{}' ({})",
            group.folder, self.config.image
        );

        let mut cmd = scrubbed_command(&self.config.runtime);
        cmd.args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(|e| {
            OxiclawError::Internal(anyhow::anyhow!(
                "failed to spawn container runtime '{}': {e}",
                self.config.runtime
            ))
        })?;

        // Write the request then close stdin so the agent sees EOF.
        if let Some(mut stdin) = child.stdin.take() {
            let payload = format!("{request_json}\n");
            stdin
                .write_all(payload.as_bytes())
                .await
                .map_err(|e| OxiclawError::Internal(anyhow::anyhow!("stdin write: {e}")))?;
        }

        let mut stdout_pipe = child.stdout.take();
        let stderr_pipe = child.stderr.take();
        let max_output = self.config.max_output_bytes;

        // Drain stderr on its own task so a chatty agent cannot block the
        // child while we wait on stdout; the log keeps only the first 256 KiB.
        let stderr_handle = tokio::spawn(async move {
            let mut stderr = Vec::new();
            if let Some(mut pipe) = stderr_pipe {
                let mut buf = [0u8; 8192];
                loop {
                    match pipe.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            let room = (256 * 1024_usize).saturating_sub(stderr.len());
                            stderr.extend_from_slice(&buf[..n.min(room)]);
                        }
                    }
                }
            }
            stderr
        });

        let stdout_capture = async {
            let mut stdout = Vec::new();
            let mut oversize = false;
            if let Some(ref mut pipe) = stdout_pipe {
                let mut buf = [0u8; 8192];
                loop {
                    let n = pipe.read(&mut buf).await.map_err(|e| {
                        OxiclawError::Internal(anyhow::anyhow!("stdout read: {e}"))
                    })?;
                    if n == 0 {
                        break;
                    }
                    if stdout.len() + n > max_output {
                        oversize = true;
                        break;
                    }
                    stdout.extend_from_slice(&buf[..n]);
                }
            }
            Ok::<_, OxiclawError>((stdout, oversize))
        };

        let timeout = Duration::from_secs(self.config.timeout_secs);
        let (stdout, oversize) = match tokio::time::timeout(timeout, stdout_capture).await {
            Ok(result) => result?,
            Err(_) => {
                warn!(
                    "container for group '{}' timed out after {}s, killing",
                    group.folder, self.config.timeout_secs
                );
                let _ = child.kill().await;
                stderr_handle.abort();
                return Err(OxiclawError::ContainerTimeout(self.config.timeout_secs));
            }
        };

        if oversize {
            warn!(
                "container for group '{}' exceeded {} output bytes, killing",
                group.folder, max_output
            );
            let _ = child.kill().await;
            stderr_handle.abort();
            return Err(OxiclawError::ContainerOversize(max_output));
        }

        // stdout hit EOF; the child is exiting (or already gone).
        let status = match tokio::time::timeout(Duration::from_secs(10), child.wait()).await {
            Ok(result) => result
                .map_err(|e| OxiclawError::Internal(anyhow::anyhow!("container wait: {e}")))?,
            Err(_) => {
                warn!(
                    "container for group '{}' closed stdout but did not exit, killing",
                    group.folder
                );
                let _ = child.kill().await;
                stderr_handle.abort();
                return Err(OxiclawError::ContainerTimeout(self.config.timeout_secs));
            }
        };

        let stderr = stderr_handle.await.unwrap_or_default();
        self.append_log(&group.folder, &stderr);

        let stdout_str = String::from_utf8_lossy(&stdout);
        let response_line = stdout_str
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .unwrap_or("");

        match serde_json::from_str::<ContainerResponse>(response_line) {
            Ok(response) => Ok(response),
            Err(e) => {
                if status.success() {
                    Err(OxiclawError::ContainerExit(format!(
                        "unparseable agent response: {e}"
                    )))
                } else {
                    Err(OxiclawError::ContainerExit(format!(
                        "container exited with {:?}: {}",
                        status.code(),
                        truncate_utf8(&String::from_utf8_lossy(&stderr), 500)
                    )))
                }
            }
        }
    }

    /// Append container stderr to the group's log directory.
    fn append_log(&self, folder: &str, stderr: &[u8]) {
        if stderr.is_empty() {
            return;
        }
        let dir = self.paths.group_logs_dir(folder);
        if let Err(e) = std::fs::create_dir_all(&dir) {
            warn!("cannot create log dir {}: {}", dir.display(), e);
            return;
        }
        let file = dir.join(format!(
            "container-{}.log",
            chrono::Utc::now().format("%Y%m%d")
        ));
        use std::io::Write;
        let result = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&file)
            .and_then(|mut f| f.write_all(stderr));
        if let Err(e) = result {
            warn!("cannot append container log {}: {}", file.display(), e);
        }
    }
}

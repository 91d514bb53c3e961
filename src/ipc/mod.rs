pub mod payload;

use crate::config::Paths;
use crate::groups::{GroupRegistry, MAIN_GROUP};
use crate::handlers::{dispatch_logged, HandlerContext};
use crate::utils::task_tracker::TaskTracker;
use anyhow::Result;
use payload::IpcEnvelope;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

const POLL_INTERVAL_MS: u64 = 1000;
/// Subdirectories scanned inside each group's IPC directory.
const DROP_DIRS: &[&str] = &["messages", "tasks"];

/// File-drop broker: `data/ipc/<group>/{messages,tasks}/*.json`.
///
/// Producers write `<file>.tmp` then rename, so any `*.json` we see is
/// complete. The source directory is the caller's identity; payload fields
/// never override it. Handled files are deleted; failed ones move to
/// `data/ipc/errors/<group>-<file>`.
pub struct IpcBroker {
    paths: Paths,
    registry: Arc<GroupRegistry>,
    ctx: Arc<HandlerContext>,
    tracker: Arc<TaskTracker>,
}

impl IpcBroker {
    pub fn new(
        paths: Paths,
        registry: Arc<GroupRegistry>,
        ctx: Arc<HandlerContext>,
        tracker: Arc<TaskTracker>,
    ) -> Self {
        Self {
            paths,
            registry,
            ctx,
            tracker,
        }
    }

    /// Start polling. Duplicate starts replace the previous loop.
    pub async fn start(self: &Arc<Self>) {
        let broker = self.clone();
        self.tracker
            .spawn_auto_cleanup("ipc_broker".to_string(), async move {
                let mut interval = tokio::time::interval(std::time::Duration::from_millis(
                    POLL_INTERVAL_MS,
                ));
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    interval.tick().await;
                    if let Err(e) = broker.poll_once().await {
                        error!("ipc poll failed: {}", e);
                    }
                }
            })
            .await;
        info!("ipc broker started");
    }

    /// One pass over every group directory.
    pub async fn poll_once(&self) -> Result<()> {
        let ipc_dir = self.paths.ipc_dir();
        let entries = match std::fs::read_dir(&ipc_dir) {
            Ok(entries) => entries,
            Err(_) => return Ok(()),
        };

        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let Some(source_group) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if source_group == "errors" {
                continue;
            }
            self.drain_group(source_group, &path).await;
        }
        Ok(())
    }

    async fn drain_group(&self, source_group: &str, group_dir: &Path) {
        for drop_dir in DROP_DIRS {
            let dir = group_dir.join(drop_dir);
            let Ok(entries) = std::fs::read_dir(&dir) else {
                continue;
            };
            let mut files: Vec<PathBuf> = entries
                .flatten()
                .map(|e| e.path())
                .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("json"))
                .collect();
            files.sort();

            for file in files {
                self.consume_file(source_group, &file).await;
            }
        }
    }

    async fn consume_file(&self, source_group: &str, file: &Path) {
        debug!("ipc file from '{}': {}", source_group, file.display());

        let handled = self.handle_file(source_group, file).await;
        match handled {
            Ok(()) => {
                if let Err(e) = std::fs::remove_file(file) {
                    warn!("cannot remove handled ipc file {}: {}", file.display(), e);
                }
            }
            Err(e) => {
                warn!(
                    "ipc file {} from '{}' rejected: {}",
                    file.display(),
                    source_group,
                    e
                );
                self.quarantine(source_group, file);
            }
        }
    }

    async fn handle_file(&self, source_group: &str, file: &Path) -> Result<()> {
        let content = std::fs::read_to_string(file)?;
        let envelope: IpcEnvelope = serde_json::from_str(&content)
            .map_err(|e| anyhow::anyhow!("invalid payload: {e}"))?;

        if !self.registry.is_registered_folder(source_group).await {
            anyhow::bail!("source group '{}' is not registered", source_group);
        }
        let is_main = source_group == MAIN_GROUP;

        dispatch_logged(&self.ctx, envelope.payload, source_group, is_main)
            .await
            .map_err(|e| anyhow::anyhow!(e.to_string()))
    }

    /// Move a rejected payload to `errors/<group>-<file>` for inspection.
    fn quarantine(&self, source_group: &str, file: &Path) {
        let errors_dir = self.paths.ipc_errors_dir();
        if let Err(e) = std::fs::create_dir_all(&errors_dir) {
            warn!("cannot create ipc errors dir: {}", e);
            return;
        }
        let name = file
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("payload.json");
        let target = errors_dir.join(format!("{source_group}-{name}"));
        if let Err(e) = std::fs::rename(file, &target) {
            warn!(
                "cannot quarantine {} to {}: {}",
                file.display(),
                target.display(),
                e
            );
            let _ = std::fs::remove_file(file);
        }
    }
}

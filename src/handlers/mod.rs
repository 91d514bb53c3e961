mod kb;
mod projects;

pub use projects::{load_projects, ProjectRegistry};

use crate::config::{Paths, ToolsConfig};
use crate::errors::{OxiclawError, OxiclawResult};
use crate::groups::{
    folder_slug, now_iso, write_snapshots, ExtraMount, GroupRegistry, RegisteredGroup,
};
use crate::ipc::payload::IpcPayload;
use crate::kb::KbPipeline;
use crate::store::{call_blocking, ContextMode, ScheduleType, Store, Task, TaskStatus};
use crate::transport::TransportAdapter;
use crate::utils::ensure_dir;
use chrono_tz::Tz;
use std::sync::Arc;
use tracing::{info, warn};

/// Starter instructions dropped into a freshly registered group folder.
const GROUP_INSTRUCTIONS_TEMPLATE: &str = "\
# Group instructions

You are the assistant for this group. Keep replies short and conversational.
Files in this folder persist between runs; use them for notes and state.
";

/// Everything the IPC handlers need to execute effects.
pub struct HandlerContext {
    pub store: Arc<Store>,
    pub registry: Arc<GroupRegistry>,
    pub adapter: Arc<TransportAdapter>,
    pub kb: Arc<KbPipeline>,
    pub paths: Paths,
    pub tools: ToolsConfig,
    pub timezone: Tz,
}

impl HandlerContext {
    /// Central authorization rule: the source directory is the identity.
    /// A payload may only name another group when the caller is `main`.
    fn resolve_target_group(
        &self,
        source_group: &str,
        requested: Option<&str>,
        is_main: bool,
    ) -> OxiclawResult<String> {
        match requested {
            None => Ok(source_group.to_string()),
            Some(target) if target == source_group || is_main => Ok(target.to_string()),
            Some(target) => Err(OxiclawError::Unauthorized {
                from_group: source_group.to_string(),
                target: target.to_string(),
            }),
        }
    }

    /// A chat may be messaged when it belongs to the caller's group, or the
    /// caller is `main`.
    async fn authorize_chat(
        &self,
        source_group: &str,
        chat_jid: &str,
        is_main: bool,
    ) -> OxiclawResult<()> {
        if is_main {
            return Ok(());
        }
        match self.registry.by_jid(chat_jid).await {
            Some(group) if group.folder == source_group => Ok(()),
            _ => Err(OxiclawError::Unauthorized {
                from_group: source_group.to_string(),
                target: chat_jid.to_string(),
            }),
        }
    }

    fn require_main(&self, source_group: &str, is_main: bool, action: &str) -> OxiclawResult<()> {
        if is_main {
            Ok(())
        } else {
            Err(OxiclawError::Unauthorized {
                from_group: source_group.to_string(),
                target: action.to_string(),
            })
        }
    }

    pub async fn refresh_snapshots(&self) -> OxiclawResult<()> {
        let last_sync = {
            let store = self.store.clone();
            call_blocking(store, |s| s.last_group_sync())
                .await?
                .unwrap_or_else(now_iso)
        };
        write_snapshots(&self.paths, &self.registry, &self.store, &last_sync)
            .await
            .map_err(OxiclawError::Internal)
    }

    /// Execute one IPC payload on behalf of `source_group`.
    pub async fn dispatch(
        &self,
        payload: IpcPayload,
        source_group: &str,
        is_main: bool,
    ) -> OxiclawResult<()> {
        match payload {
            IpcPayload::Message { chat_jid, text } => {
                self.handle_message(source_group, is_main, &chat_jid, &text)
                    .await
            }
            IpcPayload::ScheduleTask {
                group_folder,
                prompt,
                schedule_type,
                schedule_value,
                context_mode,
            } => {
                self.handle_schedule_task(
                    source_group,
                    is_main,
                    group_folder.as_deref(),
                    &prompt,
                    &schedule_type,
                    &schedule_value,
                    context_mode.as_deref(),
                )
                .await
            }
            IpcPayload::PauseTask { task_id } => {
                self.handle_task_status(source_group, is_main, &task_id, TaskStatus::Paused)
                    .await
            }
            IpcPayload::ResumeTask { task_id } => {
                self.handle_task_status(source_group, is_main, &task_id, TaskStatus::Active)
                    .await
            }
            IpcPayload::CancelTask { task_id } => {
                self.handle_cancel_task(source_group, is_main, &task_id).await
            }
            IpcPayload::RegisterGroup {
                jid,
                name,
                trigger,
                folder,
                extra_mounts,
            } => {
                self.handle_register_group(
                    source_group,
                    is_main,
                    &jid,
                    &name,
                    &trigger,
                    folder.as_deref(),
                    extra_mounts,
                )
                .await
            }
            IpcPayload::RefreshGroups {} => {
                self.require_main(source_group, is_main, "refresh_groups")?;
                self.adapter
                    .sync_group_metadata()
                    .await
                    .map_err(OxiclawError::Internal)?;
                self.refresh_snapshots().await
            }
            IpcPayload::KbAdd {
                url,
                text,
                title,
                source_type,
                tags,
            } => {
                self.handle_kb_add(source_group, url, text, title, source_type, tags)
                    .await
            }
            IpcPayload::KbSearch {
                query,
                limit,
                min_similarity,
                dedupe_by_source,
            } => {
                self.handle_kb_search(source_group, &query, limit, min_similarity, dedupe_by_source)
                    .await
            }
            IpcPayload::KbList {} => self.handle_kb_list(source_group).await,
            IpcPayload::KbUpdate {
                source_id,
                content,
                title,
                tags,
            } => {
                self.handle_kb_update(source_group, source_id, content, title, tags)
                    .await
            }
            IpcPayload::KbDelete { source_id } => {
                self.handle_kb_delete(source_group, &source_id).await
            }
            IpcPayload::GithubCli { chat_jid, args } => {
                self.handle_github(source_group, is_main, &chat_jid, &args)
                    .await
            }
            IpcPayload::SugarCli {
                chat_jid,
                project,
                args,
            } => {
                self.handle_sugar(source_group, is_main, &chat_jid, &project, &args)
                    .await
            }
        }
    }

    async fn handle_message(
        &self,
        source_group: &str,
        is_main: bool,
        chat_jid: &str,
        text: &str,
    ) -> OxiclawResult<()> {
        self.authorize_chat(source_group, chat_jid, is_main).await?;
        self.adapter
            .send_as_assistant(chat_jid, text)
            .await
            .map_err(|e| OxiclawError::Transport(e.to_string()))?;
        info!("ipc message from '{}' delivered to {}", source_group, chat_jid);
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn handle_schedule_task(
        &self,
        source_group: &str,
        is_main: bool,
        requested_group: Option<&str>,
        prompt: &str,
        schedule_type: &str,
        schedule_value: &str,
        context_mode: Option<&str>,
    ) -> OxiclawResult<()> {
        let target = self.resolve_target_group(source_group, requested_group, is_main)?;
        let Some(group) = self.registry.by_folder(&target).await else {
            return Err(OxiclawError::NotRegistered(target));
        };

        let schedule_type = ScheduleType::parse(schedule_type).ok_or_else(|| {
            OxiclawError::InvalidPayload(format!("unknown scheduleType '{schedule_type}'"))
        })?;
        let context_mode = match context_mode {
            None => ContextMode::Group,
            Some(raw) => ContextMode::parse(raw).ok_or_else(|| {
                OxiclawError::InvalidPayload(format!("unknown contextMode '{raw}'"))
            })?,
        };
        if prompt.trim().is_empty() {
            return Err(OxiclawError::InvalidPayload("empty prompt".to_string()));
        }

        let next_run = crate::scheduler::compute_next_run(
            schedule_type,
            schedule_value,
            &self.timezone,
            chrono::Utc::now(),
        )?;

        // The chat jid comes from the registry, never from the payload.
        let task = Task {
            id: uuid::Uuid::new_v4().to_string(),
            group_folder: group.folder.clone(),
            chat_jid: group.jid.clone(),
            prompt: prompt.to_string(),
            schedule_type,
            schedule_value: schedule_value.to_string(),
            context_mode,
            next_run: Some(next_run),
            status: TaskStatus::Active,
            created_at: now_iso(),
        };
        let task_id = task.id.clone();
        {
            let store = self.store.clone();
            call_blocking(store, move |s| s.create_task(&task)).await?;
        }
        info!(
            "task {} scheduled for group '{}' by '{}'",
            task_id, group.folder, source_group
        );
        self.refresh_snapshots().await
    }

    async fn authorize_task(
        &self,
        source_group: &str,
        is_main: bool,
        task_id: &str,
    ) -> OxiclawResult<Task> {
        let task = {
            let store = self.store.clone();
            let id = task_id.to_string();
            call_blocking(store, move |s| s.get_task(&id)).await?
        };
        let Some(task) = task else {
            return Err(OxiclawError::InvalidPayload(format!(
                "unknown task {task_id}"
            )));
        };
        if !is_main && task.group_folder != source_group {
            return Err(OxiclawError::Unauthorized {
                from_group: source_group.to_string(),
                target: task.group_folder,
            });
        }
        Ok(task)
    }

    async fn handle_task_status(
        &self,
        source_group: &str,
        is_main: bool,
        task_id: &str,
        status: TaskStatus,
    ) -> OxiclawResult<()> {
        let task = self.authorize_task(source_group, is_main, task_id).await?;
        if matches!(task.status, TaskStatus::Done | TaskStatus::Failed) {
            return Err(OxiclawError::InvalidPayload(format!(
                "task {} is {}, cannot change",
                task_id,
                task.status.as_str()
            )));
        }
        {
            let store = self.store.clone();
            let id = task_id.to_string();
            call_blocking(store, move |s| s.update_task_status(&id, status).map(|_| ())).await?;
        }
        info!("task {} set to {}", task_id, status.as_str());
        self.refresh_snapshots().await
    }

    /// Cancel removes future runs entirely. An in-flight agent process is
    /// not killed.
    async fn handle_cancel_task(
        &self,
        source_group: &str,
        is_main: bool,
        task_id: &str,
    ) -> OxiclawResult<()> {
        self.authorize_task(source_group, is_main, task_id).await?;
        {
            let store = self.store.clone();
            let id = task_id.to_string();
            call_blocking(store, move |s| s.delete_task(&id).map(|_| ())).await?;
        }
        info!("task {} cancelled", task_id);
        self.refresh_snapshots().await
    }

    #[allow(clippy::too_many_arguments)]
    async fn handle_register_group(
        &self,
        source_group: &str,
        is_main: bool,
        jid: &str,
        name: &str,
        trigger: &str,
        folder: Option<&str>,
        extra_mounts: Vec<ExtraMount>,
    ) -> OxiclawResult<()> {
        self.require_main(source_group, is_main, "register_group")?;

        if jid.trim().is_empty() || name.trim().is_empty() || trigger.trim().is_empty() {
            return Err(OxiclawError::InvalidPayload(
                "register_group needs jid, name and trigger".to_string(),
            ));
        }
        let folder = match folder {
            Some(f) => {
                let slug = folder_slug(f);
                if slug != f {
                    return Err(OxiclawError::InvalidPayload(format!(
                        "folder '{f}' is not a clean slug"
                    )));
                }
                slug
            }
            None => folder_slug(name),
        };
        if folder == "errors" {
            return Err(OxiclawError::InvalidPayload(
                "folder 'errors' is reserved".to_string(),
            ));
        }

        // Group workspace, logs, IPC drop dirs and starter instructions.
        let group_dir = self.paths.group_dir(&folder);
        ensure_dir(&group_dir).map_err(OxiclawError::Internal)?;
        ensure_dir(self.paths.group_logs_dir(&folder)).map_err(OxiclawError::Internal)?;
        ensure_dir(self.paths.ipc_group_dir(&folder).join("messages"))
            .map_err(OxiclawError::Internal)?;
        ensure_dir(self.paths.ipc_group_dir(&folder).join("tasks"))
            .map_err(OxiclawError::Internal)?;
        let instructions = group_dir.join("CLAUDE.md");
        if !instructions.exists() {
            std::fs::write(&instructions, GROUP_INSTRUCTIONS_TEMPLATE)
                .map_err(|e| OxiclawError::Internal(e.into()))?;
        }

        self.registry
            .register(RegisteredGroup {
                jid: jid.to_string(),
                name: name.to_string(),
                folder,
                trigger: trigger.to_string(),
                added_at: now_iso(),
                extra_mounts,
            })
            .await
            .map_err(|e| OxiclawError::InvalidPayload(e.to_string()))?;

        self.refresh_snapshots().await
    }
}

/// Outcomes are logged here so a handler failure never kills the broker.
pub async fn dispatch_logged(
    ctx: &HandlerContext,
    payload: IpcPayload,
    source_group: &str,
    is_main: bool,
) -> OxiclawResult<()> {
    let kind = payload.kind();
    let result = ctx.dispatch(payload, source_group, is_main).await;
    if let Err(e) = &result {
        match e {
            OxiclawError::Unauthorized { .. } => {
                // Log-and-drop: never surfaced to any chat.
                warn!("ipc {} from '{}' rejected: {}", kind, source_group, e);
            }
            _ => warn!("ipc {} from '{}' failed: {}", kind, source_group, e),
        }
    }
    result
}

use crate::config::Paths;
use crate::store::{Store, Task};
use crate::utils::atomic_write;
use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// The privileged group folder. `main` fires on every message and may act
/// on any group through IPC.
pub const MAIN_GROUP: &str = "main";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtraMount {
    #[serde(rename = "hostPath")]
    pub host_path: String,
    #[serde(rename = "containerPath")]
    pub container_path: String,
    #[serde(default)]
    pub readonly: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisteredGroup {
    pub jid: String,
    pub name: String,
    /// Filesystem-safe slug, unique across groups.
    pub folder: String,
    /// Word-bounded prefix that addresses the assistant, e.g. "@Alfred".
    pub trigger: String,
    #[serde(rename = "addedAt")]
    pub added_at: String,
    #[serde(default, rename = "extraMounts", skip_serializing_if = "Vec::is_empty")]
    pub extra_mounts: Vec<ExtraMount>,
}

impl RegisteredGroup {
    pub fn is_main(&self) -> bool {
        self.folder == MAIN_GROUP
    }
}

/// Registered groups, keyed by jid, persisted to
/// `data/registered_groups.json` via tmp→rename.
pub struct GroupRegistry {
    path: std::path::PathBuf,
    groups: Mutex<HashMap<String, RegisteredGroup>>,
}

impl GroupRegistry {
    pub fn load(paths: &Paths) -> Result<Self> {
        let path = paths.registered_groups_file();
        let groups = if path.exists() {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse {}", path.display()))?
        } else {
            HashMap::new()
        };
        Ok(Self {
            path,
            groups: Mutex::new(groups),
        })
    }

    pub async fn all(&self) -> Vec<RegisteredGroup> {
        self.groups.lock().await.values().cloned().collect()
    }

    pub async fn jids(&self) -> Vec<String> {
        self.groups.lock().await.keys().cloned().collect()
    }

    pub async fn by_jid(&self, jid: &str) -> Option<RegisteredGroup> {
        self.groups.lock().await.get(jid).cloned()
    }

    pub async fn by_folder(&self, folder: &str) -> Option<RegisteredGroup> {
        self.groups
            .lock()
            .await
            .values()
            .find(|g| g.folder == folder)
            .cloned()
    }

    pub async fn is_registered_folder(&self, folder: &str) -> bool {
        self.by_folder(folder).await.is_some()
    }

    /// Register a group. Fails if the jid or folder slug is already taken.
    pub async fn register(&self, group: RegisteredGroup) -> Result<()> {
        let mut groups = self.groups.lock().await;
        if groups.contains_key(&group.jid) {
            anyhow::bail!("jid '{}' is already registered", group.jid);
        }
        if groups.values().any(|g| g.folder == group.folder) {
            anyhow::bail!("folder '{}' is already taken", group.folder);
        }
        info!("registering group '{}' as folder '{}'", group.name, group.folder);
        groups.insert(group.jid.clone(), group);
        self.persist(&groups)
    }

    fn persist(&self, groups: &HashMap<String, RegisteredGroup>) -> Result<()> {
        let content = serde_json::to_string_pretty(groups)?;
        atomic_write(&self.path, &content)
    }
}

/// Turn a display name into a stable filesystem-safe folder slug.
pub fn folder_slug(name: &str) -> String {
    let slug: String = name
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    let slug = slug.trim_matches('-').to_string();
    let mut out = String::with_capacity(slug.len());
    let mut prev_dash = false;
    for c in slug.chars() {
        if c == '-' {
            if !prev_dash {
                out.push(c);
            }
            prev_dash = true;
        } else {
            out.push(c);
            prev_dash = false;
        }
    }
    if out.is_empty() {
        "group".to_string()
    } else {
        out
    }
}

/// `folder → session_id` map persisted to `data/sessions.json`. Session ids
/// are opaque continuation tokens returned by the agent container; exactly
/// one per group, rotated whenever a run returns a new one.
pub struct SessionMap {
    path: std::path::PathBuf,
    sessions: Mutex<HashMap<String, String>>,
}

impl SessionMap {
    pub fn load(paths: &Paths) -> Result<Self> {
        let path = paths.sessions_file();
        let sessions = if path.exists() {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse {}", path.display()))?
        } else {
            HashMap::new()
        };
        Ok(Self {
            path,
            sessions: Mutex::new(sessions),
        })
    }

    pub async fn get(&self, folder: &str) -> Option<String> {
        self.sessions.lock().await.get(folder).cloned()
    }

    pub async fn set(&self, folder: &str, session_id: &str) -> Result<()> {
        let mut sessions = self.sessions.lock().await;
        sessions.insert(folder.to_string(), session_id.to_string());
        let content = serde_json::to_string_pretty(&*sessions)?;
        atomic_write(&self.path, &content)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RouterStateData {
    /// High-water mark for the intake loop; never moves past an unhandled
    /// message.
    #[serde(default, rename = "lastTimestamp")]
    pub last_timestamp: String,
    /// Per-chat high-water mark for context-window assembly.
    #[serde(default, rename = "lastAgentTimestamp")]
    pub last_agent_timestamp: HashMap<String, String>,
}

/// Intake progress persisted to `data/router_state.json`.
pub struct RouterState {
    path: std::path::PathBuf,
    state: Mutex<RouterStateData>,
}

impl RouterState {
    pub fn load(paths: &Paths) -> Result<Self> {
        let path = paths.router_state_file();
        let state = if path.exists() {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            serde_json::from_str(&content).unwrap_or_else(|e| {
                warn!("router_state.json unreadable ({}), starting fresh", e);
                RouterStateData::default()
            })
        } else {
            RouterStateData::default()
        };
        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    pub async fn last_timestamp(&self) -> String {
        self.state.lock().await.last_timestamp.clone()
    }

    pub async fn last_agent_timestamp(&self, jid: &str) -> Option<String> {
        self.state.lock().await.last_agent_timestamp.get(jid).cloned()
    }

    /// Record successful handling of a message: advance both the per-chat
    /// and the global high-water marks.
    pub async fn advance(&self, jid: &str, timestamp: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        state
            .last_agent_timestamp
            .insert(jid.to_string(), timestamp.to_string());
        if timestamp > state.last_timestamp.as_str() {
            state.last_timestamp = timestamp.to_string();
        }
        let content = serde_json::to_string_pretty(&*state)?;
        atomic_write(&self.path, &content)
    }

    /// Mark a message as consumed without an agent interaction (trigger
    /// miss). The per-chat mark stays put so the message remains in the
    /// next context window.
    pub async fn advance_global(&self, timestamp: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        if timestamp > state.last_timestamp.as_str() {
            state.last_timestamp = timestamp.to_string();
        }
        let content = serde_json::to_string_pretty(&*state)?;
        atomic_write(&self.path, &content)
    }
}

/// Snapshot entry for `available_groups.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupSnapshotEntry {
    pub jid: String,
    pub name: String,
    #[serde(rename = "lastActivity")]
    pub last_activity: String,
    #[serde(rename = "isRegistered")]
    pub is_registered: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupsSnapshot {
    pub groups: Vec<GroupSnapshotEntry>,
    #[serde(rename = "lastSync")]
    pub last_sync: String,
}

/// Write the per-group snapshot files the agent containers read.
///
/// Each group's IPC directory gets its own authorization-filtered view:
/// `main` sees every observed chat and every task; other groups see only
/// their own registration and their own tasks.
pub async fn write_snapshots(
    paths: &Paths,
    registry: &GroupRegistry,
    store: &Arc<Store>,
    last_sync: &str,
) -> Result<()> {
    let groups = registry.all().await;
    let chats = {
        let store = store.clone();
        crate::store::call_blocking(store, |s| s.list_chats()).await?
    };
    let tasks = {
        let store = store.clone();
        crate::store::call_blocking(store, |s| s.list_tasks()).await?
    };

    let registered_jids: HashMap<&str, &RegisteredGroup> =
        groups.iter().map(|g| (g.jid.as_str(), g)).collect();

    let full_listing: Vec<GroupSnapshotEntry> = chats
        .iter()
        .map(|c| GroupSnapshotEntry {
            jid: c.jid.clone(),
            name: c.name.clone(),
            last_activity: c.last_message_time.clone(),
            is_registered: registered_jids.contains_key(c.jid.as_str()),
        })
        .collect();

    for group in &groups {
        let visible_groups = if group.is_main() {
            full_listing.clone()
        } else {
            full_listing
                .iter()
                .filter(|e| e.jid == group.jid)
                .cloned()
                .collect()
        };
        let snapshot = GroupsSnapshot {
            groups: visible_groups,
            last_sync: last_sync.to_string(),
        };

        let visible_tasks: Vec<&Task> = if group.is_main() {
            tasks.iter().collect()
        } else {
            tasks
                .iter()
                .filter(|t| t.group_folder == group.folder)
                .collect()
        };

        let dir = paths.ipc_group_dir(&group.folder);
        atomic_write(
            &dir.join("available_groups.json"),
            &serde_json::to_string_pretty(&snapshot)?,
        )?;
        atomic_write(
            &dir.join("current_tasks.json"),
            &serde_json::to_string_pretty(&visible_tasks)?,
        )?;
    }
    Ok(())
}

pub fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{ContextMode, ScheduleType, TaskStatus};

    fn test_paths() -> (tempfile::TempDir, Paths) {
        let tmp = tempfile::TempDir::new().unwrap();
        let paths = Paths::new(tmp.path().to_path_buf());
        paths.ensure_layout().unwrap();
        (tmp, paths)
    }

    fn group(jid: &str, folder: &str) -> RegisteredGroup {
        RegisteredGroup {
            jid: jid.to_string(),
            name: folder.to_string(),
            folder: folder.to_string(),
            trigger: "@Bhavi".to_string(),
            added_at: now_iso(),
            extra_mounts: vec![],
        }
    }

    #[tokio::test]
    async fn register_rejects_duplicate_folder() {
        let (_tmp, paths) = test_paths();
        let registry = GroupRegistry::load(&paths).unwrap();
        registry.register(group("1@g.us", "family")).await.unwrap();
        let err = registry.register(group("2@g.us", "family")).await;
        assert!(err.is_err());
        assert!(registry.by_jid("1@g.us").await.is_some());
        assert!(registry.by_jid("2@g.us").await.is_none());
    }

    #[tokio::test]
    async fn registry_persists_across_loads() {
        let (_tmp, paths) = test_paths();
        {
            let registry = GroupRegistry::load(&paths).unwrap();
            registry.register(group("1@g.us", "family")).await.unwrap();
        }
        let reloaded = GroupRegistry::load(&paths).unwrap();
        let got = reloaded.by_folder("family").await.unwrap();
        assert_eq!(got.jid, "1@g.us");
        assert_eq!(got.trigger, "@Bhavi");
    }

    #[tokio::test]
    async fn session_map_rotates() {
        let (_tmp, paths) = test_paths();
        let sessions = SessionMap::load(&paths).unwrap();
        assert!(sessions.get("family").await.is_none());
        sessions.set("family", "sess-1").await.unwrap();
        sessions.set("family", "sess-2").await.unwrap();
        assert_eq!(sessions.get("family").await.as_deref(), Some("sess-2"));

        let reloaded = SessionMap::load(&paths).unwrap();
        assert_eq!(reloaded.get("family").await.as_deref(), Some("sess-2"));
    }

    #[tokio::test]
    async fn router_state_advances_monotonically() {
        let (_tmp, paths) = test_paths();
        let state = RouterState::load(&paths).unwrap();
        state.advance("1@g.us", "2026-02-01T10:00:05Z").await.unwrap();
        // An older per-chat timestamp must not regress the global mark
        state.advance("2@g.us", "2026-02-01T10:00:01Z").await.unwrap();
        assert_eq!(state.last_timestamp().await, "2026-02-01T10:00:05Z");
        assert_eq!(
            state.last_agent_timestamp("2@g.us").await.as_deref(),
            Some("2026-02-01T10:00:01Z")
        );
    }

    #[test]
    fn folder_slug_normalizes() {
        assert_eq!(folder_slug("Family Chat"), "family-chat");
        assert_eq!(folder_slug("  Büro // 2026  "), "b-ro-2026");
        assert_eq!(folder_slug("***"), "group");
    }

    #[tokio::test]
    async fn snapshots_filtered_by_authorization() {
        let (_tmp, paths) = test_paths();
        let registry = GroupRegistry::load(&paths).unwrap();
        registry.register(group("main@g.us", "main")).await.unwrap();
        registry.register(group("fam@g.us", "family")).await.unwrap();

        let store = Arc::new(Store::open_in_memory().unwrap());
        store
            .store_chat("fam@g.us", "Family", "2026-02-01T10:00:00Z")
            .unwrap();
        store
            .store_chat("other@g.us", "Unregistered", "2026-02-01T09:00:00Z")
            .unwrap();
        store
            .create_task(&Task {
                id: "t1".to_string(),
                group_folder: "family".to_string(),
                chat_jid: "fam@g.us".to_string(),
                prompt: "p".to_string(),
                schedule_type: ScheduleType::Once,
                schedule_value: "2026-03-01T00:00:00Z".to_string(),
                context_mode: ContextMode::Isolated,
                next_run: Some("2026-03-01T00:00:00Z".to_string()),
                status: TaskStatus::Active,
                created_at: now_iso(),
            })
            .unwrap();
        store
            .create_task(&Task {
                id: "t2".to_string(),
                group_folder: "main".to_string(),
                chat_jid: "main@g.us".to_string(),
                prompt: "p".to_string(),
                schedule_type: ScheduleType::Once,
                schedule_value: "2026-03-01T00:00:00Z".to_string(),
                context_mode: ContextMode::Isolated,
                next_run: Some("2026-03-01T00:00:00Z".to_string()),
                status: TaskStatus::Active,
                created_at: now_iso(),
            })
            .unwrap();

        write_snapshots(&paths, &registry, &store, "2026-02-01T11:00:00Z")
            .await
            .unwrap();

        let main_groups: GroupsSnapshot = serde_json::from_str(
            &std::fs::read_to_string(paths.ipc_group_dir("main").join("available_groups.json"))
                .unwrap(),
        )
        .unwrap();
        assert_eq!(main_groups.groups.len(), 2);

        let family_groups: GroupsSnapshot = serde_json::from_str(
            &std::fs::read_to_string(
                paths.ipc_group_dir("family").join("available_groups.json"),
            )
            .unwrap(),
        )
        .unwrap();
        assert_eq!(family_groups.groups.len(), 1);
        assert_eq!(family_groups.groups[0].jid, "fam@g.us");
        assert!(family_groups.groups[0].is_registered);

        let family_tasks: Vec<Task> = serde_json::from_str(
            &std::fs::read_to_string(paths.ipc_group_dir("family").join("current_tasks.json"))
                .unwrap(),
        )
        .unwrap();
        assert_eq!(family_tasks.len(), 1);
        assert_eq!(family_tasks[0].id, "t1");

        let main_tasks: Vec<Task> = serde_json::from_str(
            &std::fs::read_to_string(paths.ipc_group_dir("main").join("current_tasks.json"))
                .unwrap(),
        )
        .unwrap();
        assert_eq!(main_tasks.len(), 2);
    }
}

use crate::groups::ExtraMount;
use serde::{Deserialize, Serialize};

/// One file-drop from an agent: a typed payload plus the common envelope
/// fields every producer stamps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpcEnvelope {
    #[serde(flatten)]
    pub payload: IpcPayload,
    #[serde(default)]
    pub timestamp: Option<String>,
}

/// The tool surface exposed to sandboxed agents, keyed by `type`.
///
/// Fields that name a target group are honored only when the source
/// directory is `main` or the target equals the source; the broker enforces
/// that, not the deserializer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IpcPayload {
    /// Send `text` to a chat.
    Message {
        #[serde(rename = "chatJid")]
        chat_jid: String,
        text: String,
    },
    ScheduleTask {
        /// Target group; ignored unless the caller is `main`.
        #[serde(default, rename = "groupFolder")]
        group_folder: Option<String>,
        prompt: String,
        #[serde(rename = "scheduleType")]
        schedule_type: String,
        #[serde(rename = "scheduleValue")]
        schedule_value: String,
        #[serde(default, rename = "contextMode")]
        context_mode: Option<String>,
    },
    PauseTask {
        #[serde(rename = "taskId")]
        task_id: String,
    },
    ResumeTask {
        #[serde(rename = "taskId")]
        task_id: String,
    },
    CancelTask {
        #[serde(rename = "taskId")]
        task_id: String,
    },
    RegisterGroup {
        jid: String,
        name: String,
        trigger: String,
        #[serde(default)]
        folder: Option<String>,
        #[serde(default, rename = "extraMounts")]
        extra_mounts: Vec<ExtraMount>,
    },
    RefreshGroups {},
    KbAdd {
        #[serde(default)]
        url: Option<String>,
        #[serde(default)]
        text: Option<String>,
        #[serde(default)]
        title: Option<String>,
        #[serde(default, rename = "sourceType")]
        source_type: Option<String>,
        #[serde(default)]
        tags: Vec<String>,
    },
    KbSearch {
        query: String,
        #[serde(default)]
        limit: Option<usize>,
        #[serde(default, rename = "minSimilarity")]
        min_similarity: Option<f32>,
        #[serde(default = "default_true", rename = "dedupeBySource")]
        dedupe_by_source: bool,
    },
    KbList {},
    KbUpdate {
        #[serde(rename = "sourceId")]
        source_id: String,
        #[serde(default)]
        content: Option<String>,
        #[serde(default)]
        title: Option<String>,
        #[serde(default)]
        tags: Option<Vec<String>>,
    },
    KbDelete {
        #[serde(rename = "sourceId")]
        source_id: String,
    },
    /// Run the GitHub CLI with an argv list and reply with its output.
    GithubCli {
        #[serde(rename = "chatJid")]
        chat_jid: String,
        args: Vec<String>,
    },
    /// Run the project tool against a registered project.
    SugarCli {
        #[serde(rename = "chatJid")]
        chat_jid: String,
        project: String,
        args: Vec<String>,
    },
}

fn default_true() -> bool {
    true
}

impl IpcPayload {
    /// Stable name for logging and error-file prefixes.
    pub fn kind(&self) -> &'static str {
        match self {
            IpcPayload::Message { .. } => "message",
            IpcPayload::ScheduleTask { .. } => "schedule_task",
            IpcPayload::PauseTask { .. } => "pause_task",
            IpcPayload::ResumeTask { .. } => "resume_task",
            IpcPayload::CancelTask { .. } => "cancel_task",
            IpcPayload::RegisterGroup { .. } => "register_group",
            IpcPayload::RefreshGroups {} => "refresh_groups",
            IpcPayload::KbAdd { .. } => "kb_add",
            IpcPayload::KbSearch { .. } => "kb_search",
            IpcPayload::KbList {} => "kb_list",
            IpcPayload::KbUpdate { .. } => "kb_update",
            IpcPayload::KbDelete { .. } => "kb_delete",
            IpcPayload::GithubCli { .. } => "github_cli",
            IpcPayload::SugarCli { .. } => "sugar_cli",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_payload_parses() {
        let raw = r#"{"type":"message","chatJid":"123@g.us","text":"hi","timestamp":"2026-02-01T10:00:00Z"}"#;
        let envelope: IpcEnvelope = serde_json::from_str(raw).unwrap();
        assert_eq!(envelope.timestamp.as_deref(), Some("2026-02-01T10:00:00Z"));
        match envelope.payload {
            IpcPayload::Message { chat_jid, text } => {
                assert_eq!(chat_jid, "123@g.us");
                assert_eq!(text, "hi");
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn schedule_task_defaults() {
        let raw = r#"{"type":"schedule_task","prompt":"daily digest",
                      "scheduleType":"cron","scheduleValue":"0 9 * * *"}"#;
        let envelope: IpcEnvelope = serde_json::from_str(raw).unwrap();
        match envelope.payload {
            IpcPayload::ScheduleTask {
                group_folder,
                context_mode,
                schedule_type,
                ..
            } => {
                assert!(group_folder.is_none());
                assert!(context_mode.is_none());
                assert_eq!(schedule_type, "cron");
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn unknown_type_is_rejected() {
        let raw = r#"{"type":"drop_all_tables"}"#;
        assert!(serde_json::from_str::<IpcEnvelope>(raw).is_err());
    }

    #[test]
    fn kb_search_default_dedupe() {
        let raw = r#"{"type":"kb_search","query":"how do marketers use AI?"}"#;
        let envelope: IpcEnvelope = serde_json::from_str(raw).unwrap();
        match envelope.payload {
            IpcPayload::KbSearch {
                dedupe_by_source,
                limit,
                min_similarity,
                ..
            } => {
                assert!(dedupe_by_source);
                assert!(limit.is_none());
                assert!(min_similarity.is_none());
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn register_group_parses_mounts() {
        let raw = r#"{"type":"register_group","jid":"9@g.us","name":"Ops","trigger":"@Ops",
                      "extraMounts":[{"hostPath":"/srv/shared","containerPath":"/workspace/shared","readonly":true}]}"#;
        let envelope: IpcEnvelope = serde_json::from_str(raw).unwrap();
        match envelope.payload {
            IpcPayload::RegisterGroup { extra_mounts, .. } => {
                assert_eq!(extra_mounts.len(), 1);
                assert!(extra_mounts[0].readonly);
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }
}

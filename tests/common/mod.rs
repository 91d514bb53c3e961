#![allow(dead_code)]

use anyhow::Result;
use async_trait::async_trait;
use oxiclaw::config::{Config, Paths};
use oxiclaw::container::ContainerRunner;
use oxiclaw::groups::{now_iso, GroupRegistry, RegisteredGroup, RouterState, SessionMap};
use oxiclaw::intake::IntakeLoop;
use oxiclaw::kb::KbPipeline;
use oxiclaw::store::{Message, Store};
use oxiclaw::transport::{ChatTransport, TransportAdapter, TransportMessage};
use oxiclaw::utils::task_tracker::TaskTracker;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

pub const ASSISTANT: &str = "bhai";

/// Transport stub that records outbound sends.
pub struct RecordingTransport {
    pub sent: Mutex<Vec<(String, String)>>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn sent_to(&self, jid: &str) -> Vec<String> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|(j, _)| j == jid)
            .map(|(_, t)| t.clone())
            .collect()
    }
}

#[async_trait]
impl ChatTransport for RecordingTransport {
    fn name(&self) -> &'static str {
        "recording"
    }
    async fn subscribe(&self, _tx: mpsc::Sender<TransportMessage>) -> Result<()> {
        Ok(())
    }
    async fn send(&self, jid: &str, text: &str) -> Result<()> {
        self.sent
            .lock()
            .unwrap()
            .push((jid.to_string(), text.to_string()));
        Ok(())
    }
    async fn set_presence(&self, _jid: &str, _typing: bool) -> Result<()> {
        Ok(())
    }
    async fn list_groups(&self) -> Result<Vec<(String, String)>> {
        Ok(vec![])
    }
}

/// A full router stack wired against a stand-in container runtime and a
/// recording transport.
pub struct TestStack {
    pub tmp: tempfile::TempDir,
    pub paths: Paths,
    pub store: Arc<Store>,
    pub registry: Arc<GroupRegistry>,
    pub state: Arc<RouterState>,
    pub sessions: Arc<SessionMap>,
    pub transport: Arc<RecordingTransport>,
    pub adapter: Arc<TransportAdapter>,
    pub kb: Arc<KbPipeline>,
    pub intake: Arc<IntakeLoop>,
    pub runtime_script: PathBuf,
    pub runs_log: PathBuf,
}

impl TestStack {
    pub async fn build(embeddings_endpoint: Option<String>) -> Self {
        let tmp = tempfile::TempDir::new().unwrap();
        let paths = Paths::new(tmp.path().to_path_buf());
        paths.ensure_layout().unwrap();

        let runs_log = tmp.path().join("runs.log");
        let runtime_script = tmp.path().join("fake-runtime.sh");
        write_runtime_script(
            &runtime_script,
            &ok_script(&runs_log, "container reply"),
        );

        let mut config = Config::default();
        config.assistant_name = ASSISTANT.to_string();
        config.container.runtime = runtime_script.to_string_lossy().to_string();
        config.container.timeout_secs = 10;
        if let Some(endpoint) = embeddings_endpoint {
            config.embeddings.endpoint = endpoint;
        }

        let store = Arc::new(Store::open(paths.store_db()).unwrap());
        let registry = Arc::new(GroupRegistry::load(&paths).unwrap());
        registry
            .register(RegisteredGroup {
                jid: "fam@g.us".to_string(),
                name: "Family".to_string(),
                folder: "family".to_string(),
                trigger: "@Bhavi".to_string(),
                added_at: now_iso(),
                extra_mounts: vec![],
            })
            .await
            .unwrap();

        let state = Arc::new(RouterState::load(&paths).unwrap());
        let sessions = Arc::new(SessionMap::load(&paths).unwrap());
        let tracker = Arc::new(TaskTracker::new());

        let transport = Arc::new(RecordingTransport::new());
        let adapter = Arc::new(TransportAdapter::new(
            transport.clone(),
            store.clone(),
            registry.clone(),
            ASSISTANT.to_string(),
            tracker.clone(),
        ));
        let runner = Arc::new(ContainerRunner::new(
            config.container.clone(),
            paths.clone(),
            tmp.path().join("project"),
            sessions.clone(),
        ));
        let kb = Arc::new(KbPipeline::new(&config, &paths, store.clone()).unwrap());
        let intake = Arc::new(IntakeLoop::new(
            store.clone(),
            registry.clone(),
            state.clone(),
            adapter.clone(),
            runner,
            kb.clone(),
            ASSISTANT.to_string(),
            tracker,
        ));

        Self {
            tmp,
            paths,
            store,
            registry,
            state,
            sessions,
            transport,
            adapter,
            kb,
            intake,
            runtime_script,
            runs_log,
        }
    }

    /// Swap the stand-in runtime's behavior between polls.
    pub fn set_runtime_script(&self, body: &str) {
        write_runtime_script(&self.runtime_script, body);
    }

    pub fn run_count(&self) -> usize {
        std::fs::read_to_string(&self.runs_log)
            .map(|s| s.lines().count())
            .unwrap_or(0)
    }

    pub fn store_inbound(&self, id: &str, content: &str, timestamp: &str) {
        self.store
            .store_message(&Message {
                id: id.to_string(),
                chat_jid: "fam@g.us".to_string(),
                sender_name: "Ada".to_string(),
                from_assistant: false,
                content: content.to_string(),
                timestamp: timestamp.to_string(),
            })
            .unwrap();
    }
}

pub fn write_runtime_script(path: &PathBuf, body: &str) {
    std::fs::write(path, body).unwrap();
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
}

/// Stand-in runtime that records the run and returns an ok response.
pub fn ok_script(runs_log: &PathBuf, reply: &str) -> String {
    format!(
        "#!/bin/sh\ncat > /dev/null\necho run >> {}\necho '{{\"status\":\"ok\",\"result\":\"{}\",\"newSessionId\":\"sess-1\"}}'\n",
        runs_log.display(),
        reply
    )
}

/// Stand-in runtime that records the run and fails.
pub fn error_script(runs_log: &PathBuf) -> String {
    format!(
        "#!/bin/sh\ncat > /dev/null\necho run >> {}\necho '{{\"status\":\"error\",\"error\":\"agent crashed\"}}'\n",
        runs_log.display()
    )
}

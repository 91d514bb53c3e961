mod common;

use common::{RecordingTransport, ASSISTANT};
use oxiclaw::config::{Config, Paths};
use oxiclaw::groups::{now_iso, GroupRegistry, RegisteredGroup, MAIN_GROUP};
use oxiclaw::handlers::HandlerContext;
use oxiclaw::ipc::IpcBroker;
use oxiclaw::kb::KbPipeline;
use oxiclaw::store::Store;
use oxiclaw::transport::TransportAdapter;
use oxiclaw::utils::task_tracker::TaskTracker;
use std::path::PathBuf;
use std::sync::Arc;

struct IpcStack {
    _tmp: tempfile::TempDir,
    paths: Paths,
    ctx: Arc<HandlerContext>,
    broker: Arc<IpcBroker>,
    transport: Arc<RecordingTransport>,
}

async fn ipc_stack() -> IpcStack {
    let tmp = tempfile::TempDir::new().unwrap();
    let paths = Paths::new(tmp.path().to_path_buf());
    paths.ensure_layout().unwrap();
    let config = Config::default();

    let store = Arc::new(Store::open(paths.store_db()).unwrap());
    let registry = Arc::new(GroupRegistry::load(&paths).unwrap());
    for (jid, folder, trigger) in [
        ("main@g.us", MAIN_GROUP, "@Alfred"),
        ("fam@g.us", "family", "@Bhavi"),
    ] {
        registry
            .register(RegisteredGroup {
                jid: jid.to_string(),
                name: folder.to_string(),
                folder: folder.to_string(),
                trigger: trigger.to_string(),
                added_at: now_iso(),
                extra_mounts: vec![],
            })
            .await
            .unwrap();
    }

    let transport = Arc::new(RecordingTransport::new());
    let adapter = Arc::new(TransportAdapter::new(
        transport.clone(),
        store.clone(),
        registry.clone(),
        ASSISTANT.to_string(),
        Arc::new(TaskTracker::new()),
    ));
    let kb = Arc::new(KbPipeline::new(&config, &paths, store.clone()).unwrap());
    let ctx = Arc::new(HandlerContext {
        store,
        registry: registry.clone(),
        adapter,
        kb,
        paths: paths.clone(),
        tools: config.tools.clone(),
        timezone: "Asia/Kolkata".parse().unwrap(),
    });
    let broker = Arc::new(IpcBroker::new(
        paths.clone(),
        registry,
        ctx.clone(),
        Arc::new(TaskTracker::new()),
    ));

    IpcStack {
        _tmp: tmp,
        paths,
        ctx,
        broker,
        transport,
    }
}

fn drop_file(paths: &Paths, group: &str, kind: &str, name: &str, body: &str) -> PathBuf {
    let dir = paths.ipc_group_dir(group).join(kind);
    std::fs::create_dir_all(&dir).unwrap();
    let tmp_path = dir.join(format!("{name}.tmp"));
    std::fs::write(&tmp_path, body).unwrap();
    let final_path = dir.join(name);
    std::fs::rename(&tmp_path, &final_path).unwrap();
    final_path
}

/// The authorization-boundary scenario: a non-main group dropping a
/// register_group payload gets rejected, the file lands in errors/ with the
/// source-group prefix, and no group is added.
#[tokio::test]
async fn register_group_from_family_is_rejected() {
    let stack = ipc_stack().await;
    drop_file(
        &stack.paths,
        "family",
        "tasks",
        "x.json",
        r#"{"type":"register_group","jid":"new@g.us","name":"New Group","trigger":"@N","timestamp":"2026-02-01T10:00:00Z"}"#,
    );

    stack.broker.poll_once().await.unwrap();

    assert!(stack
        .paths
        .ipc_errors_dir()
        .join("family-x.json")
        .exists());
    assert!(stack.ctx.registry.by_jid("new@g.us").await.is_none());
    // Unauthorized is log-and-drop: nothing reaches any chat
    assert!(stack.transport.sent.lock().unwrap().is_empty());
}

/// The same payload from main succeeds end to end: folder tree, starter
/// instructions, registry entry, refreshed snapshots.
#[tokio::test]
async fn register_group_from_main_succeeds() {
    let stack = ipc_stack().await;
    drop_file(
        &stack.paths,
        MAIN_GROUP,
        "tasks",
        "reg.json",
        r#"{"type":"register_group","jid":"ops@g.us","name":"Ops","trigger":"@Ops","timestamp":"2026-02-01T10:00:00Z"}"#,
    );

    stack.broker.poll_once().await.unwrap();

    let group = stack.ctx.registry.by_jid("ops@g.us").await.unwrap();
    assert_eq!(group.folder, "ops");
    assert!(stack.paths.group_dir("ops").join("CLAUDE.md").exists());
    assert!(stack
        .paths
        .ipc_group_dir("ops")
        .join("current_tasks.json")
        .exists());
}

/// Cron scheduling through IPC: `0 9 * * *` in Asia/Kolkata lands on the
/// next 09:00 IST expressed in UTC.
#[tokio::test]
async fn cron_task_scheduled_in_configured_timezone() {
    let stack = ipc_stack().await;
    drop_file(
        &stack.paths,
        "family",
        "tasks",
        "cron.json",
        r#"{"type":"schedule_task","prompt":"morning summary","scheduleType":"cron","scheduleValue":"0 9 * * *","timestamp":"2026-02-01T10:00:00Z"}"#,
    );

    stack.broker.poll_once().await.unwrap();

    let tasks = stack.ctx.store.tasks_for_group("family").unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].chat_jid, "fam@g.us");
    assert!(tasks[0]
        .next_run
        .as_deref()
        .unwrap()
        .ends_with("T03:30:00Z"));

    // The snapshot visible to the group's agent contains its task
    let snapshot: serde_json::Value = serde_json::from_str(
        &std::fs::read_to_string(
            stack.paths.ipc_group_dir("family").join("current_tasks.json"),
        )
        .unwrap(),
    )
    .unwrap();
    assert_eq!(snapshot.as_array().unwrap().len(), 1);
}

/// A message payload from a group to its own chat is delivered; to another
/// group's chat it is dropped.
#[tokio::test]
async fn message_delivery_respects_source_identity() {
    let stack = ipc_stack().await;
    drop_file(
        &stack.paths,
        "family",
        "messages",
        "own.json",
        r#"{"type":"message","chatJid":"fam@g.us","text":"status update","timestamp":"2026-02-01T10:00:00Z"}"#,
    );
    drop_file(
        &stack.paths,
        "family",
        "messages",
        "steal.json",
        r#"{"type":"message","chatJid":"main@g.us","text":"crossing the boundary","timestamp":"2026-02-01T10:00:00Z"}"#,
    );

    stack.broker.poll_once().await.unwrap();

    let sent = stack.transport.sent.lock().unwrap().clone();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, "fam@g.us");
    assert!(stack
        .paths
        .ipc_errors_dir()
        .join("family-steal.json")
        .exists());
}

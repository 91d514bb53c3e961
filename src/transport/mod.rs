pub mod whatsapp;

use crate::groups::GroupRegistry;
use crate::store::{Message, Store};
use crate::utils::task_tracker::TaskTracker;
use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};

/// An inbound message as delivered by the chat client, before jid
/// normalization.
#[derive(Debug, Clone)]
pub struct TransportMessage {
    pub id: String,
    pub chat_jid: String,
    /// Alternate identifier the transport sometimes presents for the same
    /// chat (self-chat device ids). The adapter records the alias and
    /// rewrites subsequent traffic to the canonical jid.
    pub alt_jid: Option<String>,
    pub chat_name: String,
    pub sender_name: String,
    pub content: String,
    /// RFC 3339 UTC.
    pub timestamp: String,
}

/// The chat client, treated as an opaque socket. Implementations own
/// connection management and reconnect with backoff; an unrecoverable
/// logout terminates the process.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    fn name(&self) -> &'static str;

    /// Arm inbound delivery into `tx`. Must be idempotent: a second call is
    /// a no-op.
    async fn subscribe(&self, tx: mpsc::Sender<TransportMessage>) -> Result<()>;

    async fn send(&self, jid: &str, text: &str) -> Result<()>;

    async fn set_presence(&self, jid: &str, typing: bool) -> Result<()>;

    /// Observed chats as (jid, display name) pairs.
    async fn list_groups(&self) -> Result<Vec<(String, String)>>;
}

/// Wraps the chat client with the persistence rules: every observed chat's
/// metadata is stored, full message bodies only for registered groups.
pub struct TransportAdapter {
    transport: Arc<dyn ChatTransport>,
    store: Arc<Store>,
    registry: Arc<GroupRegistry>,
    assistant_name: String,
    lid_map: Mutex<HashMap<String, String>>,
    tracker: Arc<TaskTracker>,
}

impl TransportAdapter {
    pub fn new(
        transport: Arc<dyn ChatTransport>,
        store: Arc<Store>,
        registry: Arc<GroupRegistry>,
        assistant_name: String,
        tracker: Arc<TaskTracker>,
    ) -> Self {
        Self {
            transport,
            store,
            registry,
            assistant_name,
            lid_map: Mutex::new(HashMap::new()),
            tracker,
        }
    }

    /// Start consuming inbound messages. Safe to call more than once; the
    /// task tracker replaces the previous consumer loop.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let (tx, mut rx) = mpsc::channel::<TransportMessage>(256);
        self.transport.subscribe(tx).await?;

        let adapter = self.clone();
        self.tracker
            .spawn_auto_cleanup("transport_intake".to_string(), async move {
                while let Some(msg) = rx.recv().await {
                    if let Err(e) = adapter.handle_inbound(msg).await {
                        error!("failed to persist inbound message: {}", e);
                    }
                }
                warn!("transport inbound channel closed");
            })
            .await;

        info!("transport adapter started ({})", self.transport.name());
        Ok(())
    }

    pub fn assistant_name(&self) -> &str {
        &self.assistant_name
    }

    /// Rewrite an identifier through the alias map.
    pub async fn normalize_jid(&self, jid: &str) -> String {
        let map = self.lid_map.lock().await;
        map.get(jid).cloned().unwrap_or_else(|| jid.to_string())
    }

    async fn handle_inbound(&self, msg: TransportMessage) -> Result<()> {
        // Record the alias before normalizing so self-chats collapse onto
        // one canonical jid.
        if let Some(alt) = &msg.alt_jid {
            if alt != &msg.chat_jid {
                let mut map = self.lid_map.lock().await;
                if map.insert(alt.clone(), msg.chat_jid.clone()).is_none() {
                    debug!("jid alias recorded: {} -> {}", alt, msg.chat_jid);
                }
            }
        }
        let chat_jid = self.normalize_jid(&msg.chat_jid).await;

        let store = self.store.clone();
        let registered = self.registry.by_jid(&chat_jid).await.is_some();
        let assistant = self.assistant_name.clone();
        crate::store::call_blocking(store, move |s| {
            s.store_chat(&chat_jid, &msg.chat_name, &msg.timestamp)?;
            if registered {
                s.store_message(&Message {
                    id: msg.id.clone(),
                    chat_jid: chat_jid.clone(),
                    sender_name: msg.sender_name.clone(),
                    from_assistant: msg.sender_name == assistant,
                    content: msg.content.clone(),
                    timestamp: msg.timestamp.clone(),
                })?;
            }
            Ok(())
        })
        .await
    }

    /// Send a reply as the assistant and record it so context assembly can
    /// exclude it.
    pub async fn send_as_assistant(&self, jid: &str, text: &str) -> Result<()> {
        self.transport.send(jid, text).await?;

        let store = self.store.clone();
        let msg = Message {
            id: format!("oxiclaw-{}", uuid::Uuid::new_v4()),
            chat_jid: jid.to_string(),
            sender_name: self.assistant_name.clone(),
            from_assistant: true,
            content: text.to_string(),
            timestamp: crate::groups::now_iso(),
        };
        crate::store::call_blocking(store, move |s| s.store_message(&msg)).await
    }

    pub async fn set_typing(&self, jid: &str, typing: bool) {
        if let Err(e) = self.transport.set_presence(jid, typing).await {
            debug!("presence update failed for {}: {}", jid, e);
        }
    }

    /// Sync chat metadata from the transport into the store and stamp
    /// `last_group_sync`.
    pub async fn sync_group_metadata(&self) -> Result<String> {
        let groups = self.transport.list_groups().await?;
        let now = crate::groups::now_iso();
        let store = self.store.clone();
        let stamp = now.clone();
        crate::store::call_blocking(store, move |s| {
            for (jid, name) in &groups {
                // The MAX() upsert keeps observed activity times intact
                s.store_chat(jid, name, "")?;
            }
            s.set_last_group_sync(&stamp)
        })
        .await?;
        Ok(now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Paths;
    use crate::groups::{now_iso, RegisteredGroup};

    struct NullTransport;

    #[async_trait]
    impl ChatTransport for NullTransport {
        fn name(&self) -> &'static str {
            "null"
        }
        async fn subscribe(&self, _tx: mpsc::Sender<TransportMessage>) -> Result<()> {
            Ok(())
        }
        async fn send(&self, _jid: &str, _text: &str) -> Result<()> {
            Ok(())
        }
        async fn set_presence(&self, _jid: &str, _typing: bool) -> Result<()> {
            Ok(())
        }
        async fn list_groups(&self) -> Result<Vec<(String, String)>> {
            Ok(vec![("1@g.us".to_string(), "Family".to_string())])
        }
    }

    async fn adapter_fixture() -> (tempfile::TempDir, Arc<TransportAdapter>) {
        let tmp = tempfile::TempDir::new().unwrap();
        let paths = Paths::new(tmp.path().to_path_buf());
        paths.ensure_layout().unwrap();
        let store = Arc::new(Store::open_in_memory().unwrap());
        let registry = Arc::new(GroupRegistry::load(&paths).unwrap());
        registry
            .register(RegisteredGroup {
                jid: "1@g.us".to_string(),
                name: "Family".to_string(),
                folder: "family".to_string(),
                trigger: "@Bhavi".to_string(),
                added_at: now_iso(),
                extra_mounts: vec![],
            })
            .await
            .unwrap();
        let adapter = Arc::new(TransportAdapter::new(
            Arc::new(NullTransport),
            store,
            registry,
            "bhai".to_string(),
            Arc::new(TaskTracker::new()),
        ));
        (tmp, adapter)
    }

    fn inbound(chat: &str, alt: Option<&str>, content: &str) -> TransportMessage {
        TransportMessage {
            id: uuid::Uuid::new_v4().to_string(),
            chat_jid: chat.to_string(),
            alt_jid: alt.map(String::from),
            chat_name: "Family".to_string(),
            sender_name: "Ada".to_string(),
            content: content.to_string(),
            timestamp: now_iso(),
        }
    }

    #[tokio::test]
    async fn registered_chats_keep_full_bodies() {
        let (_tmp, adapter) = adapter_fixture().await;
        adapter
            .handle_inbound(inbound("1@g.us", None, "hello"))
            .await
            .unwrap();
        adapter
            .handle_inbound(inbound("unknown@g.us", None, "hidden"))
            .await
            .unwrap();

        let store = adapter.store.clone();
        // Registered chat: body stored
        let msgs = store
            .get_new_messages(&["1@g.us".to_string()], "", &[])
            .unwrap();
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].content, "hello");
        // Unregistered chat: discoverable by metadata only
        assert!(store.get_chat("unknown@g.us").unwrap().is_some());
        let hidden = store
            .get_new_messages(&["unknown@g.us".to_string()], "", &[])
            .unwrap();
        assert!(hidden.is_empty());
    }

    #[tokio::test]
    async fn alias_rewrites_to_canonical_jid() {
        let (_tmp, adapter) = adapter_fixture().await;
        adapter
            .handle_inbound(inbound("1@g.us", Some("77@lid"), "first"))
            .await
            .unwrap();
        assert_eq!(adapter.normalize_jid("77@lid").await, "1@g.us");

        // A later message arriving under the alias lands in the canonical chat
        adapter
            .handle_inbound(inbound("77@lid", None, "second"))
            .await
            .unwrap();
        let msgs = adapter
            .store
            .get_new_messages(&["1@g.us".to_string()], "", &[])
            .unwrap();
        assert_eq!(msgs.len(), 2);
    }

    #[tokio::test]
    async fn assistant_replies_marked_from_assistant() {
        let (_tmp, adapter) = adapter_fixture().await;
        adapter
            .send_as_assistant("1@g.us", "bhai: hello back")
            .await
            .unwrap();
        // Excluded from intake (from_assistant + sender name guard)
        let msgs = adapter
            .store
            .get_new_messages(&["1@g.us".to_string()], "", &["bhai".to_string()])
            .unwrap();
        assert!(msgs.is_empty());
    }

    #[tokio::test]
    async fn metadata_sync_stamps_marker() {
        let (_tmp, adapter) = adapter_fixture().await;
        let stamp = adapter.sync_group_metadata().await.unwrap();
        assert_eq!(
            adapter.store.last_group_sync().unwrap().as_deref(),
            Some(stamp.as_str())
        );
        assert!(adapter.store.get_chat("1@g.us").unwrap().is_some());
    }
}

use crate::container::ContainerRunner;
use crate::groups::{GroupRegistry, RegisteredGroup, RouterState};
use crate::kb::{url::extract_urls, IngestRequest, KbPipeline, SearchRequest};
use crate::store::{call_blocking, Message, Store};
use crate::transport::TransportAdapter;
use crate::utils::task_tracker::TaskTracker;
use crate::utils::xml_escape;
use anyhow::Result;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

const POLL_INTERVAL_MS: u64 = 2000;
/// KB context injected into the prompt caps out at this many hits.
const KB_CONTEXT_LIMIT: usize = 3;

/// Leading words that make a message question-shaped.
const INTERROGATIVES: &[&str] = &[
    "what", "how", "why", "when", "where", "who", "which", "can", "could", "should", "would",
    "will", "do", "does", "did", "is", "are", "was", "were",
];

/// The message-intake pipeline: polls the store for new messages in
/// registered chats, filters by trigger, assembles the agent context and
/// dispatches container runs.
///
/// Delivery is at-least-once: the global high-water mark only advances
/// after a message is fully handled, and a failure stops the batch so the
/// failing message is the next one retried.
pub struct IntakeLoop {
    store: Arc<Store>,
    registry: Arc<GroupRegistry>,
    state: Arc<RouterState>,
    adapter: Arc<TransportAdapter>,
    runner: Arc<ContainerRunner>,
    kb: Arc<KbPipeline>,
    assistant_name: String,
    tracker: Arc<TaskTracker>,
}

impl IntakeLoop {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<Store>,
        registry: Arc<GroupRegistry>,
        state: Arc<RouterState>,
        adapter: Arc<TransportAdapter>,
        runner: Arc<ContainerRunner>,
        kb: Arc<KbPipeline>,
        assistant_name: String,
        tracker: Arc<TaskTracker>,
    ) -> Self {
        Self {
            store,
            registry,
            state,
            adapter,
            runner,
            kb,
            assistant_name,
            tracker,
        }
    }

    /// Start polling. Duplicate starts replace the previous loop.
    pub async fn start(self: &Arc<Self>) {
        let intake = self.clone();
        self.tracker
            .spawn_auto_cleanup("intake_loop".to_string(), async move {
                let mut interval = tokio::time::interval(std::time::Duration::from_millis(
                    POLL_INTERVAL_MS,
                ));
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    interval.tick().await;
                    if let Err(e) = intake.poll_once().await {
                        error!("intake poll failed: {}", e);
                    }
                }
            })
            .await;
        info!("intake loop started");
    }

    /// One poll pass. Processes messages in ascending timestamp order and
    /// stops at the first failure.
    pub async fn poll_once(&self) -> Result<()> {
        let jids = self.registry.jids().await;
        if jids.is_empty() {
            return Ok(());
        }
        let since = self.state.last_timestamp().await;
        let bot_prefixes = vec![self.assistant_name.clone()];

        let messages = {
            let store = self.store.clone();
            call_blocking(store, move |s| {
                s.get_new_messages(&jids, &since, &bot_prefixes)
            })
            .await?
        };

        for message in messages {
            if let Err(e) = self.handle_message(&message).await {
                // Leave the high-water mark where it is: this message is
                // the first one retried on the next poll.
                warn!(
                    "message {} in {} failed, will retry: {}",
                    message.id, message.chat_jid, e
                );
                break;
            }
        }
        Ok(())
    }

    async fn handle_message(&self, message: &Message) -> Result<()> {
        let Some(group) = self.registry.by_jid(&message.chat_jid).await else {
            // Registration changed between query and handling; skip.
            return self.state.advance_global(&message.timestamp).await;
        };

        if !group.is_main() && !trigger_matches(&group.trigger, &message.content) {
            debug!(
                "message {} ignored (no trigger match for '{}')",
                message.id, group.folder
            );
            return self.state.advance_global(&message.timestamp).await;
        }

        self.spawn_url_ingestion(&group, &message.content);

        let prompt = self.build_prompt(&group, message).await?;

        self.adapter.set_typing(&message.chat_jid, true).await;
        let outcome = self
            .runner
            .run(&group, &prompt, &message.chat_jid, true)
            .await;
        self.adapter.set_typing(&message.chat_jid, false).await;

        match outcome {
            Ok(run) => {
                let reply = format!("{}: {}", self.assistant_name, run.result);
                self.adapter
                    .send_as_assistant(&message.chat_jid, &reply)
                    .await?;
                self.state
                    .advance(&message.chat_jid, &message.timestamp)
                    .await?;
                Ok(())
            }
            Err(e) => {
                let notice = format!("{}: Error: {}", self.assistant_name, e);
                if let Err(send_err) = self
                    .adapter
                    .send_as_assistant(&message.chat_jid, &notice)
                    .await
                {
                    warn!("error notice delivery failed: {}", send_err);
                }
                Err(e.into())
            }
        }
    }

    /// Fire-and-forget KB ingestion for every URL in the message. Failures
    /// are logged, never surfaced to the user flow.
    fn spawn_url_ingestion(&self, group: &RegisteredGroup, content: &str) {
        for url in extract_urls(content) {
            let kb = self.kb.clone();
            let folder = group.folder.clone();
            tokio::spawn(async move {
                match kb
                    .ingest(IngestRequest {
                        group_folder: folder.clone(),
                        url: Some(url.clone()),
                        ..Default::default()
                    })
                    .await
                {
                    Ok(id) => info!("url {} ingested into '{}' as {}", url, folder, id),
                    Err(e) => debug!("url ingest skipped for {}: {}", url, e),
                }
            });
        }
    }

    /// Assemble the context window: every message since the last agent
    /// interaction in this chat, through the triggering message, excluding
    /// the assistant's own, XML-escaped.
    async fn build_prompt(&self, group: &RegisteredGroup, message: &Message) -> Result<String> {
        let since = self
            .state
            .last_agent_timestamp(&message.chat_jid)
            .await
            .unwrap_or_default();
        let window = {
            let store = self.store.clone();
            let jid = message.chat_jid.clone();
            let bot = self.assistant_name.clone();
            call_blocking(store, move |s| s.get_messages_since(&jid, &since, &bot)).await?
        };

        let mut prompt = String::new();
        if let Some(kb_block) = self.knowledge_context(group, &message.content).await {
            prompt.push_str(&kb_block);
            prompt.push('\n');
        }

        prompt.push_str("<messages>\n");
        for m in window
            .iter()
            .filter(|m| m.timestamp.as_str() <= message.timestamp.as_str())
        {
            prompt.push_str(&format!(
                "<message sender=\"{}\" time=\"{}\">{}</message>\n",
                xml_escape(&m.sender_name),
                xml_escape(&m.timestamp),
                xml_escape(&m.content)
            ));
        }
        prompt.push_str("</messages>");
        Ok(prompt)
    }

    /// Question-shaped messages get a knowledge-base block when search
    /// returns hits above the threshold.
    async fn knowledge_context(&self, group: &RegisteredGroup, content: &str) -> Option<String> {
        if !looks_like_question(content) {
            return None;
        }
        let hits = self
            .kb
            .search(SearchRequest {
                query: content.to_string(),
                group_folder: Some(group.folder.clone()),
                limit: KB_CONTEXT_LIMIT,
                ..SearchRequest::default()
            })
            .await
            .unwrap_or_else(|e| {
                warn!("kb context lookup failed: {}", e);
                Vec::new()
            });
        if hits.is_empty() {
            return None;
        }

        let mut block = String::from("<knowledge_base>\n");
        for hit in hits {
            block.push_str(&format!(
                "<result title=\"{}\" similarity=\"{:.2}\">{}</result>\n",
                xml_escape(&hit.title),
                hit.similarity,
                xml_escape(&hit.content)
            ));
        }
        block.push_str("</knowledge_base>");
        Some(block)
    }
}

/// Case-insensitive, word-bounded trigger match at the start of a message.
pub fn trigger_matches(trigger: &str, content: &str) -> bool {
    let pattern = format!("(?i)^{}\\b", regex::escape(trigger));
    match regex::Regex::new(&pattern) {
        Ok(re) => re.is_match(content.trim_start()),
        Err(_) => false,
    }
}

/// A message is question-shaped when it ends with '?' or opens with an
/// interrogative word.
pub fn looks_like_question(content: &str) -> bool {
    let trimmed = content.trim();
    if trimmed.ends_with('?') {
        return true;
    }
    let first_word: String = trimmed
        .split_whitespace()
        .next()
        .unwrap_or("")
        .chars()
        .filter(|c| c.is_alphanumeric())
        .collect::<String>()
        .to_lowercase();
    INTERROGATIVES.contains(&first_word.as_str())
}

/// WhatsApp Business Cloud API transport.
///
/// Outbound messages go through `POST /<phone_number_id>/messages`; inbound
/// messages arrive on a webhook served here (GET verification handshake plus
/// POST event delivery with X-Hub-Signature-256 validation). A rejected
/// credential is treated as logout and terminates the process; transient
/// webhook-server failures restart with exponential backoff.
use super::{ChatTransport, TransportMessage};
use crate::config::TransportConfig;
use anyhow::{Context, Result};
use async_trait::async_trait;
use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use std::collections::HashMap;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};

type HmacSha256 = Hmac<Sha256>;

/// Max webhook payload size: 1 MB.
const WEBHOOK_MAX_BODY: usize = 1_048_576;
/// WhatsApp rejects text bodies longer than this; longer replies are split.
const MAX_TEXT_LEN: usize = 4096;

const BACKOFF_BASE_SECS: u64 = 5;
const BACKOFF_MAX_SECS: u64 = 60;

pub struct WhatsAppTransport {
    config: TransportConfig,
    http: reqwest::Client,
    inner: Arc<Inner>,
}

struct Inner {
    /// Armed by subscribe(); the webhook handler feeds this.
    inbound_tx: Mutex<Option<mpsc::Sender<TransportMessage>>>,
    /// Observed chats for list_groups.
    chats: Mutex<HashMap<String, String>>,
    /// Last inbound message id per chat, needed for typing indicators.
    last_message_ids: Mutex<HashMap<String, String>>,
    running: Mutex<bool>,
}

#[derive(Clone)]
struct WebhookState {
    inner: Arc<Inner>,
    verify_token: String,
    webhook_secret: String,
}

impl WhatsAppTransport {
    pub fn new(config: TransportConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .context("failed to build transport HTTP client")?;
        Ok(Self {
            config,
            http,
            inner: Arc::new(Inner {
                inbound_tx: Mutex::new(None),
                chats: Mutex::new(HashMap::new()),
                last_message_ids: Mutex::new(HashMap::new()),
                running: Mutex::new(false),
            }),
        })
    }

    async fn post_message(&self, body: serde_json::Value) -> Result<()> {
        let url = format!(
            "{}/{}/messages",
            self.config.api_base.trim_end_matches('/'),
            self.config.phone_number_id
        );
        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.config.access_token)
            .json(&body)
            .send()
            .await
            .context("transport send failed")?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            // Explicit logout: credentials are gone, reconnecting won't help.
            error!("transport credentials rejected ({}), shutting down", status);
            std::process::exit(1);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("transport send returned {}: {}", status, body);
        }
        Ok(())
    }
}

#[async_trait]
impl ChatTransport for WhatsAppTransport {
    fn name(&self) -> &'static str {
        "whatsapp"
    }

    async fn subscribe(&self, tx: mpsc::Sender<TransportMessage>) -> Result<()> {
        {
            let mut running = self.inner.running.lock().await;
            if *running {
                debug!("whatsapp subscribe called twice, ignoring");
                return Ok(());
            }
            *running = true;
        }
        *self.inner.inbound_tx.lock().await = Some(tx);

        let state = WebhookState {
            inner: self.inner.clone(),
            verify_token: self.config.verify_token.clone(),
            webhook_secret: self.config.webhook_secret.clone(),
        };
        let port = self.config.webhook_port;
        let inner = self.inner.clone();

        tokio::spawn(async move {
            let mut attempt = 0u32;
            loop {
                if !*inner.running.lock().await {
                    break;
                }
                let app = Router::new()
                    .route("/webhook", get(verify_handler).post(event_handler))
                    .with_state(state.clone());

                match tokio::net::TcpListener::bind(("0.0.0.0", port)).await {
                    Ok(listener) => {
                        info!("whatsapp webhook listening on :{}", port);
                        attempt = 0;
                        if let Err(e) = axum::serve(listener, app).await {
                            error!("webhook server error: {}", e);
                        }
                    }
                    Err(e) => {
                        error!("webhook bind failed on :{}: {}", port, e);
                    }
                }

                let delay = backoff_delay(attempt);
                attempt += 1;
                warn!("webhook server stopped, restarting in {}s", delay);
                tokio::time::sleep(std::time::Duration::from_secs(delay)).await;
            }
        });
        Ok(())
    }

    async fn send(&self, jid: &str, text: &str) -> Result<()> {
        for chunk in split_message(text, MAX_TEXT_LEN) {
            self.post_message(serde_json::json!({
                "messaging_product": "whatsapp",
                "recipient_type": "individual",
                "to": jid,
                "type": "text",
                "text": { "body": chunk },
            }))
            .await?;
        }
        debug!("whatsapp message sent to {}", jid);
        Ok(())
    }

    async fn set_presence(&self, jid: &str, typing: bool) -> Result<()> {
        if !typing {
            // The indicator expires on its own; there is no explicit clear.
            return Ok(());
        }
        let message_id = {
            let ids = self.inner.last_message_ids.lock().await;
            ids.get(jid).cloned()
        };
        let Some(message_id) = message_id else {
            return Ok(());
        };
        self.post_message(serde_json::json!({
            "messaging_product": "whatsapp",
            "status": "read",
            "message_id": message_id,
            "typing_indicator": { "type": "text" },
        }))
        .await
    }

    async fn list_groups(&self) -> Result<Vec<(String, String)>> {
        let chats = self.inner.chats.lock().await;
        Ok(chats.iter().map(|(j, n)| (j.clone(), n.clone())).collect())
    }
}

fn backoff_delay(attempt: u32) -> u64 {
    let delay = BACKOFF_BASE_SECS.saturating_mul(2u64.saturating_pow(attempt));
    delay.min(BACKOFF_MAX_SECS)
}

/// Split text into chunks of at most `max_len` characters, preferring line
/// breaks.
fn split_message(text: &str, max_len: usize) -> Vec<String> {
    if text.chars().count() <= max_len {
        return vec![text.to_string()];
    }
    let mut chunks = Vec::new();
    let mut current = String::new();
    for line in text.split_inclusive('\n') {
        if current.chars().count() + line.chars().count() > max_len && !current.is_empty() {
            chunks.push(std::mem::take(&mut current));
        }
        if line.chars().count() > max_len {
            let chars: Vec<char> = line.chars().collect();
            for piece in chars.chunks(max_len) {
                chunks.push(piece.iter().collect());
            }
        } else {
            current.push_str(line);
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

#[derive(Debug, Deserialize)]
struct VerifyParams {
    #[serde(rename = "hub.mode")]
    mode: Option<String>,
    #[serde(rename = "hub.verify_token")]
    verify_token: Option<String>,
    #[serde(rename = "hub.challenge")]
    challenge: Option<String>,
}

/// GET /webhook — the Cloud API verification handshake.
async fn verify_handler(
    State(state): State<WebhookState>,
    Query(params): Query<VerifyParams>,
) -> impl IntoResponse {
    if params.mode.as_deref() == Some("subscribe")
        && params.verify_token.as_deref() == Some(state.verify_token.as_str())
    {
        info!("webhook verification handshake accepted");
        (StatusCode::OK, params.challenge.unwrap_or_default())
    } else {
        warn!("webhook verification rejected");
        (StatusCode::FORBIDDEN, String::new())
    }
}

/// POST /webhook — inbound event delivery.
async fn event_handler(
    State(state): State<WebhookState>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    if body.len() > WEBHOOK_MAX_BODY {
        return StatusCode::PAYLOAD_TOO_LARGE;
    }

    if !state.webhook_secret.is_empty() {
        let signature = headers
            .get("x-hub-signature-256")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if !signature_matches(&state.webhook_secret, signature, &body) {
            warn!("webhook signature validation failed");
            return StatusCode::UNAUTHORIZED;
        }
    }

    let payload: serde_json::Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(e) => {
            warn!("webhook payload is not JSON: {}", e);
            return StatusCode::BAD_REQUEST;
        }
    };

    for msg in parse_webhook_messages(&payload) {
        {
            let mut chats = state.inner.chats.lock().await;
            chats.insert(msg.chat_jid.clone(), msg.chat_name.clone());
        }
        {
            let mut ids = state.inner.last_message_ids.lock().await;
            ids.insert(msg.chat_jid.clone(), msg.id.clone());
        }
        let tx = state.inner.inbound_tx.lock().await;
        if let Some(tx) = tx.as_ref() {
            if let Err(e) = tx.send(msg).await {
                error!("inbound channel send failed: {}", e);
            }
        }
    }

    StatusCode::OK
}

/// Check the `X-Hub-Signature-256` header against an HMAC of the raw body.
/// The header value may or may not carry the `sha256=` prefix.
fn signature_matches(secret: &str, header: &str, body: &[u8]) -> bool {
    let presented = header.strip_prefix("sha256=").unwrap_or(header);

    let computed = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mut digest) => {
            digest.update(body);
            hex::encode(digest.finalize().into_bytes())
        }
        Err(_) => return false,
    };

    bool::from(computed.as_bytes().ct_eq(presented.as_bytes()))
}

/// Pull text messages out of a Cloud API webhook delivery.
fn parse_webhook_messages(payload: &serde_json::Value) -> Vec<TransportMessage> {
    let mut out = Vec::new();
    let entries = payload.get("entry").and_then(|e| e.as_array());
    for entry in entries.into_iter().flatten() {
        let changes = entry.get("changes").and_then(|c| c.as_array());
        for change in changes.into_iter().flatten() {
            let Some(value) = change.get("value") else {
                continue;
            };

            // Profile names, keyed by wa_id
            let mut names: HashMap<String, String> = HashMap::new();
            if let Some(contacts) = value.get("contacts").and_then(|c| c.as_array()) {
                for contact in contacts {
                    let wa_id = contact.get("wa_id").and_then(|v| v.as_str());
                    let name = contact
                        .pointer("/profile/name")
                        .and_then(|v| v.as_str());
                    if let (Some(id), Some(name)) = (wa_id, name) {
                        names.insert(id.to_string(), name.to_string());
                    }
                }
            }

            let messages = value.get("messages").and_then(|m| m.as_array());
            for msg in messages.into_iter().flatten() {
                if msg.get("type").and_then(|t| t.as_str()) != Some("text") {
                    continue;
                }
                let Some(from) = msg.get("from").and_then(|v| v.as_str()) else {
                    continue;
                };
                let Some(id) = msg.get("id").and_then(|v| v.as_str()) else {
                    continue;
                };
                let Some(text) = msg.pointer("/text/body").and_then(|v| v.as_str()) else {
                    continue;
                };

                let timestamp = msg
                    .get("timestamp")
                    .and_then(|v| v.as_str())
                    .and_then(|s| s.parse::<i64>().ok())
                    .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
                    .unwrap_or_else(Utc::now)
                    .to_rfc3339_opts(chrono::SecondsFormat::Secs, true);

                let sender_name = names.get(from).cloned().unwrap_or_else(|| from.to_string());
                // Some deliveries carry an alternate wa_id for the same
                // account; record it so the adapter can collapse identities.
                let alt_jid = names
                    .keys()
                    .find(|id| id.as_str() != from)
                    .filter(|_| names.len() == 1)
                    .cloned();

                out.push(TransportMessage {
                    id: id.to_string(),
                    chat_jid: from.to_string(),
                    alt_jid,
                    chat_name: sender_name.clone(),
                    sender_name,
                    content: text.to_string(),
                    timestamp,
                });
            }
        }
    }
    out
}

pub mod chunker;
pub mod embeddings;
pub mod extract;
pub mod url;

use crate::config::{Config, Paths};
use crate::errors::{OxiclawError, OxiclawResult};
use crate::store::{call_blocking, KbChunk, KbSource, Store};
use anyhow::Result;
use embeddings::{serialize_embedding, EmbeddingsClient, PROVIDER_NAME};
use extract::{clean_content, validate_content, Extracted, Extractor};
use fs2::FileExt;
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

/// Default similarity floor for search hits.
pub const DEFAULT_MIN_SIMILARITY: f32 = 0.7;
pub const DEFAULT_SEARCH_LIMIT: usize = 5;

#[derive(Debug, Clone, Default)]
pub struct IngestRequest {
    pub group_folder: String,
    pub url: Option<String>,
    pub text: Option<String>,
    pub title: Option<String>,
    pub source_type: Option<String>,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct UpdateRequest {
    pub source_id: String,
    pub content: Option<String>,
    pub title: Option<String>,
    pub tags: Option<Vec<String>>,
}

#[derive(Debug, Clone)]
pub struct SearchRequest {
    pub query: String,
    pub group_folder: Option<String>,
    pub limit: usize,
    pub min_similarity: f32,
    pub dedupe_by_source: bool,
}

impl Default for SearchRequest {
    fn default() -> Self {
        Self {
            query: String::new(),
            group_folder: None,
            limit: DEFAULT_SEARCH_LIMIT,
            min_similarity: DEFAULT_MIN_SIMILARITY,
            dedupe_by_source: true,
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct SearchHit {
    pub chunk_id: String,
    pub source_id: String,
    pub url: Option<String>,
    pub title: String,
    pub source_type: String,
    pub content: String,
    pub similarity: f32,
}

fn hash_text(s: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(s.as_bytes());
    hex::encode(hasher.finalize())
}

fn new_source_id() -> String {
    let ts = chrono::Utc::now().timestamp_millis();
    let rand = &uuid::Uuid::new_v4().simple().to_string()[..8];
    format!("kb-{ts}-{rand}")
}

/// File-based per-group ingest mutex. Concurrent ingests into the same
/// group block on the lock file; the lock releases when the guard drops.
struct IngestLock {
    _file: std::fs::File,
}

impl IngestLock {
    async fn acquire(locks_dir: &PathBuf, group_folder: &str) -> Result<Self> {
        let dir = locks_dir.clone();
        let name = format!("{}.lock", crate::utils::safe_filename(group_folder));
        let file = tokio::task::spawn_blocking(move || -> Result<std::fs::File> {
            std::fs::create_dir_all(&dir)?;
            let file = std::fs::OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(false)
                .open(dir.join(name))?;
            file.lock_exclusive()?;
            Ok(file)
        })
        .await
        .map_err(|e| anyhow::anyhow!("ingest lock task failed: {}", e))??;
        Ok(Self { _file: file })
    }
}

pub struct KbPipeline {
    store: Arc<Store>,
    extractor: Extractor,
    embeddings: EmbeddingsClient,
    locks_dir: PathBuf,
}

impl KbPipeline {
    pub fn new(config: &Config, paths: &Paths, store: Arc<Store>) -> OxiclawResult<Self> {
        Ok(Self {
            store,
            extractor: Extractor::new(&config.tools).map_err(OxiclawError::Internal)?,
            embeddings: EmbeddingsClient::new(&config.embeddings)?,
            locks_dir: paths.data_dir().join("kb-locks"),
        })
    }

    /// Ingest a URL or raw text into a group's knowledge base.
    ///
    /// Runs the full pipeline in order, aborting with a typed failure on the
    /// first step that fails. Returns the new source id.
    pub async fn ingest(&self, req: IngestRequest) -> OxiclawResult<String> {
        let _lock = IngestLock::acquire(&self.locks_dir, &req.group_folder)
            .await
            .map_err(OxiclawError::Internal)?;

        let group = req.group_folder.clone();

        // URL normalize + dedup
        let normalized_url = match &req.url {
            Some(raw) => {
                let normalized = url::normalize_url(raw)
                    .map_err(|e| OxiclawError::InvalidPayload(e.to_string()))?;
                let existing = {
                    let store = self.store.clone();
                    let group = group.clone();
                    let url = normalized.clone();
                    call_blocking(store, move |s| s.find_source_by_url(&group, &url)).await?
                };
                if let Some(id) = existing {
                    return Err(OxiclawError::AlreadyIngested(id));
                }
                Some(normalized)
            }
            None => None,
        };

        // Source-type detect (caller override wins)
        let source_type = req
            .source_type
            .clone()
            .unwrap_or_else(|| match &normalized_url {
                Some(u) => url::detect_source_type(u).to_string(),
                None => "text".to_string(),
            });

        // Extract
        let extracted = match (&normalized_url, &req.text) {
            (Some(u), _) => self.extractor.extract(&source_type, u).await?,
            (None, Some(text)) => Extracted {
                title: req
                    .title
                    .clone()
                    .unwrap_or_else(|| first_line_title(text)),
                content: text.clone(),
            },
            (None, None) => {
                return Err(OxiclawError::InvalidPayload(
                    "ingest needs a url or text".to_string(),
                ))
            }
        };

        // Clean + validate
        let cleaned = clean_content(&extracted.content);
        let (content, truncated) = validate_content(&source_type, cleaned)?;

        // Content-hash dedup
        let content_hash = hash_text(&content);
        let existing = {
            let store = self.store.clone();
            let group = group.clone();
            let hash = content_hash.clone();
            call_blocking(store, move |s| s.find_source_by_hash(&group, &hash)).await?
        };
        if let Some(id) = existing {
            return Err(OxiclawError::DuplicateContent(id));
        }

        // Chunk + embed + persist
        let now = crate::groups::now_iso();
        let mut tags = req.tags.clone();
        if truncated && !tags.iter().any(|t| t == "truncated") {
            tags.push("truncated".to_string());
        }
        let source = KbSource {
            id: new_source_id(),
            group_folder: group.clone(),
            url: normalized_url,
            title: req.title.unwrap_or(extracted.title),
            source_type,
            raw_content: content.clone(),
            content_hash,
            tags,
            created_at: now.clone(),
            updated_at: now.clone(),
        };
        let chunks = self.build_chunks(&source.id, &content, &now).await;

        let source_id = source.id.clone();
        let store = self.store.clone();
        call_blocking(store, move |s| {
            s.insert_source(&source)?;
            s.replace_chunks(&source.id, &chunks)
        })
        .await?;

        info!("kb ingest complete: {} into group '{}'", source_id, group);
        Ok(source_id)
    }

    /// Update an existing source.
    ///
    /// New content (or a stored URL to re-extract) re-runs the content half
    /// of the pipeline and replaces chunks, preserving `created_at`. A
    /// text-only source with no new content gets a title/tags update in
    /// place; supplying nothing at all is an invalid payload.
    pub async fn update(&self, group_folder: &str, req: UpdateRequest) -> OxiclawResult<()> {
        let _lock = IngestLock::acquire(&self.locks_dir, group_folder)
            .await
            .map_err(OxiclawError::Internal)?;

        let existing = {
            let store = self.store.clone();
            let id = req.source_id.clone();
            call_blocking(store, move |s| s.get_source(&id)).await?
        };
        let Some(mut source) = existing else {
            return Err(OxiclawError::InvalidPayload(format!(
                "unknown source {}",
                req.source_id
            )));
        };
        if source.group_folder != group_folder {
            return Err(OxiclawError::Unauthorized {
                from_group: group_folder.to_string(),
                target: source.group_folder,
            });
        }

        let now = crate::groups::now_iso();

        let new_content = match (&req.content, &source.url) {
            (Some(text), _) => Some(Extracted {
                title: req.title.clone().unwrap_or_else(|| source.title.clone()),
                content: text.clone(),
            }),
            (None, Some(url)) => Some(self.extractor.extract(&source.source_type, url).await?),
            (None, None) => None,
        };

        match new_content {
            Some(extracted) => {
                let cleaned = clean_content(&extracted.content);
                let (content, _truncated) =
                    validate_content(&source.source_type, cleaned)?;
                let content_hash = hash_text(&content);

                // Another source in the group owning this hash is a duplicate
                let clash = {
                    let store = self.store.clone();
                    let group = group_folder.to_string();
                    let hash = content_hash.clone();
                    call_blocking(store, move |s| s.find_source_by_hash(&group, &hash)).await?
                };
                if let Some(other) = clash {
                    if other != source.id {
                        return Err(OxiclawError::DuplicateContent(other));
                    }
                }

                source.title = req.title.unwrap_or(extracted.title);
                if let Some(tags) = req.tags {
                    source.tags = tags;
                }
                source.raw_content = content.clone();
                source.content_hash = content_hash;
                source.updated_at = now.clone();

                let chunks = self.build_chunks(&source.id, &content, &now).await;
                let store = self.store.clone();
                call_blocking(store, move |s| {
                    s.update_source(&source)?;
                    s.replace_chunks(&source.id, &chunks)
                })
                .await?;
                Ok(())
            }
            None => {
                if req.title.is_none() && req.tags.is_none() {
                    return Err(OxiclawError::InvalidPayload(
                        "update needs content, a title or tags".to_string(),
                    ));
                }
                let store = self.store.clone();
                let id = req.source_id.clone();
                let title = req.title.clone();
                let tags = req.tags.clone();
                call_blocking(store, move |s| {
                    s.update_source_meta(&id, title.as_deref(), tags.as_deref(), &now)
                })
                .await?;
                Ok(())
            }
        }
    }

    pub async fn delete(&self, group_folder: &str, source_id: &str) -> OxiclawResult<bool> {
        let existing = {
            let store = self.store.clone();
            let id = source_id.to_string();
            call_blocking(store, move |s| s.get_source(&id)).await?
        };
        let Some(source) = existing else {
            return Ok(false);
        };
        if source.group_folder != group_folder {
            return Err(OxiclawError::Unauthorized {
                from_group: group_folder.to_string(),
                target: source.group_folder,
            });
        }
        let store = self.store.clone();
        let id = source_id.to_string();
        Ok(call_blocking(store, move |s| s.delete_source(&id)).await?)
    }

    pub async fn list(&self, group_folder: &str) -> OxiclawResult<Vec<KbSource>> {
        let store = self.store.clone();
        let group = group_folder.to_string();
        Ok(call_blocking(store, move |s| s.list_sources(&group)).await?)
    }

    /// Semantic search over stored chunks.
    ///
    /// An unavailable embeddings provider degrades to an empty result with a
    /// warning rather than an error.
    pub async fn search(&self, req: SearchRequest) -> OxiclawResult<Vec<SearchHit>> {
        let query_embedding = match self.embeddings.embed_query(&req.query).await {
            Ok(v) => v,
            Err(e) => {
                warn!("kb search degraded, embeddings unavailable: {}", e);
                return Ok(Vec::new());
            }
        };

        let rows = {
            let store = self.store.clone();
            let scope = req.group_folder.clone();
            call_blocking(store, move |s| s.chunks_in_scope(scope.as_deref())).await?
        };

        let mut hits: Vec<SearchHit> = Vec::new();
        for row in rows {
            let Some(blob) = row.embedding else {
                continue;
            };
            let embedding = match embeddings::deserialize_embedding(&blob) {
                Ok(v) => v,
                Err(e) => {
                    warn!("skipping corrupted embedding for chunk {}: {}", row.chunk_id, e);
                    continue;
                }
            };
            let similarity = embeddings::cosine_similarity(&query_embedding, &embedding);
            if similarity >= req.min_similarity {
                hits.push(SearchHit {
                    chunk_id: row.chunk_id,
                    source_id: row.source_id,
                    url: row.url,
                    title: row.title,
                    source_type: row.source_type,
                    content: row.content,
                    similarity,
                });
            }
        }

        hits.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        if req.dedupe_by_source {
            let mut seen = std::collections::HashSet::new();
            hits.retain(|h| seen.insert(h.source_id.clone()));
        }
        hits.truncate(req.limit);
        Ok(hits)
    }

    /// Backfill embeddings for chunks persisted while the provider was down.
    pub async fn reembed_missing(&self) -> OxiclawResult<usize> {
        if !self.embeddings.is_configured() {
            return Ok(0);
        }
        let missing = {
            let store = self.store.clone();
            call_blocking(store, |s| s.chunks_missing_embeddings()).await?
        };
        if missing.is_empty() {
            return Ok(0);
        }

        let texts: Vec<String> = missing.iter().map(|(_, c)| c.clone()).collect();
        let vectors = self.embeddings.embed_batch(&texts).await?;
        let model = self.embeddings.model().to_string();

        let count = missing.len();
        let store = self.store.clone();
        call_blocking(store, move |s| {
            for ((chunk_id, _), vector) in missing.iter().zip(vectors.iter()) {
                s.set_chunk_embedding(
                    chunk_id,
                    &serialize_embedding(vector),
                    vector.len() as i64,
                    PROVIDER_NAME,
                    &model,
                )?;
            }
            Ok(())
        })
        .await?;
        info!("backfilled {} chunk embeddings", count);
        Ok(count)
    }

    /// Chunk content and attach embeddings, falling back to null embeddings
    /// when the provider is unavailable.
    async fn build_chunks(&self, source_id: &str, content: &str, now: &str) -> Vec<KbChunk> {
        let pieces = chunker::split_into_chunks(content);
        let vectors = match self.embeddings.embed_batch(&pieces).await {
            Ok(v) => v.into_iter().map(Some).collect::<Vec<_>>(),
            Err(e) => {
                warn!(
                    "storing {} chunks without embeddings for {}: {}",
                    pieces.len(),
                    source_id,
                    e
                );
                vec![None; pieces.len()]
            }
        };

        pieces
            .into_iter()
            .zip(vectors)
            .enumerate()
            .map(|(i, (content, vector))| KbChunk {
                id: format!("{source_id}-{i}"),
                source_id: source_id.to_string(),
                chunk_index: i as i64,
                content,
                embedding: vector.as_deref().map(serialize_embedding),
                embedding_dim: vector.as_ref().map(|v| v.len() as i64),
                embedding_provider: vector.as_ref().map(|_| PROVIDER_NAME.to_string()),
                embedding_model: vector.as_ref().map(|_| self.embeddings.model().to_string()),
                created_at: now.to_string(),
            })
            .collect()
    }
}

fn first_line_title(text: &str) -> String {
    let line = text.lines().next().unwrap_or("Untitled").trim();
    let title: String = line.chars().take(80).collect();
    if title.is_empty() {
        "Untitled".to_string()
    } else {
        title
    }
}

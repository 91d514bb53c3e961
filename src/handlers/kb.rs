use super::HandlerContext;
use crate::errors::{OxiclawError, OxiclawResult};
use crate::groups::now_iso;
use crate::kb::{IngestRequest, SearchRequest, UpdateRequest};
use crate::utils::atomic_write;
use tracing::info;

impl HandlerContext {
    /// Write a KB result snapshot into the caller's IPC directory where its
    /// agent can read it back.
    fn write_kb_result(&self, group_folder: &str, name: &str, body: &serde_json::Value) -> OxiclawResult<()> {
        let path = self.paths.ipc_group_dir(group_folder).join(name);
        atomic_write(&path, &serde_json::to_string_pretty(body).map_err(|e| {
            OxiclawError::Internal(anyhow::anyhow!("kb result serialization: {e}"))
        })?)
        .map_err(OxiclawError::Internal)
    }

    pub(super) async fn handle_kb_add(
        &self,
        source_group: &str,
        url: Option<String>,
        text: Option<String>,
        title: Option<String>,
        source_type: Option<String>,
        tags: Vec<String>,
    ) -> OxiclawResult<()> {
        let source_id = self
            .kb
            .ingest(IngestRequest {
                group_folder: source_group.to_string(),
                url,
                text,
                title,
                source_type,
                tags,
            })
            .await?;
        info!("kb_add from '{}' created {}", source_group, source_id);
        self.write_kb_result(
            source_group,
            "kb_result.json",
            &serde_json::json!({
                "operation": "kb_add",
                "sourceId": source_id,
                "timestamp": now_iso(),
            }),
        )
    }

    pub(super) async fn handle_kb_search(
        &self,
        source_group: &str,
        query: &str,
        limit: Option<usize>,
        min_similarity: Option<f32>,
        dedupe_by_source: bool,
    ) -> OxiclawResult<()> {
        let defaults = SearchRequest::default();
        let hits = self
            .kb
            .search(SearchRequest {
                query: query.to_string(),
                group_folder: Some(source_group.to_string()),
                limit: limit.unwrap_or(defaults.limit),
                min_similarity: min_similarity.unwrap_or(defaults.min_similarity),
                dedupe_by_source,
            })
            .await?;
        self.write_kb_result(
            source_group,
            "kb_result.json",
            &serde_json::json!({
                "operation": "kb_search",
                "query": query,
                "results": hits,
                "timestamp": now_iso(),
            }),
        )
    }

    pub(super) async fn handle_kb_list(&self, source_group: &str) -> OxiclawResult<()> {
        let sources = self.kb.list(source_group).await?;
        let listing: Vec<serde_json::Value> = sources
            .iter()
            .map(|s| {
                serde_json::json!({
                    "id": s.id,
                    "title": s.title,
                    "url": s.url,
                    "sourceType": s.source_type,
                    "tags": s.tags,
                    "createdAt": s.created_at,
                })
            })
            .collect();
        self.write_kb_result(
            source_group,
            "kb_result.json",
            &serde_json::json!({
                "operation": "kb_list",
                "sources": listing,
                "timestamp": now_iso(),
            }),
        )
    }

    pub(super) async fn handle_kb_update(
        &self,
        source_group: &str,
        source_id: String,
        content: Option<String>,
        title: Option<String>,
        tags: Option<Vec<String>>,
    ) -> OxiclawResult<()> {
        self.kb
            .update(
                source_group,
                UpdateRequest {
                    source_id: source_id.clone(),
                    content,
                    title,
                    tags,
                },
            )
            .await?;
        info!("kb_update from '{}' touched {}", source_group, source_id);
        Ok(())
    }

    pub(super) async fn handle_kb_delete(
        &self,
        source_group: &str,
        source_id: &str,
    ) -> OxiclawResult<()> {
        let removed = self.kb.delete(source_group, source_id).await?;
        if !removed {
            return Err(OxiclawError::InvalidPayload(format!(
                "unknown source {source_id}"
            )));
        }
        info!("kb_delete from '{}' removed {}", source_group, source_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::fixture;
    use crate::errors::OxiclawError;
    use crate::ipc::payload::IpcPayload;

    #[tokio::test]
    async fn kb_add_text_then_list() {
        let f = fixture().await;
        f.ctx
            .dispatch(
                IpcPayload::KbAdd {
                    url: None,
                    text: Some("Anthropic uses Claude in marketing workflows.".to_string()),
                    title: Some("Marketing note".to_string()),
                    source_type: None,
                    tags: vec!["marketing".to_string()],
                },
                "family",
                false,
            )
            .await
            .unwrap();

        f.ctx
            .dispatch(IpcPayload::KbList {}, "family", false)
            .await
            .unwrap();

        let result: serde_json::Value = serde_json::from_str(
            &std::fs::read_to_string(f.ctx.paths.ipc_group_dir("family").join("kb_result.json"))
                .unwrap(),
        )
        .unwrap();
        assert_eq!(result["operation"], "kb_list");
        assert_eq!(result["sources"].as_array().unwrap().len(), 1);
        assert_eq!(result["sources"][0]["title"], "Marketing note");
    }

    #[tokio::test]
    async fn kb_add_same_text_twice_is_duplicate() {
        let f = fixture().await;
        let payload = IpcPayload::KbAdd {
            url: None,
            text: Some("The same exact note, word for word.".to_string()),
            title: None,
            source_type: None,
            tags: vec![],
        };
        f.ctx.dispatch(payload.clone(), "family", false).await.unwrap();
        let err = f.ctx.dispatch(payload, "family", false).await.unwrap_err();
        assert!(matches!(err, OxiclawError::DuplicateContent(_)));
        // Still exactly one source
        assert_eq!(f.ctx.store.list_sources("family").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn kb_delete_scoped_to_group() {
        let f = fixture().await;
        f.ctx
            .dispatch(
                IpcPayload::KbAdd {
                    url: None,
                    text: Some("A note that belongs to family.".to_string()),
                    title: None,
                    source_type: None,
                    tags: vec![],
                },
                "family",
                false,
            )
            .await
            .unwrap();
        let source_id = f.ctx.store.list_sources("family").unwrap()[0].id.clone();

        let err = f
            .ctx
            .dispatch(
                IpcPayload::KbDelete {
                    source_id: source_id.clone(),
                },
                "work",
                false,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, OxiclawError::Unauthorized { .. }));

        f.ctx
            .dispatch(IpcPayload::KbDelete { source_id }, "family", false)
            .await
            .unwrap();
        assert!(f.ctx.store.list_sources("family").unwrap().is_empty());
    }

    #[tokio::test]
    async fn kb_update_without_fields_is_invalid() {
        let f = fixture().await;
        f.ctx
            .dispatch(
                IpcPayload::KbAdd {
                    url: None,
                    text: Some("A text-only source with no url.".to_string()),
                    title: None,
                    source_type: None,
                    tags: vec![],
                },
                "family",
                false,
            )
            .await
            .unwrap();
        let source_id = f.ctx.store.list_sources("family").unwrap()[0].id.clone();

        let err = f
            .ctx
            .dispatch(
                IpcPayload::KbUpdate {
                    source_id: source_id.clone(),
                    content: None,
                    title: None,
                    tags: None,
                },
                "family",
                false,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, OxiclawError::InvalidPayload(_)));

        // Title-only update works in place without re-chunking
        let chunks_before = f.ctx.store.count_chunks(&source_id).unwrap();
        f.ctx
            .dispatch(
                IpcPayload::KbUpdate {
                    source_id: source_id.clone(),
                    content: None,
                    title: Some("Renamed".to_string()),
                    tags: None,
                },
                "family",
                false,
            )
            .await
            .unwrap();
        let source = f.ctx.store.get_source(&source_id).unwrap().unwrap();
        assert_eq!(source.title, "Renamed");
        assert_eq!(f.ctx.store.count_chunks(&source_id).unwrap(), chunks_before);
    }

    #[tokio::test]
    async fn kb_search_degrades_without_provider() {
        let f = fixture().await;
        // Default config has no embeddings endpoint: search succeeds empty
        f.ctx
            .dispatch(
                IpcPayload::KbSearch {
                    query: "how do marketers use AI?".to_string(),
                    limit: None,
                    min_similarity: None,
                    dedupe_by_source: true,
                },
                "family",
                false,
            )
            .await
            .unwrap();
        let result: serde_json::Value = serde_json::from_str(
            &std::fs::read_to_string(f.ctx.paths.ipc_group_dir("family").join("kb_result.json"))
                .unwrap(),
        )
        .unwrap();
        assert_eq!(result["operation"], "kb_search");
        assert!(result["results"].as_array().unwrap().is_empty());
    }
}

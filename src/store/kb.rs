use super::Store;
use anyhow::Result;
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};

/// An ingested knowledge-base document. Unique per group on both the
/// normalized URL and the cleaned-content hash.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KbSource {
    pub id: String,
    pub group_folder: String,
    pub url: Option<String>,
    pub title: String,
    pub source_type: String,
    pub raw_content: String,
    pub content_hash: String,
    pub tags: Vec<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// A sub-window of a source's cleaned content; the unit of embedding and
/// retrieval. `embedding` is a little-endian f32 blob, absent when the
/// provider was unavailable at ingest time.
#[derive(Debug, Clone)]
pub struct KbChunk {
    pub id: String,
    pub source_id: String,
    pub chunk_index: i64,
    pub content: String,
    pub embedding: Option<Vec<u8>>,
    pub embedding_dim: Option<i64>,
    pub embedding_provider: Option<String>,
    pub embedding_model: Option<String>,
    pub created_at: String,
}

/// A chunk joined with its source metadata, as consumed by search.
#[derive(Debug, Clone)]
pub struct ChunkRow {
    pub chunk_id: String,
    pub source_id: String,
    pub group_folder: String,
    pub url: Option<String>,
    pub title: String,
    pub source_type: String,
    pub content: String,
    pub embedding: Option<Vec<u8>>,
}

fn tags_to_json(tags: &[String]) -> String {
    serde_json::to_string(tags).unwrap_or_else(|_| "[]".to_string())
}

fn tags_from_json(raw: Option<String>) -> Vec<String> {
    raw.and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or_default()
}

fn row_to_source(row: &rusqlite::Row<'_>) -> rusqlite::Result<KbSource> {
    let tags: Option<String> = row.get(7)?;
    Ok(KbSource {
        id: row.get(0)?,
        group_folder: row.get(1)?,
        url: row.get(2)?,
        title: row.get(3)?,
        source_type: row.get(4)?,
        raw_content: row.get(5)?,
        content_hash: row.get(6)?,
        tags: tags_from_json(tags),
        created_at: row.get(8)?,
        updated_at: row.get(9)?,
    })
}

const SOURCE_COLUMNS: &str = "id, group_folder, url, title, source_type, raw_content, \
                              content_hash, tags, created_at, updated_at";

impl Store {
    pub fn insert_source(&self, source: &KbSource) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO kb_sources
                 (id, group_folder, url, title, source_type, raw_content,
                  content_hash, tags, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                source.id,
                source.group_folder,
                source.url,
                source.title,
                source.source_type,
                source.raw_content,
                source.content_hash,
                tags_to_json(&source.tags),
                source.created_at,
                source.updated_at
            ],
        )?;
        Ok(())
    }

    /// Replace a source's content fields, preserving `created_at`.
    pub fn update_source(&self, source: &KbSource) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "UPDATE kb_sources SET
                 url = ?, title = ?, source_type = ?, raw_content = ?,
                 content_hash = ?, tags = ?, updated_at = ?
             WHERE id = ?",
            params![
                source.url,
                source.title,
                source.source_type,
                source.raw_content,
                source.content_hash,
                tags_to_json(&source.tags),
                source.updated_at,
                source.id
            ],
        )?;
        Ok(())
    }

    /// Title/tags-only update for sources whose content is untouched.
    pub fn update_source_meta(
        &self,
        id: &str,
        title: Option<&str>,
        tags: Option<&[String]>,
        updated_at: &str,
    ) -> Result<bool> {
        let conn = self.lock_conn()?;
        let changed = match (title, tags) {
            (Some(t), Some(g)) => conn.execute(
                "UPDATE kb_sources SET title = ?, tags = ?, updated_at = ? WHERE id = ?",
                params![t, tags_to_json(g), updated_at, id],
            )?,
            (Some(t), None) => conn.execute(
                "UPDATE kb_sources SET title = ?, updated_at = ? WHERE id = ?",
                params![t, updated_at, id],
            )?,
            (None, Some(g)) => conn.execute(
                "UPDATE kb_sources SET tags = ?, updated_at = ? WHERE id = ?",
                params![tags_to_json(g), updated_at, id],
            )?,
            (None, None) => 0,
        };
        Ok(changed > 0)
    }

    pub fn get_source(&self, id: &str) -> Result<Option<KbSource>> {
        let conn = self.lock_conn()?;
        conn.query_row(
            &format!("SELECT {SOURCE_COLUMNS} FROM kb_sources WHERE id = ?"),
            [id],
            row_to_source,
        )
        .optional()
        .map_err(Into::into)
    }

    pub fn list_sources(&self, group_folder: &str) -> Result<Vec<KbSource>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {SOURCE_COLUMNS} FROM kb_sources
             WHERE group_folder = ? ORDER BY created_at DESC"
        ))?;
        let rows: Result<Vec<_>, _> = stmt.query_map([group_folder], row_to_source)?.collect();
        rows.map_err(Into::into)
    }

    pub fn find_source_by_url(&self, group_folder: &str, url: &str) -> Result<Option<String>> {
        let conn = self.lock_conn()?;
        conn.query_row(
            "SELECT id FROM kb_sources WHERE group_folder = ? AND url = ?",
            params![group_folder, url],
            |row| row.get(0),
        )
        .optional()
        .map_err(Into::into)
    }

    pub fn find_source_by_hash(&self, group_folder: &str, hash: &str) -> Result<Option<String>> {
        let conn = self.lock_conn()?;
        conn.query_row(
            "SELECT id FROM kb_sources WHERE group_folder = ? AND content_hash = ?",
            params![group_folder, hash],
            |row| row.get(0),
        )
        .optional()
        .map_err(Into::into)
    }

    /// Delete a source; its chunks cascade.
    pub fn delete_source(&self, id: &str) -> Result<bool> {
        let conn = self.lock_conn()?;
        let changed = conn.execute("DELETE FROM kb_sources WHERE id = ?", [id])?;
        Ok(changed > 0)
    }

    /// Atomically swap a source's chunks for a new set.
    pub fn replace_chunks(&self, source_id: &str, chunks: &[KbChunk]) -> Result<()> {
        let mut conn = self.lock_conn()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM kb_chunks WHERE source_id = ?", [source_id])?;
        for chunk in chunks {
            tx.execute(
                "INSERT INTO kb_chunks
                     (id, source_id, chunk_index, content, embedding, embedding_dim,
                      embedding_provider, embedding_model, created_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
                params![
                    chunk.id,
                    chunk.source_id,
                    chunk.chunk_index,
                    chunk.content,
                    chunk.embedding,
                    chunk.embedding_dim,
                    chunk.embedding_provider,
                    chunk.embedding_model,
                    chunk.created_at
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// All chunks with source metadata, optionally scoped to one group.
    pub fn chunks_in_scope(&self, group_folder: Option<&str>) -> Result<Vec<ChunkRow>> {
        let conn = self.lock_conn()?;
        let sql = "SELECT c.id, c.source_id, s.group_folder, s.url, s.title,
                          s.source_type, c.content, c.embedding
                   FROM kb_chunks c
                   JOIN kb_sources s ON c.source_id = s.id";
        let map = |row: &rusqlite::Row<'_>| -> rusqlite::Result<ChunkRow> {
            Ok(ChunkRow {
                chunk_id: row.get(0)?,
                source_id: row.get(1)?,
                group_folder: row.get(2)?,
                url: row.get(3)?,
                title: row.get(4)?,
                source_type: row.get(5)?,
                content: row.get(6)?,
                embedding: row.get(7)?,
            })
        };
        let rows: Result<Vec<ChunkRow>, rusqlite::Error> = match group_folder {
            Some(group) => {
                let mut stmt = conn.prepare(&format!("{sql} WHERE s.group_folder = ?"))?;
                let rows = stmt.query_map([group], map)?.collect();
                rows
            }
            None => {
                let mut stmt = conn.prepare(sql)?;
                let rows = stmt.query_map([], map)?.collect();
                rows
            }
        };
        rows.map_err(Into::into)
    }

    pub fn count_chunks(&self, source_id: &str) -> Result<i64> {
        let conn = self.lock_conn()?;
        conn.query_row(
            "SELECT COUNT(*) FROM kb_chunks WHERE source_id = ?",
            [source_id],
            |row| row.get(0),
        )
        .map_err(Into::into)
    }

    /// Chunks persisted without an embedding (provider was down at ingest).
    pub fn chunks_missing_embeddings(&self) -> Result<Vec<(String, String)>> {
        let conn = self.lock_conn()?;
        let mut stmt =
            conn.prepare("SELECT id, content FROM kb_chunks WHERE embedding IS NULL")?;
        let rows: Result<Vec<_>, _> = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
            .collect();
        rows.map_err(Into::into)
    }

    pub fn set_chunk_embedding(
        &self,
        chunk_id: &str,
        embedding: &[u8],
        dim: i64,
        provider: &str,
        model: &str,
    ) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "UPDATE kb_chunks SET embedding = ?, embedding_dim = ?,
                 embedding_provider = ?, embedding_model = ?
             WHERE id = ?",
            params![embedding, dim, provider, model, chunk_id],
        )?;
        Ok(())
    }
}

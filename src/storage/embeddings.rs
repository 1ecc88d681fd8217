//! CRUD for the `embeddings` table and its paired `ann_vectors` row.
//! Vector encoding uses the little-endian f32 blob convention shared
//! with `search::vector`.

use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;

use crate::error::{EngineError, ErrorCategory};
use crate::model::{decode_json_column, Embedding, EmbeddingParent, Id};
use crate::search::vector::encode_f32_blob;
use crate::util::now_iso8601;

use super::insert_with_fk_context;

pub struct NewEmbedding {
    pub parent: EmbeddingParentOwned,
    pub document_id: Id,
    pub model_name: String,
    pub model_version: Option<String>,
    pub task_type: Option<String>,
    pub inference_mode: Option<String>,
    pub source_metadata: Value,
    pub content_hash: String,
    pub provenance_id: Id,
    pub vector: Vec<f32>,
}

#[derive(Debug, Clone)]
pub enum EmbeddingParentOwned {
    Chunk(Id),
    Image(Id),
    Extraction(Id),
}

/// Insert both the `embeddings` row and its `ann_vectors` row in one
/// transaction — every embedding this engine stores is immediately
/// searchable.
pub fn insert(conn: &mut Connection, id: &Id, new: NewEmbedding) -> Result<Embedding, EngineError> {
    let (chunk_id, image_id, extraction_id) = match &new.parent {
        EmbeddingParentOwned::Chunk(c) => (Some(c.clone()), None, None),
        EmbeddingParentOwned::Image(i) => (None, Some(i.clone()), None),
        EmbeddingParentOwned::Extraction(e) => (None, None, Some(e.clone())),
    };

    let embedding = Embedding {
        id: id.clone(),
        chunk_id,
        image_id,
        extraction_id,
        document_id: new.document_id,
        model_name: new.model_name,
        model_version: new.model_version,
        task_type: new.task_type,
        inference_mode: new.inference_mode,
        source_metadata: new.source_metadata,
        content_hash: new.content_hash,
        provenance_id: new.provenance_id,
        created_at: now_iso8601(),
    };

    let source_metadata_json = serde_json::to_string(&embedding.source_metadata)?;
    let vector_blob = encode_f32_blob(&new.vector);
    let dimension = new.vector.len() as i64;

    let tx = conn.transaction()?;

    insert_with_fk_context("provenance_id", || {
        tx.execute(
            "INSERT INTO embeddings (
                id, chunk_id, image_id, extraction_id, document_id, model_name, model_version,
                task_type, inference_mode, source_metadata, content_hash, provenance_id, created_at
            ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13)",
            params![
                embedding.id,
                embedding.chunk_id,
                embedding.image_id,
                embedding.extraction_id,
                embedding.document_id,
                embedding.model_name,
                embedding.model_version,
                embedding.task_type,
                embedding.inference_mode,
                source_metadata_json,
                embedding.content_hash,
                embedding.provenance_id,
                embedding.created_at,
            ],
        )
    })?;

    tx.execute(
        "INSERT INTO ann_vectors (embedding_id, document_id, dimension, vector, model_name, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            embedding.id,
            embedding.document_id,
            dimension,
            vector_blob,
            embedding.model_name,
            embedding.created_at,
        ],
    )?;

    tx.commit()?;
    Ok(embedding)
}

pub fn get_by_id(conn: &Connection, id: &str) -> Result<Embedding, EngineError> {
    conn.query_row(&format!("{SELECT} WHERE id = ?1"), params![id], decode_row)
        .optional()?
        .ok_or_else(|| EngineError::new(ErrorCategory::DocumentNotFound, format!("no embedding with id '{id}'")))
}

pub fn list_by_document(conn: &Connection, document_id: &str) -> Result<Vec<Embedding>, EngineError> {
    let mut stmt = conn.prepare(&format!("{SELECT} WHERE document_id = ?1 ORDER BY created_at ASC"))?;
    let rows = stmt.query_map(params![document_id], decode_row)?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

const SELECT: &str = "SELECT id, chunk_id, image_id, extraction_id, document_id, model_name, model_version,
        task_type, inference_mode, source_metadata, content_hash, provenance_id, created_at
 FROM embeddings";

fn decode_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Embedding> {
    let source_metadata_raw: String = row.get(9)?;
    Ok(Embedding {
        id: row.get(0)?,
        chunk_id: row.get(1)?,
        image_id: row.get(2)?,
        extraction_id: row.get(3)?,
        document_id: row.get(4)?,
        model_name: row.get(5)?,
        model_version: row.get(6)?,
        task_type: row.get(7)?,
        inference_mode: row.get(8)?,
        source_metadata: decode_json_column(&source_metadata_raw, "source_metadata"),
        content_hash: row.get(10)?,
        provenance_id: row.get(11)?,
        created_at: row.get(12)?,
    })
}

impl Embedding {
    pub fn parent_owned(&self) -> Option<EmbeddingParentOwned> {
        match self.parent()? {
            EmbeddingParent::Chunk(c) => Some(EmbeddingParentOwned::Chunk(c.to_string())),
            EmbeddingParent::Image(i) => Some(EmbeddingParentOwned::Image(i.to_string())),
            EmbeddingParent::Extraction(e) => Some(EmbeddingParentOwned::Extraction(e.to_string())),
        }
    }
}

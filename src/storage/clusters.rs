//! CRUD for `clusters` / `cluster_documents`.

use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;

use crate::error::{EngineError, ErrorCategory};
use crate::model::{decode_json_column, Cluster, Id};
use crate::util::now_iso8601;

pub struct NewCluster {
    pub name: String,
    pub algorithm: String,
    pub parameters: Value,
    pub top_terms: Vec<String>,
    pub content_hash: String,
    pub provenance_id: Id,
    pub document_ids: Vec<Id>,
}

pub fn insert(conn: &mut Connection, id: &Id, new: NewCluster) -> Result<Cluster, EngineError> {
    let cluster = Cluster {
        id: id.clone(),
        name: new.name,
        algorithm: new.algorithm,
        parameters: new.parameters,
        document_count: new.document_ids.len() as i64,
        top_terms: new.top_terms,
        content_hash: new.content_hash,
        provenance_id: new.provenance_id,
        created_at: now_iso8601(),
    };

    let parameters_json = serde_json::to_string(&cluster.parameters)?;
    let top_terms_json = serde_json::to_string(&cluster.top_terms)?;

    let tx = conn.transaction()?;
    tx.execute(
        "INSERT INTO clusters (
            id, name, algorithm, parameters, document_count, top_terms, content_hash,
            provenance_id, created_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            cluster.id,
            cluster.name,
            cluster.algorithm,
            parameters_json,
            cluster.document_count,
            top_terms_json,
            cluster.content_hash,
            cluster.provenance_id,
            cluster.created_at,
        ],
    )?;

    for document_id in &new.document_ids {
        tx.execute(
            "INSERT INTO cluster_documents (cluster_id, document_id) VALUES (?1, ?2)",
            params![cluster.id, document_id],
        )?;
    }
    tx.commit()?;

    Ok(cluster)
}

pub fn get_by_id(conn: &Connection, id: &str) -> Result<Cluster, EngineError> {
    conn.query_row(
        "SELECT id, name, algorithm, parameters, document_count, top_terms, content_hash,
                provenance_id, created_at
         FROM clusters WHERE id = ?1",
        params![id],
        decode_row,
    )
    .optional()?
    .ok_or_else(|| EngineError::new(ErrorCategory::DocumentNotFound, format!("no cluster with id '{id}'")))
}

pub fn list_document_ids(conn: &Connection, cluster_id: &str) -> Result<Vec<Id>, EngineError> {
    let mut stmt = conn.prepare("SELECT document_id FROM cluster_documents WHERE cluster_id = ?1")?;
    let rows = stmt.query_map(params![cluster_id], |r| r.get::<_, String>(0))?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

/// Decrement a cluster's `document_count` by one.
pub fn decrement_document_count(conn: &Connection, cluster_id: &str) -> Result<(), EngineError> {
    conn.execute(
        "UPDATE clusters SET document_count = MAX(document_count - 1, 0) WHERE id = ?1",
        params![cluster_id],
    )?;
    Ok(())
}

fn decode_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Cluster> {
    let parameters_raw: String = row.get(3)?;
    let top_terms_raw: String = row.get(5)?;
    Ok(Cluster {
        id: row.get(0)?,
        name: row.get(1)?,
        algorithm: row.get(2)?,
        parameters: decode_json_column(&parameters_raw, "parameters"),
        document_count: row.get(4)?,
        top_terms: decode_json_column(&top_terms_raw, "top_terms"),
        content_hash: row.get(6)?,
        provenance_id: row.get(7)?,
        created_at: row.get(8)?,
    })
}

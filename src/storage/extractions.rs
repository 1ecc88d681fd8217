//! CRUD for the `extractions` table.

use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;

use crate::error::{EngineError, ErrorCategory};
use crate::model::{decode_json_column, Extraction, Id};
use crate::util::now_iso8601;

use super::insert_with_fk_context;

pub struct NewExtraction {
    pub ocr_result_id: Id,
    pub document_id: Id,
    pub schema_json: Value,
    pub extraction_json: Value,
    pub content_hash: String,
    pub provenance_id: Id,
}

pub fn insert(conn: &Connection, id: &Id, new: NewExtraction) -> Result<Extraction, EngineError> {
    let extraction = Extraction {
        id: id.clone(),
        ocr_result_id: new.ocr_result_id,
        document_id: new.document_id,
        schema_json: new.schema_json,
        extraction_json: new.extraction_json,
        content_hash: new.content_hash,
        provenance_id: new.provenance_id,
        created_at: now_iso8601(),
    };

    let schema_json_text = serde_json::to_string(&extraction.schema_json)?;
    let extraction_json_text = serde_json::to_string(&extraction.extraction_json)?;

    insert_with_fk_context("ocr_result_id", || {
        conn.execute(
            "INSERT INTO extractions (
                id, ocr_result_id, document_id, schema_json, extraction_json, content_hash,
                provenance_id, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                extraction.id,
                extraction.ocr_result_id,
                extraction.document_id,
                schema_json_text,
                extraction_json_text,
                extraction.content_hash,
                extraction.provenance_id,
                extraction.created_at,
            ],
        )
    })?;

    Ok(extraction)
}

pub fn get_by_id(conn: &Connection, id: &str) -> Result<Extraction, EngineError> {
    conn.query_row(
        "SELECT id, ocr_result_id, document_id, schema_json, extraction_json, content_hash,
                provenance_id, created_at
         FROM extractions WHERE id = ?1",
        params![id],
        decode_row,
    )
    .optional()?
    .ok_or_else(|| {
        EngineError::new(ErrorCategory::DocumentNotFound, format!("no extraction with id '{id}'"))
    })
}

pub fn list_by_document(conn: &Connection, document_id: &str) -> Result<Vec<Extraction>, EngineError> {
    let mut stmt = conn.prepare(
        "SELECT id, ocr_result_id, document_id, schema_json, extraction_json, content_hash,
                provenance_id, created_at
         FROM extractions WHERE document_id = ?1 ORDER BY created_at ASC",
    )?;
    let rows = stmt.query_map(params![document_id], decode_row)?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

fn decode_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Extraction> {
    let schema_raw: String = row.get(3)?;
    let extraction_raw: String = row.get(4)?;
    Ok(Extraction {
        id: row.get(0)?,
        ocr_result_id: row.get(1)?,
        document_id: row.get(2)?,
        schema_json: decode_json_column(&schema_raw, "schema_json"),
        extraction_json: decode_json_column(&extraction_raw, "extraction_json"),
        content_hash: row.get(5)?,
        provenance_id: row.get(6)?,
        created_at: row.get(7)?,
    })
}

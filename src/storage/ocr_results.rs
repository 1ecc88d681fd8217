//! CRUD for the `ocr_results` table.

use rusqlite::{params, Connection, OptionalExtension};

use crate::error::{EngineError, ErrorCategory};
use crate::model::{decode_json_column, Id, OcrResult};
use crate::util::now_iso8601;

use super::insert_with_fk_context;

pub struct NewOcrResult {
    pub document_id: Id,
    pub extracted_text: String,
    pub page_count: Option<i64>,
    pub quality_score: Option<f64>,
    pub page_offsets: Vec<i64>,
    pub processor: Option<String>,
    pub processor_version: Option<String>,
    pub request_id: Option<String>,
    pub duration_ms: Option<i64>,
    pub cost: Option<f64>,
    pub content_hash: String,
    pub provenance_id: Id,
}

pub fn insert(conn: &Connection, id: &Id, new: NewOcrResult) -> Result<OcrResult, EngineError> {
    let result = OcrResult {
        id: id.clone(),
        document_id: new.document_id,
        text_length: new.extracted_text.chars().count() as i64,
        extracted_text: new.extracted_text,
        page_count: new.page_count,
        quality_score: new.quality_score,
        page_offsets: new.page_offsets,
        processor: new.processor,
        processor_version: new.processor_version,
        request_id: new.request_id,
        duration_ms: new.duration_ms,
        cost: new.cost,
        content_hash: new.content_hash,
        provenance_id: new.provenance_id,
        created_at: now_iso8601(),
    };

    let page_offsets_json = serde_json::to_string(&result.page_offsets)?;

    insert_with_fk_context("document_id", || {
        conn.execute(
            "INSERT INTO ocr_results (
                id, document_id, extracted_text, text_length, page_count, quality_score,
                page_offsets, processor, processor_version, request_id, duration_ms, cost,
                content_hash, provenance_id, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            params![
                result.id,
                result.document_id,
                result.extracted_text,
                result.text_length,
                result.page_count,
                result.quality_score,
                page_offsets_json,
                result.processor,
                result.processor_version,
                result.request_id,
                result.duration_ms,
                result.cost,
                result.content_hash,
                result.provenance_id,
                result.created_at,
            ],
        )
    })?;

    Ok(result)
}

pub fn get_by_id(conn: &Connection, id: &str) -> Result<OcrResult, EngineError> {
    conn.query_row(
        "SELECT id, document_id, extracted_text, text_length, page_count, quality_score,
                page_offsets, processor, processor_version, request_id, duration_ms, cost,
                content_hash, provenance_id, created_at
         FROM ocr_results WHERE id = ?1",
        params![id],
        decode_row,
    )
    .optional()?
    .ok_or_else(|| {
        EngineError::new(ErrorCategory::DocumentNotFound, format!("no ocr_result with id '{id}'"))
    })
}

pub fn get_by_document_id(conn: &Connection, document_id: &str) -> Result<Option<OcrResult>, EngineError> {
    Ok(conn
        .query_row(
            "SELECT id, document_id, extracted_text, text_length, page_count, quality_score,
                    page_offsets, processor, processor_version, request_id, duration_ms, cost,
                    content_hash, provenance_id, created_at
             FROM ocr_results WHERE document_id = ?1",
            params![document_id],
            decode_row,
        )
        .optional()?)
}

fn decode_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<OcrResult> {
    let page_offsets_raw: String = row.get(6)?;
    Ok(OcrResult {
        id: row.get(0)?,
        document_id: row.get(1)?,
        extracted_text: row.get(2)?,
        text_length: row.get(3)?,
        page_count: row.get(4)?,
        quality_score: row.get(5)?,
        page_offsets: decode_json_column(&page_offsets_raw, "page_offsets"),
        processor: row.get(7)?,
        processor_version: row.get(8)?,
        request_id: row.get(9)?,
        duration_ms: row.get(10)?,
        cost: row.get(11)?,
        content_hash: row.get(12)?,
        provenance_id: row.get(13)?,
        created_at: row.get(14)?,
    })
}

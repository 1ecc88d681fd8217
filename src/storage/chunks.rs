//! CRUD for the `chunks` table.

use rusqlite::{params, Connection, OptionalExtension};

use crate::error::{EngineError, ErrorCategory};
use crate::model::{decode_json_column, Chunk, Id};
use crate::util::now_iso8601;

use super::cursor::{decode_cursor, encode_cursor};
use super::insert_with_fk_context;

pub struct NewChunk {
    pub ocr_result_id: Id,
    pub document_id: Id,
    pub text: String,
    pub text_hash: String,
    pub chunk_index: i64,
    pub char_start: i64,
    pub char_end: i64,
    pub page_number: Option<i64>,
    pub page_range_start: Option<i64>,
    pub page_range_end: Option<i64>,
    pub overlap_prev: i64,
    pub overlap_next: i64,
    pub heading_context: Option<String>,
    pub heading_level: Option<i64>,
    pub section_path: Option<String>,
    pub content_type_tags: Vec<String>,
    pub is_atomic: bool,
    pub chunking_strategy: Option<String>,
    pub provenance_id: Id,
}

pub fn insert(conn: &Connection, id: &Id, new: NewChunk) -> Result<Chunk, EngineError> {
    let chunk = Chunk {
        id: id.clone(),
        ocr_result_id: new.ocr_result_id,
        document_id: new.document_id,
        text: new.text,
        text_hash: new.text_hash,
        chunk_index: new.chunk_index,
        char_start: new.char_start,
        char_end: new.char_end,
        page_number: new.page_number,
        page_range_start: new.page_range_start,
        page_range_end: new.page_range_end,
        overlap_prev: new.overlap_prev,
        overlap_next: new.overlap_next,
        heading_context: new.heading_context,
        heading_level: new.heading_level,
        section_path: new.section_path,
        content_type_tags: new.content_type_tags,
        is_atomic: new.is_atomic,
        chunking_strategy: new.chunking_strategy,
        embedding_status: "pending".to_string(),
        provenance_id: new.provenance_id,
        created_at: now_iso8601(),
    };

    let content_type_tags_json = serde_json::to_string(&chunk.content_type_tags)?;

    insert_with_fk_context("ocr_result_id", || {
        conn.execute(
            "INSERT INTO chunks (
                id, ocr_result_id, document_id, text, text_hash, chunk_index, char_start, char_end,
                page_number, page_range_start, page_range_end, overlap_prev, overlap_next,
                heading_context, heading_level, section_path, content_type_tags, is_atomic,
                chunking_strategy, embedding_status, provenance_id, created_at
            ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18,?19,?20,?21,?22)",
            params![
                chunk.id,
                chunk.ocr_result_id,
                chunk.document_id,
                chunk.text,
                chunk.text_hash,
                chunk.chunk_index,
                chunk.char_start,
                chunk.char_end,
                chunk.page_number,
                chunk.page_range_start,
                chunk.page_range_end,
                chunk.overlap_prev,
                chunk.overlap_next,
                chunk.heading_context,
                chunk.heading_level,
                chunk.section_path,
                content_type_tags_json,
                chunk.is_atomic,
                chunk.chunking_strategy,
                chunk.embedding_status,
                chunk.provenance_id,
                chunk.created_at,
            ],
        )
    })?;

    Ok(chunk)
}

/// Insert several chunks (e.g. one OCR result's full chunk set) in a
/// single transaction.
pub fn insert_batch(conn: &mut Connection, entries: Vec<(Id, NewChunk)>) -> Result<Vec<Chunk>, EngineError> {
    let tx = conn.transaction()?;
    let mut out = Vec::with_capacity(entries.len());
    for (id, new) in entries {
        out.push(insert(&tx, &id, new)?);
    }
    tx.commit()?;
    Ok(out)
}

pub fn get_by_id(conn: &Connection, id: &str) -> Result<Chunk, EngineError> {
    conn.query_row(&format!("{SELECT} WHERE id = ?1"), params![id], decode_row)
        .optional()?
        .ok_or_else(|| EngineError::new(ErrorCategory::DocumentNotFound, format!("no chunk with id '{id}'")))
}

pub fn list_by_document_offset(
    conn: &Connection,
    document_id: &str,
    limit: i64,
    offset: i64,
) -> Result<Vec<Chunk>, EngineError> {
    let mut stmt = conn.prepare(&format!(
        "{SELECT} WHERE document_id = ?1 ORDER BY created_at ASC, id ASC LIMIT ?2 OFFSET ?3"
    ))?;
    let rows = stmt.query_map(params![document_id, limit, offset], decode_row)?;
    collect(rows)
}

pub fn list_by_document_after_cursor(
    conn: &Connection,
    document_id: &str,
    limit: i64,
    cursor: &str,
) -> Result<Vec<Chunk>, EngineError> {
    let decoded = decode_cursor(cursor)?;
    let mut stmt = conn.prepare(&format!(
        "{SELECT} WHERE document_id = ?1 AND (created_at, id) > (?2, ?3) ORDER BY created_at ASC, id ASC LIMIT ?4"
    ))?;
    let rows = stmt.query_map(
        params![document_id, decoded.created_at, decoded.id, limit],
        decode_row,
    )?;
    collect(rows)
}

pub fn next_cursor(chunks: &[Chunk]) -> Option<String> {
    chunks.last().map(|c| encode_cursor(&c.created_at, &c.id))
}

pub fn filter_by_section_path_prefix(
    conn: &Connection,
    document_id: &str,
    prefix: &str,
) -> Result<Vec<Chunk>, EngineError> {
    let mut stmt = conn.prepare(&format!(
        "{SELECT} WHERE document_id = ?1 AND section_path LIKE ?2 ORDER BY chunk_index ASC"
    ))?;
    let like_pattern = format!("{}%", prefix.replace('%', "\\%").replace('_', "\\_"));
    let rows = stmt.query_map(params![document_id, like_pattern], decode_row)?;
    collect(rows)
}

pub fn update_embedding_status(conn: &Connection, id: &str, status: &str) -> Result<(), EngineError> {
    let updated = conn.execute(
        "UPDATE chunks SET embedding_status = ?1 WHERE id = ?2",
        params![status, id],
    )?;
    if updated == 0 {
        return Err(EngineError::new(ErrorCategory::DocumentNotFound, format!("no chunk with id '{id}'")));
    }
    Ok(())
}

pub fn delete_by_document(conn: &Connection, document_id: &str) -> Result<(), EngineError> {
    conn.execute("DELETE FROM chunks WHERE document_id = ?1", params![document_id])?;
    Ok(())
}

const SELECT: &str = "SELECT id, ocr_result_id, document_id, text, text_hash, chunk_index, char_start, char_end,
        page_number, page_range_start, page_range_end, overlap_prev, overlap_next, heading_context,
        heading_level, section_path, content_type_tags, is_atomic, chunking_strategy, embedding_status,
        provenance_id, created_at
 FROM chunks";

fn decode_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Chunk> {
    let tags_raw: String = row.get(16)?;
    Ok(Chunk {
        id: row.get(0)?,
        ocr_result_id: row.get(1)?,
        document_id: row.get(2)?,
        text: row.get(3)?,
        text_hash: row.get(4)?,
        chunk_index: row.get(5)?,
        char_start: row.get(6)?,
        char_end: row.get(7)?,
        page_number: row.get(8)?,
        page_range_start: row.get(9)?,
        page_range_end: row.get(10)?,
        overlap_prev: row.get(11)?,
        overlap_next: row.get(12)?,
        heading_context: row.get(13)?,
        heading_level: row.get(14)?,
        section_path: row.get(15)?,
        content_type_tags: decode_json_column(&tags_raw, "content_type_tags"),
        is_atomic: row.get(17)?,
        chunking_strategy: row.get(18)?,
        embedding_status: row.get(19)?,
        provenance_id: row.get(20)?,
        created_at: row.get(21)?,
    })
}

fn collect(rows: impl Iterator<Item = rusqlite::Result<Chunk>>) -> Result<Vec<Chunk>, EngineError> {
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::open_database;
    use crate::provenance::{insert_provenance, NewProvenance};
    use crate::util::new_id;

    fn root(conn: &Connection, hash: &str) -> Id {
        insert_provenance(
            conn,
            NewProvenance {
                kind: crate::model::ProvenanceType::Chunk,
                source_type: None,
                source_id: None,
                root_document_id: None,
                content_hash: hash.to_string(),
                input_hash: None,
                processor: None,
                processor_version: None,
                processing_params: serde_json::json!({}),
                duration_ms: None,
                quality_score: None,
                parent_id: None,
            },
        )
        .unwrap()
        .id
    }

    fn new_chunk(ocr_result_id: Id, document_id: Id, index: i64, prov_id: Id) -> NewChunk {
        NewChunk {
            ocr_result_id,
            document_id,
            text: format!("chunk {index}"),
            text_hash: "sha256:x".into(),
            chunk_index: index,
            char_start: 0,
            char_end: 10,
            page_number: Some(1),
            page_range_start: None,
            page_range_end: None,
            overlap_prev: 0,
            overlap_next: 0,
            heading_context: None,
            heading_level: None,
            section_path: Some("intro/background".into()),
            content_type_tags: vec!["text".into()],
            is_atomic: false,
            chunking_strategy: Some("recursive".into()),
            provenance_id: prov_id,
        }
    }

    #[test]
    fn insert_and_get_round_trip_json_columns() {
        let dir = tempfile::tempdir().unwrap();
        let conn = open_database(&dir.path().join("t.db")).unwrap();
        let prov_id = root(&conn, "sha256:a");
        let chunk = insert(&conn, &new_id(), new_chunk("o1".into(), "d1".into(), 0, prov_id)).unwrap();
        let fetched = get_by_id(&conn, &chunk.id).unwrap();
        assert_eq!(fetched.content_type_tags, vec!["text".to_string()]);
        assert_eq!(fetched.embedding_status, "pending");
    }

    #[test]
    fn cursor_pagination_within_a_document_is_ascending_and_gapless() {
        let dir = tempfile::tempdir().unwrap();
        let conn = open_database(&dir.path().join("t.db")).unwrap();
        for i in 0..4 {
            let prov_id = root(&conn, &format!("sha256:{i:064}"));
            insert(&conn, &new_id(), new_chunk("o1".into(), "d1".into(), i, prov_id)).unwrap();
        }

        let mut seen = Vec::new();
        let page = list_by_document_offset(&conn, "d1", 2, 0).unwrap();
        seen.extend(page.iter().map(|c| c.id.clone()));
        let mut cursor = next_cursor(&page).unwrap();
        loop {
            let page = list_by_document_after_cursor(&conn, "d1", 2, &cursor).unwrap();
            if page.is_empty() {
                break;
            }
            seen.extend(page.iter().map(|c| c.id.clone()));
            cursor = next_cursor(&page).unwrap();
        }
        assert_eq!(seen.len(), 4);
    }

    #[test]
    fn filter_by_section_path_prefix_matches_only_prefixed_rows() {
        let dir = tempfile::tempdir().unwrap();
        let conn = open_database(&dir.path().join("t.db")).unwrap();
        let prov_id = root(&conn, "sha256:a");
        insert(&conn, &new_id(), new_chunk("o1".into(), "d1".into(), 0, prov_id)).unwrap();

        let matches = filter_by_section_path_prefix(&conn, "d1", "intro").unwrap();
        assert_eq!(matches.len(), 1);
        let no_matches = filter_by_section_path_prefix(&conn, "d1", "appendix").unwrap();
        assert!(no_matches.is_empty());
    }
}

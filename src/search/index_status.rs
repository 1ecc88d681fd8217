//! FTS index health reporting and rebuild.
//!
//! Each of the four FTS5 tables is kept in sync by triggers rather than
//! being rebuilt on every write; this module answers "is that sync
//! trustworthy right now" and provides the repair path for when it isn't.

use rusqlite::Connection;
use sha2::{Digest, Sha256};

use crate::error::EngineError;

/// One of the four FTS5 indexes this engine maintains.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexKind {
    Chunks,
    Vlm,
    Extractions,
    DocumentMetadata,
}

impl IndexKind {
    fn fts_table(self) -> &'static str {
        match self {
            IndexKind::Chunks => "chunks_fts",
            IndexKind::Vlm => "vlm_fts",
            IndexKind::Extractions => "extractions_fts",
            IndexKind::DocumentMetadata => "document_metadata_fts",
        }
    }

    fn base_table(self) -> &'static str {
        match self {
            IndexKind::Chunks => "chunks",
            IndexKind::Vlm => "images",
            IndexKind::Extractions => "extractions",
            IndexKind::DocumentMetadata => "documents",
        }
    }

    /// `WHERE` predicate (if any) narrowing the base table to the rows
    /// this index actually indexes. VLM only indexes images that have a
    /// description; the other three index every base row.
    fn base_predicate(self) -> Option<&'static str> {
        match self {
            IndexKind::Vlm => Some("vlm_description IS NOT NULL"),
            _ => None,
        }
    }

    fn trigger_names(self) -> [&'static str; 3] {
        match self {
            IndexKind::Chunks => ["chunks_fts_ai", "chunks_fts_ad", "chunks_fts_au"],
            IndexKind::Vlm => ["vlm_fts_ai", "vlm_fts_ad", "vlm_fts_au"],
            IndexKind::Extractions => ["extractions_fts_ai", "extractions_fts_ad", "extractions_fts_au"],
            IndexKind::DocumentMetadata => [
                "document_metadata_fts_ai",
                "document_metadata_fts_ad",
                "document_metadata_fts_au",
            ],
        }
    }

    const ALL: [IndexKind; 4] = [
        IndexKind::Chunks,
        IndexKind::Vlm,
        IndexKind::Extractions,
        IndexKind::DocumentMetadata,
    ];
}

/// A single index's health snapshot.
#[derive(Debug, Clone)]
pub struct IndexStatus {
    pub kind: IndexKind,
    pub base_count: i64,
    pub fts_count: i64,
    pub triggers_present: bool,
    pub content_hash: Option<String>,
    pub is_stale: bool,
}

const STALE_RATIO_THRESHOLD: f64 = 0.10;

fn base_count(conn: &Connection, kind: IndexKind) -> Result<i64, EngineError> {
    let sql = match kind.base_predicate() {
        Some(predicate) => format!("SELECT COUNT(*) FROM {} WHERE {}", kind.base_table(), predicate),
        None => format!("SELECT COUNT(*) FROM {}", kind.base_table()),
    };
    Ok(conn.query_row(&sql, [], |row| row.get(0))?)
}

fn fts_count(conn: &Connection, kind: IndexKind) -> Result<i64, EngineError> {
    let sql = format!("SELECT COUNT(*) FROM {}", kind.fts_table());
    Ok(conn.query_row(&sql, [], |row| row.get(0))?)
}

fn triggers_present(conn: &Connection, kind: IndexKind) -> Result<bool, EngineError> {
    for name in kind.trigger_names() {
        let exists: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'trigger' AND name = ?1)",
            [name],
            |row| row.get(0),
        )?;
        if !exists {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Whether an index is stale: its sync triggers are missing, or the
/// base-vs-FTS row count has drifted by more than 10%.
fn compute_stale(triggers_present: bool, base_count: i64, fts_count: i64) -> bool {
    if !triggers_present {
        return true;
    }
    if base_count == 0 {
        return fts_count != 0;
    }
    let ratio = (fts_count - base_count).unsigned_abs() as f64 / base_count as f64;
    ratio > STALE_RATIO_THRESHOLD
}

/// A streamed SHA-256 over `id:text_hash` pairs, in ascending `id` order,
/// for the chunks index.
fn chunks_content_hash(conn: &Connection) -> Result<String, EngineError> {
    let mut stmt = conn.prepare("SELECT id, text_hash FROM chunks ORDER BY id ASC")?;
    let rows = stmt.query_map([], |row| {
        let id: String = row.get(0)?;
        let text_hash: String = row.get(1)?;
        Ok((id, text_hash))
    })?;

    let mut hasher = Sha256::new();
    for row in rows {
        let (id, text_hash) = row?;
        hasher.update(id.as_bytes());
        hasher.update(b":");
        hasher.update(text_hash.as_bytes());
        hasher.update(b"\n");
    }
    Ok(format!("sha256:{}", hex::encode(hasher.finalize())))
}

/// Report the health of one FTS index.
pub fn status(conn: &Connection, kind: IndexKind) -> Result<IndexStatus, EngineError> {
    let base = base_count(conn, kind)?;
    let fts = fts_count(conn, kind)?;
    let triggers = triggers_present(conn, kind)?;
    let content_hash = if kind == IndexKind::Chunks {
        Some(chunks_content_hash(conn)?)
    } else {
        None
    };

    Ok(IndexStatus {
        kind,
        base_count: base,
        fts_count: fts,
        triggers_present: triggers,
        content_hash,
        is_stale: compute_stale(triggers, base, fts),
    })
}

/// Report the health of all four FTS indexes.
pub fn status_all(conn: &Connection) -> Result<Vec<IndexStatus>, EngineError> {
    IndexKind::ALL.iter().map(|&kind| status(conn, kind)).collect()
}

/// Rebuild one FTS index inside a transaction. Chunks and extractions use
/// the FTS5 built-in `'rebuild'` command; VLM rebuilds explicitly,
/// because a plain rebuild over `content='images'` would index every
/// image row (including ones with no description) rather than only the
/// ones the sync triggers actually index.
pub fn rebuild(conn: &mut Connection, kind: IndexKind) -> Result<(), EngineError> {
    let tx = conn.transaction()?;
    match kind {
        IndexKind::Chunks => {
            tx.execute("INSERT INTO chunks_fts(chunks_fts) VALUES ('rebuild')", [])?;
        }
        IndexKind::Extractions => {
            tx.execute("INSERT INTO extractions_fts(extractions_fts) VALUES ('rebuild')", [])?;
        }
        IndexKind::DocumentMetadata => {
            tx.execute(
                "INSERT INTO document_metadata_fts(document_metadata_fts) VALUES ('rebuild')",
                [],
            )?;
        }
        IndexKind::Vlm => {
            tx.execute("INSERT INTO vlm_fts(vlm_fts) VALUES ('delete-all')", [])?;
            tx.execute(
                "INSERT INTO vlm_fts(rowid, vlm_description)
                 SELECT rowid, vlm_description FROM images WHERE vlm_description IS NOT NULL",
                [],
            )?;
        }
    }
    tx.commit()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::open_database;
    use crate::provenance::{insert_provenance, NewProvenance};
    use crate::storage::chunks::{self, NewChunk};
    use crate::storage::documents::{self, NewDocument};
    use crate::storage::ocr_results::{self, NewOcrResult};
    use crate::util::new_id;

    fn prov(conn: &Connection, kind: crate::model::ProvenanceType, hash: &str) -> crate::model::Id {
        insert_provenance(
            conn,
            NewProvenance {
                kind,
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

    fn seed(conn: &Connection) {
        let doc_prov = prov(conn, crate::model::ProvenanceType::Document, "sha256:a");
        let doc = documents::insert(
            conn,
            &new_id(),
            NewDocument {
                file_path: "/tmp/a.pdf".into(),
                file_name: "a.pdf".into(),
                file_hash: "sha256:a".into(),
                file_size: 1,
                file_type: "pdf".into(),
                title: None,
                author: None,
                subject: None,
                provenance_id: doc_prov,
            },
        )
        .unwrap();
        let ocr_prov = prov(conn, crate::model::ProvenanceType::OcrResult, "sha256:b");
        let ocr = ocr_results::insert(
            conn,
            &new_id(),
            NewOcrResult {
                document_id: doc.id.clone(),
                extracted_text: "hello".into(),
                page_count: Some(1),
                quality_score: None,
                page_offsets: vec![0],
                processor: None,
                processor_version: None,
                request_id: None,
                duration_ms: None,
                cost: None,
                content_hash: "sha256:b".into(),
                provenance_id: ocr_prov,
            },
        )
        .unwrap();
        let chunk_prov = prov(conn, crate::model::ProvenanceType::Chunk, "sha256:c");
        chunks::insert(
            conn,
            &new_id(),
            NewChunk {
                ocr_result_id: ocr.id,
                document_id: doc.id,
                text: "hello world".into(),
                text_hash: "sha256:c".into(),
                chunk_index: 0,
                char_start: 0,
                char_end: 11,
                page_number: Some(1),
                page_range_start: None,
                page_range_end: None,
                overlap_prev: 0,
                overlap_next: 0,
                heading_context: None,
                heading_level: None,
                section_path: None,
                content_type_tags: vec!["text".into()],
                is_atomic: false,
                chunking_strategy: None,
                provenance_id: chunk_prov,
            },
        )
        .unwrap();
    }

    #[test]
    fn freshly_seeded_index_is_not_stale() {
        let dir = tempfile::tempdir().unwrap();
        let conn = open_database(&dir.path().join("t.db")).unwrap();
        seed(&conn);
        let report = status(&conn, IndexKind::Chunks).unwrap();
        assert_eq!(report.base_count, 1);
        assert_eq!(report.fts_count, 1);
        assert!(!report.is_stale);
        assert!(report.content_hash.is_some());
    }

    #[test]
    fn missing_triggers_are_reported_as_stale() {
        let dir = tempfile::tempdir().unwrap();
        let conn = open_database(&dir.path().join("t.db")).unwrap();
        seed(&conn);
        conn.execute("DROP TRIGGER chunks_fts_ai", []).unwrap();
        let report = status(&conn, IndexKind::Chunks).unwrap();
        assert!(!report.triggers_present);
        assert!(report.is_stale);
    }

    #[test]
    fn drifted_counts_beyond_ten_percent_are_stale() {
        let dir = tempfile::tempdir().unwrap();
        let mut conn = open_database(&dir.path().join("t.db")).unwrap();
        seed(&conn);
        conn.execute("INSERT INTO chunks_fts(rowid, text) VALUES (9999, 'phantom')", [])
            .unwrap();
        let report = status(&conn, IndexKind::Chunks).unwrap();
        assert!(report.is_stale);

        rebuild(&mut conn, IndexKind::Chunks).unwrap();
        let report = status(&conn, IndexKind::Chunks).unwrap();
        assert!(!report.is_stale);
    }

    #[test]
    fn empty_base_table_with_no_fts_rows_is_not_stale() {
        let dir = tempfile::tempdir().unwrap();
        let conn = open_database(&dir.path().join("t.db")).unwrap();
        let report = status(&conn, IndexKind::Extractions).unwrap();
        assert_eq!(report.base_count, 0);
        assert!(!report.is_stale);
    }
}

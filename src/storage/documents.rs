//! CRUD for the `documents` table.

use rusqlite::{params, Connection, OptionalExtension};

use crate::error::{EngineError, ErrorCategory};
use crate::model::{Document, DocumentStatus, Id};
use crate::util::now_iso8601;

use super::cursor::{decode_cursor, encode_cursor};
use super::insert_with_fk_context;

pub struct NewDocument {
    pub file_path: String,
    pub file_name: String,
    pub file_hash: String,
    pub file_size: i64,
    pub file_type: String,
    pub title: Option<String>,
    pub author: Option<String>,
    pub subject: Option<String>,
    pub provenance_id: Id,
}

pub fn insert(conn: &Connection, id: &Id, new: NewDocument) -> Result<Document, EngineError> {
    let now = now_iso8601();
    let doc = Document {
        id: id.clone(),
        file_path: new.file_path,
        file_name: new.file_name,
        file_hash: new.file_hash,
        file_size: new.file_size,
        file_type: new.file_type,
        status: DocumentStatus::Pending,
        page_count: None,
        title: new.title,
        author: new.author,
        subject: new.subject,
        error_message: None,
        provenance_id: new.provenance_id,
        created_at: now.clone(),
        updated_at: now,
    };

    insert_with_fk_context("provenance_id", || {
        conn.execute(
            "INSERT INTO documents (
                id, file_path, file_name, file_hash, file_size, file_type, status,
                page_count, title, author, subject, error_message, provenance_id,
                created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            params![
                doc.id,
                doc.file_path,
                doc.file_name,
                doc.file_hash,
                doc.file_size,
                doc.file_type,
                doc.status.as_db_str(),
                doc.page_count,
                doc.title,
                doc.author,
                doc.subject,
                doc.error_message,
                doc.provenance_id,
                doc.created_at,
                doc.updated_at,
            ],
        )
    })?;

    Ok(doc)
}

/// Insert several documents inside one transaction").
pub fn insert_batch(
    conn: &mut Connection,
    entries: Vec<(Id, NewDocument)>,
) -> Result<Vec<Document>, EngineError> {
    let tx = conn.transaction()?;
    let mut out = Vec::with_capacity(entries.len());
    for (id, new) in entries {
        out.push(insert(&tx, &id, new)?);
    }
    tx.commit()?;
    Ok(out)
}

pub fn get_by_id(conn: &Connection, id: &str) -> Result<Document, EngineError> {
    conn.query_row(SELECT_COLUMNS_WHERE_ID, params![id], decode_row)
        .optional()?
        .ok_or_else(|| {
            EngineError::new(ErrorCategory::DocumentNotFound, format!("no document with id '{id}'"))
        })
}

pub fn list_offset(conn: &Connection, limit: i64, offset: i64) -> Result<Vec<Document>, EngineError> {
    let mut stmt = conn.prepare(
        "SELECT id, file_path, file_name, file_hash, file_size, file_type, status, page_count,
                title, author, subject, error_message, provenance_id, created_at, updated_at
         FROM documents ORDER BY created_at DESC, id DESC LIMIT ?1 OFFSET ?2",
    )?;
    let rows = stmt.query_map(params![limit, offset], decode_row)?;
    collect(rows)
}

/// Keyset pagination: rows strictly older than the cursor's
/// `(created_at, id)` pair, in the same descending order `list_offset`
/// uses, so callers can page forward without `OFFSET`'s linear cost.
pub fn list_after_cursor(conn: &Connection, limit: i64, cursor: &str) -> Result<Vec<Document>, EngineError> {
    let decoded = decode_cursor(cursor)?;
    let mut stmt = conn.prepare(
        "SELECT id, file_path, file_name, file_hash, file_size, file_type, status, page_count,
                title, author, subject, error_message, provenance_id, created_at, updated_at
         FROM documents
         WHERE (created_at, id) < (?1, ?2)
         ORDER BY created_at DESC, id DESC LIMIT ?3",
    )?;
    let rows = stmt.query_map(params![decoded.created_at, decoded.id, limit], decode_row)?;
    collect(rows)
}

pub fn next_cursor(documents: &[Document]) -> Option<String> {
    documents.last().map(|d| encode_cursor(&d.created_at, &d.id))
}

pub fn filter_by_status(conn: &Connection, status: DocumentStatus) -> Result<Vec<Document>, EngineError> {
    let mut stmt = conn.prepare(
        "SELECT id, file_path, file_name, file_hash, file_size, file_type, status, page_count,
                title, author, subject, error_message, provenance_id, created_at, updated_at
         FROM documents WHERE status = ?1 ORDER BY created_at DESC, id DESC",
    )?;
    let rows = stmt.query_map(params![status.as_db_str()], decode_row)?;
    collect(rows)
}

pub fn filter_by_file_type(conn: &Connection, file_type: &str) -> Result<Vec<Document>, EngineError> {
    let mut stmt = conn.prepare(
        "SELECT id, file_path, file_name, file_hash, file_size, file_type, status, page_count,
                title, author, subject, error_message, provenance_id, created_at, updated_at
         FROM documents WHERE file_type = ?1 ORDER BY created_at DESC, id DESC",
    )?;
    let rows = stmt.query_map(params![file_type], decode_row)?;
    collect(rows)
}

pub fn filter_by_date_range(
    conn: &Connection,
    start: &str,
    end: &str,
) -> Result<Vec<Document>, EngineError> {
    let mut stmt = conn.prepare(
        "SELECT id, file_path, file_name, file_hash, file_size, file_type, status, page_count,
                title, author, subject, error_message, provenance_id, created_at, updated_at
         FROM documents WHERE created_at >= ?1 AND created_at <= ?2 ORDER BY created_at DESC, id DESC",
    )?;
    let rows = stmt.query_map(params![start, end], decode_row)?;
    collect(rows)
}

pub fn update_status(
    conn: &Connection,
    id: &str,
    status: DocumentStatus,
    error_message: Option<&str>,
) -> Result<(), EngineError> {
    let updated = conn.execute(
        "UPDATE documents SET status = ?1, error_message = ?2, updated_at = ?3 WHERE id = ?4",
        params![status.as_db_str(), error_message, now_iso8601(), id],
    )?;
    if updated == 0 {
        return Err(EngineError::new(
            ErrorCategory::DocumentNotFound,
            format!("no document with id '{id}'"),
        ));
    }
    Ok(())
}

pub fn delete(conn: &Connection, id: &str) -> Result<(), EngineError> {
    conn.execute("DELETE FROM documents WHERE id = ?1", params![id])?;
    Ok(())
}

const SELECT_COLUMNS_WHERE_ID: &str = "SELECT id, file_path, file_name, file_hash, file_size, file_type, status, page_count,
        title, author, subject, error_message, provenance_id, created_at, updated_at
 FROM documents WHERE id = ?1";

fn decode_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Document> {
    let status_raw: String = row.get(6)?;
    let status = DocumentStatus::from_db_str(&status_raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            6,
            rusqlite::types::Type::Text,
            format!("unknown document status '{status_raw}'").into(),
        )
    })?;
    Ok(Document {
        id: row.get(0)?,
        file_path: row.get(1)?,
        file_name: row.get(2)?,
        file_hash: row.get(3)?,
        file_size: row.get(4)?,
        file_type: row.get(5)?,
        status,
        page_count: row.get(7)?,
        title: row.get(8)?,
        author: row.get(9)?,
        subject: row.get(10)?,
        error_message: row.get(11)?,
        provenance_id: row.get(12)?,
        created_at: row.get(13)?,
        updated_at: row.get(14)?,
    })
}

fn collect(
    rows: impl Iterator<Item = rusqlite::Result<Document>>,
) -> Result<Vec<Document>, EngineError> {
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

    fn root_provenance(conn: &Connection, hash: &str) -> Id {
        insert_provenance(
            conn,
            NewProvenance {
                kind: crate::model::ProvenanceType::Document,
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

    fn sample(conn: &Connection) -> Document {
        let prov_id = root_provenance(conn, "sha256:aaa");
        insert(
            conn,
            &new_id(),
            NewDocument {
                file_path: "/tmp/a.pdf".into(),
                file_name: "a.pdf".into(),
                file_hash: "sha256:aaa".into(),
                file_size: 4,
                file_type: "pdf".into(),
                title: None,
                author: None,
                subject: None,
                provenance_id: prov_id,
            },
        )
        .unwrap()
    }

    #[test]
    fn insert_and_get_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let conn = open_database(&dir.path().join("t.db")).unwrap();
        let doc = sample(&conn);
        let fetched = get_by_id(&conn, &doc.id).unwrap();
        assert_eq!(fetched.file_hash, "sha256:aaa");
        assert_eq!(fetched.status, DocumentStatus::Pending);
    }

    #[test]
    fn get_by_id_missing_is_document_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let conn = open_database(&dir.path().join("t.db")).unwrap();
        let err = get_by_id(&conn, "missing").unwrap_err();
        assert_eq!(err.category, ErrorCategory::DocumentNotFound);
    }

    #[test]
    fn update_status_changes_row() {
        let dir = tempfile::tempdir().unwrap();
        let conn = open_database(&dir.path().join("t.db")).unwrap();
        let doc = sample(&conn);
        update_status(&conn, &doc.id, DocumentStatus::Failed, Some("boom")).unwrap();
        let fetched = get_by_id(&conn, &doc.id).unwrap();
        assert_eq!(fetched.status, DocumentStatus::Failed);
        assert_eq!(fetched.error_message.as_deref(), Some("boom"));
    }

    #[test]
    fn cursor_pagination_walks_all_rows_without_duplicates_or_gaps() {
        let dir = tempfile::tempdir().unwrap();
        let conn = open_database(&dir.path().join("t.db")).unwrap();
        for i in 0..5 {
            let prov_id = root_provenance(&conn, &format!("sha256:{i:064}"));
            insert(
                &conn,
                &new_id(),
                NewDocument {
                    file_path: format!("/tmp/{i}.pdf"),
                    file_name: format!("{i}.pdf"),
                    file_hash: format!("sha256:{i:064}"),
                    file_size: 1,
                    file_type: "pdf".into(),
                    title: None,
                    author: None,
                    subject: None,
                    provenance_id: prov_id,
                },
            )
            .unwrap();
        }

        let mut seen = Vec::new();
        let page = list_offset(&conn, 2, 0).unwrap();
        assert_eq!(page.len(), 2);
        seen.extend(page.iter().map(|d| d.id.clone()));

        let mut cursor = next_cursor(&page).unwrap();
        loop {
            let page = list_after_cursor(&conn, 2, &cursor).unwrap();
            if page.is_empty() {
                break;
            }
            seen.extend(page.iter().map(|d| d.id.clone()));
            cursor = next_cursor(&page).unwrap();
        }

        assert_eq!(seen.len(), 5);
        let unique: std::collections::HashSet<_> = seen.iter().collect();
        assert_eq!(unique.len(), 5);
    }

    #[test]
    fn filter_by_status_and_file_type() {
        let dir = tempfile::tempdir().unwrap();
        let conn = open_database(&dir.path().join("t.db")).unwrap();
        let doc = sample(&conn);
        update_status(&conn, &doc.id, DocumentStatus::Complete, None).unwrap();

        let by_status = filter_by_status(&conn, DocumentStatus::Complete).unwrap();
        assert_eq!(by_status.len(), 1);

        let by_type = filter_by_file_type(&conn, "pdf").unwrap();
        assert_eq!(by_type.len(), 1);
    }
}

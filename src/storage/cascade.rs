//! The cascade-delete engine.
//!
//! Deleting a document touches every derived table and the self-
//! referential provenance DAG, several of them through foreign keys that
//! are either circular (image ↔ embedding) or polymorphic (entity_tags,
//! which cannot declare a real FK since `entity_id` ranges over five
//! tables). Both call sites ([`delete_document`] and
//! [`reset_document_for_retry`]) run the same fixed stage order inside a
//! single transaction; the caller never sees a partially-applied delete.

use rusqlite::{params, Connection};

use crate::db::schema::ORPHANED_ROOT_ID;
use crate::error::EngineError;
use crate::model::{EntityType, Id, ProvenanceType};
use crate::provenance::compute_chain_hash;
use crate::util::now_iso8601;

use super::{clusters, table_exists, tags};

/// Steps 1-10: strip every derived artifact of a document (vectors,
/// embeddings, images, cluster membership, chunks, extractions, OCR
/// results) without touching the document row or its provenance tree.
/// Shared by [`delete_document`] (continues on to steps 11-14) and
/// [`reset_document_for_retry`] (stops here).
fn strip_derived_data(tx: &rusqlite::Transaction<'_>, document_id: &str) -> Result<(), EngineError> {
    // 1. ANN vectors for this document's embeddings, via subquery rather
    //    than a materialized id list.
    let ann_deleted = tx.execute(
        "DELETE FROM ann_vectors WHERE embedding_id IN (SELECT id FROM embeddings WHERE document_id = ?1)",
        params![document_id],
    )?;
    tracing::debug!(document_id, ann_deleted, "cascade: removed ann_vectors rows");

    // 2. Break this document's own image -> embedding circular reference.
    tx.execute(
        "UPDATE images SET vlm_embedding_id = NULL WHERE document_id = ?1",
        params![document_id],
    )?;

    // 3. Other documents' images may have been deduplicated onto one of
    //    this document's embeddings. Re-queue them rather than leaving a
    //    dangling reference.
    let mut affected_documents: Vec<String> = Vec::new();
    {
        let mut stmt = tx.prepare(
            "SELECT DISTINCT document_id FROM images
             WHERE document_id != ?1
               AND vlm_embedding_id IN (SELECT id FROM embeddings WHERE document_id = ?1)",
        )?;
        let rows = stmt.query_map(params![document_id], |r| r.get::<_, String>(0))?;
        for row in rows {
            affected_documents.push(row?);
        }
    }
    if !affected_documents.is_empty() {
        tx.execute(
            "UPDATE images SET vlm_embedding_id = NULL, vlm_status = 'pending'
             WHERE document_id != ?1
               AND vlm_embedding_id IN (SELECT id FROM embeddings WHERE document_id = ?1)",
            params![document_id],
        )?;
        tracing::warn!(
            document_id,
            affected_documents = ?affected_documents,
            "cascade: re-queued aliased VLM descriptions in other documents"
        );
    }

    // 4. Polymorphic entity-tags for document + its chunks/images/extractions.
    if table_exists(tx, "entity_tags")? {
        tags::delete_for_entity(tx, document_id, EntityType::Document)?;
        for (table, entity_type) in [
            ("chunks", EntityType::Chunk),
            ("images", EntityType::Image),
            ("extractions", EntityType::Extraction),
        ] {
            let ids = entity_ids_for_document(tx, table, document_id)?;
            for id in ids {
                tags::delete_for_entity(tx, &id, entity_type)?;
            }
        }
    } else {
        tracing::debug!("cascade: entity_tags table absent, skipping tag cleanup");
    }

    // 5. Embeddings, images, and cluster assignments — decrementing each
    //    referenced cluster's document_count before dropping the
    //    membership row.
    if table_exists(tx, "cluster_documents")? {
        let cluster_ids = {
            let mut stmt =
                tx.prepare("SELECT cluster_id FROM cluster_documents WHERE document_id = ?1")?;
            let rows = stmt.query_map(params![document_id], |r| r.get::<_, String>(0))?;
            rows.collect::<Result<Vec<_>, _>>()?
        };
        for cluster_id in &cluster_ids {
            clusters::decrement_document_count(tx, cluster_id)?;
        }
        tx.execute("DELETE FROM cluster_documents WHERE document_id = ?1", params![document_id])?;
    }

    tx.execute("DELETE FROM embeddings WHERE document_id = ?1", params![document_id])?;
    tx.execute("DELETE FROM images WHERE document_id = ?1", params![document_id])?;

    // 6. Optional table this engine's schema does not carry.
    if table_exists(tx, "comparisons")? {
        tx.execute("DELETE FROM comparisons WHERE document_id = ?1", params![document_id])?;
    } else {
        tracing::debug!(table = "comparisons", "cascade: optional table absent, stage skipped");
    }

    // 7. Optional table, keyed by this document's file hash rather than
    // its id (spec: "form-fills keyed by this document's file hash").
    if table_exists(tx, "form_fills")? {
        let file_hash: String = tx.query_row(
            "SELECT file_hash FROM documents WHERE id = ?1",
            params![document_id],
            |r| r.get(0),
        )?;
        tx.execute("DELETE FROM form_fills WHERE file_hash = ?1", params![file_hash])?;
    } else {
        tracing::debug!(table = "form_fills", "cascade: optional table absent, stage skipped");
    }

    // 8 & 9. Chunks and extractions must go before OCR results, which
    // they both reference by foreign key.
    tx.execute("DELETE FROM chunks WHERE document_id = ?1", params![document_id])?;
    tx.execute("DELETE FROM extractions WHERE document_id = ?1", params![document_id])?;

    // 10. OCR results.
    tx.execute("DELETE FROM ocr_results WHERE document_id = ?1", params![document_id])?;

    Ok(())
}

fn entity_ids_for_document(
    tx: &rusqlite::Transaction<'_>,
    table: &str,
    document_id: &str,
) -> Result<Vec<Id>, EngineError> {
    let mut stmt = tx.prepare(&format!("SELECT id FROM {table} WHERE document_id = ?1"))?;
    let rows = stmt.query_map(params![document_id], |r| r.get::<_, String>(0))?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

/// Lazily create the synthetic `ORPHANED_ROOT` provenance record used to
/// re-parent provenance still referenced by a surviving cluster.
fn get_or_create_orphaned_root(tx: &rusqlite::Transaction<'_>) -> Result<Id, EngineError> {
    let exists: bool = tx.query_row(
        "SELECT EXISTS(SELECT 1 FROM provenance WHERE id = ?1)",
        params![ORPHANED_ROOT_ID],
        |r| r.get(0),
    )?;
    if !exists {
        let content_hash = crate::hash::content_hash_str("orphaned-root");
        let chain_hash = compute_chain_hash(&content_hash, None);
        tx.execute(
            "INSERT INTO provenance (
                id, type, source_type, source_id, root_document_id, content_hash, input_hash,
                processor, processor_version, processing_params, duration_ms, quality_score,
                parent_id, parent_ids, chain_depth, chain_path, chain_hash, created_at
            ) VALUES (?1, ?2, NULL, NULL, NULL, ?3, NULL, NULL, NULL, '{}', NULL, NULL,
                      NULL, '[]', 0, '[]', ?4, ?5)",
            params![
                ORPHANED_ROOT_ID,
                ProvenanceType::OrphanedRoot.as_db_str(),
                content_hash,
                chain_hash,
                now_iso8601(),
            ],
        )?;
        tracing::info!("cascade: created synthetic ORPHANED_ROOT provenance record");
    }
    Ok(ORPHANED_ROOT_ID.to_string())
}

/// Step 13: delete the provenance tree rooted at this document in
/// descending chain-depth order, re-parenting onto `ORPHANED_ROOT` any
/// node still referenced by a surviving cluster.
fn delete_provenance_tree(
    tx: &rusqlite::Transaction<'_>,
    document_id: &str,
    document_provenance_id: &str,
) -> Result<(), EngineError> {
    let mut stmt = tx.prepare(
        "SELECT id FROM provenance WHERE root_document_id = ?1 OR id = ?2 ORDER BY chain_depth DESC",
    )?;
    let ids: Vec<Id> = stmt
        .query_map(params![document_id, document_provenance_id], |r| r.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    drop(stmt);

    let mut survivors = Vec::new();
    let mut deletable = Vec::new();
    for id in ids {
        let referenced_by_cluster: bool = tx.query_row(
            "SELECT EXISTS(SELECT 1 FROM clusters WHERE provenance_id = ?1)",
            params![id],
            |r| r.get(0),
        )?;
        if referenced_by_cluster {
            survivors.push(id);
        } else {
            deletable.push(id);
        }
    }

    // Pre-clear parent_id/source_id on everything we are about to delete,
    // breaking intra-batch self-references before any row actually goes
    // away.
    for id in &deletable {
        tx.execute(
            "UPDATE provenance SET parent_id = NULL, source_id = NULL WHERE id = ?1",
            params![id],
        )?;
    }

    if !survivors.is_empty() {
        let orphaned_root = get_or_create_orphaned_root(tx)?;
        for id in &survivors {
            tx.execute(
                "UPDATE provenance SET parent_id = ?1 WHERE id = ?2",
                params![orphaned_root, id],
            )?;
        }
        tracing::warn!(
            document_id,
            re_parented = ?survivors,
            "cascade: re-parented cluster-referenced provenance onto ORPHANED_ROOT"
        );
    }

    for id in &deletable {
        tx.execute("DELETE FROM provenance WHERE id = ?1", params![id])?;
    }

    Ok(())
}

/// Full 14-step cascade delete of a document and everything derived from
/// it. Runs in a single transaction: any failure leaves every
/// row intact.
pub fn delete_document(conn: &mut Connection, document_id: &str) -> Result<(), EngineError> {
    let document_provenance_id: String = conn.query_row(
        "SELECT provenance_id FROM documents WHERE id = ?1",
        params![document_id],
        |r| r.get(0),
    )?;

    let tx = conn.transaction()?;

    strip_derived_data(&tx, document_id)?;

    // 11. Optional table this engine's schema does not carry.
    if table_exists(&tx, "uploaded_files")? {
        tx.execute("DELETE FROM uploaded_files WHERE document_id = ?1", params![document_id])?;
    } else {
        tracing::debug!("cascade: uploaded_files table absent, stage skipped");
    }

    // 12. The document row itself.
    tx.execute("DELETE FROM documents WHERE id = ?1", params![document_id])?;

    // 13. Provenance tree.
    delete_provenance_tree(&tx, document_id, &document_provenance_id)?;

    // 14. FTS-metadata counters follow the base-table deletes above via
    // the schema's synchronous triggers; nothing further to do here.
    tracing::info!(document_id, "cascade: FTS indexes resynced via triggers");

    tx.commit()?;
    Ok(())
}

/// Steps 1-10 only: strip derived data but keep the document row and its
/// depth-0 provenance record, so a failed document can be retried without
/// losing its identity or its original root-of-chain. Also returns the
/// document's status to `pending`.
pub fn reset_document_for_retry(conn: &mut Connection, document_id: &str) -> Result<(), EngineError> {
    let tx = conn.transaction()?;
    strip_derived_data(&tx, document_id)?;
    tx.execute(
        "UPDATE documents SET status = 'pending', error_message = NULL, updated_at = ?2 WHERE id = ?1",
        params![document_id, now_iso8601()],
    )?;
    tx.commit()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::open_database;
    use crate::provenance::{insert_provenance, NewProvenance};
    use crate::storage::chunks::{self, NewChunk};
    use crate::storage::clusters::NewCluster;
    use crate::storage::documents::{self, NewDocument};
    use crate::storage::embeddings::{self, EmbeddingParentOwned, NewEmbedding};
    use crate::storage::ocr_results::{self, NewOcrResult};
    use crate::util::new_id;

    fn prov(conn: &Connection, kind: ProvenanceType, hash: &str, parent_id: Option<Id>, root: Option<Id>) -> crate::model::Provenance {
        insert_provenance(
            conn,
            NewProvenance {
                kind,
                source_type: None,
                source_id: None,
                root_document_id: root,
                content_hash: hash.to_string(),
                input_hash: None,
                processor: None,
                processor_version: None,
                processing_params: serde_json::json!({}),
                duration_ms: None,
                quality_score: None,
                parent_id,
            },
        )
        .unwrap()
    }

    struct Seeded {
        document_id: Id,
        chunk_id: Id,
        embedding_id: Id,
    }

    fn seed_document(conn: &mut Connection) -> Seeded {
        let doc_prov = prov(conn, ProvenanceType::Document, "sha256:doc", None, None);
        let doc = documents::insert(
            conn,
            &new_id(),
            NewDocument {
                file_path: "/tmp/a.pdf".into(),
                file_name: "a.pdf".into(),
                file_hash: "sha256:doc".into(),
                file_size: 1,
                file_type: "pdf".into(),
                title: None,
                author: None,
                subject: None,
                provenance_id: doc_prov.id.clone(),
            },
        )
        .unwrap();

        let ocr_prov = prov(conn, ProvenanceType::OcrResult, "sha256:ocr", Some(doc_prov.id.clone()), Some(doc.id.clone()));
        let ocr = ocr_results::insert(
            conn,
            &new_id(),
            NewOcrResult {
                document_id: doc.id.clone(),
                extracted_text: "hello world".into(),
                page_count: Some(1),
                quality_score: None,
                page_offsets: vec![0],
                processor: None,
                processor_version: None,
                request_id: None,
                duration_ms: None,
                cost: None,
                content_hash: "sha256:ocr".into(),
                provenance_id: ocr_prov.id.clone(),
            },
        )
        .unwrap();

        let chunk_prov = prov(conn, ProvenanceType::Chunk, "sha256:chunk", Some(ocr_prov.id.clone()), Some(doc.id.clone()));
        let chunk = chunks::insert(
            conn,
            &new_id(),
            NewChunk {
                ocr_result_id: ocr.id.clone(),
                document_id: doc.id.clone(),
                text: "hello world".into(),
                text_hash: "sha256:chunk".into(),
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
                provenance_id: chunk_prov.id.clone(),
            },
        )
        .unwrap();

        let embedding_prov = prov(conn, ProvenanceType::Embedding, "sha256:emb", Some(chunk_prov.id.clone()), Some(doc.id.clone()));
        let embedding = embeddings::insert(
            conn,
            &new_id(),
            NewEmbedding {
                parent: EmbeddingParentOwned::Chunk(chunk.id.clone()),
                document_id: doc.id.clone(),
                model_name: "text-embed-3".into(),
                model_version: None,
                task_type: None,
                inference_mode: None,
                source_metadata: serde_json::json!({}),
                content_hash: "sha256:emb".into(),
                provenance_id: embedding_prov.id.clone(),
                vector: vec![0.1, 0.2, 0.3],
            },
        )
        .unwrap();

        Seeded {
            document_id: doc.id,
            chunk_id: chunk.id,
            embedding_id: embedding.id,
        }
    }

    #[test]
    fn delete_document_removes_every_derived_row() {
        let dir = tempfile::tempdir().unwrap();
        let mut conn = open_database(&dir.path().join("t.db")).unwrap();
        let seeded = seed_document(&mut conn);

        delete_document(&mut conn, &seeded.document_id).unwrap();

        let doc_count: i64 = conn
            .query_row("SELECT COUNT(*) FROM documents WHERE id = ?1", params![seeded.document_id], |r| r.get(0))
            .unwrap();
        assert_eq!(doc_count, 0);

        let chunk_count: i64 = conn
            .query_row("SELECT COUNT(*) FROM chunks WHERE id = ?1", params![seeded.chunk_id], |r| r.get(0))
            .unwrap();
        assert_eq!(chunk_count, 0);

        let embedding_count: i64 = conn
            .query_row("SELECT COUNT(*) FROM embeddings WHERE id = ?1", params![seeded.embedding_id], |r| r.get(0))
            .unwrap();
        assert_eq!(embedding_count, 0);

        let ann_count: i64 = conn
            .query_row("SELECT COUNT(*) FROM ann_vectors WHERE embedding_id = ?1", params![seeded.embedding_id], |r| r.get(0))
            .unwrap();
        assert_eq!(ann_count, 0);

        let provenance_count: i64 = conn
            .query_row("SELECT COUNT(*) FROM provenance WHERE root_document_id = ?1", params![seeded.document_id], |r| r.get(0))
            .unwrap();
        assert_eq!(provenance_count, 0);
    }

    #[test]
    fn cluster_referenced_provenance_is_reparented_not_deleted() {
        let dir = tempfile::tempdir().unwrap();
        let mut conn = open_database(&dir.path().join("t.db")).unwrap();
        let seeded = seed_document(&mut conn);

        let clustering_prov = prov(
            &conn,
            ProvenanceType::Clustering,
            "sha256:cluster",
            None,
            Some(seeded.document_id.clone()),
        );
        let cluster = clusters::insert(
            &mut conn,
            &new_id(),
            NewCluster {
                name: "topic-a".into(),
                algorithm: "kmeans".into(),
                parameters: serde_json::json!({}),
                top_terms: vec![],
                content_hash: "sha256:cluster".into(),
                provenance_id: clustering_prov.id.clone(),
                document_ids: vec![],
            },
        )
        .unwrap();

        delete_document(&mut conn, &seeded.document_id).unwrap();

        let still_there = crate::provenance::get_provenance(&conn, &clustering_prov.id).unwrap();
        assert_eq!(still_there.parent_id.as_deref(), Some(ORPHANED_ROOT_ID));

        let fetched_cluster = clusters::get_by_id(&conn, &cluster.id).unwrap();
        assert_eq!(fetched_cluster.provenance_id, clustering_prov.id);
    }

    #[test]
    fn retry_reset_strips_derived_data_but_keeps_document() {
        let dir = tempfile::tempdir().unwrap();
        let mut conn = open_database(&dir.path().join("t.db")).unwrap();
        let seeded = seed_document(&mut conn);

        reset_document_for_retry(&mut conn, &seeded.document_id).unwrap();

        let doc = documents::get_by_id(&conn, &seeded.document_id).unwrap();
        assert_eq!(doc.id, seeded.document_id);
        assert_eq!(doc.status, crate::model::DocumentStatus::Pending);

        let chunk_count: i64 = conn
            .query_row("SELECT COUNT(*) FROM chunks WHERE document_id = ?1", params![seeded.document_id], |r| r.get(0))
            .unwrap();
        assert_eq!(chunk_count, 0);
    }
}

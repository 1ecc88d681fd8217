//! ANN vector blob encoding and k-nearest-neighbor search over the
//! `ann_vectors` table, using a little-endian f32 blob convention with
//! a defensive decode that rejects length mismatches and non-finite
//! values instead of panicking.

use rusqlite::{params, Connection};

use crate::error::{EngineError, ErrorCategory};
use crate::model::Id;

/// Encode a vector as a little-endian `f32` blob, four bytes per value.
pub fn encode_f32_blob(vector: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vector.len() * 4);
    for &value in vector {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

/// Decode a blob back into `dimension` `f32` values, rejecting a length
/// mismatch or a non-finite value rather than silently misreading a
/// corrupt or truncated blob.
pub fn decode_f32_blob(blob: &[u8], dimension: usize) -> Result<Vec<f32>, EngineError> {
    let expected_len = dimension
        .checked_mul(4)
        .ok_or_else(|| EngineError::internal("embedding dimension overflow"))?;
    if blob.len() != expected_len {
        return Err(EngineError::new(
            ErrorCategory::IntegrityVerificationFailed,
            format!(
                "ann_vectors blob has {} bytes, expected {expected_len} for dimension {dimension}",
                blob.len()
            ),
        ));
    }

    let mut out = Vec::with_capacity(dimension);
    for chunk in blob.chunks_exact(4) {
        let value = f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        if !value.is_finite() {
            return Err(EngineError::new(
                ErrorCategory::IntegrityVerificationFailed,
                "ann_vectors blob contains a non-finite value",
            ));
        }
        out.push(value);
    }
    Ok(out)
}

/// Cosine similarity in `[-1, 1]`, or `None` if either vector is empty,
/// the lengths differ, or either norm is (near) zero.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Option<f64> {
    if a.is_empty() || a.len() != b.len() {
        return None;
    }
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (&x, &y) in a.iter().zip(b.iter()) {
        let (x, y) = (f64::from(x), f64::from(y));
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom <= f64::EPSILON {
        return None;
    }
    Some(dot / denom)
}

/// One nearest-neighbor hit: the id of the entity the embedding derives
/// from (chunk/image/extraction — the same id BM25 reports as
/// `Bm25Hit::entity_id`, so the two rankings can be fused by primary
/// key), the backing embedding's own id, its parent document, and its
/// cosine-similarity score against the query vector.
#[derive(Debug, Clone)]
pub struct VectorHit {
    pub entity_id: Id,
    pub embedding_id: Id,
    pub document_id: Id,
    pub score: f64,
}

/// Whether this embedding row is a VLM-type embedding — `chunk_id IS
/// NULL` means it is attached to an image, not a text chunk.
fn is_vlm_embedding(conn: &Connection, embedding_id: &str) -> Result<bool, EngineError> {
    let chunk_id: Option<String> = conn.query_row(
        "SELECT chunk_id FROM embeddings WHERE id = ?1",
        params![embedding_id],
        |r| r.get(0),
    )?;
    Ok(chunk_id.is_none())
}

/// A page-number range filter applied to VLM-type vector hits. `None` on
/// either bound means unbounded on that side.
#[derive(Debug, Clone, Copy, Default)]
pub struct PageRangeFilter {
    pub min_page: Option<i64>,
    pub max_page: Option<i64>,
}

impl PageRangeFilter {
    fn is_unset(&self) -> bool {
        self.min_page.is_none() && self.max_page.is_none()
    }

    /// Whether `page_number` falls inside the filter. A `None` page number
    /// is dropped whenever the filter is actually constrained.
    fn admits(&self, page_number: Option<i64>) -> bool {
        if self.is_unset() {
            return true;
        }
        let Some(page) = page_number else { return false };
        if let Some(min) = self.min_page {
            if page < min {
                return false;
            }
        }
        if let Some(max) = self.max_page {
            if page > max {
                return false;
            }
        }
        true
    }
}

/// Top-k nearest neighbors of `query_vector` across every embedding row
/// in `ann_vectors`, optionally restricted to `document_ids`. VLM-type
/// embeddings (image-backed) are filtered by `page_range`; chunk/
/// extraction embeddings ignore it.
pub fn knn_search(
    conn: &Connection,
    query_vector: &[f32],
    limit: usize,
    document_ids: Option<&[Id]>,
    page_range: PageRangeFilter,
) -> Result<Vec<VectorHit>, EngineError> {
    let dimension = query_vector.len() as i64;

    let mut stmt = conn.prepare(
        "SELECT av.embedding_id, av.document_id, av.vector,
                e.chunk_id, e.image_id, e.extraction_id, i.page_number
         FROM ann_vectors av
         JOIN embeddings e ON e.id = av.embedding_id
         LEFT JOIN images i ON i.id = e.image_id
         WHERE av.dimension = ?1",
    )?;

    let rows = stmt.query_map(params![dimension], |row| {
        let embedding_id: String = row.get(0)?;
        let document_id: String = row.get(1)?;
        let blob: Vec<u8> = row.get(2)?;
        let chunk_id: Option<String> = row.get(3)?;
        let image_id: Option<String> = row.get(4)?;
        let extraction_id: Option<String> = row.get(5)?;
        let page_number: Option<i64> = row.get(6)?;
        Ok((embedding_id, document_id, blob, chunk_id, image_id, extraction_id, page_number))
    })?;

    let mut hits = Vec::new();
    for row in rows {
        let (embedding_id, document_id, blob, chunk_id, image_id, extraction_id, page_number) = row?;

        if let Some(allowed) = document_ids {
            if !allowed.iter().any(|d| d == &document_id) {
                continue;
            }
        }

        if chunk_id.is_none() && !page_range.admits(page_number) {
            continue;
        }

        // Exactly one of the three is non-null (schema CHECK constraint);
        // that one is the entity id BM25 reports for the same row.
        let entity_id = chunk_id
            .or(image_id)
            .or(extraction_id)
            .ok_or_else(|| EngineError::internal("embedding row has no non-null parent reference"))?;

        let candidate = decode_f32_blob(&blob, query_vector.len())?;
        let Some(score) = cosine_similarity(query_vector, &candidate) else {
            continue;
        };

        hits.push(VectorHit {
            entity_id,
            embedding_id,
            document_id,
            score,
        });
    }

    hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    hits.truncate(limit);
    Ok(hits)
}

/// `true` if `embedding_id` backs a VLM (image) embedding rather than a
/// chunk or extraction embedding. Exposed for callers assembling result
/// shapes that need to know which entity table to join against.
pub fn embedding_is_vlm(conn: &Connection, embedding_id: &str) -> Result<bool, EngineError> {
    is_vlm_embedding(conn, embedding_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn f32_blob_round_trips() {
        let v = vec![0.1_f32, -0.2, 0.3, 100.0];
        let blob = encode_f32_blob(&v);
        assert_eq!(blob.len(), 16);
        let decoded = decode_f32_blob(&blob, 4).unwrap();
        assert_eq!(decoded, v);
    }

    #[test]
    fn decode_rejects_length_mismatch() {
        let blob = encode_f32_blob(&[1.0, 2.0]);
        let err = decode_f32_blob(&blob, 3).unwrap_err();
        assert_eq!(err.category, ErrorCategory::IntegrityVerificationFailed);
    }

    #[test]
    fn decode_rejects_non_finite_values() {
        let blob = encode_f32_blob(&[f32::NAN]);
        let err = decode_f32_blob(&blob, 1).unwrap_err();
        assert_eq!(err.category, ErrorCategory::IntegrityVerificationFailed);
    }

    #[test]
    fn cosine_similarity_of_identical_vectors_is_one() {
        let v = vec![1.0_f32, 2.0, 3.0];
        let sim = cosine_similarity(&v, &v).unwrap();
        assert!((sim - 1.0).abs() < 1e-9);
    }

    #[test]
    fn cosine_similarity_of_orthogonal_vectors_is_zero() {
        let a = vec![1.0_f32, 0.0];
        let b = vec![0.0_f32, 1.0];
        let sim = cosine_similarity(&a, &b).unwrap();
        assert!(sim.abs() < 1e-9);
    }

    #[test]
    fn cosine_similarity_rejects_mismatched_lengths() {
        assert!(cosine_similarity(&[1.0], &[1.0, 2.0]).is_none());
    }

    #[test]
    fn page_range_filter_drops_null_and_out_of_range_pages() {
        let filter = PageRangeFilter { min_page: Some(2), max_page: Some(4) };
        assert!(!filter.admits(None));
        assert!(!filter.admits(Some(1)));
        assert!(filter.admits(Some(2)));
        assert!(filter.admits(Some(4)));
        assert!(!filter.admits(Some(5)));
    }

    #[test]
    fn unset_page_range_filter_admits_everything_including_null() {
        let filter = PageRangeFilter::default();
        assert!(filter.admits(None));
        assert!(filter.admits(Some(1)));
    }

    #[test]
    fn knn_search_reports_the_chunk_and_image_id_not_the_embedding_id() {
        use crate::db::open_database;
        use crate::model::ProvenanceType;
        use crate::provenance::{insert_provenance, NewProvenance};
        use crate::storage::chunks::{self, NewChunk};
        use crate::storage::documents::{self, NewDocument};
        use crate::storage::embeddings::{self, EmbeddingParentOwned, NewEmbedding};
        use crate::storage::images::{self, NewImage};
        use crate::storage::ocr_results::{self, NewOcrResult};
        use crate::util::new_id;

        let dir = tempfile::tempdir().unwrap();
        let mut conn = open_database(&dir.path().join("t.db")).unwrap();

        fn prov(
            conn: &Connection,
            kind: ProvenanceType,
            hash: &str,
            parent_id: Option<Id>,
            root: Option<Id>,
        ) -> crate::model::Provenance {
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

        let doc_prov = prov(&conn, ProvenanceType::Document, "sha256:doc", None, None);
        let doc = documents::insert(
            &conn,
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

        let ocr_prov = prov(&conn, ProvenanceType::OcrResult, "sha256:ocr", Some(doc_prov.id.clone()), Some(doc.id.clone()));
        let ocr = ocr_results::insert(
            &conn,
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

        let chunk_prov = prov(&conn, ProvenanceType::Chunk, "sha256:chunk", Some(ocr_prov.id.clone()), Some(doc.id.clone()));
        let chunk = chunks::insert(
            &conn,
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

        let image_prov = prov(&conn, ProvenanceType::Image, "sha256:image", Some(ocr_prov.id.clone()), Some(doc.id.clone()));
        let image = images::insert(
            &conn,
            &new_id(),
            NewImage {
                ocr_result_id: ocr.id.clone(),
                document_id: doc.id.clone(),
                page_number: Some(2),
                bbox: vec![0.0, 0.0, 1.0, 1.0],
                image_index: 0,
                format: Some("png".into()),
                width: Some(100),
                height: Some(100),
                extracted_file_path: None,
                file_size: None,
                content_hash: "sha256:image".into(),
                block_type: None,
                is_header_footer: false,
                provenance_id: image_prov.id.clone(),
            },
        )
        .unwrap();

        let chunk_embedding_prov = prov(&conn, ProvenanceType::Embedding, "sha256:emb-chunk", Some(chunk_prov.id.clone()), Some(doc.id.clone()));
        let chunk_embedding = embeddings::insert(
            &mut conn,
            &new_id(),
            NewEmbedding {
                parent: EmbeddingParentOwned::Chunk(chunk.id.clone()),
                document_id: doc.id.clone(),
                model_name: "text-embed-3".into(),
                model_version: None,
                task_type: None,
                inference_mode: None,
                source_metadata: serde_json::json!({}),
                content_hash: "sha256:emb-chunk".into(),
                provenance_id: chunk_embedding_prov.id.clone(),
                vector: vec![1.0, 0.0],
            },
        )
        .unwrap();

        let image_embedding_prov = prov(&conn, ProvenanceType::VlmDescription, "sha256:emb-image", Some(image_prov.id.clone()), Some(doc.id.clone()));
        let image_embedding = embeddings::insert(
            &mut conn,
            &new_id(),
            NewEmbedding {
                parent: EmbeddingParentOwned::Image(image.id.clone()),
                document_id: doc.id.clone(),
                model_name: "text-embed-3".into(),
                model_version: None,
                task_type: None,
                inference_mode: None,
                source_metadata: serde_json::json!({}),
                content_hash: "sha256:emb-image".into(),
                provenance_id: image_embedding_prov.id.clone(),
                vector: vec![0.0, 1.0],
            },
        )
        .unwrap();

        // The embedding ids are real UUIDs distinct from the chunk/image
        // ids; a hit's entity_id must be the latter, not the former, or
        // it can never line up with the matching `Bm25Hit::entity_id`.
        assert_ne!(chunk_embedding.id, chunk.id);
        assert_ne!(image_embedding.id, image.id);

        let hits = knn_search(&conn, &[1.0, 0.0], 10, None, PageRangeFilter::default()).unwrap();
        let chunk_hit = hits.iter().find(|h| h.embedding_id == chunk_embedding.id).unwrap();
        assert_eq!(chunk_hit.entity_id, chunk.id);

        let image_hit = hits.iter().find(|h| h.embedding_id == image_embedding.id).unwrap();
        assert_eq!(image_hit.entity_id, image.id);

        // The page-range filter applies to VLM (image-backed) hits only.
        let filtered = knn_search(
            &conn,
            &[1.0, 0.0],
            10,
            None,
            PageRangeFilter { min_page: Some(5), max_page: Some(10) },
        )
        .unwrap();
        assert!(filtered.iter().all(|h| h.entity_id != image.id));
        assert!(filtered.iter().any(|h| h.entity_id == chunk.id));
    }
}

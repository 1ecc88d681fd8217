//! Provenance engine: chain insert, ancestor traversal, and content/chain
//! hash verification.
//!
//! The chain is a DAG of [`Provenance`] nodes. Every non-root node's
//! `chain_hash` binds its own content hash to its parent's `chain_hash`,
//! forming a tamper-evident backbone from any node back to its root
//! `DOCUMENT` node (spec invariant 5).

use std::path::Path;

use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;

use crate::error::{EngineError, ErrorCategory};
use crate::hash;
use crate::model::{Id, Provenance, ProvenanceType};
use crate::util::{new_id, now_iso8601};

/// Compute `SHA-256(content_hash || '|' || parent_chain_hash)`. Roots pass
/// `None`, which is treated as the empty string.
pub fn compute_chain_hash(content_hash: &str, parent_chain_hash: Option<&str>) -> String {
    let joined = format!("{content_hash}|{}", parent_chain_hash.unwrap_or(""));
    hash::content_hash_str(&joined)
}

/// Input to [`insert_provenance`]. `parent_id` is `None` for root
/// (`DOCUMENT`) nodes.
#[derive(Debug, Clone)]
pub struct NewProvenance {
    pub kind: ProvenanceType,
    pub source_type: Option<String>,
    pub source_id: Option<Id>,
    pub root_document_id: Option<Id>,
    pub content_hash: String,
    pub input_hash: Option<String>,
    pub processor: Option<String>,
    pub processor_version: Option<String>,
    pub processing_params: Value,
    pub duration_ms: Option<i64>,
    pub quality_score: Option<f64>,
    pub parent_id: Option<Id>,
}

/// Insert a provenance record, deriving `chain_depth`, `parent_ids`,
/// `chain_path`, and `chain_hash` from the parent.
pub fn insert_provenance(conn: &Connection, new: NewProvenance) -> Result<Provenance, EngineError> {
    let parent = match &new.parent_id {
        Some(pid) => Some(get_provenance(conn, pid)?),
        None => None,
    };

    let chain_depth = parent.as_ref().map_or(0, |p| p.chain_depth + 1);

    let mut parent_ids = parent.as_ref().map(|p| p.parent_ids.clone()).unwrap_or_default();
    if let Some(pid) = &new.parent_id {
        parent_ids.push(pid.clone());
    }

    let mut chain_path = parent.as_ref().map(|p| p.chain_path.clone()).unwrap_or_default();
    if let Some(p) = &parent {
        chain_path.push(p.kind);
    }

    let chain_hash = compute_chain_hash(&new.content_hash, parent.as_ref().map(|p| p.chain_hash.as_str()));

    let record = Provenance {
        id: new_id(),
        kind: new.kind,
        source_type: new.source_type,
        source_id: new.source_id,
        root_document_id: new.root_document_id,
        content_hash: new.content_hash,
        input_hash: new.input_hash,
        processor: new.processor,
        processor_version: new.processor_version,
        processing_params: new.processing_params,
        duration_ms: new.duration_ms,
        quality_score: new.quality_score,
        parent_id: new.parent_id,
        parent_ids,
        chain_depth,
        chain_path,
        chain_hash,
        created_at: now_iso8601(),
    };

    conn.execute(
        "INSERT INTO provenance (
            id, type, source_type, source_id, root_document_id, content_hash, input_hash,
            processor, processor_version, processing_params, duration_ms, quality_score,
            parent_id, parent_ids, chain_depth, chain_path, chain_hash, created_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)",
        params![
            record.id,
            record.kind.as_db_str(),
            record.source_type,
            record.source_id,
            record.root_document_id,
            record.content_hash,
            record.input_hash,
            record.processor,
            record.processor_version,
            serde_json::to_string(&record.processing_params)?,
            record.duration_ms,
            record.quality_score,
            record.parent_id,
            serde_json::to_string(&record.parent_ids)?,
            record.chain_depth,
            serde_json::to_string(&chain_path_as_db(&record.chain_path))?,
            record.chain_hash,
            record.created_at,
        ],
    )?;

    Ok(record)
}

fn chain_path_as_db(path: &[ProvenanceType]) -> Vec<&'static str> {
    path.iter().map(|t| t.as_db_str()).collect()
}

/// Fetch a single provenance record by id.
pub fn get_provenance(conn: &Connection, id: &str) -> Result<Provenance, EngineError> {
    conn.query_row(
        "SELECT id, type, source_type, source_id, root_document_id, content_hash, input_hash,
                processor, processor_version, processing_params, duration_ms, quality_score,
                parent_id, parent_ids, chain_depth, chain_path, chain_hash, created_at
         FROM provenance WHERE id = ?1",
        params![id],
        decode_provenance_row,
    )
    .optional()?
    .ok_or_else(|| {
        EngineError::new(
            ErrorCategory::ProvenanceNotFound,
            format!("no provenance record with id '{id}'"),
        )
    })
}

fn decode_provenance_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Provenance> {
    let kind_raw: String = row.get(1)?;
    let kind = ProvenanceType::from_db_str(&kind_raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            1,
            rusqlite::types::Type::Text,
            format!("unknown provenance type '{kind_raw}'").into(),
        )
    })?;

    let params_raw: String = row.get(9)?;
    let processing_params: Value = crate::model::decode_json_column(&params_raw, "processing_params");

    let parent_ids_raw: String = row.get(13)?;
    let parent_ids: Vec<Id> = crate::model::decode_json_column(&parent_ids_raw, "parent_ids");

    let chain_path_raw: String = row.get(15)?;
    let chain_path_strs: Vec<String> = crate::model::decode_json_column(&chain_path_raw, "chain_path");
    let chain_path = chain_path_strs
        .iter()
        .filter_map(|s| ProvenanceType::from_db_str(s))
        .collect();

    Ok(Provenance {
        id: row.get(0)?,
        kind,
        source_type: row.get(2)?,
        source_id: row.get(3)?,
        root_document_id: row.get(4)?,
        content_hash: row.get(5)?,
        input_hash: row.get(6)?,
        processor: row.get(7)?,
        processor_version: row.get(8)?,
        processing_params,
        duration_ms: row.get(10)?,
        quality_score: row.get(11)?,
        parent_id: row.get(12)?,
        parent_ids,
        chain_depth: row.get(14)?,
        chain_path,
        chain_hash: row.get(16)?,
        created_at: row.get(17)?,
    })
}

/// A provenance record plus its ordered ancestors, root last.
#[derive(Debug, Clone)]
pub struct ProvenanceChain {
    pub current: Provenance,
    pub ancestors: Vec<Provenance>,
}

/// Walk `parent_id` links from `id` up to the root, returning the starting
/// record plus the ordered ancestor chain (root last).
pub fn get_chain(conn: &Connection, id: &str) -> Result<ProvenanceChain, EngineError> {
    let current = get_provenance(conn, id)?;
    let mut ancestors = Vec::new();
    let mut cursor = current.parent_id.clone();
    while let Some(pid) = cursor {
        let parent = get_provenance(conn, &pid)?;
        cursor = parent.parent_id.clone();
        ancestors.push(parent);
    }
    Ok(ProvenanceChain { current, ancestors })
}

/// Result of recomputing a provenance node's content hash against the
/// entity it describes.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ContentHashVerification {
    pub verified: bool,
    pub expected: String,
    pub computed: String,
    pub entity_id: Id,
}

/// Recompute the content hash of the entity a provenance record describes
/// and compare it to the stored value.
pub fn verify_content_hash(conn: &Connection, provenance_id: &str) -> Result<ContentHashVerification, EngineError> {
    let prov = get_provenance(conn, provenance_id)?;
    let (entity_id, computed) = recompute_entity_hash(conn, &prov)?;
    Ok(ContentHashVerification {
        verified: computed == prov.content_hash,
        expected: prov.content_hash,
        computed,
        entity_id,
    })
}

fn entity_not_found(kind: ProvenanceType, provenance_id: &str) -> EngineError {
    EngineError::new(
        ErrorCategory::IntegrityVerificationFailed,
        format!("no {kind:?} entity references provenance '{provenance_id}'"),
    )
}

fn recompute_entity_hash(conn: &Connection, prov: &Provenance) -> Result<(Id, String), EngineError> {
    match prov.kind {
        ProvenanceType::Document => {
            let (id, file_path): (Id, String) = conn
                .query_row(
                    "SELECT id, file_path FROM documents WHERE provenance_id = ?1",
                    params![prov.id],
                    |r| Ok((r.get(0)?, r.get(1)?)),
                )
                .optional()?
                .ok_or_else(|| entity_not_found(prov.kind, &prov.id))?;
            Ok((id, hash::hash_file(Path::new(&file_path))?))
        }
        ProvenanceType::OcrResult => {
            let (id, text): (Id, String) = conn
                .query_row(
                    "SELECT id, extracted_text FROM ocr_results WHERE provenance_id = ?1",
                    params![prov.id],
                    |r| Ok((r.get(0)?, r.get(1)?)),
                )
                .optional()?
                .ok_or_else(|| entity_not_found(prov.kind, &prov.id))?;
            Ok((id, hash::content_hash_str(&text)))
        }
        ProvenanceType::Chunk => {
            let (id, text): (Id, String) = conn
                .query_row(
                    "SELECT id, text FROM chunks WHERE provenance_id = ?1",
                    params![prov.id],
                    |r| Ok((r.get(0)?, r.get(1)?)),
                )
                .optional()?
                .ok_or_else(|| entity_not_found(prov.kind, &prov.id))?;
            Ok((id, hash::content_hash_str(&text)))
        }
        ProvenanceType::Image => {
            let (id, path): (Id, Option<String>) = conn
                .query_row(
                    "SELECT id, extracted_file_path FROM images WHERE provenance_id = ?1",
                    params![prov.id],
                    |r| Ok((r.get(0)?, r.get(1)?)),
                )
                .optional()?
                .ok_or_else(|| entity_not_found(prov.kind, &prov.id))?;
            let path = path.ok_or_else(|| {
                EngineError::new(
                    ErrorCategory::IntegrityVerificationFailed,
                    format!("image '{id}' has no extracted file path to hash"),
                )
            })?;
            Ok((id, hash::hash_file(Path::new(&path))?))
        }
        ProvenanceType::VlmDescription => {
            let (id, description): (Id, Option<String>) = conn
                .query_row(
                    "SELECT id, vlm_description FROM images WHERE vlm_provenance_id = ?1",
                    params![prov.id],
                    |r| Ok((r.get(0)?, r.get(1)?)),
                )
                .optional()?
                .ok_or_else(|| entity_not_found(prov.kind, &prov.id))?;
            Ok((id, hash::content_hash_str(&description.unwrap_or_default())))
        }
        ProvenanceType::Embedding => {
            let (id, chunk_id, image_id, extraction_id): (Id, Option<Id>, Option<Id>, Option<Id>) = conn
                .query_row(
                    "SELECT id, chunk_id, image_id, extraction_id FROM embeddings WHERE provenance_id = ?1",
                    params![prov.id],
                    |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
                )
                .optional()?
                .ok_or_else(|| entity_not_found(prov.kind, &prov.id))?;

            let source_text = if let Some(cid) = chunk_id {
                conn.query_row("SELECT text FROM chunks WHERE id = ?1", params![cid], |r| r.get::<_, String>(0))?
            } else if let Some(iid) = image_id {
                conn.query_row(
                    "SELECT COALESCE(vlm_description, '') FROM images WHERE id = ?1",
                    params![iid],
                    |r| r.get::<_, String>(0),
                )?
            } else if let Some(eid) = extraction_id {
                conn.query_row(
                    "SELECT extraction_json FROM extractions WHERE id = ?1",
                    params![eid],
                    |r| r.get::<_, String>(0),
                )?
            } else {
                return Err(EngineError::new(
                    ErrorCategory::IntegrityVerificationFailed,
                    format!("embedding '{id}' has no non-null parent reference"),
                ));
            };
            Ok((id, hash::content_hash_str(&source_text)))
        }
        ProvenanceType::Extraction => {
            let (id, json): (Id, String) = conn
                .query_row(
                    "SELECT id, extraction_json FROM extractions WHERE provenance_id = ?1",
                    params![prov.id],
                    |r| Ok((r.get(0)?, r.get(1)?)),
                )
                .optional()?
                .ok_or_else(|| entity_not_found(prov.kind, &prov.id))?;
            Ok((id, hash::content_hash_str(&json)))
        }
        ProvenanceType::Clustering => {
            let (id, parameters, top_terms): (Id, String, String) = conn
                .query_row(
                    "SELECT id, parameters, top_terms FROM clusters WHERE provenance_id = ?1",
                    params![prov.id],
                    |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
                )
                .optional()?
                .ok_or_else(|| entity_not_found(prov.kind, &prov.id))?;
            Ok((id, hash::content_hash_str(&format!("{parameters}|{top_terms}"))))
        }
        ProvenanceType::OrphanedRoot => Err(EngineError::new(
            ErrorCategory::ValidationError,
            "the synthetic ORPHANED_ROOT provenance record has no entity to verify",
        )),
    }
}

/// Per-link report from [`verify_chain`].
#[derive(Debug, Clone, serde::Serialize)]
pub struct ChainLinkReport {
    pub provenance_id: Id,
    pub expected_chain_hash: String,
    pub computed_chain_hash: String,
    pub ok: bool,
}

/// Full chain-verification report: one entry per node from the starting
/// record to the root, plus the id of the first broken link (if any).
#[derive(Debug, Clone, serde::Serialize)]
pub struct ChainVerification {
    pub links: Vec<ChainLinkReport>,
    pub broken: bool,
    pub first_broken: Option<Id>,
}

/// Walk from `start_id` to the root, recomputing each node's `chain_hash`
/// from its own `content_hash` and its parent's `chain_hash` and reporting
/// per-node whether it matches the stored value.
pub fn verify_chain(conn: &Connection, start_id: &str) -> Result<ChainVerification, EngineError> {
    let chain = get_chain(conn, start_id)?;
    let mut nodes = Vec::with_capacity(chain.ancestors.len() + 1);
    nodes.push(chain.current);
    nodes.extend(chain.ancestors);

    let mut links = Vec::with_capacity(nodes.len());
    let mut first_broken = None;

    for i in 0..nodes.len() {
        let parent_chain_hash = nodes.get(i + 1).map(|p| p.chain_hash.as_str());
        let computed = compute_chain_hash(&nodes[i].content_hash, parent_chain_hash);
        let ok = computed == nodes[i].chain_hash;
        if !ok && first_broken.is_none() {
            first_broken = Some(nodes[i].id.clone());
        }
        links.push(ChainLinkReport {
            provenance_id: nodes[i].id.clone(),
            expected_chain_hash: nodes[i].chain_hash.clone(),
            computed_chain_hash: computed,
            ok,
        });
    }

    Ok(ChainVerification {
        broken: first_broken.is_some(),
        first_broken,
        links,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::open_database;

    fn root_new(content_hash: &str) -> NewProvenance {
        NewProvenance {
            kind: ProvenanceType::Document,
            source_type: None,
            source_id: None,
            root_document_id: None,
            content_hash: content_hash.to_string(),
            input_hash: None,
            processor: None,
            processor_version: None,
            processing_params: Value::Object(Default::default()),
            duration_ms: None,
            quality_score: None,
            parent_id: None,
        }
    }

    #[test]
    fn root_has_depth_zero_and_no_parent() {
        let dir = tempfile::tempdir().unwrap();
        let conn = open_database(&dir.path().join("t.db")).unwrap();

        let root = insert_provenance(&conn, root_new("sha256:aaa")).unwrap();
        assert_eq!(root.chain_depth, 0);
        assert!(root.parent_id.is_none());
        assert!(root.parent_ids.is_empty());
        assert_eq!(root.chain_hash, compute_chain_hash("sha256:aaa", None));
    }

    #[test]
    fn child_chain_hash_matches_spec_example() {
        let dir = tempfile::tempdir().unwrap();
        let conn = open_database(&dir.path().join("t.db")).unwrap();

        let parent_content_hash = "sha256:aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
        let root = insert_provenance(&conn, root_new(parent_content_hash)).unwrap();

        let child_content_hash = hash::content_hash_str("hello");
        let child = insert_provenance(
            &conn,
            NewProvenance {
                kind: ProvenanceType::OcrResult,
                source_type: Some("DOCUMENT".into()),
                source_id: Some(root.id.clone()),
                root_document_id: Some(root.id.clone()),
                content_hash: child_content_hash.clone(),
                input_hash: None,
                processor: None,
                processor_version: None,
                processing_params: Value::Object(Default::default()),
                duration_ms: None,
                quality_score: None,
                parent_id: Some(root.id.clone()),
            },
        )
        .unwrap();

        assert_eq!(child.chain_depth, 1);
        assert_eq!(child.parent_ids, vec![root.id.clone()]);
        assert_eq!(child.chain_path, vec![ProvenanceType::Document]);
        let expected = hash::content_hash_str(&format!("{child_content_hash}|{}", root.chain_hash));
        assert_eq!(child.chain_hash, expected);
    }

    #[test]
    fn get_chain_returns_ancestors_root_last() {
        let dir = tempfile::tempdir().unwrap();
        let conn = open_database(&dir.path().join("t.db")).unwrap();

        let root = insert_provenance(&conn, root_new("sha256:root")).unwrap();
        let mid = insert_provenance(
            &conn,
            NewProvenance {
                parent_id: Some(root.id.clone()),
                kind: ProvenanceType::OcrResult,
                ..root_new("sha256:mid")
            },
        )
        .unwrap();
        let leaf = insert_provenance(
            &conn,
            NewProvenance {
                parent_id: Some(mid.id.clone()),
                kind: ProvenanceType::Chunk,
                ..root_new("sha256:leaf")
            },
        )
        .unwrap();

        let chain = get_chain(&conn, &leaf.id).unwrap();
        assert_eq!(chain.current.id, leaf.id);
        assert_eq!(chain.ancestors.len(), 2);
        assert_eq!(chain.ancestors[0].id, mid.id);
        assert_eq!(chain.ancestors[1].id, root.id);
    }

    #[test]
    fn verify_chain_detects_a_tampered_link() {
        let dir = tempfile::tempdir().unwrap();
        let conn = open_database(&dir.path().join("t.db")).unwrap();

        let root = insert_provenance(&conn, root_new("sha256:root")).unwrap();
        let mid = insert_provenance(
            &conn,
            NewProvenance {
                parent_id: Some(root.id.clone()),
                kind: ProvenanceType::OcrResult,
                ..root_new("sha256:mid")
            },
        )
        .unwrap();

        let report = verify_chain(&conn, &mid.id).unwrap();
        assert!(!report.broken);

        conn.execute(
            "UPDATE provenance SET chain_hash = 'sha256:corrupt' WHERE id = ?1",
            params![mid.id],
        )
        .unwrap();

        let report = verify_chain(&conn, &mid.id).unwrap();
        assert!(report.broken);
        assert_eq!(report.first_broken, Some(mid.id));
    }

    #[test]
    fn verify_content_hash_detects_document_tamper() {
        let dir = tempfile::tempdir().unwrap();
        let conn = open_database(&dir.path().join("t.db")).unwrap();

        let file_path = dir.path().join("a.pdf");
        std::fs::write(&file_path, b"test").unwrap();
        let file_hash = hash::hash_file(&file_path).unwrap();

        let prov = insert_provenance(&conn, root_new(&file_hash)).unwrap();
        conn.execute(
            "INSERT INTO documents (
                id, file_path, file_name, file_hash, file_size, file_type, status,
                provenance_id, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, 4, 'pdf', 'pending', ?5, ?6, ?6)",
            params![
                new_id(),
                file_path.to_string_lossy(),
                "a.pdf",
                file_hash,
                prov.id,
                now_iso8601(),
            ],
        )
        .unwrap();

        let report = verify_content_hash(&conn, &prov.id).unwrap();
        assert!(report.verified);

        std::fs::write(&file_path, b"tampered").unwrap();
        let report = verify_content_hash(&conn, &prov.id).unwrap();
        assert!(!report.verified);
    }
}

//! The v1 schema DDL and a structural verifier.
//!
//! The schema version lives in a one-row `schema_version` table rather
//! than `PRAGMA user_version`, because the migration runner needs to
//! read and update it from inside the same transaction as the DDL it
//! guards, and `PRAGMA` statements cannot run inside a prepared
//! transaction the way plain DML can on every `rusqlite` build.

use std::collections::BTreeMap;

use rusqlite::Connection;

use super::migrations::MigrationError;

/// Current schema version this build of the engine expects. Bump this
/// and append a migration step when the DDL changes.
pub const CURRENT_SCHEMA_VERSION: i64 = 1;

/// Sentinel provenance id used to re-parent orphaned provenance records
/// (spec: cascade delete step 13). Created lazily on first use.
pub const ORPHANED_ROOT_ID: &str = "00000000-0000-0000-0000-000000000000";

/// Tables the engine expects to exist at the current schema version.
/// Used by [`verify`] to detect a schema that is present but incomplete
/// (e.g. a crashed migration).
const EXPECTED_TABLES: &[&str] = &[
    "schema_version",
    "provenance",
    "documents",
    "ocr_results",
    "chunks",
    "chunks_fts",
    "images",
    "extractions",
    "extractions_fts",
    "vlm_fts",
    "document_metadata_fts",
    "embeddings",
    "ann_vectors",
    "clusters",
    "cluster_documents",
    "tags",
    "entity_tags",
];

/// Indexes the engine expects in addition to the implicit ones SQLite
/// creates for `PRIMARY KEY`/`UNIQUE` columns.
const EXPECTED_INDEXES: &[&str] = &[
    "idx_documents_status",
    "idx_documents_file_type",
    "idx_documents_created_at",
    "idx_ocr_results_document_id",
    "idx_chunks_ocr_result_id",
    "idx_chunks_document_id",
    "idx_images_ocr_result_id",
    "idx_images_document_id",
    "idx_images_vlm_provenance_id",
    "idx_extractions_ocr_result_id",
    "idx_embeddings_chunk_id",
    "idx_embeddings_image_id",
    "idx_embeddings_extraction_id",
    "idx_embeddings_document_id",
    "idx_ann_vectors_document_id",
    "idx_provenance_parent_id",
    "idx_provenance_root_document_id",
    "idx_cluster_documents_cluster_id",
    "idx_entity_tags_entity",
];

/// Execute the full v1 schema DDL on a freshly-created database file.
/// Idempotent via `IF NOT EXISTS` everywhere, so re-running it against
/// an already-current database is a no-op.
pub(super) fn apply_v1(conn: &Connection) -> Result<(), MigrationError> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER NOT NULL
        );

        -- Provenance DAG. `type` is the sealed ProvenanceType sum; ORPHANED_ROOT
        -- is the synthetic tombstone used to re-parent orphaned chains.
        CREATE TABLE IF NOT EXISTS provenance (
            id TEXT PRIMARY KEY,
            type TEXT NOT NULL CHECK (type IN (
                'DOCUMENT', 'OCR_RESULT', 'CHUNK', 'IMAGE', 'VLM_DESCRIPTION',
                'EMBEDDING', 'EXTRACTION', 'CLUSTERING', 'ORPHANED_ROOT'
            )),
            source_type TEXT,
            source_id TEXT,
            root_document_id TEXT,
            content_hash TEXT NOT NULL,
            input_hash TEXT,
            processor TEXT,
            processor_version TEXT,
            processing_params TEXT NOT NULL DEFAULT '{}',
            duration_ms INTEGER,
            quality_score REAL,
            parent_id TEXT REFERENCES provenance(id),
            parent_ids TEXT NOT NULL DEFAULT '[]',
            chain_depth INTEGER NOT NULL DEFAULT 0,
            chain_path TEXT NOT NULL DEFAULT '[]',
            chain_hash TEXT NOT NULL,
            created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_provenance_parent_id ON provenance(parent_id);
        CREATE INDEX IF NOT EXISTS idx_provenance_root_document_id ON provenance(root_document_id);

        CREATE TABLE IF NOT EXISTS documents (
            id TEXT PRIMARY KEY,
            file_path TEXT NOT NULL,
            file_name TEXT NOT NULL,
            file_hash TEXT NOT NULL,
            file_size INTEGER NOT NULL,
            file_type TEXT NOT NULL,
            status TEXT NOT NULL CHECK (status IN ('pending', 'processing', 'complete', 'failed')),
            page_count INTEGER,
            title TEXT,
            author TEXT,
            subject TEXT,
            error_message TEXT,
            provenance_id TEXT NOT NULL REFERENCES provenance(id),
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_documents_status ON documents(status);
        CREATE INDEX IF NOT EXISTS idx_documents_file_type ON documents(file_type);
        CREATE INDEX IF NOT EXISTS idx_documents_created_at ON documents(created_at);

        CREATE TABLE IF NOT EXISTS ocr_results (
            id TEXT PRIMARY KEY,
            document_id TEXT NOT NULL REFERENCES documents(id),
            extracted_text TEXT NOT NULL,
            text_length INTEGER NOT NULL,
            page_count INTEGER,
            quality_score REAL,
            page_offsets TEXT NOT NULL DEFAULT '[]',
            processor TEXT,
            processor_version TEXT,
            request_id TEXT,
            duration_ms INTEGER,
            cost REAL,
            content_hash TEXT NOT NULL,
            provenance_id TEXT NOT NULL REFERENCES provenance(id),
            created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_ocr_results_document_id ON ocr_results(document_id);

        CREATE TABLE IF NOT EXISTS chunks (
            id TEXT PRIMARY KEY,
            ocr_result_id TEXT NOT NULL REFERENCES ocr_results(id),
            document_id TEXT NOT NULL REFERENCES documents(id),
            text TEXT NOT NULL,
            text_hash TEXT NOT NULL,
            chunk_index INTEGER NOT NULL,
            char_start INTEGER NOT NULL,
            char_end INTEGER NOT NULL,
            page_number INTEGER,
            page_range_start INTEGER,
            page_range_end INTEGER,
            overlap_prev INTEGER NOT NULL DEFAULT 0,
            overlap_next INTEGER NOT NULL DEFAULT 0,
            heading_context TEXT,
            heading_level INTEGER,
            section_path TEXT,
            content_type_tags TEXT NOT NULL DEFAULT '[]',
            is_atomic INTEGER NOT NULL DEFAULT 0,
            chunking_strategy TEXT,
            embedding_status TEXT NOT NULL DEFAULT 'pending',
            provenance_id TEXT NOT NULL REFERENCES provenance(id),
            created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_chunks_ocr_result_id ON chunks(ocr_result_id);
        CREATE INDEX IF NOT EXISTS idx_chunks_document_id ON chunks(document_id);

        CREATE VIRTUAL TABLE IF NOT EXISTS chunks_fts USING fts5(
            text,
            content='chunks',
            content_rowid='rowid'
        );
        CREATE TRIGGER IF NOT EXISTS chunks_fts_ai AFTER INSERT ON chunks BEGIN
            INSERT INTO chunks_fts(rowid, text) VALUES (new.rowid, new.text);
        END;
        CREATE TRIGGER IF NOT EXISTS chunks_fts_ad AFTER DELETE ON chunks BEGIN
            INSERT INTO chunks_fts(chunks_fts, rowid, text) VALUES ('delete', old.rowid, old.text);
        END;
        CREATE TRIGGER IF NOT EXISTS chunks_fts_au AFTER UPDATE ON chunks BEGIN
            INSERT INTO chunks_fts(chunks_fts, rowid, text) VALUES ('delete', old.rowid, old.text);
            INSERT INTO chunks_fts(rowid, text) VALUES (new.rowid, new.text);
        END;

        CREATE TABLE IF NOT EXISTS images (
            id TEXT PRIMARY KEY,
            ocr_result_id TEXT NOT NULL REFERENCES ocr_results(id),
            document_id TEXT NOT NULL REFERENCES documents(id),
            page_number INTEGER,
            bbox TEXT NOT NULL DEFAULT '[]',
            image_index INTEGER NOT NULL,
            format TEXT,
            width INTEGER,
            height INTEGER,
            extracted_file_path TEXT,
            file_size INTEGER,
            vlm_status TEXT NOT NULL DEFAULT 'pending',
            vlm_description TEXT,
            vlm_confidence REAL,
            vlm_model TEXT,
            vlm_embedding_id TEXT REFERENCES embeddings(id),
            content_hash TEXT NOT NULL,
            block_type TEXT,
            is_header_footer INTEGER NOT NULL DEFAULT 0,
            provenance_id TEXT NOT NULL REFERENCES provenance(id),
            -- Separate from `provenance_id` (the IMAGE-node provenance): the VLM
            -- description attached to this row gets its own VLM_DESCRIPTION node
            -- one level deeper in the chain (spec invariant 3), so verification
            -- needs a distinct pointer to find it from this row.
            vlm_provenance_id TEXT REFERENCES provenance(id),
            created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_images_ocr_result_id ON images(ocr_result_id);
        CREATE INDEX IF NOT EXISTS idx_images_document_id ON images(document_id);
        CREATE INDEX IF NOT EXISTS idx_images_vlm_provenance_id ON images(vlm_provenance_id);

        CREATE VIRTUAL TABLE IF NOT EXISTS vlm_fts USING fts5(
            vlm_description,
            content='images',
            content_rowid='rowid'
        );
        CREATE TRIGGER IF NOT EXISTS vlm_fts_ai AFTER INSERT ON images
        WHEN new.vlm_description IS NOT NULL BEGIN
            INSERT INTO vlm_fts(rowid, vlm_description) VALUES (new.rowid, new.vlm_description);
        END;
        CREATE TRIGGER IF NOT EXISTS vlm_fts_ad AFTER DELETE ON images
        WHEN old.vlm_description IS NOT NULL BEGIN
            INSERT INTO vlm_fts(vlm_fts, rowid, vlm_description) VALUES ('delete', old.rowid, old.vlm_description);
        END;
        CREATE TRIGGER IF NOT EXISTS vlm_fts_au AFTER UPDATE ON images BEGIN
            INSERT INTO vlm_fts(vlm_fts, rowid, vlm_description) VALUES ('delete', old.rowid, old.vlm_description);
            INSERT INTO vlm_fts(rowid, vlm_description) VALUES (new.rowid, new.vlm_description);
        END;

        CREATE TABLE IF NOT EXISTS extractions (
            id TEXT PRIMARY KEY,
            ocr_result_id TEXT NOT NULL REFERENCES ocr_results(id),
            document_id TEXT NOT NULL REFERENCES documents(id),
            schema_json TEXT NOT NULL,
            extraction_json TEXT NOT NULL,
            content_hash TEXT NOT NULL,
            provenance_id TEXT NOT NULL REFERENCES provenance(id),
            created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_extractions_ocr_result_id ON extractions(ocr_result_id);

        CREATE VIRTUAL TABLE IF NOT EXISTS extractions_fts USING fts5(
            extraction_json,
            content='extractions',
            content_rowid='rowid'
        );
        CREATE TRIGGER IF NOT EXISTS extractions_fts_ai AFTER INSERT ON extractions BEGIN
            INSERT INTO extractions_fts(rowid, extraction_json) VALUES (new.rowid, new.extraction_json);
        END;
        CREATE TRIGGER IF NOT EXISTS extractions_fts_ad AFTER DELETE ON extractions BEGIN
            INSERT INTO extractions_fts(extractions_fts, rowid, extraction_json) VALUES ('delete', old.rowid, old.extraction_json);
        END;
        CREATE TRIGGER IF NOT EXISTS extractions_fts_au AFTER UPDATE ON extractions BEGIN
            INSERT INTO extractions_fts(extractions_fts, rowid, extraction_json) VALUES ('delete', old.rowid, old.extraction_json);
            INSERT INTO extractions_fts(rowid, extraction_json) VALUES (new.rowid, new.extraction_json);
        END;

        CREATE VIRTUAL TABLE IF NOT EXISTS document_metadata_fts USING fts5(
            title, author, subject, file_name,
            content='documents',
            content_rowid='rowid'
        );
        CREATE TRIGGER IF NOT EXISTS document_metadata_fts_ai AFTER INSERT ON documents BEGIN
            INSERT INTO document_metadata_fts(rowid, title, author, subject, file_name)
            VALUES (new.rowid, new.title, new.author, new.subject, new.file_name);
        END;
        CREATE TRIGGER IF NOT EXISTS document_metadata_fts_ad AFTER DELETE ON documents BEGIN
            INSERT INTO document_metadata_fts(document_metadata_fts, rowid, title, author, subject, file_name)
            VALUES ('delete', old.rowid, old.title, old.author, old.subject, old.file_name);
        END;
        CREATE TRIGGER IF NOT EXISTS document_metadata_fts_au AFTER UPDATE ON documents BEGIN
            INSERT INTO document_metadata_fts(document_metadata_fts, rowid, title, author, subject, file_name)
            VALUES ('delete', old.rowid, old.title, old.author, old.subject, old.file_name);
            INSERT INTO document_metadata_fts(rowid, title, author, subject, file_name)
            VALUES (new.rowid, new.title, new.author, new.subject, new.file_name);
        END;

        CREATE TABLE IF NOT EXISTS embeddings (
            id TEXT PRIMARY KEY,
            chunk_id TEXT REFERENCES chunks(id),
            image_id TEXT REFERENCES images(id),
            extraction_id TEXT REFERENCES extractions(id),
            document_id TEXT NOT NULL REFERENCES documents(id),
            model_name TEXT NOT NULL,
            model_version TEXT,
            task_type TEXT,
            inference_mode TEXT,
            source_metadata TEXT NOT NULL DEFAULT '{}',
            content_hash TEXT NOT NULL,
            provenance_id TEXT NOT NULL REFERENCES provenance(id),
            created_at TEXT NOT NULL,
            CHECK (
                (CASE WHEN chunk_id IS NULL THEN 0 ELSE 1 END +
                 CASE WHEN image_id IS NULL THEN 0 ELSE 1 END +
                 CASE WHEN extraction_id IS NULL THEN 0 ELSE 1 END) = 1
            )
        );
        CREATE INDEX IF NOT EXISTS idx_embeddings_chunk_id ON embeddings(chunk_id);
        CREATE INDEX IF NOT EXISTS idx_embeddings_image_id ON embeddings(image_id);
        CREATE INDEX IF NOT EXISTS idx_embeddings_extraction_id ON embeddings(extraction_id);
        CREATE INDEX IF NOT EXISTS idx_embeddings_document_id ON embeddings(document_id);

        -- The ANN store. `vector` is a little-endian f32 BLOB; `dimension` is
        -- kept explicit rather than inferred from blob length so a corrupt
        -- or truncated blob is caught on read instead of silently misread.
        CREATE TABLE IF NOT EXISTS ann_vectors (
            embedding_id TEXT PRIMARY KEY REFERENCES embeddings(id),
            document_id TEXT NOT NULL REFERENCES documents(id),
            dimension INTEGER NOT NULL,
            vector BLOB NOT NULL,
            model_name TEXT NOT NULL,
            created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_ann_vectors_document_id ON ann_vectors(document_id);

        CREATE TABLE IF NOT EXISTS clusters (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            algorithm TEXT NOT NULL,
            parameters TEXT NOT NULL DEFAULT '{}',
            document_count INTEGER NOT NULL DEFAULT 0,
            top_terms TEXT NOT NULL DEFAULT '[]',
            content_hash TEXT NOT NULL,
            provenance_id TEXT NOT NULL REFERENCES provenance(id),
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS cluster_documents (
            cluster_id TEXT NOT NULL REFERENCES clusters(id),
            document_id TEXT NOT NULL REFERENCES documents(id),
            PRIMARY KEY (cluster_id, document_id)
        );
        CREATE INDEX IF NOT EXISTS idx_cluster_documents_cluster_id ON cluster_documents(cluster_id);

        CREATE TABLE IF NOT EXISTS tags (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            color TEXT,
            description TEXT,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS entity_tags (
            tag_id TEXT NOT NULL REFERENCES tags(id),
            entity_id TEXT NOT NULL,
            entity_type TEXT NOT NULL CHECK (
                entity_type IN ('document', 'chunk', 'image', 'extraction', 'cluster')
            ),
            UNIQUE (tag_id, entity_id, entity_type)
        );
        CREATE INDEX IF NOT EXISTS idx_entity_tags_entity ON entity_tags(entity_id, entity_type);
        ",
    )
    .map_err(MigrationError::Step)?;

    Ok(())
}

/// A structural schema report: tables/indexes the engine expects but did
/// not find. Empty vectors mean the schema is structurally sound.
/// Verification does not attempt repair.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct SchemaReport {
    pub missing_tables: Vec<String>,
    pub missing_indexes: Vec<String>,
}

impl SchemaReport {
    pub fn is_healthy(&self) -> bool {
        self.missing_tables.is_empty() && self.missing_indexes.is_empty()
    }
}

/// Inspect `sqlite_master` and report any expected table or index that
/// is absent.
pub fn verify_schema(conn: &Connection) -> Result<SchemaReport, MigrationError> {
    let existing_tables = list_names(conn, "table")?;
    let existing_indexes = list_names(conn, "index")?;

    let missing_tables = EXPECTED_TABLES
        .iter()
        .filter(|t| !existing_tables.contains_key(**t))
        .map(|t| t.to_string())
        .collect();
    let missing_indexes = EXPECTED_INDEXES
        .iter()
        .filter(|i| !existing_indexes.contains_key(**i))
        .map(|i| i.to_string())
        .collect();

    Ok(SchemaReport {
        missing_tables,
        missing_indexes,
    })
}

fn list_names(conn: &Connection, kind: &str) -> Result<BTreeMap<String, ()>, MigrationError> {
    let mut stmt = conn
        .prepare("SELECT name FROM sqlite_master WHERE type = ?1")
        .map_err(MigrationError::Step)?;
    let rows = stmt
        .query_map([kind], |row| row.get::<_, String>(0))
        .map_err(MigrationError::Step)?;
    let mut names = BTreeMap::new();
    for row in rows {
        names.insert(row.map_err(MigrationError::Step)?, ());
    }
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::open_conn;

    #[test]
    fn fresh_schema_has_no_missing_tables_or_indexes() {
        let dir = tempfile::tempdir().unwrap();
        let conn = open_conn(&dir.path().join("test.db")).unwrap();
        apply_v1(&conn).unwrap();
        let report = verify_schema(&conn).unwrap();
        assert!(report.is_healthy(), "{report:?}");
    }

    #[test]
    fn embeddings_parent_check_rejects_zero_and_multiple_parents() {
        let dir = tempfile::tempdir().unwrap();
        let conn = open_conn(&dir.path().join("test.db")).unwrap();
        apply_v1(&conn).unwrap();

        let err = conn.execute(
            "INSERT INTO embeddings (id, document_id, model_name, content_hash, provenance_id, created_at)
             VALUES ('e1', 'd1', 'm', 'sha256:x', 'p1', '2024-01-01T00:00:00Z')",
            [],
        );
        assert!(err.is_err(), "expected CHECK violation with zero parents");
    }
}

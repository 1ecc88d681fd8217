//! Entity types shared by the storage, provenance, and search layers.
//!
//! One struct per table, plus the small closed enums (`ProvenanceType`,
//! `DocumentStatus`, `EntityType`) that back `CHECK`-constrained columns.
//! JSON-encoded columns (processing params, content-type tags, chain path)
//! are decoded defensively via [`decode_json_column`] — corruption is
//! logged and replaced with a sensible default rather than propagated.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Opaque identifier. Always a UUIDv7 string in practice, but stored and
/// compared as plain text since several callers (the path sandbox, the
/// polymorphic `entity_tags` table) never need to parse it as a `Uuid`.
pub type Id = String;

/// The eight provenance node kinds plus the synthetic tombstone used to
/// re-parent orphaned chains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProvenanceType {
    Document,
    OcrResult,
    Chunk,
    Image,
    VlmDescription,
    Embedding,
    Extraction,
    Clustering,
    OrphanedRoot,
}

impl ProvenanceType {
    pub fn as_db_str(self) -> &'static str {
        match self {
            ProvenanceType::Document => "DOCUMENT",
            ProvenanceType::OcrResult => "OCR_RESULT",
            ProvenanceType::Chunk => "CHUNK",
            ProvenanceType::Image => "IMAGE",
            ProvenanceType::VlmDescription => "VLM_DESCRIPTION",
            ProvenanceType::Embedding => "EMBEDDING",
            ProvenanceType::Extraction => "EXTRACTION",
            ProvenanceType::Clustering => "CLUSTERING",
            ProvenanceType::OrphanedRoot => "ORPHANED_ROOT",
        }
    }

    pub fn from_db_str(value: &str) -> Option<Self> {
        Some(match value {
            "DOCUMENT" => ProvenanceType::Document,
            "OCR_RESULT" => ProvenanceType::OcrResult,
            "CHUNK" => ProvenanceType::Chunk,
            "IMAGE" => ProvenanceType::Image,
            "VLM_DESCRIPTION" => ProvenanceType::VlmDescription,
            "EMBEDDING" => ProvenanceType::Embedding,
            "EXTRACTION" => ProvenanceType::Extraction,
            "CLUSTERING" => ProvenanceType::Clustering,
            "ORPHANED_ROOT" => ProvenanceType::OrphanedRoot,
            _ => return None,
        })
    }
}

/// Document lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStatus {
    Pending,
    Processing,
    Complete,
    Failed,
}

impl DocumentStatus {
    pub fn as_db_str(self) -> &'static str {
        match self {
            DocumentStatus::Pending => "pending",
            DocumentStatus::Processing => "processing",
            DocumentStatus::Complete => "complete",
            DocumentStatus::Failed => "failed",
        }
    }

    pub fn from_db_str(value: &str) -> Option<Self> {
        Some(match value {
            "pending" => DocumentStatus::Pending,
            "processing" => DocumentStatus::Processing,
            "complete" => DocumentStatus::Complete,
            "failed" => DocumentStatus::Failed,
            _ => return None,
        })
    }
}

/// The five entity kinds a tag can be attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Document,
    Chunk,
    Image,
    Extraction,
    Cluster,
}

impl EntityType {
    pub fn as_db_str(self) -> &'static str {
        match self {
            EntityType::Document => "document",
            EntityType::Chunk => "chunk",
            EntityType::Image => "image",
            EntityType::Extraction => "extraction",
            EntityType::Cluster => "cluster",
        }
    }

    pub fn from_db_str(value: &str) -> Option<Self> {
        Some(match value {
            "document" => EntityType::Document,
            "chunk" => EntityType::Chunk,
            "image" => EntityType::Image,
            "extraction" => EntityType::Extraction,
            "cluster" => EntityType::Cluster,
            _ => return None,
        })
    }
}

/// Decode a JSON-encoded column, logging and falling back to `T::default()`
/// on corruption rather than propagating it — a malformed JSON blob should
/// never crash the process.
pub fn decode_json_column<T: Default + serde::de::DeserializeOwned>(
    raw: &str,
    column: &str,
) -> T {
    serde_json::from_str(raw).unwrap_or_else(|e| {
        tracing::warn!(column, error = %e, "corrupt JSON column, using default");
        T::default()
    })
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Provenance {
    pub id: Id,
    #[serde(rename = "type")]
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
    pub parent_ids: Vec<Id>,
    pub chain_depth: i64,
    pub chain_path: Vec<ProvenanceType>,
    pub chain_hash: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: Id,
    pub file_path: String,
    pub file_name: String,
    pub file_hash: String,
    pub file_size: i64,
    pub file_type: String,
    pub status: DocumentStatus,
    pub page_count: Option<i64>,
    pub title: Option<String>,
    pub author: Option<String>,
    pub subject: Option<String>,
    pub error_message: Option<String>,
    pub provenance_id: Id,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OcrResult {
    pub id: Id,
    pub document_id: Id,
    pub extracted_text: String,
    pub text_length: i64,
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
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub id: Id,
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
    pub embedding_status: String,
    pub provenance_id: Id,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Image {
    pub id: Id,
    pub ocr_result_id: Id,
    pub document_id: Id,
    pub page_number: Option<i64>,
    pub bbox: Vec<f64>,
    pub image_index: i64,
    pub format: Option<String>,
    pub width: Option<i64>,
    pub height: Option<i64>,
    pub extracted_file_path: Option<String>,
    pub file_size: Option<i64>,
    pub vlm_status: String,
    pub vlm_description: Option<String>,
    pub vlm_confidence: Option<f64>,
    pub vlm_model: Option<String>,
    pub vlm_embedding_id: Option<Id>,
    /// Provenance id of this row's `VLM_DESCRIPTION` node, one level deeper
    /// in the chain than `provenance_id` (which points at the `IMAGE` node).
    /// `None` until the VLM description is generated.
    pub vlm_provenance_id: Option<Id>,
    pub content_hash: String,
    pub block_type: Option<String>,
    pub is_header_footer: bool,
    pub provenance_id: Id,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Extraction {
    pub id: Id,
    pub ocr_result_id: Id,
    pub document_id: Id,
    pub schema_json: Value,
    pub extraction_json: Value,
    pub content_hash: String,
    pub provenance_id: Id,
    pub created_at: String,
}

/// Exactly one of these is ever `Some` for a given embedding row — enforced
/// by the `embeddings` table's `CHECK` constraint (spec invariant 6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbeddingParent<'a> {
    Chunk(&'a str),
    Image(&'a str),
    Extraction(&'a str),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Embedding {
    pub id: Id,
    pub chunk_id: Option<Id>,
    pub image_id: Option<Id>,
    pub extraction_id: Option<Id>,
    pub document_id: Id,
    pub model_name: String,
    pub model_version: Option<String>,
    pub task_type: Option<String>,
    pub inference_mode: Option<String>,
    pub source_metadata: Value,
    pub content_hash: String,
    pub provenance_id: Id,
    pub created_at: String,
}

impl Embedding {
    pub fn parent(&self) -> Option<EmbeddingParent<'_>> {
        if let Some(c) = &self.chunk_id {
            Some(EmbeddingParent::Chunk(c))
        } else if let Some(i) = &self.image_id {
            Some(EmbeddingParent::Image(i))
        } else {
            self.extraction_id.as_deref().map(EmbeddingParent::Extraction)
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cluster {
    pub id: Id,
    pub name: String,
    pub algorithm: String,
    pub parameters: Value,
    pub document_count: i64,
    pub top_terms: Vec<String>,
    pub content_hash: String,
    pub provenance_id: Id,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tag {
    pub id: Id,
    pub name: String,
    pub color: Option<String>,
    pub description: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityTag {
    pub tag_id: Id,
    pub entity_id: Id,
    pub entity_type: EntityType,
}

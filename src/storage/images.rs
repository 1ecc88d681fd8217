//! CRUD for the `images` table.

use rusqlite::{params, Connection, OptionalExtension};

use crate::error::{EngineError, ErrorCategory};
use crate::model::{decode_json_column, Id, Image};
use crate::util::now_iso8601;

use super::insert_with_fk_context;

pub struct NewImage {
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
    pub content_hash: String,
    pub block_type: Option<String>,
    pub is_header_footer: bool,
    pub provenance_id: Id,
}

pub fn insert(conn: &Connection, id: &Id, new: NewImage) -> Result<Image, EngineError> {
    let image = Image {
        id: id.clone(),
        ocr_result_id: new.ocr_result_id,
        document_id: new.document_id,
        page_number: new.page_number,
        bbox: new.bbox,
        image_index: new.image_index,
        format: new.format,
        width: new.width,
        height: new.height,
        extracted_file_path: new.extracted_file_path,
        file_size: new.file_size,
        vlm_status: "pending".to_string(),
        vlm_description: None,
        vlm_confidence: None,
        vlm_model: None,
        vlm_embedding_id: None,
        vlm_provenance_id: None,
        content_hash: new.content_hash,
        block_type: new.block_type,
        is_header_footer: new.is_header_footer,
        provenance_id: new.provenance_id,
        created_at: now_iso8601(),
    };

    let bbox_json = serde_json::to_string(&image.bbox)?;

    insert_with_fk_context("ocr_result_id", || {
        conn.execute(
            "INSERT INTO images (
                id, ocr_result_id, document_id, page_number, bbox, image_index, format, width,
                height, extracted_file_path, file_size, vlm_status, vlm_description, vlm_confidence,
                vlm_model, vlm_embedding_id, content_hash, block_type, is_header_footer, provenance_id,
                vlm_provenance_id, created_at
            ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18,?19,?20,?21,?22)",
            params![
                image.id,
                image.ocr_result_id,
                image.document_id,
                image.page_number,
                bbox_json,
                image.image_index,
                image.format,
                image.width,
                image.height,
                image.extracted_file_path,
                image.file_size,
                image.vlm_status,
                image.vlm_description,
                image.vlm_confidence,
                image.vlm_model,
                image.vlm_embedding_id,
                image.content_hash,
                image.block_type,
                image.is_header_footer,
                image.provenance_id,
                image.vlm_provenance_id,
                image.created_at,
            ],
        )
    })?;

    Ok(image)
}

pub fn get_by_id(conn: &Connection, id: &str) -> Result<Image, EngineError> {
    conn.query_row(&format!("{SELECT} WHERE id = ?1"), params![id], decode_row)
        .optional()?
        .ok_or_else(|| EngineError::new(ErrorCategory::DocumentNotFound, format!("no image with id '{id}'")))
}

pub fn list_by_document(conn: &Connection, document_id: &str) -> Result<Vec<Image>, EngineError> {
    let mut stmt = conn.prepare(&format!(
        "{SELECT} WHERE document_id = ?1 ORDER BY image_index ASC"
    ))?;
    let rows = stmt.query_map(params![document_id], decode_row)?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

/// Attach a VLM description, its own `VLM_DESCRIPTION`-node provenance id,
/// and (once embedded) the resulting embedding id — the inverse side of
/// the image↔embedding circular reference.
pub fn set_vlm_description(
    conn: &Connection,
    id: &str,
    description: &str,
    confidence: Option<f64>,
    model: &str,
    vlm_provenance_id: &str,
) -> Result<(), EngineError> {
    let updated = conn.execute(
        "UPDATE images SET vlm_status = 'complete', vlm_description = ?1, vlm_confidence = ?2,
                vlm_model = ?3, vlm_provenance_id = ?4
         WHERE id = ?5",
        params![description, confidence, model, vlm_provenance_id, id],
    )?;
    if updated == 0 {
        return Err(EngineError::new(ErrorCategory::DocumentNotFound, format!("no image with id '{id}'")));
    }
    Ok(())
}

pub fn set_vlm_embedding_id(conn: &Connection, id: &str, embedding_id: Option<&str>) -> Result<(), EngineError> {
    conn.execute(
        "UPDATE images SET vlm_embedding_id = ?1 WHERE id = ?2",
        params![embedding_id, id],
    )?;
    Ok(())
}

const SELECT: &str = "SELECT id, ocr_result_id, document_id, page_number, bbox, image_index, format, width,
        height, extracted_file_path, file_size, vlm_status, vlm_description, vlm_confidence, vlm_model,
        vlm_embedding_id, vlm_provenance_id, content_hash, block_type, is_header_footer, provenance_id,
        created_at
 FROM images";

fn decode_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Image> {
    let bbox_raw: String = row.get(4)?;
    Ok(Image {
        id: row.get(0)?,
        ocr_result_id: row.get(1)?,
        document_id: row.get(2)?,
        page_number: row.get(3)?,
        bbox: decode_json_column(&bbox_raw, "bbox"),
        image_index: row.get(5)?,
        format: row.get(6)?,
        width: row.get(7)?,
        height: row.get(8)?,
        extracted_file_path: row.get(9)?,
        file_size: row.get(10)?,
        vlm_status: row.get(11)?,
        vlm_description: row.get(12)?,
        vlm_confidence: row.get(13)?,
        vlm_model: row.get(14)?,
        vlm_embedding_id: row.get(15)?,
        vlm_provenance_id: row.get(16)?,
        content_hash: row.get(17)?,
        block_type: row.get(18)?,
        is_header_footer: row.get(19)?,
        provenance_id: row.get(20)?,
        created_at: row.get(21)?,
    })
}

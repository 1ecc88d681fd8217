//! CRUD for `tags` and the polymorphic `entity_tags` join. `entity_id` is not a declared foreign key — it
//! ranges over five base tables — so every caller here is expected to
//! have already checked the referenced entity exists.

use rusqlite::{params, Connection, OptionalExtension};

use crate::error::{EngineError, ErrorCategory};
use crate::model::{EntityTag, EntityType, Id, Tag};
use crate::util::now_iso8601;

pub fn insert_tag(
    conn: &Connection,
    id: &Id,
    name: &str,
    color: Option<&str>,
    description: Option<&str>,
) -> Result<Tag, EngineError> {
    let tag = Tag {
        id: id.clone(),
        name: name.to_string(),
        color: color.map(str::to_string),
        description: description.map(str::to_string),
        created_at: now_iso8601(),
    };

    conn.execute(
        "INSERT INTO tags (id, name, color, description, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
        params![tag.id, tag.name, tag.color, tag.description, tag.created_at],
    )?;

    Ok(tag)
}

pub fn get_tag(conn: &Connection, id: &str) -> Result<Tag, EngineError> {
    conn.query_row(
        "SELECT id, name, color, description, created_at FROM tags WHERE id = ?1",
        params![id],
        decode_tag_row,
    )
    .optional()?
    .ok_or_else(|| EngineError::new(ErrorCategory::DocumentNotFound, format!("no tag with id '{id}'")))
}

/// Attach `tag_id` to an entity. The `(tag_id, entity_id, entity_type)`
/// triple is `UNIQUE`, so a duplicate attach surfaces as a validation
/// error rather than silently succeeding twice.
pub fn attach(
    conn: &Connection,
    tag_id: &str,
    entity_id: &str,
    entity_type: EntityType,
) -> Result<(), EngineError> {
    conn.execute(
        "INSERT INTO entity_tags (tag_id, entity_id, entity_type) VALUES (?1, ?2, ?3)",
        params![tag_id, entity_id, entity_type.as_db_str()],
    )
    .map_err(|e| {
        if matches!(&e, rusqlite::Error::SqliteFailure(err, _) if err.code == rusqlite::ErrorCode::ConstraintViolation)
        {
            EngineError::validation(format!(
                "tag '{tag_id}' is already attached to {entity_type:?} '{entity_id}'"
            ))
        } else {
            EngineError::from(e)
        }
    })?;
    Ok(())
}

pub fn detach(conn: &Connection, tag_id: &str, entity_id: &str, entity_type: EntityType) -> Result<(), EngineError> {
    conn.execute(
        "DELETE FROM entity_tags WHERE tag_id = ?1 AND entity_id = ?2 AND entity_type = ?3",
        params![tag_id, entity_id, entity_type.as_db_str()],
    )?;
    Ok(())
}

pub fn list_for_entity(conn: &Connection, entity_id: &str, entity_type: EntityType) -> Result<Vec<EntityTag>, EngineError> {
    let mut stmt = conn.prepare(
        "SELECT tag_id, entity_id, entity_type FROM entity_tags WHERE entity_id = ?1 AND entity_type = ?2",
    )?;
    let rows = stmt.query_map(params![entity_id, entity_type.as_db_str()], decode_entity_tag_row)?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

/// Delete every entity-tag row for one entity (cascade-delete step 4).
pub fn delete_for_entity(conn: &Connection, entity_id: &str, entity_type: EntityType) -> Result<(), EngineError> {
    conn.execute(
        "DELETE FROM entity_tags WHERE entity_id = ?1 AND entity_type = ?2",
        params![entity_id, entity_type.as_db_str()],
    )?;
    Ok(())
}

fn decode_tag_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Tag> {
    Ok(Tag {
        id: row.get(0)?,
        name: row.get(1)?,
        color: row.get(2)?,
        description: row.get(3)?,
        created_at: row.get(4)?,
    })
}

fn decode_entity_tag_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<EntityTag> {
    let entity_type_raw: String = row.get(2)?;
    let entity_type = EntityType::from_db_str(&entity_type_raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            2,
            rusqlite::types::Type::Text,
            format!("unknown entity_type '{entity_type_raw}'").into(),
        )
    })?;
    Ok(EntityTag {
        tag_id: row.get(0)?,
        entity_id: row.get(1)?,
        entity_type,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::open_database;
    use crate::util::new_id;

    #[test]
    fn attach_is_idempotent_rejected_on_duplicate() {
        let dir = tempfile::tempdir().unwrap();
        let conn = open_database(&dir.path().join("t.db")).unwrap();
        let tag = insert_tag(&conn, &new_id(), "important", Some("#ff0000"), None).unwrap();

        attach(&conn, &tag.id, "doc-1", EntityType::Document).unwrap();
        let err = attach(&conn, &tag.id, "doc-1", EntityType::Document).unwrap_err();
        assert_eq!(err.category, ErrorCategory::ValidationError);

        let tags = list_for_entity(&conn, "doc-1", EntityType::Document).unwrap();
        assert_eq!(tags.len(), 1);

        detach(&conn, &tag.id, "doc-1", EntityType::Document).unwrap();
        assert!(list_for_entity(&conn, "doc-1", EntityType::Document).unwrap().is_empty());
    }
}

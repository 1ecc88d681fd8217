//! BM25 full-text search over the four FTS5 indexes. Every query string passes through
//! [`crate::search::sanitize::sanitize_fts5_query`] before it reaches
//! `MATCH`; scores are reranked exactly once by the quality multiplier,
//! here and nowhere else — the hybrid fusion layer fuses ranks, not raw
//! scores, so it never re-applies this multiplier.

use rusqlite::{params, Connection};

use crate::error::EngineError;
use crate::model::Id;

use super::sanitize::{ensure_sanitized, phrase_query};
use super::vector::PageRangeFilter;

/// A single BM25 hit, already quality-reranked, with its final rank.
#[derive(Debug, Clone)]
pub struct Bm25Hit {
    pub entity_id: Id,
    pub document_id: Id,
    pub raw_score: f64,
    pub score: f64,
    pub rank: i64,
    pub highlight: Option<String>,
}

/// Shared query parameters.
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    pub limit: usize,
    pub phrase: bool,
    pub document_ids: Option<Vec<Id>>,
    pub include_highlight: bool,
    pub pre_sanitized: bool,
}

/// Additional filters specific to chunk search.
#[derive(Debug, Clone, Default)]
pub struct ChunkFilter {
    pub section_path_prefix: Option<String>,
    pub heading_substring: Option<String>,
    pub content_type_in: Option<Vec<String>>,
    pub is_atomic: Option<bool>,
    pub page_range: PageRangeFilter,
    pub min_heading_level: Option<i64>,
    pub max_heading_level: Option<i64>,
    pub table_column_contains: Option<String>,
    pub min_page_count: Option<i64>,
    pub max_page_count: Option<i64>,
    pub min_quality: Option<f64>,
}

/// Metadata filter for document-level search.
#[derive(Debug, Clone, Default)]
pub struct MetadataFilter {
    pub title_contains: Option<String>,
    pub author_contains: Option<String>,
    pub subject_contains: Option<String>,
}

/// The BM25 quality multiplier: monotonic and linear between the anchors
/// `quality=0 -> 0.8` and `quality=5 -> 1.0`; `None` (absent quality)
/// maps to the neutral `0.9`.
pub fn quality_multiplier(quality_score: Option<f64>) -> f64 {
    match quality_score {
        None => 0.9,
        Some(q) => {
            let clamped = q.clamp(0.0, 5.0);
            0.8 + (clamped / 5.0) * 0.2
        }
    }
}

fn rerank_by_quality(mut hits: Vec<Bm25Hit>) -> Vec<Bm25Hit> {
    hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    for (i, hit) in hits.iter_mut().enumerate() {
        hit.rank = (i + 1) as i64;
    }
    hits
}

fn document_filter_clause(document_ids: &Option<Vec<Id>>, next_param: usize) -> (String, Vec<String>) {
    match document_ids {
        None => (String::new(), Vec::new()),
        Some(ids) if ids.is_empty() => (" AND 0".to_string(), Vec::new()),
        Some(ids) => {
            let placeholders: Vec<String> = (0..ids.len())
                .map(|i| format!("?{}", next_param + i))
                .collect();
            (
                format!(" AND document_id IN ({})", placeholders.join(", ")),
                ids.clone(),
            )
        }
    }
}

/// Search chunk text.
pub fn search_chunks(
    conn: &Connection,
    query: &str,
    opts: &QueryOptions,
    filter: &ChunkFilter,
) -> Result<Vec<Bm25Hit>, EngineError> {
    let sanitized = ensure_sanitized(query, opts.pre_sanitized);
    let match_expr = if opts.phrase { phrase_query(&sanitized) } else { sanitized };
    if match_expr.is_empty() {
        return Ok(Vec::new());
    }

    let mut sql = String::from(
        "SELECT c.id, c.document_id, bm25(chunks_fts) AS raw_score, c.text, c.page_number,
                c.section_path, c.heading_context, c.heading_level, c.content_type_tags,
                c.is_atomic, o.quality_score, o.page_count
         FROM chunks_fts
         JOIN chunks c ON c.rowid = chunks_fts.rowid
         JOIN ocr_results o ON o.id = c.ocr_result_id
         WHERE chunks_fts MATCH ?1",
    );

    let (doc_clause, doc_params) = document_filter_clause(&opts.document_ids, 2);
    sql.push_str(&doc_clause);

    let mut stmt = conn.prepare(&sql)?;
    let mut bound: Vec<&dyn rusqlite::ToSql> = vec![&match_expr];
    for p in &doc_params {
        bound.push(p);
    }

    let rows = stmt.query_map(bound.as_slice(), |row| {
        let id: String = row.get(0)?;
        let document_id: String = row.get(1)?;
        let raw_score: f64 = row.get(2)?;
        let text: String = row.get(3)?;
        let page_number: Option<i64> = row.get(4)?;
        let section_path: Option<String> = row.get(5)?;
        let heading_context: Option<String> = row.get(6)?;
        let heading_level: Option<i64> = row.get(7)?;
        let content_type_tags_raw: String = row.get(8)?;
        let is_atomic: bool = row.get(9)?;
        let quality_score: Option<f64> = row.get(10)?;
        let page_count: Option<i64> = row.get(11)?;
        Ok((
            id,
            document_id,
            raw_score,
            text,
            page_number,
            section_path,
            heading_context,
            heading_level,
            content_type_tags_raw,
            is_atomic,
            quality_score,
            page_count,
        ))
    })?;

    let mut hits = Vec::new();
    for row in rows {
        let (
            id,
            document_id,
            raw_score,
            text,
            page_number,
            section_path,
            heading_context,
            heading_level,
            content_type_tags_raw,
            is_atomic,
            quality_score,
            page_count,
        ) = row?;

        if let Some(prefix) = &filter.section_path_prefix {
            if !section_path.as_deref().unwrap_or("").starts_with(prefix.as_str()) {
                continue;
            }
        }
        if let Some(substr) = &filter.heading_substring {
            if !heading_context.as_deref().unwrap_or("").contains(substr.as_str()) {
                continue;
            }
        }
        if let Some(types) = &filter.content_type_in {
            let tags: Vec<String> = crate::model::decode_json_column(&content_type_tags_raw, "content_type_tags");
            if !types.iter().any(|t| tags.contains(t)) {
                continue;
            }
        }
        if let Some(wanted_atomic) = filter.is_atomic {
            if is_atomic != wanted_atomic {
                continue;
            }
        }
        if !filter.page_range.admits(page_number) {
            continue;
        }
        if let Some(min) = filter.min_heading_level {
            if heading_level.unwrap_or(i64::MIN) < min {
                continue;
            }
        }
        if let Some(max) = filter.max_heading_level {
            if heading_level.unwrap_or(i64::MAX) > max {
                continue;
            }
        }
        if let Some(needle) = &filter.table_column_contains {
            if !text.contains(needle.as_str()) {
                continue;
            }
        }
        if let Some(min) = filter.min_page_count {
            if page_count.unwrap_or(0) < min {
                continue;
            }
        }
        if let Some(max) = filter.max_page_count {
            if page_count.unwrap_or(i64::MAX) > max {
                continue;
            }
        }
        if let Some(min_quality) = filter.min_quality {
            if quality_score.unwrap_or(0.0) < min_quality {
                continue;
            }
        }

        // FTS5 bm25() is smaller-is-better; negate so larger is better,
        // matching every other score in this engine.
        let normalized_raw = -raw_score;
        let score = normalized_raw * quality_multiplier(quality_score);
        let highlight = opts.include_highlight.then(|| snippet(&text, 80));

        hits.push(Bm25Hit {
            entity_id: id,
            document_id,
            raw_score: normalized_raw,
            score,
            rank: 0,
            highlight,
        });
    }

    let mut hits = rerank_by_quality(hits);
    hits.truncate(opts.limit.max(1));
    Ok(hits)
}

/// Search VLM image descriptions.
pub fn search_vlm_descriptions(
    conn: &Connection,
    query: &str,
    opts: &QueryOptions,
    page_range: PageRangeFilter,
) -> Result<Vec<Bm25Hit>, EngineError> {
    let sanitized = ensure_sanitized(query, opts.pre_sanitized);
    let match_expr = if opts.phrase { phrase_query(&sanitized) } else { sanitized };
    if match_expr.is_empty() {
        return Ok(Vec::new());
    }

    let mut sql = String::from(
        "SELECT i.id, i.document_id, bm25(vlm_fts) AS raw_score, i.vlm_description, i.page_number,
                o.quality_score
         FROM vlm_fts
         JOIN images i ON i.rowid = vlm_fts.rowid
         JOIN ocr_results o ON o.id = i.ocr_result_id
         WHERE vlm_fts MATCH ?1",
    );
    let (doc_clause, doc_params) = document_filter_clause(&opts.document_ids, 2);
    sql.push_str(&doc_clause);

    let mut stmt = conn.prepare(&sql)?;
    let mut bound: Vec<&dyn rusqlite::ToSql> = vec![&match_expr];
    for p in &doc_params {
        bound.push(p);
    }

    let rows = stmt.query_map(bound.as_slice(), |row| {
        let id: String = row.get(0)?;
        let document_id: String = row.get(1)?;
        let raw_score: f64 = row.get(2)?;
        let description: Option<String> = row.get(3)?;
        let page_number: Option<i64> = row.get(4)?;
        let quality_score: Option<f64> = row.get(5)?;
        Ok((id, document_id, raw_score, description, page_number, quality_score))
    })?;

    let mut hits = Vec::new();
    for row in rows {
        let (id, document_id, raw_score, description, page_number, quality_score) = row?;
        if !page_range.admits(page_number) {
            continue;
        }
        let normalized_raw = -raw_score;
        let score = normalized_raw * quality_multiplier(quality_score);
        let highlight = opts
            .include_highlight
            .then(|| snippet(description.as_deref().unwrap_or(""), 80));
        hits.push(Bm25Hit {
            entity_id: id,
            document_id,
            raw_score: normalized_raw,
            score,
            rank: 0,
            highlight,
        });
    }

    let mut hits = rerank_by_quality(hits);
    hits.truncate(opts.limit.max(1));
    Ok(hits)
}

/// Search extraction JSON payloads.
pub fn search_extractions(
    conn: &Connection,
    query: &str,
    opts: &QueryOptions,
) -> Result<Vec<Bm25Hit>, EngineError> {
    let sanitized = ensure_sanitized(query, opts.pre_sanitized);
    let match_expr = if opts.phrase { phrase_query(&sanitized) } else { sanitized };
    if match_expr.is_empty() {
        return Ok(Vec::new());
    }

    let mut sql = String::from(
        "SELECT x.id, x.document_id, bm25(extractions_fts) AS raw_score, x.extraction_json, o.quality_score
         FROM extractions_fts
         JOIN extractions x ON x.rowid = extractions_fts.rowid
         JOIN ocr_results o ON o.id = x.ocr_result_id
         WHERE extractions_fts MATCH ?1",
    );
    let (doc_clause, doc_params) = document_filter_clause(&opts.document_ids, 2);
    sql.push_str(&doc_clause);

    let mut stmt = conn.prepare(&sql)?;
    let mut bound: Vec<&dyn rusqlite::ToSql> = vec![&match_expr];
    for p in &doc_params {
        bound.push(p);
    }

    let rows = stmt.query_map(bound.as_slice(), |row| {
        let id: String = row.get(0)?;
        let document_id: String = row.get(1)?;
        let raw_score: f64 = row.get(2)?;
        let json: String = row.get(3)?;
        let quality_score: Option<f64> = row.get(4)?;
        Ok((id, document_id, raw_score, json, quality_score))
    })?;

    let mut hits = Vec::new();
    for row in rows {
        let (id, document_id, raw_score, json, quality_score) = row?;
        let normalized_raw = -raw_score;
        let score = normalized_raw * quality_multiplier(quality_score);
        let highlight = opts.include_highlight.then(|| snippet(&json, 80));
        hits.push(Bm25Hit {
            entity_id: id,
            document_id,
            raw_score: normalized_raw,
            score,
            rank: 0,
            highlight,
        });
    }

    let mut hits = rerank_by_quality(hits);
    hits.truncate(opts.limit.max(1));
    Ok(hits)
}

/// Search document metadata (title/author/subject/file_name).
pub fn search_document_metadata(
    conn: &Connection,
    query: &str,
    opts: &QueryOptions,
    filter: &MetadataFilter,
) -> Result<Vec<Bm25Hit>, EngineError> {
    let sanitized = ensure_sanitized(query, opts.pre_sanitized);
    let match_expr = if opts.phrase { phrase_query(&sanitized) } else { sanitized };
    if match_expr.is_empty() {
        return Ok(Vec::new());
    }

    let mut sql = String::from(
        "SELECT d.id, d.id, bm25(document_metadata_fts) AS raw_score, d.title, d.author, d.subject,
                o.quality_score
         FROM document_metadata_fts
         JOIN documents d ON d.rowid = document_metadata_fts.rowid
         LEFT JOIN ocr_results o ON o.document_id = d.id
         WHERE document_metadata_fts MATCH ?1",
    );
    let (doc_clause, doc_params) = document_filter_clause(&opts.document_ids, 2);
    sql.push_str(&doc_clause.replace("document_id", "d.id"));

    let mut stmt = conn.prepare(&sql)?;
    let mut bound: Vec<&dyn rusqlite::ToSql> = vec![&match_expr];
    for p in &doc_params {
        bound.push(p);
    }

    let rows = stmt.query_map(bound.as_slice(), |row| {
        let id: String = row.get(0)?;
        let raw_score: f64 = row.get(2)?;
        let title: Option<String> = row.get(3)?;
        let author: Option<String> = row.get(4)?;
        let subject: Option<String> = row.get(5)?;
        let quality_score: Option<f64> = row.get(6)?;
        Ok((id, raw_score, title, author, subject, quality_score))
    })?;

    let mut hits = Vec::new();
    for row in rows {
        let (id, raw_score, title, author, subject, quality_score) = row?;

        if let Some(needle) = &filter.title_contains {
            if !title.as_deref().unwrap_or("").contains(needle.as_str()) {
                continue;
            }
        }
        if let Some(needle) = &filter.author_contains {
            if !author.as_deref().unwrap_or("").contains(needle.as_str()) {
                continue;
            }
        }
        if let Some(needle) = &filter.subject_contains {
            if !subject.as_deref().unwrap_or("").contains(needle.as_str()) {
                continue;
            }
        }

        let normalized_raw = -raw_score;
        let score = normalized_raw * quality_multiplier(quality_score);
        let highlight = opts.include_highlight.then(|| title.clone().unwrap_or_default());
        hits.push(Bm25Hit {
            entity_id: id.clone(),
            document_id: id,
            raw_score: normalized_raw,
            score,
            rank: 0,
            highlight,
        });
    }

    let mut hits = rerank_by_quality(hits);
    hits.truncate(opts.limit.max(1));
    Ok(hits)
}

fn snippet(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        let truncated: String = text.chars().take(max_chars).collect();
        format!("{truncated}…")
    }
}

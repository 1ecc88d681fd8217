//! `ocrprovctl` — local inspection CLI for an OCR provenance database.
//!
//! Opens a database file directly (no daemon, no socket — the engine is
//! embedded, not a service) and prints schema/version/index status, or
//! runs a search, from the command line.
//!
//! ```text
//! ocrprovctl --db <path> status
//! ocrprovctl --db <path> search <query> [--limit N] [--phrase]
//! ocrprovctl --db <path> verify-chain <provenance-id>
//! ocrprovctl --db <path> index-status
//! ocrprovctl --db <path> rebuild-index <chunks|vlm|extractions|document-metadata>
//! ```

use std::path::PathBuf;
use std::process;

use clap::{Parser, Subcommand};

use ocr_provenance_core::db::open_database;
use ocr_provenance_core::provenance::verify_chain;
use ocr_provenance_core::search::bm25::{self, ChunkFilter, QueryOptions};
use ocr_provenance_core::search::index_status::{self, IndexKind};

#[derive(Parser)]
#[command(name = "ocrprovctl", about = "Inspect an OCR provenance database")]
struct Cli {
    /// Path to the SQLite database file.
    #[arg(long)]
    db: PathBuf,

    /// Log level (`error`, `warn`, `info`, `debug`, `trace`).
    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print schema version and table/index health.
    Status,
    /// Run a BM25 search over document chunks.
    Search {
        query: String,
        #[arg(long, default_value_t = 10)]
        limit: usize,
        #[arg(long)]
        phrase: bool,
    },
    /// Walk a provenance chain from `provenance_id` to its root, verifying
    /// every link's chain hash.
    VerifyChain { provenance_id: String },
    /// Report staleness for all four FTS indexes.
    IndexStatus,
    /// Rebuild one FTS index.
    RebuildIndex { kind: String },
}

fn main() {
    let cli = Cli::parse();

    if let Err(e) = ocr_provenance_core::logger::init(&cli.log_level, true) {
        eprintln!("warning: failed to initialize logging: {e}");
    }

    if let Err(e) = run(cli) {
        eprintln!("error: {e}");
        process::exit(1);
    }
}

fn run(cli: Cli) -> Result<(), String> {
    let conn = open_database(&cli.db).map_err(|e| e.to_string())?;

    match cli.command {
        Command::Status => {
            let report = ocr_provenance_core::db::schema::verify_schema(&conn)
                .map_err(|e| e.to_string())?;
            println!("schema healthy: {}", report.is_healthy());
            if !report.missing_tables.is_empty() {
                println!("missing tables: {}", report.missing_tables.join(", "));
            }
            if !report.missing_indexes.is_empty() {
                println!("missing indexes: {}", report.missing_indexes.join(", "));
            }
            Ok(())
        }
        Command::Search { query, limit, phrase } => {
            let opts = QueryOptions {
                limit,
                phrase,
                document_ids: None,
                include_highlight: true,
                pre_sanitized: false,
            };
            let hits = bm25::search_chunks(&conn, &query, &opts, &ChunkFilter::default())
                .map_err(|e| e.to_string())?;
            for hit in hits {
                println!(
                    "{:>3}  {:.4}  {}  {}",
                    hit.rank,
                    hit.score,
                    hit.entity_id,
                    hit.highlight.unwrap_or_default()
                );
            }
            Ok(())
        }
        Command::VerifyChain { provenance_id } => {
            let report = verify_chain(&conn, &provenance_id).map_err(|e| e.to_string())?;
            println!("links: {}", report.links.len());
            match report.first_broken {
                Some(ref id) => println!("broken at: {id}"),
                None => println!("chain intact"),
            }
            Ok(())
        }
        Command::IndexStatus => {
            for status in index_status::status_all(&conn).map_err(|e| e.to_string())? {
                println!(
                    "{:?}: base={} fts={} triggers={} stale={}",
                    status.kind, status.base_count, status.fts_count, status.triggers_present, status.is_stale
                );
            }
            Ok(())
        }
        Command::RebuildIndex { kind } => {
            let kind = parse_index_kind(&kind)?;
            let mut conn = conn;
            index_status::rebuild(&mut conn, kind).map_err(|e| e.to_string())?;
            println!("rebuilt {kind:?}");
            Ok(())
        }
    }
}

fn parse_index_kind(s: &str) -> Result<IndexKind, String> {
    match s {
        "chunks" => Ok(IndexKind::Chunks),
        "vlm" => Ok(IndexKind::Vlm),
        "extractions" => Ok(IndexKind::Extractions),
        "document-metadata" => Ok(IndexKind::DocumentMetadata),
        other => Err(format!("unknown index kind: {other} (expected chunks|vlm|extractions|document-metadata)")),
    }
}

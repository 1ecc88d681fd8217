//! Structured error taxonomy: `(category, message, details?)` with a
//! recovery hint attached to every category.
//!
//! Any fallible call in this crate ultimately returns [`EngineError`].
//! Leaf modules (SQLite, migrations, the vector store) define their own
//! narrow error enums and lift them here via [`EngineError::lift`] rather
//! than constructing [`EngineError`] directly, so each module's error
//! messages stay local to the module that raised them.

use serde::Serialize;
use thiserror::Error;

/// Closed set of error categories. Adding a variant is a breaking change
/// for any caller that matches on this enum exhaustively.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCategory {
    ValidationError,
    DatabaseNotFound,
    DatabaseNotSelected,
    DatabaseAlreadyExists,
    DocumentNotFound,
    ProvenanceNotFound,
    ProvenanceChainBroken,
    IntegrityVerificationFailed,
    OcrApiError,
    OcrRateLimit,
    OcrTimeout,
    EmbeddingFailed,
    VlmApiError,
    VlmRateLimit,
    ImageExtractionFailed,
    ClusteringError,
    GpuNotAvailable,
    GpuOutOfMemory,
    PathNotFound,
    PathNotDirectory,
    PermissionDenied,
    ConfigurationError,
    InternalError,
}

/// A suggested next action for the caller: which tool to retry with, and
/// a human-readable explanation of why.
#[derive(Debug, Clone, Serialize)]
pub struct RecoveryHint {
    pub tool: &'static str,
    pub hint: &'static str,
}

impl ErrorCategory {
    pub fn recovery_hint(self) -> RecoveryHint {
        use ErrorCategory::*;
        match self {
            ValidationError => RecoveryHint {
                tool: "validate_input",
                hint: "check the request payload against the documented schema and resubmit",
            },
            DatabaseNotFound => RecoveryHint {
                tool: "list_databases",
                hint: "the named database does not exist; list available databases or create it",
            },
            DatabaseNotSelected => RecoveryHint {
                tool: "select_database",
                hint: "no database is currently selected; select one before issuing this request",
            },
            DatabaseAlreadyExists => RecoveryHint {
                tool: "select_database",
                hint: "a database with this name already exists; select it instead of creating it",
            },
            DocumentNotFound => RecoveryHint {
                tool: "list_documents",
                hint: "the document id does not exist in the selected database",
            },
            ProvenanceNotFound => RecoveryHint {
                tool: "get_provenance_chain",
                hint: "the provenance id does not exist; it may have been deleted by a cascade",
            },
            ProvenanceChainBroken => RecoveryHint {
                tool: "verify_provenance_chain",
                hint: "a link in the chain failed hash verification; inspect the reported node",
            },
            IntegrityVerificationFailed => RecoveryHint {
                tool: "verify_content_hash",
                hint: "stored content hash does not match recomputed hash; data may be corrupt",
            },
            OcrApiError => RecoveryHint {
                tool: "retry_ocr",
                hint: "the OCR worker returned an error; retry or inspect its logs",
            },
            OcrRateLimit => RecoveryHint {
                tool: "retry_ocr",
                hint: "the OCR worker is rate-limited; back off and retry later",
            },
            OcrTimeout => RecoveryHint {
                tool: "retry_ocr",
                hint: "the OCR worker did not respond before the timeout; retry with a longer budget",
            },
            EmbeddingFailed => RecoveryHint {
                tool: "retry_embedding",
                hint: "embedding generation failed for this input; it was recorded as a warning",
            },
            VlmApiError => RecoveryHint {
                tool: "retry_vlm",
                hint: "the VLM worker returned an error; retry or inspect its logs",
            },
            VlmRateLimit => RecoveryHint {
                tool: "retry_vlm",
                hint: "the VLM worker is rate-limited; back off and retry later",
            },
            ImageExtractionFailed => RecoveryHint {
                tool: "retry_image_extraction",
                hint: "the image region could not be extracted from the source document",
            },
            ClusteringError => RecoveryHint {
                tool: "retry_clustering",
                hint: "the clustering run failed; inspect parameters and the document set",
            },
            GpuNotAvailable => RecoveryHint {
                tool: "configure_device",
                hint: "no GPU device is available; fall back to CPU or configure EMBEDDING_DEVICE",
            },
            GpuOutOfMemory => RecoveryHint {
                tool: "configure_device",
                hint: "the GPU ran out of memory; reduce batch size or fall back to CPU",
            },
            PathNotFound => RecoveryHint {
                tool: "validate_path",
                hint: "the supplied path does not exist on disk",
            },
            PathNotDirectory => RecoveryHint {
                tool: "validate_path",
                hint: "the supplied path is not a directory",
            },
            PermissionDenied => RecoveryHint {
                tool: "validate_path",
                hint: "the path falls outside every allowed base directory",
            },
            ConfigurationError => RecoveryHint {
                tool: "check_configuration",
                hint: "an environment variable or configuration value is missing or invalid",
            },
            InternalError => RecoveryHint {
                tool: "report_bug",
                hint: "an unexpected internal error occurred; this is likely a bug",
            },
        }
    }
}

/// The crate's top-level error type. Carries a category (for programmatic
/// dispatch + recovery hints), a human-readable message, and optional
/// structured details (e.g. the sub-error's own code).
#[derive(Debug, Error)]
#[error("{category:?}: {message}")]
pub struct EngineError {
    pub category: ErrorCategory,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl EngineError {
    pub fn new(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::ValidationError, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::InternalError, message)
    }

    pub fn recovery_hint(&self) -> RecoveryHint {
        self.category.recovery_hint()
    }

    /// Shape every error sent across the API boundary into
    /// `{success: false, error: {category, message, recovery, details?}}`.
    pub fn to_envelope(&self) -> serde_json::Value {
        let hint = self.recovery_hint();
        serde_json::json!({
            "success": false,
            "error": {
                "category": self.category,
                "message": self.message,
                "recovery": { "tool": hint.tool, "hint": hint.hint },
                "details": self.details,
            }
        })
    }
}

impl From<rusqlite::Error> for EngineError {
    fn from(e: rusqlite::Error) -> Self {
        // Foreign-key violations get a generic fallback here; call sites that
        // know which column is involved should prefer
        // `storage::insert_with_fk_context` to attach a precise message.
        if let rusqlite::Error::SqliteFailure(err, _) = &e {
            if err.code == rusqlite::ErrorCode::ConstraintViolation {
                return EngineError::new(
                    ErrorCategory::ValidationError,
                    format!("constraint violation: {e}"),
                );
            }
        }
        EngineError::internal(format!("sqlite error: {e}"))
    }
}

impl From<std::io::Error> for EngineError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::NotFound => {
                EngineError::new(ErrorCategory::PathNotFound, e.to_string())
            }
            std::io::ErrorKind::PermissionDenied => {
                EngineError::new(ErrorCategory::PermissionDenied, e.to_string())
            }
            _ => EngineError::internal(format!("io error: {e}")),
        }
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        EngineError::internal(format!("json error: {e}"))
    }
}

/// Implemented by small, module-local error enums (migration errors, the
/// vector store's own error type, OCR worker sub-errors) so they can be
/// lifted into [`EngineError`] while preserving their category (if they
/// have one) and structured details.
pub trait LiftableError: std::error::Error {
    /// `Some(category)` if this sub-error class carries its own category
    /// that should win over the default mapping; `None` to fall back to
    /// `InternalError`.
    fn category(&self) -> Option<ErrorCategory> {
        None
    }
    fn code(&self) -> Option<String> {
        None
    }
    fn details(&self) -> Option<serde_json::Value> {
        None
    }
}

impl EngineError {
    pub fn lift<E: LiftableError>(err: E) -> Self {
        let category = err.category().unwrap_or(ErrorCategory::InternalError);
        let message = err.to_string();
        let mut details = serde_json::Map::new();
        if let Some(code) = err.code() {
            details.insert("errorCode".into(), serde_json::Value::String(code));
        }
        if let Some(d) = err.details() {
            details.insert("errorDetails".into(), d);
        }
        let details = if details.is_empty() {
            None
        } else {
            Some(serde_json::Value::Object(details))
        };
        EngineError {
            category,
            message,
            details,
        }
    }
}

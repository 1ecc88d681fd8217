#![cfg_attr(test, allow(dead_code))]
//! Configuration loading with env-var overrides.
//!
//! Everything the core needs is read straight from the process
//! environment (spec: "Environment variables consumed by the core").
//! `dotenvy::dotenv()` is loaded best-effort at process start so a local
//! `.env` file behaves the same as exported shell variables.

use std::env;
use std::path::PathBuf;

use crate::error::{EngineError, ErrorCategory};

const ENV_DATABASES_PATH: &str = "OCR_PROVENANCE_DATABASES_PATH";
const ENV_ALLOWED_DIRS: &str = "OCR_PROVENANCE_ALLOWED_DIRS";
const ENV_EMBEDDING_DEVICE: &str = "EMBEDDING_DEVICE";

/// Resolved runtime configuration for the engine.
#[derive(Debug, Clone)]
pub struct Config {
    /// Root directory under which per-database SQLite files live.
    pub databases_path: PathBuf,
    /// Additional caller-supplied directories to admit into the path
    /// sandbox, beyond the built-in defaults.
    pub extra_allowed_dirs: Vec<PathBuf>,
    /// Informational echo of the configured embedding device
    /// (`"cpu"`, `"cuda"`, `"mps"`, ...). Not interpreted by the core;
    /// the worker bridge that actually runs embeddings owns that logic.
    pub embedding_device: Option<String>,
}

impl Config {
    /// Load configuration from the process environment, loading a local
    /// `.env` file first if one is present (best-effort; a missing or
    /// unreadable `.env` is not an error).
    pub fn load() -> Result<Self, EngineError> {
        let _ = dotenvy::dotenv();
        Self::load_from_env()
    }

    /// Load configuration without touching `.env`. Exposed separately so
    /// tests can set environment variables directly and get
    /// deterministic behavior.
    pub fn load_from_env() -> Result<Self, EngineError> {
        let databases_path = match env::var(ENV_DATABASES_PATH) {
            Ok(v) if !v.trim().is_empty() => PathBuf::from(v),
            _ => default_databases_path()?,
        };

        let extra_allowed_dirs = match env::var(ENV_ALLOWED_DIRS) {
            Ok(v) if !v.trim().is_empty() => v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(PathBuf::from)
                .collect(),
            _ => Vec::new(),
        };

        let embedding_device = env::var(ENV_EMBEDDING_DEVICE)
            .ok()
            .filter(|v| !v.trim().is_empty());

        Ok(Config {
            databases_path,
            extra_allowed_dirs,
            embedding_device,
        })
    }
}

fn default_databases_path() -> Result<PathBuf, EngineError> {
    let home = dirs::home_dir().ok_or_else(|| {
        EngineError::new(
            ErrorCategory::ConfigurationError,
            "could not determine the user home directory; set OCR_PROVENANCE_DATABASES_PATH explicitly",
        )
    })?;
    Ok(home.join(".ocr-provenance").join("databases"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Environment variables are process-global; serialize tests that touch them.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn clear_env() {
        env::remove_var(ENV_DATABASES_PATH);
        env::remove_var(ENV_ALLOWED_DIRS);
        env::remove_var(ENV_EMBEDDING_DEVICE);
    }

    #[test]
    fn defaults_to_home_databases_dir() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_env();
        let cfg = Config::load_from_env().unwrap();
        assert!(cfg.databases_path.ends_with(".ocr-provenance/databases"));
        assert!(cfg.extra_allowed_dirs.is_empty());
        assert!(cfg.embedding_device.is_none());
        clear_env();
    }

    #[test]
    fn reads_explicit_overrides() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_env();
        env::set_var(ENV_DATABASES_PATH, "/tmp/ocr-dbs");
        env::set_var(ENV_ALLOWED_DIRS, "/data/a, /data/b ,");
        env::set_var(ENV_EMBEDDING_DEVICE, "cuda");

        let cfg = Config::load_from_env().unwrap();
        assert_eq!(cfg.databases_path, PathBuf::from("/tmp/ocr-dbs"));
        assert_eq!(
            cfg.extra_allowed_dirs,
            vec![PathBuf::from("/data/a"), PathBuf::from("/data/b")]
        );
        assert_eq!(cfg.embedding_device.as_deref(), Some("cuda"));
        clear_env();
    }
}

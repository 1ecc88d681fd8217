//! Opaque keyset-pagination cursor: base64url JSON `{"created_at","id"}`
//!. Used instead of deep `OFFSET` to keep
//! pagination cost constant regardless of page depth.

use serde::{Deserialize, Serialize};

use crate::error::EngineError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    pub created_at: String,
    pub id: String,
}

pub fn encode_cursor(created_at: &str, id: &str) -> String {
    let cursor = Cursor {
        created_at: created_at.to_string(),
        id: id.to_string(),
    };
    let json = serde_json::to_vec(&cursor).expect("Cursor serialization cannot fail");
    base64::Engine::encode(&base64::engine::general_purpose::URL_SAFE_NO_PAD, json)
}

pub fn decode_cursor(raw: &str) -> Result<Cursor, EngineError> {
    let bytes = base64::Engine::decode(&base64::engine::general_purpose::URL_SAFE_NO_PAD, raw)
        .map_err(|e| EngineError::validation(format!("malformed cursor: {e}")))?;
    serde_json::from_slice(&bytes)
        .map_err(|e| EngineError::validation(format!("malformed cursor payload: {e}")))
}

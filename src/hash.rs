//! Content hashing and stack-safe numeric reductions.
//!
//! Every stored entity carries a `content_hash` of the form
//! `sha256:<64 lowercase hex chars>`, computed deterministically from
//! the entity's canonical bytes (file bytes for documents and images,
//! text bytes for everything else).

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use sha2::{Digest, Sha256};

use crate::error::EngineError;

const HASH_PREFIX: &str = "sha256:";
const HASH_HEX_LEN: usize = 64;
const FILE_CHUNK_SIZE: usize = 64 * 1024;

/// Hash an in-memory byte slice, returning `sha256:<64-hex>`.
pub fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{HASH_PREFIX}{}", hex::encode(hasher.finalize()))
}

/// Hash a UTF-8 string's bytes, returning `sha256:<64-hex>`.
pub fn content_hash_str(text: &str) -> String {
    content_hash(text.as_bytes())
}

/// Hash a file's contents by streaming fixed-size chunks, so memory use
/// stays bounded regardless of file size.
pub fn hash_file(path: &Path) -> Result<String, EngineError> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; FILE_CHUNK_SIZE];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{HASH_PREFIX}{}", hex::encode(hasher.finalize())))
}

/// Check that a string matches the literal `sha256:<64-hex>` format.
pub fn is_valid_hash(value: &str) -> bool {
    match value.strip_prefix(HASH_PREFIX) {
        Some(hex_part) => {
            hex_part.len() == HASH_HEX_LEN
                && hex_part.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase())
        }
        None => false,
    }
}

/// Validate a hash string, returning a typed error if malformed.
pub fn validate_hash(value: &str) -> Result<(), EngineError> {
    if is_valid_hash(value) {
        Ok(())
    } else {
        Err(EngineError::validation(format!(
            "'{value}' is not a valid content hash; expected 'sha256:' followed by 64 lowercase hex characters"
        )))
    }
}

/// Return the minimum of a sequence in a single pass, or `None` if empty.
///
/// Implemented as a plain left fold rather than recursion or
/// `Iterator::min_by` chains that could in principle blow the call
/// stack; this must hold for sequences of a million elements or more.
pub fn safe_min<I, T>(values: I) -> Option<T>
where
    I: IntoIterator<Item = T>,
    T: PartialOrd,
{
    let mut iter = values.into_iter();
    let mut current = iter.next()?;
    for value in iter {
        if value < current {
            current = value;
        }
    }
    Some(current)
}

/// Return the maximum of a sequence in a single pass, or `None` if empty.
pub fn safe_max<I, T>(values: I) -> Option<T>
where
    I: IntoIterator<Item = T>,
    T: PartialOrd,
{
    let mut iter = values.into_iter();
    let mut current = iter.next()?;
    for value in iter {
        if value > current {
            current = value;
        }
    }
    Some(current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn content_hash_has_expected_shape() {
        let h = content_hash_str("hello world");
        assert!(is_valid_hash(&h));
        assert_eq!(
            h,
            "sha256:b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn hash_file_matches_in_memory_hash() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        let payload = b"the quick brown fox jumps over the lazy dog".repeat(10_000);
        tmp.write_all(&payload).unwrap();
        tmp.flush().unwrap();

        let streamed = hash_file(tmp.path()).unwrap();
        let in_memory = content_hash(&payload);
        assert_eq!(streamed, in_memory);
    }

    #[test]
    fn rejects_malformed_hashes() {
        assert!(!is_valid_hash("not-a-hash"));
        assert!(!is_valid_hash("sha256:tooshort"));
        assert!(!is_valid_hash(&format!("sha256:{}", "A".repeat(64))));
        assert!(validate_hash("sha256:not-hex").is_err());
    }

    #[test]
    fn safe_min_max_handle_large_sequences() {
        let n = 1_000_000i64;
        let values = 0..n;
        assert_eq!(safe_min(values.clone()), Some(0));
        assert_eq!(safe_max(values), Some(n - 1));
    }

    #[test]
    fn safe_min_max_empty_is_none() {
        assert_eq!(safe_min(Vec::<i64>::new()), None);
        assert_eq!(safe_max(Vec::<i64>::new()), None);
    }
}

//! Run identifiers: validation and deterministic derivation.

use sha2::{Digest, Sha256};

/// Reject ids that are empty or would escape a single path component.
///
/// Allowed characters: `[A-Za-z0-9._-]`.
pub fn validate_run_id(id: &str) -> Result<(), String> {
    if id.is_empty() {
        return Err("run id must not be empty".to_string());
    }
    if id == "." || id == ".." {
        return Err(format!("run id must not be '{id}'"));
    }
    if id
        .chars()
        .any(|c| !(c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-'))
    {
        return Err(format!("run id must be [A-Za-z0-9._-] only (got '{id}')"));
    }
    Ok(())
}

/// Base id derived from the requirements text: `run-<8 hex of sha256>`.
pub fn base_run_id(requirements: &str) -> String {
    let digest = Sha256::digest(requirements.as_bytes());
    let hex = hex::encode(digest);
    format!("run-{}", &hex[..8])
}

/// Candidate ids in order: the base, then `base-2`, `base-3`, ...
pub fn run_id_candidates(base: &str) -> impl Iterator<Item = String> + '_ {
    (1..=999u32).map(move |suffix| {
        if suffix == 1 {
            base.to_string()
        } else {
            format!("{base}-{suffix}")
        }
    })
}

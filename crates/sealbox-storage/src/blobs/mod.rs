//! Path-addressed blob storage
//!
//! Encrypted content blobs live under relative, slash-separated paths such
//! as `files/<resource-id>/content`. Both backends reject paths that could
//! escape their root.

mod store;

pub use store::{FsBlobStore, FsBlobStoreConfig};

use sealbox_core::StoreError;

/// Check that `path` is a relative path made of plain segments
pub fn validate_path(path: &str) -> Result<(), StoreError> {
    let invalid = |reason: &str| StoreError::InvalidPath(format!("{:?}: {}", path, reason));

    if path.is_empty() {
        return Err(invalid("empty path"));
    }
    if path.starts_with('/') {
        return Err(invalid("absolute path"));
    }
    if path.contains('\\') || path.contains('\0') {
        return Err(invalid("forbidden character"));
    }
    for segment in path.split('/') {
        match segment {
            "" => return Err(invalid("empty segment")),
            "." | ".." => return Err(invalid("relative segment")),
            _ => {}
        }
    }
    Ok(())
}

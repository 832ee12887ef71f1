//! Id generation.

use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Generates a new time-ordered id.
#[must_use]
pub fn generate_id() -> String {
    Uuid::now_v7().to_string()
}

/// Builds a stable deduplication key from components.
#[must_use]
pub fn dedupe_key(components: &[&str]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(components.join(":").as_bytes());
    let digest = hasher.finalize();
    hex::encode(&digest[..16])
}

/// Derives a stable id from components, formatted like a uuid.
///
/// Records created from a redelivered unit of work get the same id, so the
/// second insert is a no-op.
#[must_use]
pub fn derive_id(components: &[&str]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(components.join(":").as_bytes());
    let digest = hasher.finalize();
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&digest[..16]);
    Uuid::from_bytes(bytes).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_id_is_unique() {
        let a = generate_id();
        let b = generate_id();
        assert_ne!(a, b);
        assert_eq!(Uuid::parse_str(&a).unwrap().get_version_num(), 7);
    }

    #[test]
    fn test_dedupe_key_is_stable() {
        let a = dedupe_key(&["pe1", "abort", "n1"]);
        assert_eq!(a, dedupe_key(&["pe1", "abort", "n1"]));
        assert_ne!(a, dedupe_key(&["pe1", "abort", "n2"]));
        assert_eq!(a.len(), 32);
    }

    #[test]
    fn test_derive_id_is_stable_uuid() {
        let a = derive_id(&["parent", "child-a"]);
        assert_eq!(a, derive_id(&["parent", "child-a"]));
        assert_ne!(a, derive_id(&["parent", "child-b"]));
        assert!(Uuid::parse_str(&a).is_ok());
    }
}

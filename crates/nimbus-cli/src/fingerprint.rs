use sha2::{Digest, Sha256};

/// Stable checkpoint key for one (filename, size) pair.
///
/// This is a directory discriminator, not a content check: two different
/// files sharing a name and size map to the same fingerprint.
pub fn fingerprint(filename: &str, size: u64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(filename.as_bytes());
    hasher.update(b"-");
    hasher.update(size.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

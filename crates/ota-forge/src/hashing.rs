use std::fs;
use std::io::Read;
use std::path::Path;

use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

const BLOCK_SIZE: usize = 64 * 1024;

/// Streaming SHA-256 of a file. Memory use is independent of file size.
/// Hashing a nonexistent file is a caller bug; the I/O error propagates.
pub fn digest_file(path: &Path) -> Result<String> {
    let mut file = fs::File::open(path)
        .map_err(|e| Error::msg(format!("failed to open {} for hashing: {e}", path.display())))?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; BLOCK_SIZE];
    loop {
        let n = file
            .read(&mut buf)
            .map_err(|e| Error::msg(format!("read error hashing {}: {e}", path.display())))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// SHA-256 over the UTF-8 bytes of a string.
pub fn digest_string(s: &str) -> String {
    hex::encode(Sha256::digest(s.as_bytes()))
}

/// Case-insensitive digest comparison (published checksums vary in case).
pub fn digests_match(a: &str, b: &str) -> bool {
    a.eq_ignore_ascii_case(b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_string_known_vector() {
        assert_eq!(
            digest_string(""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn digest_file_is_deterministic_and_flip_sensitive() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("blob.bin");
        let mut data = vec![0xAAu8; 3 * BLOCK_SIZE + 17];
        fs::write(&path, &data).expect("write");

        let first = digest_file(&path).expect("digest");
        let second = digest_file(&path).expect("digest");
        assert_eq!(first, second);
        assert_eq!(first.len(), 64);

        data[BLOCK_SIZE + 1] ^= 0x01;
        fs::write(&path, &data).expect("write");
        let flipped = digest_file(&path).expect("digest");
        assert_ne!(first, flipped);
    }

    #[test]
    fn digest_file_missing_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert!(digest_file(&dir.path().join("nope")).is_err());
    }

    #[test]
    fn digests_match_ignores_case() {
        assert!(digests_match("ABCDEF", "abcdef"));
        assert!(!digests_match("abcdef", "abcdee"));
    }
}

//! Credential digests
//!
//! Basic-auth credentials are compared as SHA-256 digests so the
//! comparison cost does not depend on where the secret first differs.

use sha2::{Digest as Sha2Digest, Sha256};

/// Width of a credential digest in bytes
pub const DIGEST_LEN: usize = 32;

/// A SHA-256 digest
pub type Digest = [u8; DIGEST_LEN];

/// Compute SHA-256 digest of data
pub fn digest(data: &[u8]) -> Digest {
    let d = Sha256::new().chain_update(data).finalize();
    let mut result = [0u8; DIGEST_LEN];
    result.copy_from_slice(&d);
    result
}

/// Digest of `username:password`, the form carried by HTTP basic auth
pub fn credential_digest(username: &str, password: &str) -> Digest {
    digest(format!("{}:{}", username, password).as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_empty() {
        let hash = digest(b"");
        // SHA-256 of empty string is well-known
        assert_eq!(&hash[..4], &[0xe3, 0xb0, 0xc4, 0x42]);
        assert_eq!(&hash[28..], &[0x78, 0x52, 0xb8, 0x55]);
    }

    #[test]
    fn test_credential_digest() {
        assert_eq!(credential_digest("user", "pass"), digest(b"user:pass"));
        assert_ne!(credential_digest("user", "pass"), credential_digest("user", "pasS"));
        assert_ne!(credential_digest("us", "er:pass"), digest(b"user:pass2"));
    }
}

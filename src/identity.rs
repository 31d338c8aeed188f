//! Host attestation token
//!
//! Clients send a short, stable token derived from the host name so the
//! server log can tell machines apart even when they share credentials.

use sha1::{Digest, Sha1};

/// Length of the attestation token in bytes
pub const ATTESTATION_LEN: usize = 8;

/// Token for the given host name: the first bytes of its SHA-1
pub fn attestation_for(hostname: &str) -> Vec<u8> {
    let digest = Sha1::digest(hostname.as_bytes());
    digest[..ATTESTATION_LEN].to_vec()
}

/// Name of this host, `unknown` if it cannot be read
pub fn local_hostname() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown".into())
}

/// Token for this host
pub fn local_attestation() -> Vec<u8> {
    attestation_for(&local_hostname())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attestation_is_sha1_prefix() {
        // SHA-1("abc") = a9993e364706816aba3e25717850c26c9cd0d89d
        assert_eq!(hex::encode(attestation_for("abc")), "a9993e364706816a");
    }

    #[test]
    fn test_attestation_is_stable_and_distinct() {
        assert_eq!(attestation_for("node-1"), attestation_for("node-1"));
        assert_ne!(attestation_for("node-1"), attestation_for("node-2"));
        assert_eq!(local_attestation().len(), ATTESTATION_LEN);
    }
}

//! Short, non-reversible token fingerprints for log correlation

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use sha2::{Digest, Sha256};

/// Number of digest bytes kept in a fingerprint (8 base64 chars).
const FINGERPRINT_BYTES: usize = 6;

/// Fingerprint a credential for logging.
///
/// Two log lines carrying the same fingerprint refer to the same token; the
/// token itself is never recoverable from it.
pub fn fingerprint(token: &str) -> String {
    let digest = Sha256::digest(token.as_bytes());
    URL_SAFE_NO_PAD.encode(&digest[..FINGERPRINT_BYTES])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_stable_and_short() {
        let a = fingerprint("at_abc");
        assert_eq!(a, fingerprint("at_abc"));
        assert_eq!(a.len(), 8);
        assert!(!a.contains("at_abc"));
    }

    #[test]
    fn different_tokens_differ() {
        assert_ne!(fingerprint("at_one"), fingerprint("at_two"));
    }
}

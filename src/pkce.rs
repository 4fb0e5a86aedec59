//! PKCE (Proof Key for Code Exchange) per RFC 7636.
//!
//! Every authorization attempt gets a fresh verifier. Its S256 challenge is
//! sent to the authorize endpoint, and the verifier itself is sent with the
//! code exchange to prove both requests came from the same client.

use std::fmt;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use rand::RngCore;
use sha2::{Digest, Sha256};
use veil::Redact;

/// Verifier and challenge for a single authorization attempt.
///
/// Not `Clone`: a challenge is consumed by the code exchange, whether it
/// succeeds or not.
#[derive(PartialEq, Eq, Redact)]
pub struct PkceChallenge {
    #[redact]
    verifier: String,
    challenge: String,
}

impl PkceChallenge {
    /// The only challenge method the service accepts.
    pub const METHOD: &'static str = "S256";

    /// Random bytes in a verifier. Encodes to 43 characters, the RFC 7636
    /// minimum.
    const VERIFIER_BYTES: usize = 32;

    /// Generates a verifier from the thread-local CSPRNG and derives its
    /// challenge.
    #[must_use]
    pub fn generate() -> Self {
        let mut bytes = [0u8; Self::VERIFIER_BYTES];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self::from_verifier(URL_SAFE_NO_PAD.encode(bytes))
    }

    /// Builds a challenge for a known verifier.
    #[must_use]
    pub fn from_verifier(verifier: String) -> Self {
        let challenge = compute_challenge(&verifier);
        Self {
            verifier,
            challenge,
        }
    }

    #[must_use]
    pub fn verifier(&self) -> &str {
        &self.verifier
    }

    #[must_use]
    pub fn challenge(&self) -> &str {
        &self.challenge
    }

    #[must_use]
    pub fn method(&self) -> &'static str {
        Self::METHOD
    }
}

impl fmt::Display for PkceChallenge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.challenge)
    }
}

/// `BASE64URL(SHA256(verifier))` without padding.
#[must_use]
pub fn compute_challenge(verifier: &str) -> String {
    let hash = Sha256::digest(verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(hash)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn challenge_is_hash_of_verifier() {
        for _ in 0..32 {
            let pkce = PkceChallenge::generate();
            let expected = URL_SAFE_NO_PAD.encode(Sha256::digest(pkce.verifier().as_bytes()));
            assert_eq!(pkce.challenge(), expected);
            assert!((43..=128).contains(&pkce.verifier().len()));
        }
    }

    #[test]
    fn verifier_is_url_safe() {
        let pkce = PkceChallenge::generate();
        assert!(
            pkce.verifier()
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'),
            "verifier must be URL-safe base64 without padding"
        );
        assert!(!pkce.challenge().contains('='));
    }

    #[test]
    fn verifiers_are_unique() {
        let a = PkceChallenge::generate();
        let b = PkceChallenge::generate();
        assert_ne!(a.verifier(), b.verifier());
    }

    #[test]
    fn matches_rfc7636_appendix_b() {
        let pkce =
            PkceChallenge::from_verifier("dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk".to_owned());
        assert_eq!(pkce.challenge(), "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM");
        assert_eq!(pkce.method(), "S256");
    }
}

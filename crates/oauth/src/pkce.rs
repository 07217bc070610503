//! PKCE verifier generation and S256 challenge derivation (RFC 7636).

use {
    base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD},
    rand::Rng,
    secrecy::SecretString,
    sha2::{Digest, Sha256},
};

use crate::types::PkceChallenge;

/// Longest verifier RFC 7636 allows.
pub const MAX_VERIFIER_LEN: usize = 128;

const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

/// Draw a verifier of `length` symbols from `[A-Za-z0-9]`.
///
/// `length` is clamped to `1..=128`.
pub fn generate_verifier(length: usize) -> String {
    let length = length.clamp(1, MAX_VERIFIER_LEN);
    let mut rng = rand::rng();
    (0..length)
        .map(|_| ALPHABET[rng.random_range(0..ALPHABET.len())] as char)
        .collect()
}

/// `BASE64URL(SHA256(verifier))` without padding.
pub fn derive_challenge(verifier: &str) -> String {
    let digest = Sha256::digest(verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(digest)
}

impl PkceChallenge {
    /// Generate a fresh verifier and its challenge.
    pub fn generate(length: usize) -> Self {
        let verifier = generate_verifier(length);
        let challenge = derive_challenge(&verifier);
        Self {
            verifier: SecretString::new(verifier),
            challenge,
        }
    }
}

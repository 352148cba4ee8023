//! Hybrid value cipher.
//!
//! Each value is encrypted to a single recipient public key: a fresh
//! secp256k1 ephemeral keypair per call, ECDH against the recipient,
//! HKDF-SHA256 expansion of the shared secret, XChaCha20-Poly1305 over
//! the plaintext. The on-disk form is one line:
//!
//! `encrypted:siv:v3:<base64(ephemeral_pub33 || nonce24 || ciphertext || tag16)>`
//!
//! Keys travel as lowercase hex: 33-byte compressed SEC1 points (66
//! chars) for public keys, 32-byte scalars (64 chars) for private keys.

use crate::error::{Error, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chacha20poly1305::aead::{Aead, AeadCore, KeyInit, OsRng};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use hkdf::Hkdf;
use k256::elliptic_curve::sec1::ToEncodedPoint;
use k256::{PublicKey, SecretKey};
use sha2::Sha256;
use zeroize::Zeroizing;

/// Namespace shared by every ciphertext version we know how to detect.
pub const MAGIC_NAMESPACE: &str = "encrypted:siv:";
/// Current version prefix, including the trailing separator.
pub const MAGIC_V3: &str = "encrypted:siv:v3:";

const HKDF_INFO: &[u8] = b"si-vault:siv:v3";
const EPHEMERAL_LEN: usize = 33;
const NONCE_LEN: usize = 24;
const TAG_LEN: usize = 16;
const MIN_PAYLOAD_LEN: usize = EPHEMERAL_LEN + NONCE_LEN + TAG_LEN;

/// Generate a fresh keypair as `(public_hex, private_hex)`.
pub fn generate_keypair() -> (String, String) {
    let secret = SecretKey::random(&mut OsRng);
    let public = secret.public_key();
    (
        hex::encode(public.to_encoded_point(true).as_bytes()),
        hex::encode(secret.to_bytes()),
    )
}

/// Derive the compressed public key for a private scalar.
pub fn public_key_for(private_hex: &str) -> Result<String> {
    let secret = parse_private_key(private_hex)?;
    Ok(hex::encode(
        secret.public_key().to_encoded_point(true).as_bytes(),
    ))
}

fn parse_public_key(public_hex: &str) -> Result<PublicKey> {
    let trimmed = public_hex.trim();
    if trimmed.is_empty() {
        return Err(Error::InvalidArgument("public key is empty".into()));
    }
    let bytes = hex::decode(trimmed)
        .map_err(|_| Error::InvalidArgument("public key is not valid hex".into()))?;
    if bytes.len() != EPHEMERAL_LEN {
        return Err(Error::InvalidArgument(format!(
            "public key must be {EPHEMERAL_LEN} bytes (compressed point), got {}",
            bytes.len()
        )));
    }
    PublicKey::from_sec1_bytes(&bytes)
        .map_err(|_| Error::InvalidArgument("public key is not a valid curve point".into()))
}

fn parse_private_key(private_hex: &str) -> Result<SecretKey> {
    let trimmed = private_hex.trim();
    if trimmed.is_empty() {
        return Err(Error::InvalidArgument("private key is empty".into()));
    }
    let bytes = Zeroizing::new(
        hex::decode(trimmed)
            .map_err(|_| Error::InvalidArgument("private key is not valid hex".into()))?,
    );
    if bytes.len() != 32 {
        return Err(Error::InvalidArgument(format!(
            "private key must be 32 bytes, got {}",
            bytes.len()
        )));
    }
    SecretKey::from_slice(&bytes)
        .map_err(|_| Error::InvalidArgument("private key is not a valid scalar".into()))
}

fn derive_key(secret: &SecretKey, public: &PublicKey) -> Zeroizing<[u8; 32]> {
    let shared = k256::ecdh::diffie_hellman(secret.to_nonzero_scalar(), public.as_affine());
    let hk = Hkdf::<Sha256>::new(None, shared.raw_secret_bytes());
    let mut okm = Zeroizing::new([0u8; 32]);
    // Expand of 32 bytes from SHA-256 output cannot fail.
    hk.expand(HKDF_INFO, okm.as_mut())
        .unwrap_or_else(|_| unreachable!("HKDF output length is fixed"));
    okm
}

/// Encrypt `plaintext` to the given compressed public key.
pub fn encrypt(plaintext: &str, public_key_hex: &str) -> Result<String> {
    let recipient = parse_public_key(public_key_hex)?;
    let ephemeral = SecretKey::random(&mut OsRng);
    let key = derive_key(&ephemeral, &recipient);
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key.as_ref()));
    let nonce = XChaCha20Poly1305::generate_nonce(&mut OsRng);
    let ciphertext = cipher
        .encrypt(&nonce, plaintext.as_bytes())
        .map_err(|_| Error::Internal(anyhow::anyhow!("AEAD encryption failed")))?;

    let eph_pub = ephemeral.public_key().to_encoded_point(true);
    let mut blob = Vec::with_capacity(EPHEMERAL_LEN + NONCE_LEN + ciphertext.len());
    blob.extend_from_slice(eph_pub.as_bytes());
    blob.extend_from_slice(&nonce);
    blob.extend_from_slice(&ciphertext);
    Ok(format!("{MAGIC_V3}{}", BASE64.encode(blob)))
}

/// Decrypt a ciphertext by trying each candidate private key in order.
/// The first successful AEAD verification wins. Structural problems
/// (unknown version, bad base64, truncated payload) are integrity
/// failures; exhausting the candidates is a decrypt failure.
pub fn decrypt(ciphertext: &str, candidates: &[String]) -> Result<String> {
    let trimmed = strip_quotes(ciphertext.trim());
    let payload_b64 = match trimmed.strip_prefix(MAGIC_V3) {
        Some(rest) => rest,
        None if trimmed.starts_with(MAGIC_NAMESPACE) => {
            return Err(Error::IntegrityFailure(
                "unknown ciphertext version".into(),
            ));
        }
        None => {
            return Err(Error::IntegrityFailure(
                "value is not an encrypted payload".into(),
            ));
        }
    };
    let blob = BASE64
        .decode(payload_b64)
        .map_err(|_| Error::IntegrityFailure("payload is not valid base64".into()))?;
    if blob.len() < MIN_PAYLOAD_LEN {
        return Err(Error::IntegrityFailure(format!(
            "payload too short ({} bytes)",
            blob.len()
        )));
    }
    let ephemeral = PublicKey::from_sec1_bytes(&blob[..EPHEMERAL_LEN])
        .map_err(|_| Error::IntegrityFailure("ephemeral key is not a valid point".into()))?;
    let nonce = XNonce::from_slice(&blob[EPHEMERAL_LEN..EPHEMERAL_LEN + NONCE_LEN]);
    let body = &blob[EPHEMERAL_LEN + NONCE_LEN..];

    if candidates.is_empty() {
        return Err(Error::DecryptFailure("no private key candidates".into()));
    }
    let mut tried = 0usize;
    for candidate in candidates {
        let Ok(secret) = parse_private_key(candidate) else {
            continue;
        };
        tried += 1;
        let key = derive_key(&secret, &ephemeral);
        let cipher = XChaCha20Poly1305::new(Key::from_slice(key.as_ref()));
        if let Ok(plain) = cipher.decrypt(nonce, body) {
            return String::from_utf8(plain).map_err(|_| {
                Error::IntegrityFailure("decrypted payload is not valid UTF-8".into())
            });
        }
    }
    if tried == 0 {
        return Err(Error::DecryptFailure(
            "no parseable private key candidates".into(),
        ));
    }
    Err(Error::DecryptFailure(format!(
        "no matching key among {tried} candidate(s)"
    )))
}

/// Is the raw on-disk text an encrypted value? Quote-stripped, trimmed,
/// matched against the magic namespace.
pub fn is_encrypted_value(raw: &str) -> bool {
    strip_quotes(raw.trim()).starts_with(MAGIC_NAMESPACE)
}

fn strip_quotes(s: &str) -> &str {
    if s.len() >= 2
        && ((s.starts_with('"') && s.ends_with('"'))
            || (s.starts_with('\'') && s.ends_with('\'')))
    {
        &s[1..s.len() - 1]
    } else {
        s
    }
}

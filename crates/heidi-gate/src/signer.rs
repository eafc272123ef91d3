//! HMAC-SHA-256 manifest signing.
//!
//! The signature covers the canonical serialization of the manifest, so a
//! verifier re-canonicalizes before checking. Verification is fail-closed:
//! an unreadable or malformed signature refuses the same way a wrong one
//! does.

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

use heidi_types::{KernelError, Manifest};

type HmacSha256 = Hmac<Sha256>;

/// Keyed signing secret plus its derived identifier.
#[derive(Clone)]
pub struct SigningKey {
    secret: Vec<u8>,
    key_id: String,
}

impl std::fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // The secret never appears in Debug output.
        f.debug_struct("SigningKey").field("key_id", &self.key_id).finish()
    }
}

impl SigningKey {
    /// Derive the key id (first 16 hex chars of SHA-256 over the secret).
    pub fn new(secret: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(secret);
        let digest = hex::encode(hasher.finalize());
        Self {
            secret: secret.to_vec(),
            key_id: digest[..16].to_string(),
        }
    }

    /// Read `HEIDI_SIGNING_KEY` if present and non-empty.
    pub fn from_env() -> Option<Self> {
        match std::env::var("HEIDI_SIGNING_KEY") {
            Ok(secret) if !secret.is_empty() => Some(Self::new(secret.as_bytes())),
            _ => None,
        }
    }

    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    fn mac(&self) -> Result<HmacSha256, KernelError> {
        HmacSha256::new_from_slice(&self.secret)
            .map_err(|e| KernelError::SignatureInvalid(format!("bad key material: {e}")))
    }
}

/// Canonicalize and sign a manifest. Returns `(manifest_json, signature)`
/// where the signature is 64 lowercase hex chars over the manifest bytes.
pub fn sign_manifest(manifest: &Manifest, key: &SigningKey) -> Result<(String, String), KernelError> {
    let value = serde_json::to_value(manifest)
        .map_err(|e| KernelError::Canonicalization(e.to_string()))?;
    let canonical = heidi_canonical::to_canonical_string(&value)
        .map_err(|e| KernelError::Canonicalization(e.to_string()))?;

    let mut mac = key.mac()?;
    mac.update(canonical.as_bytes());
    let signature = hex::encode(mac.finalize().into_bytes());
    Ok((canonical, signature))
}

/// Verify a manifest document against its detached signature.
///
/// The document is re-canonicalized first, so cosmetic whitespace cannot
/// change the verdict; anything that fails to parse, canonicalize, or
/// match refuses with `SignatureInvalid`.
pub fn verify_manifest(
    manifest_json: &str,
    signature_hex: &str,
    key: &SigningKey,
) -> Result<Manifest, KernelError> {
    let manifest: Manifest = serde_json::from_str(manifest_json)
        .map_err(|e| KernelError::SignatureInvalid(format!("manifest unreadable: {e}")))?;

    let canonical = heidi_canonical::canonicalize_str(manifest_json)
        .map_err(|e| KernelError::SignatureInvalid(format!("manifest not canonical: {e}")))?;

    let expected = hex::decode(signature_hex.trim())
        .map_err(|e| KernelError::SignatureInvalid(format!("signature not hex: {e}")))?;

    let mut mac = key.mac()?;
    mac.update(canonical.as_bytes());
    mac.verify_slice(&expected)
        .map_err(|_| KernelError::SignatureInvalid("manifest signature mismatch".to_string()))?;

    Ok(manifest)
}

use anyhow::{anyhow, bail, Result};
use constant_time_eq::constant_time_eq;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::AuthError;

pub const MIN_SECRET_LEN: usize = 32;

/// Shared HMAC secret. Construction fails for secrets shorter than
/// [`MIN_SECRET_LEN`] bytes, which the server treats as fatal at startup.
#[derive(Clone)]
pub struct SignatureVerifier {
    mac: Hmac<Sha256>,
}

impl std::fmt::Debug for SignatureVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignatureVerifier")
            .field("mac", &"<redacted>")
            .finish()
    }
}

impl SignatureVerifier {
    pub fn new(secret: impl Into<Vec<u8>>) -> Result<Self> {
        let secret = secret.into();
        if secret.len() < MIN_SECRET_LEN {
            bail!(
                "HMAC secret must be at least {} bytes (got {})",
                MIN_SECRET_LEN,
                secret.len()
            );
        }
        let mac = <Hmac<Sha256> as Mac>::new_from_slice(&secret)
            .map_err(|e| anyhow!("invalid HMAC secret: {e}"))?;
        Ok(Self { mac })
    }

    /// Hex digest a client puts in `X-Signature` for this request.
    pub fn sign(&self, method: &str, path: &str, body: &[u8]) -> String {
        hex::encode(self.digest(method, path, body))
    }

    pub fn verify(
        &self,
        signature: Option<&str>,
        method: &str,
        path: &str,
        body: &[u8],
    ) -> Result<(), AuthError> {
        let sig_header = match signature.map(str::trim) {
            Some(s) if !s.is_empty() => s,
            _ => return Err(AuthError::MissingSignature),
        };
        let sig_hex = sig_header.strip_prefix("sha256=").unwrap_or(sig_header);
        let Ok(expected) = hex::decode(sig_hex) else {
            return Err(AuthError::InvalidSignature);
        };

        let computed = self.digest(method, path, body);
        if expected.len() == computed.len() && constant_time_eq(&computed, &expected) {
            Ok(())
        } else {
            Err(AuthError::InvalidSignature)
        }
    }

    fn digest(&self, method: &str, path: &str, body: &[u8]) -> Vec<u8> {
        let mut mac = self.mac.clone();
        mac.update(&canonical_string(method, path, body));
        mac.finalize().into_bytes().to_vec()
    }
}

/// `METHOD\nPATH\nBODY`, the bytes covered by the request signature.
pub fn canonical_string(method: &str, path: &str, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(method.len() + path.len() + body.len() + 2);
    out.extend_from_slice(method.to_ascii_uppercase().as_bytes());
    out.push(b'\n');
    out.extend_from_slice(path.as_bytes());
    out.push(b'\n');
    out.extend_from_slice(body);
    out
}

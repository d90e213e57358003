//! Typed headers read by the admission handler.

use axum::http::{HeaderName, HeaderValue};
use headers::{Error, Header};

static X_SIGNATURE: HeaderName = HeaderName::from_static("x-signature");
static IDEMPOTENCY_KEY: HeaderName = HeaderName::from_static("idempotency-key");

fn decode_text<'i, I>(values: &mut I) -> Result<String, Error>
where
    I: Iterator<Item = &'i HeaderValue>,
{
    let value = values.next().ok_or_else(Error::invalid)?;
    let text = value.to_str().map_err(|_| Error::invalid())?.trim();
    if text.is_empty() {
        return Err(Error::invalid());
    }
    Ok(text.to_string())
}

fn encode_text<E: Extend<HeaderValue>>(text: &str, values: &mut E) {
    if let Ok(value) = HeaderValue::from_str(text) {
        values.extend(std::iter::once(value));
    }
}

/// `X-Signature`: hex HMAC digest, optionally prefixed with `sha256=`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XSignature(pub String);

impl Header for XSignature {
    fn name() -> &'static HeaderName {
        &X_SIGNATURE
    }

    fn decode<'i, I>(values: &mut I) -> Result<Self, Error>
    where
        I: Iterator<Item = &'i HeaderValue>,
    {
        decode_text(values).map(Self)
    }

    fn encode<E: Extend<HeaderValue>>(&self, values: &mut E) {
        encode_text(&self.0, values);
    }
}

/// `Idempotency-Key`: client-chosen token identifying one logical submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdempotencyKey(pub String);

impl Header for IdempotencyKey {
    fn name() -> &'static HeaderName {
        &IDEMPOTENCY_KEY
    }

    fn decode<'i, I>(values: &mut I) -> Result<Self, Error>
    where
        I: Iterator<Item = &'i HeaderValue>,
    {
        decode_text(values).map(Self)
    }

    fn encode<E: Extend<HeaderValue>>(&self, values: &mut E) {
        encode_text(&self.0, values);
    }
}

//! Compute the `X-Signature` header for a request body, for manual testing.
//! Usage:
//!   cargo run --bin sign_event -- <body.json> [METHOD] [PATH]
//!   echo '{"type":"progression",...}' | cargo run --bin sign_event -- -
//! METHOD defaults to POST and PATH to /check-event.
//! Requires HMAC_SECRET in the environment (.env supported).

use anyhow::{Context, Result};
use dotenvy::dotenv;
use fairgate::models::InboundEvent;
use fairgate::signature::SignatureVerifier;
use std::env;
use std::io::Read;

fn read_body(source: &str) -> Result<Vec<u8>> {
    if source == "-" {
        let mut buf = Vec::new();
        std::io::stdin()
            .read_to_end(&mut buf)
            .context("Failed to read body from stdin")?;
        return Ok(buf);
    }
    std::fs::read(source).with_context(|| format!("Failed to read body from {}", source))
}

fn main() -> Result<()> {
    let _ = dotenv();
    let mut args = env::args().skip(1);
    let source = args
        .next()
        .ok_or_else(|| anyhow::anyhow!("usage: sign_event <body.json|-> [METHOD] [PATH]"))?;
    let method = args.next().unwrap_or_else(|| "POST".to_string());
    let path = args.next().unwrap_or_else(|| "/check-event".to_string());

    let secret = env::var("HMAC_SECRET").context("HMAC_SECRET not set")?;
    let verifier = SignatureVerifier::new(secret)?;
    let body = read_body(&source)?;

    if let Err(e) = InboundEvent::parse(&body) {
        eprintln!("warning: body would be rejected by the server: {}", e);
    }
    println!("sha256={}", verifier.sign(&method, &path, &body));
    Ok(())
}

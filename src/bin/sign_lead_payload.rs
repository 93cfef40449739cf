//! Signs a lead webhook payload file for manual testing.
//!
//! Usage: `sign-lead-payload <payload.json> [sha256|sha384|sha512]`
//!
//! The secret is read from `LEAD_WEBHOOK_SECRET` (a `.env` file is honoured).
//! Prints the value to send in the `X-Hub-Signature-256` header.

use dotenvy::dotenv;
use std::env;

use clinic_lead_intake::signature::{sign, SignatureAlgorithm};

fn main() -> anyhow::Result<()> {
    dotenv().ok();

    let mut args = env::args().skip(1);
    let path = args
        .next()
        .ok_or_else(|| anyhow::anyhow!("usage: sign-lead-payload <payload.json> [algorithm]"))?;
    let algorithm = match args.next() {
        Some(name) => SignatureAlgorithm::parse(&name)
            .ok_or_else(|| anyhow::anyhow!("unsupported algorithm '{}'", name))?,
        None => SignatureAlgorithm::Sha256,
    };

    let secret = env::var("LEAD_WEBHOOK_SECRET")
        .ok()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| anyhow::anyhow!("LEAD_WEBHOOK_SECRET must be set"))?;

    let payload = std::fs::read(&path)
        .map_err(|e| anyhow::anyhow!("cannot read {}: {}", path, e))?;

    println!("{}", sign(&payload, &secret, algorithm));
    Ok(())
}

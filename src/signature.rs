//! Webhook signature verification.
//!
//! Providers sign the exact request body with a shared secret and send the
//! result as `algorithm=hexdigest` (e.g. `sha256=9f86d0...`).

use hmac::{Hmac, Mac};
use sha2::{Sha256, Sha384, Sha512};

/// HMAC algorithms accepted in the signature header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureAlgorithm {
    Sha256,
    Sha384,
    Sha512,
}

impl SignatureAlgorithm {
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "sha256" => Some(SignatureAlgorithm::Sha256),
            "sha384" => Some(SignatureAlgorithm::Sha384),
            "sha512" => Some(SignatureAlgorithm::Sha512),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SignatureAlgorithm::Sha256 => "sha256",
            SignatureAlgorithm::Sha384 => "sha384",
            SignatureAlgorithm::Sha512 => "sha512",
        }
    }
}

/// Why a payload was (or was not) accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Verified,
    /// No secret configured; the event is accepted unverified.
    Skipped,
    Rejected(&'static str),
}

impl Verdict {
    pub fn is_accepted(&self) -> bool {
        !matches!(self, Verdict::Rejected(_))
    }
}

/// Checks inbound payloads against the configured shared secret.
#[derive(Clone)]
pub struct SignatureVerifier {
    secret: Option<String>,
}

impl std::fmt::Debug for SignatureVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignatureVerifier")
            .field("secret", &self.secret.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

impl SignatureVerifier {
    pub fn new(secret: Option<String>) -> Self {
        Self {
            secret: secret.filter(|s| !s.is_empty()),
        }
    }

    pub fn has_secret(&self) -> bool {
        self.secret.is_some()
    }

    /// Boolean authenticity verdict for `payload` given the signature header.
    pub fn verify(&self, payload: &[u8], header: Option<&str>) -> bool {
        self.check(payload, header).is_accepted()
    }

    /// Full verdict, logging every skipped or rejected check.
    pub fn check(&self, payload: &[u8], header: Option<&str>) -> Verdict {
        let Some(secret) = self.secret.as_deref() else {
            tracing::warn!(
                "⚠️  No webhook secret configured - accepting lead payload WITHOUT signature verification"
            );
            return Verdict::Skipped;
        };

        let verdict = match header {
            None => Verdict::Rejected("missing signature header"),
            Some(value) => verify_header(payload, value, secret),
        };

        match &verdict {
            Verdict::Rejected(reason) => tracing::warn!("❌ Lead webhook signature rejected: {}", reason),
            _ => tracing::debug!("✓ Lead webhook signature verified"),
        }
        verdict
    }
}

fn verify_header(payload: &[u8], header: &str, secret: &str) -> Verdict {
    let Some((algorithm, digest)) = header.trim().split_once('=') else {
        return Verdict::Rejected("malformed signature header");
    };
    let Some(algorithm) = SignatureAlgorithm::parse(algorithm) else {
        return Verdict::Rejected("unsupported signature algorithm");
    };
    let Ok(expected) = hex::decode(digest.trim()) else {
        return Verdict::Rejected("signature is not valid hex");
    };

    let Some(mut mac) = KeyedMac::new(algorithm, secret) else {
        return Verdict::Rejected("unusable secret");
    };
    mac.update(payload);

    if mac.verify(&expected) {
        Verdict::Verified
    } else {
        Verdict::Rejected("signature mismatch")
    }
}

/// HMAC state for whichever algorithm the header named.
enum KeyedMac {
    Sha256(Hmac<Sha256>),
    Sha384(Hmac<Sha384>),
    Sha512(Hmac<Sha512>),
}

impl KeyedMac {
    fn new(algorithm: SignatureAlgorithm, secret: &str) -> Option<Self> {
        let key = secret.as_bytes();
        Some(match algorithm {
            SignatureAlgorithm::Sha256 => KeyedMac::Sha256(Hmac::<Sha256>::new_from_slice(key).ok()?),
            SignatureAlgorithm::Sha384 => KeyedMac::Sha384(Hmac::<Sha384>::new_from_slice(key).ok()?),
            SignatureAlgorithm::Sha512 => KeyedMac::Sha512(Hmac::<Sha512>::new_from_slice(key).ok()?),
        })
    }

    fn update(&mut self, data: &[u8]) {
        match self {
            KeyedMac::Sha256(mac) => mac.update(data),
            KeyedMac::Sha384(mac) => mac.update(data),
            KeyedMac::Sha512(mac) => mac.update(data),
        }
    }

    /// Constant-time comparison against the expected tag.
    fn verify(self, expected: &[u8]) -> bool {
        match self {
            KeyedMac::Sha256(mac) => mac.verify_slice(expected).is_ok(),
            KeyedMac::Sha384(mac) => mac.verify_slice(expected).is_ok(),
            KeyedMac::Sha512(mac) => mac.verify_slice(expected).is_ok(),
        }
    }

    fn hex_digest(self) -> String {
        match self {
            KeyedMac::Sha256(mac) => hex::encode(mac.finalize().into_bytes()),
            KeyedMac::Sha384(mac) => hex::encode(mac.finalize().into_bytes()),
            KeyedMac::Sha512(mac) => hex::encode(mac.finalize().into_bytes()),
        }
    }
}

/// Constant-time equality for shared keys sent in the clear (e.g. `google_key`).
pub fn constant_time_compare(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }

    a.as_bytes()
        .iter()
        .zip(b.as_bytes().iter())
        .fold(0u8, |acc, (x, y)| acc | (x ^ y))
        == 0
}

/// Produces a header value (`algorithm=hexdigest`) for `payload`.
pub fn sign(payload: &[u8], secret: &str, algorithm: SignatureAlgorithm) -> String {
    // HMAC accepts keys of any length
    let digest = KeyedMac::new(algorithm, secret)
        .map(|mut mac| {
            mac.update(payload);
            mac.hex_digest()
        })
        .unwrap_or_default();
    format!("{}={}", algorithm.as_str(), digest)
}

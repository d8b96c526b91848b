//! Failure signatures: a category plus a normalized message fingerprint.
//!
//! Signatures are how the kernel recognizes "the same failure again", both
//! for flaky-test detection and for microloop stall detection, and how the
//! detour catalog is matched.

use sha2::{Digest, Sha256};

use crate::core::types::{Concern, Receipt};

const FINGERPRINT_HEX_LEN: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureSignature {
    pub category: String,
    pub fingerprint: String,
    /// Raw text the fingerprint was computed from; used for detour matching.
    pub text: String,
}

impl FailureSignature {
    pub fn new(category: impl Into<String>, text: impl Into<String>) -> Self {
        let text = text.into();
        Self {
            category: category.into(),
            fingerprint: fingerprint(&text),
            text,
        }
    }

    /// Signature of a failed receipt; `None` for succeeded receipts.
    ///
    /// The category is the structured error category when present, else the
    /// receipt status (`failed`, `timeout`, `interrupted`).
    pub fn from_receipt(receipt: &Receipt) -> Option<Self> {
        if receipt.succeeded() {
            return None;
        }
        let category = receipt
            .error
            .as_ref()
            .map(|err| err.category.as_str())
            .unwrap_or_else(|| receipt.status.as_str());
        let text = receipt
            .error
            .as_ref()
            .map(|err| err.message.as_str())
            .filter(|msg| !msg.trim().is_empty())
            .or(receipt.message.as_deref())
            .unwrap_or_default();
        Some(Self::new(category, text))
    }

    /// Signature of a critic pass, derived from its concerns.
    ///
    /// Descriptions are sorted so concern order does not change the
    /// fingerprint.
    pub fn from_concerns(concerns: &[Concern]) -> Self {
        let top = concerns
            .iter()
            .map(|concern| concern.severity)
            .max()
            .map(|severity| severity.as_str())
            .unwrap_or("none");
        let mut descriptions: Vec<&str> = concerns
            .iter()
            .map(|concern| concern.description.as_str())
            .collect();
        descriptions.sort_unstable();
        Self::new(format!("critic/{top}"), descriptions.join("\n"))
    }

    /// Stable comparison key (`category:fingerprint`).
    pub fn key(&self) -> String {
        format!("{}:{}", self.category, self.fingerprint)
    }
}

/// Hash of the normalized message: lowercase, digit runs collapsed to `#`,
/// whitespace collapsed to single spaces.
pub fn fingerprint(text: &str) -> String {
    let normalized = normalize(text);
    let digest = Sha256::digest(normalized.as_bytes());
    let mut encoded = hex::encode(digest);
    encoded.truncate(FINGERPRINT_HEX_LEN);
    encoded
}

fn normalize(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut in_digits = false;
    let mut pending_space = false;
    for ch in text.trim().chars() {
        if ch.is_whitespace() {
            pending_space = true;
            in_digits = false;
            continue;
        }
        if pending_space {
            out.push(' ');
            pending_space = false;
        }
        if ch.is_ascii_digit() {
            if !in_digits {
                out.push('#');
                in_digits = true;
            }
            continue;
        }
        in_digits = false;
        out.extend(ch.to_lowercase());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::Severity;

    #[test]
    fn fingerprint_ignores_numbers_case_and_spacing() {
        assert_eq!(
            fingerprint("Test foo failed after 120 ms"),
            fingerprint("test   FOO failed after 7 ms")
        );
        assert_ne!(fingerprint("test foo failed"), fingerprint("test bar failed"));
    }

    #[test]
    fn concern_signature_is_order_independent() {
        let a = vec![
            Concern::new(Severity::High, "missing error handling"),
            Concern::new(Severity::Low, "naming"),
        ];
        let b = vec![a[1].clone(), a[0].clone()];
        let sig_a = FailureSignature::from_concerns(&a);
        let sig_b = FailureSignature::from_concerns(&b);
        assert_eq!(sig_a.key(), sig_b.key());
        assert_eq!(sig_a.category, "critic/high");
    }
}

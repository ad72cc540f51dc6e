//! Consent-phrase confirmation.
//!
//! Exact equality after normalization (trim + Unicode lowercase); no
//! fuzzy matching, so the evidentiary bar stays unambiguous.

/// Normalizes a phrase for comparison.
#[must_use]
pub fn normalize(phrase: &str) -> String {
    phrase.trim().to_lowercase()
}

/// Returns `true` if `submitted` matches `required` after
/// normalization.
#[must_use]
pub fn matches_required(submitted: &str, required: &str) -> bool {
    normalize(submitted) == normalize(required)
}

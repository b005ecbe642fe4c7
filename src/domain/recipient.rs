//! Recipient identifiers and their normalization.
//!
//! A recipient arrives as free text (`"+44 (0)7700-900123"`, `"0044..."`, ...)
//! and is reduced to a canonical `+`-prefixed digit string that every identity
//! comparison and persistence lookup keys on.
//!
//! One format rule is used at every layer: `^\+\d{7,15}$`. The classifier, the
//! dispatcher's re-validation and the transport all go through
//! [`is_format_valid`], so a number accepted at one layer is never rejected at
//! another.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Minimum number of digits after the leading `+`.
pub const MIN_DIGITS: usize = 7;

/// Maximum number of digits after the leading `+` (E.164 upper bound).
pub const MAX_DIGITS: usize = 15;

/// Stripped values at least this long get a `+` prepended when they have none.
const IMPLICIT_PLUS_MIN_LEN: usize = 10;

/// Reduce a raw identifier to its canonical form.
///
/// Strips everything except ASCII digits and `+`. Without a leading `+`, a
/// leading `00` international prefix becomes `+`; otherwise values of ten or
/// more characters get a `+` prepended; shorter values are left unprefixed and
/// will fail [`is_format_valid`].
///
/// Deterministic and idempotent: a value that already starts with `+` is
/// returned unchanged, and every branch that does not return early produces a
/// `+`-prefixed value or one that is stable under stripping.
pub fn normalize(raw: &str) -> String {
    let stripped: String = raw
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '+')
        .collect();

    if stripped.starts_with('+') {
        return stripped;
    }

    if let Some(rest) = stripped.strip_prefix("00") {
        return format!("+{rest}");
    }

    if stripped.len() >= IMPLICIT_PLUS_MIN_LEN {
        return format!("+{stripped}");
    }

    stripped
}

/// Tests `^\+\d{7,15}$`.
pub fn is_format_valid(candidate: &str) -> bool {
    match candidate.strip_prefix('+') {
        Some(digits) => {
            (MIN_DIGITS..=MAX_DIGITS).contains(&digits.len())
                && digits.bytes().all(|b| b.is_ascii_digit())
        }
        None => false,
    }
}

/// A raw identifier that does not normalize to a valid canonical form.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Invalid phone number format: '{raw}' (normalized to '{normalized}')")]
pub struct FormatError {
    pub raw: String,
    pub normalized: String,
}

/// A normalized, validated recipient identifier.
///
/// The inner string always satisfies [`is_format_valid`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CanonicalIdentifier(String);

impl CanonicalIdentifier {
    /// Normalize `raw` and validate the result.
    pub fn parse(raw: &str) -> Result<Self, FormatError> {
        let normalized = normalize(raw);
        if is_format_valid(&normalized) {
            Ok(Self(normalized))
        } else {
            Err(FormatError {
                raw: raw.to_string(),
                normalized,
            })
        }
    }

    /// Validate a value that should already be canonical, without normalizing it.
    pub fn try_from_canonical(value: &str) -> Result<Self, FormatError> {
        if is_format_valid(value) {
            Ok(Self(value.to_string()))
        } else {
            Err(FormatError {
                raw: value.to_string(),
                normalized: value.to_string(),
            })
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl std::ops::Deref for CanonicalIdentifier {
    type Target = str;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl AsRef<str> for CanonicalIdentifier {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CanonicalIdentifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for CanonicalIdentifier {
    type Error = FormatError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        if is_format_valid(&value) {
            Ok(Self(value))
        } else {
            Err(FormatError {
                normalized: value.clone(),
                raw: value,
            })
        }
    }
}

impl From<CanonicalIdentifier> for String {
    fn from(id: CanonicalIdentifier) -> Self {
        id.0
    }
}

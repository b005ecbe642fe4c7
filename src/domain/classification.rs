//! Classification results for a raw recipient batch.

use serde::Serialize;

use super::recipient::CanonicalIdentifier;

/// Resolution of one distinct raw value within a batch.
///
/// Computed once per unique raw value, then applied to every occurrence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationOutcome {
    pub raw: String,
    /// Normalized form, whether or not it passed validation
    pub canonical: String,
    pub format_valid: bool,
    /// True only when the store already knows this canonical value.
    /// Repetition inside the batch does not set this.
    pub persisted_duplicate: bool,
    pub error: Option<String>,
}

/// Partition of a raw batch into invalid / duplicate / new occurrences.
///
/// The three per-occurrence lists hold raw values in input order and together
/// cover every occurrence exactly once. The summary sets are deduplicated and
/// keep first-seen order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ClassificationResult {
    pub total_input: usize,

    /// Raw values that failed format validation, per occurrence
    pub invalid: Vec<String>,
    /// Raw values whose canonical form is already persisted, per occurrence
    pub duplicate_occurrences: Vec<String>,
    /// Raw values whose canonical form is not yet persisted, per occurrence
    pub new_occurrences: Vec<String>,

    pub unique_input: Vec<String>,
    /// Every raw value occurring more than once, with full multiplicity
    pub intra_batch_repeats: Vec<String>,
    pub persisted_duplicates: Vec<CanonicalIdentifier>,
    pub unique_new: Vec<CanonicalIdentifier>,

    /// One outcome per entry of `unique_input`, same order
    pub outcomes: Vec<ValidationOutcome>,
}

impl ClassificationResult {
    /// Checks that every occurrence landed in exactly one bucket.
    pub fn is_partition_complete(&self) -> bool {
        self.invalid.len() + self.duplicate_occurrences.len() + self.new_occurrences.len()
            == self.total_input
    }

    /// True when either duplicate signal is present.
    ///
    /// The two signals stay separate in the result; this is for calling layers
    /// that ask the user to confirm before sending to "duplicates" of any kind.
    pub fn requires_confirmation(&self) -> bool {
        !self.persisted_duplicates.is_empty() || !self.intra_batch_repeats.is_empty()
    }

    /// Canonical values flagged by either signal, deduplicated in first-seen order.
    ///
    /// Intra-batch repeats that fail validation are not included.
    pub fn merged_duplicates(&self) -> Vec<CanonicalIdentifier> {
        let mut merged = self.persisted_duplicates.clone();
        for raw in &self.intra_batch_repeats {
            if let Ok(id) = CanonicalIdentifier::parse(raw)
                && !merged.contains(&id)
            {
                merged.push(id);
            }
        }
        merged
    }
}

//! Batch classification against recipient history.

use std::collections::HashMap;

use crate::domain::classification::{ClassificationResult, ValidationOutcome};
use crate::domain::recipient::{CanonicalIdentifier, FormatError, is_format_valid, normalize};
use crate::error::Result;
use crate::store::RecipientStore;

/// Partition `raw_batch` into invalid, already-persisted and new occurrences.
///
/// Each distinct raw value is resolved once (normalize, validate, one store
/// lookup when valid) and the resolution is then applied to every occurrence in
/// input order. Distinct raw values that normalize to the same canonical form
/// share a single lookup.
///
/// # Errors
///
/// Returns [`VolleyError::Persistence`](crate::VolleyError::Persistence) if any
/// lookup fails. No partial result is produced; retry the whole batch.
#[tracing::instrument(skip(raw_batch, store), fields(total_input = raw_batch.len()))]
pub async fn classify<S>(raw_batch: &[String], store: &S) -> Result<ClassificationResult>
where
    S: RecipientStore + ?Sized,
{
    let mut counts: HashMap<&str, usize> = HashMap::new();
    let mut unique_input: Vec<String> = Vec::new();
    for raw in raw_batch {
        let count = counts.entry(raw.as_str()).or_insert(0);
        if *count == 0 {
            unique_input.push(raw.clone());
        }
        *count += 1;
    }

    let mut intra_batch_repeats = Vec::new();
    for raw in &unique_input {
        let count = counts.get(raw.as_str()).copied().unwrap_or(0);
        if count > 1 {
            intra_batch_repeats.extend(std::iter::repeat_n(raw.clone(), count));
        }
    }

    let mut persisted_by_canonical: HashMap<String, bool> = HashMap::new();
    let mut resolved: HashMap<&str, ValidationOutcome> = HashMap::with_capacity(unique_input.len());
    let mut outcomes = Vec::with_capacity(unique_input.len());

    for raw in &unique_input {
        let canonical = normalize(raw);
        let outcome = if is_format_valid(&canonical) {
            let persisted = match persisted_by_canonical.get(&canonical) {
                Some(&persisted) => persisted,
                None => {
                    let id = CanonicalIdentifier::try_from_canonical(&canonical)
                        .map_err(anyhow::Error::from)?;
                    let persisted = store.exists_by_canonical(&id).await?.is_some();
                    persisted_by_canonical.insert(canonical.clone(), persisted);
                    persisted
                }
            };
            ValidationOutcome {
                raw: raw.clone(),
                canonical,
                format_valid: true,
                persisted_duplicate: persisted,
                error: None,
            }
        } else {
            let error = FormatError {
                raw: raw.clone(),
                normalized: canonical.clone(),
            };
            ValidationOutcome {
                raw: raw.clone(),
                error: Some(error.to_string()),
                canonical,
                format_valid: false,
                persisted_duplicate: false,
            }
        };
        resolved.insert(raw.as_str(), outcome.clone());
        outcomes.push(outcome);
    }

    let mut result = ClassificationResult {
        total_input: raw_batch.len(),
        unique_input: unique_input.clone(),
        intra_batch_repeats,
        ..Default::default()
    };

    for raw in raw_batch {
        let Some(outcome) = resolved.get(raw.as_str()) else {
            continue;
        };
        if !outcome.format_valid {
            result.invalid.push(raw.clone());
            continue;
        }
        let id = CanonicalIdentifier::try_from_canonical(&outcome.canonical)
            .map_err(anyhow::Error::from)?;
        if outcome.persisted_duplicate {
            result.duplicate_occurrences.push(raw.clone());
            if !result.persisted_duplicates.contains(&id) {
                result.persisted_duplicates.push(id);
            }
        } else {
            result.new_occurrences.push(raw.clone());
            if !result.unique_new.contains(&id) {
                result.unique_new.push(id);
            }
        }
    }
    result.outcomes = outcomes;

    tracing::debug!(
        unique = result.unique_input.len(),
        invalid = result.invalid.len(),
        duplicates = result.duplicate_occurrences.len(),
        new = result.new_occurrences.len(),
        "Classified recipient batch"
    );

    Ok(result)
}

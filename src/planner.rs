//! Splits a recipient set into provider-sized dispatch groups.

use crate::model::RecipientSet;

/// Chunk `recipients` into contiguous groups of at most `max_group_size`,
/// preserving input order and performing no transformation. An empty set
/// yields an empty plan, which callers treat as "nothing to submit".
///
/// `max_group_size` comes from the provider's published limit; passing zero
/// is a programming error.
pub fn plan(recipients: &RecipientSet, max_group_size: usize) -> Vec<RecipientSet> {
    assert!(max_group_size >= 1, "max_group_size must be at least 1");
    recipients
        .as_slice()
        .chunks(max_group_size)
        .map(|chunk| RecipientSet::new(chunk.iter().cloned()))
        .collect()
}

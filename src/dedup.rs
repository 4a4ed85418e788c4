//! Deduplication of note records fetched from the HAT.
//!
//! The HAT can hold several copies of the same note (re-posted after a failed
//! acknowledgement, or edited on another device). Merging runs two passes:
//!
//! 1. [`collapse_duplicates`] drops exact copies, keyed by
//!    `(created_at, message)`, first seen wins.
//! 2. [`resolve_conflicts`] keeps only the most recently updated record among
//!    records sharing `created_at`, regardless of message.
//!
//! The second key is looser than the first: two distinct notes created in the
//! same instant are treated as versions of one note and only the newer
//! survives.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};

use crate::models::NoteRecord;

/// Drop later records sharing an earlier record's `(created_at, message)`.
pub fn collapse_duplicates(records: Vec<NoteRecord>) -> Vec<NoteRecord> {
    let mut seen: HashSet<(DateTime<Utc>, String)> = HashSet::new();
    let mut result = Vec::with_capacity(records.len());

    for record in records {
        if seen.insert((record.created_at, record.message.clone())) {
            result.push(record);
        }
    }

    result
}

/// Among records with the same `created_at`, keep those with the largest
/// `last_local_update`.
///
/// A pair only conflicts when `last_local_update` differs, so ties survive
/// together. Keeping the per-`created_at` maximum is the fixed point of
/// removing the older side of every conflicting pair, and does not depend on
/// input order. Relative order of survivors is preserved.
pub fn resolve_conflicts(records: Vec<NoteRecord>) -> Vec<NoteRecord> {
    let mut newest: HashMap<DateTime<Utc>, DateTime<Utc>> = HashMap::new();
    for record in &records {
        newest
            .entry(record.created_at)
            .and_modify(|latest| {
                if record.last_local_update > *latest {
                    *latest = record.last_local_update;
                }
            })
            .or_insert(record.last_local_update);
    }

    records
        .into_iter()
        .filter(|r| newest.get(&r.created_at) == Some(&r.last_local_update))
        .collect()
}

/// Sort by `updated_at`, most recent first. Stable for equal timestamps.
pub fn sort_by_updated(mut records: Vec<NoteRecord>) -> Vec<NoteRecord> {
    records.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
    records
}

/// Collapse, resolve, then sort.
pub fn merge(records: Vec<NoteRecord>) -> Vec<NoteRecord> {
    let before = records.len();
    let merged = sort_by_updated(resolve_conflicts(collapse_duplicates(records)));
    if merged.len() != before {
        tracing::debug!(before, after = merged.len(), "Merged duplicate notes");
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NoteKind;
    use chrono::TimeZone;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn note(id: i64, created: i64, message: &str, updated: i64, last_local: i64) -> NoteRecord {
        NoteRecord {
            id: Some(id),
            local_id: None,
            message: message.to_string(),
            kind: NoteKind::Note,
            created_at: ts(created),
            updated_at: ts(updated),
            last_local_update: ts(last_local),
            shared_on: String::new(),
            shared: false,
            public_until: None,
            attachments: Default::default(),
        }
    }

    fn ids(records: &[NoteRecord]) -> Vec<i64> {
        records.iter().filter_map(|r| r.id).collect()
    }

    #[test]
    fn test_collapse_first_seen_wins() {
        let records = vec![
            note(1, 0, "x", 1, 1),
            note(2, 0, "x", 2, 2),
            note(3, 0, "y", 1, 1),
        ];
        let collapsed = collapse_duplicates(records);
        assert_eq!(ids(&collapsed), vec![1, 3]);
    }

    #[test]
    fn test_collapse_keeps_distinct_messages_and_times() {
        let records = vec![
            note(1, 0, "x", 1, 1),
            note(2, 1, "x", 1, 1),
            note(3, 0, "y", 1, 1),
        ];
        assert_eq!(collapse_duplicates(records).len(), 3);
    }

    #[test]
    fn test_resolve_keeps_newest_last_update() {
        let records = vec![
            note(1, 0, "draft", 1, 1),
            note(2, 0, "final", 5, 5),
            note(3, 10, "other", 2, 2),
        ];
        let resolved = resolve_conflicts(records);
        assert_eq!(ids(&resolved), vec![2, 3]);
    }

    #[test]
    fn test_resolve_is_order_independent() {
        let a = note(1, 0, "a", 1, 1);
        let b = note(2, 0, "b", 3, 3);
        let c = note(3, 0, "c", 2, 2);

        let forward = resolve_conflicts(vec![a.clone(), b.clone(), c.clone()]);
        let backward = resolve_conflicts(vec![c, b, a]);
        assert_eq!(ids(&forward), vec![2]);
        assert_eq!(ids(&backward), vec![2]);
    }

    #[test]
    fn test_resolve_ties_survive() {
        let records = vec![note(1, 0, "a", 1, 4), note(2, 0, "b", 1, 4)];
        assert_eq!(resolve_conflicts(records).len(), 2);
    }

    #[test]
    fn test_merge_sorted_by_updated_desc() {
        let records = vec![
            note(1, 0, "a", 5, 5),
            note(2, 100, "b", 50, 50),
            note(3, 200, "c", 20, 20),
        ];
        let merged = merge(records);
        assert_eq!(ids(&merged), vec![2, 3, 1]);
        assert!(merged
            .windows(2)
            .all(|w| w[0].updated_at >= w[1].updated_at));
    }

    #[test]
    fn test_merge_is_idempotent() {
        let records = vec![
            note(1, 0, "x", 1, 1),
            note(2, 0, "x", 2, 2),
            note(3, 0, "y", 3, 3),
            note(4, 50, "z", 9, 9),
            note(5, 50, "z", 9, 9),
            note(6, 70, "w", 4, 4),
        ];
        let once = merge(records);
        let twice = merge(once.clone());
        assert_eq!(once, twice);
    }

    #[test]
    fn test_merge_never_returns_duplicate_keys() {
        let records = vec![
            note(1, 0, "x", 1, 1),
            note(2, 0, "x", 1, 1),
            note(3, 5, "x", 1, 1),
            note(4, 5, "x", 2, 2),
        ];
        let merged = merge(records);
        let keys: HashSet<_> = merged.iter().map(|r| r.dedup_key()).collect();
        assert_eq!(keys.len(), merged.len());
    }

    #[test]
    fn test_same_instant_scenario() {
        // A and B are the same logical note; C shares only the timestamp.
        let a = note(1, 0, "x", 1, 1);
        let b = note(2, 0, "x", 2, 2);
        let c = note(3, 0, "y", 1, 1);

        // Collapse drops B because A was seen first. A and C then tie on
        // last_local_update, so neither conflicts and both survive.
        let merged = merge(vec![a.clone(), b.clone(), c.clone()]);
        assert_eq!(ids(&merged), vec![1, 3]);

        // With B first, B survives collapse and its newer update evicts C,
        // the distinct note created in the same instant.
        let merged = merge(vec![b, a, c]);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].id, Some(2));
        assert_eq!(merged[0].message, "x");
    }

    #[test]
    fn test_distinct_note_created_same_instant_is_dropped() {
        let older = note(1, 0, "groceries", 1, 1);
        let newer_other = note(2, 0, "meeting notes", 3, 3);
        let merged = merge(vec![older, newer_other]);
        assert_eq!(ids(&merged), vec![2]);
    }

    #[test]
    fn test_empty_input() {
        assert!(merge(Vec::new()).is_empty());
    }
}

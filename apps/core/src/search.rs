use std::cmp::Ordering;

use crate::model::{fold_case, ApplicationRecord};
use crate::registry::Snapshot;

pub const OTHER_BUCKET: &str = "#";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LetterGroup {
    pub letter: String,
    pub records: Vec<ApplicationRecord>,
}

/// Case-insensitive substring match on display names, in snapshot order.
pub fn filter(snapshot: &Snapshot, query: &str, pinned_only: bool) -> Vec<ApplicationRecord> {
    let needle = fold_case(query);
    snapshot
        .records()
        .iter()
        .filter(|record| !pinned_only || record.pinned)
        .filter(|record| needle.is_empty() || record.folded_name().contains(&needle))
        .cloned()
        .collect()
}

pub fn bucket_for(display_name: &str) -> String {
    match display_name.trim_start().chars().next() {
        Some(first) if first.is_alphabetic() => first.to_uppercase().collect(),
        _ => OTHER_BUCKET.to_string(),
    }
}

/// Buckets an already sorted sequence by first letter. Record order inside a
/// bucket is the input order.
pub fn group_by_letter(records: &[ApplicationRecord]) -> Vec<LetterGroup> {
    let mut groups: Vec<LetterGroup> = Vec::new();
    for record in records {
        let letter = bucket_for(record.display_name());
        match groups.iter_mut().find(|group| group.letter == letter) {
            Some(group) => group.records.push(record.clone()),
            None => groups.push(LetterGroup {
                letter,
                records: vec![record.clone()],
            }),
        }
    }
    groups.sort_by(|left, right| compare_buckets(&left.letter, &right.letter));
    groups
}

fn bucket_rank(letter: &str) -> (u8, &str) {
    if letter == OTHER_BUCKET {
        (2, letter)
    } else if letter.chars().all(|c| c.is_ascii_uppercase()) {
        (0, letter)
    } else {
        (1, letter)
    }
}

fn compare_buckets(left: &str, right: &str) -> Ordering {
    bucket_rank(left).cmp(&bucket_rank(right))
}

/// Row offset of each group header once groups are flattened into
/// header, rows, header, rows...
pub fn letter_positions(groups: &[LetterGroup]) -> Vec<(String, usize)> {
    let mut offset = 0;
    groups
        .iter()
        .map(|group| {
            let position = (group.letter.clone(), offset);
            offset += 1 + group.records.len();
            position
        })
        .collect()
}

/// Derived view over registry snapshots. The only state is the last query,
/// kept so a view can echo it back.
#[derive(Debug, Clone, Default)]
pub struct SearchIndex {
    query: String,
}

impl SearchIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_query(&mut self, query: &str) {
        self.query = query.to_string();
    }

    pub fn query(&self) -> &str {
        &self.query
    }

    pub fn filtered(&self, snapshot: &Snapshot, pinned_only: bool) -> Vec<ApplicationRecord> {
        filter(snapshot, &self.query, pinned_only)
    }

    pub fn grouped(&self, snapshot: &Snapshot) -> Vec<LetterGroup> {
        group_by_letter(&self.filtered(snapshot, false))
    }
}

// src/plan.rs

//! Global replay order across all items
//!
//! Every persisted revision of every item goes into one queue ordered by
//! timestamp, then origin id, then revision index. Replaying in this order
//! applies each item's revisions in sequence while interleaving items by true
//! chronology, so a link's target usually exists by the time the link is added.

use crate::journal::Journal;
use crate::model::{WiItem, WiRevision};
use std::collections::{HashSet, VecDeque};
use std::fmt;

/// One revision awaiting replay
#[derive(Debug, Clone)]
pub struct ExecutionItem {
    pub origin_id: String,
    pub revision: WiRevision,
    /// Target id known for the item, if it has been created
    pub wi_id: Option<i64>,
    /// Target type used when the item must be created
    pub wi_type: String,
}

impl fmt::Display for ExecutionItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.wi_id {
            Some(id) => write!(f, "{}/{}, {}", self.origin_id, id, self.revision.index),
            None => write!(f, "{}/(n/a), {}", self.origin_id, self.revision.index),
        }
    }
}

/// Time-ordered queue of revisions
#[derive(Debug, Default)]
pub struct ExecutionPlan {
    queue: VecDeque<ExecutionItem>,
    item_count: usize,
    revision_count: usize,
}

impl ExecutionPlan {
    /// Flatten and order the revisions of `items`
    pub fn build(items: Vec<WiItem>) -> Self {
        let item_count = items
            .iter()
            .map(|i| i.origin_id.as_str())
            .collect::<HashSet<_>>()
            .len();

        let mut entries: Vec<ExecutionItem> = Vec::new();
        for item in items {
            let wi_type = item.wi_type.clone();
            let wi_id = item.wi_id;
            for mut revision in item.revisions {
                revision.parent_origin_id = item.origin_id.clone();
                entries.push(ExecutionItem {
                    origin_id: item.origin_id.clone(),
                    revision,
                    wi_id,
                    wi_type: wi_type.clone(),
                });
            }
        }

        entries.sort_by(|a, b| {
            a.revision
                .time
                .cmp(&b.revision.time)
                .then_with(|| a.origin_id.cmp(&b.origin_id))
                .then_with(|| a.revision.index.cmp(&b.revision.index))
        });

        Self {
            revision_count: entries.len(),
            queue: entries.into(),
            item_count,
        }
    }

    /// Pop the next revision, refreshing its target id from the journal
    pub fn try_pop(&mut self, journal: &Journal) -> Option<ExecutionItem> {
        let mut next = self.queue.pop_front()?;
        if let Some(id) = journal.get_migrated_id(&next.origin_id) {
            next.wi_id = Some(id);
        }
        Some(next)
    }

    /// Distinct items in the plan
    pub fn item_count(&self) -> usize {
        self.item_count
    }

    /// Revisions in the plan when it was built
    pub fn revision_count(&self) -> usize {
        self.revision_count
    }

    /// Revisions not yet popped
    pub fn remaining(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use tempfile::TempDir;

    fn t(ms: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap() + Duration::milliseconds(ms)
    }

    fn item(origin: &str, times: &[i64]) -> WiItem {
        let mut item = WiItem::new(origin, "Task");
        for (index, ms) in times.iter().enumerate() {
            item.revisions.push(WiRevision::new(index, t(*ms), "a"));
        }
        item
    }

    fn order(plan: &mut ExecutionPlan, journal: &Journal) -> Vec<(String, usize)> {
        std::iter::from_fn(|| plan.try_pop(journal))
            .map(|e| (e.origin_id, e.revision.index))
            .collect()
    }

    #[test]
    fn test_global_time_order_with_origin_tiebreak() {
        let temp = TempDir::new().unwrap();
        let journal = Journal::open(temp.path(), false).unwrap();

        let mut plan = ExecutionPlan::build(vec![
            item("PRJ-2", &[0, 100]),
            item("PRJ-1", &[0, 50, 200]),
        ]);
        assert_eq!(plan.item_count(), 2);
        assert_eq!(plan.revision_count(), 5);

        assert_eq!(
            order(&mut plan, &journal),
            vec![
                ("PRJ-1".to_string(), 0),
                ("PRJ-2".to_string(), 0),
                ("PRJ-1".to_string(), 1),
                ("PRJ-2".to_string(), 1),
                ("PRJ-1".to_string(), 2),
            ]
        );
        assert!(plan.is_empty());
    }

    #[test]
    fn test_spaced_duplicate_timestamps_keep_relative_order() {
        let temp = TempDir::new().unwrap();
        let journal = Journal::open(temp.path(), false).unwrap();

        // Two changes at T were spaced to T and T+50ms when the history was built
        let mut plan = ExecutionPlan::build(vec![item("PRJ-9", &[1000, 1050]), item("PRJ-1", &[1025])]);
        assert_eq!(
            order(&mut plan, &journal),
            vec![
                ("PRJ-9".to_string(), 0),
                ("PRJ-1".to_string(), 0),
                ("PRJ-9".to_string(), 1),
            ]
        );
    }

    #[test]
    fn test_pop_refreshes_target_id() {
        let temp = TempDir::new().unwrap();
        let mut journal = Journal::open(temp.path(), false).unwrap();

        let mut plan = ExecutionPlan::build(vec![item("PRJ-1", &[0, 50])]);
        let first = plan.try_pop(&journal).unwrap();
        assert_eq!(first.wi_id, None);
        assert_eq!(first.to_string(), "PRJ-1/(n/a), 0");

        journal.mark_rev_processed("PRJ-1", 77, 0).unwrap();
        let second = plan.try_pop(&journal).unwrap();
        assert_eq!(second.wi_id, Some(77));
        assert_eq!(plan.remaining(), 0);
    }
}

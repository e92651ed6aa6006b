//! Work queue model and severity-ranked selection.
//!
//! The queue file itself is handled by [`crate::io::queue`]; this module only
//! decides which item runs next.

use serde::{Deserialize, Serialize};

/// A harvested unit of future work.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkItem {
    pub title: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub severity: String,
    pub source: String,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub evidence: Option<String>,
    /// `*` or empty matches any repo filter; anything else must match exactly.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_repo: Option<String>,
}

/// One line of `next-work.jsonl`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueEntry {
    pub source_epic: String,
    pub timestamp: String,
    pub items: Vec<WorkItem>,
    pub consumed: bool,
    pub consumed_by: Option<String>,
    pub consumed_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<String>,
}

impl QueueEntry {
    /// Untouched entries with at least one item are eligible for selection.
    pub fn is_selectable(&self) -> bool {
        !self.consumed && self.failed_at.is_none() && !self.items.is_empty()
    }
}

/// An entry paired with its position among the parseable lines of the file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexedEntry {
    pub index: usize,
    pub entry: QueueEntry,
}

/// The item chosen for the next cycle and the entry it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSelection {
    pub item: WorkItem,
    pub entry_index: usize,
}

/// Rank used for ordering. Matching is exact; anything else sorts last.
pub fn severity_rank(severity: &str) -> u8 {
    match severity {
        "high" => 3,
        "medium" => 2,
        "low" => 1,
        _ => 0,
    }
}

/// Whether an item may run in a repo selected by `repo_filter`.
pub fn matches_repo_filter(item: &WorkItem, repo_filter: &str) -> bool {
    if repo_filter.is_empty() {
        return true;
    }
    match item.target_repo.as_deref().map(str::trim) {
        None | Some("") | Some("*") => true,
        Some(target) => target == repo_filter,
    }
}

/// Pick the highest-severity eligible item across all entries.
///
/// Ties keep input order (entry order, then item order within the entry).
pub fn select_highest_severity(entries: &[IndexedEntry], repo_filter: &str) -> Option<QueueSelection> {
    let mut candidates: Vec<QueueSelection> = entries
        .iter()
        .flat_map(|indexed| {
            indexed
                .entry
                .items
                .iter()
                .filter(|item| matches_repo_filter(item, repo_filter))
                .map(|item| QueueSelection {
                    item: item.clone(),
                    entry_index: indexed.index,
                })
        })
        .collect();

    // `sort_by` is stable.
    candidates.sort_by(|a, b| severity_rank(&b.item.severity).cmp(&severity_rank(&a.item.severity)));
    candidates.into_iter().next()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(title: &str, severity: &str, target: Option<&str>) -> WorkItem {
        WorkItem {
            title: title.to_string(),
            severity: severity.to_string(),
            target_repo: target.map(str::to_string),
            ..WorkItem::default()
        }
    }

    fn indexed(index: usize, items: Vec<WorkItem>) -> IndexedEntry {
        IndexedEntry {
            index,
            entry: QueueEntry {
                items,
                ..QueueEntry::default()
            },
        }
    }

    #[test]
    fn picks_high_regardless_of_position() {
        let orders = [
            vec!["low", "high", "medium"],
            vec!["high", "medium", "low"],
            vec!["medium", "low", "high"],
        ];
        for order in orders {
            let items = order.iter().map(|sev| item(sev, sev, None)).collect();
            let selected = select_highest_severity(&[indexed(0, items)], "").expect("selection");
            assert_eq!(selected.item.severity, "high");
        }
    }

    #[test]
    fn ties_keep_input_order_across_entries() {
        let entries = vec![
            indexed(0, vec![item("first", "medium", None)]),
            indexed(3, vec![item("second", "medium", None)]),
        ];
        let selected = select_highest_severity(&entries, "").expect("selection");
        assert_eq!(selected.item.title, "first");
        assert_eq!(selected.entry_index, 0);
    }

    #[test]
    fn unranked_severity_loses_to_low() {
        let entries = vec![indexed(
            1,
            vec![item("odd", "critical", None), item("low", "low", None)],
        )];
        let selected = select_highest_severity(&entries, "").expect("selection");
        assert_eq!(selected.item.title, "low");
        assert_eq!(selected.entry_index, 1);
    }

    #[test]
    fn severity_matching_is_exact() {
        assert_eq!(severity_rank("high"), 3);
        assert_eq!(severity_rank("High"), 0);
        assert_eq!(severity_rank(" low"), 0);
        let entries = vec![indexed(
            0,
            vec![item("shouty", "HIGH", None), item("quiet", "low", None)],
        )];
        let selected = select_highest_severity(&entries, "").expect("selection");
        assert_eq!(selected.item.title, "quiet");
    }

    #[test]
    fn repo_filter_rules() {
        let wildcard = item("w", "low", Some("*"));
        let legacy = item("l", "low", None);
        let empty = item("e", "low", Some(""));
        let pinned = item("p", "low", Some("agentops"));

        for filter in ["", "agentops", "other"] {
            assert!(matches_repo_filter(&wildcard, filter));
            assert!(matches_repo_filter(&legacy, filter));
            assert!(matches_repo_filter(&empty, filter));
        }
        assert!(matches_repo_filter(&pinned, ""));
        assert!(matches_repo_filter(&pinned, "agentops"));
        assert!(!matches_repo_filter(&pinned, "other"));
    }

    #[test]
    fn filtered_out_items_yield_no_selection() {
        let entries = vec![indexed(0, vec![item("p", "high", Some("elsewhere"))])];
        assert!(select_highest_severity(&entries, "here").is_none());
        assert!(select_highest_severity(&[], "").is_none());
    }
}

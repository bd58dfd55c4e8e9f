//! EventCategory - 待機理由 / イベント種別
//!
//! A blocked task parks under exactly one category. A finished operation
//! fires a set of categories that wake the tasks parked under them.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventCategory {
    /// An entry became available (write, rolled-back take).
    Insert,
    /// An entry went away (take, delete), freeing capacity.
    Remove,
    /// A lock held until the end of a transaction was released.
    UnlockLongTerm,
    /// A lock held until the end of a sub-transaction was released.
    UnlockShortTerm,
}

impl EventCategory {
    pub const ALL: [EventCategory; 4] = [
        EventCategory::Insert,
        EventCategory::Remove,
        EventCategory::UnlockLongTerm,
        EventCategory::UnlockShortTerm,
    ];

    /// Rollback wakes everybody for unlock categories, only the same
    /// transaction for entry categories.
    pub fn rollback_wakes_all(self) -> bool {
        matches!(
            self,
            EventCategory::UnlockLongTerm | EventCategory::UnlockShortTerm
        )
    }
}

/// Merges categories into `into` keeping first-seen order and no duplicates.
pub fn merge_categories(into: &mut Vec<EventCategory>, more: &[EventCategory]) {
    for category in more {
        if !into.contains(category) {
            into.push(*category);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unlock_categories_wake_all_on_rollback() {
        assert!(!EventCategory::Insert.rollback_wakes_all());
        assert!(!EventCategory::Remove.rollback_wakes_all());
        assert!(EventCategory::UnlockLongTerm.rollback_wakes_all());
        assert!(EventCategory::UnlockShortTerm.rollback_wakes_all());
    }

    #[test]
    fn merge_keeps_order_and_drops_duplicates() {
        let mut categories = vec![EventCategory::Remove];
        merge_categories(
            &mut categories,
            &[EventCategory::UnlockShortTerm, EventCategory::Remove],
        );
        assert_eq!(
            categories,
            vec![EventCategory::Remove, EventCategory::UnlockShortTerm]
        );
    }

    #[test]
    fn serialized_names_are_screaming_case() {
        let json = serde_json::to_string(&EventCategory::UnlockLongTerm).unwrap();
        assert_eq!(json, "\"UNLOCK_LONG_TERM\"");
    }
}

//! Status - ランタイムの状態スナップショット
//!
//! 詰まりの調査用。値は取得時点のもので、各カウンタは別々に読むため厳密に一貫してはいない。

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeStats {
    /// Jobs waiting for a worker.
    pub queued: usize,
    /// Tasks parked in the wait store.
    pub parked: usize,
    /// Open explicit transactions.
    pub open_transactions: usize,
    pub pending_request_timeouts: usize,
    pub pending_transaction_timeouts: usize,
    /// Submitted requests whose caller still waits for an answer.
    pub awaiting_answers: usize,
    /// Uncommitted event timestamps the wait store still keeps.
    pub uncommitted_events: usize,
}

impl RuntimeStats {
    /// Nothing queued, parked or waiting.
    pub fn is_idle(&self) -> bool {
        self.queued == 0 && self.parked == 0 && self.awaiting_answers == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_stats_are_idle() {
        assert!(RuntimeStats::default().is_idle());
        let busy = RuntimeStats {
            parked: 1,
            ..RuntimeStats::default()
        };
        assert!(!busy.is_idle());
    }

    #[test]
    fn stats_serialize_with_field_names() {
        let json = serde_json::to_value(RuntimeStats::default()).unwrap();
        assert_eq!(json["open_transactions"], 0);
        assert_eq!(json["pending_request_timeouts"], 0);
    }
}

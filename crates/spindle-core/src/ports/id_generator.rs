//! IdGenerator port - ID 生成の抽象化
//!
//! # 実装
//! - **UlidGenerator**: ULID ベース（本番用）

use crate::domain::ids::{ContainerRef, RequestRef, TxId};
use crate::ports::Clock;
use ulid::Ulid;

/// IdGenerator は space 内で一意な ID を生成
///
/// # Thread Safety
/// - `Send + Sync` を要求（複数スレッドから使える）
pub trait IdGenerator: Send + Sync {
    fn generate_request_ref(&self) -> RequestRef;

    fn generate_container_ref(&self) -> ContainerRef;

    fn generate_tx_id(&self) -> TxId;
}

/// UlidGenerator は ULID ベースの ID 生成器
///
/// Clock の wall-clock 時刻を timestamp 部分に使います。
pub struct UlidGenerator<C> {
    clock: C,
}

impl<C: Clock> UlidGenerator<C> {
    pub fn new(clock: C) -> Self {
        Self { clock }
    }

    fn next_ulid(&self) -> Ulid {
        let timestamp_ms = self.clock.wall_now().timestamp_millis() as u64;
        Ulid::from_parts(timestamp_ms, rand::random())
    }
}

impl<C: Clock> IdGenerator for UlidGenerator<C> {
    fn generate_request_ref(&self) -> RequestRef {
        RequestRef::from(self.next_ulid())
    }

    fn generate_container_ref(&self) -> ContainerRef {
        ContainerRef::from(self.next_ulid())
    }

    fn generate_tx_id(&self) -> TxId {
        TxId::from(self.next_ulid())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::{ManualClock, MonotonicClock, Timestamp};
    use chrono::{TimeZone, Utc};

    #[test]
    fn ulid_generator_generates_unique_ids() {
        let id_gen = UlidGenerator::new(MonotonicClock::new());

        let id1 = id_gen.generate_request_ref();
        let id2 = id_gen.generate_request_ref();
        let id3 = id_gen.generate_request_ref();

        assert_ne!(id1, id2);
        assert_ne!(id2, id3);
        assert_ne!(id1, id3);
    }

    #[test]
    fn ulid_generator_with_manual_clock_pins_the_timestamp() {
        let fixed_time = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let id_gen = UlidGenerator::new(ManualClock::new(Timestamp::from_nanos(0), fixed_time));

        let id1 = id_gen.generate_tx_id();
        let id2 = id_gen.generate_tx_id();

        // ランダム部分があるので ID は異なる
        assert_ne!(id1, id2);

        let timestamp1 = (id1.as_ulid().0 >> 80) as u64;
        let timestamp2 = (id2.as_ulid().0 >> 80) as u64;
        assert_eq!(timestamp1, timestamp2);
        assert_eq!(timestamp1, fixed_time.timestamp_millis() as u64);
    }

    #[test]
    fn different_id_types_are_generated() {
        let id_gen = UlidGenerator::new(MonotonicClock::new());

        assert!(id_gen.generate_request_ref().to_string().starts_with("req-"));
        assert!(id_gen.generate_container_ref().to_string().starts_with("cnt-"));
        assert!(id_gen.generate_tx_id().to_string().starts_with("tx-"));
    }
}

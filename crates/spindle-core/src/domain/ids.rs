//! Domain identifiers (strongly-typed IDs).
//!
//! ULID ベースの ID を Phantom type パターンで型ごとに分けています。
//! RequestRef と ContainerRef は同じ 128-bit でも混同できません。
//!
//! トランザクションだけは「どの space のものか」を持つ必要があるので、
//! `TransactionRef { space, id }` という複合参照になっています。

use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;
use ulid::Ulid;

/// IdMarker は各 ID 型のマーカー trait
///
/// Display で使うプレフィックス（"req-", "cnt-" など）を提供します。
pub trait IdMarker: Send + Sync + 'static {
    fn prefix() -> &'static str;
}

/// ジェネリック ID 型
///
/// `T` は PhantomData で、実行時にはメモリを消費しません。
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Id<T: IdMarker> {
    ulid: Ulid,
    #[serde(skip)]
    _marker: PhantomData<T>,
}

impl<T: IdMarker> Id<T> {
    pub fn from_ulid(ulid: Ulid) -> Self {
        Self {
            ulid,
            _marker: PhantomData,
        }
    }

    pub fn as_ulid(&self) -> Ulid {
        self.ulid
    }
}

impl<T: IdMarker> From<Ulid> for Id<T> {
    fn from(ulid: Ulid) -> Self {
        Self::from_ulid(ulid)
    }
}

impl<T: IdMarker> fmt::Display for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", T::prefix(), self.ulid)
    }
}

// ========================================
// マーカー型の定義
// ========================================

/// Request のマーカー型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Request {}

impl IdMarker for Request {
    fn prefix() -> &'static str {
        "req-"
    }
}

/// Container のマーカー型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Container {}

impl IdMarker for Container {
    fn prefix() -> &'static str {
        "cnt-"
    }
}

/// Transaction のマーカー型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Transaction {}

impl IdMarker for Transaction {
    fn prefix() -> &'static str {
        "tx-"
    }
}

/// Space のマーカー型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Space {}

impl IdMarker for Space {
    fn prefix() -> &'static str {
        "space-"
    }
}

// ========================================
// Type Alias
// ========================================

/// Identity of one in-flight request (and of the task that executes it).
pub type RequestRef = Id<Request>;

/// Reference to a container inside this space.
pub type ContainerRef = Id<Container>;

/// Local part of a transaction reference.
pub type TxId = Id<Transaction>;

/// Identity of a space instance (one runtime).
pub type SpaceId = Id<Space>;

/// Client-visible handle of a transaction.
///
/// `space` は発行元の space。別 space の参照は registry で "foreign" として弾かれる。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransactionRef {
    pub space: SpaceId,
    pub id: TxId,
}

impl TransactionRef {
    pub fn new(space: SpaceId, id: TxId) -> Self {
        Self { space, id }
    }
}

impl fmt::Display for TransactionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.space)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_distinct_types() {
        let ulid1 = Ulid::new();
        let ulid2 = Ulid::new();

        let request = RequestRef::from_ulid(ulid1);
        let container = ContainerRef::from_ulid(ulid2);

        assert_eq!(request.as_ulid(), ulid1);
        assert_eq!(container.as_ulid(), ulid2);

        assert!(request.to_string().starts_with("req-"));
        assert!(container.to_string().starts_with("cnt-"));
        // let _: RequestRef = container; // <- does not compile
    }

    #[test]
    fn transaction_ref_display_names_the_space() {
        let space = SpaceId::from_ulid(Ulid::new());
        let tx = TransactionRef::new(space, TxId::from_ulid(Ulid::new()));

        let shown = tx.to_string();
        assert!(shown.starts_with("tx-"));
        assert!(shown.ends_with(&space.to_string()));
    }

    #[test]
    fn transaction_refs_from_different_spaces_differ() {
        let id = TxId::from_ulid(Ulid::new());
        let a = TransactionRef::new(SpaceId::from_ulid(Ulid::new()), id);
        let b = TransactionRef::new(SpaceId::from_ulid(Ulid::new()), id);
        assert_ne!(a, b);
    }

    #[test]
    fn transaction_ref_can_be_serialized() {
        let tx = TransactionRef::new(
            SpaceId::from_ulid(Ulid::new()),
            TxId::from_ulid(Ulid::new()),
        );
        let serialized = serde_json::to_string(&tx).unwrap();
        let deserialized: TransactionRef = serde_json::from_str(&serialized).unwrap();
        assert_eq!(tx, deserialized);
    }

    #[test]
    fn phantom_data_does_not_consume_memory() {
        use std::mem::size_of;
        assert_eq!(size_of::<RequestRef>(), size_of::<Ulid>());
        assert_eq!(size_of::<ContainerRef>(), 16);
    }
}

//! OperationExecutor port - エントリ操作エンジンとの境界
//!
//! The executor matches entries, enforces isolation and owns locks. The
//! runtime only interprets the status it answers with. Every operation runs
//! in a sub-transaction of the request's transaction.

use async_trait::async_trait;
use std::any::Any;
use std::sync::Arc;

use crate::domain::{
    ContainerRef, ContainerSpec, Entry, IsolationLevel, OperationResult, Selector, SpaceError,
};

/// A transaction as the executor sees it.
#[async_trait]
pub trait Transaction: Send + Sync {
    /// Executor-side identifier; `LockCause::holding_tx` refers to it.
    fn label(&self) -> String;

    /// False once committed or rolled back.
    fn is_valid(&self) -> bool;

    fn new_sub_transaction(&self) -> Result<Arc<dyn SubTransaction>, SpaceError>;

    /// Blocks new sub-transactions and waits until the running ones finish.
    async fn lock_and_wait_for_sub_transactions(&self);

    fn commit(&self) -> Result<(), SpaceError>;

    fn rollback(&self) -> Result<(), SpaceError>;

    /// Containers this transaction read from or changed.
    fn accessed_containers(&self) -> Vec<ContainerRef>;
}

/// One attempt's unit of isolation inside a transaction.
pub trait SubTransaction: Send + Sync {
    fn label(&self) -> String;

    fn commit(&self) -> Result<(), SpaceError>;

    fn rollback(&self) -> Result<(), SpaceError>;

    /// Lets an executor recover its own sub-transaction type.
    fn as_any(&self) -> &dyn Any;
}

#[async_trait]
pub trait OperationExecutor: Send + Sync {
    fn new_transaction(&self) -> Arc<dyn Transaction>;

    async fn write(
        &self,
        container: ContainerRef,
        entries: &[Entry],
        stx: &dyn SubTransaction,
    ) -> OperationResult<()>;

    async fn read(
        &self,
        container: ContainerRef,
        selector: &Selector,
        isolation: IsolationLevel,
        stx: &dyn SubTransaction,
    ) -> OperationResult<Vec<Entry>>;

    async fn take(
        &self,
        container: ContainerRef,
        selector: &Selector,
        stx: &dyn SubTransaction,
    ) -> OperationResult<Vec<Entry>>;

    async fn test(
        &self,
        container: ContainerRef,
        selector: &Selector,
        isolation: IsolationLevel,
        stx: &dyn SubTransaction,
    ) -> OperationResult<usize>;

    async fn delete(
        &self,
        container: ContainerRef,
        selector: &Selector,
        stx: &dyn SubTransaction,
    ) -> OperationResult<usize>;

    async fn create_container(
        &self,
        spec: &ContainerSpec,
        stx: &dyn SubTransaction,
    ) -> OperationResult<ContainerRef>;

    async fn destroy_container(
        &self,
        container: ContainerRef,
        stx: &dyn SubTransaction,
    ) -> OperationResult<()>;

    async fn lookup_container(
        &self,
        name: &str,
        stx: &dyn SubTransaction,
    ) -> OperationResult<ContainerRef>;

    async fn lock_container(
        &self,
        container: ContainerRef,
        stx: &dyn SubTransaction,
    ) -> OperationResult<()>;
}

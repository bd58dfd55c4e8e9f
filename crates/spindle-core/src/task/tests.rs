use super::*;
use crate::domain::{
    ContainerSpec, Entry, IsolationLevel, LockKind, OperationCause, OperationResult, RequestTimeout,
    Selector, SpaceId, TransactionTimeout, TxId,
};
use crate::ports::{MonotonicClock, NoDeadlockDetection, SubTransaction, UlidGenerator};
use crate::timeout::BlockingTimeoutProcessor;
use crate::txn::InternalRequests;
use crate::wait::{Rescheduler, TransactionLookup};
use async_trait::async_trait;
use std::any::Any;
use std::collections::VecDeque;
use std::sync::Mutex as StdMutex;
use std::time::Duration;
use ulid::Ulid;

/// Answers writes from a script; `Ok` once the script runs out.
#[derive(Default)]
struct ScriptedExecutor {
    writes: StdMutex<VecDeque<OperationResult<()>>>,
    calls: StdMutex<usize>,
}

impl ScriptedExecutor {
    fn with(script: Vec<OperationResult<()>>) -> Arc<Self> {
        Arc::new(Self {
            writes: StdMutex::new(script.into()),
            calls: StdMutex::new(0),
        })
    }

    fn calls(&self) -> usize {
        *self.calls.lock().unwrap()
    }
}

struct NullTransaction;

#[async_trait]
impl Transaction for NullTransaction {
    fn label(&self) -> String {
        "null-tx".into()
    }

    fn is_valid(&self) -> bool {
        true
    }

    fn new_sub_transaction(&self) -> Result<Arc<dyn SubTransaction>, SpaceError> {
        Ok(Arc::new(NullSubTransaction))
    }

    async fn lock_and_wait_for_sub_transactions(&self) {}

    fn commit(&self) -> Result<(), SpaceError> {
        Ok(())
    }

    fn rollback(&self) -> Result<(), SpaceError> {
        Ok(())
    }

    fn accessed_containers(&self) -> Vec<ContainerRef> {
        Vec::new()
    }
}

struct NullSubTransaction;

impl SubTransaction for NullSubTransaction {
    fn label(&self) -> String {
        "null-stx".into()
    }

    fn commit(&self) -> Result<(), SpaceError> {
        Ok(())
    }

    fn rollback(&self) -> Result<(), SpaceError> {
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

fn refused<T>() -> OperationResult<T> {
    OperationResult::NotOk(OperationCause::Rejected {
        message: "not scripted".into(),
    })
}

#[async_trait]
impl OperationExecutor for ScriptedExecutor {
    fn new_transaction(&self) -> Arc<dyn Transaction> {
        Arc::new(NullTransaction)
    }

    async fn write(
        &self,
        _container: ContainerRef,
        _entries: &[Entry],
        _stx: &dyn SubTransaction,
    ) -> OperationResult<()> {
        *self.calls.lock().unwrap() += 1;
        self.writes
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(OperationResult::Ok(()))
    }

    async fn read(
        &self,
        _container: ContainerRef,
        _selector: &Selector,
        _isolation: IsolationLevel,
        _stx: &dyn SubTransaction,
    ) -> OperationResult<Vec<Entry>> {
        refused()
    }

    async fn take(
        &self,
        _container: ContainerRef,
        _selector: &Selector,
        _stx: &dyn SubTransaction,
    ) -> OperationResult<Vec<Entry>> {
        refused()
    }

    async fn test(
        &self,
        _container: ContainerRef,
        _selector: &Selector,
        _isolation: IsolationLevel,
        _stx: &dyn SubTransaction,
    ) -> OperationResult<usize> {
        refused()
    }

    async fn delete(
        &self,
        _container: ContainerRef,
        _selector: &Selector,
        _stx: &dyn SubTransaction,
    ) -> OperationResult<usize> {
        refused()
    }

    async fn create_container(
        &self,
        _spec: &ContainerSpec,
        _stx: &dyn SubTransaction,
    ) -> OperationResult<ContainerRef> {
        OperationResult::Ok(ContainerRef::from_ulid(Ulid::new()))
    }

    async fn destroy_container(
        &self,
        _container: ContainerRef,
        _stx: &dyn SubTransaction,
    ) -> OperationResult<()> {
        OperationResult::Ok(())
    }

    async fn lookup_container(
        &self,
        name: &str,
        _stx: &dyn SubTransaction,
    ) -> OperationResult<ContainerRef> {
        OperationResult::NotOk(OperationCause::ContainerNotFound { name: name.into() })
    }

    async fn lock_container(
        &self,
        _container: ContainerRef,
        _stx: &dyn SubTransaction,
    ) -> OperationResult<()> {
        OperationResult::Ok(())
    }
}

#[derive(Default)]
struct Answers(StdMutex<Vec<(RequestRef, Result<Answer, SpaceError>)>>);

impl Answers {
    fn all(&self) -> Vec<(RequestRef, Result<Answer, SpaceError>)> {
        self.0.lock().unwrap().clone()
    }
}

impl ResponseSink for Answers {
    fn deliver(&self, request: RequestRef, answer: Result<Answer, SpaceError>) {
        self.0.lock().unwrap().push((request, answer));
    }
}

#[derive(Default)]
struct Woken(StdMutex<Vec<RequestRef>>);

impl Rescheduler<Task> for Woken {
    fn reschedule(&self, task: ParkedTask<Task>) {
        self.0.lock().unwrap().push(task.request);
    }
}

struct NoInternalRequests;

impl InternalRequests for NoInternalRequests {
    fn submit_internal(&self, _request: Request) -> Result<(), SpaceError> {
        Ok(())
    }
}

struct Fixture {
    ctx: Arc<TaskContext>,
    answers: Arc<Answers>,
    woken: Arc<Woken>,
    container: ContainerRef,
}

fn fixture(executor: Arc<ScriptedExecutor>) -> Fixture {
    let woken = Arc::new(Woken::default());
    let wait_store = Arc::new(WaitAndEventStore::new(
        woken.clone() as Arc<dyn Rescheduler<Task>>
    ));
    let clock: Arc<dyn Clock> = Arc::new(MonotonicClock::new());
    let registry = Arc::new(TransactionRegistry::new(
        SpaceId::from_ulid(Ulid::new()),
        Arc::new(BlockingTimeoutProcessor::<TransactionRef>::start("Transaction-TP").unwrap()),
        Arc::clone(&wait_store),
        Arc::clone(&clock),
        Arc::new(NoInternalRequests),
        8,
    ));
    let lookup: Arc<dyn TransactionLookup> = registry.clone();
    wait_store.bind_transactions(Arc::downgrade(&lookup));

    let container = ContainerRef::from_ulid(Ulid::new());
    wait_store.add_container(container);

    let answers = Arc::new(Answers::default());
    let ctx = Arc::new(TaskContext {
        executor,
        registry,
        wait_store,
        request_timeouts: Arc::new(BlockingTimeoutProcessor::<Task>::start("Request-TP").unwrap()),
        responses: answers.clone(),
        locked_tasks: Arc::new(NoDeadlockDetection),
        clock: Arc::clone(&clock),
        ids: Arc::new(UlidGenerator::new(MonotonicClock::new())),
    });
    Fixture {
        ctx,
        answers,
        woken,
        container,
    }
}

fn write(container: ContainerRef, timeout: RequestTimeout) -> Request {
    Request::Write {
        container,
        entries: vec![serde_json::json!({"n": 1})],
        timeout,
        transaction: None,
    }
}

fn task(f: &Fixture, request: Request) -> Task {
    Task::new(
        RequestMessage::client(RequestRef::from_ulid(Ulid::new()), request),
        Arc::clone(&f.ctx),
    )
}

fn delayable() -> OperationResult<()> {
    OperationResult::Delayable(OperationCause::ContainerFull { capacity: 1 })
}

#[tokio::test]
async fn implicit_write_commits_and_answers_once() {
    let f = fixture(ScriptedExecutor::with(vec![]));
    let t = task(&f, write(f.container, RequestTimeout::Infinite));

    t.run().await;
    t.run().await;

    assert_eq!(f.answers.all(), vec![(t.request_ref(), Ok(Answer::Done))]);
    assert_eq!(t.phase().await, TaskPhase::Answered);
    assert_eq!(t.execution_count().await, 1);
    assert!(f.ctx.registry.transactions().is_empty());
}

#[tokio::test]
async fn delayable_attempt_parks_until_run_again() {
    let executor = ScriptedExecutor::with(vec![delayable()]);
    let f = fixture(executor.clone());
    let t = task(&f, write(f.container, RequestTimeout::Infinite));

    t.run().await;
    assert_eq!(t.phase().await, TaskPhase::Parked);
    assert!(f.ctx.wait_store.is_parked(t.request_ref()));
    assert!(f.answers.all().is_empty());
    // the implicit transaction stays open while the task waits
    assert_eq!(f.ctx.registry.transactions().len(), 1);

    t.run().await;
    assert!(!f.ctx.wait_store.is_parked(t.request_ref()));
    assert_eq!(f.answers.all(), vec![(t.request_ref(), Ok(Answer::Done))]);
    assert_eq!(executor.calls(), 2);
    assert!(f.ctx.registry.transactions().is_empty());
}

#[tokio::test]
async fn zero_timeout_fails_on_lock() {
    let cause = LockCause::long_term(LockKind::Entry, "tx-other");
    let f = fixture(ScriptedExecutor::with(vec![OperationResult::Locked(
        cause.clone(),
    )]));
    let t = task(&f, write(f.container, RequestTimeout::Zero));

    t.run().await;
    assert_eq!(
        f.answers.all(),
        vec![(t.request_ref(), Err(SpaceError::Locked(cause)))]
    );
    assert!(f.ctx.registry.transactions().is_empty());
}

#[tokio::test]
async fn try_once_fails_on_delayable_but_waits_on_lock() {
    let f = fixture(ScriptedExecutor::with(vec![
        delayable(),
        OperationResult::Locked(LockCause::long_term(LockKind::Entry, "tx-other")),
    ]));

    let first = task(&f, write(f.container, RequestTimeout::TryOnce));
    first.run().await;
    assert_eq!(
        f.answers.all(),
        vec![(
            first.request_ref(),
            Err(SpaceError::Operation(OperationCause::ContainerFull {
                capacity: 1
            }))
        )]
    );

    let second = task(&f, write(f.container, RequestTimeout::TryOnce));
    second.run().await;
    assert_eq!(second.phase().await, TaskPhase::Parked);
    assert!(f.ctx.wait_store.is_parked(second.request_ref()));
}

#[tokio::test]
async fn deadline_turns_the_next_run_into_a_timeout() {
    let f = fixture(ScriptedExecutor::with(vec![delayable()]));
    let t = task(&f, write(f.container, RequestTimeout::Millis(20)));

    t.run().await;
    assert_eq!(t.phase().await, TaskPhase::Armed);
    assert_eq!(f.ctx.request_timeouts.pending(), 1);

    tokio::time::sleep(Duration::from_millis(60)).await;
    t.run().await;

    let answers = f.answers.all();
    assert_eq!(answers.len(), 1);
    assert!(matches!(
        &answers[0].1,
        Err(SpaceError::Timeout { request, waited_ms }) if *request == t.request_ref() && *waited_ms >= 20
    ));
    assert!(!f.ctx.wait_store.is_parked(t.request_ref()));
    assert!(f.ctx.registry.transactions().is_empty());
}

#[tokio::test]
async fn missing_wait_info_resubmits_right_away() {
    let f = fixture(ScriptedExecutor::with(vec![delayable()]));
    let unknown = ContainerRef::from_ulid(Ulid::new());
    let t = task(&f, write(unknown, RequestTimeout::Infinite));

    t.run().await;
    assert_eq!(t.phase().await, TaskPhase::Queued);
    assert_eq!(*f.woken.0.lock().unwrap(), vec![t.request_ref()]);
}

#[tokio::test]
async fn explicit_transaction_stays_open_after_the_write() {
    let f = fixture(ScriptedExecutor::with(vec![]));
    let create = task(
        &f,
        Request::CreateTransaction {
            timeout: TransactionTimeout::Infinite,
        },
    );
    create.run().await;
    let reference = f.answers.all()[0]
        .1
        .clone()
        .unwrap()
        .transaction()
        .unwrap();

    let t = task(
        &f,
        Request::Write {
            container: f.container,
            entries: vec![],
            timeout: RequestTimeout::Infinite,
            transaction: Some(reference),
        },
    );
    t.run().await;
    assert_eq!(f.ctx.registry.open_transactions(), 1);

    let commit = task(
        &f,
        Request::CommitTransaction {
            transaction: reference,
        },
    );
    commit.run().await;
    assert_eq!(f.answers.all()[2], (commit.request_ref(), Ok(Answer::Done)));
    assert_eq!(f.ctx.registry.open_transactions(), 0);
}

#[tokio::test]
async fn unknown_transaction_is_reported() {
    let f = fixture(ScriptedExecutor::with(vec![]));
    let stale = TransactionRef::new(f.ctx.registry.space(), TxId::from_ulid(Ulid::new()));
    let t = task(
        &f,
        Request::Write {
            container: f.container,
            entries: vec![],
            timeout: RequestTimeout::Infinite,
            transaction: Some(stale),
        },
    );
    t.run().await;
    assert_eq!(
        f.answers.all(),
        vec![(t.request_ref(), Err(SpaceError::UnknownTransaction(stale)))]
    );
}

#[tokio::test]
async fn created_container_gets_wait_info() {
    let f = fixture(ScriptedExecutor::with(vec![delayable()]));
    let create = task(
        &f,
        Request::CreateContainer {
            spec: ContainerSpec::named("jobs"),
            transaction: None,
        },
    );
    create.run().await;
    let created = f.answers.all()[0].1.clone().unwrap().container().unwrap();

    // a blocked write on the new container can park there
    let t = task(&f, write(created, RequestTimeout::Infinite));
    t.run().await;
    assert_eq!(t.phase().await, TaskPhase::Parked);
    assert!(f.woken.0.lock().unwrap().is_empty());
}

#[tokio::test]
async fn lookup_of_missing_container_waits_on_the_containerless_slot() {
    let f = fixture(ScriptedExecutor::with(vec![]));
    let t = task(
        &f,
        Request::LookupContainer {
            name: "jobs".into(),
            timeout: RequestTimeout::Infinite,
            transaction: None,
        },
    );
    t.run().await;
    assert_eq!(t.phase().await, TaskPhase::Parked);
    assert!(f.ctx.wait_store.is_parked(t.request_ref()));

    // any transaction end wakes it
    let other = TransactionRef::new(f.ctx.registry.space(), TxId::from_ulid(Ulid::new()));
    f.ctx
        .wait_store
        .process_transaction_commit(&other, &[], f.ctx.clock.now());
    assert!(f.woken.0.lock().unwrap().contains(&t.request_ref()));
}

#[tokio::test]
async fn fail_answers_a_parked_task_once() {
    let f = fixture(ScriptedExecutor::with(vec![delayable()]));
    let t = task(&f, write(f.container, RequestTimeout::Infinite));
    t.run().await;

    assert!(t.fail(SpaceError::ShuttingDown).await);
    assert!(!t.fail(SpaceError::ShuttingDown).await);
    assert!(!t.try_fail(SpaceError::ShuttingDown));
    assert_eq!(
        f.answers.all(),
        vec![(t.request_ref(), Err(SpaceError::ShuttingDown))]
    );
    assert!(!f.ctx.wait_store.is_parked(t.request_ref()));
    assert!(f.ctx.registry.transactions().is_empty());
}

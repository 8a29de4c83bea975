//! Idempotency registry for side-effecting actions
//!
//! `execute` guarantees that, for one key, the action body runs at most once
//! successfully and never twice concurrently. The claim is a single atomic
//! write in the backend; there is no separate existence check before it.
//!
//! Completed results are stored and replayed verbatim. Failed attempts are
//! not cached: the next `execute` on the key runs its action again.

use chrono::Utc;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::{Config, WaitPolicy};
use crate::error::{Error, Result};
use crate::storage::{Claim, IdempotencyRecord, RecordBackend, RecordStatus};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Per-call options for [`IdempotencyRegistry::execute_with`]
#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    /// Cancelling the token abandons the action and records the attempt as
    /// failed
    pub cancel: Option<CancellationToken>,

    /// Upper bound on how long the action body may run
    pub timeout: Option<Duration>,
}

impl ExecuteOptions {
    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// In-process wakeups for callers waiting on an in-flight key
#[derive(Default)]
struct Waiters {
    inner: Mutex<HashMap<String, Arc<Notify>>>,
}

impl Waiters {
    fn subscribe(&self, key: &str) -> Arc<Notify> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone()
    }

    /// Drop our subscription, removing the entry if nobody else holds it
    fn release(&self, key: &str, notify: &Arc<Notify>) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let unused = inner.get(key).is_some_and(|current| {
            Arc::ptr_eq(current, notify) && Arc::strong_count(current) <= 2
        });
        if unused {
            inner.remove(key);
        }
    }

    fn wake(&self, key: &str) {
        let notify = {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            inner.remove(key)
        };
        if let Some(notify) = notify {
            notify.notify_waiters();
        }
    }
}

/// Releases an abandoned in-progress record
///
/// If the future driving an action is dropped before the outcome is written,
/// the record would stay InProgress forever. The guard marks it Failed so a
/// later attempt may retry.
struct InFlight {
    backend: Arc<dyn RecordBackend>,
    waiters: Arc<Waiters>,
    key: String,
    attempt: Uuid,
    armed: bool,
}

impl InFlight {
    fn disarm(&mut self) {
        self.armed = false;
        self.waiters.wake(&self.key);
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }

        let backend = self.backend.clone();
        let waiters = self.waiters.clone();
        let key = std::mem::take(&mut self.key);
        let attempt = self.attempt;

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = backend.fail(&key, attempt, "abandoned", Utc::now()).await {
                        tracing::warn!(
                            key = %key,
                            error = %e,
                            "failed to release abandoned action"
                        );
                    }
                    waiters.wake(&key);
                });
            }
            Err(_) => {
                tracing::warn!(key = %key, "no runtime to release abandoned action");
            }
        }
    }
}

enum Outcome<T> {
    Done(T),
    Failed(String),
    Cancelled,
    TimedOut,
    Panicked(Box<dyn std::any::Any + Send>),
}

/// Deduplicates side-effecting actions by caller-chosen key
#[derive(Clone)]
pub struct IdempotencyRegistry {
    backend: Arc<dyn RecordBackend>,
    waiters: Arc<Waiters>,
    wait: WaitPolicy,
    lease: Option<chrono::Duration>,
    retention: chrono::Duration,
    poll_interval: Duration,
}

impl IdempotencyRegistry {
    pub fn new(backend: Arc<dyn RecordBackend>) -> Self {
        Self {
            backend,
            waiters: Arc::new(Waiters::default()),
            wait: WaitPolicy::default(),
            lease: None,
            retention: chrono::Duration::days(7),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn from_config(backend: Arc<dyn RecordBackend>, config: &Config) -> Self {
        Self::new(backend)
            .with_wait_policy(config.registry_wait)
            .with_lease(config.registry_lease())
            .with_retention(config.registry_retention())
    }

    pub fn with_wait_policy(mut self, wait: WaitPolicy) -> Self {
        self.wait = wait;
        self
    }

    /// Allow a new attempt to take over an in-progress record older than
    /// `lease`
    pub fn with_lease(mut self, lease: Option<chrono::Duration>) -> Self {
        self.lease = lease;
        self
    }

    pub fn with_retention(mut self, retention: chrono::Duration) -> Self {
        self.retention = retention;
        self
    }

    /// How often waiters re-read the backend. In-process completions wake
    /// waiters immediately; polling covers owners in other processes.
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Run `action` at most once per key and replay its stored result
    pub async fn execute<T, E, F, Fut>(&self, key: &str, action: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        E: Display,
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        self.execute_with(key, ExecuteOptions::default(), action).await
    }

    pub async fn execute_with<T, E, F, Fut>(
        &self,
        key: &str,
        options: ExecuteOptions,
        action: F,
    ) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        E: Display,
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        let deadline = match self.wait {
            WaitPolicy::Block { timeout_ms } => {
                Some(Instant::now() + Duration::from_millis(timeout_ms))
            }
            WaitPolicy::Reject => None,
        };

        loop {
            let attempt = Uuid::new_v4();
            let record = match self.backend.try_claim(key, attempt, Utc::now(), self.lease).await? {
                Claim::Claimed(record) => {
                    tracing::debug!(key, attempts = record.attempts, "claimed action");
                    return self.run(key, attempt, options, action).await;
                }
                Claim::Existing(record) => record,
            };

            match record.status {
                RecordStatus::Completed => {
                    tracing::debug!(key, "replaying completed action");
                    return replay(record);
                }
                RecordStatus::Failed => {
                    return Err(Error::storage(format!(
                        "backend refused to reclaim failed record '{}'",
                        key
                    )));
                }
                RecordStatus::InProgress => {}
            }

            let Some(deadline) = deadline else {
                return Err(Error::DuplicateInFlight {
                    key: key.to_string(),
                });
            };

            match self.wait_for_resolution(key, deadline).await? {
                Some(record) if record.status == RecordStatus::Completed => return replay(record),
                Some(record) => {
                    return Err(Error::action_failed(
                        key,
                        record.error.unwrap_or_else(|| "unknown failure".to_string()),
                    ))
                }
                // Purged or gone stale while we waited: compete for it again
                None => continue,
            }
        }
    }

    /// The current record for a key, if any
    pub async fn status(&self, key: &str) -> Result<Option<IdempotencyRecord>> {
        self.backend.get(key).await
    }

    /// Drop resolved records older than the retention window
    pub async fn purge_expired(&self, now: chrono::DateTime<Utc>) -> Result<usize> {
        let Some(cutoff) = now.checked_sub_signed(self.retention) else {
            return Ok(0);
        };
        let removed = self.backend.purge_resolved_before(cutoff).await?;
        if removed > 0 {
            tracing::debug!(removed, "purged idempotency records past retention");
        }
        Ok(removed)
    }

    async fn run<T, E, F, Fut>(
        &self,
        key: &str,
        attempt: Uuid,
        options: ExecuteOptions,
        action: F,
    ) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        E: Display,
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        let mut guard = InFlight {
            backend: self.backend.clone(),
            waiters: self.waiters.clone(),
            key: key.to_string(),
            attempt,
            armed: true,
        };

        let cancel = options.cancel.unwrap_or_else(CancellationToken::new);
        let timeout = options.timeout;
        let body = async move {
            let guarded = AssertUnwindSafe(action()).catch_unwind();
            match timeout {
                Some(limit) => tokio::time::timeout(limit, guarded).await.ok(),
                None => Some(guarded.await),
            }
        };

        let outcome = tokio::select! {
            _ = cancel.cancelled() => Outcome::Cancelled,
            finished = body => match finished {
                None => Outcome::TimedOut,
                Some(Err(panic)) => Outcome::Panicked(panic),
                Some(Ok(Err(e))) => Outcome::Failed(e.to_string()),
                Some(Ok(Ok(value))) => Outcome::Done(value),
            },
        };

        let (message, error) = match outcome {
            Outcome::Done(value) => {
                // The side effect has happened. From here on the record must
                // never become reclaimable as Failed; if it cannot be
                // completed it stays InProgress until a lease expires.
                guard.armed = false;

                let completed = match serde_json::to_value(&value) {
                    Ok(stored) => self.backend.complete(key, attempt, stored, Utc::now()).await,
                    Err(e) => Err(e.into()),
                };
                self.waiters.wake(key);

                return match completed {
                    Ok(true) => {
                        tracing::debug!(key, "action completed");
                        Ok(value)
                    }
                    Ok(false) => {
                        tracing::warn!(key, "attempt lost ownership before completing");
                        Ok(value)
                    }
                    Err(e) => {
                        tracing::error!(
                            key,
                            error = %e,
                            "action succeeded but its outcome was not recorded"
                        );
                        Err(e)
                    }
                };
            }
            Outcome::Failed(message) => {
                let error = Error::action_failed(key, message.clone());
                (message, error)
            }
            Outcome::Cancelled => (
                "cancelled".to_string(),
                Error::Cancelled {
                    key: key.to_string(),
                },
            ),
            Outcome::TimedOut => (
                "timed out".to_string(),
                Error::ActionTimedOut {
                    key: key.to_string(),
                },
            ),
            Outcome::Panicked(panic) => {
                self.release_failed(&mut guard, "panicked").await?;
                std::panic::resume_unwind(panic);
            }
        };

        tracing::warn!(key, %message, "action failed");
        self.release_failed(&mut guard, &message).await?;
        Err(error)
    }

    async fn release_failed(&self, guard: &mut InFlight, message: &str) -> Result<()> {
        if !self
            .backend
            .fail(&guard.key, guard.attempt, message, Utc::now())
            .await?
        {
            tracing::warn!(key = %guard.key, "attempt lost ownership before failing");
        }
        guard.disarm();
        Ok(())
    }

    /// Block until the record leaves InProgress
    ///
    /// Returns `None` when the record disappeared or became reclaimable, so
    /// the caller should try to claim it.
    async fn wait_for_resolution(
        &self,
        key: &str,
        deadline: Instant,
    ) -> Result<Option<IdempotencyRecord>> {
        let notify = self.waiters.subscribe(key);
        let result = self.poll_until_resolved(key, deadline, &notify).await;
        self.waiters.release(key, &notify);
        result
    }

    async fn poll_until_resolved(
        &self,
        key: &str,
        deadline: Instant,
        notify: &Notify,
    ) -> Result<Option<IdempotencyRecord>> {
        loop {
            let notified = notify.notified();
            tokio::pin!(notified);
            // Register before reading so a wake between the read and the
            // await is not lost
            notified.as_mut().enable();

            match self.backend.get(key).await? {
                None => return Ok(None),
                Some(record) if record.status != RecordStatus::InProgress => {
                    return Ok(Some(record))
                }
                Some(record) if record.is_reclaimable(Utc::now(), self.lease) => return Ok(None),
                Some(_) => {}
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(Error::StillInProgress {
                    key: key.to_string(),
                });
            }

            let nap = (deadline - now).min(self.poll_interval);
            let _ = tokio::time::timeout(nap, notified).await;
        }
    }
}

fn replay<T: DeserializeOwned>(record: IdempotencyRecord) -> Result<T> {
    let stored = record.result.ok_or_else(|| {
        Error::storage(format!("completed record '{}' has no stored result", record.key))
    })?;
    Ok(serde_json::from_value(stored)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CapacityPolicy;
    use crate::storage::{MemoryRecordBackend, SqliteStorage};
    use async_trait::async_trait;
    use chrono::DateTime;
    use serde::Deserialize;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::oneshot;
    use tokio_test::assert_err;

    /// Record backend that fails the next N calls of selected operations
    #[derive(Default)]
    struct FlakyRecords {
        inner: MemoryRecordBackend,
        claim_outages: AtomicUsize,
        complete_outages: AtomicUsize,
        fail_outages: AtomicUsize,
    }

    fn outage(remaining: &AtomicUsize) -> Result<()> {
        let hit = remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if hit {
            Err(Error::storage("connection reset"))
        } else {
            Ok(())
        }
    }

    #[async_trait]
    impl RecordBackend for FlakyRecords {
        async fn try_claim(
            &self,
            key: &str,
            attempt: Uuid,
            now: DateTime<Utc>,
            lease: Option<chrono::Duration>,
        ) -> Result<Claim> {
            outage(&self.claim_outages)?;
            self.inner.try_claim(key, attempt, now, lease).await
        }

        async fn complete(
            &self,
            key: &str,
            attempt: Uuid,
            result: serde_json::Value,
            now: DateTime<Utc>,
        ) -> Result<bool> {
            outage(&self.complete_outages)?;
            self.inner.complete(key, attempt, result, now).await
        }

        async fn fail(
            &self,
            key: &str,
            attempt: Uuid,
            message: &str,
            now: DateTime<Utc>,
        ) -> Result<bool> {
            outage(&self.fail_outages)?;
            self.inner.fail(key, attempt, message, now).await
        }

        async fn get(&self, key: &str) -> Result<Option<IdempotencyRecord>> {
            self.inner.get(key).await
        }

        async fn purge_resolved_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
            self.inner.purge_resolved_before(cutoff).await
        }
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Refund {
        id: String,
        amount: u64,
    }

    fn registry() -> IdempotencyRegistry {
        IdempotencyRegistry::new(Arc::new(MemoryRecordBackend::new()))
    }

    async fn wait_for_status(registry: &IdempotencyRegistry, key: &str, status: RecordStatus) {
        for _ in 0..100 {
            if let Some(record) = registry.status(key).await.unwrap() {
                if record.status == status {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("record '{}' never reached {}", key, status);
    }

    #[tokio::test]
    async fn second_call_replays_without_running() {
        let registry = registry();
        let counter = AtomicUsize::new(0);
        let runs = &counter;

        let refund = || async move {
            runs.fetch_add(1, Ordering::SeqCst);
            Ok::<_, String>(Refund {
                id: "re_1".into(),
                amount: 100,
            })
        };

        let first: Refund = registry.execute("refund:ch_1", refund).await.unwrap();
        let second: Refund = registry.execute("refund:ch_1", refund).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        let record = registry.status("refund:ch_1").await.unwrap().unwrap();
        assert_eq!(record.status, RecordStatus::Completed);
        assert!(record.completed_at.is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_callers_share_one_execution() {
        let registry = registry();
        let runs = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let registry = registry.clone();
            let runs = runs.clone();
            handles.push(tokio::spawn(async move {
                registry
                    .execute("ticket:email-1", || async move {
                        let n = runs.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok::<_, String>(format!("ticket-{}", n))
                    })
                    .await
            }));
        }

        let results: Vec<String> = futures::future::join_all(handles)
            .await
            .into_iter()
            .map(|joined| joined.unwrap().unwrap())
            .collect();

        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(results.iter().all(|r| r == "ticket-0"));
    }

    #[tokio::test]
    async fn failure_is_not_cached() {
        let registry = registry();

        let err = registry
            .execute("slack:daily", || async { Err::<String, _>("rate limited") })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::ActionFailed { ref message, .. } if message == "rate limited"
        ));

        let record = registry.status("slack:daily").await.unwrap().unwrap();
        assert_eq!(record.status, RecordStatus::Failed);

        let sent: String = registry
            .execute("slack:daily", || async { Ok::<_, String>("ts-1".to_string()) })
            .await
            .unwrap();
        assert_eq!(sent, "ts-1");
        assert_eq!(registry.status("slack:daily").await.unwrap().unwrap().attempts, 2);
    }

    #[tokio::test]
    async fn reject_policy_signals_duplicate_in_flight() {
        let registry = registry().with_wait_policy(WaitPolicy::Reject);
        let (release_tx, release_rx) = oneshot::channel::<()>();
        let (started_tx, started_rx) = oneshot::channel::<()>();

        let owner = {
            let registry = registry.clone();
            tokio::spawn(async move {
                registry
                    .execute("k", || async move {
                        started_tx.send(()).unwrap();
                        release_rx.await.unwrap();
                        Ok::<_, String>(1u32)
                    })
                    .await
            })
        };
        started_rx.await.unwrap();

        let err = registry
            .execute("k", || async { Ok::<_, String>(2u32) })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateInFlight { .. }));

        release_tx.send(()).unwrap();
        assert_eq!(owner.await.unwrap().unwrap(), 1);
    }

    #[tokio::test]
    async fn blocked_waiter_times_out_with_still_in_progress() {
        let registry = registry().with_wait_policy(WaitPolicy::Block { timeout_ms: 50 });
        let (release_tx, release_rx) = oneshot::channel::<()>();
        let (started_tx, started_rx) = oneshot::channel::<()>();

        let owner = {
            let registry = registry.clone();
            tokio::spawn(async move {
                registry
                    .execute("k", || async move {
                        started_tx.send(()).unwrap();
                        release_rx.await.unwrap();
                        Ok::<_, String>(())
                    })
                    .await
            })
        };
        started_rx.await.unwrap();

        let err = registry
            .execute("k", || async { Ok::<_, String>(()) })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::StillInProgress { .. }));

        release_tx.send(()).unwrap();
        owner.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn waiter_observes_owner_failure() {
        let registry = registry();
        let (release_tx, release_rx) = oneshot::channel::<()>();
        let (started_tx, started_rx) = oneshot::channel::<()>();
        let waiter_runs = Arc::new(AtomicUsize::new(0));

        let owner = {
            let registry = registry.clone();
            tokio::spawn(async move {
                registry
                    .execute("k", || async move {
                        started_tx.send(()).unwrap();
                        release_rx.await.unwrap();
                        Err::<u32, _>("card declined")
                    })
                    .await
            })
        };
        started_rx.await.unwrap();

        let waiter = {
            let registry = registry.clone();
            let waiter_runs = waiter_runs.clone();
            tokio::spawn(async move {
                registry
                    .execute("k", || async move {
                        waiter_runs.fetch_add(1, Ordering::SeqCst);
                        Ok::<_, String>(7u32)
                    })
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        release_tx.send(()).unwrap();

        assert_err!(owner.await.unwrap());
        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(
            err,
            Error::ActionFailed { ref message, .. } if message == "card declined"
        ));
        assert_eq!(waiter_runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn cancellation_records_failure_and_allows_retry() {
        let registry = registry();
        let token = CancellationToken::new();
        token.cancel();

        let err = registry
            .execute_with(
                "k",
                ExecuteOptions::default().with_cancel(token),
                || async {
                    std::future::pending::<()>().await;
                    Ok::<_, String>(0u32)
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled { .. }));
        assert_eq!(
            registry.status("k").await.unwrap().unwrap().status,
            RecordStatus::Failed
        );

        let value: u32 = registry
            .execute("k", || async { Ok::<_, String>(5u32) })
            .await
            .unwrap();
        assert_eq!(value, 5);
    }

    #[tokio::test]
    async fn action_timeout_records_failure() {
        let registry = registry();

        let err = registry
            .execute_with(
                "slow",
                ExecuteOptions::default().with_timeout(Duration::from_millis(20)),
                || async {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok::<_, String>(())
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ActionTimedOut { .. }));

        let record = registry.status("slow").await.unwrap().unwrap();
        assert_eq!(record.status, RecordStatus::Failed);
        assert_eq!(record.error.as_deref(), Some("timed out"));
    }

    #[tokio::test]
    async fn dropped_execution_releases_the_key() {
        let registry = registry();
        let (started_tx, started_rx) = oneshot::channel::<()>();

        let owner = {
            let registry = registry.clone();
            tokio::spawn(async move {
                registry
                    .execute("k", || async move {
                        started_tx.send(()).unwrap();
                        std::future::pending::<()>().await;
                        Ok::<_, String>(())
                    })
                    .await
            })
        };
        started_rx.await.unwrap();
        owner.abort();

        wait_for_status(&registry, "k", RecordStatus::Failed).await;
        let record = registry.status("k").await.unwrap().unwrap();
        assert_eq!(record.error.as_deref(), Some("abandoned"));
    }

    #[tokio::test]
    async fn panicking_action_releases_the_key() {
        let registry = registry();

        let owner = {
            let registry = registry.clone();
            tokio::spawn(async move {
                registry
                    .execute("k", || async {
                        if true {
                            panic!("driver crashed");
                        }
                        Ok::<_, String>(())
                    })
                    .await
            })
        };

        assert!(owner.await.unwrap_err().is_panic());
        let record = registry.status("k").await.unwrap().unwrap();
        assert_eq!(record.status, RecordStatus::Failed);
        assert_eq!(record.error.as_deref(), Some("panicked"));
    }

    #[tokio::test]
    async fn replay_survives_a_new_registry_over_the_same_store() {
        let storage = Arc::new(SqliteStorage::open_in_memory(CapacityPolicy::Unbounded).unwrap());
        let first = IdempotencyRegistry::new(storage.clone());
        let second = IdempotencyRegistry::new(storage);

        let refund: Refund = first
            .execute("refund:ch_9", || async {
                Ok::<_, String>(Refund {
                    id: "re_9".into(),
                    amount: 4200,
                })
            })
            .await
            .unwrap();

        let replayed: Refund = second
            .execute("refund:ch_9", || async {
                Err::<Refund, _>("must not run")
            })
            .await
            .unwrap();
        assert_eq!(replayed, refund);
    }

    #[tokio::test]
    async fn waiter_in_another_registry_resolves_by_polling() {
        let storage = Arc::new(SqliteStorage::open_in_memory(CapacityPolicy::Unbounded).unwrap());
        let owner_registry = IdempotencyRegistry::new(storage.clone());
        let waiter_registry =
            IdempotencyRegistry::new(storage).with_poll_interval(Duration::from_millis(10));

        let (release_tx, release_rx) = oneshot::channel::<()>();
        let (started_tx, started_rx) = oneshot::channel::<()>();

        let owner = tokio::spawn(async move {
            owner_registry
                .execute("k", || async move {
                    started_tx.send(()).unwrap();
                    release_rx.await.unwrap();
                    Ok::<_, String>("done".to_string())
                })
                .await
        });
        started_rx.await.unwrap();

        let waiter = tokio::spawn(async move {
            waiter_registry
                .execute("k", || async { Ok::<_, String>("duplicate".to_string()) })
                .await
        });

        tokio::time::sleep(Duration::from_millis(30)).await;
        release_tx.send(()).unwrap();

        assert_eq!(owner.await.unwrap().unwrap(), "done");
        assert_eq!(waiter.await.unwrap().unwrap(), "done");
    }

    #[tokio::test]
    async fn stale_in_progress_record_is_taken_over_after_lease() {
        let backend = Arc::new(MemoryRecordBackend::new());
        let lease = chrono::Duration::milliseconds(1);
        backend
            .try_claim("k", Uuid::new_v4(), Utc::now() - chrono::Duration::seconds(1), None)
            .await
            .unwrap();

        let registry = IdempotencyRegistry::new(backend).with_lease(Some(lease));
        let value: u32 = registry
            .execute("k", || async { Ok::<_, String>(3u32) })
            .await
            .unwrap();
        assert_eq!(value, 3);
    }

    #[tokio::test]
    async fn purge_respects_retention() {
        let registry = registry().with_retention(chrono::Duration::hours(1));
        registry
            .execute("k", || async { Ok::<_, String>(()) })
            .await
            .unwrap();

        assert_eq!(registry.purge_expired(Utc::now()).await.unwrap(), 0);
        assert_eq!(
            registry
                .purge_expired(Utc::now() + chrono::Duration::hours(2))
                .await
                .unwrap(),
            1
        );
        assert!(registry.status("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unrecorded_success_is_never_run_again() {
        let backend = Arc::new(FlakyRecords::default());
        backend.complete_outages.store(1, Ordering::SeqCst);
        let registry = IdempotencyRegistry::new(backend).with_wait_policy(WaitPolicy::Reject);
        let counter = AtomicUsize::new(0);
        let refunds = &counter;

        let refund = || async move {
            refunds.fetch_add(1, Ordering::SeqCst);
            Ok::<_, String>(Refund {
                id: "re_2".into(),
                amount: 900,
            })
        };

        let err = registry.execute("refund:ch_2", refund).await.unwrap_err();
        assert!(err.is_storage_unavailable());

        let record = registry.status("refund:ch_2").await.unwrap().unwrap();
        assert_eq!(record.status, RecordStatus::InProgress);

        let err = registry.execute("refund:ch_2", refund).await.unwrap_err();
        assert!(matches!(err, Error::DuplicateInFlight { .. }));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn claim_outage_reaches_the_caller_without_running() {
        let backend = Arc::new(FlakyRecords::default());
        backend.claim_outages.store(1, Ordering::SeqCst);
        let registry = IdempotencyRegistry::new(backend);
        let counter = AtomicUsize::new(0);
        let runs = &counter;

        let err = registry
            .execute("k", || async move {
                runs.fetch_add(1, Ordering::SeqCst);
                Ok::<_, String>(())
            })
            .await
            .unwrap_err();

        assert!(matches!(err, Error::StorageUnavailable(_)));
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert!(registry.status("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn failure_write_outage_is_released_later() {
        let backend = Arc::new(FlakyRecords::default());
        backend.fail_outages.store(1, Ordering::SeqCst);
        let registry = IdempotencyRegistry::new(backend);

        let err = registry
            .execute("k", || async { Err::<u32, _>("card declined") })
            .await
            .unwrap_err();
        assert!(err.is_storage_unavailable());

        wait_for_status(&registry, "k", RecordStatus::Failed).await;
        let record = registry.status("k").await.unwrap().unwrap();
        assert_eq!(record.error.as_deref(), Some("abandoned"));

        let value: u32 = registry
            .execute("k", || async { Ok::<_, String>(8u32) })
            .await
            .unwrap();
        assert_eq!(value, 8);
    }

    #[tokio::test]
    async fn purge_with_unbounded_retention_removes_nothing() {
        let registry = registry().with_retention(chrono::Duration::MAX);
        registry
            .execute("k", || async { Ok::<_, String>(()) })
            .await
            .unwrap();

        assert_eq!(registry.purge_expired(Utc::now()).await.unwrap(), 0);
    }
}

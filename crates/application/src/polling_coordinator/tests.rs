use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use habot_core::{AppError, AppResult, InstanceId};
use habot_domain::{CoordinatorState, ProcessingFailurePolicy, Update};
use serde_json::json;
use tokio::sync::Mutex;

use crate::config::PollingConfig;
use crate::leader_election::LeaderElection;
use crate::test_support::{FakeCoordinationBackend, test_election_config};
use crate::upstream_ports::{UpdateProcessor, UpdateSession, UpdateSource};

use super::PollingCoordinator;

#[derive(Default)]
struct FakeUpstream {
    updates: Mutex<Vec<Update>>,
    fetched_after: Mutex<Vec<i64>>,
    failing_fetches: AtomicU32,
    sessions_opened: AtomicU32,
    sessions_closed: AtomicU32,
}

impl FakeUpstream {
    fn with_updates(ids: impl IntoIterator<Item = i64>) -> Arc<Self> {
        let updates = ids
            .into_iter()
            .map(|id| {
                Update::new(id, json!({"message": {"chat": {"id": 1}, "text": format!("#{id}")}}))
                    .unwrap_or_else(|_| unreachable!())
            })
            .collect();

        Arc::new(Self {
            updates: Mutex::new(updates),
            ..Self::default()
        })
    }
}

struct FakeSession {
    upstream: Arc<FakeUpstream>,
}

#[async_trait]
impl UpdateSource for Arc<FakeUpstream> {
    async fn open_session(&self) -> AppResult<Box<dyn UpdateSession>> {
        self.sessions_opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeSession {
            upstream: Arc::clone(self),
        }))
    }
}

#[async_trait]
impl UpdateSession for FakeSession {
    async fn fetch_updates(
        &self,
        after_id: i64,
        limit: u32,
        timeout: Duration,
    ) -> AppResult<Vec<Update>> {
        self.upstream.fetched_after.lock().await.push(after_id);

        if self
            .upstream
            .failing_fetches
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |remaining| {
                remaining.checked_sub(1)
            })
            .is_ok()
        {
            return Err(AppError::Unavailable("simulated upstream outage".to_owned()));
        }

        let pending: Vec<Update> = self
            .upstream
            .updates
            .lock()
            .await
            .iter()
            .filter(|update| update.update_id() > after_id)
            .take(usize::try_from(limit).unwrap_or(usize::MAX))
            .cloned()
            .collect();

        if pending.is_empty() {
            tokio::time::sleep(timeout).await;
        }

        Ok(pending)
    }

    async fn close(&self) -> AppResult<()> {
        self.upstream.sessions_closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
struct FakeProcessor {
    attempts: Mutex<Vec<i64>>,
    processed: Mutex<Vec<i64>>,
    poisoned: HashSet<i64>,
}

impl FakeProcessor {
    fn poisoned(ids: impl IntoIterator<Item = i64>) -> Arc<Self> {
        Arc::new(Self {
            poisoned: ids.into_iter().collect(),
            ..Self::default()
        })
    }
}

#[async_trait]
impl UpdateProcessor for FakeProcessor {
    async fn process(&self, update: &Update) -> AppResult<()> {
        self.attempts.lock().await.push(update.update_id());
        if self.poisoned.contains(&update.update_id()) {
            return Err(AppError::Internal("simulated processing failure".to_owned()));
        }

        self.processed.lock().await.push(update.update_id());
        Ok(())
    }
}

fn polling_config(failure_policy: ProcessingFailurePolicy) -> PollingConfig {
    PollingConfig {
        limit: 10,
        timeout: Duration::from_secs(2),
        retry_backoff: Duration::from_millis(500),
        max_processing_attempts: 3,
        failure_policy,
        drain_grace: Duration::from_secs(1),
    }
}

fn build_coordinator(
    backend: &Arc<FakeCoordinationBackend>,
    name: &str,
    upstream: &Arc<FakeUpstream>,
    processor: &Arc<FakeProcessor>,
    failure_policy: ProcessingFailurePolicy,
) -> PollingCoordinator {
    let instance_id = InstanceId::from_value(name).unwrap_or_else(|_| unreachable!());
    let (election, events) =
        LeaderElection::new(backend.clone(), test_election_config(), instance_id);
    let coordinator = PollingCoordinator::new(
        election,
        events,
        Arc::new(Arc::clone(upstream)),
        processor.clone(),
        polling_config(failure_policy),
    );
    assert!(coordinator.is_ok());
    coordinator.unwrap_or_else(|_| unreachable!())
}

async fn wait_for_state(coordinator: &PollingCoordinator, state: CoordinatorState) -> bool {
    let mut states = coordinator.subscribe_state();
    tokio::time::timeout(
        Duration::from_secs(60),
        states.wait_for(|current| *current == state),
    )
    .await
    .is_ok_and(|result| result.is_ok())
}

async fn wait_for_processed(processor: &FakeProcessor, count: usize) -> bool {
    for _ in 0..600 {
        if processor.processed.lock().await.len() >= count {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    false
}

async fn checkpoint(backend: &FakeCoordinationBackend) -> Option<i64> {
    backend.checkpoints.lock().await.get("bot_test/offset").copied()
}

async fn checkpoint_writes(backend: &FakeCoordinationBackend) -> Vec<i64> {
    backend.checkpoint_writes.lock().await.clone()
}

#[tokio::test(start_paused = true)]
async fn leader_processes_and_checkpoints_in_order() {
    let backend = Arc::new(FakeCoordinationBackend::default());
    let upstream = FakeUpstream::with_updates([3, 1, 2, 5, 4]);
    let processor = Arc::new(FakeProcessor::default());
    let coordinator = build_coordinator(
        &backend,
        "a",
        &upstream,
        &processor,
        ProcessingFailurePolicy::Skip,
    );

    assert_eq!(coordinator.state(), CoordinatorState::Stopped);
    assert!(coordinator.start().await.is_ok());
    assert!(coordinator.is_running());
    assert!(wait_for_state(&coordinator, CoordinatorState::Active).await);
    assert!(wait_for_processed(&processor, 5).await);

    assert_eq!(*processor.processed.lock().await, vec![1, 2, 3, 4, 5]);
    assert_eq!(checkpoint(&backend).await, Some(5));
    assert_eq!(checkpoint_writes(&backend).await, vec![1, 2, 3, 4, 5]);
    assert_eq!(upstream.fetched_after.lock().await.first(), Some(&0));

    coordinator.stop().await;
    assert_eq!(coordinator.state(), CoordinatorState::Stopped);
    assert!(!coordinator.is_running());
    assert_eq!(upstream.sessions_opened.load(Ordering::SeqCst), 1);
    assert_eq!(upstream.sessions_closed.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn new_leader_resumes_after_durable_checkpoint() {
    let backend = Arc::new(FakeCoordinationBackend::default());
    backend
        .checkpoints
        .lock()
        .await
        .insert("bot_test/offset".to_owned(), 3);
    let upstream = FakeUpstream::with_updates(1..=5);
    let processor = Arc::new(FakeProcessor::default());
    let coordinator = build_coordinator(
        &backend,
        "a",
        &upstream,
        &processor,
        ProcessingFailurePolicy::Skip,
    );

    assert!(coordinator.start().await.is_ok());
    assert!(wait_for_processed(&processor, 2).await);

    assert_eq!(upstream.fetched_after.lock().await.first(), Some(&3));
    assert_eq!(*processor.processed.lock().await, vec![4, 5]);
    assert_eq!(checkpoint(&backend).await, Some(5));

    coordinator.stop().await;
}

#[tokio::test(start_paused = true)]
async fn fetch_errors_back_off_without_stopping_the_loop() {
    let backend = Arc::new(FakeCoordinationBackend::default());
    let upstream = FakeUpstream::with_updates(1..=2);
    upstream.failing_fetches.store(2, Ordering::SeqCst);
    let processor = Arc::new(FakeProcessor::default());
    let coordinator = build_coordinator(
        &backend,
        "a",
        &upstream,
        &processor,
        ProcessingFailurePolicy::Skip,
    );

    assert!(coordinator.start().await.is_ok());
    assert!(wait_for_processed(&processor, 2).await);

    let fetched_after = upstream.fetched_after.lock().await.clone();
    assert!(fetched_after.len() >= 3);
    assert_eq!(&fetched_after[..3], &[0, 0, 0]);
    assert_eq!(coordinator.state(), CoordinatorState::Active);

    coordinator.stop().await;
}

#[tokio::test(start_paused = true)]
async fn poison_update_is_skipped_after_max_attempts() {
    let backend = Arc::new(FakeCoordinationBackend::default());
    let upstream = FakeUpstream::with_updates(1..=3);
    let processor = FakeProcessor::poisoned([2]);
    let coordinator = build_coordinator(
        &backend,
        "a",
        &upstream,
        &processor,
        ProcessingFailurePolicy::Skip,
    );

    assert!(coordinator.start().await.is_ok());
    assert!(wait_for_processed(&processor, 2).await);

    assert_eq!(*processor.attempts.lock().await, vec![1, 2, 2, 2, 3]);
    assert_eq!(*processor.processed.lock().await, vec![1, 3]);
    assert_eq!(checkpoint(&backend).await, Some(3));
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(checkpoint_writes(&backend).await, vec![1, 2, 3]);

    coordinator.stop().await;
}

#[tokio::test(start_paused = true)]
async fn halt_policy_stops_polling_at_the_failing_update() {
    let backend = Arc::new(FakeCoordinationBackend::default());
    let upstream = FakeUpstream::with_updates(1..=3);
    let processor = FakeProcessor::poisoned([2]);
    let coordinator = build_coordinator(
        &backend,
        "a",
        &upstream,
        &processor,
        ProcessingFailurePolicy::Halt,
    );

    assert!(coordinator.start().await.is_ok());
    assert!(wait_for_processed(&processor, 1).await);
    tokio::time::sleep(Duration::from_secs(30)).await;

    assert_eq!(*processor.attempts.lock().await, vec![1, 2, 2, 2]);
    assert_eq!(checkpoint(&backend).await, Some(1));
    assert!(coordinator.election().is_leader());

    coordinator.stop().await;
    assert_eq!(upstream.sessions_closed.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn resign_policy_hands_the_failing_update_to_a_standby() {
    let backend = Arc::new(FakeCoordinationBackend::default());
    let upstream = FakeUpstream::with_updates(1..=3);
    let first_processor = FakeProcessor::poisoned([2]);
    let second_processor = Arc::new(FakeProcessor::default());
    let first = build_coordinator(
        &backend,
        "a",
        &upstream,
        &first_processor,
        ProcessingFailurePolicy::Resign,
    );
    let second = build_coordinator(
        &backend,
        "b",
        &upstream,
        &second_processor,
        ProcessingFailurePolicy::Resign,
    );

    assert!(first.start().await.is_ok());
    assert!(wait_for_state(&first, CoordinatorState::Active).await);
    assert!(second.start().await.is_ok());

    assert!(wait_for_processed(&second_processor, 2).await);
    assert_eq!(*second_processor.processed.lock().await, vec![2, 3]);
    assert_eq!(*first_processor.processed.lock().await, vec![1]);
    assert_eq!(checkpoint(&backend).await, Some(3));
    assert_eq!(first.state(), CoordinatorState::Standby);

    first.stop().await;
    second.stop().await;
}

#[tokio::test(start_paused = true)]
async fn leadership_loss_drains_and_reacquires_session() {
    let backend = Arc::new(FakeCoordinationBackend::default());
    let upstream = FakeUpstream::with_updates(1..=2);
    let processor = Arc::new(FakeProcessor::default());
    let coordinator = build_coordinator(
        &backend,
        "a",
        &upstream,
        &processor,
        ProcessingFailurePolicy::Skip,
    );

    assert!(coordinator.start().await.is_ok());
    assert!(wait_for_processed(&processor, 2).await);

    let mut states = coordinator.subscribe_state();
    backend.revoke("bot_test/election").await;
    let drained = tokio::time::timeout(
        Duration::from_secs(30),
        states.wait_for(|state| *state == CoordinatorState::Standby),
    )
    .await
    .is_ok_and(|result| result.is_ok());
    assert!(drained);
    drop(states);

    assert!(wait_for_state(&coordinator, CoordinatorState::Active).await);
    assert_eq!(upstream.sessions_closed.load(Ordering::SeqCst), 1);
    assert_eq!(upstream.sessions_opened.load(Ordering::SeqCst), 2);
    assert_eq!(*processor.processed.lock().await, vec![1, 2]);

    coordinator.stop().await;
    assert_eq!(upstream.sessions_closed.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn stop_is_idempotent_and_final() {
    let backend = Arc::new(FakeCoordinationBackend::default());
    let upstream = FakeUpstream::with_updates(1..=1);
    let processor = Arc::new(FakeProcessor::default());
    let coordinator = build_coordinator(
        &backend,
        "a",
        &upstream,
        &processor,
        ProcessingFailurePolicy::Skip,
    );

    assert!(coordinator.start().await.is_ok());
    assert!(coordinator.start().await.is_ok());
    assert!(wait_for_processed(&processor, 1).await);

    coordinator.stop().await;
    coordinator.stop().await;

    assert_eq!(coordinator.state(), CoordinatorState::Stopped);
    assert_eq!(upstream.sessions_opened.load(Ordering::SeqCst), 1);
    assert_eq!(upstream.sessions_closed.load(Ordering::SeqCst), 1);
    assert!(!coordinator.election().is_leader());
    assert!(matches!(
        coordinator.start().await,
        Err(AppError::Conflict(_))
    ));
}

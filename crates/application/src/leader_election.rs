//! Lease-based leader election over a coordination backend.
//!
//! Exactly one of the instances sharing an [`ElectionConfig`] holds the
//! election key at a time. The holder renews the key's lease every third of
//! the TTL; any instance that cannot renew steps down before the backend
//! could hand the key to someone else. Transitions are reported as
//! [`LeadershipEvent`]s on the channel returned by [`LeaderElection::new`].

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use habot_core::{AppError, AppResult, InstanceId};
use habot_domain::{Checkpoint, ElectionState, LeadershipEvent};
use tokio::sync::{Mutex, Notify, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::ElectionConfig;
use crate::coordination_ports::{CoordinationBackend, CoordinationLease};

mod campaign;

/// Receiving half of the leadership event stream.
pub type LeadershipEvents = mpsc::UnboundedReceiver<LeadershipEvent>;

/// Leader election engine for one process.
#[derive(Clone)]
pub struct LeaderElection {
    inner: Arc<ElectionInner>,
}

struct ElectionInner {
    backend: Arc<dyn CoordinationBackend>,
    config: ElectionConfig,
    instance_id: InstanceId,
    election_key: String,
    checkpoint_key: String,
    is_leader: AtomicBool,
    state: watch::Sender<ElectionState>,
    lease: Mutex<Option<CoordinationLease>>,
    events: mpsc::UnboundedSender<LeadershipEvent>,
    control: Mutex<ElectionControl>,
    last_term: AtomicU64,
    resign_term: AtomicU64,
    resign: Notify,
}

#[derive(Default)]
struct ElectionControl {
    shutdown: Option<watch::Sender<bool>>,
    task: Option<JoinHandle<()>>,
}

impl LeaderElection {
    /// Creates an idle engine and the stream its leadership events are sent on.
    #[must_use]
    pub fn new(
        backend: Arc<dyn CoordinationBackend>,
        config: ElectionConfig,
        instance_id: InstanceId,
    ) -> (Self, LeadershipEvents) {
        let (events, receiver) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(ElectionState::Idle);
        let election_key = config.election_key();
        let checkpoint_key = config.checkpoint_key();

        let election = Self {
            inner: Arc::new(ElectionInner {
                backend,
                config,
                instance_id,
                election_key,
                checkpoint_key,
                is_leader: AtomicBool::new(false),
                state,
                lease: Mutex::new(None),
                events,
                control: Mutex::new(ElectionControl::default()),
                last_term: AtomicU64::new(0),
                resign_term: AtomicU64::new(0),
                resign: Notify::new(),
            }),
        };

        (election, receiver)
    }

    /// Starts campaigning. Returns once the campaign task is scheduled.
    ///
    /// Calling `start` on a running engine is a no-op; a stopped engine
    /// cannot be restarted.
    pub async fn start(&self) -> AppResult<()> {
        let mut control = self.inner.control.lock().await;
        let state = self.state();
        match state {
            ElectionState::Idle => {}
            ElectionState::Stopped => {
                return Err(AppError::Conflict(
                    "leader election was stopped and cannot be restarted".to_owned(),
                ));
            }
            ElectionState::Campaigning | ElectionState::Leader | ElectionState::Demoted => {
                return Ok(());
            }
        }

        let (shutdown, shutdown_receiver) = watch::channel(false);
        self.inner.set_state(ElectionState::Campaigning);

        let inner = Arc::clone(&self.inner);
        control.task = Some(tokio::spawn(async move {
            inner.run(shutdown_receiver).await;
        }));
        control.shutdown = Some(shutdown);

        info!(
            instance_id = %self.inner.instance_id,
            election_key = %self.inner.election_key,
            lease_ttl_ms = self.inner.config.lease_ttl().as_millis(),
            "leader election started"
        );

        Ok(())
    }

    /// Stops the engine, relinquishing the election key when held.
    ///
    /// Idempotent. When this instance was leader the pairing `Lost` event is
    /// sent before `stop` returns; nothing is sent afterwards.
    pub async fn stop(&self) {
        let mut control = self.inner.control.lock().await;
        if let Some(shutdown) = control.shutdown.take() {
            shutdown.send_replace(true);
        }

        if let Some(task) = control.task.take() {
            if let Err(error) = task.await {
                warn!(
                    instance_id = %self.inner.instance_id,
                    error = %error,
                    "leader election task terminated abnormally"
                );
            }

            info!(instance_id = %self.inner.instance_id, "leader election stopped");
        }

        self.inner.is_leader.store(false, Ordering::SeqCst);
        self.inner.set_state(ElectionState::Stopped);
    }

    /// Relinquishes leadership for the current term and re-campaigns after
    /// the campaign retry interval. No-op when not leader.
    pub fn resign(&self) {
        if self.is_leader() {
            let term = self.inner.last_term.load(Ordering::SeqCst);
            self.inner.resign_term.store(term, Ordering::SeqCst);
            self.inner.resign.notify_one();
        }
    }

    /// Returns the last known leadership flag. May briefly lag the backend.
    #[must_use]
    pub fn is_leader(&self) -> bool {
        self.inner.is_leader.load(Ordering::SeqCst)
    }

    /// Returns the current election state.
    #[must_use]
    pub fn state(&self) -> ElectionState {
        *self.inner.state.borrow()
    }

    /// Subscribes to election state changes.
    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<ElectionState> {
        self.inner.state.subscribe()
    }

    /// Returns this process's identity.
    #[must_use]
    pub fn instance_id(&self) -> &InstanceId {
        &self.inner.instance_id
    }

    /// Returns the identity of the instance currently holding the election key.
    pub async fn current_leader(&self) -> AppResult<Option<String>> {
        let token = self
            .inner
            .call(
                self.inner
                    .backend
                    .current_holder(self.inner.election_key.as_str()),
            )
            .await?;

        Ok(token.map(|token| CoordinationLease::holder_of(token.as_str()).to_owned()))
    }

    /// Persists the processing offset.
    ///
    /// Fails with [`AppError::Conflict`] when this instance does not hold the
    /// lease, or the backend fenced the write because the lease moved on. A
    /// failure does not prove demotion; the `Lost` event does.
    pub async fn save_offset(&self, value: i64) -> AppResult<()> {
        let checkpoint = Checkpoint::new(value)?;
        let lease = self.inner.lease.lock().await.clone().ok_or_else(|| {
            AppError::Conflict("cannot save offset: instance is not the leader".to_owned())
        })?;

        let written = self
            .inner
            .call(self.inner.backend.write_checkpoint(
                &lease,
                self.inner.checkpoint_key.as_str(),
                checkpoint.value(),
            ))
            .await?;

        if !written {
            return Err(AppError::Conflict(format!(
                "checkpoint write of offset {value} was fenced: lease no longer held"
            )));
        }

        debug!(instance_id = %self.inner.instance_id, offset = value, "checkpoint saved");
        Ok(())
    }

    /// Loads the last durable checkpoint, zero when none was written yet.
    pub async fn load_offset(&self) -> AppResult<Checkpoint> {
        let value = self
            .inner
            .call(
                self.inner
                    .backend
                    .read_checkpoint(self.inner.checkpoint_key.as_str()),
            )
            .await?;

        value.map_or(Ok(Checkpoint::default()), Checkpoint::new)
    }
}

impl ElectionInner {
    fn set_state(&self, state: ElectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(
                instance_id = %self.instance_id,
                from = previous.as_str(),
                to = state.as_str(),
                "election state changed"
            );
        }
    }

    fn emit(&self, event: LeadershipEvent) {
        if self.events.send(event).is_err() {
            debug!(
                instance_id = %self.instance_id,
                term = event.term(),
                "leadership event dropped: no receiver"
            );
        }
    }

    async fn call<T>(&self, operation: impl Future<Output = AppResult<T>>) -> AppResult<T> {
        tokio::time::timeout(self.config.backend_call_timeout(), operation)
            .await
            .map_err(|_| {
                AppError::Unavailable("coordination backend call timed out".to_owned())
            })?
    }
}

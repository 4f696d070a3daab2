//! Leadership-gated lifecycle for the long-polling loop.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use habot_core::{AppError, AppResult};
use habot_domain::{CoordinatorState, LeadershipEvent};
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::PollingConfig;
use crate::leader_election::{LeaderElection, LeadershipEvents};
use crate::upstream_ports::{UpdateProcessor, UpdateSession, UpdateSource};

mod poll_loop;

use poll_loop::{PollExit, PollLoop};

/// Runs the poll-process-checkpoint loop only while this instance leads.
#[derive(Clone)]
pub struct PollingCoordinator {
    inner: Arc<CoordinatorInner>,
}

struct CoordinatorInner {
    election: LeaderElection,
    source: Arc<dyn UpdateSource>,
    processor: Arc<dyn UpdateProcessor>,
    config: PollingConfig,
    is_running: AtomicBool,
    state: watch::Sender<CoordinatorState>,
    events: Mutex<Option<LeadershipEvents>>,
    lifecycle: Mutex<Lifecycle>,
    active: Mutex<Option<ActivePoll>>,
}

#[derive(Default)]
struct Lifecycle {
    dispatcher: Option<JoinHandle<()>>,
    dispatcher_shutdown: Option<watch::Sender<bool>>,
}

struct ActivePoll {
    term: u64,
    session: Arc<dyn UpdateSession>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<PollExit>,
}

impl PollingCoordinator {
    /// Creates a stopped coordinator around an idle election engine.
    pub fn new(
        election: LeaderElection,
        events: LeadershipEvents,
        source: Arc<dyn UpdateSource>,
        processor: Arc<dyn UpdateProcessor>,
        config: PollingConfig,
    ) -> AppResult<Self> {
        config.validate()?;
        let (state, _) = watch::channel(CoordinatorState::Stopped);

        Ok(Self {
            inner: Arc::new(CoordinatorInner {
                election,
                source,
                processor,
                config,
                is_running: AtomicBool::new(false),
                state,
                events: Mutex::new(Some(events)),
                lifecycle: Mutex::new(Lifecycle::default()),
                active: Mutex::new(None),
            }),
        })
    }

    /// Starts campaigning for leadership without waiting for it.
    ///
    /// Idempotent while running. When the election engine fails to start the
    /// coordinator is stopped and the error returned.
    pub async fn start(&self) -> AppResult<()> {
        let mut lifecycle = self.inner.lifecycle.lock().await;
        if self.inner.is_running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let Some(events) = self.inner.events.lock().await.take() else {
            self.inner.is_running.store(false, Ordering::SeqCst);
            return Err(AppError::Conflict(
                "polling coordinator was stopped and cannot be restarted".to_owned(),
            ));
        };

        self.inner.set_state(CoordinatorState::Starting);
        info!(
            instance_id = %self.inner.election.instance_id(),
            "starting polling coordinator"
        );

        if let Err(error) = self.inner.election.start().await {
            error!(
                instance_id = %self.inner.election.instance_id(),
                error = %error,
                "polling coordinator failed to start"
            );
            drop(lifecycle);
            self.stop().await;
            return Err(error);
        }

        self.inner.set_state(CoordinatorState::Standby);
        let (dispatcher_shutdown, shutdown_receiver) = watch::channel(false);
        let inner = Arc::clone(&self.inner);
        lifecycle.dispatcher = Some(tokio::spawn(async move {
            inner.dispatch(events, shutdown_receiver).await;
        }));
        lifecycle.dispatcher_shutdown = Some(dispatcher_shutdown);

        Ok(())
    }

    /// Stops polling and campaigning, blocking until every task is drained
    /// and the upstream session is closed. Idempotent.
    pub async fn stop(&self) {
        let mut lifecycle = self.inner.lifecycle.lock().await;
        let was_running = self.inner.is_running.swap(false, Ordering::SeqCst);
        if was_running {
            info!(
                instance_id = %self.inner.election.instance_id(),
                "stopping polling coordinator"
            );
        }

        self.inner.election.stop().await;

        if let Some(shutdown) = lifecycle.dispatcher_shutdown.take() {
            shutdown.send_replace(true);
        }

        if let Some(dispatcher) = lifecycle.dispatcher.take() {
            if let Err(error) = dispatcher.await {
                warn!(error = %error, "leadership dispatcher terminated abnormally");
            }
        }

        self.inner.drain(None).await;
        self.inner.set_state(CoordinatorState::Stopped);
        if was_running {
            info!(
                instance_id = %self.inner.election.instance_id(),
                "polling coordinator stopped"
            );
        }
    }

    /// Returns whether the coordinator is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.inner.is_running.load(Ordering::SeqCst)
    }

    /// Returns the current lifecycle state.
    #[must_use]
    pub fn state(&self) -> CoordinatorState {
        self.inner.state()
    }

    /// Subscribes to lifecycle state changes.
    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<CoordinatorState> {
        self.inner.state.subscribe()
    }

    /// Returns the election engine gating this coordinator.
    #[must_use]
    pub fn election(&self) -> &LeaderElection {
        &self.inner.election
    }
}

impl CoordinatorInner {
    fn state(&self) -> CoordinatorState {
        *self.state.borrow()
    }

    fn set_state(&self, state: CoordinatorState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(
                from = previous.as_str(),
                to = state.as_str(),
                "coordinator state changed"
            );
        }
    }

    async fn dispatch(
        self: Arc<Self>,
        mut events: LeadershipEvents,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            // Pending events win over shutdown so every `Lost` is handled.
            let event = tokio::select! {
                biased;
                event = events.recv() => event,
                _ = shutdown.changed() => None,
            };

            match event {
                Some(LeadershipEvent::Elected { term }) => self.activate(term).await,
                Some(LeadershipEvent::Lost { term }) => self.drain(Some(term)).await,
                None => break,
            }
        }
    }

    async fn activate(&self, term: u64) {
        if !self.is_running.load(Ordering::SeqCst) {
            return;
        }

        if self.active.lock().await.is_some() {
            warn!(term, "leadership elected while a poll task is still active");
            self.drain(None).await;
        }

        let session: Arc<dyn UpdateSession> = match self.source.open_session().await {
            Ok(session) => Arc::from(session),
            Err(error) => {
                error!(term, error = %error, "failed to open upstream session, resigning");
                self.election.resign();
                return;
            }
        };

        let checkpoint = match self.election.load_offset().await {
            Ok(checkpoint) => checkpoint,
            Err(error) => {
                error!(term, error = %error, "failed to load checkpoint, resigning");
                close_session(session.as_ref(), term).await;
                self.election.resign();
                return;
            }
        };

        let (shutdown, shutdown_receiver) = watch::channel(false);
        let poll = PollLoop::new(
            self.election.clone(),
            Arc::clone(&session),
            Arc::clone(&self.processor),
            self.config.clone(),
            term,
            checkpoint,
        );
        let task = tokio::spawn(poll.run(shutdown_receiver));

        *self.active.lock().await = Some(ActivePoll {
            term,
            session,
            shutdown,
            task,
        });
        self.set_state(CoordinatorState::Active);
        info!(
            instance_id = %self.election.instance_id(),
            term,
            offset = checkpoint.value(),
            "leader polling started"
        );
    }

    /// Cancels the active poll task and closes its session. `term` limits the
    /// drain to the poll task started for that term.
    async fn drain(&self, term: Option<u64>) {
        let active = {
            let mut active = self.active.lock().await;
            let owns_term = match (active.as_ref(), term) {
                (Some(poll), Some(term)) => poll.term == term,
                (Some(_), None) => true,
                (None, _) => false,
            };
            if owns_term { active.take() } else { None }
        };

        let Some(active) = active else {
            return;
        };

        self.set_state(CoordinatorState::Draining);
        active.shutdown.send_replace(true);

        let mut task = active.task;
        match tokio::time::timeout(self.config.drain_grace, &mut task).await {
            Ok(Ok(exit)) => debug!(term = active.term, exit = exit.as_str(), "poll task finished"),
            Ok(Err(error)) => {
                warn!(term = active.term, error = %error, "poll task terminated abnormally");
            }
            Err(_) => {
                warn!(term = active.term, "poll task exceeded drain grace, aborting");
                task.abort();
                if let Err(error) = task.await {
                    debug!(term = active.term, error = %error, "aborted poll task joined");
                }
            }
        }

        close_session(active.session.as_ref(), active.term).await;

        let next = if self.is_running.load(Ordering::SeqCst) {
            CoordinatorState::Standby
        } else {
            CoordinatorState::Stopped
        };
        self.set_state(next);
        info!(
            instance_id = %self.election.instance_id(),
            term = active.term,
            "leader polling stopped"
        );
    }
}

async fn close_session(session: &dyn UpdateSession, term: u64) {
    if let Err(error) = session.close().await {
        warn!(term, error = %error, "failed to close upstream session");
    }
}

#[cfg(test)]
mod tests;

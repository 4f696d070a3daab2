use std::sync::Arc;
use std::time::Duration;

use habot_core::{AppError, AppResult};
use habot_domain::{Checkpoint, ProcessingFailurePolicy, Update};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::PollingConfig;
use crate::leader_election::LeaderElection;
use crate::upstream_ports::{UpdateProcessor, UpdateSession};

/// Slack on top of the long-polling timeout before a fetch counts as hung.
const FETCH_TIMEOUT_MARGIN: Duration = Duration::from_secs(10);

/// Why the poll task ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum PollExit {
    Shutdown,
    LeadershipLost,
    Resigned,
    Halted,
}

impl PollExit {
    pub(super) fn as_str(self) -> &'static str {
        match self {
            Self::Shutdown => "shutdown",
            Self::LeadershipLost => "leadership_lost",
            Self::Resigned => "resigned",
            Self::Halted => "halted",
        }
    }
}

enum BatchOutcome {
    Completed,
    Retry,
    Exit(PollExit),
}

/// Poll-process-checkpoint loop for one leadership term.
pub(super) struct PollLoop {
    election: LeaderElection,
    session: Arc<dyn UpdateSession>,
    processor: Arc<dyn UpdateProcessor>,
    config: PollingConfig,
    term: u64,
    offset: Checkpoint,
    failing_update: Option<(i64, u32)>,
}

impl PollLoop {
    pub(super) fn new(
        election: LeaderElection,
        session: Arc<dyn UpdateSession>,
        processor: Arc<dyn UpdateProcessor>,
        config: PollingConfig,
        term: u64,
        offset: Checkpoint,
    ) -> Self {
        Self {
            election,
            session,
            processor,
            config,
            term,
            offset,
            failing_update: None,
        }
    }

    pub(super) async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> PollExit {
        info!(
            term = self.term,
            offset = self.offset.value(),
            "long polling loop started"
        );

        loop {
            if *shutdown.borrow() {
                return PollExit::Shutdown;
            }

            if !self.election.is_leader() {
                return PollExit::LeadershipLost;
            }

            let fetched = tokio::select! {
                _ = shutdown.changed() => return PollExit::Shutdown,
                fetched = self.fetch() => fetched,
            };

            let outcome = match fetched {
                Ok(updates) if updates.is_empty() => BatchOutcome::Completed,
                Ok(updates) => self.process_batch(updates, &shutdown).await,
                Err(error) => {
                    warn!(
                        term = self.term,
                        offset = self.offset.value(),
                        error = %error,
                        "failed to fetch updates"
                    );
                    BatchOutcome::Retry
                }
            };

            match outcome {
                BatchOutcome::Completed => {}
                BatchOutcome::Retry => {
                    tokio::select! {
                        _ = shutdown.changed() => return PollExit::Shutdown,
                        () = tokio::time::sleep(self.config.retry_backoff) => {}
                    }
                }
                BatchOutcome::Exit(exit) => return exit,
            }
        }
    }

    async fn fetch(&self) -> AppResult<Vec<Update>> {
        let request = self.session.fetch_updates(
            self.offset.value(),
            self.config.limit,
            self.config.timeout,
        );

        tokio::time::timeout(self.config.timeout + FETCH_TIMEOUT_MARGIN, request)
            .await
            .map_err(|_| AppError::Unavailable("upstream fetch timed out".to_owned()))?
    }

    async fn process_batch(
        &mut self,
        mut updates: Vec<Update>,
        shutdown: &watch::Receiver<bool>,
    ) -> BatchOutcome {
        updates.sort_by_key(Update::update_id);

        for update in updates {
            if *shutdown.borrow() {
                return BatchOutcome::Exit(PollExit::Shutdown);
            }

            if !self.election.is_leader() {
                return BatchOutcome::Exit(PollExit::LeadershipLost);
            }

            let update_id = update.update_id();
            if !self.offset.is_pending(update_id) {
                debug!(term = self.term, update_id, "skipping already processed update");
                continue;
            }

            let error = match self.processor.process(&update).await {
                Ok(()) => {
                    self.failing_update = None;
                    self.commit(update_id).await;
                    continue;
                }
                Err(error) => error,
            };

            let attempts = self.record_failure(update_id);
            warn!(
                term = self.term,
                update_id,
                attempts,
                error = %error,
                "failed to process update"
            );

            if attempts < self.config.max_processing_attempts {
                return BatchOutcome::Retry;
            }

            self.failing_update = None;
            let policy = self.config.failure_policy;
            error!(
                term = self.term,
                update_id,
                attempts,
                policy = policy.as_str(),
                "update keeps failing, applying failure policy"
            );

            match policy {
                ProcessingFailurePolicy::Skip => self.commit(update_id).await,
                ProcessingFailurePolicy::Resign => {
                    self.election.resign();
                    return BatchOutcome::Exit(PollExit::Resigned);
                }
                ProcessingFailurePolicy::Halt => return BatchOutcome::Exit(PollExit::Halted),
            }
        }

        BatchOutcome::Completed
    }

    fn record_failure(&mut self, update_id: i64) -> u32 {
        let attempts = match self.failing_update {
            Some((failing_id, attempts)) if failing_id == update_id => attempts.saturating_add(1),
            _ => 1,
        };
        self.failing_update = Some((update_id, attempts));
        attempts
    }

    /// Advances the in-memory offset and persists it while still leader.
    /// A failed write is logged only; demotion arrives as a `Lost` event.
    async fn commit(&mut self, update_id: i64) {
        if !self.offset.advance(update_id) {
            return;
        }

        if !self.election.is_leader() {
            debug!(
                term = self.term,
                update_id, "leadership flag cleared, checkpoint write skipped"
            );
            return;
        }

        if let Err(error) = self.election.save_offset(update_id).await {
            warn!(
                term = self.term,
                update_id,
                error = %error,
                "failed to save checkpoint"
            );
        }
    }
}

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use habot_domain::{ElectionState, LeadershipEvent};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::ElectionInner;
use crate::coordination_ports::CoordinationLease;

/// Why one leadership term ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TermExit {
    Shutdown,
    Resigned,
    LeaseLost,
    DeadlineMissed,
}

impl TermExit {
    fn as_str(self) -> &'static str {
        match self {
            Self::Shutdown => "shutdown",
            Self::Resigned => "resigned",
            Self::LeaseLost => "lease_lost",
            Self::DeadlineMissed => "deadline_missed",
        }
    }
}

impl ElectionInner {
    pub(super) async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                break;
            }

            self.set_state(ElectionState::Campaigning);
            let attempt = self
                .call(self.backend.try_acquire_lease(
                    self.election_key.as_str(),
                    self.instance_id.as_str(),
                    self.config.lease_ttl(),
                ))
                .await;

            match attempt {
                Ok(Some(lease)) => {
                    let delay = match self.lead(lease, &mut shutdown).await {
                        TermExit::Shutdown => break,
                        TermExit::Resigned => {
                            self.config.campaign_retry_interval()
                                + jitter(self.config.max_rejoin_jitter())
                        }
                        TermExit::LeaseLost | TermExit::DeadlineMissed => {
                            jitter(self.config.max_rejoin_jitter())
                        }
                    };

                    if !pause(delay, &mut shutdown).await {
                        break;
                    }
                }
                Ok(None) => {
                    debug!(
                        instance_id = %self.instance_id,
                        "election key is held by another instance, watching for release"
                    );
                    if !self.watch_for_release(&mut shutdown).await {
                        break;
                    }
                }
                Err(error) => {
                    warn!(
                        instance_id = %self.instance_id,
                        error = %error,
                        "election campaign attempt failed"
                    );
                    let delay = self.config.campaign_retry_interval()
                        + jitter(self.config.max_rejoin_jitter());
                    if !pause(delay, &mut shutdown).await {
                        break;
                    }
                }
            }
        }

        self.is_leader.store(false, Ordering::SeqCst);
        self.set_state(ElectionState::Stopped);
    }

    /// Returns false when shutdown was requested while waiting.
    async fn watch_for_release(&self, shutdown: &mut watch::Receiver<bool>) -> bool {
        let retry_interval = self.config.campaign_retry_interval();
        let released = tokio::time::timeout(
            retry_interval + self.config.backend_call_timeout(),
            self.backend
                .wait_for_release(self.election_key.as_str(), retry_interval),
        );

        let outcome = tokio::select! {
            _ = shutdown.changed() => return false,
            outcome = released => outcome,
        };

        match outcome {
            Ok(Ok(())) => true,
            Ok(Err(error)) => {
                warn!(
                    instance_id = %self.instance_id,
                    error = %error,
                    "failed to watch election key"
                );
                pause(retry_interval, shutdown).await
            }
            Err(_) => true,
        }
    }

    async fn lead(
        &self,
        lease: CoordinationLease,
        shutdown: &mut watch::Receiver<bool>,
    ) -> TermExit {
        let acquired_at = Instant::now();
        let term = self.last_term.fetch_add(1, Ordering::SeqCst) + 1;

        *self.lease.lock().await = Some(lease.clone());
        self.is_leader.store(true, Ordering::SeqCst);
        self.set_state(ElectionState::Leader);
        info!(instance_id = %self.instance_id, term, "leadership acquired");
        self.emit(LeadershipEvent::Elected { term });

        let exit = self.keep_alive(&lease, term, acquired_at, shutdown).await;

        self.is_leader.store(false, Ordering::SeqCst);
        *self.lease.lock().await = None;
        if exit != TermExit::Shutdown {
            self.set_state(ElectionState::Demoted);
        }

        info!(
            instance_id = %self.instance_id,
            term,
            reason = exit.as_str(),
            "leadership lost"
        );
        self.emit(LeadershipEvent::Lost { term });

        if let Err(error) = self.call(self.backend.release_lease(&lease)).await {
            warn!(
                instance_id = %self.instance_id,
                term,
                error = %error,
                "failed to release election key"
            );
        }

        exit
    }

    async fn keep_alive(
        &self,
        lease: &CoordinationLease,
        term: u64,
        acquired_at: Instant,
        shutdown: &mut watch::Receiver<bool>,
    ) -> TermExit {
        let ttl = self.config.lease_ttl();
        let interval = self.config.keepalive_interval();
        let budget = self.config.keepalive_failure_budget();
        // Local validity ends before the backend could expire the key.
        let validity = ttl.saturating_sub(interval / 2);
        let mut last_renewed = acquired_at;
        let mut consecutive_failures = 0_u32;

        loop {
            let deadline = last_renewed + validity;
            let next_renewal = (Instant::now() + interval).min(deadline);

            tokio::select! {
                _ = shutdown.changed() => return TermExit::Shutdown,
                () = self.resign.notified() => {
                    // Permits left over from an earlier term are ignored.
                    if self.resign_term.load(Ordering::SeqCst) == term {
                        return TermExit::Resigned;
                    }
                    continue;
                }
                () = tokio::time::sleep_until(next_renewal) => {}
            }

            if Instant::now() >= deadline {
                return TermExit::DeadlineMissed;
            }

            let attempt_started = Instant::now();
            let renewed = tokio::select! {
                _ = shutdown.changed() => return TermExit::Shutdown,
                () = tokio::time::sleep_until(deadline) => {
                    warn!(
                        instance_id = %self.instance_id,
                        "election lease keepalive still pending at lease deadline"
                    );
                    return TermExit::DeadlineMissed;
                }
                renewed = self.call(self.backend.renew_lease(lease, ttl)) => renewed,
            };

            match renewed {
                Ok(true) => {
                    last_renewed = attempt_started;
                    consecutive_failures = 0;
                }
                Ok(false) => {
                    warn!(
                        instance_id = %self.instance_id,
                        "election lease is no longer held by this instance"
                    );
                    return TermExit::LeaseLost;
                }
                Err(error) => {
                    consecutive_failures = consecutive_failures.saturating_add(1);
                    warn!(
                        instance_id = %self.instance_id,
                        error = %error,
                        consecutive_failures,
                        "election lease keepalive failed"
                    );

                    if consecutive_failures > budget {
                        return TermExit::LeaseLost;
                    }

                    // The next renewal would land after the backend may
                    // already have expired the lease.
                    if Instant::now() + interval >= last_renewed + validity {
                        return TermExit::DeadlineMissed;
                    }
                }
            }
        }
    }
}

/// Sleeps for `delay`. Returns false when shutdown was requested first.
async fn pause(delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    if *shutdown.borrow() {
        return false;
    }

    tokio::select! {
        _ = shutdown.changed() => false,
        () = tokio::time::sleep(delay) => true,
    }
}

/// Uniform random delay in `[0, max]`, zero when the OS RNG is unavailable.
fn jitter(max: Duration) -> Duration {
    let max_ms = u64::try_from(max.as_millis()).unwrap_or(u64::MAX);
    if max_ms == 0 {
        return Duration::ZERO;
    }

    let mut bytes = [0_u8; 8];
    if getrandom::fill(&mut bytes).is_err() {
        return Duration::ZERO;
    }

    Duration::from_millis(u64::from_le_bytes(bytes) % max_ms.saturating_add(1))
}

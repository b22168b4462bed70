//! Worker runner: drives a [`FlagWorker`] through claim, execute, report.
//!
//! The runner wakes on `flag_created:{type}` events for the types its worker
//! handles and falls back to polling the pending queue, so a missed event
//! only costs latency. Flags are processed one at a time.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::{RwLock, mpsc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::bus::{BusEvent, handler_fn, panic_message};
use crate::config::WorkerConfig;
use crate::coordinator::FlagCoordinator;
use crate::error::{Error, WorkerError};
use crate::flags::{Flag, FlagEventKind, FlagType};
use crate::worker::state::{WorkerState, WorkerStatus};

/// What a worker produced for a flag.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorkOutcome {
    /// Payload for the completion flag. Ignored for types without one.
    pub result: Option<serde_json::Value>,
}

impl WorkOutcome {
    /// Finished with nothing to hand back.
    pub fn done() -> Self {
        Self::default()
    }

    /// Finished with a result for the session's completion flag.
    pub fn with_result(result: serde_json::Value) -> Self {
        Self {
            result: Some(result),
        }
    }
}

/// A consumer of flags. Implementations hold the domain logic only; claiming
/// and reporting are done by [`WorkerRunner`].
#[async_trait]
pub trait FlagWorker: Send + Sync {
    /// Stable identity, recorded as `agent_assigned` and used as the bus
    /// subscriber id.
    fn agent_id(&self) -> &str;

    /// Flag types this worker claims.
    fn handles(&self) -> &[FlagType];

    /// Do the work for a claimed flag.
    async fn execute(&self, flag: &Flag) -> Result<WorkOutcome, WorkerError>;
}

pub struct WorkerRunner {
    worker: Arc<dyn FlagWorker>,
    coordinator: Arc<FlagCoordinator>,
    config: WorkerConfig,
    status: RwLock<WorkerStatus>,
    shutdown_token: CancellationToken,
}

impl WorkerRunner {
    pub fn new(
        worker: Arc<dyn FlagWorker>,
        coordinator: Arc<FlagCoordinator>,
        config: WorkerConfig,
    ) -> Arc<Self> {
        let status = WorkerStatus::new(worker.agent_id());
        Arc::new(Self {
            worker,
            coordinator,
            config,
            status: RwLock::new(status),
            shutdown_token: CancellationToken::new(),
        })
    }

    /// Token that stops the runner when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    pub fn shutdown(&self) {
        self.shutdown_token.cancel();
    }

    pub fn agent_id(&self) -> &str {
        self.worker.agent_id()
    }

    pub async fn status(&self) -> WorkerStatus {
        self.status.read().await.clone()
    }

    /// Spawn the runner loop.
    pub fn start(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            self.run().await;
        })
    }

    async fn run(&self) {
        let agent_id = self.worker.agent_id().to_string();
        let (wake_tx, mut wake_rx) = mpsc::unbounded_channel::<Uuid>();

        let topics: Vec<String> = self
            .worker
            .handles()
            .iter()
            .map(|t| FlagEventKind::Created.topic(*t))
            .collect();

        let wake = handler_fn(move |event: BusEvent| {
            let wake_tx = wake_tx.clone();
            async move {
                if let Some(id) = event.flag_id() {
                    // Runner gone means nobody to wake
                    let _ = wake_tx.send(id);
                }
                Ok::<(), Error>(())
            }
        });

        if let Err(e) = self
            .coordinator
            .subscribe(agent_id.clone(), topics.clone(), wake)
            .await
        {
            warn!(agent = %agent_id, error = %e, "Subscribe failed, relying on polling");
        }

        info!(
            agent = %agent_id,
            topics = ?topics,
            poll_secs = self.config.poll_interval.as_secs_f64(),
            "Worker runner started"
        );

        // First tick fires immediately and drains any backlog.
        let mut poll = tokio::time::interval(self.config.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown_token.cancelled() => break,
                Some(id) = wake_rx.recv() => self.process(id).await,
                _ = poll.tick() => self.poll_pending().await,
            }
        }

        self.coordinator.unsubscribe(&agent_id).await;
        info!(agent = %agent_id, "Worker runner stopped");
    }

    /// Try every claimable flag of the handled types, best first.
    async fn poll_pending(&self) {
        let mut pending = Vec::new();
        for flag_type in self.worker.handles() {
            match self.coordinator.pending_flags(Some(*flag_type)).await {
                Ok(flags) => pending.extend(flags),
                Err(e) => {
                    warn!(agent = %self.agent_id(), flag_type = %flag_type, error = %e, "Pending poll failed");
                }
            }
        }

        if pending.is_empty() {
            return;
        }

        pending.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.created_at.cmp(&b.created_at))
        });

        debug!(agent = %self.agent_id(), count = pending.len(), "Polled pending flags");

        for flag in pending {
            if self.shutdown_token.is_cancelled() {
                break;
            }
            self.process(flag.id).await;
        }
    }

    /// Claim, execute and report a single flag.
    async fn process(&self, id: Uuid) {
        let agent_id = self.worker.agent_id();
        self.set_state(WorkerState::AttemptingClaim, Some(id)).await;

        let flag = match self.coordinator.claim(id, agent_id).await {
            Ok(flag) => flag,
            Err(Error::Flag(e)) if e.is_benign() => {
                debug!(flag_id = %id, agent = %agent_id, reason = %e, "Claim skipped");
                self.status.write().await.conflicts += 1;
                self.set_state(WorkerState::Idle, None).await;
                return;
            }
            Err(e) => {
                warn!(flag_id = %id, agent = %agent_id, error = %e, "Claim failed");
                self.set_state(WorkerState::Idle, None).await;
                return;
            }
        };

        self.set_state(WorkerState::Executing, Some(id)).await;
        debug!(flag_id = %id, agent = %agent_id, flag_type = %flag.flag_type, "Executing flag");

        let outcome = AssertUnwindSafe(self.worker.execute(&flag))
            .catch_unwind()
            .await;

        self.set_state(WorkerState::Reporting, Some(id)).await;

        let failure = match outcome {
            Ok(Ok(work)) => {
                self.report_success(&flag, work).await;
                None
            }
            Ok(Err(e)) => Some(e.to_string()),
            Err(panic) => {
                let err = WorkerError::Panicked {
                    agent: agent_id.to_string(),
                    id,
                };
                Some(format!("{err}: {}", panic_message(panic.as_ref())))
            }
        };

        if let Some(reason) = failure {
            self.report_failure(&flag, &reason).await;
        }

        self.set_state(WorkerState::Idle, None).await;
    }

    async fn report_success(&self, flag: &Flag, work: WorkOutcome) {
        let agent_id = self.worker.agent_id();

        match self.coordinator.complete_flag_as(flag.id, agent_id).await {
            Ok(true) => {
                self.status.write().await.completed += 1;
            }
            Ok(false) => {
                warn!(flag_id = %flag.id, agent = %agent_id, "Flag no longer held at completion");
                return;
            }
            Err(e) => {
                error!(flag_id = %flag.id, agent = %agent_id, error = %e, "Failed to complete flag");
                return;
            }
        }

        let (Some(result), Some(completion_type)) = (work.result, flag.flag_type.completion_type())
        else {
            return;
        };

        match self
            .coordinator
            .set_flag(
                completion_type,
                &flag.session_id,
                result,
                flag.priority,
                None,
            )
            .await
        {
            Ok(result_id) => debug!(
                flag_id = %flag.id,
                result_id = %result_id,
                flag_type = %completion_type,
                "Completion flag created"
            ),
            Err(e) => error!(
                flag_id = %flag.id,
                session_id = %flag.session_id,
                error = %e,
                "Failed to create completion flag"
            ),
        }
    }

    async fn report_failure(&self, flag: &Flag, reason: &str) {
        let agent_id = self.worker.agent_id();
        warn!(flag_id = %flag.id, agent = %agent_id, reason = %reason, "Worker failed flag");

        match self
            .coordinator
            .fail_flag_with_reason(flag.id, reason, Some(agent_id))
            .await
        {
            Ok(true) => self.status.write().await.failed += 1,
            Ok(false) => {
                warn!(flag_id = %flag.id, agent = %agent_id, "Flag no longer held at failure");
            }
            Err(e) => {
                error!(flag_id = %flag.id, agent = %agent_id, error = %e, "Failed to mark flag failed");
            }
        }
    }

    async fn set_state(&self, state: WorkerState, flag_id: Option<Uuid>) {
        let mut status = self.status.write().await;
        if let Err(e) = status.transition_to(state, flag_id) {
            debug!(agent = %status.agent_id, error = %e, "Unexpected worker state change");
            status.state = state;
        }
    }
}

//! Flag coordinator: the public lifecycle API.
//!
//! Composes the flag store (source of truth), the event bus (wake-up
//! signal) and a short-lived read cache. Every mutation is persisted before
//! its event is published.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bus::{EventBus, EventHandler};
use crate::cache::ReadCache;
use crate::config::{CoordinatorConfig, MaintenanceConfig};
use crate::error::{FlagError, Result};
use crate::flags::{Flag, FlagEventKind, FlagStatus, FlagType, StatusCounts};
use crate::store::FlagStore;

/// Metadata key written when a flag is failed with a reason.
pub const FAILURE_REASON_KEY: &str = "failure_reason";

pub struct FlagCoordinator {
    store: Arc<dyn FlagStore>,
    bus: Arc<EventBus>,
    config: CoordinatorConfig,
    flags: ReadCache<Uuid, Flag>,
    sessions: ReadCache<String, Vec<Flag>>,
}

impl FlagCoordinator {
    pub fn new(store: Arc<dyn FlagStore>, bus: Arc<EventBus>, config: CoordinatorConfig) -> Self {
        Self {
            flags: ReadCache::new(config.cache_ttl),
            sessions: ReadCache::new(config.cache_ttl),
            store,
            bus,
            config,
        }
    }

    pub fn store(&self) -> &Arc<dyn FlagStore> {
        &self.store
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    /// Persist a new pending flag and announce it on `flag_created:{type}`.
    ///
    /// `ttl` defaults to the configured flag TTL. Identical calls create
    /// distinct flags.
    pub async fn set_flag(
        &self,
        flag_type: FlagType,
        session_id: &str,
        data: serde_json::Value,
        priority: i64,
        ttl: Option<Duration>,
    ) -> Result<Uuid> {
        let flag = Flag::new(flag_type, session_id)
            .with_data(data)
            .with_priority(priority)
            .with_ttl(ttl.unwrap_or(self.config.default_ttl));

        self.store.create_flag(&flag).await?;
        self.sessions.invalidate(&flag.session_id).await;

        info!(
            flag_id = %flag.id,
            flag_type = %flag.flag_type,
            session_id = %flag.session_id,
            priority = flag.priority,
            "Flag created"
        );

        self.emit(
            FlagEventKind::Created,
            &flag,
            serde_json::json!({
                "flag_id": flag.id,
                "data": flag.data,
                "priority": flag.priority,
            }),
        );

        Ok(flag.id)
    }

    /// Claim a pending flag for `agent_id`, returning the claimed flag.
    ///
    /// Fails with [`FlagError::NotFound`] for unknown ids and
    /// [`FlagError::ClaimConflict`] when another worker got there first or
    /// the flag is no longer claimable.
    pub async fn claim(&self, id: Uuid, agent_id: &str) -> Result<Flag> {
        let Some(flag) = self.store.get_flag(id).await? else {
            return Err(FlagError::NotFound { id }.into());
        };

        if !flag.is_claimable() {
            debug!(flag_id = %id, agent = %agent_id, status = %flag.status, "Flag not claimable");
            return Err(FlagError::ClaimConflict { id }.into());
        }

        let won = self
            .store
            .transition_status(id, FlagStatus::Pending, FlagStatus::InProgress, Some(agent_id))
            .await?;

        if !won {
            debug!(flag_id = %id, agent = %agent_id, status = %flag.status, "Claim lost");
            return Err(FlagError::ClaimConflict { id }.into());
        }

        self.invalidate(&flag).await;

        let claimed = match self.store.get_flag(id).await? {
            Some(claimed) => claimed,
            None => return Err(FlagError::NotFound { id }.into()),
        };

        info!(
            flag_id = %id,
            flag_type = %claimed.flag_type,
            agent = %agent_id,
            "Flag claimed"
        );

        self.emit(
            FlagEventKind::Claimed,
            &claimed,
            serde_json::json!({ "flag_id": id, "agent_id": agent_id }),
        );

        Ok(claimed)
    }

    /// Boolean form of [`claim`](Self::claim): `false` on conflict or
    /// unknown id, storage errors are still returned.
    pub async fn claim_flag(&self, id: Uuid, agent_id: &str) -> Result<bool> {
        benign_to_false(self.claim(id, agent_id).await.map(|_| true))
    }

    /// Mark an in-progress flag completed.
    pub async fn complete_flag(&self, id: Uuid) -> Result<bool> {
        self.finish(id, FlagStatus::Completed, None, None).await
    }

    /// Mark an in-progress flag completed, only if `agent_id` holds it.
    pub async fn complete_flag_as(&self, id: Uuid, agent_id: &str) -> Result<bool> {
        self.finish(id, FlagStatus::Completed, Some(agent_id), None)
            .await
    }

    /// Mark an in-progress flag failed.
    pub async fn fail_flag(&self, id: Uuid) -> Result<bool> {
        self.finish(id, FlagStatus::Failed, None, None).await
    }

    /// Mark an in-progress flag failed, only if `agent_id` holds it.
    pub async fn fail_flag_as(&self, id: Uuid, agent_id: &str) -> Result<bool> {
        self.finish(id, FlagStatus::Failed, Some(agent_id), None)
            .await
    }

    /// Mark an in-progress flag failed and record `reason` in its metadata.
    /// With `agent_id`, only the assigned agent may fail it.
    pub async fn fail_flag_with_reason(
        &self,
        id: Uuid,
        reason: &str,
        agent_id: Option<&str>,
    ) -> Result<bool> {
        self.finish(id, FlagStatus::Failed, agent_id, Some(reason))
            .await
    }

    async fn finish(
        &self,
        id: Uuid,
        to: FlagStatus,
        agent_id: Option<&str>,
        reason: Option<&str>,
    ) -> Result<bool> {
        let Some(flag) = self.store.get_flag(id).await? else {
            debug!(flag_id = %id, target = %to, "Cannot finish unknown flag");
            return Ok(false);
        };

        let changed = match reason {
            Some(reason) => {
                self.store
                    .transition_with_metadata(
                        id,
                        FlagStatus::InProgress,
                        to,
                        agent_id,
                        FAILURE_REASON_KEY,
                        serde_json::json!(reason),
                    )
                    .await?
            }
            None => {
                self.store
                    .transition_status(id, FlagStatus::InProgress, to, agent_id)
                    .await?
            }
        };

        if !changed {
            debug!(
                flag_id = %id,
                status = %flag.status,
                target = %to,
                agent = ?agent_id,
                "Flag not finished: not in progress or held by another agent"
            );
            return Ok(false);
        }

        self.invalidate(&flag).await;

        let agent = agent_id.or(flag.agent_assigned.as_deref());
        match to {
            FlagStatus::Failed => warn!(
                flag_id = %id,
                flag_type = %flag.flag_type,
                agent = ?agent,
                reason = ?reason,
                "Flag failed"
            ),
            _ => info!(
                flag_id = %id,
                flag_type = %flag.flag_type,
                agent = ?agent,
                "Flag completed"
            ),
        }

        if let Some(kind) = FlagEventKind::for_status(to) {
            let mut payload = serde_json::json!({ "flag_id": id, "agent_id": agent });
            if let Some(reason) = reason {
                payload["reason"] = serde_json::json!(reason);
            }
            self.emit(kind, &flag, payload);
        }

        Ok(true)
    }

    /// Wait until a completion flag for `request_type` exists in the
    /// session, or `timeout` passes.
    ///
    /// Listens on the bus for a low-latency answer and polls the store every
    /// `poll_interval` as a safety net. Completion flags created before the
    /// call count. Types without a completion type return `false` at once.
    pub async fn wait_for_completion(
        &self,
        session_id: &str,
        request_type: FlagType,
        timeout: Duration,
    ) -> Result<bool> {
        let Some(completion_type) = request_type.completion_type() else {
            debug!(flag_type = %request_type, "No completion type, not waiting");
            return Ok(false);
        };

        // Subscribe before the first check so nothing slips between them.
        let mut events = self.bus.watch();
        let topic = FlagEventKind::Created.topic(completion_type);

        if self.store.has_flag(session_id, completion_type).await? {
            return Ok(true);
        }

        let deadline = Instant::now() + timeout;
        let mut poll = tokio::time::interval_at(
            Instant::now() + self.config.poll_interval,
            self.config.poll_interval,
        );
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut listening = true;

        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => break,
                _ = poll.tick() => {
                    if self.store.has_flag(session_id, completion_type).await? {
                        return Ok(true);
                    }
                }
                received = events.recv(), if listening => match received {
                    Ok(event) => {
                        if event.topic == topic && event.session_id.as_deref() == Some(session_id) {
                            debug!(session_id = %session_id, flag_type = %completion_type, "Completion signalled");
                            return Ok(true);
                        }
                    }
                    Err(RecvError::Lagged(n)) => {
                        debug!(skipped = n, "Completion watcher lagged, checking store");
                        if self.store.has_flag(session_id, completion_type).await? {
                            return Ok(true);
                        }
                    }
                    Err(RecvError::Closed) => listening = false,
                },
            }
        }

        let found = self.store.has_flag(session_id, completion_type).await?;
        if !found {
            info!(
                session_id = %session_id,
                flag_type = %completion_type,
                timeout_ms = timeout.as_millis() as u64,
                "Timed out waiting for completion"
            );
        }
        Ok(found)
    }

    // ── Reads ───────────────────────────────────────────────────────

    /// Cached flag lookup.
    pub async fn get_flag(&self, id: Uuid) -> Result<Option<Flag>> {
        if let Some(flag) = self.flags.get(&id).await {
            return Ok(Some(flag));
        }
        let epoch = self.flags.epoch();
        let flag = self.store.get_flag(id).await?;
        if let Some(ref flag) = flag {
            self.flags.insert_since(epoch, id, flag.clone()).await;
        }
        Ok(flag)
    }

    /// Cached list of every flag in a session, oldest first.
    pub async fn session_flags(&self, session_id: &str) -> Result<Vec<Flag>> {
        let flags = self
            .sessions
            .get_or_load(session_id.to_string(), || {
                self.store.list_session_flags(session_id, None)
            })
            .await?;
        Ok(flags)
    }

    /// Newest flag of `flag_type` in the session, e.g. the latest
    /// `prediction-complete` result.
    pub async fn latest_result(&self, session_id: &str, flag_type: FlagType) -> Result<Option<Flag>> {
        let flags = self.session_flags(session_id).await?;
        Ok(flags.into_iter().rev().find(|f| f.flag_type == flag_type))
    }

    /// Claimable flags, best first. Always read from the store.
    pub async fn pending_flags(&self, flag_type: Option<FlagType>) -> Result<Vec<Flag>> {
        Ok(self.store.list_pending(flag_type).await?)
    }

    // ── Maintenance ─────────────────────────────────────────────────

    /// Expire pending flags past their deadline.
    pub async fn sweep_expired(&self) -> Result<usize> {
        let expired = self.store.sweep_expired().await?;
        if expired > 0 {
            self.flags.clear().await;
            self.sessions.clear().await;
        }
        Ok(expired)
    }

    /// Delete terminal flags last touched more than `older_than` ago.
    pub async fn delete_terminal(&self, older_than: Duration) -> Result<usize> {
        let deleted = self.store.delete_terminal(older_than).await?;
        if deleted > 0 {
            self.flags.clear().await;
            self.sessions.clear().await;
        }
        Ok(deleted)
    }

    pub async fn status_counts(&self) -> Result<StatusCounts> {
        Ok(self.store.count_by_status().await?)
    }

    /// Spawn the periodic expiry sweep (and optional retention pruning).
    /// Runs until `token` is cancelled.
    pub fn spawn_maintenance(
        self: &Arc<Self>,
        config: MaintenanceConfig,
        token: CancellationToken,
    ) -> JoinHandle<()> {
        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            info!(
                interval_secs = config.sweep_interval.as_secs(),
                retention_secs = config.retention.map(|r| r.as_secs()),
                "Flag maintenance started"
            );

            let mut tick = tokio::time::interval(config.sweep_interval);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = tick.tick() => coordinator.run_maintenance_cycle(&config).await,
                    _ = token.cancelled() => break,
                }
            }

            info!("Flag maintenance stopped");
        })
    }

    async fn run_maintenance_cycle(&self, config: &MaintenanceConfig) {
        match self.sweep_expired().await {
            Ok(0) => debug!("No flags to expire"),
            Ok(count) => info!(count, "Expired stale pending flags"),
            Err(e) => warn!(error = %e, "Expiry sweep failed"),
        }

        if let Some(retention) = config.retention {
            match self.delete_terminal(retention).await {
                Ok(0) => {}
                Ok(count) => info!(count, "Pruned old terminal flags"),
                Err(e) => warn!(error = %e, "Retention pruning failed"),
            }
        }

        let purged = self.flags.purge_expired().await + self.sessions.purge_expired().await;
        if purged > 0 {
            debug!(purged, "Purged stale cache entries");
        }
    }

    // ── Subscriptions ───────────────────────────────────────────────

    pub async fn subscribe<I, T>(
        &self,
        subscriber_id: impl Into<String>,
        topics: I,
        handler: Arc<dyn EventHandler>,
    ) -> Result<()>
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.bus.subscribe(subscriber_id, topics, handler).await?;
        Ok(())
    }

    pub async fn unsubscribe(&self, subscriber_id: &str) -> bool {
        self.bus.unsubscribe(subscriber_id).await
    }

    // ── Internals ───────────────────────────────────────────────────

    async fn invalidate(&self, flag: &Flag) {
        self.flags.invalidate(&flag.id).await;
        self.sessions.invalidate(&flag.session_id).await;
    }

    /// Publish a lifecycle event. The flag is already persisted, so a closed
    /// bus only costs latency.
    fn emit(&self, kind: FlagEventKind, flag: &Flag, payload: serde_json::Value) {
        let topic = kind.topic(flag.flag_type);
        if let Err(e) = self.bus.publish(topic.as_str(), payload, Some(&flag.session_id)) {
            warn!(flag_id = %flag.id, topic = %topic, error = %e, "Failed to publish flag event");
        }
    }
}

fn benign_to_false(result: Result<bool>) -> Result<bool> {
    match result {
        Err(crate::error::Error::Flag(e)) if e.is_benign() => Ok(false),
        other => other,
    }
}

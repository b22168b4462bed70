//! End-to-end coordination scenarios: real workers, real store, real bus.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::time::timeout;

use action_flags::bus::EventBus;
use action_flags::config::{CoordinatorConfig, WorkerConfig};
use action_flags::coordinator::FlagCoordinator;
use action_flags::error::WorkerError;
use action_flags::flags::{Flag, FlagStatus, FlagType};
use action_flags::store::{FlagStore, LibSqlBackend};
use action_flags::worker::{FlagWorker, WorkOutcome, WorkerRunner};

const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Stand-in for a prediction agent: counts calls and returns a canned result.
struct Predictor {
    agent_id: String,
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl FlagWorker for Predictor {
    fn agent_id(&self) -> &str {
        &self.agent_id
    }

    fn handles(&self) -> &[FlagType] {
        &[FlagType::RequestPrediction]
    }

    async fn execute(&self, flag: &Flag) -> Result<WorkOutcome, WorkerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        Ok(WorkOutcome::with_result(serde_json::json!({
            "prediction": "seasonal allergy",
            "symptoms": flag.data["symptoms"].clone(),
        })))
    }
}

async fn coordinator_with(store: Arc<dyn FlagStore>) -> Arc<FlagCoordinator> {
    Arc::new(FlagCoordinator::new(
        store,
        EventBus::new(64),
        CoordinatorConfig {
            poll_interval: Duration::from_millis(100),
            ..CoordinatorConfig::default()
        },
    ))
}

async fn memory_coordinator() -> Arc<FlagCoordinator> {
    coordinator_with(Arc::new(LibSqlBackend::new_memory().await.unwrap())).await
}

fn spawn_predictor(
    coord: &Arc<FlagCoordinator>,
    agent_id: &str,
    calls: &Arc<AtomicUsize>,
) -> (Arc<WorkerRunner>, tokio::task::JoinHandle<()>) {
    let runner = WorkerRunner::new(
        Arc::new(Predictor {
            agent_id: agent_id.to_string(),
            calls: Arc::clone(calls),
        }),
        Arc::clone(coord),
        WorkerConfig {
            poll_interval: Duration::from_millis(250),
            ..WorkerConfig::default()
        },
    );
    let handle = Arc::clone(&runner).start();
    (runner, handle)
}

#[tokio::test]
async fn prediction_round_trip_completes_quickly() {
    timeout(TEST_TIMEOUT, async {
        let coord = memory_coordinator().await;
        let calls = Arc::new(AtomicUsize::new(0));
        let (runner, handle) = spawn_predictor(&coord, "predictor", &calls);
        tokio::time::sleep(Duration::from_millis(50)).await;

        let started = Instant::now();
        let id = coord
            .set_flag(
                FlagType::RequestPrediction,
                "s1",
                serde_json::json!({"symptoms": ["sneezing", "itchy eyes"]}),
                1,
                None,
            )
            .await
            .unwrap();

        let done = coord
            .wait_for_completion("s1", FlagType::RequestPrediction, Duration::from_secs(5))
            .await
            .unwrap();
        assert!(done);
        assert!(started.elapsed() < Duration::from_secs(1));

        let request = coord.store().get_flag(id).await.unwrap().unwrap();
        assert_eq!(request.status, FlagStatus::Completed);
        assert_eq!(request.agent_assigned.as_deref(), Some("predictor"));

        let result = coord
            .latest_result("s1", FlagType::PredictionComplete)
            .await
            .unwrap()
            .expect("completion flag written");
        assert_eq!(result.data["prediction"], "seasonal allergy");
        assert_eq!(result.data["symptoms"][1], "itchy eyes");

        let status = runner.status().await;
        assert_eq!(status.completed, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        runner.shutdown();
        handle.await.unwrap();
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn unclaimed_report_times_out() {
    timeout(TEST_TIMEOUT, async {
        let coord = memory_coordinator().await;
        coord
            .set_flag(
                FlagType::RequestReport,
                "s2",
                serde_json::json!({"format": "summary"}),
                0,
                None,
            )
            .await
            .unwrap();

        let started = Instant::now();
        let done = coord
            .wait_for_completion("s2", FlagType::RequestReport, Duration::from_secs(1))
            .await
            .unwrap();
        let elapsed = started.elapsed();

        assert!(!done);
        assert!(elapsed >= Duration::from_secs(1));
        assert!(elapsed < Duration::from_secs(2));

        let pending = coord.pending_flags(Some(FlagType::RequestReport)).await.unwrap();
        assert_eq!(pending.len(), 1);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn racing_workers_execute_each_flag_once() {
    timeout(TEST_TIMEOUT, async {
        let coord = memory_coordinator().await;
        let calls = Arc::new(AtomicUsize::new(0));
        let (first, first_handle) = spawn_predictor(&coord, "predictor-a", &calls);
        let (second, second_handle) = spawn_predictor(&coord, "predictor-b", &calls);
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut ids = Vec::new();
        for i in 0..5 {
            let session = format!("race-{i}");
            ids.push(
                coord
                    .set_flag(
                        FlagType::RequestPrediction,
                        &session,
                        serde_json::json!({"symptoms": []}),
                        0,
                        None,
                    )
                    .await
                    .unwrap(),
            );
        }

        for i in 0..5 {
            let session = format!("race-{i}");
            assert!(
                coord
                    .wait_for_completion(&session, FlagType::RequestPrediction, Duration::from_secs(5))
                    .await
                    .unwrap()
            );
        }

        // Let any losing claimant finish its attempt before counting.
        tokio::time::sleep(Duration::from_millis(300)).await;
        first.shutdown();
        second.shutdown();
        first_handle.await.unwrap();
        second_handle.await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 5);
        let a = first.status().await;
        let b = second.status().await;
        assert_eq!(a.completed + b.completed, 5);
        assert_eq!(a.failed + b.failed, 0);

        for id in ids {
            let flag = coord.store().get_flag(id).await.unwrap().unwrap();
            assert_eq!(flag.status, FlagStatus::Completed);
        }
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn concurrent_claims_on_one_flag_pick_one_winner() {
    timeout(TEST_TIMEOUT, async {
        let coord = memory_coordinator().await;
        let id = coord
            .set_flag(FlagType::RequestPrediction, "s3", serde_json::json!({}), 0, None)
            .await
            .unwrap();

        let (a, b) = tokio::join!(coord.claim_flag(id, "a"), coord.claim_flag(id, "b"));
        let wins = [a.unwrap(), b.unwrap()].into_iter().filter(|w| *w).count();
        assert_eq!(wins, 1);

        let flag = coord.get_flag(id).await.unwrap().unwrap();
        assert_eq!(flag.status, FlagStatus::InProgress);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn flags_survive_reopen() {
    timeout(TEST_TIMEOUT, async {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flags.db");

        let (claimed, pending) = {
            let coord = coordinator_with(Arc::new(LibSqlBackend::new_local(&path).await.unwrap())).await;
            let claimed = coord
                .set_flag(FlagType::RequestReport, "s1", serde_json::json!({"n": 1}), 0, None)
                .await
                .unwrap();
            let pending = coord
                .set_flag(FlagType::VoiceOutput, "s1", serde_json::json!({"text": "hello"}), 0, None)
                .await
                .unwrap();
            assert!(coord.claim_flag(claimed, "reporter").await.unwrap());
            coord.bus().shutdown().await;
            (claimed, pending)
        };

        let coord = coordinator_with(Arc::new(LibSqlBackend::new_local(&path).await.unwrap())).await;

        let flag = coord.get_flag(claimed).await.unwrap().unwrap();
        assert_eq!(flag.status, FlagStatus::InProgress);
        assert_eq!(flag.agent_assigned.as_deref(), Some("reporter"));
        assert!(!coord.claim_flag(claimed, "other").await.unwrap());

        let flag = coord.get_flag(pending).await.unwrap().unwrap();
        assert_eq!(flag.status, FlagStatus::Pending);
        assert_eq!(flag.data["text"], "hello");

        assert!(coord.complete_flag_as(claimed, "reporter").await.unwrap());
        assert_eq!(coord.session_flags("s1").await.unwrap().len(), 2);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn expired_flags_are_swept() {
    timeout(TEST_TIMEOUT, async {
        let coord = memory_coordinator().await;
        let stale = coord
            .set_flag(
                FlagType::RequestReport,
                "s1",
                serde_json::json!({}),
                0,
                Some(Duration::from_millis(1)),
            )
            .await
            .unwrap();
        let fresh = coord
            .set_flag(FlagType::RequestReport, "s1", serde_json::json!({}), 0, None)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(!coord.claim_flag(stale, "late").await.unwrap());
        assert_eq!(coord.sweep_expired().await.unwrap(), 1);

        let flag = coord.get_flag(stale).await.unwrap().unwrap();
        assert_eq!(flag.status, FlagStatus::Expired);
        let flag = coord.get_flag(fresh).await.unwrap().unwrap();
        assert_eq!(flag.status, FlagStatus::Pending);
    })
    .await
    .expect("test timed out");
}

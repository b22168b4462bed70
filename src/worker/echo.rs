//! Echo worker: completes flags by handing their payload back.
//!
//! Used by the daemon for smoke testing the claim/complete path without any
//! domain logic.

use async_trait::async_trait;

use crate::error::WorkerError;
use crate::flags::{Flag, FlagType};
use crate::worker::runner::{FlagWorker, WorkOutcome};

pub struct EchoWorker {
    agent_id: String,
    handles: Vec<FlagType>,
}

impl EchoWorker {
    pub fn new(agent_id: impl Into<String>, handles: Vec<FlagType>) -> Self {
        Self {
            agent_id: agent_id.into(),
            handles,
        }
    }
}

impl Default for EchoWorker {
    fn default() -> Self {
        Self::new("echo-worker", vec![FlagType::Test])
    }
}

#[async_trait]
impl FlagWorker for EchoWorker {
    fn agent_id(&self) -> &str {
        &self.agent_id
    }

    fn handles(&self) -> &[FlagType] {
        &self.handles
    }

    async fn execute(&self, flag: &Flag) -> Result<WorkOutcome, WorkerError> {
        Ok(WorkOutcome::with_result(serde_json::json!({
            "echo": flag.data.clone(),
            "request_id": flag.id,
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn echoes_payload() {
        let worker = EchoWorker::default();
        assert_eq!(worker.handles(), &[FlagType::Test]);

        let flag = Flag::new(FlagType::Test, "s1").with_data(serde_json::json!({"ping": 1}));
        let outcome = worker.execute(&flag).await.unwrap();
        let result = outcome.result.unwrap();
        assert_eq!(result["echo"]["ping"], 1);
        assert_eq!(result["request_id"], flag.id.to_string());
    }
}

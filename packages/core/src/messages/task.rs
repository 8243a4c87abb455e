//! Subtask dispatch and topic broadcast wire payloads.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{Subtask, SubtaskOutcome};

/// Coordinator asking a peer to execute one subtask.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchSubtaskPayload {
    pub subtask: Subtask,
}

/// Peer reporting a subtask's terminal outcome back to the coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubtaskResultPayload {
    pub subtask_id: Uuid,
    pub task_id: Uuid,
    pub outcome: SubtaskOutcome,
    /// Executor-side wall time, used to train the predictive balancer.
    pub duration_ms: u64,
}

/// Coordinator cancelling an in-flight subtask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelSubtaskPayload {
    pub subtask_id: Uuid,
}

/// Fire-and-forget topic broadcast.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastPayload {
    pub topic: String,
    pub payload: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{Envelope, PeerMessage};
    use crate::types::{PartitionKind, SubtaskStatus};

    fn round_trip(msg: &PeerMessage) {
        let env = Envelope::new("node-1".to_string(), 1, msg.clone());
        let bytes = env.encode().expect("serialize failed");
        let decoded = Envelope::decode(&bytes).expect("deserialize failed");
        assert_eq!(&decoded.message, msg);
    }

    #[test]
    fn serde_dispatch_subtask() {
        let task_id = Uuid::new_v4();
        round_trip(&PeerMessage::DispatchSubtask(DispatchSubtaskPayload {
            subtask: Subtask {
                id: Uuid::new_v4(),
                task_id,
                node_id: "node-2".to_string(),
                kind: PartitionKind::Data,
                model: "llama3".to_string(),
                payload: serde_json::json!({"offset": 0, "size": 4}),
                status: SubtaskStatus::Pending,
                started_at_ms: None,
                completed_at_ms: None,
                outcome: None,
                dependencies: vec![],
            },
        }));
    }

    #[test]
    fn serde_subtask_result_ok_and_err() {
        round_trip(&PeerMessage::SubtaskResult(SubtaskResultPayload {
            subtask_id: Uuid::new_v4(),
            task_id: Uuid::new_v4(),
            outcome: SubtaskOutcome::Ok {
                result: serde_json::json!({"text": "done"}),
            },
            duration_ms: 120,
        }));
        round_trip(&PeerMessage::SubtaskResult(SubtaskResultPayload {
            subtask_id: Uuid::new_v4(),
            task_id: Uuid::new_v4(),
            outcome: SubtaskOutcome::Err {
                error: "model not loaded".to_string(),
            },
            duration_ms: 5,
        }));
    }

    #[test]
    fn serde_cancel_subtask() {
        round_trip(&PeerMessage::CancelSubtask(CancelSubtaskPayload {
            subtask_id: Uuid::new_v4(),
        }));
    }

    #[test]
    fn serde_broadcast() {
        round_trip(&PeerMessage::Broadcast(BroadcastPayload {
            topic: "models.updated".to_string(),
            payload: serde_json::json!({"name": "llama3"}),
        }));
    }
}

use std::collections::HashMap;
use tokio::sync::{Mutex, mpsc};

/// Messages delivered to an active instance driver. Each carries the
/// peek-lock token of the queue item it came from; the driver acks it once
/// the corresponding log entry is persisted.
#[derive(Debug)]
pub enum OrchestratorMsg {
    ActivityCompleted {
        instance: String,
        id: u64,
        output: String,
        ack_token: String,
    },
    ActivityFailed {
        instance: String,
        id: u64,
        error: String,
        ack_token: String,
    },
    CancelRequested {
        instance: String,
        reason: String,
        ack_token: String,
    },
}

impl OrchestratorMsg {
    pub fn instance(&self) -> &str {
        match self {
            OrchestratorMsg::ActivityCompleted { instance, .. }
            | OrchestratorMsg::ActivityFailed { instance, .. }
            | OrchestratorMsg::CancelRequested { instance, .. } => instance,
        }
    }

    pub fn ack_token(&self) -> &str {
        match self {
            OrchestratorMsg::ActivityCompleted { ack_token, .. }
            | OrchestratorMsg::ActivityFailed { ack_token, .. }
            | OrchestratorMsg::CancelRequested { ack_token, .. } => ack_token,
        }
    }
}

/// Inboxes of the instance drivers currently active in this runtime.
#[derive(Default)]
pub struct InstanceRouter {
    pub(crate) inboxes: Mutex<HashMap<String, mpsc::UnboundedSender<OrchestratorMsg>>>,
}

impl InstanceRouter {
    pub async fn register(&self, instance: &str) -> mpsc::UnboundedReceiver<OrchestratorMsg> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inboxes.lock().await.insert(instance.to_string(), tx);
        rx
    }

    pub async fn unregister(&self, instance: &str) {
        self.inboxes.lock().await.remove(instance);
    }

    /// Deliver to the instance inbox. Hands the message back if no live inbox exists.
    pub async fn try_send(&self, msg: OrchestratorMsg) -> Result<(), OrchestratorMsg> {
        let mut inboxes = self.inboxes.lock().await;
        let Some(tx) = inboxes.get(msg.instance()) else {
            return Err(msg);
        };
        match tx.send(msg) {
            Ok(()) => Ok(()),
            Err(mpsc::error::SendError(msg)) => {
                inboxes.remove(msg.instance());
                Err(msg)
            }
        }
    }
}

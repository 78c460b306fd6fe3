use serde::{Deserialize, Serialize};

use crate::{
    error::ClientError,
    types::{PendingEvent, PendingStatus},
};

/// Status change of an outgoing event, as broadcast to observers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LocalEchoUpdate {
    pub txn_id: String,
    pub room_id: String,
    pub status: PendingStatus,
    pub event_id: Option<String>,
    pub error_code: Option<String>,
}

/// Transport result of one send attempt, before normalization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// Send succeeded and produced an event ID.
    Success { event_id: String },
    /// Send failed with error details.
    Failure { error: ClientError },
}

/// Snapshot of a pending event as a [`LocalEchoUpdate`].
pub fn normalize_local_echo(pending: &PendingEvent) -> LocalEchoUpdate {
    LocalEchoUpdate {
        txn_id: pending.txn_id.clone(),
        room_id: pending.room_id.clone(),
        status: pending.status,
        event_id: pending.event_id.clone(),
        error_code: pending.error_code.clone(),
    }
}

/// Settle a pending event from its send outcome: `Sent` with the server event
/// id, or `NotSent` carrying the stable error code.
pub fn settle_send_outcome(pending: &mut PendingEvent, outcome: SendOutcome) -> LocalEchoUpdate {
    match outcome {
        SendOutcome::Success { event_id } => {
            pending.status = PendingStatus::Sent;
            pending.event_id = Some(event_id);
            pending.error_code = None;
        }
        SendOutcome::Failure { error } => {
            pending.status = PendingStatus::NotSent;
            pending.error_code = Some(error.code);
        }
    }
    normalize_local_echo(pending)
}

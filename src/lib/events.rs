//! Inbound submission events and outbound acceptance records.
use std::sync::Arc;

use serde::Serialize;
use tracing::debug;

use crate::{
    error::RejectReason,
    job::{JobResult, SubmitResult},
    session::Session,
};

/// A share submitted by an attached session.
#[derive(Debug, Clone)]
pub struct SubmitEvent {
    pub request: JobResult,
    session: Arc<Session>,
}

impl SubmitEvent {
    pub fn new(session: Arc<Session>, request: JobResult) -> Self {
        Self { request, session }
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Turns the submission away and tells the session why.
    pub fn reject(&self, reason: RejectReason) {
        debug!(
            "Session {}: submission {:?} rejected: {reason}",
            self.session.id(),
            self.request.request_id
        );
        self.session
            .reply_with_error(self.request.request_id.clone(), reason.message());
    }
}

/// Record of an upstream verdict on a submission.
///
/// Emitted for every acknowledgement, whether or not the originating session is still
/// attached.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AcceptEvent {
    pub mapper_id: usize,
    /// Originating session, when the ledger still knew the submission.
    pub session_id: Option<u64>,
    pub result: SubmitResult,
    /// The verdict came from the donation upstream.
    pub donation: bool,
    pub error: Option<String>,
}

impl AcceptEvent {
    pub fn is_rejected(&self) -> bool {
        self.error.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionMessage;
    use async_channel::unbounded;
    use serde_json::json;

    #[test]
    fn test_reject_replies_with_reason_message() {
        let (tx, rx) = unbounded();
        let session = Arc::new(Session::new(1, tx));
        let event = SubmitEvent::new(session, JobResult::new(json!("req-9"), "J-stale"));

        event.reject(RejectReason::InvalidJobId);

        assert_eq!(
            rx.try_recv().unwrap(),
            SessionMessage::Error {
                request_id: json!("req-9"),
                message: "Invalid job id".to_string()
            }
        );
    }
}

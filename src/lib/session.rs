//! Downstream sessions as seen by the slot core.
//!
//! A [`Session`] is the handle the registry stores for an attached miner. Replies and jobs
//! are pushed onto the session's outbound channel; the connection task that owns the socket
//! drains it.
use async_channel::Sender;
use tracing::debug;

use crate::{
    job::{Job, RequestId},
    utils::Mutex,
};

/// Login parameters presented by a session when it attaches.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoginRequest {
    pub login: String,
    pub password: String,
    pub agent: String,
    pub rig_id: Option<String>,
}

/// Outbound traffic to a session.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionMessage {
    /// New unit of work, with the nonce byte reserved for this session.
    Job { job: Job, nonce_slot: u8 },
    Success {
        request_id: RequestId,
        status: String,
    },
    Error {
        request_id: RequestId,
        message: String,
    },
}

#[derive(Debug)]
pub struct Session {
    id: u64,
    mapper_id: Mutex<Option<usize>>,
    nonce_slot: Mutex<Option<u8>>,
    sender: Sender<SessionMessage>,
}

impl Session {
    pub fn new(id: u64, sender: Sender<SessionMessage>) -> Self {
        Self {
            id,
            mapper_id: Mutex::new(None),
            nonce_slot: Mutex::new(None),
            sender,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Slot this session is attached to, if any.
    pub fn mapper_id(&self) -> Option<usize> {
        self.mapper_id.super_safe_lock(|id| *id)
    }

    pub fn set_mapper_id(&self, mapper_id: usize) {
        self.mapper_id.super_safe_lock(|id| *id = Some(mapper_id));
    }

    pub fn nonce_slot(&self) -> Option<u8> {
        self.nonce_slot.super_safe_lock(|slot| *slot)
    }

    pub fn set_nonce_slot(&self, nonce_slot: Option<u8>) {
        self.nonce_slot.super_safe_lock(|slot| *slot = nonce_slot);
    }

    pub fn success(&self, request_id: RequestId, status: &str) {
        self.send(SessionMessage::Success {
            request_id,
            status: status.to_string(),
        });
    }

    pub fn reply_with_error(&self, request_id: RequestId, message: &str) {
        self.send(SessionMessage::Error {
            request_id,
            message: message.to_string(),
        });
    }

    pub fn set_job(&self, job: &Job) {
        if let Some(nonce_slot) = self.nonce_slot() {
            self.send(SessionMessage::Job {
                job: job.clone(),
                nonce_slot,
            });
        }
    }

    fn send(&self, message: SessionMessage) {
        // The connection task may already be gone; nothing to deliver then.
        if let Err(e) = self.sender.try_send(message) {
            debug!("Session {}: dropping outbound message: {e}", self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_channel::unbounded;
    use serde_json::json;

    #[test]
    fn test_replies_reach_the_channel() {
        let (tx, rx) = unbounded();
        let session = Session::new(7, tx);

        session.success(json!("req-1"), "OK");
        session.reply_with_error(json!(2), "Invalid job id");

        assert_eq!(
            rx.try_recv().unwrap(),
            SessionMessage::Success {
                request_id: json!("req-1"),
                status: "OK".to_string()
            }
        );
        assert_eq!(
            rx.try_recv().unwrap(),
            SessionMessage::Error {
                request_id: json!(2),
                message: "Invalid job id".to_string()
            }
        );
    }

    #[test]
    fn test_job_requires_nonce_slot() {
        let (tx, rx) = unbounded();
        let session = Session::new(1, tx);
        let job = Job::new("J1", 1000);

        session.set_job(&job);
        assert!(rx.try_recv().is_err());

        session.set_nonce_slot(Some(3));
        session.set_job(&job);
        assert_eq!(
            rx.try_recv().unwrap(),
            SessionMessage::Job { job, nonce_slot: 3 }
        );
    }

    #[test]
    fn test_closed_channel_does_not_panic() {
        let (tx, rx) = unbounded();
        drop(rx);
        let session = Session::new(1, tx);
        session.success(json!(1), "OK");
        assert_eq!(session.mapper_id(), None);
        session.set_mapper_id(4);
        assert_eq!(session.mapper_id(), Some(4));
    }
}

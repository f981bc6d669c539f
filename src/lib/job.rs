//! Units of work handed out by upstreams and the records that flow back to them.
use serde::{Deserialize, Serialize};

/// Identifier of a downstream request, echoed back verbatim in the reply.
pub type RequestId = serde_json::Value;

/// The current unit of work of a slot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub blob: String,
    pub target: String,
    pub diff: u64,
    #[serde(default)]
    pub height: Option<u64>,
    #[serde(default)]
    pub algorithm: Option<String>,
}

impl Job {
    pub fn new(id: impl Into<String>, diff: u64) -> Self {
        Self {
            id: id.into(),
            diff,
            ..Default::default()
        }
    }

    /// An empty id marks the "no job" placeholder kept after a reset.
    pub fn is_valid(&self) -> bool {
        !self.id.is_empty()
    }
}

/// A share submitted by a session, as forwarded upstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    pub request_id: RequestId,
    pub job_id: String,
    pub nonce: String,
    pub result: String,
    /// Difficulty the share is accounted at. The mapper overwrites it with the current job's
    /// difficulty before forwarding.
    #[serde(default)]
    pub diff: u64,
    #[serde(default)]
    pub algorithm: Option<String>,
}

impl JobResult {
    pub fn new(request_id: RequestId, job_id: impl Into<String>) -> Self {
        Self {
            request_id,
            job_id: job_id.into(),
            nonce: String::new(),
            result: String::new(),
            diff: 0,
            algorithm: None,
        }
    }
}

/// Upstream acknowledgement of one submission.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitResult {
    /// Sequence number the strategy assigned when the share was submitted.
    pub seq: u64,
    pub diff: u64,
    pub actual_diff: u64,
    pub elapsed_ms: u64,
}

impl SubmitResult {
    pub fn new(seq: u64, diff: u64) -> Self {
        Self {
            seq,
            diff,
            ..Default::default()
        }
    }
}

use std::{collections::HashMap, sync::Arc};

use tracing::warn;

use crate::{
    job::RequestId,
    registry::SessionRegistry,
    session::Session,
    strategy::StrategyId,
};

/// Origin of one submission that is waiting for an upstream verdict.
#[derive(Debug, Clone, PartialEq)]
struct PendingSubmit {
    request_id: RequestId,
    session_id: u64,
    /// Strategy the share went through, so its entries can be purged when it is released.
    strategy: StrategyId,
}

/// Result of resolving a sequence number.
///
/// An unknown or already resolved sequence yields the empty context: no session id, no
/// session, and a null request id.
#[derive(Debug, Clone, Default)]
pub struct SubmitContext {
    pub request_id: RequestId,
    pub session_id: Option<u64>,
    /// The originating session, if it is still attached.
    pub session: Option<Arc<Session>>,
}

impl SubmitContext {
    pub fn is_empty(&self) -> bool {
        self.session_id.is_none()
    }
}

/// Correlates upstream sequence numbers with the downstream request they came from.
///
/// Every entry is consumed at most once: [`SubmitLedger::resolve`] looks it up and removes
/// it in one step, so a duplicate acknowledgement resolves to the empty context.
#[derive(Debug, Default)]
pub struct SubmitLedger {
    pending: HashMap<u64, PendingSubmit>,
}

impl SubmitLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(
        &mut self,
        sequence: u64,
        request_id: RequestId,
        session_id: u64,
        strategy: StrategyId,
    ) {
        let entry = PendingSubmit {
            request_id,
            session_id,
            strategy,
        };
        if let Some(previous) = self.pending.insert(sequence, entry) {
            warn!(
                "Sequence {sequence} reused while pending, dropping submission from session {}",
                previous.session_id
            );
        }
    }

    /// Removes the entry for `sequence` and re-resolves its session through `registry`.
    pub fn resolve(&mut self, sequence: u64, registry: &dyn SessionRegistry) -> SubmitContext {
        let Some(entry) = self.pending.remove(&sequence) else {
            return SubmitContext::default();
        };

        SubmitContext {
            session: registry.session_by_id(entry.session_id),
            request_id: entry.request_id,
            session_id: Some(entry.session_id),
        }
    }

    /// Drops every entry submitted through `strategy`. Returns how many were dropped.
    pub fn purge_strategy(&mut self, strategy: StrategyId) -> usize {
        let before = self.pending.len();
        self.pending.retain(|_, entry| entry.strategy != strategy);
        before - self.pending.len()
    }

    /// Drops every entry. Returns how many were dropped.
    pub fn clear(&mut self) -> usize {
        let dropped = self.pending.len();
        self.pending.clear();
        dropped
    }

    pub fn contains(&self, sequence: u64) -> bool {
        self.pending.contains_key(&sequence)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

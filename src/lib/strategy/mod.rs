//! ## Upstream Strategies
//!
//! A strategy owns the upstream link(s) of a slot and decides which one is active. It
//! reports lifecycle changes to its listener, the owning mapper, as [`StrategyEvent`]s on a
//! channel, so the mapper never runs inside a strategy call.
//!
//! Three implementations exist:
//! - [`SinglePoolStrategy`]: one pool, reconnects forever.
//! - [`FailoverStrategy`]: an ordered pool list, tried in priority order.
//! - [`DonateStrategy`]: a periodic, low-priority donation upstream.
use std::{fmt, sync::Arc};

use async_channel::Sender;
use tracing::warn;

use crate::{
    config::PoolConfig,
    error::{SplitterError, SplitterResult},
    job::{Job, JobResult, SubmitResult},
    utils::SequenceFactory,
};

mod client;
pub mod donate;
pub mod failover;
pub mod single_pool;
pub mod transport;

pub use donate::DonateStrategy;
pub use failover::FailoverStrategy;
pub use single_pool::SinglePoolStrategy;
pub use transport::{ClientEvent, ClientId, Connection, Link, Transport, DONATION_CONNECTION_ID};

/// Identifies a strategy within its mapper.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StrategyId(pub u64);

pub trait Strategy: Send + fmt::Debug {
    fn id(&self) -> StrategyId;

    /// True while a logged in connection is serving jobs.
    fn is_active(&self) -> bool;

    /// Starts connecting. Establishment is asynchronous and reported through the listener.
    fn connect(&mut self);

    /// Closes every link. A previously active strategy reports one final pause; nothing from
    /// the closed links is reported afterwards.
    fn stop(&mut self);

    /// Closes every link without notifying the listener.
    fn release(&mut self);

    /// Forwards a share upstream and returns its sequence number.
    fn submit(&mut self, result: &JobResult) -> SplitterResult<u64>;

    /// `now` is in milliseconds.
    fn tick(&mut self, now: u64);

    fn handle_client_event(&mut self, event: ClientEvent);
}

/// Lifecycle notifications delivered to the mapper.
#[derive(Debug, Clone, PartialEq)]
pub enum StrategyEvent {
    Active {
        strategy: StrategyId,
        connection: Connection,
    },
    Job {
        strategy: StrategyId,
        connection: Connection,
        job: Job,
    },
    Pause {
        strategy: StrategyId,
    },
    ResultAccepted {
        strategy: StrategyId,
        connection: Connection,
        result: SubmitResult,
        error: Option<String>,
    },
}

/// Back-reference from a strategy to whoever listens for its events.
#[derive(Debug, Clone)]
pub struct StrategyListener {
    sender: Sender<StrategyEvent>,
}

impl StrategyListener {
    pub fn new(sender: Sender<StrategyEvent>) -> Self {
        Self { sender }
    }

    pub fn on_active(&self, strategy: StrategyId, connection: Connection) {
        self.notify(StrategyEvent::Active {
            strategy,
            connection,
        });
    }

    pub fn on_job(&self, strategy: StrategyId, connection: Connection, job: Job) {
        self.notify(StrategyEvent::Job {
            strategy,
            connection,
            job,
        });
    }

    pub fn on_pause(&self, strategy: StrategyId) {
        self.notify(StrategyEvent::Pause { strategy });
    }

    pub fn on_result_accepted(
        &self,
        strategy: StrategyId,
        connection: Connection,
        result: SubmitResult,
        error: Option<String>,
    ) {
        self.notify(StrategyEvent::ResultAccepted {
            strategy,
            connection,
            result,
            error,
        });
    }

    fn notify(&self, event: StrategyEvent) {
        if let Err(e) = self.sender.try_send(event) {
            warn!("Strategy listener is gone, dropping event: {:?}", e.into_inner());
        }
    }
}

/// Everything a strategy needs to open links, shared by all strategies of one mapper.
#[derive(Debug, Clone)]
pub struct StrategyContext {
    pub transport: Arc<dyn Transport>,
    pub agent: Arc<str>,
    /// Where links report [`ClientEvent`]s.
    pub client_events: Sender<ClientEvent>,
    pub sequences: Arc<SequenceFactory>,
    /// Failures tolerated on the first pool of a failover list before moving on.
    pub retries: u32,
}

/// Builds the strategy for a pool list: failover for several pools, single-pool for one.
pub fn create_strategy(
    id: StrategyId,
    pools: &[PoolConfig],
    ctx: StrategyContext,
    listener: StrategyListener,
) -> SplitterResult<Box<dyn Strategy>> {
    match pools {
        [] => Err(SplitterError::NoPools),
        [pool] => Ok(Box::new(SinglePoolStrategy::new(
            id,
            pool.clone(),
            ctx,
            listener,
        ))),
        _ => Ok(Box::new(FailoverStrategy::new(
            id,
            pools.to_vec(),
            ctx,
            listener,
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{pool, MockTransport};
    use async_channel::unbounded;

    #[test]
    fn test_create_strategy_selects_by_pool_count() {
        let transport = MockTransport::new();
        let (client_tx, _client_rx) = unbounded();
        let (event_tx, _event_rx) = unbounded();
        let ctx = transport.context(client_tx);
        let listener = StrategyListener::new(event_tx);

        assert!(matches!(
            create_strategy(StrategyId(1), &[], ctx.clone(), listener.clone()),
            Err(SplitterError::NoPools)
        ));

        let single = create_strategy(
            StrategyId(2),
            &[pool("a.example")],
            ctx.clone(),
            listener.clone(),
        )
        .unwrap();
        assert!(format!("{single:?}").starts_with("SinglePoolStrategy"));

        let failover = create_strategy(
            StrategyId(3),
            &[pool("a.example"), pool("b.example")],
            ctx,
            listener,
        )
        .unwrap();
        assert!(format!("{failover:?}").starts_with("FailoverStrategy"));
        assert_eq!(failover.id(), StrategyId(3));
    }
}

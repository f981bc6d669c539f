use tracing::debug;

use super::{
    client::PoolClient, ClientEvent, Strategy, StrategyContext, StrategyId, StrategyListener,
};
use crate::{config::PoolConfig, error::SplitterResult, job::JobResult};

/// Strategy over exactly one pool.
///
/// The link retries on its own, so this strategy only mirrors its login state to the
/// listener: login reports active, a drop of a logged in link reports pause.
#[derive(Debug)]
pub struct SinglePoolStrategy {
    id: StrategyId,
    client: PoolClient,
    ctx: StrategyContext,
    listener: StrategyListener,
    generation: u64,
    active: bool,
}

impl SinglePoolStrategy {
    pub fn new(
        id: StrategyId,
        pool: PoolConfig,
        ctx: StrategyContext,
        listener: StrategyListener,
    ) -> Self {
        Self {
            id,
            client: PoolClient::new(0, pool),
            ctx,
            listener,
            generation: 0,
            active: false,
        }
    }

    /// True while a link is open, logged in or not.
    pub fn is_open(&self) -> bool {
        self.client.is_open()
    }
}

impl Strategy for SinglePoolStrategy {
    fn id(&self) -> StrategyId {
        self.id
    }

    fn is_active(&self) -> bool {
        self.active
    }

    fn connect(&mut self) {
        if self.client.is_open() {
            return;
        }
        self.generation += 1;
        self.client.connect(self.id, self.generation, &self.ctx);
    }

    fn stop(&mut self) {
        self.client.disconnect();
        if self.active {
            self.active = false;
            self.listener.on_pause(self.id);
        }
    }

    fn release(&mut self) {
        self.client.disconnect();
        self.active = false;
    }

    fn submit(&mut self, result: &JobResult) -> SplitterResult<u64> {
        let sequence = self.ctx.sequences.next();
        self.client.submit(sequence, result)?;
        Ok(sequence)
    }

    fn tick(&mut self, now: u64) {
        self.client.tick(now);
    }

    fn handle_client_event(&mut self, event: ClientEvent) {
        if !self.client.owns(event.client()) {
            debug!(
                "Strategy {}: ignoring event from stale link {:?}",
                self.id.0,
                event.client()
            );
            return;
        }

        match event {
            ClientEvent::LoginSuccess { ip, .. } => {
                self.client.on_login(ip);
                self.active = true;
                self.listener
                    .on_active(self.id, self.client.connection().clone());
            }
            ClientEvent::Job { job, .. } => {
                if self.active {
                    self.listener
                        .on_job(self.id, self.client.connection().clone(), job);
                }
            }
            ClientEvent::ResultAccepted { result, error, .. } => {
                self.listener.on_result_accepted(
                    self.id,
                    self.client.connection().clone(),
                    result,
                    error,
                );
            }
            ClientEvent::Close { failures, .. } => {
                debug!("Strategy {}: link closed after {failures} failures", self.id.0);
                self.client.on_close();
                if self.active {
                    self.active = false;
                    self.listener.on_pause(self.id);
                }
            }
        }
    }
}

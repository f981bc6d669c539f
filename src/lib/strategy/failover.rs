use tracing::{debug, info};

use super::{
    client::PoolClient, ClientEvent, Strategy, StrategyContext, StrategyId, StrategyListener,
};
use crate::{
    config::PoolConfig,
    error::{SplitterError, SplitterResult},
    job::JobResult,
};

/// Strategy over an ordered pool list.
///
/// Pools are tried in priority order. The first pool gets `retries` connection failures
/// before the next one is opened; every later pool fails over on its first failure. Links
/// that were opened keep reconnecting, and whenever a higher-priority pool logs in again it
/// takes over and every lower-priority link is closed.
#[derive(Debug)]
pub struct FailoverStrategy {
    id: StrategyId,
    clients: Vec<PoolClient>,
    /// Index of the pool currently serving jobs.
    active: Option<usize>,
    /// Lowest-priority pool opened so far.
    index: usize,
    ctx: StrategyContext,
    listener: StrategyListener,
    generation: u64,
}

impl FailoverStrategy {
    pub fn new(
        id: StrategyId,
        pools: Vec<PoolConfig>,
        ctx: StrategyContext,
        listener: StrategyListener,
    ) -> Self {
        let clients = pools
            .into_iter()
            .enumerate()
            .map(|(index, pool)| PoolClient::new(index, pool))
            .collect();

        Self {
            id,
            clients,
            active: None,
            index: 0,
            ctx,
            listener,
            generation: 0,
        }
    }

    /// Index of the pool currently serving jobs.
    pub fn active_index(&self) -> Option<usize> {
        self.active
    }

    fn open(&mut self, index: usize) {
        if self.clients[index].is_open() {
            return;
        }
        self.generation += 1;
        let (id, generation) = (self.id, self.generation);
        self.clients[index].connect(id, generation, &self.ctx);
    }

    fn on_login(&mut self, index: usize, ip: Option<String>) {
        self.clients[index].on_login(ip);

        let takes_over = match self.active {
            None => true,
            Some(active) => index < active,
        };
        if takes_over {
            self.active = Some(index);
            self.listener
                .on_active(self.id, self.clients[index].connection().clone());
        }

        // Lower-priority pools are no longer needed.
        let active = self.active.unwrap_or(index);
        for client in self.clients.iter_mut().skip(active + 1) {
            client.disconnect();
        }
        self.index = active;
    }

    fn on_close(&mut self, index: usize, failures: u32) {
        self.clients[index].on_close();

        if self.active == Some(index) {
            info!(
                "Strategy {}: lost pool {}:{}",
                self.id.0,
                self.clients[index].connection().host,
                self.clients[index].connection().port
            );
            self.active = None;
            self.listener.on_pause(self.id);
        }

        if self.index == 0 && failures < self.ctx.retries {
            return;
        }

        if index == self.index && index + 1 < self.clients.len() {
            self.index += 1;
            debug!(
                "Strategy {}: failing over to pool #{}",
                self.id.0, self.index
            );
            self.open(self.index);
        }
    }
}

impl Strategy for FailoverStrategy {
    fn id(&self) -> StrategyId {
        self.id
    }

    fn is_active(&self) -> bool {
        self.active.is_some()
    }

    fn connect(&mut self) {
        self.index = 0;
        self.open(0);
    }

    fn stop(&mut self) {
        for client in self.clients.iter_mut() {
            client.disconnect();
        }
        self.index = 0;
        if self.active.take().is_some() {
            self.listener.on_pause(self.id);
        }
    }

    fn release(&mut self) {
        for client in self.clients.iter_mut() {
            client.disconnect();
        }
        self.active = None;
    }

    fn submit(&mut self, result: &JobResult) -> SplitterResult<u64> {
        let active = self.active.ok_or(SplitterError::NoActiveUpstream)?;
        let sequence = self.ctx.sequences.next();
        self.clients[active].submit(sequence, result)?;
        Ok(sequence)
    }

    fn tick(&mut self, now: u64) {
        for client in self.clients.iter_mut() {
            client.tick(now);
        }
    }

    fn handle_client_event(&mut self, event: ClientEvent) {
        let client = event.client();
        let Some(index) = self.clients.iter().position(|c| c.owns(client)) else {
            debug!(
                "Strategy {}: ignoring event from stale link {client:?}",
                self.id.0
            );
            return;
        };

        match event {
            ClientEvent::LoginSuccess { ip, .. } => self.on_login(index, ip),
            ClientEvent::Job { job, .. } => {
                if self.active == Some(index) && self.clients[index].is_logged_in() {
                    self.listener
                        .on_job(self.id, self.clients[index].connection().clone(), job);
                }
            }
            ClientEvent::ResultAccepted { result, error, .. } => {
                self.listener.on_result_accepted(
                    self.id,
                    self.clients[index].connection().clone(),
                    result,
                    error,
                );
            }
            ClientEvent::Close { failures, .. } => self.on_close(index, failures),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        job::Job,
        strategy::{ClientId, StrategyEvent},
        test_utils::{pool, MockTransport},
    };
    use async_channel::{unbounded, Receiver};
    use serde_json::json;
    use std::sync::Arc;

    fn setup(retries: u32) -> (FailoverStrategy, Arc<MockTransport>, Receiver<StrategyEvent>) {
        let transport = MockTransport::new();
        let (client_tx, _client_rx) = unbounded();
        let (event_tx, event_rx) = unbounded();
        let mut ctx = transport.context(client_tx);
        ctx.retries = retries;
        let strategy = FailoverStrategy::new(
            StrategyId(7),
            vec![pool("a.example"), pool("b.example"), pool("c.example")],
            ctx,
            StrategyListener::new(event_tx),
        );
        (strategy, transport, event_rx)
    }

    fn client_for(transport: &MockTransport, host: &str) -> ClientId {
        transport
            .opened()
            .into_iter()
            .rev()
            .find(|(_, pool)| pool.host == host)
            .map(|(client, _)| client)
            .unwrap()
    }

    #[test]
    fn test_primary_retries_before_failover() {
        let (mut strategy, transport, _events) = setup(2);
        strategy.connect();
        let a = client_for(&transport, "a.example");

        strategy.handle_client_event(ClientEvent::Close { client: a, failures: 1 });
        assert_eq!(transport.opened().len(), 1);

        strategy.handle_client_event(ClientEvent::Close { client: a, failures: 2 });
        assert_eq!(transport.opened().len(), 2);
        let b = client_for(&transport, "b.example");

        strategy.handle_client_event(ClientEvent::Close { client: b, failures: 1 });
        assert_eq!(transport.opened().len(), 3);
        assert_eq!(client_for(&transport, "c.example").index, 2);
    }

    #[test]
    fn test_backup_serves_until_primary_returns() {
        let (mut strategy, transport, events) = setup(1);
        strategy.connect();
        let a = client_for(&transport, "a.example");
        strategy.handle_client_event(ClientEvent::Close { client: a, failures: 1 });
        let b = client_for(&transport, "b.example");

        strategy.handle_client_event(ClientEvent::LoginSuccess { client: b, ip: None });
        assert_eq!(strategy.active_index(), Some(1));
        match events.try_recv().unwrap() {
            StrategyEvent::Active { connection, .. } => assert_eq!(connection.host, "b.example"),
            other => panic!("Expected Active, got {other:?}"),
        }

        // Jobs only flow from the active pool.
        strategy.handle_client_event(ClientEvent::Job {
            client: a,
            job: Job::new("from-a", 1),
        });
        assert!(events.try_recv().is_err());
        strategy.handle_client_event(ClientEvent::Job {
            client: b,
            job: Job::new("from-b", 1),
        });
        assert!(matches!(events.try_recv(), Ok(StrategyEvent::Job { .. })));

        let seq = strategy.submit(&JobResult::new(json!(1), "from-b")).unwrap();
        assert_eq!(transport.submits()[0].0, b);
        assert_eq!(transport.submits()[0].1, seq);

        // The primary comes back, takes over, and the backup is closed.
        strategy.handle_client_event(ClientEvent::LoginSuccess { client: a, ip: None });
        assert_eq!(strategy.active_index(), Some(0));
        match events.try_recv().unwrap() {
            StrategyEvent::Active { connection, .. } => assert_eq!(connection.host, "a.example"),
            other => panic!("Expected Active, got {other:?}"),
        }
        assert!(transport.closed().contains(&b));
    }

    #[test]
    fn test_losing_active_pool_pauses() {
        let (mut strategy, transport, events) = setup(5);
        strategy.connect();
        let a = client_for(&transport, "a.example");
        strategy.handle_client_event(ClientEvent::LoginSuccess { client: a, ip: None });
        let _active = events.try_recv().unwrap();

        strategy.handle_client_event(ClientEvent::Close { client: a, failures: 0 });
        assert!(!strategy.is_active());
        assert_eq!(
            events.try_recv().unwrap(),
            StrategyEvent::Pause {
                strategy: StrategyId(7)
            }
        );
        assert!(matches!(
            strategy.submit(&JobResult::new(json!(1), "J")),
            Err(SplitterError::NoActiveUpstream)
        ));
    }

    #[test]
    fn test_tick_reaches_every_open_link() {
        let (mut strategy, transport, _events) = setup(1);
        strategy.connect();
        let a = client_for(&transport, "a.example");
        strategy.handle_client_event(ClientEvent::Close { client: a, failures: 1 });
        let b = client_for(&transport, "b.example");

        strategy.tick(42);
        assert_eq!(transport.ticks(), vec![(a, 42), (b, 42)]);
    }
}

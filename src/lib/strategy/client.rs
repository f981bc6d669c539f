use tracing::debug;

use super::{
    transport::{ClientId, Connection, Link},
    StrategyContext, StrategyId,
};
use crate::{
    config::PoolConfig,
    error::{SplitterError, SplitterResult},
    job::JobResult,
};

/// A pool entry of a strategy together with its (possibly absent) open link.
#[derive(Debug)]
pub(crate) struct PoolClient {
    pool: PoolConfig,
    index: usize,
    link: Option<Box<dyn Link>>,
    client: Option<ClientId>,
    connection: Connection,
    logged_in: bool,
}

impl PoolClient {
    pub(crate) fn new(index: usize, pool: PoolConfig) -> Self {
        let connection = Connection::new(index as i64, &pool);
        Self {
            pool,
            index,
            link: None,
            client: None,
            connection,
            logged_in: false,
        }
    }

    pub(crate) fn is_open(&self) -> bool {
        self.link.is_some()
    }

    pub(crate) fn is_logged_in(&self) -> bool {
        self.logged_in
    }

    pub(crate) fn connection(&self) -> &Connection {
        &self.connection
    }

    /// True when `client` names the link currently open for this entry.
    pub(crate) fn owns(&self, client: ClientId) -> bool {
        self.client == Some(client)
    }

    /// Opens a link unless one is already open.
    pub(crate) fn connect(&mut self, strategy: StrategyId, generation: u64, ctx: &StrategyContext) {
        if self.link.is_some() {
            return;
        }

        let client = ClientId {
            strategy,
            index: self.index,
            generation,
        };
        debug!(
            "Strategy {}: connecting to {}:{}",
            strategy.0, self.pool.host, self.pool.port
        );
        self.link = Some(ctx.transport.open(
            &self.pool,
            &ctx.agent,
            client,
            ctx.client_events.clone(),
        ));
        self.client = Some(client);
    }

    pub(crate) fn disconnect(&mut self) {
        if let Some(mut link) = self.link.take() {
            link.close();
        }
        self.client = None;
        self.logged_in = false;
        self.connection.ip = None;
    }

    pub(crate) fn on_login(&mut self, ip: Option<String>) {
        self.logged_in = true;
        self.connection.ip = ip;
    }

    pub(crate) fn on_close(&mut self) {
        self.logged_in = false;
    }

    pub(crate) fn submit(&mut self, sequence: u64, result: &JobResult) -> SplitterResult<()> {
        match self.link.as_mut() {
            Some(link) if self.logged_in => link.submit(sequence, result),
            _ => Err(SplitterError::NoActiveUpstream),
        }
    }

    pub(crate) fn tick(&mut self, now: u64) {
        if let Some(link) = self.link.as_mut() {
            link.tick(now);
        }
    }
}

impl Drop for PoolClient {
    fn drop(&mut self) {
        self.disconnect();
    }
}

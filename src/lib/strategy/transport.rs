//! Contract with the upstream transport.
//!
//! Wire encoding, TLS, and reconnect backoff all live behind [`Transport`]. A strategy only
//! opens links, submits through them, and reacts to the [`ClientEvent`]s they report.
use std::fmt;

use async_channel::Sender;

use crate::{
    config::PoolConfig,
    error::SplitterResult,
    job::{Job, JobResult, SubmitResult},
    strategy::StrategyId,
};

/// Connection id reserved for the donation upstream.
///
/// A connection carrying this id is not reported to the mapper as a real upstream.
pub const DONATION_CONNECTION_ID: i64 = -1;

/// Tags every event a link reports with the link it came from.
///
/// `generation` is unique per opened link within a strategy, so events from a link that was
/// closed and replaced can be told apart from the current one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId {
    pub strategy: StrategyId,
    pub index: usize,
    pub generation: u64,
}

/// An upstream connection as reported to the mapper.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connection {
    /// Position in the strategy's pool list, or [`DONATION_CONNECTION_ID`].
    pub id: i64,
    pub host: String,
    pub port: u16,
    pub ip: Option<String>,
}

impl Connection {
    pub fn new(id: i64, pool: &PoolConfig) -> Self {
        Self {
            id,
            host: pool.host.clone(),
            port: pool.port,
            ip: None,
        }
    }

    pub fn is_donation(&self) -> bool {
        self.id == DONATION_CONNECTION_ID
    }

    pub fn into_donation(mut self) -> Self {
        self.id = DONATION_CONNECTION_ID;
        self
    }
}

/// Events a link reports back to its strategy.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    LoginSuccess {
        client: ClientId,
        ip: Option<String>,
    },
    Job {
        client: ClientId,
        job: Job,
    },
    ResultAccepted {
        client: ClientId,
        result: SubmitResult,
        error: Option<String>,
    },
    /// The connection dropped or a connection attempt failed. `failures` counts consecutive
    /// failed attempts.
    Close { client: ClientId, failures: u32 },
}

impl ClientEvent {
    pub fn client(&self) -> ClientId {
        match self {
            ClientEvent::LoginSuccess { client, .. }
            | ClientEvent::Job { client, .. }
            | ClientEvent::ResultAccepted { client, .. }
            | ClientEvent::Close { client, .. } => *client,
        }
    }
}

/// One open upstream link.
///
/// A link keeps reconnecting on its own until [`Link::close`] is called, reporting each
/// failure as [`ClientEvent::Close`]. After `close` it reports nothing further.
pub trait Link: Send + fmt::Debug {
    fn submit(&mut self, sequence: u64, result: &JobResult) -> SplitterResult<()>;

    /// Drives keep-alives and timeouts. `now` is in milliseconds.
    fn tick(&mut self, now: u64);

    fn close(&mut self);
}

pub trait Transport: Send + Sync + fmt::Debug {
    /// Starts connecting to `pool`. The returned link reports on `events`, tagged `client`.
    fn open(
        &self,
        pool: &PoolConfig,
        agent: &str,
        client: ClientId,
        events: Sender<ClientEvent>,
    ) -> Box<dyn Link>;
}

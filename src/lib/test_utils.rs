//! Recording transport for unit tests.
//!
//! Links opened through [`MockTransport`] never touch the network. Every call is recorded,
//! and tests play the upstream side by pushing [`ClientEvent`]s through the helpers.
//! [`LogCapture`] collects what the code under test logs.
use std::{collections::HashMap, io, sync::Arc};

use async_channel::Sender;
use tracing::{Dispatch, Level};
use tracing_subscriber::fmt::MakeWriter;

use crate::{
    config::PoolConfig,
    error::SplitterResult,
    job::{Job, JobResult, SubmitResult},
    strategy::{ClientEvent, ClientId, Link, StrategyContext, Transport},
    utils::{Mutex, SequenceFactory},
};

pub(crate) fn pool(host: &str) -> PoolConfig {
    PoolConfig::new(host, 3333)
}

#[derive(Debug, Default)]
struct MockState {
    opened: Vec<(ClientId, PoolConfig)>,
    submits: Vec<(ClientId, u64, JobResult)>,
    closed: Vec<ClientId>,
    ticks: Vec<(ClientId, u64)>,
    events: HashMap<ClientId, Sender<ClientEvent>>,
}

#[derive(Debug, Default)]
pub(crate) struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn context(self: &Arc<Self>, client_events: Sender<ClientEvent>) -> StrategyContext {
        StrategyContext {
            transport: self.clone(),
            agent: Arc::from("test-agent"),
            client_events,
            sequences: Arc::new(SequenceFactory::new()),
            retries: 5,
        }
    }

    pub(crate) fn opened(&self) -> Vec<(ClientId, PoolConfig)> {
        self.state.super_safe_lock(|s| s.opened.clone())
    }

    pub(crate) fn submits(&self) -> Vec<(ClientId, u64, JobResult)> {
        self.state.super_safe_lock(|s| s.submits.clone())
    }

    pub(crate) fn closed(&self) -> Vec<ClientId> {
        self.state.super_safe_lock(|s| s.closed.clone())
    }

    pub(crate) fn ticks(&self) -> Vec<(ClientId, u64)> {
        self.state.super_safe_lock(|s| s.ticks.clone())
    }

    pub(crate) fn last_client(&self) -> Option<ClientId> {
        self.state
            .super_safe_lock(|s| s.opened.last().map(|(client, _)| *client))
    }

    pub(crate) fn login(&self, client: ClientId) {
        self.emit(ClientEvent::LoginSuccess {
            client,
            ip: Some("192.0.2.1".to_string()),
        });
    }

    pub(crate) fn job(&self, client: ClientId, job: Job) {
        self.emit(ClientEvent::Job { client, job });
    }

    pub(crate) fn accept(&self, client: ClientId, result: SubmitResult, error: Option<String>) {
        self.emit(ClientEvent::ResultAccepted {
            client,
            result,
            error,
        });
    }

    pub(crate) fn close(&self, client: ClientId, failures: u32) {
        self.emit(ClientEvent::Close { client, failures });
    }

    fn emit(&self, event: ClientEvent) {
        let sender = self
            .state
            .super_safe_lock(|s| s.events.get(&event.client()).cloned());
        if let Some(sender) = sender {
            let _ = sender.try_send(event);
        }
    }
}

impl Transport for MockTransport {
    fn open(
        &self,
        pool: &PoolConfig,
        _agent: &str,
        client: ClientId,
        events: Sender<ClientEvent>,
    ) -> Box<dyn Link> {
        self.state.super_safe_lock(|s| {
            s.opened.push((client, pool.clone()));
            s.events.insert(client, events);
        });
        Box::new(MockLink {
            client,
            state: self.state.clone(),
        })
    }
}

#[derive(Debug)]
struct MockLink {
    client: ClientId,
    state: Arc<Mutex<MockState>>,
}

impl Link for MockLink {
    fn submit(&mut self, sequence: u64, result: &JobResult) -> SplitterResult<()> {
        let client = self.client;
        self.state
            .super_safe_lock(|s| s.submits.push((client, sequence, result.clone())));
        Ok(())
    }

    fn tick(&mut self, now: u64) {
        let client = self.client;
        self.state.super_safe_lock(|s| s.ticks.push((client, now)));
    }

    fn close(&mut self) {
        let client = self.client;
        self.state.super_safe_lock(|s| s.closed.push(client));
    }
}

/// Formatted log output of everything run through [`LogCapture::run`] on this thread.
#[derive(Debug, Clone, Default)]
pub(crate) struct LogCapture {
    buffer: Arc<Mutex<Vec<u8>>>,
}

pub(crate) struct LogCaptureWriter {
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl LogCapture {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn run<R>(&self, f: impl FnOnce() -> R) -> R {
        let subscriber = tracing_subscriber::fmt()
            .with_writer(self.clone())
            .with_max_level(Level::DEBUG)
            .with_ansi(false)
            .finish();
        tracing::dispatcher::with_default(&Dispatch::new(subscriber), f)
    }

    pub(crate) fn contents(&self) -> String {
        let bytes = self.buffer.super_safe_lock(|buffer| buffer.clone());
        String::from_utf8_lossy(&bytes).into_owned()
    }

    /// Lines logged at error level.
    pub(crate) fn errors(&self) -> Vec<String> {
        self.contents()
            .lines()
            .filter(|line| line.contains("ERROR"))
            .map(str::to_string)
            .collect()
    }
}

impl<'a> MakeWriter<'a> for LogCapture {
    type Writer = LogCaptureWriter;

    fn make_writer(&'a self) -> Self::Writer {
        LogCaptureWriter {
            buffer: self.buffer.clone(),
        }
    }
}

impl io::Write for LogCaptureWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buffer
            .super_safe_lock(|buffer| buffer.extend_from_slice(buf));
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

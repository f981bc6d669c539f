//! ## Nonce Splitter
//!
//! Core of a mining proxy that shares a small number of upstream pool connections among many
//! downstream miners.
//!
//! Each upstream slot is a [`mapper::Mapper`]: it owns the slot's connection strategy, a
//! registry of up to 256 attached sessions, and the ledger that routes upstream verdicts
//! back to the session that submitted the share. [`NonceSplitter`] is the scheduler on top:
//! it places logins into slots, opens new slots on demand, sweeps idle ones, and supervises
//! the per-slot actor tasks.
//!
//! Wire encoding stays outside the crate. The embedding proxy supplies a
//! [`strategy::Transport`] for the upstream side and drains each [`session::Session`]'s
//! outbound channel for the downstream side.
use async_channel::{unbounded, Receiver, Sender};
use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use crate::{
    config::{PoolConfig, SplitterConfig},
    error::{RejectReason, SplitterError, SplitterResult},
    events::{AcceptEvent, SubmitEvent},
    mapper::{Mapper, MapperContext},
    session::{LoginRequest, Session, SessionMessage},
    stats::ShareStats,
    status::{handle_error, State, Status, StatusSender},
    strategy::Transport,
    task_manager::TaskManager,
    utils::{IdFactory, Mutex, ShutdownMessage},
};

pub mod config;
pub mod error;
pub mod events;
pub mod job;
pub mod logging;
pub mod mapper;
pub mod registry;
pub mod session;
pub mod stats;
pub mod status;
pub mod strategy;
mod task_manager;
#[cfg(test)]
mod test_utils;
pub mod utils;

/// Slot counts by state, as reported by [`NonceSplitter::upstreams`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Upstreams {
    pub active: usize,
    /// Suspended slots.
    pub sleep: usize,
    /// Slots that are neither active nor suspended, i.e. waiting for an upstream.
    pub error: usize,
    pub total: usize,
}

/// Schedules sessions onto upstream slots.
#[derive(Debug)]
pub struct NonceSplitter {
    config: Arc<SplitterConfig>,
    ctx: MapperContext,
    mappers: Mutex<Vec<Arc<Mapper>>>,
    /// Pool list the mappers currently run on.
    pools: Mutex<Vec<PoolConfig>>,
    session_ids: Mutex<IdFactory>,
    stats: Mutex<ShareStats>,
    accepts: Receiver<AcceptEvent>,
    ticks: AtomicU64,
    notify_shutdown: broadcast::Sender<ShutdownMessage>,
    /// Present while [`NonceSplitter::start`] runs; new slots are spawned with a clone.
    shutdown_complete_tx: Mutex<Option<mpsc::Sender<()>>>,
    status_tx: Sender<Status>,
    status_rx: Receiver<Status>,
    task_manager: Arc<TaskManager>,
}

impl NonceSplitter {
    /// Creates the splitter with slot 0. Nothing connects until [`NonceSplitter::connect`]
    /// or [`NonceSplitter::start`].
    pub fn new(config: SplitterConfig, transport: Arc<dyn Transport>) -> SplitterResult<Self> {
        config.validate()?;
        let config = Arc::new(config);

        let (accepts_tx, accepts) = unbounded();
        let ctx = MapperContext {
            config: config.clone(),
            agent: Arc::from(config.user_agent.as_str()),
            transport,
            accepts: accepts_tx,
        };
        let primary = Arc::new(Mapper::new(0, &ctx, &config.pools)?);

        let (notify_shutdown, _) = broadcast::channel::<ShutdownMessage>(1);
        let (status_tx, status_rx) = unbounded::<Status>();

        Ok(Self {
            pools: Mutex::new(config.pools.clone()),
            config,
            ctx,
            mappers: Mutex::new(vec![primary]),
            session_ids: Mutex::new(IdFactory::new()),
            stats: Mutex::new(ShareStats::new()),
            accepts,
            ticks: AtomicU64::new(0),
            notify_shutdown,
            shutdown_complete_tx: Mutex::new(None),
            status_tx,
            status_rx,
            task_manager: Arc::new(TaskManager::new()),
        })
    }

    pub fn config(&self) -> &SplitterConfig {
        &self.config
    }

    /// Brings up slot 0.
    pub fn connect(&self) {
        if let Some(primary) = self.mapper(0) {
            primary.start();
        }
    }

    /// Creates a session handle with a fresh id, replying on `sender`.
    pub fn new_session(&self, sender: Sender<SessionMessage>) -> Arc<Session> {
        let id = self.session_ids.super_safe_lock(|ids| ids.next());
        Arc::new(Session::new(id, sender))
    }

    pub fn mapper(&self, id: usize) -> Option<Arc<Mapper>> {
        self.mappers
            .super_safe_lock(|mappers| mappers.get(id).cloned())
    }

    pub fn mapper_count(&self) -> usize {
        self.mappers.super_safe_lock(|mappers| mappers.len())
    }

    /// Attaches `session` to the first slot that takes it, opening a new slot if none does.
    /// Returns the slot id.
    pub fn login(&self, session: &Arc<Session>, request: &LoginRequest) -> SplitterResult<usize> {
        let mappers = self.mappers.super_safe_lock(|mappers| mappers.clone());
        for mapper in &mappers {
            if mapper.add(session, request) {
                return Ok(mapper.id());
            }
        }

        let mapper = self.create_mapper()?;
        if mapper.add(session, request) {
            Ok(mapper.id())
        } else {
            Err(SplitterError::MapperFull(mapper.id()))
        }
    }

    fn create_mapper(&self) -> SplitterResult<Arc<Mapper>> {
        let pools = self.pools.super_safe_lock(|pools| pools.clone());
        let mapper = self.mappers.super_safe_lock(|mappers| {
            let mapper = Arc::new(Mapper::new(mappers.len(), &self.ctx, &pools)?);
            mappers.push(mapper.clone());
            Ok::<_, SplitterError>(mapper)
        })?;

        info!("#{:03} slot created", mapper.id());
        mapper.start();

        let shutdown_complete_tx = self.shutdown_complete_tx.super_safe_lock(|tx| tx.clone());
        if let Some(shutdown_complete_tx) = shutdown_complete_tx {
            self.spawn_mapper(mapper.clone(), shutdown_complete_tx);
        }
        Ok(mapper)
    }

    fn spawn_mapper(&self, mapper: Arc<Mapper>, shutdown_complete_tx: mpsc::Sender<()>) {
        mapper.run(
            &self.notify_shutdown,
            shutdown_complete_tx,
            self.status_tx.clone(),
            &self.task_manager,
        );
    }

    /// Routes a share to the session's slot.
    pub fn submit(&self, event: &SubmitEvent) -> Result<u64, RejectReason> {
        match event.session().mapper_id().and_then(|id| self.mapper(id)) {
            Some(mapper) => mapper.submit(event),
            None => {
                event.reject(RejectReason::BadGateway);
                Err(RejectReason::BadGateway)
            }
        }
    }

    /// Detaches a disconnected session from its slot.
    pub fn close(&self, session: &Session) {
        if let Some(mapper) = session.mapper_id().and_then(|id| self.mapper(id)) {
            mapper.remove(session);
        }
    }

    /// Drives every slot. Every `gc_interval_ticks` ticks the idle slots are swept too.
    pub fn tick(&self, ticks: u64, now: u64) {
        let mappers = self.mappers.super_safe_lock(|mappers| mappers.clone());
        for mapper in &mappers {
            mapper.tick(ticks, now);
        }

        if ticks % self.config.gc_interval_ticks == 0 {
            for mapper in &mappers {
                mapper.gc();
            }
        }
    }

    pub fn gc(&self) {
        let mappers = self.mappers.super_safe_lock(|mappers| mappers.clone());
        for mapper in &mappers {
            mapper.gc();
        }
    }

    /// Switches every slot to `pools`.
    pub fn reload(&self, pools: Vec<PoolConfig>) -> SplitterResult<()> {
        if pools.is_empty() {
            return Err(SplitterError::NoPools);
        }

        let previous = self.pools.super_safe_lock(|current| current.clone());
        let mappers = self.mappers.super_safe_lock(|mappers| mappers.clone());
        for mapper in &mappers {
            mapper.reload(&pools, &previous)?;
        }
        self.pools.super_safe_lock(|current| *current = pools);
        Ok(())
    }

    pub fn upstreams(&self) -> Upstreams {
        let mappers = self.mappers.super_safe_lock(|mappers| mappers.clone());
        let mut upstreams = Upstreams {
            total: mappers.len(),
            ..Default::default()
        };

        for mapper in &mappers {
            if mapper.is_active() {
                upstreams.active += 1;
            } else if mapper.is_suspended() {
                upstreams.sleep += 1;
            } else {
                upstreams.error += 1;
            }
        }
        upstreams
    }

    pub fn stats(&self) -> ShareStats {
        self.stats.super_safe_lock(|stats| *stats)
    }

    fn record(&self, event: &AcceptEvent) {
        let stats = self.stats.super_safe_lock(|stats| {
            stats.add(event);
            *stats
        });
        if self.config.verbose {
            stats.log(event, self.config.colors);
        }
    }

    /// Handles every queued event of every slot, then folds queued acceptance records into
    /// the stats. Returns how many events were handled.
    ///
    /// Drives the splitter when [`NonceSplitter::start`] is not running.
    pub fn process_pending_events(&self) -> usize {
        let mappers = self.mappers.super_safe_lock(|mappers| mappers.clone());
        let mut handled: usize = mappers
            .iter()
            .map(|mapper| mapper.process_pending_events())
            .sum();

        while let Ok(event) = self.accepts.try_recv() {
            self.record(&event);
            handled += 1;
        }
        handled
    }

    /// Asks a running [`NonceSplitter::start`] to shut down.
    pub fn shutdown(&self) {
        if self
            .notify_shutdown
            .send(ShutdownMessage::ShutdownAll)
            .is_err()
        {
            debug!("Shutdown requested with no running tasks");
        }
    }

    /// Runs the splitter until Ctrl+C, [`NonceSplitter::shutdown`], or a slot failure.
    ///
    /// Every slot gets its actor task, and the tick interval drives the slots and the idle
    /// sweep. On exit all tasks are told to stop and get 5 seconds to finish.
    pub async fn start(self: Arc<Self>) -> SplitterResult<()> {
        info!(
            "Starting nonce splitter with {} pools...",
            self.pools.super_safe_lock(|pools| pools.len())
        );

        let mut shutdown_rx = self.notify_shutdown.subscribe();
        let (shutdown_complete_tx, mut shutdown_complete_rx) = mpsc::channel::<()>(1);
        self.shutdown_complete_tx
            .super_safe_lock(|tx| *tx = Some(shutdown_complete_tx.clone()));

        self.connect();
        let mappers = self.mappers.super_safe_lock(|mappers| mappers.clone());
        for mapper in mappers {
            self.spawn_mapper(mapper, shutdown_complete_tx.clone());
        }
        self.spawn_stats(shutdown_complete_tx.clone());

        let mut interval =
            tokio::time::interval(Duration::from_millis(self.config.tick_interval_ms));
        // The first tick completes immediately.
        interval.tick().await;

        let result = loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Ctrl+C received, initiating graceful shutdown...");
                    break Ok(());
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutdown requested, stopping all slots...");
                    break Ok(());
                }
                message = self.status_rx.recv() => {
                    if let Ok(status) = message {
                        match status.state {
                            State::MapperShutdown { mapper_id, reason } => {
                                warn!("Mapper #{mapper_id:03} failed, initiating full shutdown.");
                                break Err(reason);
                            }
                            State::SplitterShutdown(reason) => {
                                warn!("Splitter failure, initiating full shutdown.");
                                break Err(reason);
                            }
                        }
                    }
                }
                _ = interval.tick() => {
                    let ticks = self.ticks.fetch_add(1, Ordering::Relaxed) + 1;
                    self.tick(ticks, now_millis());
                }
            }
        };

        let _ = self.notify_shutdown.send(ShutdownMessage::ShutdownAll);
        self.shutdown_complete_tx.super_safe_lock(|tx| tx.take());
        drop(shutdown_complete_tx);

        info!("Waiting for shutdown completion signals from slots...");
        let shutdown_timeout = Duration::from_secs(5);
        tokio::select! {
            _ = shutdown_complete_rx.recv() => {
                info!("All slots reported shutdown complete.");
            }
            _ = tokio::time::sleep(shutdown_timeout) => {
                warn!("Graceful shutdown timed out after {shutdown_timeout:?}, forcing shutdown.");
                self.task_manager.abort_all();
            }
        }
        self.task_manager.join_all().await;
        info!("Nonce splitter shutdown complete.");

        if let Err(e) = &result {
            error!("Nonce splitter stopped on error: {e}");
        }
        result
    }

    /// Folds acceptance records into the stats until shutdown.
    fn spawn_stats(self: &Arc<Self>, shutdown_complete_tx: mpsc::Sender<()>) {
        let splitter = self.clone();
        let mut shutdown_rx = self.notify_shutdown.subscribe();
        let status_sender = StatusSender::Splitter(self.status_tx.clone());

        self.task_manager.spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    event = splitter.accepts.recv() => {
                        match event {
                            Ok(event) => splitter.record(&event),
                            Err(e) => {
                                handle_error(&status_sender, SplitterError::from(e)).await;
                                break;
                            }
                        }
                    }
                }
            }
            drop(shutdown_complete_tx);
            debug!("Stats task stopped");
        });
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or_default()
}

//! ## Mapper
//!
//! One upstream slot of the splitter. A [`Mapper`] composes the slot's primary strategy, an
//! optional donation strategy, the session registry and the [`SubmitLedger`]. All of that
//! lives in [`MapperData`] behind a single lock, so attach, submit, the periodic sweeps and
//! the strategy callbacks never interleave for the same slot.
//!
//! Events flow in two stages. The transport reports [`ClientEvent`]s on the mapper's client
//! channel; the mapper hands each one to the strategy that opened the link, and that strategy
//! answers with [`StrategyEvent`]s on the strategy channel. Those are dispatched to the
//! listener callbacks (`on_active`, `on_job`, `on_pause`, `on_result_accepted`).
use std::sync::Arc;

use async_channel::{unbounded, Receiver, Sender};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, trace, warn};

use crate::{
    config::{PoolConfig, SplitterConfig},
    error::{RejectReason, SplitterError, SplitterResult},
    events::{AcceptEvent, SubmitEvent},
    job::{Job, SubmitResult},
    registry::{NonceStorage, SessionRegistry},
    session::{LoginRequest, Session},
    status::{handle_error, Status, StatusSender},
    strategy::{
        create_strategy, ClientEvent, Connection, DonateStrategy, Strategy, StrategyContext,
        StrategyEvent, StrategyId, StrategyListener, Transport,
    },
    task_manager::TaskManager,
    utils::{
        paint, IdFactory, Mutex, SequenceFactory, ShutdownMessage, BOLD_CYAN, BOLD_GRAY,
        BOLD_MAGENTA, BOLD_WHITE,
    },
};

mod ledger;

pub use ledger::{SubmitContext, SubmitLedger};

/// What every mapper of a splitter shares.
#[derive(Debug, Clone)]
pub struct MapperContext {
    pub config: Arc<SplitterConfig>,
    pub agent: Arc<str>,
    pub transport: Arc<dyn Transport>,
    /// Where acceptance records go.
    pub accepts: Sender<AcceptEvent>,
}

/// Mutable state of one slot.
#[derive(Debug)]
pub struct MapperData {
    pub storage: Box<dyn SessionRegistry>,
    pub ledger: SubmitLedger,
    /// 0 while active. Counts idle sweeps while suspended.
    pub suspended: u64,
    pub strategy: Box<dyn Strategy>,
    /// Strategy built by a reload, waiting for its first login.
    pub pending: Option<Box<dyn Strategy>>,
    pub donate: Option<DonateStrategy>,
    /// Latest job from the primary strategy, kept while a donation window holds the registry.
    primary_job: Option<Job>,
    /// Strategy whose final pause from `stop()` is still queued.
    stopped: Option<StrategyId>,
    strategy_ids: IdFactory,
}

impl MapperData {
    fn is_suspended(&self) -> bool {
        self.suspended > 0
    }

    /// Primary or donation strategy.
    fn owns(&self, id: StrategyId) -> bool {
        self.strategy.id() == id || self.donate.as_ref().is_some_and(|d| d.id() == id)
    }

    fn is_pending(&self, id: StrategyId) -> bool {
        self.pending.as_ref().is_some_and(|p| p.id() == id)
    }

    fn route_client_event(&mut self, event: ClientEvent) -> bool {
        let id = event.client().strategy;
        if self.strategy.id() == id {
            self.strategy.handle_client_event(event);
            return true;
        }
        if let Some(pending) = self.pending.as_mut().filter(|p| p.id() == id) {
            pending.handle_client_event(event);
            return true;
        }
        if let Some(donate) = self.donate.as_mut().filter(|d| d.id() == id) {
            donate.handle_client_event(event);
            return true;
        }
        false
    }

    fn is_donation(&self, id: StrategyId) -> bool {
        self.donate.as_ref().is_some_and(|d| d.id() == id)
    }

    fn suspend(&mut self) -> usize {
        self.suspended = 1;
        self.storage.set_active(false);
        self.storage.reset();
        self.primary_job = None;
        if self.strategy.is_active() {
            self.stopped = Some(self.strategy.id());
        }
        self.strategy.stop();
        if let Some(mut pending) = self.pending.take() {
            pending.stop();
        }
        if let Some(donate) = self.donate.as_mut() {
            donate.stop();
        }
        self.ledger.clear()
    }

    fn reconnect(&mut self) {
        self.suspended = 0;
        self.strategy.connect();
        if let Some(donate) = self.donate.as_mut() {
            donate.connect();
        }
    }
}

impl Drop for MapperData {
    fn drop(&mut self) {
        self.strategy.release();
        if let Some(pending) = self.pending.as_mut() {
            pending.release();
        }
        if let Some(donate) = self.donate.as_mut() {
            donate.release();
        }
        self.storage.reset();
    }
}

#[derive(Debug)]
pub struct Mapper {
    id: usize,
    config: Arc<SplitterConfig>,
    data: Arc<Mutex<MapperData>>,
    ctx: StrategyContext,
    listener: StrategyListener,
    client_events: Receiver<ClientEvent>,
    strategy_events: Receiver<StrategyEvent>,
    accepts: Sender<AcceptEvent>,
}

impl Mapper {
    /// Builds slot `id` over `pools` with the default [`NonceStorage`] registry.
    ///
    /// Nothing connects until [`Mapper::start`].
    pub fn new(id: usize, ctx: &MapperContext, pools: &[PoolConfig]) -> SplitterResult<Self> {
        Self::with_registry(id, ctx, pools, Box::new(NonceStorage::new()))
    }

    pub fn with_registry(
        id: usize,
        ctx: &MapperContext,
        pools: &[PoolConfig],
        storage: Box<dyn SessionRegistry>,
    ) -> SplitterResult<Self> {
        let (client_tx, client_events) = unbounded();
        let (strategy_tx, strategy_events) = unbounded();

        let strategy_ctx = StrategyContext {
            transport: ctx.transport.clone(),
            agent: ctx.agent.clone(),
            client_events: client_tx,
            sequences: Arc::new(SequenceFactory::new()),
            retries: ctx.config.retries,
        };
        let listener = StrategyListener::new(strategy_tx);

        let mut strategy_ids = IdFactory::new();
        let strategy = create_strategy(
            StrategyId(strategy_ids.next()),
            pools,
            strategy_ctx.clone(),
            listener.clone(),
        )?;

        let donate = match &ctx.config.donate_pool {
            Some(pool) if id != 0 && ctx.config.donate_level > 0 => Some(DonateStrategy::new(
                StrategyId(strategy_ids.next()),
                ctx.config.donate_level,
                pool.clone(),
                strategy_ctx.clone(),
                listener.clone(),
            )),
            _ => None,
        };

        let data = MapperData {
            storage,
            ledger: SubmitLedger::new(),
            suspended: 0,
            strategy,
            pending: None,
            donate,
            primary_job: None,
            stopped: None,
            strategy_ids,
        };

        Ok(Self {
            id,
            config: ctx.config.clone(),
            data: Arc::new(Mutex::new(data)),
            ctx: strategy_ctx,
            listener,
            client_events,
            strategy_events,
            accepts: ctx.accepts.clone(),
        })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Attaches `session`. Returns false, with no side effect, when the registry refuses it.
    pub fn add(&self, session: &Arc<Session>, request: &LoginRequest) -> bool {
        let added = self.data.super_safe_lock(|data| {
            if !data.storage.add(session, request) {
                return false;
            }
            if data.is_suspended() {
                info!("#{:03} resuming for session {}", self.id, session.id());
                data.reconnect();
            }
            true
        });

        if added {
            session.set_mapper_id(self.id);
        }
        added
    }

    pub fn remove(&self, session: &Session) {
        self.data
            .super_safe_lock(|data| data.storage.remove(session));
    }

    pub fn is_active(&self) -> bool {
        self.data
            .super_safe_lock(|data| data.storage.is_active() && !data.is_suspended())
    }

    pub fn is_suspended(&self) -> bool {
        self.data.super_safe_lock(|data| data.is_suspended())
    }

    /// Idle sweeps seen while suspended; 0 while active.
    pub fn suspended_count(&self) -> u64 {
        self.data.super_safe_lock(|data| data.suspended)
    }

    pub fn session_count(&self) -> usize {
        self.data.super_safe_lock(|data| data.storage.session_count())
    }

    /// Idle sweep. Suspends an elastic slot that has no attached session.
    pub fn gc(&self) {
        self.data.super_safe_lock(|data| {
            if data.is_suspended() {
                data.suspended += 1;
                return;
            }
            if self.id == 0 || data.storage.is_used() {
                return;
            }

            let dropped = data.suspend();
            info!("#{:03} {}", self.id, paint(self.config.colors, BOLD_GRAY, "suspended"));
            if dropped > 0 {
                debug!("#{:03} dropped {dropped} pending submissions", self.id);
            }
        });
    }

    /// Initial bring-up of the slot.
    pub fn start(&self) {
        self.data.super_safe_lock(|data| data.reconnect());
    }

    /// Replaces the pool list.
    ///
    /// The new strategy connects right away and takes over on its first login. A suspended
    /// slot installs it directly; it connects when the slot resumes.
    pub fn reload(&self, pools: &[PoolConfig], previous: &[PoolConfig]) -> SplitterResult<()> {
        if pools == previous {
            return Ok(());
        }

        self.data.super_safe_lock(|data| -> SplitterResult<()> {
            let mut strategy = create_strategy(
                StrategyId(data.strategy_ids.next()),
                pools,
                self.ctx.clone(),
                self.listener.clone(),
            )?;

            if data.is_suspended() {
                let mut previous = std::mem::replace(&mut data.strategy, strategy);
                previous.release();
                info!("#{:03} pool list replaced while suspended", self.id);
                return Ok(());
            }

            strategy.connect();
            if let Some(mut replaced) = data.pending.replace(strategy) {
                debug!(
                    "#{:03} dropping unfinished reload {}",
                    self.id,
                    replaced.id().0
                );
                replaced.release();
            }
            info!("#{:03} reloading {} pools", self.id, pools.len());
            Ok(())
        })
    }

    /// Forwards a share upstream.
    ///
    /// Returns the sequence number it was sent with. A rejection has already been replied to
    /// the session when this returns `Err`.
    pub fn submit(&self, event: &SubmitEvent) -> Result<u64, RejectReason> {
        let routed = self.data.super_safe_lock(|data| {
            if !data.storage.is_active() {
                return Err(RejectReason::BadGateway);
            }
            if !data.storage.is_valid_job_id(&event.request.job_id) {
                return Err(RejectReason::InvalidJobId);
            }

            let mut request = event.request.clone();
            request.diff = data.storage.job().diff;

            let submitted = match data.donate.as_mut() {
                Some(donate) if donate.is_active() => {
                    donate.submit(&request).map(|seq| (seq, donate.id()))
                }
                _ => data
                    .strategy
                    .submit(&request)
                    .map(|seq| (seq, data.strategy.id())),
            };

            match submitted {
                Ok((sequence, strategy)) => {
                    data.ledger.record(
                        sequence,
                        request.request_id,
                        event.session().id(),
                        strategy,
                    );
                    Ok(sequence)
                }
                Err(e) => {
                    warn!("#{:03} submit failed: {e}", self.id);
                    Err(RejectReason::BadGateway)
                }
            }
        });

        if let Err(reason) = routed {
            event.reject(reason);
        }
        routed
    }

    /// `now` is in milliseconds.
    pub fn tick(&self, ticks: u64, now: u64) {
        self.data.super_safe_lock(|data| {
            data.strategy.tick(now);
            if let Some(pending) = data.pending.as_mut() {
                pending.tick(now);
            }
            if let Some(donate) = data.donate.as_mut() {
                donate.tick(now);
            }
        });
        trace!("#{:03} tick {ticks}", self.id);
    }

    /// Closes every link of the slot without notifying anyone.
    pub fn release(&self) {
        self.data.super_safe_lock(|data| {
            data.strategy.release();
            if let Some(mut pending) = data.pending.take() {
                pending.release();
            }
            if let Some(donate) = data.donate.as_mut() {
                donate.release();
            }
            data.storage.set_active(false);
        });
    }

    pub fn handle_client_event(&self, event: ClientEvent) {
        let strategy = event.client().strategy;
        let routed = self
            .data
            .super_safe_lock(|data| data.route_client_event(event));
        if !routed {
            debug!(
                "#{:03} ignoring event for released strategy {}",
                self.id, strategy.0
            );
        }
    }

    pub fn handle_strategy_event(&self, event: StrategyEvent) {
        self.data.super_safe_lock(|data| match event {
            StrategyEvent::Active {
                strategy,
                connection,
            } => self.on_active(data, strategy, connection),
            StrategyEvent::Job {
                strategy,
                connection,
                job,
            } => self.on_job(data, strategy, connection, job),
            StrategyEvent::Pause { strategy } => self.on_pause(data, strategy),
            StrategyEvent::ResultAccepted {
                strategy,
                connection,
                result,
                error,
            } => self.on_result_accepted(data, strategy, connection, result, error),
        });
    }

    /// Handles every queued event without waiting. Returns how many were handled.
    ///
    /// Drives the slot when no actor task runs it.
    pub fn process_pending_events(&self) -> usize {
        let mut handled = 0;
        loop {
            if let Ok(event) = self.client_events.try_recv() {
                self.handle_client_event(event);
            } else if let Ok(event) = self.strategy_events.try_recv() {
                self.handle_strategy_event(event);
            } else {
                return handled;
            }
            handled += 1;
        }
    }

    fn on_active(&self, data: &mut MapperData, strategy: StrategyId, connection: Connection) {
        if !data.owns(strategy) && !data.is_pending(strategy) {
            return;
        }

        data.storage.set_active(true);
        if connection.is_donation() {
            return;
        }

        if strategy != data.strategy.id() {
            let Some(next) = data.pending.take() else {
                return;
            };
            let mut previous = std::mem::replace(&mut data.strategy, next);
            previous.release();
            data.primary_job = None;
            let dropped = data.ledger.purge_strategy(previous.id());
            info!(
                "#{:03} switched to reloaded pools, {dropped} pending submissions dropped",
                self.id
            );
        }

        let colors = self.config.colors;
        info!(
            "#{:03} {} {} {}",
            self.id,
            paint(colors, BOLD_WHITE, "use pool"),
            paint(
                colors,
                BOLD_CYAN,
                &format!("{}:{}", connection.host, connection.port)
            ),
            paint(colors, BOLD_GRAY, connection.ip.as_deref().unwrap_or("-")),
        );
    }

    fn on_job(&self, data: &mut MapperData, strategy: StrategyId, connection: Connection, job: Job) {
        if !data.owns(strategy) {
            return;
        }

        if self.config.verbose {
            let colors = self.config.colors;
            info!(
                "#{:03} {} {} diff {} algo {}",
                self.id,
                paint(colors, BOLD_MAGENTA, "new job"),
                paint(
                    colors,
                    BOLD_CYAN,
                    &format!("{}:{}", connection.host, connection.port)
                ),
                paint(colors, BOLD_WHITE, &job.diff.to_string()),
                job.algorithm.as_deref().unwrap_or("-"),
            );
        }

        if !connection.is_donation() {
            data.primary_job = Some(job.clone());
            // A lost donation window may have left the registry without a job to serve.
            data.storage.set_active(true);
        }

        if let Some(donate) = data.donate.as_mut() {
            if donate.is_active() && !connection.is_donation() && !donate.reschedule() {
                return;
            }
        }

        data.storage.set_job(job);
    }

    fn on_pause(&self, data: &mut MapperData, strategy: StrategyId) {
        if data.stopped == Some(strategy) {
            data.stopped = None;
            debug!("#{:03} strategy {} stopped", self.id, strategy.0);
            return;
        }
        if !data.owns(strategy) {
            return;
        }
        if data.is_donation(strategy) {
            self.on_donation_pause(data, strategy);
            return;
        }

        data.storage.set_active(false);
        if !data.is_suspended() {
            error!("#{:03} no active pools, stop", self.id);
        }
    }

    /// The donation upstream dropped mid-window. Sessions go back to the primary job, so
    /// shares for the donation job are rejected as stale from here on.
    fn on_donation_pause(&self, data: &mut MapperData, strategy: StrategyId) {
        let dropped = data.ledger.purge_strategy(strategy);
        match data.primary_job.clone() {
            Some(job) if data.strategy.is_active() => {
                info!(
                    "#{:03} donation upstream lost, back to job {} ({dropped} pending submissions dropped)",
                    self.id, job.id
                );
                data.storage.set_job(job);
            }
            _ => {
                data.storage.set_active(false);
                if !data.is_suspended() {
                    error!("#{:03} no active pools, stop", self.id);
                }
            }
        }
    }

    fn on_result_accepted(
        &self,
        data: &mut MapperData,
        strategy: StrategyId,
        connection: Connection,
        result: SubmitResult,
        error: Option<String>,
    ) {
        if !data.owns(strategy) {
            return;
        }

        let ctx = data.ledger.resolve(result.seq, &*data.storage);

        let record = AcceptEvent {
            mapper_id: self.id,
            session_id: ctx.session_id,
            result,
            donation: connection.is_donation(),
            error: error.clone(),
        };
        if let Err(e) = self.accepts.try_send(record) {
            warn!("#{:03} acceptance record dropped: {e}", self.id);
        }

        let Some(session) = ctx.session else {
            return;
        };
        match error {
            Some(message) => session.reply_with_error(ctx.request_id, &message),
            None => session.success(ctx.request_id, "OK"),
        }
    }

    /// Spawns the slot's actor loop on `task_manager`.
    ///
    /// The loop runs until a [`ShutdownMessage`] arrives, then releases every link of the slot.
    pub fn run(
        self: Arc<Self>,
        notify_shutdown: &broadcast::Sender<ShutdownMessage>,
        shutdown_complete_tx: mpsc::Sender<()>,
        status_tx: Sender<Status>,
        task_manager: &TaskManager,
    ) {
        let mut shutdown_rx = notify_shutdown.subscribe();
        let status_sender = StatusSender::Mapper {
            mapper_id: self.id,
            tx: status_tx,
        };

        task_manager.spawn(async move {
            loop {
                tokio::select! {
                    message = shutdown_rx.recv() => {
                        match message {
                            Ok(ShutdownMessage::ShutdownAll) => {
                                debug!("#{:03} received shutdown", self.id);
                                break;
                            }
                            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                                warn!("#{:03} shutdown channel lagged by {skipped}", self.id);
                            }
                            Err(broadcast::error::RecvError::Closed) => {
                                debug!("#{:03} shutdown channel closed", self.id);
                                break;
                            }
                        }
                    }
                    event = self.client_events.recv() => {
                        match event {
                            Ok(event) => self.handle_client_event(event),
                            Err(e) => {
                                handle_error(&status_sender, SplitterError::from(e)).await;
                                break;
                            }
                        }
                    }
                    event = self.strategy_events.recv() => {
                        match event {
                            Ok(event) => self.handle_strategy_event(event),
                            Err(e) => {
                                handle_error(&status_sender, SplitterError::from(e)).await;
                                break;
                            }
                        }
                    }
                }
            }

            self.release();
            drop(shutdown_complete_tx);
            info!("#{:03} stopped", self.id);
        });
    }
}

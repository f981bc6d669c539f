use async_channel::{unbounded, Receiver};
use rand::Rng;
use tracing::{debug, info};

use super::{
    single_pool::SinglePoolStrategy, ClientEvent, Strategy, StrategyContext, StrategyEvent,
    StrategyId, StrategyListener,
};
use crate::{config::PoolConfig, error::SplitterResult, job::JobResult};

/// Length of one donation cycle in ticks (100 minutes at one tick per second).
pub const DONATE_CYCLE_TICKS: u64 = 6000;

/// Periodically lends the slot to a donation pool.
///
/// For `level` percent of every cycle the strategy connects to the donation pool, reports
/// itself active on the first donation job, and forwards donation jobs as if they came from
/// the pseudo-connection [`super::DONATION_CONNECTION_ID`]. The window ends through
/// [`DonateStrategy::reschedule`], which the mapper calls when the real pool sends a job.
#[derive(Debug)]
pub struct DonateStrategy {
    id: StrategyId,
    inner: SinglePoolStrategy,
    inner_events: Receiver<StrategyEvent>,
    listener: StrategyListener,
    /// Donation window length in ticks.
    level_ticks: u64,
    active: bool,
    /// Set by `stop`; the schedule does not advance while suspended.
    suspended: bool,
    window_open: bool,
    ticks: u64,
    target: u64,
    donate_ticks: u64,
}

impl DonateStrategy {
    pub fn new(
        id: StrategyId,
        level: u8,
        pool: PoolConfig,
        ctx: StrategyContext,
        listener: StrategyListener,
    ) -> Self {
        let (inner_sender, inner_events) = unbounded();
        let inner =
            SinglePoolStrategy::new(id, pool, ctx, StrategyListener::new(inner_sender));
        let level_ticks = u64::from(level) * 60;
        let idle = DONATE_CYCLE_TICKS.saturating_sub(level_ticks) as f64;
        let target = (idle * rand::thread_rng().gen_range(0.5..1.5)) as u64;

        Self {
            id,
            inner,
            inner_events,
            listener,
            level_ticks,
            active: false,
            suspended: true,
            window_open: false,
            ticks: 0,
            target,
            donate_ticks: 0,
        }
    }

    /// Ends the current donation window once it has lasted long enough.
    ///
    /// Returns false while the window is still running. Otherwise schedules the next window,
    /// deactivates, closes the donation link, and returns true.
    pub fn reschedule(&mut self) -> bool {
        if self.donate_ticks < self.level_ticks {
            return false;
        }

        let idle = DONATE_CYCLE_TICKS.saturating_sub(self.level_ticks) as f64;
        let stretch = self.donate_ticks as f64 / self.level_ticks as f64;
        self.target = self.ticks + (idle * stretch) as u64;
        debug!(
            "Donation {}: window done after {} ticks, next at tick {}",
            self.id.0, self.donate_ticks, self.target
        );
        self.close_window();
        true
    }

    /// Ticks left until the next donation window opens.
    pub fn ticks_until_window(&self) -> u64 {
        self.target.saturating_sub(self.ticks)
    }

    #[cfg(test)]
    pub(crate) fn schedule_window_in(&mut self, ticks: u64) {
        self.target = self.ticks + ticks;
    }

    fn close_window(&mut self) {
        self.active = false;
        self.window_open = false;
        self.donate_ticks = 0;
        self.inner.release();
        self.drain_inner();
    }

    /// Translates what the inner single-pool strategy reported into donation events.
    fn drain_inner(&mut self) {
        while let Ok(event) = self.inner_events.try_recv() {
            match event {
                // Activity is only reported once the first donation job arrives.
                StrategyEvent::Active { .. } => {}
                StrategyEvent::Job {
                    connection, job, ..
                } => {
                    if !self.window_open {
                        continue;
                    }
                    let connection = connection.into_donation();
                    if !self.active {
                        self.active = true;
                        info!("Donation {}: window opened", self.id.0);
                        self.listener.on_active(self.id, connection.clone());
                    }
                    self.listener.on_job(self.id, connection, job);
                }
                StrategyEvent::Pause { .. } => {
                    if self.active {
                        info!(
                            "Donation {}: upstream lost, skipping to next window",
                            self.id.0
                        );
                        self.target =
                            self.ticks + DONATE_CYCLE_TICKS.saturating_sub(self.level_ticks);
                        self.active = false;
                        self.window_open = false;
                        self.donate_ticks = 0;
                        self.inner.release();
                        self.listener.on_pause(self.id);
                    }
                }
                StrategyEvent::ResultAccepted {
                    connection,
                    result,
                    error,
                    ..
                } => {
                    self.listener.on_result_accepted(
                        self.id,
                        connection.into_donation(),
                        result,
                        error,
                    );
                }
            }
        }
    }
}

impl Strategy for DonateStrategy {
    fn id(&self) -> StrategyId {
        self.id
    }

    fn is_active(&self) -> bool {
        self.active
    }

    /// Arms the schedule; the donation link itself opens when the next window starts.
    fn connect(&mut self) {
        self.suspended = false;
    }

    fn stop(&mut self) {
        self.suspended = true;
        self.active = false;
        self.window_open = false;
        self.donate_ticks = 0;
        self.inner.stop();
        self.drain_inner();
    }

    fn release(&mut self) {
        self.active = false;
        self.window_open = false;
        self.inner.release();
    }

    fn submit(&mut self, result: &JobResult) -> SplitterResult<u64> {
        self.inner.submit(result)
    }

    fn tick(&mut self, now: u64) {
        self.inner.tick(now);
        self.ticks += 1;

        if !self.suspended && !self.window_open && self.ticks >= self.target {
            debug!("Donation {}: opening window", self.id.0);
            self.window_open = true;
            self.inner.connect();
        }

        if self.active {
            self.donate_ticks += 1;
        }
    }

    fn handle_client_event(&mut self, event: ClientEvent) {
        self.inner.handle_client_event(event);
        self.drain_inner();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        job::{Job, SubmitResult},
        test_utils::{pool, MockTransport},
    };
    use async_channel::unbounded;
    use std::sync::Arc;

    fn setup(level: u8) -> (DonateStrategy, Arc<MockTransport>, Receiver<StrategyEvent>) {
        let transport = MockTransport::new();
        let (client_tx, _client_rx) = unbounded();
        let (event_tx, event_rx) = unbounded();
        let strategy = DonateStrategy::new(
            StrategyId(9),
            level,
            pool("donate.example"),
            transport.context(client_tx),
            StrategyListener::new(event_tx),
        );
        (strategy, transport, event_rx)
    }

    #[test]
    fn test_first_window_is_jittered_around_idle_time() {
        for _ in 0..20 {
            let (strategy, _transport, _events) = setup(1);
            let idle = DONATE_CYCLE_TICKS - 60;
            let wait = strategy.ticks_until_window();
            assert!(wait >= idle / 2 && wait < idle + idle / 2, "wait {wait}");
        }
    }

    #[test]
    fn test_window_opens_only_when_armed() {
        let (mut strategy, transport, _events) = setup(1);
        strategy.schedule_window_in(2);

        strategy.tick(0);
        strategy.tick(0);
        assert!(transport.opened().is_empty());

        strategy.connect();
        strategy.tick(0);
        assert_eq!(transport.opened().len(), 1);
        assert_eq!(transport.opened()[0].1.host, "donate.example");
    }

    #[test]
    fn test_first_job_activates_with_donation_connection() {
        let (mut strategy, transport, events) = setup(1);
        strategy.schedule_window_in(1);
        strategy.connect();
        strategy.tick(0);
        let client = transport.last_client().unwrap();

        strategy.handle_client_event(ClientEvent::LoginSuccess { client, ip: None });
        assert!(events.try_recv().is_err());
        assert!(!strategy.is_active());

        strategy.handle_client_event(ClientEvent::Job {
            client,
            job: Job::new("D1", 500),
        });
        assert!(strategy.is_active());
        match events.try_recv().unwrap() {
            StrategyEvent::Active { connection, .. } => assert!(connection.is_donation()),
            other => panic!("Expected Active, got {other:?}"),
        }
        match events.try_recv().unwrap() {
            StrategyEvent::Job { connection, job, .. } => {
                assert!(connection.is_donation());
                assert_eq!(job.id, "D1");
            }
            other => panic!("Expected Job, got {other:?}"),
        }

        strategy.handle_client_event(ClientEvent::ResultAccepted {
            client,
            result: SubmitResult::new(3, 500),
            error: None,
        });
        match events.try_recv().unwrap() {
            StrategyEvent::ResultAccepted { connection, .. } => assert!(connection.is_donation()),
            other => panic!("Expected ResultAccepted, got {other:?}"),
        }
    }

    #[test]
    fn test_reschedule_waits_for_full_window() {
        let (mut strategy, transport, _events) = setup(1);
        strategy.schedule_window_in(1);
        strategy.connect();
        strategy.tick(0);
        let client = transport.last_client().unwrap();
        strategy.handle_client_event(ClientEvent::LoginSuccess { client, ip: None });
        strategy.handle_client_event(ClientEvent::Job {
            client,
            job: Job::new("D1", 500),
        });

        for _ in 0..59 {
            strategy.tick(0);
        }
        assert!(!strategy.reschedule());
        assert!(strategy.is_active());

        strategy.tick(0);
        assert!(strategy.reschedule());
        assert!(!strategy.is_active());
        assert!(transport.closed().contains(&client));
        assert_eq!(strategy.ticks_until_window(), DONATE_CYCLE_TICKS - 60);
    }

    #[test]
    fn test_lost_donation_upstream_reports_pause_and_skips_window() {
        let (mut strategy, transport, events) = setup(2);
        strategy.schedule_window_in(1);
        strategy.connect();
        strategy.tick(0);
        let client = transport.last_client().unwrap();
        strategy.handle_client_event(ClientEvent::LoginSuccess { client, ip: None });
        strategy.handle_client_event(ClientEvent::Job {
            client,
            job: Job::new("D1", 500),
        });
        while events.try_recv().is_ok() {}

        strategy.handle_client_event(ClientEvent::Close { client, failures: 1 });
        assert!(!strategy.is_active());
        assert_eq!(
            events.try_recv().unwrap(),
            StrategyEvent::Pause {
                strategy: StrategyId(9)
            }
        );
        assert!(events.try_recv().is_err());
        assert_eq!(strategy.ticks_until_window(), DONATE_CYCLE_TICKS - 120);
    }

    #[test]
    fn test_drop_before_first_job_is_not_reported() {
        let (mut strategy, transport, events) = setup(1);
        strategy.schedule_window_in(1);
        strategy.connect();
        strategy.tick(0);
        let client = transport.last_client().unwrap();
        strategy.handle_client_event(ClientEvent::LoginSuccess { client, ip: None });

        strategy.handle_client_event(ClientEvent::Close { client, failures: 1 });
        assert!(events.try_recv().is_err());
    }
}

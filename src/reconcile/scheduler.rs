// Reconciliation Scheduler - keeps each feed's price fresh on the ledger
//
// Two drivers share the state repository:
// - Heartbeat: every poll period, request a fresh observation for every job
// - Deviation/round: every query period, read price and round from the
//   ledger and request an observation when a new round opens or the price
//   moves past the threshold
//
// Requests are allocated (id bumped, persisted) before they are sent.

use std::sync::Arc;

use chrono::{DateTime, Timelike, Utc};
use futures::future::join_all;
use rust_decimal::Decimal;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Duration, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::error::AppResult;
use crate::execution::{DispatchTicket, Dispatcher, RequestReason};
use crate::oracle::FeedObserver;
use crate::state::{Job, PreviousResult, RoundSnapshot, StateRepository};

/// Scheduler timing and trigger configuration
#[derive(Debug, Clone)]
pub struct ScheduleConfig {
    /// Heartbeat period
    pub heartbeat_interval: Duration,
    /// Deviation/round period; also the staleness bound for outstanding requests
    pub query_interval: Duration,
    /// Percent
    pub deviation_threshold: Decimal,
    /// Start the heartbeat on the next wall-clock minute
    pub align_to_minute: bool,
}

/// What the deviation driver saw for one feed
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub price: Decimal,
    pub round: RoundSnapshot,
}

/// `|observed - cached| / cached * 100`, zero when either side is unknown
pub fn deviation_pct(cached: Decimal, observed: Decimal) -> Decimal {
    if cached <= Decimal::ZERO || observed <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    ((observed - cached) / cached).abs() * Decimal::ONE_HUNDRED
}

/// A new request may go out if the last one was ingested, or if it has been
/// outstanding for longer than one query interval.
fn request_allowed(job: &Job, prev: &PreviousResult, now: DateTime<Utc>, query_interval: Duration) -> bool {
    if job.request_id == prev.last_request_id {
        return true;
    }
    match job.seconds_since_last_request(now) {
        Some(elapsed) => elapsed > query_interval.as_secs() as i64,
        None => true,
    }
}

/// Fold one observation into a job's state and decide whether to request a
/// new observation. Returns the allocated request when one is due.
pub fn reconcile_job(
    job: &mut Job,
    prev: &mut PreviousResult,
    observation: &Observation,
    config: &ScheduleConfig,
    now: DateTime<Utc>,
) -> Option<DispatchTicket> {
    let deviation = deviation_pct(prev.result, observation.price);
    if observation.price > Decimal::ZERO {
        prev.result = observation.price;
    }
    prev.round = Some(observation.round.clone());

    let round = &observation.round;
    let decision = if round.round_id > job.last_reported_round {
        if round.submission_made {
            info!("Round {} on {} already carries our submission", round.round_id, job.name);
            job.advance_round(round.round_id);
            None
        } else {
            info!("🆕 Found new round {} on {}", round.round_id, job.name);
            Some(RequestReason::NewRound)
        }
    } else if deviation > config.deviation_threshold {
        info!("📊 {} moved {}% (now {})", job.name, deviation.round_dp(4), observation.price);
        Some(RequestReason::Deviation)
    } else {
        None
    };
    let Some(reason) = decision else {
        return None;
    };

    if !request_allowed(job, prev, now, config.query_interval) {
        info!(
            "Still waiting for request {} on {} (last ingested {})",
            job.request_id, job.name, prev.last_request_id
        );
        return None;
    }

    let request_id = job.next_request(now);
    Some(DispatchTicket {
        job_name: job.name.clone(),
        external_job_id: job.external_job_id.clone(),
        request_id,
        reason,
    })
}

/// Time until the next wall-clock minute starts
pub fn delay_until_next_minute(now: DateTime<Utc>) -> Duration {
    let millis_into_minute = now.second() as u64 * 1000 + (now.nanosecond() / 1_000_000).min(999) as u64;
    Duration::from_millis(60_000 - millis_into_minute)
}

pub struct ReconciliationScheduler {
    config: ScheduleConfig,
    state: Arc<StateRepository>,
    observer: Arc<FeedObserver>,
    dispatcher: Arc<Dispatcher>,
}

impl ReconciliationScheduler {
    pub fn new(
        config: ScheduleConfig,
        state: Arc<StateRepository>,
        observer: Arc<FeedObserver>,
        dispatcher: Arc<Dispatcher>,
    ) -> Self {
        Self {
            config,
            state,
            observer,
            dispatcher,
        }
    }

    /// Start both drivers. They stop when `shutdown` fires.
    pub fn start(self: &Arc<Self>, shutdown: &broadcast::Sender<()>) -> Vec<JoinHandle<()>> {
        let heartbeat = {
            let scheduler = self.clone();
            let rx = shutdown.subscribe();
            tokio::spawn(async move { scheduler.run_heartbeat(rx).await })
        };
        let deviation = {
            let scheduler = self.clone();
            let rx = shutdown.subscribe();
            tokio::spawn(async move { scheduler.run_deviation(rx).await })
        };
        vec![heartbeat, deviation]
    }

    async fn run_heartbeat(&self, mut shutdown: broadcast::Receiver<()>) {
        let period = self.config.heartbeat_interval;

        if self.config.align_to_minute {
            let delay = delay_until_next_minute(Utc::now());
            info!("⏰ Heartbeat starts in {}s", delay.as_secs());
            tokio::select! {
                _ = shutdown.recv() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!("✓ Heartbeat driver running every {}s", period.as_secs());

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("Heartbeat driver stopped");
                    return;
                }
                _ = ticker.tick() => {
                    match self.heartbeat_cycle().await {
                        Ok(tickets) => debug!("Heartbeat requested {} observations", tickets.len()),
                        Err(e) => error!("❌ Heartbeat cycle failed: {}", e),
                    }
                }
            }
        }
    }

    async fn run_deviation(&self, mut shutdown: broadcast::Receiver<()>) {
        let period = self.config.query_interval;
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!("✓ Deviation driver running every {}s", period.as_secs());

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("Deviation driver stopped");
                    return;
                }
                _ = ticker.tick() => {
                    // ledger reads can be abandoned; state writes are atomic
                    tokio::select! {
                        _ = shutdown.recv() => {
                            info!("Deviation driver stopped mid-cycle");
                            return;
                        }
                        outcome = self.deviation_cycle() => match outcome {
                            Ok(tickets) => debug!("Deviation check requested {} observations", tickets.len()),
                            Err(e) => error!("❌ Deviation cycle failed: {}", e),
                        }
                    }
                }
            }
        }
    }

    /// Request an observation for every job
    pub async fn heartbeat_cycle(&self) -> AppResult<Vec<DispatchTicket>> {
        let now = Utc::now();
        let tickets = self
            .state
            .update(|snap| {
                snap.jobs
                    .iter_mut()
                    .map(|job| {
                        let request_id = job.next_request(now);
                        DispatchTicket {
                            job_name: job.name.clone(),
                            external_job_id: job.external_job_id.clone(),
                            request_id,
                            reason: RequestReason::Heartbeat,
                        }
                    })
                    .collect::<Vec<_>>()
            })
            .await?;

        if !tickets.is_empty() {
            info!("💓 Heartbeat for {} jobs", tickets.len());
        }
        self.dispatch_all(&tickets);
        Ok(tickets)
    }

    /// Observe every job and request observations where a round opened or
    /// the price moved
    pub async fn deviation_cycle(&self) -> AppResult<Vec<DispatchTicket>> {
        let names: Vec<String> = self
            .state
            .snapshot()
            .await?
            .jobs
            .into_iter()
            .map(|job| job.name)
            .collect();
        if names.is_empty() {
            return Ok(Vec::new());
        }

        let observations = join_all(names.iter().map(|name| self.observe(name))).await;

        let now = Utc::now();
        let config = &self.config;
        let tickets = self
            .state
            .update(|snap| {
                let mut tickets = Vec::new();
                for (name, observation) in names.iter().zip(observations) {
                    let observation = match observation {
                        Ok(observation) => observation,
                        Err(e) => {
                            warn!("Skipping {} this cycle: {}", name, e);
                            continue;
                        }
                    };
                    // removed while we were reading the ledger
                    let Some((job, prev)) = snap.entry_mut(name) else {
                        continue;
                    };
                    if let Some(ticket) = reconcile_job(job, prev, &observation, config, now) {
                        tickets.push(ticket);
                    }
                }
                tickets
            })
            .await?;

        self.dispatch_all(&tickets);
        Ok(tickets)
    }

    async fn observe(&self, feed: &str) -> AppResult<Observation> {
        let price = self.observer.observe_price(feed).await;
        let round = self.observer.observe_round(feed).await?;
        Ok(Observation { price, round })
    }

    fn dispatch_all(&self, tickets: &[DispatchTicket]) {
        for ticket in tickets {
            self.dispatcher.spawn(ticket.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    use super::*;
    use crate::execution::RetryPolicy;
    use crate::ledger::AnchorBook;
    use crate::oracle::ConflictChecker;
    use crate::state::MemoryStateStore;
    use crate::test_support::{offer_status, FakeLedger, RecordingRunner, ACCOUNT};

    fn config() -> ScheduleConfig {
        ScheduleConfig {
            heartbeat_interval: Duration::from_secs(60),
            query_interval: Duration::from_secs(6),
            deviation_threshold: dec!(1),
            align_to_minute: false,
        }
    }

    fn round(round_id: u64, submission_made: bool) -> RoundSnapshot {
        RoundSnapshot {
            round_id,
            started_by: "agoric1other".into(),
            submission_made,
        }
    }

    fn entry() -> (Job, PreviousResult) {
        let mut job = Job::new("ATOM-USD", "job-1");
        job.last_reported_round = 4;
        let mut prev = PreviousResult::new("job-1");
        prev.result = dec!(10);
        (job, prev)
    }

    #[test]
    fn test_deviation_pct_guards_zero() {
        assert_eq!(deviation_pct(Decimal::ZERO, dec!(5)), Decimal::ZERO);
        assert_eq!(deviation_pct(dec!(5), Decimal::ZERO), Decimal::ZERO);
        assert_eq!(deviation_pct(dec!(100), dec!(102)), dec!(2));
        assert_eq!(deviation_pct(dec!(100), dec!(97)), dec!(3));
    }

    #[test]
    fn test_new_round_requests_observation() {
        let (mut job, mut prev) = entry();
        let obs = Observation { price: dec!(10), round: round(5, false) };

        let ticket = reconcile_job(&mut job, &mut prev, &obs, &config(), Utc::now()).unwrap();
        assert_eq!(ticket.reason, RequestReason::NewRound);
        assert_eq!(ticket.request_id, 1);
        assert_eq!(job.request_id, 1);
        assert_eq!(prev.round, Some(round(5, false)));
    }

    #[test]
    fn test_submitted_round_advances_watermark() {
        let (mut job, mut prev) = entry();
        let obs = Observation { price: dec!(20), round: round(5, true) };

        assert!(reconcile_job(&mut job, &mut prev, &obs, &config(), Utc::now()).is_none());
        assert_eq!(job.last_reported_round, 5);
        assert_eq!(job.request_id, 0);
    }

    #[test]
    fn test_new_round_wins_over_deviation() {
        let (mut job, mut prev) = entry();
        let obs = Observation { price: dec!(20), round: round(5, false) };

        let ticket = reconcile_job(&mut job, &mut prev, &obs, &config(), Utc::now()).unwrap();
        assert_eq!(ticket.reason, RequestReason::NewRound);
        assert_eq!(prev.result, dec!(20));
    }

    #[test]
    fn test_deviation_past_threshold() {
        let (mut job, mut prev) = entry();
        let small = Observation { price: dec!(10.05), round: round(4, false) };
        assert!(reconcile_job(&mut job, &mut prev, &small, &config(), Utc::now()).is_none());

        let big = Observation { price: dec!(10.5), round: round(4, false) };
        let ticket = reconcile_job(&mut job, &mut prev, &big, &config(), Utc::now()).unwrap();
        assert_eq!(ticket.reason, RequestReason::Deviation);
    }

    #[test]
    fn test_zero_price_keeps_cache() {
        let (mut job, mut prev) = entry();
        let obs = Observation { price: Decimal::ZERO, round: round(4, false) };

        assert!(reconcile_job(&mut job, &mut prev, &obs, &config(), Utc::now()).is_none());
        assert_eq!(prev.result, dec!(10));
    }

    #[test]
    fn test_outstanding_request_suppresses_dispatch() {
        let (mut job, mut prev) = entry();
        let sent = Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap();
        job.request_id = 3;
        job.last_request_sent = Some(sent);
        prev.last_request_id = 2;
        let obs = Observation { price: dec!(10), round: round(5, false) };

        let soon = sent + chrono::Duration::seconds(3);
        assert!(reconcile_job(&mut job, &mut prev, &obs, &config(), soon).is_none());
        assert_eq!(job.request_id, 3);

        // ingestion overdue: escape hatch
        let late = sent + chrono::Duration::seconds(7);
        let ticket = reconcile_job(&mut job, &mut prev, &obs, &config(), late).unwrap();
        assert_eq!(ticket.request_id, 4);
    }

    #[test]
    fn test_delay_until_next_minute() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 45).unwrap();
        assert_eq!(delay_until_next_minute(now), Duration::from_secs(15));

        let on_boundary = Utc.with_ymd_and_hms(2024, 1, 1, 10, 1, 0).unwrap();
        assert_eq!(delay_until_next_minute(on_boundary), Duration::from_secs(60));
    }

    fn scheduler(ledger: &Arc<FakeLedger>, runner: Arc<RecordingRunner>) -> (Arc<ReconciliationScheduler>, Arc<StateRepository>) {
        let state = Arc::new(StateRepository::new(Arc::new(MemoryStateStore::new())));
        let checker = Arc::new(ConflictChecker::new(ledger.clone(), 10));
        let anchors = Arc::new(AnchorBook::fixed([("ATOM-USD", 11), ("OSMO-USD", 12)]));
        let observer = Arc::new(FeedObserver::new(ledger.clone(), checker, anchors, ACCOUNT));
        let dispatcher = Arc::new(Dispatcher::new(runner, RetryPolicy::immediate(1)));
        let scheduler = ReconciliationScheduler::new(config(), state.clone(), observer, dispatcher);
        (Arc::new(scheduler), state)
    }

    #[tokio::test]
    async fn test_heartbeat_allocates_for_every_job() {
        let ledger = FakeLedger::new();
        let (scheduler, state) = scheduler(&ledger, Arc::new(RecordingRunner::new()));
        state
            .update(|snap| {
                snap.register_job("ATOM-USD", "job-1");
                snap.register_job("OSMO-USD", "job-2");
            })
            .await
            .unwrap();

        let first = scheduler.heartbeat_cycle().await.unwrap();
        let second = scheduler.heartbeat_cycle().await.unwrap();
        assert_eq!(first.len(), 2);
        assert!(first.iter().all(|t| t.reason == RequestReason::Heartbeat && t.request_id == 1));
        assert!(second.iter().all(|t| t.request_id == 2));

        let snap = state.snapshot().await.unwrap();
        assert!(snap.jobs.iter().all(|j| j.request_id == 2));
    }

    #[tokio::test]
    async fn test_deviation_cycle_caches_and_requests() {
        let ledger = FakeLedger::new();
        ledger.set_price("ATOM-USD", 1_000_000, 9_870_000);
        ledger.set_round("ATOM-USD", 1, "agoric1other");
        // OSMO's round cannot be read and is skipped
        ledger.set_price("OSMO-USD", 1, 2);

        let (scheduler, state) = scheduler(&ledger, Arc::new(RecordingRunner::new()));
        state
            .update(|snap| {
                snap.register_job("ATOM-USD", "job-1");
                snap.register_job("OSMO-USD", "job-2");
            })
            .await
            .unwrap();

        let tickets = scheduler.deviation_cycle().await.unwrap();
        assert_eq!(tickets.len(), 1);
        assert_eq!(tickets[0].job_name, "ATOM-USD");
        assert_eq!(tickets[0].reason, RequestReason::NewRound);

        let snap = state.snapshot().await.unwrap();
        let atom = &snap.previous_results["ATOM-USD"];
        assert_eq!(atom.result, dec!(9.87));
        assert_eq!(atom.round.as_ref().map(|r| r.round_id), Some(1));
        assert_eq!(snap.previous_results["OSMO-USD"].result, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_deviation_cycle_reconciles_rounds_we_closed() {
        let ledger = FakeLedger::new();
        ledger.set_round("ATOM-USD", 3, "agoric1other");
        ledger.push_history(ACCOUNT, offer_status(11, 3, None));

        let (scheduler, state) = scheduler(&ledger, Arc::new(RecordingRunner::new()));
        state.update(|snap| snap.register_job("ATOM-USD", "job-1")).await.unwrap();

        assert!(scheduler.deviation_cycle().await.unwrap().is_empty());
        let snap = state.snapshot().await.unwrap();
        assert_eq!(snap.job("ATOM-USD").unwrap().last_reported_round, 3);
    }

    #[tokio::test]
    async fn test_drivers_stop_on_shutdown() {
        let ledger = FakeLedger::new();
        let (scheduler, _state) = scheduler(&ledger, Arc::new(RecordingRunner::new()));
        let (tx, _) = broadcast::channel(1);

        let handles = scheduler.start(&tx);
        tx.send(()).unwrap();
        for handle in handles {
            tokio::time::timeout(Duration::from_secs(1), handle)
                .await
                .expect("driver did not stop")
                .unwrap();
        }
    }
}

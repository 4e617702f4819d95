//! Scan orchestration: the background worker, its lifecycle and the search loop.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use log::{debug, info, trace, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::ScanConfig;
use crate::identity;
use crate::progress::{ProgressReport, ProgressTracker, TrialDescription};
use crate::scoreboard::Scoreboard;
use crate::serial::Transport;
use crate::space::{sample_ids, ParameterSpace};
use crate::types::{
    Candidate, DetectedLink, RegisterType, ScanOutcome, ScanState, SerialTuple,
};
use crate::verify::{CandidateVerifier, TIMEOUT_LADDER};
use crate::AutoDetectError;

/// Contiguous failed IDs after which the rest of a tuple's ID list is skipped.
pub const EARLY_TUPLE_FAILS: usize = 8;

const WORKER_NAME: &str = "rtu-autodetect-scan";

/// Shared stop flag, checked between tuples and between trials.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Asks whether some other owner already holds a serial port.
pub trait PortCheck: Send + Sync {
    fn is_port_in_use(&self, port: &str) -> bool;
}

impl<F> PortCheck for F
where
    F: Fn(&str) -> bool + Send + Sync,
{
    fn is_port_in_use(&self, port: &str) -> bool {
        self(port)
    }
}

/// Treats every port as free.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoPortCheck;

impl PortCheck for NoPortCheck {
    fn is_port_in_use(&self, _port: &str) -> bool {
        false
    }
}

/// Everything a scan reports, in the order it happens.
#[derive(Debug, Clone, PartialEq)]
pub enum ScanEvent {
    Progress(ProgressReport),
    Complete(ScanOutcome),
}

/// Receives progress and the final outcome from the scan worker.
///
/// Calls arrive on the worker thread. `on_complete` is called exactly once per
/// started scan, after the transport has been closed.
pub trait ScanSink: Send {
    fn on_progress(&mut self, report: &ProgressReport);
    fn on_complete(&mut self, outcome: ScanOutcome);
}

impl ScanSink for Sender<ScanEvent> {
    fn on_progress(&mut self, report: &ProgressReport) {
        // A dropped receiver only means nobody is listening any more.
        let _ = self.send(ScanEvent::Progress(report.clone()));
    }

    fn on_complete(&mut self, outcome: ScanOutcome) {
        let _ = self.send(ScanEvent::Complete(outcome));
    }
}

impl ScanSink for Vec<ScanEvent> {
    fn on_progress(&mut self, report: &ProgressReport) {
        self.push(ScanEvent::Progress(report.clone()));
    }

    fn on_complete(&mut self, outcome: ScanOutcome) {
        self.push(ScanEvent::Complete(outcome));
    }
}

/// Closes the wrapped transport when dropped, whatever the exit path.
struct CloseGuard<'a, T: Transport + ?Sized>(&'a mut T);

impl<T: Transport + ?Sized> Deref for CloseGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        self.0
    }
}

impl<T: Transport + ?Sized> DerefMut for CloseGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.0
    }
}

impl<T: Transport + ?Sized> Drop for CloseGuard<'_, T> {
    fn drop(&mut self) {
        self.0.close();
    }
}

/// A validated scan: the ordered search space and the ID list tried per tuple.
#[derive(Debug, Clone)]
pub struct ScanPlan {
    pub port: String,
    pub space: ParameterSpace,
    /// IDs tried on every tuple; the sample in quick-sample mode.
    pub trial_ids: Vec<u8>,
    pub quick_sample: bool,
    pub register_type: RegisterType,
    pub register_start: u16,
    pub register_end: u16,
}

impl ScanPlan {
    pub fn new(config: &ScanConfig) -> Result<Self, AutoDetectError> {
        config.validate()?;
        let space = config.parameter_space()?;
        let trial_ids = if config.quick_sample {
            sample_ids(&space.device_ids, config.sample_size)
        } else {
            space.device_ids.clone()
        };
        Ok(Self {
            port: config.port_name().to_string(),
            space,
            trial_ids,
            quick_sample: config.quick_sample,
            register_type: config.register_type,
            register_start: config.register_start,
            register_end: config.register_end,
        })
    }

    /// Nominal trial count: tuples times `trial_ids`. Promotion sweeps and
    /// early aborts are not accounted for.
    pub fn total_trials(&self) -> u64 {
        (self.space.tuple_count() * self.trial_ids.len()) as u64
    }

    /// Run the whole search on the calling thread and report through `sink`.
    pub fn execute<T: Transport + ?Sized>(
        &self,
        transport: &mut T,
        clock: &dyn Clock,
        cancel: &CancellationToken,
        sink: &mut dyn ScanSink,
    ) -> ScanOutcome {
        info!(
            "Scanning {}: {} tuples, {} ids per tuple, {} trials planned",
            self.port,
            self.space.tuple_count(),
            self.trial_ids.len(),
            self.total_trials()
        );
        let started = clock.now();

        let result = {
            let mut search = Search {
                plan: self,
                link: CloseGuard(transport),
                verifier: CandidateVerifier::new(clock),
                clock,
                cancel,
                sink: &mut *sink,
                progress: ProgressTracker::new(self.total_trials(), started),
                board: Scoreboard::new(),
            };
            search.run().map(|()| search.board.into_best())
        };

        let outcome = match result {
            Err(Cancelled) => {
                info!("Scan of {} cancelled", self.port);
                ScanOutcome::Cancelled
            }
            Ok(None) => {
                info!("No device found on {}", self.port);
                ScanOutcome::NotFound
            }
            Ok(Some(best)) => {
                let link = self.detected_link(&best, clock.now().saturating_sub(started));
                info!("Found {link}");
                ScanOutcome::Found(link)
            }
        };
        sink.on_complete(outcome.clone());
        outcome
    }

    fn detected_link(&self, best: &Candidate, elapsed: std::time::Duration) -> DetectedLink {
        DetectedLink {
            port: self.port.clone(),
            device_id: best.device_id,
            baud_rate: best.tuple.baud_rate,
            parity: best.tuple.parity,
            data_bits: best.tuple.data_bits,
            stop_bits: best.tuple.stop_bits,
            register_type: self.register_type,
            stability_score: best.final_score,
            elapsed,
        }
    }
}

struct Cancelled;

struct Search<'a, T: Transport + ?Sized> {
    plan: &'a ScanPlan,
    link: CloseGuard<'a, T>,
    verifier: CandidateVerifier<'a>,
    clock: &'a dyn Clock,
    cancel: &'a CancellationToken,
    sink: &'a mut dyn ScanSink,
    progress: ProgressTracker,
    board: Scoreboard,
}

impl<T: Transport + ?Sized> Search<'_, T> {
    fn check_cancel(&self) -> Result<(), Cancelled> {
        if self.cancel.is_cancelled() {
            Err(Cancelled)
        } else {
            Ok(())
        }
    }

    fn run(&mut self) -> Result<(), Cancelled> {
        let plan = self.plan;
        let mut last_tuple: Option<SerialTuple> = None;

        for tuple in plan.space.tuples() {
            self.check_cancel()?;

            if last_tuple != Some(tuple) {
                if let Err(e) = self.link.open(&plan.port, &tuple, TIMEOUT_LADDER[0]) {
                    debug!("Skipping {tuple}: {e}");
                    last_tuple = None;
                    continue;
                }
                last_tuple = Some(tuple);
            }

            let hit = self.sweep(tuple, &plan.trial_ids, true)?;
            if plan.quick_sample && hit {
                debug!(
                    "{tuple}: sample hit, sweeping all {} ids",
                    plan.space.device_ids.len()
                );
                self.sweep(tuple, &plan.space.device_ids, false)?;
            }
        }
        Ok(())
    }

    /// Try `ids` on the open tuple. Returns whether any of them passed.
    fn sweep(&mut self, tuple: SerialTuple, ids: &[u8], early_abort: bool) -> Result<bool, Cancelled> {
        let abort_after = EARLY_TUPLE_FAILS.min(ids.len());
        let mut misses = 0;
        let mut hit = false;

        for &device_id in ids {
            self.check_cancel()?;
            if self.trial(tuple, device_id) {
                hit = true;
                misses = 0;
            } else {
                misses += 1;
                if early_abort && misses >= abort_after {
                    debug!("{tuple}: giving up after {misses} silent ids");
                    break;
                }
            }
        }
        Ok(hit)
    }

    fn trial(&mut self, tuple: SerialTuple, device_id: u8) -> bool {
        let plan = self.plan;
        if let Some(report) = self
            .progress
            .record(self.clock.now(), TrialDescription { tuple, device_id })
        {
            self.sink.on_progress(&report);
        }

        let result = self.verifier.verify(
            &mut *self.link,
            tuple,
            device_id,
            plan.register_type,
            plan.register_start,
            plan.register_end,
        );
        trace!(
            "{tuple} id={device_id}: {}",
            if result.passed { "pass" } else { "fail" }
        );

        if result.passed {
            let bonus = identity::identity_bonus(&mut *self.link, device_id);
            let candidate = Candidate {
                tuple,
                device_id,
                register_block_start: plan.register_start,
                register_block_end: plan.register_end,
                final_score: result.raw_score + bonus,
            };
            if self.board.offer(candidate) {
                debug!(
                    "New best: {tuple} id={device_id}, score {:.2}",
                    result.raw_score + bonus
                );
            }
        }
        result.passed
    }
}

/// Run a complete scan on the calling thread.
///
/// Blocks until the scan ends; `sink` still receives every event. No port-in-use
/// check is made.
pub fn run_scan<T: Transport + ?Sized>(
    config: &ScanConfig,
    transport: &mut T,
    clock: &dyn Clock,
    cancel: &CancellationToken,
    sink: &mut dyn ScanSink,
) -> Result<ScanOutcome, AutoDetectError> {
    let plan = ScanPlan::new(config)?;
    Ok(plan.execute(transport, clock, cancel, sink))
}

/// Re-check one known tuple and device id.
///
/// Opens the transport with `tuple`, verifies `device_id` against the
/// configured register range, adds the identity bonus and closes again.
/// `None` when the port cannot be opened or the device does not pass.
pub fn score_tuple<T: Transport + ?Sized>(
    config: &ScanConfig,
    transport: &mut T,
    clock: &dyn Clock,
    tuple: SerialTuple,
    device_id: u8,
) -> Option<Candidate> {
    let mut link = CloseGuard(transport);
    if let Err(e) = link.open(config.port_name(), &tuple, TIMEOUT_LADDER[0]) {
        debug!("Cannot open {} at {tuple}: {e}", config.port_name());
        return None;
    }
    let result = CandidateVerifier::new(clock).verify(
        &mut *link,
        tuple,
        device_id,
        config.register_type,
        config.register_start,
        config.register_end,
    );
    if !result.passed {
        return None;
    }
    let bonus = identity::identity_bonus(&mut *link, device_id);
    Some(Candidate {
        tuple,
        device_id,
        register_block_start: config.register_start,
        register_block_end: config.register_end,
        final_score: result.raw_score + bonus,
    })
}

fn lock(state: &Mutex<ScanState>) -> MutexGuard<'_, ScanState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Moves the controller to its terminal state before forwarding the outcome.
struct StateSink<S> {
    inner: S,
    state: Arc<Mutex<ScanState>>,
}

impl<S: ScanSink> ScanSink for StateSink<S> {
    fn on_progress(&mut self, report: &ProgressReport) {
        self.inner.on_progress(report);
    }

    fn on_complete(&mut self, outcome: ScanOutcome) {
        *lock(&self.state) = match outcome {
            ScanOutcome::Found(_) => ScanState::Completed,
            ScanOutcome::NotFound => ScanState::Failed,
            ScanOutcome::Cancelled => ScanState::Cancelled,
        };
        self.inner.on_complete(outcome);
    }
}

/// Owns one scan from `start` to its terminal state.
///
/// ```no_run
/// use rtu_autodetect::{ScanConfig, ScanController, ScanEvent, SerialTransport};
///
/// let (tx, rx) = std::sync::mpsc::channel::<ScanEvent>();
/// let mut scan = ScanController::new(ScanConfig::new("COM3"))
///     .with_port_check(|port: &str| port == "COM1");
/// scan.start(SerialTransport::new(), tx)?;
/// scan.stop();
/// scan.join()?;
/// # Ok::<(), rtu_autodetect::AutoDetectError>(())
/// ```
pub struct ScanController {
    config: ScanConfig,
    port_check: Box<dyn PortCheck>,
    clock: Arc<dyn Clock>,
    cancel: CancellationToken,
    state: Arc<Mutex<ScanState>>,
    worker: Option<JoinHandle<()>>,
}

impl ScanController {
    pub fn new(config: ScanConfig) -> Self {
        Self {
            config,
            port_check: Box::new(NoPortCheck),
            clock: Arc::new(SystemClock::new()),
            cancel: CancellationToken::new(),
            state: Arc::new(Mutex::new(ScanState::Idle)),
            worker: None,
        }
    }

    pub fn with_port_check(mut self, check: impl PortCheck + 'static) -> Self {
        self.port_check = Box::new(check);
        self
    }

    /// Time source for round-trip measurement and progress throttling.
    pub fn with_clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn config(&self) -> &ScanConfig {
        &self.config
    }

    pub fn state(&self) -> ScanState {
        *lock(&self.state)
    }

    /// The token `stop` sets. Usable before `start`.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Validate, claim the port and launch the worker. Returns immediately.
    ///
    /// Only an `Idle` controller can start. A port reported in use moves the
    /// controller to `Failed`.
    pub fn start<T, S>(&mut self, transport: T, sink: S) -> Result<(), AutoDetectError>
    where
        T: Transport + 'static,
        S: ScanSink + 'static,
    {
        let current = self.state();
        if current != ScanState::Idle {
            return Err(AutoDetectError::InvalidInput(format!(
                "Scan cannot start from state {current:?}"
            )));
        }

        let plan = ScanPlan::new(&self.config)?;
        if self.port_check.is_port_in_use(&plan.port) {
            warn!("Port {} is in use; scan not started", plan.port);
            *lock(&self.state) = ScanState::Failed;
            return Err(AutoDetectError::PortUnavailable(plan.port));
        }

        *lock(&self.state) = ScanState::Running;
        let clock = Arc::clone(&self.clock);
        let cancel = self.cancel.clone();
        let mut sink = StateSink {
            inner: sink,
            state: Arc::clone(&self.state),
        };
        let mut transport = transport;

        let spawned = thread::Builder::new()
            .name(WORKER_NAME.into())
            .spawn(move || {
                plan.execute(&mut transport, clock.as_ref(), &cancel, &mut sink);
            });
        match spawned {
            Ok(handle) => {
                self.worker = Some(handle);
                Ok(())
            }
            Err(e) => {
                *lock(&self.state) = ScanState::Failed;
                Err(AutoDetectError::Worker(format!("Failed to spawn scan worker: {e}")))
            }
        }
    }

    /// Request cancellation. Safe to call repeatedly; does nothing unless running.
    pub fn stop(&self) {
        if self.state() == ScanState::Running {
            debug!("Stop requested");
            self.cancel.cancel();
        }
    }

    pub fn is_running(&self) -> bool {
        self.state() == ScanState::Running
    }

    /// Block until the worker has exited. Returns at once if none was started.
    pub fn join(&mut self) -> Result<(), AutoDetectError> {
        let Some(handle) = self.worker.take() else {
            return Ok(());
        };
        if handle.join().is_err() {
            let mut state = lock(&self.state);
            if *state == ScanState::Running {
                *state = ScanState::Failed;
            }
            return Err(AutoDetectError::Worker("Scan worker panicked".into()));
        }
        Ok(())
    }
}

impl Drop for ScanController {
    fn drop(&mut self) {
        // Detached worker winds down at its next trial boundary.
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::mock::{MockDevice, MockTransport};
    use crate::types::{Parity, StopBits};

    fn tuple(parity: Parity) -> SerialTuple {
        SerialTuple {
            baud_rate: 9600,
            parity,
            data_bits: 8,
            stop_bits: StopBits::One,
        }
    }

    fn config(ids: u8) -> ScanConfig {
        let mut c = ScanConfig::new("sim");
        c.baud_rates = vec![9600];
        c.parities = vec![Parity::None, Parity::Even];
        c.stop_bits = vec![StopBits::One];
        c.id_end = ids;
        c
    }

    #[test]
    fn token_shared_between_clones() {
        let a = CancellationToken::new();
        let b = a.clone();
        assert!(!b.is_cancelled());
        a.cancel();
        assert!(b.is_cancelled());
    }

    #[test]
    fn closure_port_check() {
        let check = |p: &str| p.eq_ignore_ascii_case("com3");
        assert!(check.is_port_in_use("COM3"));
        assert!(!check.is_port_in_use("COM4"));
        assert!(!NoPortCheck.is_port_in_use("COM3"));
    }

    #[test]
    fn plan_totals() {
        let plan = ScanPlan::new(&config(10)).unwrap();
        assert_eq!(plan.trial_ids, vec![1, 5, 10]);
        assert_eq!(plan.total_trials(), 6);
        // even parity is tried first
        assert_eq!(plan.space.parities, vec![Parity::Even, Parity::None]);

        let mut c = config(10);
        c.quick_sample = false;
        assert_eq!(ScanPlan::new(&c).unwrap().total_trials(), 20);
    }

    #[test]
    fn guard_closes_on_early_return() {
        let clock = ManualClock::new();
        let mut t = MockTransport::new(clock.clone());
        let handle = t.handle();
        let found = score_tuple(&config(3), &mut t, &clock, tuple(Parity::None), 1);
        assert!(found.is_none());
        assert_eq!(handle.opens(), 1);
        assert!(!handle.is_open());
    }

    #[test]
    fn vec_sink_collects_in_order() {
        let clock = ManualClock::new();
        let mut t = MockTransport::new(clock.clone())
            .with_device(MockDevice::new(tuple(Parity::None), 2));
        let mut events = Vec::new();
        let outcome =
            run_scan(&config(3), &mut t, &clock, &CancellationToken::new(), &mut events).unwrap();
        assert!(matches!(outcome, ScanOutcome::Found(ref l) if l.device_id == 2));
        assert_eq!(events.last(), Some(&ScanEvent::Complete(outcome)));
        let completes = events
            .iter()
            .filter(|e| matches!(e, ScanEvent::Complete(_)))
            .count();
        assert_eq!(completes, 1);
    }
}

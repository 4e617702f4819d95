//! Throttled progress and ETA reporting.

use std::fmt;
use std::time::Duration;

use crate::types::SerialTuple;

/// Minimum spacing between two progress reports.
pub const PROGRESS_INTERVAL: Duration = Duration::from_millis(100);

/// The trial currently under test.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrialDescription {
    pub tuple: SerialTuple,
    pub device_id: u8,
}

impl fmt::Display for TrialDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ID={}, {} {} {}/{}",
            self.device_id,
            self.tuple.baud_rate,
            self.tuple.parity,
            self.tuple.data_bits,
            self.tuple.stop_bits
        )
    }
}

/// One progress update.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressReport {
    pub percent: f64,
    pub done_trials: u64,
    pub total_trials: u64,
    pub current: TrialDescription,
    pub elapsed: Duration,
    pub eta: Duration,
}

/// Counts trials and decides when a report is due.
///
/// `total_trials` is fixed up front; promotion sweeps and early aborts are not
/// reflected, so `percent` can pass 100 or stop short of it.
#[derive(Debug)]
pub struct ProgressTracker {
    total_trials: u64,
    done_trials: u64,
    started: Duration,
    last_report: Option<Duration>,
}

impl ProgressTracker {
    pub fn new(total_trials: u64, started: Duration) -> Self {
        Self {
            total_trials,
            done_trials: 0,
            started,
            last_report: None,
        }
    }

    pub fn total_trials(&self) -> u64 {
        self.total_trials
    }

    pub fn done_trials(&self) -> u64 {
        self.done_trials
    }

    pub fn elapsed(&self, now: Duration) -> Duration {
        now.saturating_sub(self.started)
    }

    /// Count the trial about to run; returns a report unless throttled.
    pub fn record(&mut self, now: Duration, current: TrialDescription) -> Option<ProgressReport> {
        self.done_trials += 1;
        if let Some(last) = self.last_report {
            if now.saturating_sub(last) < PROGRESS_INTERVAL {
                return None;
            }
        }
        self.last_report = Some(now);

        let elapsed = self.elapsed(now);
        Some(ProgressReport {
            percent: self.done_trials as f64 / self.total_trials.max(1) as f64 * 100.0,
            done_trials: self.done_trials,
            total_trials: self.total_trials,
            current,
            elapsed,
            eta: eta(elapsed, self.done_trials, self.total_trials),
        })
    }
}

/// Linear extrapolation from the average trial time so far.
pub fn eta(elapsed: Duration, done: u64, total: u64) -> Duration {
    if done == 0 {
        return Duration::ZERO;
    }
    let remaining = total.saturating_sub(done);
    elapsed.mul_f64(remaining as f64 / done as f64)
}

/// `HH:MM:SS`, whole seconds.
pub fn format_hms(d: Duration) -> String {
    let secs = d.as_secs();
    format!("{:02}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Parity, StopBits};

    fn desc(id: u8) -> TrialDescription {
        TrialDescription {
            tuple: SerialTuple {
                baud_rate: 9600,
                parity: Parity::Even,
                data_bits: 8,
                stop_bits: StopBits::Two,
            },
            device_id: id,
        }
    }

    #[test]
    fn first_report_always_emitted() {
        let mut p = ProgressTracker::new(10, Duration::ZERO);
        let r = p.record(Duration::from_millis(5), desc(1)).unwrap();
        assert_eq!(r.done_trials, 1);
        assert_eq!(r.total_trials, 10);
        assert!((r.percent - 10.0).abs() < 1e-9);
    }

    #[test]
    fn reports_throttled_to_interval() {
        let mut p = ProgressTracker::new(100, Duration::ZERO);
        assert!(p.record(Duration::from_millis(0), desc(1)).is_some());
        assert!(p.record(Duration::from_millis(50), desc(2)).is_none());
        assert!(p.record(Duration::from_millis(99), desc(3)).is_none());
        let r = p.record(Duration::from_millis(100), desc(4)).unwrap();
        assert_eq!(r.done_trials, 4);
        assert_eq!(r.current.device_id, 4);
        assert!(p.record(Duration::from_millis(150), desc(5)).is_none());
        assert_eq!(p.done_trials(), 5);
    }

    #[test]
    fn eta_linear() {
        assert_eq!(eta(Duration::from_secs(10), 5, 20), Duration::from_secs(30));
        assert_eq!(eta(Duration::from_secs(10), 0, 20), Duration::ZERO);
        assert_eq!(eta(Duration::from_secs(10), 25, 20), Duration::ZERO);
    }

    #[test]
    fn percent_can_exceed_hundred() {
        let mut p = ProgressTracker::new(2, Duration::ZERO);
        p.record(Duration::ZERO, desc(1));
        p.record(Duration::from_millis(1), desc(2));
        let r = p.record(Duration::from_secs(1), desc(3)).unwrap();
        assert!(r.percent > 100.0);
        assert_eq!(r.eta, Duration::ZERO);
    }

    #[test]
    fn zero_total_does_not_divide_by_zero() {
        let mut p = ProgressTracker::new(0, Duration::ZERO);
        let r = p.record(Duration::ZERO, desc(1)).unwrap();
        assert!((r.percent - 100.0).abs() < 1e-9);
    }

    #[test]
    fn elapsed_from_start() {
        let mut p = ProgressTracker::new(4, Duration::from_secs(2));
        let r = p.record(Duration::from_secs(4), desc(1)).unwrap();
        assert_eq!(r.elapsed, Duration::from_secs(2));
        assert_eq!(r.eta, Duration::from_secs(6));
    }

    #[test]
    fn hms_format() {
        assert_eq!(format_hms(Duration::ZERO), "00:00:00");
        assert_eq!(format_hms(Duration::from_secs(3725)), "01:02:05");
        assert_eq!(format_hms(Duration::from_millis(59_999)), "00:00:59");
    }

    #[test]
    fn description_display() {
        assert_eq!(desc(7).to_string(), "ID=7, 9600 E 8/2");
    }
}

//! Vsync gating for the composition loop.
//!
//! Hardware vsync delivery costs power, so it stays enabled only while
//! frames are pending. While it runs, [`CadenceEstimator`] measures the
//! actual pulse period; when hardware vsync is unavailable or disabled,
//! the loop free-runs on the estimated cadence, falling back to the
//! configured period before any pulse has ever been observed.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use tracing::{debug, trace};

/// Number of pulse intervals averaged for the period estimate.
const CADENCE_WINDOW: usize = 8;

/// Estimates the display refresh period from observed vsync timestamps.
#[derive(Debug, Default)]
pub struct CadenceEstimator {
    samples: VecDeque<Instant>,
}

impl CadenceEstimator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a hardware pulse timestamp. Out-of-order samples are
    /// dropped.
    pub fn add_sample(&mut self, at: Instant) {
        if self.samples.back().is_some_and(|last| at <= *last) {
            return;
        }
        self.samples.push_back(at);
        while self.samples.len() > CADENCE_WINDOW + 1 {
            self.samples.pop_front();
        }
    }

    /// Mean interval over the window, once two samples exist.
    pub fn estimated_period(&self) -> Option<Duration> {
        let first = self.samples.front()?;
        let last = self.samples.back()?;
        let intervals = self.samples.len() - 1;
        if intervals == 0 {
            return None;
        }
        Some(last.duration_since(*first) / intervals as u32)
    }

    pub fn reset(&mut self) {
        self.samples.clear();
    }
}

/// Decides when the next composition pass may start.
#[derive(Debug)]
pub struct VsyncControl {
    /// Pulse period reported by the display hardware, if it has one.
    hardware_period: Option<Duration>,
    hardware_enabled: bool,
    /// Period from configuration, used until a better estimate exists.
    fallback_period: Duration,
    estimator: CadenceEstimator,
    next_deadline: Instant,
}

impl VsyncControl {
    pub fn new(fallback_period: Duration, hardware_period: Option<Duration>) -> Self {
        Self {
            hardware_period,
            hardware_enabled: false,
            fallback_period,
            estimator: CadenceEstimator::new(),
            next_deadline: Instant::now() + fallback_period,
        }
    }

    pub fn hardware_available(&self) -> bool {
        self.hardware_period.is_some()
    }

    pub fn hardware_enabled(&self) -> bool {
        self.hardware_enabled
    }

    /// Turns hardware pulse delivery on. No-op without hardware vsync.
    pub fn enable_hardware(&mut self) {
        if self.hardware_available() && !self.hardware_enabled {
            self.hardware_enabled = true;
            debug!("hardware vsync enabled");
        }
    }

    /// Turns hardware pulse delivery off to save power while idle.
    pub fn disable_hardware(&mut self) {
        if self.hardware_enabled {
            self.hardware_enabled = false;
            debug!("hardware vsync disabled");
        }
    }

    /// Feeds an observed hardware pulse and re-arms the deadline on it.
    pub fn on_hardware_pulse(&mut self, at: Instant) {
        self.estimator.add_sample(at);
        self.next_deadline = at + self.period();
        trace!(period = ?self.period(), "hardware pulse");
    }

    /// Discards the learned cadence, e.g. after a display mode switch.
    pub fn resync(&mut self) {
        self.estimator.reset();
        self.next_deadline = Instant::now() + self.period();
        debug!("vsync cadence resynced");
    }

    /// Current best guess at the pulse period: measured cadence first,
    /// then the hardware's nominal period, then configuration.
    pub fn period(&self) -> Duration {
        self.estimator
            .estimated_period()
            .or(self.hardware_period)
            .unwrap_or(self.fallback_period)
    }

    /// The next instant composition may run, advanced past `now` in whole
    /// periods so a slow frame does not cause a burst of catch-up ticks.
    pub fn next_deadline(&mut self, now: Instant) -> Instant {
        let period = self.period();
        while self.next_deadline <= now {
            self.next_deadline += period;
        }
        self.next_deadline
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PERIOD: Duration = Duration::from_millis(16);

    #[test]
    fn estimator_needs_two_samples() {
        let mut estimator = CadenceEstimator::new();
        let base = Instant::now();
        assert!(estimator.estimated_period().is_none());
        estimator.add_sample(base);
        assert!(estimator.estimated_period().is_none());
        estimator.add_sample(base + PERIOD);
        assert_eq!(estimator.estimated_period(), Some(PERIOD));
    }

    #[test]
    fn estimator_averages_over_the_window_and_ignores_stale_samples() {
        let mut estimator = CadenceEstimator::new();
        let base = Instant::now();
        for i in 0..20u32 {
            estimator.add_sample(base + PERIOD * i);
        }
        // A timestamp earlier than the newest sample is dropped.
        estimator.add_sample(base);
        assert_eq!(estimator.estimated_period(), Some(PERIOD));

        estimator.reset();
        assert!(estimator.estimated_period().is_none());
    }

    #[test]
    fn hardware_enable_is_gated_on_availability() {
        let mut without = VsyncControl::new(PERIOD, None);
        without.enable_hardware();
        assert!(!without.hardware_enabled());

        let mut with = VsyncControl::new(PERIOD, Some(PERIOD));
        with.enable_hardware();
        assert!(with.hardware_enabled());
        with.disable_hardware();
        assert!(!with.hardware_enabled());
    }

    #[test]
    fn period_prefers_measured_cadence() {
        let nominal = Duration::from_millis(16);
        let measured = Duration::from_millis(20);
        let mut control = VsyncControl::new(PERIOD, Some(nominal));
        assert_eq!(control.period(), nominal);

        let base = Instant::now();
        control.on_hardware_pulse(base);
        control.on_hardware_pulse(base + measured);
        assert_eq!(control.period(), measured);

        control.resync();
        assert_eq!(control.period(), nominal);
    }

    #[test]
    fn deadline_advances_past_now_in_whole_periods() {
        let mut control = VsyncControl::new(PERIOD, None);
        let now = Instant::now();
        let first = control.next_deadline(now);
        assert!(first > now);
        // A stall of several periods yields one upcoming deadline, not a
        // backlog.
        let late = first + PERIOD * 5 + Duration::from_millis(1);
        let next = control.next_deadline(late);
        assert!(next > late);
        assert!(next <= late + PERIOD);
    }
}

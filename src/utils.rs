//! Request metrics, device call timing and the test logger

use std::fmt;
use std::time::{Duration, Instant};

use log::{debug, warn};

/// Device calls slower than this are logged as warnings
const SLOW_DEVICE_CALL: Duration = Duration::from_secs(1);

/// Latency and outcome of the requests answered by the gateway
#[derive(Debug, Clone, Default)]
pub struct RequestMetrics {
    pub answered: u64,
    pub exceptions: u64,
    pub busy_time: Duration,
    pub fastest: Option<Duration>,
    pub slowest: Option<Duration>,
}

impl RequestMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Account a request answered with a normal response
    pub fn record_success(&mut self, elapsed: Duration) {
        self.answered += 1;
        self.account(elapsed);
    }

    /// Account a request answered with an exception response
    pub fn record_failure(&mut self, elapsed: Duration) {
        self.exceptions += 1;
        self.account(elapsed);
    }

    fn account(&mut self, elapsed: Duration) {
        self.busy_time += elapsed;
        self.fastest = Some(self.fastest.map_or(elapsed, |d| d.min(elapsed)));
        self.slowest = Some(self.slowest.map_or(elapsed, |d| d.max(elapsed)));
    }

    pub fn requests(&self) -> u64 {
        self.answered + self.exceptions
    }

    pub fn average(&self) -> Duration {
        match self.requests() {
            0 => Duration::ZERO,
            n => self.busy_time / n as u32,
        }
    }

    /// Share of requests answered without exception, in percent
    pub fn success_rate(&self) -> f64 {
        match self.requests() {
            0 => 0.0,
            n => self.answered as f64 * 100.0 / n as f64,
        }
    }
}

fn millis(duration: Option<Duration>) -> String {
    duration.map_or_else(|| "-".to_string(), |d| format!("{:.1}ms", d.as_secs_f64() * 1000.0))
}

impl fmt::Display for RequestMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} requests, {} exceptions ({:.1}% ok), latency avg {} min {} max {}",
            self.requests(),
            self.exceptions,
            self.success_rate(),
            millis(Some(self.average())),
            millis(self.fastest),
            millis(self.slowest),
        )
    }
}

/// Times one call on the RF device
pub struct DeviceCallTimer {
    action: String,
    started: Instant,
}

impl DeviceCallTimer {
    pub fn start(action: &str) -> Self {
        debug!("Calling device: {}", action);
        Self { action: action.to_string(), started: Instant::now() }
    }

    /// Log the elapsed time and return it
    pub fn finish(self) -> Duration {
        let elapsed = self.started.elapsed();
        if elapsed > SLOW_DEVICE_CALL {
            warn!("Device call '{}' took {}", self.action, millis(Some(elapsed)));
        } else {
            debug!("Device call '{}' took {}", self.action, millis(Some(elapsed)));
        }
        elapsed
    }
}

/// Logging utilities
pub mod logging {
    /// Route `log` output through the test harness
    pub fn init_test_logger() {
        let _ = env_logger::builder()
            .filter_level(log::LevelFilter::Debug)
            .is_test(true)
            .try_init();
    }
}

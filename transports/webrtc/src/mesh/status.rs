//! Aggregate call status

use parking_lot::Mutex;
use std::fmt;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::info;

/// Message published when a broken connection cannot be repaired
pub const CONNECTION_PROBLEM: &str = "connection problem";

/// Status of the call as a whole
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallStatus {
    /// Nothing negotiated yet
    Idle,
    /// At least one exchange in progress, nobody connected
    Connecting,
    /// At least one peer connected
    Connected,
    /// Call left
    Disconnected,
    /// Repair could not be attempted
    Error(String),
}

impl fmt::Display for CallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallStatus::Idle => f.write_str("idle"),
            CallStatus::Connecting => f.write_str("connecting"),
            CallStatus::Connected => f.write_str("connected"),
            CallStatus::Disconnected => f.write_str("disconnected"),
            CallStatus::Error(message) => write!(f, "error: {}", message),
        }
    }
}

#[derive(Default)]
struct Stopwatch {
    since: Option<Instant>,
    accumulated: Duration,
}

impl Stopwatch {
    fn start(&mut self) {
        self.since.get_or_insert_with(Instant::now);
    }

    fn stop(&mut self) {
        if let Some(since) = self.since.take() {
            self.accumulated += since.elapsed();
        }
    }

    fn elapsed(&self) -> Duration {
        self.accumulated + self.since.map_or(Duration::ZERO, |s| s.elapsed())
    }
}

/// Publishes [`CallStatus`] and measures connected time
pub struct StatusTracker {
    tx: watch::Sender<CallStatus>,
    stopwatch: Mutex<Stopwatch>,
}

impl Default for StatusTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusTracker {
    /// Tracker starting in [`CallStatus::Idle`]
    pub fn new() -> Self {
        let (tx, _) = watch::channel(CallStatus::Idle);
        Self {
            tx,
            stopwatch: Mutex::new(Stopwatch::default()),
        }
    }

    /// Receiver observing every status change
    pub fn subscribe(&self) -> watch::Receiver<CallStatus> {
        self.tx.subscribe()
    }

    /// Current status
    pub fn current(&self) -> CallStatus {
        self.tx.borrow().clone()
    }

    /// An offer or answer was sent
    pub fn negotiating(&self) {
        self.tx.send_if_modified(|status| {
            if *status == CallStatus::Idle {
                *status = CallStatus::Connecting;
                true
            } else {
                false
            }
        });
    }

    /// The number of connected peers changed
    pub fn connected_peers(&self, count: usize) {
        {
            let mut stopwatch = self.stopwatch.lock();
            if *self.tx.borrow() == CallStatus::Disconnected {
                return;
            }
            if count > 0 {
                stopwatch.start();
            } else {
                stopwatch.stop();
            }
        }

        self.tx.send_if_modified(|status| {
            let next = match (&*status, count) {
                (CallStatus::Disconnected, _) => return false,
                (_, n) if n > 0 => CallStatus::Connected,
                (CallStatus::Connected, _) => CallStatus::Connecting,
                _ => return false,
            };
            if *status == next {
                return false;
            }
            info!("Call status {} -> {}", status, next);
            *status = next;
            true
        });
    }

    /// Repair failed before it could start
    pub fn error(&self, message: &str) {
        self.tx.send_if_modified(|status| {
            if *status == CallStatus::Disconnected {
                return false;
            }
            *status = CallStatus::Error(message.to_string());
            true
        });
    }

    /// The call was left
    pub fn left(&self) {
        self.stopwatch.lock().stop();
        self.tx.send_replace(CallStatus::Disconnected);
    }

    /// Total time with at least one connected peer
    pub fn duration(&self) -> Duration {
        self.stopwatch.lock().elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_progression() {
        let tracker = StatusTracker::new();
        let rx = tracker.subscribe();
        assert_eq!(*rx.borrow(), CallStatus::Idle);

        tracker.negotiating();
        assert_eq!(tracker.current(), CallStatus::Connecting);

        tracker.connected_peers(1);
        assert_eq!(tracker.current(), CallStatus::Connected);
        tracker.negotiating();
        assert_eq!(tracker.current(), CallStatus::Connected);

        tracker.connected_peers(0);
        assert_eq!(tracker.current(), CallStatus::Connecting);

        tracker.left();
        tracker.connected_peers(2);
        assert_eq!(*rx.borrow(), CallStatus::Disconnected);
    }

    #[test]
    fn test_error_is_replaced_by_recovery() {
        let tracker = StatusTracker::new();
        tracker.error(CONNECTION_PROBLEM);
        assert_eq!(
            tracker.current(),
            CallStatus::Error("connection problem".to_string())
        );
        tracker.connected_peers(1);
        assert_eq!(tracker.current(), CallStatus::Connected);
    }

    #[test]
    fn test_duration_only_counts_connected_time() {
        let tracker = StatusTracker::new();
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(tracker.duration(), Duration::ZERO);

        tracker.connected_peers(1);
        std::thread::sleep(Duration::from_millis(5));
        tracker.connected_peers(0);
        let connected = tracker.duration();
        assert!(connected >= Duration::from_millis(5));

        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(tracker.duration(), connected);
    }
}

//! SAM keepalive timer
//!
//! Pings the router every `interval` and reports expiry when no keepalive
//! activity was seen for `timeout`. Any `PING` or `PONG` resets the window.

use std::pin::Pin;
use std::time::Duration;

use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior, Sleep};

/// What the owner of the control connection should do next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepaliveEvent {
    /// Send a `PING`
    Ping,

    /// Nothing heard within the timeout; sever the connection
    Expired,
}

pub struct KeepaliveTimer {
    interval: Interval,
    deadline: Pin<Box<Sleep>>,
    timeout: Duration,
}

impl KeepaliveTimer {
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        let now = Instant::now();
        let mut ticker = interval_at(now + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        Self {
            interval: ticker,
            deadline: Box::pin(tokio::time::sleep_until(now + timeout)),
            timeout,
        }
    }

    /// Wait for the next keepalive event. Cancel safe.
    pub async fn next(&mut self) -> KeepaliveEvent {
        tokio::select! {
            biased;
            _ = &mut self.deadline => KeepaliveEvent::Expired,
            _ = self.interval.tick() => KeepaliveEvent::Ping,
        }
    }

    /// Record keepalive activity, pushing the expiry out by a full timeout
    pub fn reset(&mut self) {
        self.deadline.as_mut().reset(Instant::now() + self.timeout);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_pings_then_expires() {
        let start = Instant::now();
        let mut timer = KeepaliveTimer::new(Duration::from_secs(60), Duration::from_secs(120));

        assert_eq!(timer.next().await, KeepaliveEvent::Ping);
        assert_eq!(start.elapsed(), Duration::from_secs(60));

        assert_eq!(timer.next().await, KeepaliveEvent::Expired);
        assert_eq!(start.elapsed(), Duration::from_secs(120));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_extends_deadline() {
        let start = Instant::now();
        let mut timer = KeepaliveTimer::new(Duration::from_secs(60), Duration::from_secs(120));

        assert_eq!(timer.next().await, KeepaliveEvent::Ping);
        timer.reset();

        assert_eq!(timer.next().await, KeepaliveEvent::Ping);
        assert_eq!(start.elapsed(), Duration::from_secs(120));

        assert_eq!(timer.next().await, KeepaliveEvent::Expired);
        assert_eq!(start.elapsed(), Duration::from_secs(180));
    }
}

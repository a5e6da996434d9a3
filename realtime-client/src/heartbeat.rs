//! Heartbeat monitor
//!
//! Produces a ping frame every period while a session is connected. The
//! monitor lives inside the session loop, so leaving the connected state
//! drops it and no further pings are produced. Replies are not inspected.

use std::time::Duration;

use realtime_core::ControlFrame;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};

/// Periodic keep-alive for one connected session
#[derive(Debug)]
pub struct Heartbeat {
    interval: Interval,
}

impl Heartbeat {
    /// Start the monitor; the first ping is due one full period from now
    pub fn start(period: Duration) -> Self {
        let mut interval = interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self { interval }
    }

    /// Wait for the next beat and return the ping to send
    pub async fn tick(&mut self) -> ControlFrame {
        self.interval.tick().await;
        ControlFrame::ping()
    }

    pub fn period(&self) -> Duration {
        self.interval.period()
    }
}

//! Periodic pulse source. Ticks are fanned out over a broadcast channel so
//! each consumer (expirer sweep, publish/subscribe retries) runs its own
//! fire-and-forget task per tick; overlap is allowed and handlers are
//! expected to be idempotent.

use std::time::Duration;

use tokio::sync::broadcast;

use crate::constants::HEARTBEAT_INTERVAL;

const CHANNEL_CAPACITY: usize = 16;

pub struct HeartBeat {
    interval: Duration,
    tx: broadcast::Sender<u64>,
}

impl Default for HeartBeat {
    fn default() -> Self {
        Self::new(Duration::from_secs(HEARTBEAT_INTERVAL))
    }
}

impl HeartBeat {
    pub fn new(interval: Duration) -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { interval, tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<u64> {
        self.tx.subscribe()
    }

    /// Starts the timer task. Fires unconditionally on its own cadence, no
    /// matter what in-flight work exists.
    pub fn start(&self) {
        let tx = self.tx.clone();
        let interval = self.interval;
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(interval);
            // The immediate first tick of tokio intervals is skipped.
            timer.tick().await;
            let mut count: u64 = 0;
            loop {
                timer.tick().await;
                count += 1;
                if tx.send(count).is_err() {
                    // No listeners yet; keep pulsing.
                }
            }
        });
    }

    /// Forces a pulse outside the timer cadence. Used by tests to drive
    /// sweeps deterministically.
    pub fn pulse(&self) {
        let _ = self.tx.send(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ticks_arrive_on_cadence() {
        let heartbeat = HeartBeat::new(Duration::from_millis(10));
        let mut rx = heartbeat.subscribe();
        heartbeat.start();

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(second, first + 1);
    }

    #[tokio::test]
    async fn pulse_reaches_all_subscribers() {
        let heartbeat = HeartBeat::new(Duration::from_secs(60));
        let mut a = heartbeat.subscribe();
        let mut b = heartbeat.subscribe();
        heartbeat.pulse();
        assert_eq!(a.recv().await.unwrap(), 0);
        assert_eq!(b.recv().await.unwrap(), 0);
    }
}

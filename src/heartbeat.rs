// Copyright 2020-2023 The NATS Authors
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
//! A periodic idle-heartbeat liveness detector.
//!
//! One [`HeartbeatMonitor`] is owned per subscription. [`HeartbeatMonitor::work`]
//! is called on every frame the subscription receives and must stay cheap,
//! since it's on the ingress hot path. The timer task runs independently and
//! calls back into the miss handler when the subscription has gone quiet for
//! `max_out` consecutive intervals.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Default number of consecutive missed intervals before the miss handler
/// fires.
pub const DEFAULT_MAX_OUT: u32 = 2;

struct Config {
    interval: Duration,
    max_out: u32,
    deadline: Option<Instant>,
}

/// Liveness detector: resets on [`HeartbeatMonitor::work`], fires its miss
/// handler after `max_out` consecutive ticks with no reset.
pub struct HeartbeatMonitor {
    missed: Arc<AtomicU32>,
    config: Arc<Mutex<Config>>,
    reconfigured: Arc<Notify>,
    cancelled: Arc<Notify>,
    task: Option<JoinHandle<()>>,
}

impl HeartbeatMonitor {
    /// Starts a new monitor. `on_miss` is called with the current miss count
    /// once it reaches `max_out`; returning `false` stops the monitor. If
    /// `cancel_after` is set, the monitor stops unconditionally once that
    /// much time has elapsed, regardless of `on_miss`'s answer.
    pub fn new<F>(
        interval: Duration,
        max_out: u32,
        cancel_after: Option<Duration>,
        mut on_miss: F,
    ) -> Self
    where
        F: FnMut(u32) -> bool + Send + 'static,
    {
        let missed = Arc::new(AtomicU32::new(0));
        let config = Arc::new(Mutex::new(Config {
            interval,
            max_out,
            deadline: cancel_after.map(|d| Instant::now() + d),
        }));
        let reconfigured = Arc::new(Notify::new());
        let cancelled = Arc::new(Notify::new());

        let missed_task = missed.clone();
        let config_task = config.clone();
        let reconfigured_task = reconfigured.clone();
        let cancelled_task = cancelled.clone();

        let task = tokio::spawn(async move {
            loop {
                let (interval, max_out, deadline) = {
                    let cfg = config_task.lock().unwrap();
                    (cfg.interval, cfg.max_out, cfg.deadline)
                };
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        let count = missed_task.fetch_add(1, Ordering::SeqCst) + 1;
                        if count >= max_out {
                            tracing::debug!(count, max_out, "idle heartbeat monitor missed beats");
                            if !on_miss(count) {
                                break;
                            }
                        }
                    }
                    _ = reconfigured_task.notified() => {
                        continue;
                    }
                    _ = cancelled_task.notified() => {
                        break;
                    }
                    _ = wait_deadline(deadline) => {
                        tracing::debug!("idle heartbeat monitor auto-cancelled");
                        break;
                    }
                }
            }
        });

        Self {
            missed,
            config,
            reconfigured,
            cancelled,
            task: Some(task),
        }
    }

    /// Resets the miss counter. Called for every frame observed on the
    /// subscription, including heartbeats and ordinary data.
    pub fn work(&self) {
        self.missed.store(0, Ordering::SeqCst);
    }

    /// Atomically reconfigures the interval and `cancel_after` deadline
    /// (the deadline, if set, is measured from this call).
    pub fn change(&self, interval: Duration, cancel_after: Option<Duration>) {
        {
            let mut cfg = self.config.lock().unwrap();
            cfg.interval = interval;
            cfg.deadline = cancel_after.map(|d| Instant::now() + d);
        }
        self.missed.store(0, Ordering::SeqCst);
        self.reconfigured.notify_one();
    }

    /// Stops the monitor. Idempotent.
    pub fn cancel(&self) {
        self.cancelled.notify_one();
    }
}

async fn wait_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(instant) => tokio::time::sleep_until(instant).await,
        None => std::future::pending::<()>().await,
    }
}

impl Drop for HeartbeatMonitor {
    fn drop(&mut self) {
        self.cancelled.notify_one();
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test(start_paused = true)]
    async fn fires_after_max_out_missed_intervals() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_cb = calls.clone();
        let monitor = HeartbeatMonitor::new(Duration::from_millis(10), 2, None, move |count| {
            calls_cb.fetch_add(1, Ordering::SeqCst);
            assert_eq!(count, 2);
            true
        });

        tokio::time::advance(Duration::from_millis(25)).await;
        tokio::task::yield_now().await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        monitor.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn work_resets_the_counter() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_cb = calls.clone();
        let monitor = HeartbeatMonitor::new(Duration::from_millis(10), 2, None, move |_| {
            calls_cb.fetch_add(1, Ordering::SeqCst);
            true
        });

        tokio::time::advance(Duration::from_millis(10)).await;
        tokio::task::yield_now().await;
        monitor.work();
        tokio::time::advance(Duration::from_millis(10)).await;
        tokio::task::yield_now().await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        monitor.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_after_stops_regardless_of_handler() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_cb = calls.clone();
        let _monitor = HeartbeatMonitor::new(
            Duration::from_millis(5),
            100,
            Some(Duration::from_millis(12)),
            move |_| {
                calls_cb.fetch_add(1, Ordering::SeqCst);
                true
            },
        );

        tokio::time::advance(Duration::from_millis(50)).await;
        tokio::task::yield_now().await;
        // max_out of 100 is never reached before cancel_after fires.
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}

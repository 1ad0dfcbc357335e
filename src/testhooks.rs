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
//! Internal test hooks: testability seams, exposed as an internal feature
//! registry rather than magic option keys.
//!
//! Nothing in the public API reads these except [`crate::error::ClassifyContext`]
//! and the pull-subscription's request builder; applications never need to
//! touch this module directly, which is why it carries no `Default` impl
//! fields beyond what `#[derive(Default)]` already gives it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// A shared registry of test-only knobs, cloned onto every [`crate::context::Context`]
/// and [`crate::jetstream_subscription::JetStreamSubscription`] so the
/// `MaxWaitingExceeded` scenario is reproducible without timing races.
#[derive(Clone, Default)]
pub struct TestHooks {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    max_waiting_to_fail: AtomicBool,
    delay_heartbeat: std::sync::Mutex<Option<Duration>>,
}

impl TestHooks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes a 409 `Exceeded MaxWaiting` classify as terminal instead of
    /// transient.
    pub fn set_max_waiting_to_fail(&self, fail: bool) {
        self.inner.max_waiting_to_fail.store(fail, Ordering::SeqCst);
    }

    pub fn max_waiting_is_terminal(&self) -> bool {
        self.inner.max_waiting_to_fail.load(Ordering::SeqCst)
    }

    /// Artificially delays the next heartbeat by `delay`, used to deliberately
    /// trip the idle-heartbeat monitor in tests.
    pub fn delay_heartbeat(&self, delay: Option<Duration>) {
        *self.inner.delay_heartbeat.lock().unwrap() = delay;
    }

    pub fn heartbeat_delay(&self) -> Option<Duration> {
        *self.inner.delay_heartbeat.lock().unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn max_waiting_flag_round_trips() {
        let hooks = TestHooks::new();
        assert!(!hooks.max_waiting_is_terminal());
        hooks.set_max_waiting_to_fail(true);
        assert!(hooks.max_waiting_is_terminal());
    }

    #[test]
    fn heartbeat_delay_round_trips() {
        let hooks = TestHooks::new();
        assert_eq!(hooks.heartbeat_delay(), None);
        hooks.delay_heartbeat(Some(Duration::from_millis(5)));
        assert_eq!(hooks.heartbeat_delay(), Some(Duration::from_millis(5)));
    }
}

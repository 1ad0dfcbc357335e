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
//! An in-memory [`Transport`] used by this crate's own test suite. Exposed
//! behind the `test-util` feature so downstream crates building on top of
//! this one can drive the same scenarios without a running broker.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::header::HeaderMap;
use crate::transport::{Feature, RawSubscription, Transport, TransportMessage};
use crate::Error;

type Responder = Arc<dyn Fn(Bytes) -> Result<TransportMessage, Error> + Send + Sync>;

#[derive(Default)]
struct State {
    subs: HashMap<String, mpsc::UnboundedSender<TransportMessage>>,
    published: Vec<(String, Bytes, Option<HeaderMap>)>,
    responders: HashMap<String, Responder>,
    features: HashSet<Feature>,
}

#[derive(Clone)]
struct Inner(Arc<Mutex<State>>);

impl Inner {
    fn remove_sub(&self, subject: &str) {
        self.0.lock().unwrap().subs.remove(subject);
    }

    fn rebind_sub(&self, old: &str, new: &str) {
        let mut state = self.0.lock().unwrap();
        if let Some(tx) = state.subs.remove(old) {
            state.subs.insert(new.to_string(), tx);
        }
    }
}

/// A transport double that keeps everything in memory: subscriptions are
/// plain channels, publishes are recorded for assertions, and RPC replies
/// are whatever responder the test registered for that subject.
pub struct MockTransport {
    inner: Inner,
    inbox_counter: AtomicU64,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            inner: Inner(Arc::new(Mutex::new(State::default()))),
            inbox_counter: AtomicU64::new(0),
        }
    }

    /// Subscribes `subject` and returns the raw handle a real transport
    /// would hand the typed subscription layer.
    pub async fn subscribe_raw(&self, subject: &str) -> Box<dyn RawSubscription> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.0.lock().unwrap().subs.insert(subject.to_string(), tx);
        Box::new(MockSubscription {
            subject: subject.to_string(),
            rx,
            inner: self.inner.clone(),
        })
    }

    /// Delivers a data frame (non-headers-only message) to `subject`.
    pub async fn push_data(&self, subject: &str, reply: &str, payload: &[u8]) {
        self.deliver(TransportMessage {
            subject: subject.to_string(),
            reply: Some(reply.to_string()),
            headers: None,
            payload: Bytes::copy_from_slice(payload),
        });
    }

    /// Delivers a headers-only status frame (flow control, heartbeat, or a
    /// plain error status) to `subject`.
    pub async fn push_status(&self, subject: &str, code: u16, description: &str, reply: Option<&str>) {
        self.deliver(TransportMessage {
            subject: subject.to_string(),
            reply: reply.map(String::from),
            headers: Some(HeaderMap::with_status(code, description)),
            payload: Bytes::new(),
        });
    }

    /// Delivers a heartbeat carrying the standard last-consumer / stalled
    /// headers.
    pub async fn push_heartbeat(&self, subject: &str, last_consumer: Option<u64>, stalled: Option<&str>) {
        let mut headers = HeaderMap::with_status(100, "Idle Heartbeat");
        if let Some(n) = last_consumer {
            headers.insert(crate::header::names::NATS_LAST_CONSUMER, n.to_string());
        }
        if let Some(subject) = stalled {
            headers.insert(crate::header::names::NATS_CONSUMER_STALLED, subject.to_string());
        }
        self.deliver(TransportMessage {
            subject: subject.to_string(),
            reply: None,
            headers: Some(headers),
            payload: Bytes::new(),
        });
    }

    /// Closes `subject`'s subscription so its consumer observes the end of
    /// the stream, the way an `unsubscribe` or connection loss would.
    pub async fn end(&self, subject: &str) {
        self.inner.remove_sub(subject);
    }

    fn deliver(&self, msg: TransportMessage) {
        let subs = &self.inner.0.lock().unwrap().subs;
        if let Some(tx) = subs.get(&msg.subject) {
            let _ = tx.send(msg);
        }
    }

    pub async fn was_published(&self, subject: &str) -> bool {
        self.inner
            .0
            .lock()
            .unwrap()
            .published
            .iter()
            .any(|(s, _, _)| s == subject)
    }

    pub async fn published_count(&self, subject: &str) -> usize {
        self.inner
            .0
            .lock()
            .unwrap()
            .published
            .iter()
            .filter(|(s, _, _)| s == subject)
            .count()
    }

    pub async fn last_published_payload(&self, subject: &str) -> Option<Bytes> {
        self.inner
            .0
            .lock()
            .unwrap()
            .published
            .iter()
            .rev()
            .find(|(s, _, _)| s == subject)
            .map(|(_, payload, _)| payload.clone())
    }

    /// Registers a canned reply for [`Transport::request`] on an exact
    /// subject, simulating a broker RPC (`CONSUMER.CREATE`, `.INFO`, ...).
    pub fn set_responder<F>(&self, subject: impl Into<String>, f: F)
    where
        F: Fn(Bytes) -> Result<TransportMessage, Error> + Send + Sync + 'static,
    {
        self.inner
            .0
            .lock()
            .unwrap()
            .responders
            .insert(subject.into(), Arc::new(f));
    }

    pub fn enable_feature(&self, feature: Feature) {
        self.inner.0.lock().unwrap().features.insert(feature);
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn request(
        &self,
        subject: &str,
        payload: Bytes,
        _headers: Option<HeaderMap>,
        _timeout: Duration,
    ) -> Result<TransportMessage, Error> {
        let responder = self.inner.0.lock().unwrap().responders.get(subject).cloned();
        match responder {
            Some(f) => f(payload),
            None => Err(Error::Timeout),
        }
    }

    async fn publish(
        &self,
        subject: &str,
        payload: Bytes,
        reply: Option<String>,
        headers: Option<HeaderMap>,
    ) -> Result<(), Error> {
        self.inner
            .0
            .lock()
            .unwrap()
            .published
            .push((subject.to_string(), payload.clone(), headers.clone()));
        self.deliver(TransportMessage {
            subject: subject.to_string(),
            reply,
            headers,
            payload,
        });
        Ok(())
    }

    async fn subscribe(
        &self,
        subject: &str,
        _queue: Option<String>,
        _max: Option<u64>,
    ) -> Result<Box<dyn RawSubscription>, Error> {
        Ok(self.subscribe_raw(subject).await)
    }

    fn new_inbox(&self, prefix: &str) -> String {
        let n = self.inbox_counter.fetch_add(1, Ordering::SeqCst);
        let prefix = if prefix.is_empty() { "_INBOX" } else { prefix };
        format!("{prefix}.{n}")
    }

    fn supports_feature(&self, feature: Feature) -> bool {
        self.inner.0.lock().unwrap().features.contains(&feature)
    }
}

struct MockSubscription {
    subject: String,
    rx: mpsc::UnboundedReceiver<TransportMessage>,
    inner: Inner,
}

#[async_trait]
impl RawSubscription for MockSubscription {
    async fn next(&mut self) -> Option<TransportMessage> {
        self.rx.recv().await
    }

    async fn drain(&mut self) -> Result<(), Error> {
        self.inner.remove_sub(&self.subject);
        Ok(())
    }

    async fn unsubscribe(&mut self) -> Result<(), Error> {
        self.inner.remove_sub(&self.subject);
        Ok(())
    }

    async fn rebind(&mut self, new_subject: &str) -> Result<(), Error> {
        self.inner.rebind_sub(&self.subject, new_subject);
        self.subject = new_subject.to_string();
        Ok(())
    }
}

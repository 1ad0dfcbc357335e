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
//! The JetStream client: option normalization, consumer bind/create,
//! publish-with-expectations, one-shot pull, batched fetch, and the
//! `subscribe`/`pull_subscribe` factories. Everything here is built on top
//! of the transport boundary and the lower layers; it owns no wire format
//! decisions of its own beyond the subjects and request bodies it sends.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::consumer::{AckPolicy, ConsumerConfig, ConsumerInfo, ConsumerOptions};
use crate::error::{classify, Classification, ClassifyContext, ErrorKind};
use crate::heartbeat::{HeartbeatMonitor, DEFAULT_MAX_OUT};
use crate::iterator::QueuedIterator;
use crate::jetstream_subscription::{JetStreamSubscription, StartArgs};
use crate::message::Message;
use crate::publish::{self, PubAck, PublishOptions};
use crate::pull_subscription::{PullRequest, PullSubscription};
use crate::stream::{
    check_status, consumer_info_on, create_consumer_on, decode_json, encode_json, Stream, StreamConfig, StreamInfo,
};
use crate::subscription::{self, FrameHooks};
use crate::testhooks::TestHooks;
use crate::transport::{Feature, Transport};
use crate::Error;

const RPC_TIMEOUT: Duration = Duration::from_secs(5);

/// A resolved, about-to-be-(re)bound consumer, minus the fields that only
/// exist once a subscription is actually running; those live in
/// [`crate::jetstream_subscription::JetStreamSubscription`].
struct ResolvedConsumer {
    stream: String,
    config: ConsumerConfig,
    deliver: String,
    attached: bool,
    name: Option<String>,
}

/// Entry point to the JetStream API: publish, one-shot pull, batched fetch,
/// and the `subscribe`/`pull_subscribe` factories.
#[derive(Clone)]
pub struct Context {
    transport: Arc<dyn Transport>,
    prefix: String,
    test_hooks: TestHooks,
}

impl Context {
    /// A context using the default API prefix (`$JS.API`).
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self::with_prefix(transport, crate::DEFAULT_API_PREFIX)
    }

    /// A context scoped to a JetStream domain, whose API subjects are
    /// prefixed `$JS.{domain}.API` instead of the default.
    pub fn with_domain(transport: Arc<dyn Transport>, domain: impl AsRef<str>) -> Self {
        Self::with_prefix(transport, format!("$JS.{}.API", domain.as_ref()))
    }

    /// A context using an explicit API prefix, for accounts that remap the
    /// JetStream API subject space.
    pub fn with_prefix(transport: Arc<dyn Transport>, prefix: impl Into<String>) -> Self {
        crate::warn_ordered_consumer_once();
        Self {
            transport,
            prefix: prefix.into(),
            test_hooks: TestHooks::new(),
        }
    }

    /// Test-only access to this context's [`TestHooks`] registry, so
    /// callers can flip `set_max_waiting_to_fail` before a `fetch`/`pull`
    /// without reaching into subscription internals.
    #[cfg(any(test, feature = "test-util"))]
    pub fn test_hooks(&self) -> &TestHooks {
        &self.test_hooks
    }

    // ---- stream/consumer convenience -----------------------------------

    /// `{prefix}.STREAM.INFO.{name}`.
    pub async fn get_stream(&self, name: &str) -> Result<Stream, Error> {
        let subject = format!("{}.STREAM.INFO.{name}", self.prefix);
        let reply = self
            .transport
            .request(&subject, Bytes::new(), None, RPC_TIMEOUT)
            .await?;
        check_status(&reply)?;
        let info: StreamInfo = decode_json(&reply.payload)?;
        Ok(Stream::new(self.transport.clone(), self.prefix.clone(), info))
    }

    /// `{prefix}.STREAM.CREATE.{name}`.
    pub async fn create_stream(&self, config: StreamConfig) -> Result<Stream, Error> {
        let subject = format!("{}.STREAM.CREATE.{}", self.prefix, config.name);
        let body = encode_json(&config)?;
        let reply = self.transport.request(&subject, body, None, RPC_TIMEOUT).await?;
        check_status(&reply)?;
        let info: StreamInfo = decode_json(&reply.payload)?;
        Ok(Stream::new(self.transport.clone(), self.prefix.clone(), info))
    }

    /// Binds to an existing stream by name, creating it if no such stream
    /// exists yet. Only a "not found" reply (404) falls through to create;
    /// any other failure (timeout, a different server error) propagates,
    /// the same "any other failure is fatal" rule applied to the analogous
    /// durable-consumer lookup.
    pub async fn get_or_create_stream(&self, config: StreamConfig) -> Result<Stream, Error> {
        match self.get_stream(&config.name).await {
            Ok(stream) => Ok(stream),
            Err(Error::Server { kind: ErrorKind::NoMessages, .. }) => self.create_stream(config).await,
            Err(err) => Err(err),
        }
    }

    pub async fn get_consumer(&self, stream: &str, name: &str) -> Result<ConsumerInfo, Error> {
        consumer_info_on(self.transport.as_ref(), &self.prefix, stream, name).await
    }

    pub async fn create_consumer(&self, stream: &str, config: ConsumerConfig) -> Result<ConsumerInfo, Error> {
        create_consumer_on(self.transport.as_ref(), &self.prefix, stream, config).await
    }

    /// `{prefix}.STREAM.NAMES` with a subject filter, used by
    /// [`Self::process_options`] step 3 to resolve a stream when the caller
    /// didn't name one explicitly.
    async fn stream_by_subject(&self, subject: &str) -> Result<String, Error> {
        #[derive(Serialize)]
        struct Req<'a> {
            subject: &'a str,
        }
        #[derive(Deserialize, Default)]
        struct Resp {
            streams: Option<Vec<String>>,
        }

        let rpc_subject = format!("{}.STREAM.NAMES", self.prefix);
        let body = encode_json(&Req { subject })?;
        let reply = self.transport.request(&rpc_subject, body, None, RPC_TIMEOUT).await?;
        check_status(&reply)?;
        let resp: Resp = decode_json(&reply.payload)?;
        resp.streams
            .and_then(|names| names.into_iter().next())
            .ok_or_else(|| Error::Config(format!("no stream matches subject {subject}")))
    }

    // ---- publish --------------------------------------------------------

    /// Publishes `payload` to `subject` with no expectation headers and
    /// default retry behavior. See [`Self::publish_with_options`] for
    /// optimistic-concurrency headers and custom retry.
    pub async fn publish(&self, subject: &str, payload: Bytes) -> Result<PubAck, Error> {
        self.publish_with_options(subject, payload, PublishOptions::default()).await
    }

    pub async fn publish_with_options(
        &self,
        subject: &str,
        payload: Bytes,
        opts: PublishOptions,
    ) -> Result<PubAck, Error> {
        publish::publish(self.transport.as_ref(), subject, payload, None, &opts).await
    }

    // ---- one-shot pull ----------------------------------------------

    /// Requests exactly one message from `durable` on `stream`, waiting up
    /// to `expires` (or returning immediately with `NoMessages` if
    /// `expires` is zero).
    pub async fn pull(&self, stream: &str, durable: &str, expires: Duration) -> Result<Message, Error> {
        let subject = format!("{}.CONSUMER.MSG.NEXT.{stream}.{durable}", self.prefix);
        let body = PullRequest {
            batch: 1,
            no_wait: expires.is_zero().then_some(true),
            max_bytes: None,
            expires: (!expires.is_zero()).then(|| expires.as_nanos() as u64),
            idle_heartbeat: None,
        };
        let payload = encode_json(&body)?;
        let timeout = RPC_TIMEOUT.max(expires);
        let reply = self.transport.request(&subject, payload, None, timeout).await?;

        if let Some(status) = reply.headers.as_ref().and_then(|h| h.status()) {
            let classification = classify(
                status.code,
                &status.description,
                ClassifyContext {
                    publish: false,
                    max_waiting_is_terminal: self.test_hooks.max_waiting_is_terminal(),
                },
            );
            if let Classification::Transient(kind) | Classification::Terminal(kind) = classification {
                return Err(Error::server(kind, status.description.clone()));
            }
        }

        Ok(Message {
            subject: reply.subject,
            reply: reply.reply,
            headers: reply.headers,
            payload: reply.payload,
            transport: self.transport.clone(),
        })
    }

    // ---- batched fetch --------------------------------------------------

    /// Requests up to `opts.batch` messages and returns an iterator that
    /// ends when the batch target, byte cap, server end-of-batch signal, or
    /// `opts.expires` fires, whichever comes first.
    pub async fn fetch(&self, stream: &str, durable: &str, opts: FetchOptions) -> Result<QueuedIterator<Message>, Error> {
        if stream.is_empty() || durable.is_empty() {
            return Err(Error::Config("fetch requires a stream and durable name".into()));
        }
        let expires = opts.expires.filter(|d| !d.is_zero());
        if !opts.no_wait && expires.is_none() {
            return Err(Error::Config("fetch requires no_wait or a nonzero expires".into()));
        }
        if let Some(max_bytes) = opts.max_bytes {
            if max_bytes > 0 && !self.transport.supports_feature(Feature::PullMaxBytes) {
                return Err(Error::server(
                    ErrorKind::RequestFailed,
                    "server does not support max_bytes pull requests",
                ));
            }
        }

        let inbox = self.transport.new_inbox("");
        let raw = self.transport.subscribe(&inbox, None, Some(opts.batch as u64)).await?;

        let received = Arc::new(AtomicU64::new(0));
        let received_bytes = Arc::new(AtomicU64::new(0));
        let (stop_tx, stop_rx) = mpsc::unbounded_channel::<()>();
        let heartbeat: Arc<Mutex<Option<HeartbeatMonitor>>> = Arc::new(Mutex::new(None));

        let mut hooks = FrameHooks::default();
        hooks.on_any_frame = Some(Box::new({
            let heartbeat = heartbeat.clone();
            move || {
                if let Some(hb) = heartbeat.lock().unwrap().as_ref() {
                    hb.work();
                }
            }
        }));
        hooks.on_data = Some(Box::new({
            let received = received.clone();
            let received_bytes = received_bytes.clone();
            let stop_tx = stop_tx.clone();
            let batch = opts.batch as u64;
            let max_bytes = opts.max_bytes.map(|b| b as u64);
            move |message: &Message| -> bool {
                let n = received.fetch_add(1, Ordering::SeqCst) + 1;
                let bytes = received_bytes.fetch_add(message.payload.len() as u64, Ordering::SeqCst)
                    + message.payload.len() as u64;
                let pending_exhausted = message.info().map(|info| info.pending == 0).unwrap_or(false);
                let bytes_capped = max_bytes.is_some_and(|cap| bytes >= cap);
                if pending_exhausted || n >= batch || bytes_capped {
                    let _ = stop_tx.send(());
                }
                true
            }
        }));
        hooks.on_status = Some(Box::new({
            let test_hooks = self.test_hooks.clone();
            let stop_tx = stop_tx.clone();
            move |code, description| {
                let classification = classify(
                    code,
                    description,
                    ClassifyContext {
                        publish: false,
                        max_waiting_is_terminal: test_hooks.max_waiting_is_terminal(),
                    },
                );
                if !matches!(classification, Classification::None) {
                    let _ = stop_tx.send(());
                }
                Some(classification)
            }
        }));

        let (handle, injector, iter) =
            subscription::spawn(raw, self.transport.clone(), None, AckPolicy::Explicit, true, hooks);
        let iter = iter.expect("fetch always runs in iterator mode");

        if let Some(interval) = opts.idle_heartbeat.filter(|d| !d.is_zero()) {
            let monitor = HeartbeatMonitor::new(interval, DEFAULT_MAX_OUT, None, {
                let injector = injector.clone();
                move |count| {
                    injector.inject_terminal(
                        ErrorKind::IdleHeartbeatMissed,
                        format!("missed {count} consecutive heartbeats during fetch"),
                    );
                    true
                }
            });
            *heartbeat.lock().unwrap() = Some(monitor);
        }

        // Starts an expiration timer; when it fires, drain the subscription
        // and cancel the heartbeat monitor. Races against the early-stop
        // signal from `on_data`/`on_status` above, whichever comes first.
        tokio::spawn(drain_on_stop_or_expiry(handle, injector, heartbeat, stop_rx, expires));

        let subject = format!("{}.CONSUMER.MSG.NEXT.{stream}.{durable}", self.prefix);
        let body = PullRequest {
            batch: opts.batch,
            no_wait: opts.no_wait.then_some(true),
            max_bytes: opts.max_bytes.filter(|&b| b > 0),
            expires: expires.map(|d| d.as_nanos() as u64),
            idle_heartbeat: opts.idle_heartbeat.filter(|d| !d.is_zero()).map(|d| d.as_nanos() as u64),
        };
        let payload = encode_json(&body)?;
        self.transport.publish(&subject, payload, Some(inbox), None).await?;

        Ok(iter)
    }

    // ---- subscribe / pull_subscribe factories --------------------------

    /// Long-lived push (or ordered) subscription. Requires either
    /// `opts.bind_only` or an explicit `opts.config.deliver_subject`, unless
    /// `opts.ordered` is set (an ordered consumer synthesizes its own
    /// deliver subject in [`Self::process_options`]).
    pub async fn subscribe(
        &self,
        subject: &str,
        opts: ConsumerOptions,
    ) -> Result<(JetStreamSubscription, Option<QueuedIterator<Message>>), Error> {
        if !opts.ordered && !opts.bind_only && opts.config.deliver_subject.is_none() {
            return Err(Error::Config(
                "subscribe requires bind_only or an explicit deliver_subject".into(),
            ));
        }
        opts.validate_ordered()?;

        let bind_only = opts.bind_only;
        let ordered = opts.ordered;
        let callback = opts.callback.clone();
        let manual_ack = opts.manual_ack;
        let max_messages = opts.max_messages;

        let mut resolved = self.process_options(Some(subject), opts).await?;
        self.maybe_create_consumer(&mut resolved, bind_only).await?;

        let args = StartArgs {
            transport: self.transport.clone(),
            prefix: self.prefix.clone(),
            stream: resolved.stream,
            name: resolved.name.expect("resolved by maybe_create_consumer"),
            config: resolved.config,
            deliver: resolved.deliver,
            ordered,
            callback,
            manual_ack,
            max_messages,
            test_hooks: self.test_hooks.clone(),
        };
        JetStreamSubscription::start(args).await
    }

    /// Long-lived pull subscription bound to `durable` on `stream`. Requires
    /// an explicit ack policy, never ordered, and no `deliver_subject`.
    pub async fn pull_subscribe(
        &self,
        stream: &str,
        durable: &str,
        mut opts: ConsumerOptions,
    ) -> Result<(PullSubscription, Option<QueuedIterator<Message>>), Error> {
        if opts.config.ack_policy == AckPolicy::NotSet {
            opts.config.ack_policy = AckPolicy::Explicit;
        }
        opts.validate_pull()?;

        opts.stream = Some(stream.to_string());
        opts.config.durable_name = Some(durable.to_string());

        let bind_only = opts.bind_only;
        let callback = opts.callback.clone();
        let manual_ack = opts.manual_ack;
        let max_messages = opts.max_messages;

        let mut resolved = self.process_options(None, opts).await?;
        self.maybe_create_consumer(&mut resolved, bind_only).await?;

        let args = StartArgs {
            transport: self.transport.clone(),
            prefix: self.prefix.clone(),
            stream: resolved.stream,
            name: resolved.name.expect("resolved by maybe_create_consumer"),
            config: resolved.config,
            deliver: resolved.deliver,
            ordered: false,
            callback,
            manual_ack,
            max_messages,
            test_hooks: self.test_hooks.clone(),
        };
        PullSubscription::start(args).await
    }

    // ---- option processing ----------------------------------------------

    /// Normalizes user-supplied [`ConsumerOptions`] into a [`ResolvedConsumer`],
    /// following the six order-sensitive steps below exactly. `subject` is
    /// the subscribe target for push/ordered consumers; pull consumers pass
    /// `None` since they bind directly to a stream and durable name instead.
    async fn process_options(&self, subject: Option<&str>, opts: ConsumerOptions) -> Result<ResolvedConsumer, Error> {
        let mut config = opts.config;

        // Step 1: ordered invariants + synthesized config.
        if opts.ordered {
            config.deliver_subject = Some(self.transport.new_inbox(""));
            config.ack_policy = AckPolicy::None;
            config.max_deliver = Some(1);
            config.flow_control = true;
            if config.idle_heartbeat.is_none() {
                config.idle_heartbeat = Some(Duration::from_secs(5));
            }
            config.ack_wait = Some(Duration::from_secs(22 * 3600));
            config.mem_storage = true;
            config.num_replicas = 1;
        }

        // Step 2: default ack policy.
        if config.ack_policy == AckPolicy::NotSet {
            config.ack_policy = AckPolicy::All;
        }

        // Step 3: resolve stream.
        let stream = match opts.stream {
            Some(stream) => stream,
            None => {
                let subject = subject.ok_or_else(|| {
                    Error::Config("no stream given and no subject to resolve one from".into())
                })?;
                self.stream_by_subject(subject).await?
            }
        };

        // Step 4: attach to an existing durable, if named.
        let mut attached = false;
        let mut name = None;
        if let Some(durable) = config.durable_name.clone() {
            match consumer_info_on(self.transport.as_ref(), &self.prefix, &stream, &durable).await {
                Ok(info) => {
                    if let Some(requested) = &config.filter_subject {
                        if Some(requested) != info.config.filter_subject.as_ref() {
                            return Err(Error::Config(format!(
                                "durable {durable} already exists with a different filter subject: {:?}",
                                info.config.filter_subject
                            )));
                        }
                    }
                    if info.push_bound == Some(true) && config.deliver_group.is_none() {
                        return Err(Error::Config(format!(
                            "consumer {durable} is already bound to a subscription"
                        )));
                    }
                    if let Some(group) = &config.deliver_group {
                        if info.config.deliver_group.as_deref() != Some(group.as_str()) {
                            return Err(Error::Config(format!(
                                "cannot add member to queue group {group}: durable {durable} requires queue group {:?}",
                                info.config.deliver_group
                            )));
                        }
                    }
                    name = Some(info.name.clone());
                    config = info.config.clone();
                    attached = true;
                }
                Err(Error::Server { kind: ErrorKind::NoMessages, .. }) => {
                    // 404: no such durable yet, proceed as a new consumer.
                    // Any other failure (including a transport/decode error)
                    // is fatal.
                }
                Err(err) => return Err(err),
            }
        }

        // Step 5: default filter subject when unset and not attached.
        if config.filter_subject.is_none() && config.filter_subjects.is_none() && !attached {
            if let Some(subject) = subject {
                config.filter_subject = Some(subject.to_string());
            }
        }

        // Step 6: deliver inbox.
        let deliver = config
            .deliver_subject
            .clone()
            .unwrap_or_else(|| self.transport.new_inbox(""));

        Ok(ResolvedConsumer {
            stream,
            config,
            deliver,
            attached,
            name,
        })
    }

    /// Creates the consumer server-side unless already attached.
    async fn maybe_create_consumer(&self, resolved: &mut ResolvedConsumer, bind_only: bool) -> Result<(), Error> {
        if resolved.attached {
            return Ok(());
        }
        if bind_only {
            return Err(Error::Config(format!(
                "bind-only subscribe found no durable {:?} on stream {}",
                resolved.config.durable_name, resolved.stream
            )));
        }

        if resolved.config.ack_wait.is_none() {
            resolved.config.ack_wait = Some(Duration::from_secs(30));
        }
        if resolved.config.ack_policy == AckPolicy::NotSet {
            resolved.config.ack_policy = AckPolicy::Explicit;
        }

        let wanted_multi_filter = resolved.config.filter_subjects.is_some();
        let info = create_consumer_on(
            self.transport.as_ref(),
            &self.prefix,
            &resolved.stream,
            resolved.config.clone(),
        )
        .await?;

        if wanted_multi_filter && info.config.filter_subjects.is_none() {
            return Err(Error::Config(
                "server does not support multi-subject filters (upgrade required)".into(),
            ));
        }

        resolved.name = Some(info.name.clone());
        resolved.config = info.config;
        Ok(())
    }
}

async fn drain_on_stop_or_expiry(
    handle: crate::subscription::TypedSubscriptionHandle,
    injector: crate::subscription::ErrorInjector,
    heartbeat: Arc<Mutex<Option<HeartbeatMonitor>>>,
    mut stop_rx: mpsc::UnboundedReceiver<()>,
    expires: Option<Duration>,
) {
    match expires {
        Some(expires) => {
            tokio::select! {
                _ = stop_rx.recv() => {}
                _ = tokio::time::sleep(expires) => {}
            }
        }
        None => {
            stop_rx.recv().await;
        }
    }
    heartbeat.lock().unwrap().take();
    injector.close();
    let mut raw = handle.stop().await;
    let _ = raw.drain().await;
}

/// Per-`fetch` options.
#[derive(Debug, Clone)]
pub struct FetchOptions {
    pub batch: usize,
    pub no_wait: bool,
    pub max_bytes: Option<usize>,
    pub expires: Option<Duration>,
    pub idle_heartbeat: Option<Duration>,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            batch: 200,
            no_wait: false,
            max_bytes: None,
            expires: Some(Duration::from_secs(30)),
            idle_heartbeat: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::HeaderMap;
    use crate::mock::MockTransport;
    use crate::transport::TransportMessage;
    use futures::StreamExt;

    fn consumer_info_reply(name: &str, stream: &str, config: ConsumerConfig) -> TransportMessage {
        let body = serde_json::json!({
            "type": "",
            "stream_name": stream,
            "name": name,
            "config": config,
            "delivered": {"consumer_seq": 0, "stream_seq": 0},
            "ack_floor": {"consumer_seq": 0, "stream_seq": 0},
            "num_ack_pending": 0,
            "num_redelivered": 0,
            "num_waiting": 0,
            "num_pending": 0,
        });
        TransportMessage {
            subject: String::new(),
            reply: None,
            headers: None,
            payload: Bytes::from(serde_json::to_vec(&body).unwrap()),
        }
    }

    fn not_found() -> TransportMessage {
        TransportMessage {
            subject: String::new(),
            reply: None,
            headers: Some(HeaderMap::with_status(404, "Consumer Not Found")),
            payload: Bytes::new(),
        }
    }

    #[tokio::test]
    async fn publish_round_trips_through_the_transport() {
        let transport = Arc::new(MockTransport::new());
        transport.set_responder("ORDERS.in", |_payload| {
            Ok(TransportMessage {
                subject: String::new(),
                reply: None,
                headers: None,
                payload: Bytes::from(r#"{"stream":"ORDERS","seq":1}"#),
            })
        });

        let ctx = Context::new(transport);
        let ack = ctx.publish("ORDERS.in", Bytes::from_static(b"hi")).await.unwrap();
        assert_eq!(ack.stream, "ORDERS");
    }

    #[tokio::test]
    async fn pull_one_shot_raises_classified_errors() {
        let transport = Arc::new(MockTransport::new());
        transport.set_responder("$JS.API.CONSUMER.MSG.NEXT.ORDERS.a", |_payload| {
            Ok(TransportMessage {
                subject: String::new(),
                reply: None,
                headers: Some(HeaderMap::with_status(404, "No Messages")),
                payload: Bytes::new(),
            })
        });

        let ctx = Context::new(transport);
        let err = ctx
            .pull("ORDERS", "a", Duration::from_millis(0))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), Some(ErrorKind::NoMessages));
    }

    #[tokio::test]
    async fn new_durable_is_created_when_none_exists() {
        let transport = Arc::new(MockTransport::new());
        transport.set_responder("$JS.API.CONSUMER.INFO.ORDERS.a", |_| Ok(not_found()));
        transport.set_responder("$JS.API.CONSUMER.CREATE.ORDERS", |_| {
            Ok(consumer_info_reply(
                "a",
                "ORDERS",
                ConsumerConfig {
                    ack_policy: AckPolicy::Explicit,
                    deliver_subject: Some("deliver.1".into()),
                    ..Default::default()
                },
            ))
        });

        let ctx = Context::new(transport.clone());
        let opts = ConsumerOptions {
            stream: Some("ORDERS".into()),
            config: ConsumerConfig {
                durable_name: Some("a".into()),
                deliver_subject: Some("deliver.1".into()),
                ack_policy: AckPolicy::Explicit,
                ..Default::default()
            },
            manual_ack: true,
            ..Default::default()
        };
        let (sub, iter) = ctx.subscribe("orders.*", opts).await.unwrap();
        assert_eq!(sub.consumer_name(), "a");
        drop(iter);
        drop(sub);
    }

    #[tokio::test]
    async fn attaching_to_existing_durable_adopts_server_config() {
        let transport = Arc::new(MockTransport::new());
        transport.set_responder("$JS.API.CONSUMER.INFO.ORDERS.a", |_| {
            Ok(consumer_info_reply(
                "a",
                "ORDERS",
                ConsumerConfig {
                    ack_policy: AckPolicy::Explicit,
                    deliver_subject: Some("deliver.2".into()),
                    filter_subject: Some("orders.*".into()),
                    ..Default::default()
                },
            ))
        });

        let ctx = Context::new(transport.clone());
        let opts = ConsumerOptions {
            stream: Some("ORDERS".into()),
            config: ConsumerConfig {
                durable_name: Some("a".into()),
                ..Default::default()
            },
            manual_ack: true,
            ..Default::default()
        };
        let (sub, iter) = ctx.subscribe("orders.*", opts).await.unwrap();
        assert_eq!(sub.consumer_name(), "a");
        assert_eq!(sub.deliver_subject(), "deliver.2");
        drop(iter);
        drop(sub);
    }

    #[tokio::test]
    async fn bind_only_without_existing_durable_fails_without_creating() {
        let transport = Arc::new(MockTransport::new());
        transport.set_responder("$JS.API.CONSUMER.INFO.ORDERS.missing", |_| Ok(not_found()));
        let create_calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        transport.set_responder("$JS.API.CONSUMER.CREATE.ORDERS", {
            let create_calls = create_calls.clone();
            move |_| {
                create_calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                Ok(consumer_info_reply("missing", "ORDERS", ConsumerConfig::default()))
            }
        });

        let ctx = Context::new(transport.clone());
        let opts = ConsumerOptions {
            stream: Some("ORDERS".into()),
            config: ConsumerConfig {
                durable_name: Some("missing".into()),
                deliver_subject: Some("deliver.3".into()),
                ..Default::default()
            },
            bind_only: true,
            manual_ack: true,
            ..Default::default()
        };
        let err = ctx.subscribe("orders.*", opts).await.unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert_eq!(create_calls.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn ordered_subscribe_synthesizes_config() {
        let transport = Arc::new(MockTransport::new());
        transport.set_responder("$JS.API.CONSUMER.CREATE.ORDERS", |payload| {
            let req: serde_json::Value = serde_json::from_slice(&payload).unwrap();
            assert_eq!(req["config"]["ack_policy"], "none");
            assert_eq!(req["config"]["max_deliver"], 1);
            Ok(consumer_info_reply(
                "ORDERS-ordered",
                "ORDERS",
                ConsumerConfig {
                    ack_policy: AckPolicy::None,
                    max_deliver: Some(1),
                    ..Default::default()
                },
            ))
        });

        let ctx = Context::new(transport.clone());
        let opts = ConsumerOptions {
            stream: Some("ORDERS".into()),
            ordered: true,
            manual_ack: true,
            ..Default::default()
        };
        let (sub, iter) = ctx.subscribe("orders.*", opts).await.unwrap();
        assert!(sub.is_ordered());
        drop(iter);
        drop(sub);
    }

    #[tokio::test]
    async fn fetch_stops_when_batch_reached() {
        let transport = Arc::new(MockTransport::new());
        let ctx = Context::new(transport.clone());

        let mut iter = ctx
            .fetch(
                "ORDERS",
                "a",
                FetchOptions {
                    batch: 2,
                    no_wait: true,
                    expires: None,
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert!(
            transport
                .was_published("$JS.API.CONSUMER.MSG.NEXT.ORDERS.a")
                .await
        );

        // `fetch` allocates its reply inbox via `new_inbox`, the first call
        // of which on a fresh transport is deterministically "_INBOX.0".
        transport
            .push_data("_INBOX.0", "$JS.ACK.ORDERS.a.1.1.1.0.1", b"one")
            .await;
        transport
            .push_data("_INBOX.0", "$JS.ACK.ORDERS.a.2.2.2.0.0", b"two")
            .await;

        let m1 = iter.next().await.unwrap().unwrap();
        assert_eq!(m1.payload.as_ref(), b"one");
        let m2 = iter.next().await.unwrap().unwrap();
        assert_eq!(m2.payload.as_ref(), b"two");
        assert!(iter.next().await.is_none());
    }

    #[tokio::test]
    async fn fetch_requires_no_wait_or_expires() {
        let transport = Arc::new(MockTransport::new());
        let ctx = Context::new(transport);
        let err = ctx
            .fetch(
                "ORDERS",
                "a",
                FetchOptions {
                    no_wait: false,
                    expires: None,
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[tokio::test]
    async fn process_options_rejects_filter_subject_mismatch_on_attach() {
        let transport = Arc::new(MockTransport::new());
        transport.set_responder("$JS.API.CONSUMER.INFO.ORDERS.a", |_| {
            Ok(consumer_info_reply(
                "a",
                "ORDERS",
                ConsumerConfig {
                    filter_subject: Some("orders.other".into()),
                    ..Default::default()
                },
            ))
        });

        let ctx = Context::new(transport);
        let opts = ConsumerOptions {
            stream: Some("ORDERS".into()),
            config: ConsumerConfig {
                durable_name: Some("a".into()),
                filter_subject: Some("orders.mine".into()),
                deliver_subject: Some("deliver.4".into()),
                ..Default::default()
            },
            manual_ack: true,
            ..Default::default()
        };
        let err = ctx.subscribe("orders.mine", opts).await.unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn fetch_options_default_requires_expires() {
        let opts = FetchOptions::default();
        assert!(opts.expires.is_some());
        assert_eq!(opts.batch, 200);
    }

    #[test]
    fn with_domain_scopes_the_prefix() {
        let transport = Arc::new(MockTransport::new());
        let ctx = Context::with_domain(transport, "hub");
        assert_eq!(ctx.prefix, "$JS.hub.API");
    }
}

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
//! JetStream-specific behavior layered on top of the typed subscription:
//! idle-heartbeat wiring, and the ordered-consumer gap-detection /
//! silent-recreate protocol. [`crate::pull_subscription::PullSubscription`]
//! builds on top of this for the explicit `pull` operation.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::consumer::{AckPolicy, ConsumerConfig, ConsumerInfo, DeliverPolicy};
use crate::error::{classify, ClassifyContext, ErrorKind};
use crate::heartbeat::{HeartbeatMonitor, DEFAULT_MAX_OUT};
use crate::iterator::QueuedIterator;
use crate::message::{Message, MessageCallback};
use crate::stream::{consumer_info_on, create_consumer_on, delete_consumer_on};
use crate::subscription::{self, ErrorInjector, FrameHooks, TypedSubscriptionHandle};
use crate::testhooks::TestHooks;
use crate::transport::Transport;
use crate::Error;

/// The sequence bookkeeping an ordered consumer needs to detect a gap
/// (`delivery_seq`, `stream_seq`), plus the heartbeat/flow-control frame
/// counts and restart counter exposed for observability.
#[derive(Debug, Clone, Copy, Default)]
struct OrderedConsumerSequence {
    delivery_seq: u64,
    stream_seq: u64,
    heartbeat_count: u64,
    fc_count: u64,
    consumer_restarts: u64,
}

struct SharedState {
    config: ConsumerConfig,
    name: String,
    deliver: String,
    ordered_seq: OrderedConsumerSequence,
    last: Option<ConsumerInfo>,
}

/// Everything [`JetStreamSubscription::start`] needs, already resolved by
/// [`crate::context::Context::process_options`].
pub struct StartArgs {
    pub transport: Arc<dyn Transport>,
    pub prefix: String,
    pub stream: String,
    pub name: String,
    pub config: ConsumerConfig,
    pub deliver: String,
    pub ordered: bool,
    pub callback: Option<MessageCallback>,
    pub manual_ack: bool,
    pub max_messages: Option<u64>,
    pub test_hooks: TestHooks,
}

/// A live JetStream subscription: a typed subscription plus, for ordered
/// consumers, the background task that performs consumer recreate.
pub struct JetStreamSubscription {
    handle: TypedSubscriptionHandle,
    injector: ErrorInjector,
    heartbeat: Arc<Mutex<Option<HeartbeatMonitor>>>,
    recreate_task: Option<JoinHandle<()>>,
    shared: Arc<Mutex<SharedState>>,
    transport: Arc<dyn Transport>,
    prefix: String,
    stream: String,
    ordered: bool,
}

impl JetStreamSubscription {
    pub async fn start(args: StartArgs) -> Result<(Self, Option<QueuedIterator<Message>>), Error> {
        let raw = args
            .transport
            .subscribe(&args.deliver, None, args.max_messages)
            .await?;

        let shared = Arc::new(Mutex::new(SharedState {
            config: args.config.clone(),
            name: args.name.clone(),
            deliver: args.deliver.clone(),
            ordered_seq: OrderedConsumerSequence::default(),
            last: None,
        }));

        let heartbeat: Arc<Mutex<Option<HeartbeatMonitor>>> = Arc::new(Mutex::new(None));

        let recreate_tx = if args.ordered {
            Some(spawn_recreate_channel())
        } else {
            None
        };

        let mut hooks = FrameHooks::default();

        hooks.on_any_frame = Some(Box::new({
            let heartbeat = heartbeat.clone();
            move || {
                if let Some(hb) = heartbeat.lock().unwrap().as_ref() {
                    hb.work();
                }
            }
        }));

        if args.ordered {
            let tx = recreate_tx.as_ref().unwrap().0.clone();
            hooks.on_data = Some(Box::new({
                let shared = shared.clone();
                move |message: &Message| -> bool { on_ordered_data(&shared, &tx, message) }
            }));

            let tx = recreate_tx.as_ref().unwrap().0.clone();
            hooks.on_heartbeat = Some(Box::new({
                let shared = shared.clone();
                move |last_consumer_seq, _stalled| {
                    shared.lock().unwrap().ordered_seq.heartbeat_count += 1;
                    on_ordered_heartbeat(&shared, &tx, last_consumer_seq);
                }
            }));

            hooks.on_flow_control = Some(Box::new({
                let shared = shared.clone();
                move || {
                    shared.lock().unwrap().ordered_seq.fc_count += 1;
                }
            }));
        }

        hooks.on_status = Some(Box::new({
            let test_hooks = args.test_hooks.clone();
            move |code, description| {
                Some(classify(
                    code,
                    description,
                    ClassifyContext {
                        publish: false,
                        max_waiting_is_terminal: test_hooks.max_waiting_is_terminal(),
                    },
                ))
            }
        }));

        let ack_policy = if args.ordered { AckPolicy::None } else { args.config.ack_policy };
        let (handle, injector, iter) = subscription::spawn(
            raw,
            args.transport.clone(),
            args.callback.clone(),
            ack_policy,
            args.manual_ack,
            hooks,
        );

        let recreate_sender = recreate_tx.as_ref().map(|(tx, _)| tx.clone());

        let recreate_task = if let Some((_, rx)) = recreate_tx {
            Some(tokio::spawn(recreate_loop(
                rx,
                shared.clone(),
                args.transport.clone(),
                args.prefix.clone(),
                args.stream.clone(),
                injector.clone(),
                handle.rebinder(),
            )))
        } else {
            None
        };

        if let Some(interval) = args.config.idle_heartbeat.filter(|d| !d.is_zero()) {
            let monitor = HeartbeatMonitor::new(interval, DEFAULT_MAX_OUT, None, {
                let injector = injector.clone();
                let shared = shared.clone();
                let ordered = args.ordered;
                move |count| {
                    if ordered {
                        let requested = shared.lock().unwrap().ordered_seq.stream_seq + 1;
                        if let Some(tx) = &recreate_sender {
                            let _ = tx.send(requested);
                        }
                        tracing::debug!(count, "ordered consumer missed heartbeats, requesting recreate");
                    } else {
                        injector.inject_terminal(
                            ErrorKind::IdleHeartbeatMissed,
                            format!("missed {count} consecutive heartbeats"),
                        );
                    }
                    true
                }
            });
            *heartbeat.lock().unwrap() = Some(monitor);
        }

        Ok((
            Self {
                handle,
                injector,
                heartbeat,
                recreate_task,
                shared,
                transport: args.transport,
                prefix: args.prefix,
                stream: args.stream,
                ordered: args.ordered,
            },
            iter,
        ))
    }

    pub fn is_ordered(&self) -> bool {
        self.ordered
    }

    pub fn deliver_subject(&self) -> String {
        self.shared.lock().unwrap().deliver.clone()
    }

    pub fn consumer_name(&self) -> String {
        self.shared.lock().unwrap().name.clone()
    }

    /// Number of times the ordered-consumer recreate protocol has run.
    /// Always `0` for a non-ordered subscription.
    pub fn consumer_restarts(&self) -> u64 {
        self.shared.lock().unwrap().ordered_seq.consumer_restarts
    }

    /// Injects a synthetic terminal error, bypassing frame classification
    /// entirely. Used by [`crate::pull_subscription::PullSubscription`] for
    /// conditions it detects itself (`max_bytes` unsupported, bad `expires`).
    pub(crate) fn injector(&self) -> &ErrorInjector {
        &self.injector
    }

    pub(crate) fn handle(&self) -> &TypedSubscriptionHandle {
        &self.handle
    }

    pub(crate) fn heartbeat_cell(&self) -> &Arc<Mutex<Option<HeartbeatMonitor>>> {
        &self.heartbeat
    }

    pub(crate) fn shared_config(&self) -> ConsumerConfig {
        self.shared.lock().unwrap().config.clone()
    }

    /// `{prefix}.CONSUMER.INFO.{stream}.{name}`.
    pub async fn consumer_info(&self) -> Result<ConsumerInfo, Error> {
        let name = self.shared.lock().unwrap().name.clone();
        let info = consumer_info_on(self.transport.as_ref(), &self.prefix, &self.stream, &name).await?;
        self.shared.lock().unwrap().last = Some(info.clone());
        Ok(info)
    }

    /// Drains, then issues `{prefix}.CONSUMER.DELETE.{stream}.{name}`.
    pub async fn destroy(mut self) -> Result<(), Error> {
        if let Some(task) = self.recreate_task.take() {
            task.abort();
        }
        self.heartbeat.lock().unwrap().take();
        let mut raw = self.handle.stop().await;
        let _ = raw.drain().await;
        let name = self.shared.lock().unwrap().name.clone();
        delete_consumer_on(self.transport.as_ref(), &self.prefix, &self.stream, &name).await
    }
}

type RecreateChannel = (mpsc::UnboundedSender<u64>, mpsc::UnboundedReceiver<u64>);

fn spawn_recreate_channel() -> RecreateChannel {
    mpsc::unbounded_channel()
}

/// The ordered-consumer invariant check: compares the delivered message's
/// consumer sequence against the expected next value, triggering a recreate
/// on any gap and otherwise advancing the recorded sequence pair.
fn on_ordered_data(shared: &Mutex<SharedState>, recreate_tx: &mpsc::UnboundedSender<u64>, message: &Message) -> bool {
    let info = match message.info() {
        Ok(info) => info,
        Err(_) => return true,
    };
    let mut state = shared.lock().unwrap();
    let expected = state.ordered_seq.delivery_seq + 1;
    if info.consumer_sequence == expected {
        state.ordered_seq.delivery_seq = info.consumer_sequence;
        state.ordered_seq.stream_seq = info.stream_sequence;
        true
    } else {
        let requested_start_seq = state.ordered_seq.stream_seq + 1;
        drop(state);
        let _ = recreate_tx.send(requested_start_seq);
        false
    }
}

/// Heartbeat handling for ordered consumers: a heartbeat whose
/// `Nats-Last-Consumer` doesn't match our recorded delivery sequence means
/// the server is ahead of what we've seen, so treat it the same as a
/// data-frame gap.
fn on_ordered_heartbeat(shared: &Mutex<SharedState>, recreate_tx: &mpsc::UnboundedSender<u64>, last_consumer_seq: Option<u64>) {
    let Some(last_seq) = last_consumer_seq else { return };
    let mut state = shared.lock().unwrap();
    if last_seq != state.ordered_seq.delivery_seq {
        let requested_start_seq = state.ordered_seq.stream_seq + 1;
        drop(state);
        let _ = recreate_tx.send(requested_start_seq);
    }
}

/// The consumer recreate protocol, serialized through a channel so at most
/// one recreate is ever in flight.
async fn recreate_loop(
    mut rx: mpsc::UnboundedReceiver<u64>,
    shared: Arc<Mutex<SharedState>>,
    transport: Arc<dyn Transport>,
    prefix: String,
    stream: String,
    injector: ErrorInjector,
    rebinder: mpsc::UnboundedSender<String>,
) {
    while let Some(requested_start_seq) = rx.recv().await {
        let new_deliver = transport.new_inbox("");
        let _ = rebinder.send(new_deliver.clone());

        let config_for_rpc = {
            let mut state = shared.lock().unwrap();
            state.ordered_seq.delivery_seq = 0;
            state.ordered_seq.stream_seq = requested_start_seq.saturating_sub(1);
            state.ordered_seq.heartbeat_count = 0;
            state.ordered_seq.fc_count = 0;
            state.ordered_seq.consumer_restarts += 1;
            state.config.deliver_subject = Some(new_deliver.clone());
            state.config.deliver_policy = DeliverPolicy::ByStartSequence;
            state.config.opt_start_seq = Some(requested_start_seq);
            state.deliver = new_deliver.clone();
            state.config.clone()
        };

        match create_consumer_on(transport.as_ref(), &prefix, &stream, config_for_rpc).await {
            Ok(info) => {
                let mut state = shared.lock().unwrap();
                state.name = info.name.clone();
                state.config = info.config.clone();
                state.last = Some(info);
            }
            Err(err) => {
                tracing::warn!(%err, stream, requested_start_seq, "ordered consumer recreate failed");
                injector.inject_terminal(
                    ErrorKind::RequestFailed,
                    format!("consumer recreate for {stream} at stream seq {requested_start_seq} failed: {err}"),
                );
            }
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

    fn consumer_create_reply(name: &str) -> TransportMessage {
        TransportMessage {
            subject: String::new(),
            reply: None,
            headers: None,
            payload: bytes::Bytes::from(format!(
                r#"{{"type":"","stream_name":"ORDERS","name":"{name}","config":{{}},"delivered":{{"consumer_seq":0,"stream_seq":0}},"ack_floor":{{"consumer_seq":0,"stream_seq":0}},"num_ack_pending":0,"num_redelivered":0,"num_waiting":0,"num_pending":0}}"#
            )),
        }
    }

    #[tokio::test]
    async fn ordered_gap_triggers_recreate_and_hides_the_stale_frame() {
        let transport = Arc::new(MockTransport::new());
        let create_calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        transport.set_responder("$JS.API.CONSUMER.CREATE.ORDERS", {
            let create_calls = create_calls.clone();
            move |_| {
                create_calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                Ok(consumer_create_reply("ORDERS-ordered"))
            }
        });

        let args = StartArgs {
            transport: transport.clone(),
            prefix: "$JS.API".into(),
            stream: "ORDERS".into(),
            name: "ORDERS-ordered".into(),
            config: ConsumerConfig {
                ack_policy: AckPolicy::None,
                deliver_subject: Some("deliver.1".into()),
                ..Default::default()
            },
            deliver: "deliver.1".into(),
            ordered: true,
            callback: None,
            manual_ack: true,
            max_messages: None,
            test_hooks: TestHooks::new(),
        };

        let (sub, iter) = JetStreamSubscription::start(args).await.unwrap();
        let mut iter = iter.unwrap();

        transport
            .push_data("deliver.1", "$JS.ACK.ORDERS.ORDERS-ordered.1.1.1.0.0", b"first")
            .await;
        let msg = iter.next().await.unwrap().unwrap();
        assert_eq!(msg.payload.as_ref(), b"first");

        // Skips consumer_sequence 2 straight to 5: a gap.
        transport
            .push_data("deliver.1", "$JS.ACK.ORDERS.ORDERS-ordered.1.5.5.0.0", b"gap")
            .await;

        // Give the recreate task a chance to run and rebind.
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;

        assert!(create_calls.load(std::sync::atomic::Ordering::SeqCst) >= 1);
        assert_eq!(sub.consumer_name(), "ORDERS-ordered");
        assert_eq!(sub.consumer_restarts(), 1);

        drop(sub);
    }

    #[tokio::test]
    async fn non_ordered_missed_heartbeat_injects_terminal_error() {
        let transport = Arc::new(MockTransport::new());

        let args = StartArgs {
            transport: transport.clone(),
            prefix: "$JS.API".into(),
            stream: "ORDERS".into(),
            name: "processor".into(),
            config: ConsumerConfig {
                ack_policy: AckPolicy::Explicit,
                deliver_subject: Some("deliver.2".into()),
                idle_heartbeat: Some(Duration::from_millis(10)),
                ..Default::default()
            },
            deliver: "deliver.2".into(),
            ordered: false,
            callback: None,
            manual_ack: true,
            max_messages: None,
            test_hooks: TestHooks::new(),
        };

        let (sub, iter) = JetStreamSubscription::start(args).await.unwrap();
        let mut iter = iter.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        let err = iter.next().await.unwrap().unwrap_err();
        assert_eq!(err.kind(), Some(ErrorKind::IdleHeartbeatMissed));

        drop(sub);
    }

    #[tokio::test]
    async fn destroy_issues_consumer_delete() {
        let transport = Arc::new(MockTransport::new());
        let delete_calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        transport.set_responder("$JS.API.CONSUMER.DELETE.ORDERS.processor", {
            let delete_calls = delete_calls.clone();
            move |_| {
                delete_calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                Ok(TransportMessage {
                    subject: String::new(),
                    reply: None,
                    headers: Some(HeaderMap::with_status(200, "OK")),
                    payload: bytes::Bytes::new(),
                })
            }
        });

        let args = StartArgs {
            transport: transport.clone(),
            prefix: "$JS.API".into(),
            stream: "ORDERS".into(),
            name: "processor".into(),
            config: ConsumerConfig {
                ack_policy: AckPolicy::Explicit,
                deliver_subject: Some("deliver.3".into()),
                ..Default::default()
            },
            deliver: "deliver.3".into(),
            ordered: false,
            callback: None,
            manual_ack: true,
            max_messages: None,
            test_hooks: TestHooks::new(),
        };

        let (sub, _iter) = JetStreamSubscription::start(args).await.unwrap();
        sub.destroy().await.unwrap();
        assert_eq!(delete_calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}

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
//! The typed subscription: adapts a raw transport subscription into a
//! stream of [`Message`]s, replying to flow-control frames, routing
//! heartbeats and status frames to the owner's hooks, and auto-acking on
//! yield when the consumer's ack policy calls for it.
//!
//! This module deliberately knows nothing about ordered consumers or pull
//! semantics; that's [`crate::jetstream_subscription`] and
//! [`crate::pull_subscription`], layered on top via the [`FrameHooks`]
//! callbacks so the ingress loop itself stays branch-light.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;

use crate::consumer::AckPolicy;
use crate::error::{classify, Classification, ClassifyContext};
use crate::header::names;
use crate::iterator::{queued_iterator, QueuedIterator, QueuedIteratorHandle};
use crate::message::{Message, MessageCallback};
use crate::transport::{RawSubscription, Transport, TransportMessage};
use crate::Error;

/// One decoded frame off the wire.
enum Frame {
    Data,
    FlowControl { reply: String },
    Heartbeat { last_consumer_seq: Option<u64>, stalled: Option<String> },
    /// A 100 that's neither flow control nor heartbeat: logged at debug
    /// and otherwise ignored.
    UnknownProtocol,
    Status { code: u16, description: String },
}

fn classify_frame(raw: &TransportMessage) -> Frame {
    let Some(headers) = raw.headers.as_ref() else {
        return Frame::Data;
    };
    let Some(status) = headers.status() else {
        return Frame::Data;
    };
    if status.code == 100 {
        if status.description.contains("Idle Heartbeat") {
            let last_consumer_seq = headers
                .get(names::NATS_LAST_CONSUMER)
                .and_then(|v| v.parse().ok());
            let stalled = headers.get(names::NATS_CONSUMER_STALLED).map(String::from);
            return Frame::Heartbeat {
                last_consumer_seq,
                stalled,
            };
        }
        if let Some(reply) = raw.reply.clone() {
            return Frame::FlowControl { reply };
        }
        return Frame::UnknownProtocol;
    }
    Frame::Status {
        code: status.code,
        description: status.description.clone(),
    }
}

/// Per-frame hooks a JetStream-specific layer installs on top of the
/// generic typed subscription. All are optional; a plain typed subscription
/// with no hooks still replies to flow control and (if configured) auto-acks.
#[derive(Default)]
pub struct FrameHooks {
    /// Runs once per frame of any kind, before type-specific handling.
    /// Used to reset the idle-heartbeat monitor (`work()`).
    pub on_any_frame: Option<Box<dyn FnMut() + Send>>,
    /// Runs for `Data` frames. Returning `false` suppresses delivery to the
    /// application (used by ordered-consumer gap handling, which may decide
    /// a frame belongs to a consumer generation it just discarded).
    pub on_data: Option<Box<dyn FnMut(&Message) -> bool + Send>>,
    /// Runs for `Heartbeat` frames, receiving the `Nats-Last-Consumer`
    /// sequence and any `Nats-Consumer-Stalled` subject.
    pub on_heartbeat: Option<Box<dyn FnMut(Option<u64>, Option<&str>) + Send>>,
    /// Runs for `FlowControl` frames, after the automatic reply is sent.
    pub on_flow_control: Option<Box<dyn FnMut() + Send>>,
    /// Runs for non-heartbeat status frames (404/408/409/503/other),
    /// classifying and deciding whether/how the event reaches the
    /// application. Returning `None` suppresses it entirely (already
    /// handled internally, e.g. folded into a consumer recreate).
    pub on_status: Option<Box<dyn FnMut(u16, &str) -> Option<Classification> + Send>>,
}

#[derive(Clone)]
enum Sink {
    Iterator(QueuedIteratorHandle<Message>),
    Callback(MessageCallback),
}

/// A clonable handle that can push a synthetic terminal error straight into
/// a subscription's delivery pipeline, bypassing frame classification. Used
/// by the idle-heartbeat monitor's miss handler to inject a synthetic
/// `IdleHeartbeatMissed` error, since that handler fires off the
/// subscription's own ingress task.
#[derive(Clone)]
pub struct ErrorInjector(Sink);

impl ErrorInjector {
    pub fn inject_terminal(&self, kind: crate::error::ErrorKind, message: impl Into<String>) {
        self.0
            .deliver_classified(Classification::Terminal(kind), &message.into());
    }

    /// Ends the iterator cleanly, as if the source had run dry. A no-op in
    /// callback mode, which has no notion of "the stream is done" beyond the
    /// caller choosing to stop polling. Used by `fetch` to close out a batch
    /// as soon as its stop condition is reached, without waiting for the
    /// underlying subscription to end on its own.
    pub fn close(&self) {
        if let Sink::Iterator(handle) = &self.0 {
            handle.stop(None);
        }
    }
}

impl Sink {
    fn deliver_data(&self, message: Message) {
        match self {
            Sink::Iterator(handle) => handle.push(message),
            Sink::Callback(cb) => cb(Ok(message)),
        }
    }

    /// The iterator adapter hides non-terminal errors; the callback
    /// adapter surfaces every classified error unchanged.
    fn deliver_classified(&self, classification: Classification, description: &str) {
        match classification {
            Classification::None => {}
            Classification::Transient(kind) => {
                if let Sink::Callback(cb) = self {
                    cb(Err(Error::server(kind, description.to_string())));
                }
            }
            Classification::Terminal(kind) => {
                let err = Error::server(kind, description.to_string());
                match self {
                    Sink::Iterator(handle) => handle.stop(Some(err)),
                    Sink::Callback(cb) => cb(Err(err)),
                }
            }
        }
    }
}

/// Handle to a live typed subscription: rebind it (ordered-consumer
/// recreate) or tear it down.
pub struct TypedSubscriptionHandle {
    rebind_tx: mpsc::UnboundedSender<String>,
    stopped: Arc<AtomicBool>,
    stop_notify: Arc<Notify>,
    task: JoinHandle<Box<dyn RawSubscription>>,
}

impl TypedSubscriptionHandle {
    /// Rebinds the underlying raw subscription to listen on `new_subject`
    /// instead.
    pub fn rebind(&self, new_subject: impl Into<String>) {
        let _ = self.rebind_tx.send(new_subject.into());
    }

    /// A cloneable sender equivalent to [`Self::rebind`], for handing rebind
    /// capability to a task that outlives a `&self` borrow (the ordered
    /// consumer recreate task in [`crate::jetstream_subscription`]).
    pub(crate) fn rebinder(&self) -> mpsc::UnboundedSender<String> {
        self.rebind_tx.clone()
    }

    /// Stops the pump loop. Draining/unsubscribing the raw subscription is
    /// the caller's responsibility once this returns, since only the
    /// caller knows whether a drain or a hard unsubscribe is wanted. Wakes
    /// the loop immediately even if it's currently blocked waiting on the
    /// next frame.
    pub async fn stop(self) -> Box<dyn RawSubscription> {
        self.stopped.store(true, Ordering::SeqCst);
        self.stop_notify.notify_one();
        self.task.await.unwrap_or_else(|_| panic!("subscription pump task panicked"))
    }
}

/// Spawns the ingress pump for one subscription and, for iterator-mode
/// subscriptions, returns the consumer-facing stream.
pub fn spawn(
    raw: Box<dyn RawSubscription>,
    transport: Arc<dyn Transport>,
    callback: Option<MessageCallback>,
    ack_policy: AckPolicy,
    manual_ack: bool,
    hooks: FrameHooks,
) -> (TypedSubscriptionHandle, ErrorInjector, Option<QueuedIterator<Message>>) {
    let (rebind_tx, rebind_rx) = mpsc::unbounded_channel();
    let stopped = Arc::new(AtomicBool::new(false));
    let stop_notify = Arc::new(Notify::new());

    let (sink, consumer_iter) = match callback {
        Some(cb) => (Sink::Callback(cb), None),
        None => {
            let (handle, mut iter) = queued_iterator::<Message>();
            if ack_policy != AckPolicy::None && !manual_ack {
                iter.set_dispatched(move |message| {
                    if let Some(message) = message {
                        let message = message.clone();
                        tokio::spawn(async move {
                            if let Err(err) = message.ack().await {
                                tracing::warn!(%err, "auto-ack failed");
                            }
                        });
                    }
                });
            }
            (Sink::Iterator(handle), Some(iter))
        }
    };

    let injector = ErrorInjector(sink.clone());

    let stopped_task = stopped.clone();
    let stop_notify_task = stop_notify.clone();
    let task = tokio::spawn(pump(raw, transport, rebind_rx, sink, hooks, stopped_task, stop_notify_task));

    (
        TypedSubscriptionHandle {
            rebind_tx,
            stopped,
            stop_notify,
            task,
        },
        injector,
        consumer_iter,
    )
}

async fn pump(
    mut raw: Box<dyn RawSubscription>,
    transport: Arc<dyn Transport>,
    mut rebind_rx: mpsc::UnboundedReceiver<String>,
    sink: Sink,
    mut hooks: FrameHooks,
    stopped: Arc<AtomicBool>,
    stop_notify: Arc<Notify>,
) -> Box<dyn RawSubscription> {
    loop {
        if stopped.load(Ordering::SeqCst) {
            break;
        }
        tokio::select! {
            biased;
            _ = stop_notify.notified() => {
                break;
            }
            new_subject = rebind_rx.recv() => {
                match new_subject {
                    Some(subject) => {
                        if let Err(err) = raw.rebind(&subject).await {
                            tracing::warn!(%err, subject, "failed to rebind subscription");
                        }
                    }
                    None => continue,
                }
            }
            next = raw.next() => {
                let Some(raw_msg) = next else { break };
                if let Some(on_any) = hooks.on_any_frame.as_mut() {
                    on_any();
                }
                match classify_frame(&raw_msg) {
                    Frame::Data => {
                        let message = Message {
                            subject: raw_msg.subject,
                            reply: raw_msg.reply,
                            headers: raw_msg.headers,
                            payload: raw_msg.payload,
                            transport: transport.clone(),
                        };
                        let keep = hooks
                            .on_data
                            .as_mut()
                            .map(|f| f(&message))
                            .unwrap_or(true);
                        if keep {
                            sink.deliver_data(message);
                        }
                    }
                    Frame::FlowControl { reply } => {
                        if let Err(err) = transport.publish(&reply, Bytes::new(), None, None).await {
                            tracing::warn!(%err, "failed to reply to flow control request");
                        }
                        if let Some(on_fc) = hooks.on_flow_control.as_mut() {
                            on_fc();
                        }
                    }
                    Frame::Heartbeat { last_consumer_seq, stalled } => {
                        if let Some(on_hb) = hooks.on_heartbeat.as_mut() {
                            on_hb(last_consumer_seq, stalled.as_deref());
                        }
                        if let Some(subject) = stalled {
                            if let Err(err) = transport.publish(&subject, Bytes::new(), None, None).await {
                                tracing::warn!(%err, subject, "failed to unstall consumer");
                            }
                        }
                    }
                    Frame::UnknownProtocol => {
                        tracing::debug!("ignoring unrecognized protocol frame");
                    }
                    Frame::Status { code, description } => {
                        let classification = match hooks.on_status.as_mut() {
                            Some(f) => f(code, &description),
                            None => Some(classify(code, &description, ClassifyContext::default())),
                        };
                        if let Some(classification) = classification {
                            sink.deliver_classified(classification, &description);
                        }
                    }
                }
            }
        }
    }
    raw
}

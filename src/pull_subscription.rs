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
//! Pull subscription: extends [`JetStreamSubscription`] with the explicit
//! `pull` operation. Everything else (flow control, idle-heartbeat wiring,
//! destroy/info RPCs) is inherited unchanged; a pull subscription is never
//! ordered, so none of the gap-detection machinery in
//! [`crate::jetstream_subscription`] engages for it.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::error::ErrorKind;
use crate::heartbeat::{HeartbeatMonitor, DEFAULT_MAX_OUT};
use crate::jetstream_subscription::{JetStreamSubscription, StartArgs};
use crate::message::Message;
use crate::stream::encode_json;
use crate::transport::{Feature, Transport};
use crate::Error;

/// The body of a `CONSUMER.MSG.NEXT` request.
#[derive(Serialize)]
pub(crate) struct PullRequest {
    pub batch: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub no_wait: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_bytes: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idle_heartbeat: Option<u64>,
}

/// Per-`pull` options.
#[derive(Debug, Clone, Default)]
pub struct PullOptions {
    pub batch: usize,
    pub no_wait: bool,
    pub max_bytes: Option<usize>,
    pub expires: Option<Duration>,
    pub idle_heartbeat: Option<Duration>,
}

/// A pull subscription: a [`JetStreamSubscription`] plus the explicit
/// request a pull consumer needs before the server sends anything at all.
pub struct PullSubscription {
    jetstream: JetStreamSubscription,
    transport: Arc<dyn Transport>,
    prefix: String,
    stream: String,
}

impl PullSubscription {
    pub async fn start(args: StartArgs) -> Result<(Self, Option<crate::iterator::QueuedIterator<Message>>), Error> {
        let transport = args.transport.clone();
        let prefix = args.prefix.clone();
        let stream = args.stream.clone();
        let (jetstream, iter) = JetStreamSubscription::start(args).await?;
        Ok((
            Self {
                jetstream,
                transport,
                prefix,
                stream,
            },
            iter,
        ))
    }

    /// Requests up to `opts.batch` messages (or `opts.max_bytes` worth) from
    /// the server on this subscription's deliver inbox.
    pub async fn pull(&self, opts: PullOptions) -> Result<(), Error> {
        if let Some(max_bytes) = opts.max_bytes {
            if max_bytes > 0 && !self.transport.supports_feature(Feature::PullMaxBytes) {
                return Err(Error::server(
                    ErrorKind::RequestFailed,
                    "server does not support max_bytes pull requests",
                ));
            }
        }

        let idle_heartbeat = opts.idle_heartbeat.filter(|d| !d.is_zero());
        if let Some(hb) = idle_heartbeat {
            match opts.expires {
                Some(expires) if expires > hb => {}
                _ => {
                    return Err(Error::Config(
                        "idle_heartbeat on a pull requires expires > idle_heartbeat".into(),
                    ))
                }
            }
        }

        // Cancel any prior heartbeat monitor on each pull.
        self.jetstream.heartbeat_cell().lock().unwrap().take();
        if let (Some(expires), Some(hb)) = (opts.expires, idle_heartbeat) {
            let injector = self.jetstream.injector().clone();
            let monitor = HeartbeatMonitor::new(hb, DEFAULT_MAX_OUT, Some(expires), move |count| {
                injector.inject_terminal(
                    ErrorKind::IdleHeartbeatMissed,
                    format!("missed {count} consecutive heartbeats during pull"),
                );
                true
            });
            *self.jetstream.heartbeat_cell().lock().unwrap() = Some(monitor);
        }

        let body = PullRequest {
            batch: opts.batch,
            no_wait: opts.no_wait.then_some(true),
            max_bytes: opts.max_bytes.filter(|&b| b > 0),
            expires: opts.expires.map(|d| d.as_nanos() as u64),
            idle_heartbeat: idle_heartbeat.map(|d| d.as_nanos() as u64),
        };
        let payload = encode_json(&body)?;
        let subject = format!(
            "{}.CONSUMER.MSG.NEXT.{}.{}",
            self.prefix,
            self.stream,
            self.jetstream.consumer_name()
        );
        self.transport
            .publish(&subject, payload, Some(self.jetstream.deliver_subject()), None)
            .await
    }

    pub async fn consumer_info(&self) -> Result<crate::consumer::ConsumerInfo, Error> {
        self.jetstream.consumer_info().await
    }

    pub async fn destroy(self) -> Result<(), Error> {
        self.jetstream.destroy().await
    }
}

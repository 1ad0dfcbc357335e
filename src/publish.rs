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
//! Publish with optimistic-concurrency expectation headers and bounded
//! 503-only retry.

use std::time::Duration;

use bytes::Bytes;
use serde::Deserialize;

use crate::error::{classify, Classification, ClassifyContext};
use crate::header::{names, HeaderMap};
use crate::transport::Transport;
use crate::Error;

pub const DEFAULT_PUBLISH_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_RETRIES: usize = 1;
const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(250);

/// Per-call publish options.
#[derive(Debug, Clone)]
pub struct PublishOptions {
    /// `Nats-Msg-Id`: idempotency key for broker-side dedup.
    pub msg_id: Option<String>,
    /// `Nats-Expected-Stream`.
    pub expected_stream: Option<String>,
    /// `Nats-Expected-Last-Msg-Id`.
    pub expected_last_msg_id: Option<String>,
    /// `Nats-Expected-Last-Sequence`.
    pub expected_last_sequence: Option<u64>,
    /// `Nats-Expected-Last-Subject-Sequence`.
    pub expected_last_subject_sequence: Option<u64>,
    /// Total request attempts; only a 503 reply burns one without ending the
    /// call. Up to `retries` attempts total, and only 503 is retried.
    pub retries: usize,
    pub retry_delay: Duration,
    pub timeout: Duration,
}

impl Default for PublishOptions {
    fn default() -> Self {
        Self {
            msg_id: None,
            expected_stream: None,
            expected_last_msg_id: None,
            expected_last_sequence: None,
            expected_last_subject_sequence: None,
            retries: DEFAULT_RETRIES,
            retry_delay: DEFAULT_RETRY_DELAY,
            timeout: DEFAULT_PUBLISH_TIMEOUT,
        }
    }
}

fn build_headers(extra: Option<HeaderMap>, opts: &PublishOptions) -> Option<HeaderMap> {
    let mut headers = extra.unwrap_or_default();
    if let Some(id) = &opts.msg_id {
        headers.insert(names::NATS_MSG_ID, id.clone());
    }
    if let Some(stream) = &opts.expected_stream {
        headers.insert(names::NATS_EXPECTED_STREAM, stream.clone());
    }
    if let Some(id) = &opts.expected_last_msg_id {
        headers.insert(names::NATS_EXPECTED_LAST_MSG_ID, id.clone());
    }
    if let Some(seq) = opts.expected_last_sequence {
        headers.insert(names::NATS_EXPECTED_LAST_SEQUENCE, seq.to_string());
    }
    if let Some(seq) = opts.expected_last_subject_sequence {
        headers.insert(names::NATS_EXPECTED_LAST_SUBJECT_SEQUENCE, seq.to_string());
    }
    if headers.is_empty() {
        None
    } else {
        Some(headers)
    }
}

/// The broker's response to a JetStream publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PubAck {
    pub stream: String,
    pub seq: u64,
    pub duplicate: bool,
}

#[derive(Deserialize)]
struct RawPubAck {
    #[serde(default)]
    stream: String,
    #[serde(default)]
    seq: u64,
    #[serde(default)]
    duplicate: bool,
}

fn parse_pub_ack(payload: &Bytes) -> Result<PubAck, Error> {
    let raw: RawPubAck = serde_json::from_slice(payload)
        .map_err(|err| Error::InvalidAck(format!("malformed publish ack: {err}")))?;
    if raw.stream.is_empty() {
        return Err(Error::InvalidAck("ack carried an empty stream name".into()));
    }
    Ok(PubAck {
        stream: raw.stream,
        seq: raw.seq,
        duplicate: raw.duplicate,
    })
}

/// Publishes `payload` to `subject` with expectation headers and a 503-only
/// retry loop.
pub async fn publish(
    transport: &dyn Transport,
    subject: &str,
    payload: Bytes,
    extra_headers: Option<HeaderMap>,
    opts: &PublishOptions,
) -> Result<PubAck, Error> {
    let headers = build_headers(extra_headers, opts);
    let attempts = opts.retries.max(1);

    for attempt in 0..attempts {
        let reply = transport
            .request(subject, payload.clone(), headers.clone(), opts.timeout)
            .await?;

        if let Some(status) = reply.headers.as_ref().and_then(|h| h.status()) {
            let classification = classify(
                status.code,
                &status.description,
                ClassifyContext {
                    publish: true,
                    ..Default::default()
                },
            );
            match classification {
                Classification::Transient(kind) => {
                    if attempt + 1 < attempts {
                        tracing::debug!(attempt, %kind, "publish got a retryable status, retrying");
                        tokio::time::sleep(opts.retry_delay).await;
                        continue;
                    }
                    return Err(Error::server(kind, status.description.clone()));
                }
                Classification::Terminal(kind) => {
                    return Err(Error::server(kind, status.description.clone()));
                }
                Classification::None => {}
            }
        }

        return parse_pub_ack(&reply.payload);
    }

    unreachable!("attempts is always >= 1, loop always returns")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockTransport;
    use crate::transport::TransportMessage;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn ack_reply(stream: &str, seq: u64) -> TransportMessage {
        TransportMessage {
            subject: String::new(),
            reply: None,
            headers: None,
            payload: Bytes::from(format!(r#"{{"stream":"{stream}","seq":{seq}}}"#)),
        }
    }

    #[tokio::test]
    async fn succeeds_on_first_try() {
        let transport = MockTransport::new();
        transport.set_responder("ORDERS.in", |_payload| Ok(ack_reply("ORDERS", 1)));

        let ack = publish(&transport, "ORDERS.in", Bytes::from_static(b"hi"), None, &PublishOptions::default())
            .await
            .unwrap();
        assert_eq!(ack.stream, "ORDERS");
        assert_eq!(ack.seq, 1);
        assert!(!ack.duplicate);
    }

    #[tokio::test]
    async fn retries_once_on_503_then_succeeds() {
        let transport = MockTransport::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_cb = calls.clone();
        transport.set_responder("ORDERS.in", move |_payload| {
            let n = calls_cb.fetch_add(1, Ordering::SeqCst);
            if n == 0 {
                Ok(TransportMessage {
                    subject: String::new(),
                    reply: None,
                    headers: Some(HeaderMap::with_status(503, "No Responders")),
                    payload: Bytes::new(),
                })
            } else {
                Ok(ack_reply("ORDERS", 2))
            }
        });

        let opts = PublishOptions {
            retries: 2,
            retry_delay: Duration::from_millis(1),
            ..Default::default()
        };
        let ack = publish(&transport, "ORDERS.in", Bytes::from_static(b"hi"), None, &opts)
            .await
            .unwrap();
        assert_eq!(ack.seq, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn non_503_failure_is_not_retried() {
        let transport = MockTransport::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_cb = calls.clone();
        transport.set_responder("ORDERS.in", move |_payload| {
            calls_cb.fetch_add(1, Ordering::SeqCst);
            Ok(TransportMessage {
                subject: String::new(),
                reply: None,
                headers: Some(HeaderMap::with_status(409, "Consumer Deleted")),
                payload: Bytes::new(),
            })
        });

        let opts = PublishOptions {
            retries: 3,
            retry_delay: Duration::from_millis(1),
            ..Default::default()
        };
        let err = publish(&transport, "ORDERS.in", Bytes::from_static(b"hi"), None, &opts)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("ConsumerDeleted"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn empty_stream_in_ack_is_invalid_ack() {
        let transport = MockTransport::new();
        transport.set_responder("ORDERS.in", |_payload| Ok(ack_reply("", 0)));

        let err = publish(&transport, "ORDERS.in", Bytes::from_static(b"hi"), None, &PublishOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidAck(_)));
    }

    #[test]
    fn expectation_headers_are_built() {
        let opts = PublishOptions {
            msg_id: Some("abc".into()),
            expected_last_sequence: Some(9),
            ..Default::default()
        };
        let headers = build_headers(None, &opts).unwrap();
        assert_eq!(headers.get(names::NATS_MSG_ID), Some("abc"));
        assert_eq!(headers.get(names::NATS_EXPECTED_LAST_SEQUENCE), Some("9"));
    }
}

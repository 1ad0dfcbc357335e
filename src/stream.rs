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
//! A handle to a JetStream stream and its consumers. The `Context`/`Stream`
//! split mirrors the real JetStream API so `subscribe`/`pull_subscribe`/
//! `fetch` have something realistic to bind against.
//!
//! Stream management itself (ADD/INFO beyond what's needed to resolve a
//! consumer) is out of scope; [`StreamConfig`]/[`StreamInfo`] carry only the
//! fields this crate's consumer flows touch.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::consumer::{ConsumerConfig, ConsumerInfo};
use crate::error::{classify, ClassifyContext, ErrorKind};
use crate::transport::{Transport, TransportMessage};
use crate::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageType {
    File,
    Memory,
}

impl Default for StorageType {
    fn default() -> Self {
        StorageType::File
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamConfig {
    pub name: String,
    pub subjects: Vec<String>,
    pub max_msgs: Option<i64>,
    pub max_bytes: Option<i64>,
    #[serde(with = "serde_nanos", skip_serializing_if = "Option::is_none", default)]
    pub max_age: Option<Duration>,
    #[serde(default)]
    pub storage: StorageType,
    #[serde(default)]
    pub num_replicas: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamState {
    pub messages: u64,
    pub bytes: u64,
    pub first_seq: u64,
    pub last_seq: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamInfo {
    pub config: StreamConfig,
    #[serde(default)]
    pub state: StreamState,
}

/// A bound stream: owns nothing server-side, just the name, transport, and
/// API prefix needed to issue consumer RPCs scoped to it.
pub struct Stream {
    transport: Arc<dyn Transport>,
    prefix: String,
    pub info: StreamInfo,
}

impl Stream {
    pub(crate) fn new(transport: Arc<dyn Transport>, prefix: String, info: StreamInfo) -> Self {
        Self { transport, prefix, info }
    }

    pub fn name(&self) -> &str {
        &self.info.config.name
    }

    /// `{prefix}.CONSUMER.INFO.{stream}.{name}`.
    pub async fn get_consumer(&self, name: &str) -> Result<ConsumerInfo, Error> {
        consumer_info_on(self.transport.as_ref(), &self.prefix, self.name(), name).await
    }

    /// `{prefix}.CONSUMER.CREATE.{stream}`, adopting the server's assigned
    /// name and normalized config from the response.
    pub async fn create_consumer(&self, config: ConsumerConfig) -> Result<ConsumerInfo, Error> {
        create_consumer_on(self.transport.as_ref(), &self.prefix, self.name(), config).await
    }

    /// `{prefix}.CONSUMER.DELETE.{stream}.{name}`.
    pub async fn delete_consumer(&self, name: &str) -> Result<(), Error> {
        delete_consumer_on(self.transport.as_ref(), &self.prefix, self.name(), name).await
    }

    pub async fn refresh(&mut self) -> Result<(), Error> {
        let subject = format!("{}.STREAM.INFO.{}", self.prefix, self.name());
        let reply = self
            .transport
            .request(&subject, Bytes::new(), None, Duration::from_secs(5))
            .await?;
        check_status(&reply)?;
        self.info = decode_json(&reply.payload)?;
        Ok(())
    }
}

/// Turns a non-2xx status frame on an RPC reply into a classified [`Error`],
/// so callers can distinguish e.g. "consumer not found" (404) from a genuine
/// transport/decode failure instead of falling through to [`decode_json`]
/// and getting an opaque parse error either way.
pub(crate) fn check_status(reply: &TransportMessage) -> Result<(), Error> {
    if let Some(status) = reply.headers.as_ref().and_then(|h| h.status()) {
        if !(200..=299).contains(&status.code) {
            let classification = classify(status.code, &status.description, ClassifyContext::default());
            let kind = classification.kind().unwrap_or(ErrorKind::Unknown);
            return Err(Error::server(kind, status.description.clone()));
        }
    }
    Ok(())
}

#[derive(Serialize, Deserialize)]
struct ConsumerCreateRequest {
    stream_name: String,
    config: ConsumerConfig,
}

/// `{prefix}.CONSUMER.INFO.{stream}.{name}`, usable without a bound
/// [`Stream`] handle. [`crate::context::Context::process_options`] needs it
/// before it knows whether it has one.
pub(crate) async fn consumer_info_on(
    transport: &dyn Transport,
    prefix: &str,
    stream: &str,
    name: &str,
) -> Result<ConsumerInfo, Error> {
    let subject = format!("{prefix}.CONSUMER.INFO.{stream}.{name}");
    let reply = transport
        .request(&subject, Bytes::new(), None, Duration::from_secs(5))
        .await?;
    check_status(&reply)?;
    decode_json(&reply.payload)
}

/// `{prefix}.CONSUMER.CREATE.{stream}`, shared by [`Stream::create_consumer`],
/// [`crate::context::Context::maybe_create_consumer`] and the ordered-consumer
/// recreate protocol.
pub(crate) async fn create_consumer_on(
    transport: &dyn Transport,
    prefix: &str,
    stream: &str,
    config: ConsumerConfig,
) -> Result<ConsumerInfo, Error> {
    let subject = format!("{prefix}.CONSUMER.CREATE.{stream}");
    let body = encode_json(&ConsumerCreateRequest {
        stream_name: stream.to_string(),
        config,
    })?;
    let reply = transport.request(&subject, body, None, Duration::from_secs(5)).await?;
    check_status(&reply)?;
    decode_json(&reply.payload)
}

/// `{prefix}.CONSUMER.DELETE.{stream}.{name}`.
pub(crate) async fn delete_consumer_on(
    transport: &dyn Transport,
    prefix: &str,
    stream: &str,
    name: &str,
) -> Result<(), Error> {
    let subject = format!("{prefix}.CONSUMER.DELETE.{stream}.{name}");
    let reply = transport
        .request(&subject, Bytes::new(), None, Duration::from_secs(5))
        .await?;
    check_status(&reply)?;
    Ok(())
}

pub(crate) fn encode_json<T: Serialize>(value: &T) -> Result<Bytes, Error> {
    serde_json::to_vec(value)
        .map(Bytes::from)
        .map_err(|err| Error::Transport(format!("failed to encode request: {err}")))
}

pub(crate) fn decode_json<T: serde::de::DeserializeOwned>(payload: &Bytes) -> Result<T, Error> {
    serde_json::from_slice(payload).map_err(|err| Error::Transport(format!("failed to decode reply: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockTransport;
    use crate::transport::TransportMessage;

    fn stream(transport: Arc<MockTransport>) -> Stream {
        Stream::new(
            transport,
            "$JS.API".to_string(),
            StreamInfo {
                config: StreamConfig {
                    name: "ORDERS".into(),
                    subjects: vec!["orders.*".into()],
                    ..Default::default()
                },
                ..Default::default()
            },
        )
    }

    #[tokio::test]
    async fn get_consumer_hits_the_expected_subject() {
        let transport = Arc::new(MockTransport::new());
        transport.set_responder("$JS.API.CONSUMER.INFO.ORDERS.processor", |_| {
            Ok(TransportMessage {
                subject: String::new(),
                reply: None,
                headers: None,
                payload: Bytes::from(
                    r#"{"type":"","stream_name":"ORDERS","name":"processor","config":{},"delivered":{"consumer_seq":0,"stream_seq":0},"ack_floor":{"consumer_seq":0,"stream_seq":0},"num_ack_pending":0,"num_redelivered":0,"num_waiting":0,"num_pending":0}"#,
                ),
            })
        });

        let s = stream(transport);
        let info = s.get_consumer("processor").await.unwrap();
        assert_eq!(info.name, "processor");
        assert_eq!(info.stream_name, "ORDERS");
    }

    #[tokio::test]
    async fn create_consumer_sends_stream_name_and_config() {
        let transport = Arc::new(MockTransport::new());
        transport.set_responder("$JS.API.CONSUMER.CREATE.ORDERS", |payload| {
            let req: ConsumerCreateRequest = decode_json(&payload)?;
            assert_eq!(req.stream_name, "ORDERS");
            Ok(TransportMessage {
                subject: String::new(),
                reply: None,
                headers: None,
                payload: Bytes::from(format!(
                    r#"{{"type":"","stream_name":"ORDERS","name":"generated","config":{{}},"delivered":{{"consumer_seq":0,"stream_seq":0}},"ack_floor":{{"consumer_seq":0,"stream_seq":0}},"num_ack_pending":0,"num_redelivered":0,"num_waiting":0,"num_pending":0}}"#
                )),
            })
        });

        let s = stream(transport);
        let info = s.create_consumer(ConsumerConfig::default()).await.unwrap();
        assert_eq!(info.name, "generated");
    }

    #[tokio::test]
    async fn consumer_info_reports_not_found_as_a_classified_error_not_a_decode_failure() {
        let transport = Arc::new(MockTransport::new());
        transport.set_responder("$JS.API.CONSUMER.INFO.ORDERS.missing", |_| {
            Ok(TransportMessage {
                subject: String::new(),
                reply: None,
                headers: Some(crate::header::HeaderMap::with_status(404, "Consumer Not Found")),
                payload: Bytes::new(),
            })
        });

        let err = consumer_info_on(transport.as_ref(), "$JS.API", "ORDERS", "missing")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), Some(ErrorKind::NoMessages));
    }

    #[tokio::test]
    async fn consumer_info_propagates_other_status_errors_without_treating_them_as_not_found() {
        let transport = Arc::new(MockTransport::new());
        transport.set_responder("$JS.API.CONSUMER.INFO.ORDERS.a", |_| {
            Ok(TransportMessage {
                subject: String::new(),
                reply: None,
                headers: Some(crate::header::HeaderMap::with_status(503, "No Responders")),
                payload: Bytes::new(),
            })
        });

        let err = consumer_info_on(transport.as_ref(), "$JS.API", "ORDERS", "a")
            .await
            .unwrap_err();
        assert_ne!(err.kind(), Some(ErrorKind::NoMessages));
    }
}

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
//! The boundary between this crate and the underlying messaging transport.
//!
//! Subject-based publish/subscribe, request/reply, inbox allocation,
//! connection lifecycle, and header codec are all reached exclusively
//! through [`Transport`]. A real client wires this to its connection; tests
//! wire it to [`crate::mock::MockTransport`].

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::header::HeaderMap;
use crate::Error;

/// A single message observed on a subject, either pushed by the server or
/// received as the reply to a request.
#[derive(Debug, Clone)]
pub struct TransportMessage {
    pub subject: String,
    pub reply: Option<String>,
    pub headers: Option<HeaderMap>,
    pub payload: Bytes,
}

/// Server-side feature flags the client needs to gate behavior on: a pull
/// request's `max_bytes` requires server support.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Feature {
    PullMaxBytes,
    MultiSubjectFilter,
}

/// A live subscription on one subject, as handed back by
/// [`Transport::subscribe`].
#[async_trait]
pub trait RawSubscription: Send + Sync {
    /// Pulls the next message, or `None` once the subscription has ended
    /// (unsubscribed, `max` reached, or the connection dropped it).
    async fn next(&mut self) -> Option<TransportMessage>;

    /// Stops delivering new messages but lets buffered ones drain.
    async fn drain(&mut self) -> Result<(), Error>;

    /// Stops delivery immediately.
    async fn unsubscribe(&mut self) -> Result<(), Error>;

    /// Rebinds this subscription to listen on a different subject, used by
    /// ordered-consumer recreate instead of tearing down and re-subscribing,
    /// so in-flight frames on the old inbox are dropped atomically with the
    /// switch.
    async fn rebind(&mut self, new_subject: &str) -> Result<(), Error>;
}

/// The messaging transport this crate's delivery core is layered on top of.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Sends `payload` to `subject` and awaits a single reply, or times out.
    async fn request(
        &self,
        subject: &str,
        payload: Bytes,
        headers: Option<HeaderMap>,
        timeout: Duration,
    ) -> Result<TransportMessage, Error>;

    /// Publishes `payload` to `subject`, optionally with a reply-to and
    /// headers. Does not wait for any acknowledgement at the transport level.
    async fn publish(
        &self,
        subject: &str,
        payload: Bytes,
        reply: Option<String>,
        headers: Option<HeaderMap>,
    ) -> Result<(), Error>;

    /// Subscribes to `subject`, optionally as part of a queue group, and
    /// optionally auto-unsubscribing after `max` messages.
    async fn subscribe(
        &self,
        subject: &str,
        queue: Option<String>,
        max: Option<u64>,
    ) -> Result<Box<dyn RawSubscription>, Error>;

    /// Allocates a fresh, unique inbox subject under `prefix` (or the
    /// transport's default inbox prefix if `prefix` is empty).
    fn new_inbox(&self, prefix: &str) -> String;

    /// Reports whether the connected server advertises `feature`.
    fn supports_feature(&self, feature: Feature) -> bool;
}

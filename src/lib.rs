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
//! Client-side delivery core for a NATS JetStream consumer.
//!
//! This crate turns request/reply and publish/subscribe primitives of a
//! messaging transport (see [`transport::Transport`]) into three
//! higher-level delivery abstractions: a one-shot [`context::Context::pull`],
//! a batched [`context::Context::fetch`], and long-lived push or pull
//! [subscriptions][subscription]. It also owns ordered-consumer recovery,
//! idle-heartbeat monitoring, and the taxonomy of server error frames a
//! JetStream consumer has to reason about.
//!
//! The transport itself (subject routing, inbox allocation, connection
//! lifecycle, JSON codec for broker API payloads) is out of scope here and
//! is reached through the [`transport::Transport`] trait so this crate can
//! be exercised without a running broker (see [`mock::MockTransport`] behind
//! the `test-util` feature).
//!
//! # Example
//!
//! ```no_run
//! # async fn go() -> Result<(), jetstream_consumer_core::Error> {
//! use std::sync::Arc;
//! use jetstream_consumer_core::context::Context;
//!
//! # let transport: Arc<dyn jetstream_consumer_core::transport::Transport> = todo!();
//! let js = Context::new(transport);
//!
//! let mut messages = js
//!     .fetch("ORDERS", "processor", Default::default())
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod consumer;
pub mod context;
pub mod error;
pub mod header;
pub mod heartbeat;
pub mod iterator;
pub mod jetstream_subscription;
pub mod message;
pub mod publish;
pub mod pull_subscription;
pub mod stream;
pub mod subscription;
pub mod testhooks;
pub mod transport;

#[cfg(any(test, feature = "test-util"))]
pub mod mock;

pub use error::{Error, ErrorKind};

/// Default prefix for JetStream API subjects, used when a [`context::Context`]
/// is constructed without an explicit domain or prefix.
pub const DEFAULT_API_PREFIX: &str = "$JS.API";

static BETA_WARNING: once_cell::sync::OnceCell<()> = once_cell::sync::OnceCell::new();

/// Emits a one-time `tracing` notice the first time ordered-consumer support
/// is exercised. Purely cosmetic; safe to never call.
pub(crate) fn warn_ordered_consumer_once() {
    BETA_WARNING.get_or_init(|| {
        tracing::debug!("ordered consumer support is used by this client");
    });
}

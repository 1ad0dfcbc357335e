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
//! The status-frame classifier and the crate's error type.
//!
//! [`classify`] is a pure function: given a status code and description it
//! returns whether the condition is [`Classification::Transient`] (hidden
//! from iterators, quietly ends a fetch) or [`Classification::Terminal`]
//! (propagated to the application). It carries no state of its own; callers
//! supply the handful of bits of context (publish vs. pull, the
//! max-waiting-fail test hook) that change its answer.

use std::fmt;

/// The taxonomy of conditions a JetStream consumer has to recognize.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NoMessages,
    RequestTimeout,
    MaxBatchExceeded,
    MaxExpiresExceeded,
    MaxBytesExceeded,
    MaxMessageSizeExceeded,
    MaxWaitingExceeded,
    IdleHeartbeatMissed,
    ConsumerDeleted,
    ConsumerIsPushBased,
    InvalidAck,
    RequestFailed,
    BrokerUnavailable,
    /// A non-2xx status whose description didn't match any known taxon.
    /// Still terminal, just unnamed.
    Unknown,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::NoMessages => "NoMessages",
            ErrorKind::RequestTimeout => "RequestTimeout",
            ErrorKind::MaxBatchExceeded => "MaxBatchExceeded",
            ErrorKind::MaxExpiresExceeded => "MaxExpiresExceeded",
            ErrorKind::MaxBytesExceeded => "MaxBytesExceeded",
            ErrorKind::MaxMessageSizeExceeded => "MaxMessageSizeExceeded",
            ErrorKind::MaxWaitingExceeded => "MaxWaitingExceeded",
            ErrorKind::IdleHeartbeatMissed => "IdleHeartbeatMissed",
            ErrorKind::ConsumerDeleted => "ConsumerDeleted",
            ErrorKind::ConsumerIsPushBased => "ConsumerIsPushBased",
            ErrorKind::InvalidAck => "InvalidAck",
            ErrorKind::RequestFailed => "RequestFailed",
            ErrorKind::BrokerUnavailable => "BrokerUnavailable",
            ErrorKind::Unknown => "Unknown",
        };
        f.write_str(name)
    }
}

/// The outcome of classifying one status frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// Not an error at all (e.g. a 100 that's flow control or heartbeat,
    /// handled upstream of the classifier).
    None,
    /// Quietly swallowed by iterators; delivered to callbacks as
    /// informational.
    Transient(ErrorKind),
    /// Propagated to the application unconditionally.
    Terminal(ErrorKind),
}

impl Classification {
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            Classification::None => None,
            Classification::Transient(k) | Classification::Terminal(k) => Some(*k),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Classification::Terminal(_))
    }
}

/// Context bits that change how a status frame is classified. None of these
/// are carried in the frame itself; they're properties of the call site.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClassifyContext {
    /// True when classifying the reply to a `publish` call; only in this
    /// context is 503 treated as retryable-transient.
    pub publish: bool,
    /// The `setMaxWaitingToFail` test hook: when set, a 409 whose
    /// description is `Exceeded MaxWaiting` is terminal instead of
    /// transient, which is what makes the max-waiting-exceeded scenario
    /// deterministic to test.
    pub max_waiting_is_terminal: bool,
}

const TERMINAL_409_TEXTS: &[(&str, ErrorKind)] = &[
    ("Exceeded MaxBatch", ErrorKind::MaxBatchExceeded),
    ("Exceeded MaxExpires", ErrorKind::MaxExpiresExceeded),
    ("Exceeded MaxBytes", ErrorKind::MaxBytesExceeded),
    ("Message Size Exceeds MaxBytes", ErrorKind::MaxMessageSizeExceeded),
    ("Consumer Deleted", ErrorKind::ConsumerDeleted),
    ("Consumer is push based", ErrorKind::ConsumerIsPushBased),
];

const MAX_WAITING_TEXT: &str = "Exceeded MaxWaiting";

/// Classifies one status frame. `code` and `description` come straight off
/// the inbound status line.
pub fn classify(code: u16, description: &str, ctx: ClassifyContext) -> Classification {
    match code {
        404 => Classification::Transient(ErrorKind::NoMessages),
        408 => Classification::Transient(ErrorKind::RequestTimeout),
        409 => classify_409(description, ctx),
        503 => {
            if ctx.publish {
                Classification::Transient(ErrorKind::BrokerUnavailable)
            } else {
                Classification::Terminal(ErrorKind::BrokerUnavailable)
            }
        }
        200..=299 => Classification::None,
        _ => Classification::Terminal(ErrorKind::Unknown),
    }
}

fn classify_409(description: &str, ctx: ClassifyContext) -> Classification {
    if description.contains(MAX_WAITING_TEXT) {
        return if ctx.max_waiting_is_terminal {
            Classification::Terminal(ErrorKind::MaxWaitingExceeded)
        } else {
            Classification::Transient(ErrorKind::MaxWaitingExceeded)
        };
    }
    for (text, kind) in TERMINAL_409_TEXTS {
        if description.contains(text) {
            return Classification::Terminal(*kind);
        }
    }
    Classification::Terminal(ErrorKind::Unknown)
}

/// The crate's error type. Every fallible public operation returns
/// `Result<T, Error>`.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A status frame classified as terminal by [`classify`], or a
    /// synthetic one injected by heartbeat/recreate logic.
    #[error("{kind}: {message}")]
    Server { kind: ErrorKind, message: String },

    /// A publish ack whose `stream` field was empty.
    #[error("invalid publish ack: {0}")]
    InvalidAck(String),

    /// Consumer option processing and creation validation failures, e.g.
    /// subject mismatch on bind, queue-group mismatch, bind-only without
    /// an existing durable.
    #[error("consumer configuration error: {0}")]
    Config(String),

    /// The underlying transport's request/publish/subscribe call failed.
    #[error("transport error: {0}")]
    Transport(String),

    /// A request exhausted its deadline without the expected reply.
    #[error("request timed out")]
    Timeout,

    /// The iterator, subscription, or fetch was stopped without a more
    /// specific cause (e.g. explicit `stop()` with no error).
    #[error("subscription closed")]
    Closed,
}

impl Error {
    pub fn server(kind: ErrorKind, message: impl Into<String>) -> Self {
        Error::Server {
            kind,
            message: message.into(),
        }
    }

    /// The [`ErrorKind`] carried by this error, if any (`Transport`,
    /// `Timeout`, `Closed` and `Config` have none).
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            Error::Server { kind, .. } => Some(*kind),
            Error::InvalidAck(_) => Some(ErrorKind::InvalidAck),
            _ => None,
        }
    }
}

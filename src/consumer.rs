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
//! Consumer configuration and info, as sent to and received from the
//! broker's `CONSUMER.*` API.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::message::MessageCallback;

/// How a consumer acknowledges delivery.
///
/// `NotSet` is a client-only sentinel; [`crate::context::Context::process_options`]
/// resolves it to `All` before a config is ever sent to the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckPolicy {
    NotSet,
    None,
    All,
    Explicit,
}

impl Default for AckPolicy {
    fn default() -> Self {
        AckPolicy::NotSet
    }
}

/// How the consumer selects the first message to deliver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliverPolicy {
    All,
    Last,
    New,
    ByStartSequence,
    ByStartTime,
    LastPerSubject,
}

impl Default for DeliverPolicy {
    fn default() -> Self {
        DeliverPolicy::All
    }
}

/// How redelivered messages are replayed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplayPolicy {
    Instant,
    Original,
}

impl Default for ReplayPolicy {
    fn default() -> Self {
        ReplayPolicy::Instant
    }
}

/// The consumer configuration as known to the server: the wire
/// representation exchanged on `CONSUMER.CREATE`/`CONSUMER.INFO`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConsumerConfig {
    pub durable_name: Option<String>,
    pub deliver_subject: Option<String>,
    pub deliver_group: Option<String>,
    pub deliver_policy: DeliverPolicy,
    pub opt_start_seq: Option<u64>,
    #[serde(with = "time::serde::rfc3339::option", default)]
    pub opt_start_time: Option<time::OffsetDateTime>,
    pub ack_policy: AckPolicy,
    #[serde(with = "serde_nanos", skip_serializing_if = "Option::is_none", default)]
    pub ack_wait: Option<Duration>,
    pub max_deliver: Option<i64>,
    pub filter_subject: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter_subjects: Option<Vec<String>>,
    pub replay_policy: ReplayPolicy,
    pub rate_limit_bps: Option<u64>,
    pub sample_freq: Option<String>,
    pub max_waiting: Option<i64>,
    pub max_ack_pending: Option<i64>,
    #[serde(default)]
    pub flow_control: bool,
    #[serde(with = "serde_nanos", skip_serializing_if = "Option::is_none", default)]
    pub idle_heartbeat: Option<Duration>,
    pub max_batch: Option<i64>,
    #[serde(with = "serde_nanos", skip_serializing_if = "Option::is_none", default)]
    pub max_expires: Option<Duration>,
    pub max_bytes: Option<i64>,
    #[serde(default)]
    pub num_replicas: usize,
    #[serde(default)]
    pub mem_storage: bool,
    #[serde(default)]
    pub headers_only: bool,
}

/// Pairs of (consumer sequence, stream sequence), used for `delivered` and
/// `ack_floor` in [`ConsumerInfo`].
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct SequenceInfo {
    pub consumer_seq: u64,
    pub stream_seq: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterInfo {
    pub leader: Option<String>,
    pub replicas: Option<Vec<String>>,
}

/// Server response to `CONSUMER.INFO`/`CONSUMER.CREATE`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConsumerInfo {
    #[serde(rename = "type", default)]
    pub kind: String,
    pub stream_name: String,
    pub name: String,
    #[serde(with = "time::serde::rfc3339::option", default)]
    pub created: Option<time::OffsetDateTime>,
    pub config: ConsumerConfig,
    pub delivered: SequenceInfo,
    pub ack_floor: SequenceInfo,
    pub num_ack_pending: usize,
    pub num_redelivered: usize,
    pub num_waiting: usize,
    pub num_pending: u64,
    pub cluster: Option<ClusterInfo>,
    /// Set by the server when a push consumer already has a live delivery
    /// subscriber bound to it; triggers duplicate-bind rejection.
    pub push_bound: Option<bool>,
}

/// User-supplied consumer options.
///
/// This is distinct from [`ConsumerConfig`]: it carries everything the
/// application sets, including fields that never reach the wire
/// (`ordered`, `bind_only`, `manual_ack`, `max_messages`, `callback`).
/// [`crate::context::Context::process_options`] turns one of these plus a
/// target subject into a resolved [`crate::subscription::SubscriptionInfo`].
pub struct ConsumerOptions {
    pub stream: Option<String>,
    pub config: ConsumerConfig,
    /// Ephemeral ordered consumer: ack=None, max_deliver=1, flow control,
    /// silent recreate on gap.
    pub ordered: bool,
    /// Fail instead of creating a consumer when no matching durable exists.
    pub bind_only: bool,
    /// Application acks explicitly instead of the subscription auto-acking.
    pub manual_ack: bool,
    /// Auto-unsubscribe after this many delivered messages.
    pub max_messages: Option<u64>,
    pub callback: Option<MessageCallback>,
}

impl Default for ConsumerOptions {
    fn default() -> Self {
        Self {
            stream: None,
            config: ConsumerConfig::default(),
            ordered: false,
            bind_only: false,
            manual_ack: false,
            max_messages: None,
            callback: None,
        }
    }
}

impl ConsumerOptions {
    /// Checks the invariants ordered consumers must satisfy: no durable
    /// name, deliver subject, deliver group, non-{NotSet,None} ack policy,
    /// or `max_deliver` above 1.
    pub fn validate_ordered(&self) -> Result<(), crate::Error> {
        if !self.ordered {
            return Ok(());
        }
        let cfg = &self.config;
        if !matches!(cfg.ack_policy, AckPolicy::NotSet | AckPolicy::None) {
            return Err(crate::Error::Config(
                "ordered consumers cannot set an ack policy".into(),
            ));
        }
        if cfg.durable_name.is_some() {
            return Err(crate::Error::Config(
                "ordered consumers cannot have a durable name".into(),
            ));
        }
        if cfg.deliver_subject.is_some() {
            return Err(crate::Error::Config(
                "ordered consumers cannot set a deliver subject".into(),
            ));
        }
        if cfg.deliver_group.is_some() {
            return Err(crate::Error::Config(
                "ordered consumers cannot set a deliver group".into(),
            ));
        }
        if cfg.max_deliver.is_some_and(|n| n > 1) {
            return Err(crate::Error::Config(
                "ordered consumers cannot redeliver (max_deliver must be <= 1)".into(),
            ));
        }
        Ok(())
    }

    /// Checks the invariants a pull consumer must satisfy: not ordered, no
    /// deliver_subject, ack_policy of `Explicit` (or unset).
    pub fn validate_pull(&self) -> Result<(), crate::Error> {
        if self.ordered {
            return Err(crate::Error::Config(
                "pull consumers cannot be ordered".into(),
            ));
        }
        if self.config.deliver_subject.is_some() {
            return Err(crate::Error::Config(
                "pull consumers cannot set a deliver subject".into(),
            ));
        }
        if self.config.ack_policy != AckPolicy::Explicit
            && self.config.ack_policy != AckPolicy::NotSet
        {
            return Err(crate::Error::Config(
                "pull consumers require an explicit ack policy".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordered_rejects_durable_name() {
        let mut opts = ConsumerOptions {
            ordered: true,
            ..Default::default()
        };
        opts.config.durable_name = Some("d".into());
        assert!(opts.validate_ordered().is_err());
    }

    #[test]
    fn ordered_rejects_explicit_ack() {
        let mut opts = ConsumerOptions {
            ordered: true,
            ..Default::default()
        };
        opts.config.ack_policy = AckPolicy::Explicit;
        assert!(opts.validate_ordered().is_err());
    }

    #[test]
    fn pull_rejects_ordered() {
        let opts = ConsumerOptions {
            ordered: true,
            ..Default::default()
        };
        assert!(opts.validate_pull().is_err());
    }

    #[test]
    fn pull_rejects_deliver_subject() {
        let mut opts = ConsumerOptions::default();
        opts.config.deliver_subject = Some("inbox.1".into());
        assert!(opts.validate_pull().is_err());
    }
}

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
//! The application-visible JetStream message, its ack machinery, and the
//! metadata parsed out of its ack-reply subject.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use crate::header::HeaderMap;
use crate::transport::Transport;
use crate::Error;

/// A decoded delivery subject token grammar:
/// `$JS.ACK.<stream>.<consumer>.<num_delivered>.<stream_seq>.<consumer_seq>.<timestamp>.<pending>[.<domain>]`
///
/// This is the classic JetStream ack-reply format; the client must parse it
/// to recover sequence numbers the broker doesn't otherwise repeat in the
/// payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Info {
    pub domain: Option<String>,
    pub stream: String,
    pub consumer: String,
    pub num_delivered: u64,
    pub stream_sequence: u64,
    pub consumer_sequence: u64,
    pub published_nanos: i128,
    pub pending: u64,
}

/// Parses JetStream metadata out of a message's reply subject. Returns
/// `None` if `reply` doesn't look like an ack-reply subject at all (e.g. a
/// flow-control or heartbeat frame, which carry no payload metadata).
pub fn parse_info(reply: &str) -> Result<Info, Error> {
    let tokens: Vec<&str> = reply.split('.').collect();
    // Either "$JS.ACK.<stream>.<consumer>.<delivered>.<sseq>.<cseq>.<ts>.<pending>"
    // (9 tokens) or the same with a leading domain token inserted after ACK
    // (10 tokens): "$JS.ACK.<domain>.<stream>...".
    let (domain, rest) = match tokens.len() {
        9 if tokens[0] == "$JS" && tokens[1] == "ACK" => (None, &tokens[2..]),
        10 if tokens[0] == "$JS" && tokens[1] == "ACK" => {
            let domain = if tokens[2] == "_" { None } else { Some(tokens[2].to_string()) };
            (domain, &tokens[3..])
        }
        _ => {
            return Err(Error::Transport(format!(
                "{reply} is not a valid JetStream ack-reply subject"
            )))
        }
    };

    let parse_u64 = |s: &str| {
        s.parse::<u64>().map_err(|_| {
            Error::Transport(format!("{reply} has a non-numeric token: {s}"))
        })
    };

    Ok(Info {
        domain,
        stream: rest[0].to_string(),
        consumer: rest[1].to_string(),
        num_delivered: parse_u64(rest[2])?,
        stream_sequence: parse_u64(rest[3])?,
        consumer_sequence: parse_u64(rest[4])?,
        published_nanos: rest[5].parse::<i128>().unwrap_or(0),
        pending: parse_u64(rest[6])?,
    })
}

/// The kinds of response used for acknowledging a processed message. Carries
/// `Nak`'s optional redelivery delay, matching real call sites like
/// `ack_with(AckKind::Nak(None))`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckKind {
    Ack,
    Nak(Option<Duration>),
    Progress,
    Next,
    Term,
}

impl From<AckKind> for Bytes {
    fn from(kind: AckKind) -> Self {
        match kind {
            AckKind::Ack => Bytes::from_static(b"+ACK"),
            AckKind::Nak(None) => Bytes::from_static(b"-NAK"),
            AckKind::Nak(Some(delay)) => {
                Bytes::from(format!("-NAK {{\"delay\":{}}}", delay.as_nanos()))
            }
            AckKind::Progress => Bytes::from_static(b"+WPI"),
            AckKind::Next => Bytes::from_static(b"+NXT"),
            AckKind::Term => Bytes::from_static(b"+TERM"),
        }
    }
}

/// A message delivered by a JetStream consumer.
#[derive(Clone)]
pub struct Message {
    pub subject: String,
    pub reply: Option<String>,
    pub headers: Option<HeaderMap>,
    pub payload: Bytes,
    pub(crate) transport: Arc<dyn Transport>,
}

impl std::fmt::Debug for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Message")
            .field("subject", &self.subject)
            .field("reply", &self.reply)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

impl Message {
    /// Parses JetStream metadata from this message's reply subject.
    pub fn info(&self) -> Result<Info, Error> {
        let reply = self
            .reply
            .as_deref()
            .ok_or_else(|| Error::Transport("message has no reply subject".into()))?;
        parse_info(reply)
    }

    /// Acknowledges delivery by sending `+ACK` to the reply subject.
    pub async fn ack(&self) -> Result<(), Error> {
        self.ack_with(AckKind::Ack).await
    }

    /// Acknowledges delivery with a specific [`AckKind`].
    pub async fn ack_with(&self, kind: AckKind) -> Result<(), Error> {
        let reply = self
            .reply
            .clone()
            .ok_or_else(|| Error::Transport("message has no reply subject, not ackable".into()))?;
        self.transport
            .publish(&reply, kind.into(), None, None)
            .await
    }

    /// Sends `+ACK` and waits for the server's confirmation reply, for
    /// "exactly once" processing semantics.
    pub async fn double_ack(&self) -> Result<(), Error> {
        let reply = self
            .reply
            .clone()
            .ok_or_else(|| Error::Transport("message has no reply subject, not ackable".into()))?;
        self.transport
            .request(&reply, AckKind::Ack.into(), None, Duration::from_secs(5))
            .await?;
        Ok(())
    }
}

/// Application callback used by non-iterator subscriptions: the callback
/// variant of the frame adapter.
pub type MessageCallback = Arc<dyn Fn(Result<Message, Error>) + Send + Sync>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ack_reply_without_domain() {
        let info = parse_info("$JS.ACK.ORDERS.processor.1.42.7.1690000000000000000.3").unwrap();
        assert_eq!(info.stream, "ORDERS");
        assert_eq!(info.consumer, "processor");
        assert_eq!(info.num_delivered, 1);
        assert_eq!(info.stream_sequence, 42);
        assert_eq!(info.consumer_sequence, 7);
        assert_eq!(info.pending, 3);
        assert_eq!(info.domain, None);
    }

    #[test]
    fn parses_ack_reply_with_domain() {
        let info = parse_info("$JS.ACK.hub.ORDERS.processor.1.42.7.1690000000000000000.3").unwrap();
        assert_eq!(info.domain.as_deref(), Some("hub"));
        assert_eq!(info.stream, "ORDERS");
    }

    #[test]
    fn rejects_non_ack_subjects() {
        assert!(parse_info("some.other.subject").is_err());
    }

    #[test]
    fn nak_with_delay_encodes_json_suffix() {
        let bytes: Bytes = AckKind::Nak(Some(Duration::from_secs(1))).into();
        assert_eq!(bytes, Bytes::from_static(b"-NAK {\"delay\":1000000000}"));
    }
}

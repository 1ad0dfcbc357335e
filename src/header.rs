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
//! NATS message headers.
//!
//! NATS headers are not HTTP headers, but share enough shape (case
//! sensitive name, multiple values) that we validate names with
//! [`http::HeaderName`] and store values as plain strings.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use http::HeaderName;

/// Well-known publish-expectation and protocol header names, matching the
/// server's wire names bit for bit.
pub mod names {
    pub const NATS_MSG_ID: &str = "Nats-Msg-Id";
    pub const NATS_EXPECTED_STREAM: &str = "Nats-Expected-Stream";
    pub const NATS_EXPECTED_LAST_SEQUENCE: &str = "Nats-Expected-Last-Sequence";
    pub const NATS_EXPECTED_LAST_MSG_ID: &str = "Nats-Expected-Last-Msg-Id";
    pub const NATS_EXPECTED_LAST_SUBJECT_SEQUENCE: &str = "Nats-Expected-Last-Subject-Sequence";
    pub const NATS_LAST_CONSUMER: &str = "Nats-Last-Consumer";
    pub const NATS_LAST_STREAM: &str = "Nats-Last-Stream";
    pub const NATS_CONSUMER_STALLED: &str = "Nats-Consumer-Stalled";
    pub const NATS_SUBJECT: &str = "Nats-Subject";
    pub const NATS_SEQUENCE: &str = "Nats-Sequence";
    pub const NATS_TIME_STAMP: &str = "Nats-Time-Stamp";
    pub const NATS_STREAM: &str = "Nats-Stream";
}

/// A multimap of header name to one or more string values, plus the status
/// line a headers-only protocol frame carries.
#[derive(Debug, Clone, Default)]
pub struct HeaderMap {
    status: Option<StatusLine>,
    inner: HashMap<HeaderName, Vec<String>>,
}

/// The numeric status and description NATS puts on headers-only frames
/// (flow control, heartbeats, and 404/408/409/503 error replies).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusLine {
    pub code: u16,
    pub description: String,
}

impl HeaderMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_status(code: u16, description: impl Into<String>) -> Self {
        Self {
            status: Some(StatusLine {
                code,
                description: description.into(),
            }),
            inner: HashMap::new(),
        }
    }

    pub fn status(&self) -> Option<&StatusLine> {
        self.status.as_ref()
    }

    pub fn insert(&mut self, name: &str, value: impl Into<String>) {
        let name = HeaderName::from_str(name).expect("valid header name");
        self.inner.entry(name).or_default().push(value.into());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        let name = HeaderName::from_str(name).ok()?;
        self.inner
            .get(&name)
            .and_then(|values| values.first())
            .map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.status.is_none() && self.inner.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&HeaderName, &Vec<String>)> {
        self.inner.iter()
    }
}

impl fmt::Display for StatusLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code, self.description)
    }
}

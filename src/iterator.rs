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
//! A bounded(-by-channel), cancellable, asynchronous sequence of typed
//! values produced from incoming frames.
//!
//! [`queued_iterator`] returns a producer [`QueuedIteratorHandle`] and a
//! consumer [`QueuedIterator`], which implements [`futures::Stream`] so
//! application code consumes it the same way it consumes any other NATS
//! subscription (`while let Some(item) = messages.next().await`).
//!
//! The split into `ingest` (does this frame become an application-visible
//! value) and `protocol` (does this frame still count for flow-control and
//! heartbeat bookkeeping even if not ingested) happens one layer up, in the
//! typed subscription's frame adapter. By the time a value reaches this
//! module it has already been decided that it belongs in the stream. What
//! remains here is the one hook that genuinely belongs to the iterator
//! itself: [`QueuedIteratorHandle::set_protocol_filter`], a last-chance veto
//! run immediately before enqueue.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::mpsc;

use crate::Error;

enum IterMsg<T> {
    Item(T),
    Err(Error),
    End,
}

type ProtocolFilter<T> = Box<dyn FnMut(&T) -> bool + Send>;
type DispatchedFn<T> = Box<dyn FnMut(Option<&T>) + Send>;

/// Producer-side handle: pushes values or stops the iterator. Cheap to
/// clone and safe to hand to a background task.
#[derive(Clone)]
pub struct QueuedIteratorHandle<T> {
    tx: mpsc::UnboundedSender<IterMsg<T>>,
    protocol_filter: Arc<Mutex<Option<ProtocolFilter<T>>>>,
    stopped: Arc<AtomicBool>,
}

/// Consumer-side handle: a `Stream` of `Result<T, Error>` that ends either
/// when the channel closes cleanly or when an error is pushed.
pub struct QueuedIterator<T> {
    rx: mpsc::UnboundedReceiver<IterMsg<T>>,
    dispatched: Option<DispatchedFn<T>>,
    done: bool,
}

/// Builds a fresh producer/consumer pair.
pub fn queued_iterator<T>() -> (QueuedIteratorHandle<T>, QueuedIterator<T>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        QueuedIteratorHandle {
            tx,
            protocol_filter: Arc::new(Mutex::new(None)),
            stopped: Arc::new(AtomicBool::new(false)),
        },
        QueuedIterator {
            rx,
            dispatched: None,
            done: false,
        },
    )
}

impl<T> QueuedIteratorHandle<T> {
    /// Installs the pre-enqueue veto (`protocolFilterFn`). Returning `false`
    /// drops the value silently, used to keep already-observed heartbeats
    /// out of the application-visible stream.
    pub fn set_protocol_filter<F>(&self, filter: F)
    where
        F: FnMut(&T) -> bool + Send + 'static,
    {
        *self.protocol_filter.lock().unwrap() = Some(Box::new(filter));
    }

    /// Enqueues `item` unless the iterator has already been stopped or the
    /// protocol filter vetoes it.
    pub fn push(&self, item: T) {
        if self.stopped.load(Ordering::SeqCst) {
            return;
        }
        let keep = {
            let mut filter = self.protocol_filter.lock().unwrap();
            match filter.as_mut() {
                Some(f) => f(&item),
                None => true,
            }
        };
        if keep {
            let _ = self.tx.send(IterMsg::Item(item));
        }
    }

    /// Stops the iterator. With `Some(err)`, the next consumer read surfaces
    /// `err` and the iterator closes; with `None`, the iterator ends
    /// cleanly as if the source had run dry. Idempotent: a second call is a
    /// no-op.
    pub fn stop(&self, err: Option<Error>) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let msg = match err {
            Some(e) => IterMsg::Err(e),
            None => IterMsg::End,
        };
        let _ = self.tx.send(msg);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

impl<T> QueuedIterator<T> {
    /// Installs the post-yield hook (`dispatchedFn`), run after each
    /// value this iterator yields to the application (and once, with
    /// `None`, when the stream ends cleanly). Used for auto-ack and for
    /// stopping a fetch once its batch target is reached.
    pub fn set_dispatched<F>(&mut self, f: F)
    where
        F: FnMut(Option<&T>) + Send + 'static,
    {
        self.dispatched = Some(Box::new(f));
    }
}

impl<T: Unpin> Stream for QueuedIterator<T> {
    type Item = Result<T, Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.done {
            return Poll::Ready(None);
        }
        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(IterMsg::Item(item))) => {
                if let Some(dispatched) = self.dispatched.as_mut() {
                    dispatched(Some(&item));
                }
                Poll::Ready(Some(Ok(item)))
            }
            Poll::Ready(Some(IterMsg::Err(err))) => {
                self.done = true;
                Poll::Ready(Some(Err(err)))
            }
            Poll::Ready(Some(IterMsg::End)) | Poll::Ready(None) => {
                self.done = true;
                if let Some(dispatched) = self.dispatched.as_mut() {
                    dispatched(None);
                }
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use futures::StreamExt;

    #[tokio::test]
    async fn yields_pushed_values_in_order() {
        let (handle, mut iter) = queued_iterator::<u32>();
        handle.push(1);
        handle.push(2);
        handle.stop(None);

        assert_eq!(iter.next().await.unwrap().unwrap(), 1);
        assert_eq!(iter.next().await.unwrap().unwrap(), 2);
        assert!(iter.next().await.is_none());
    }

    #[tokio::test]
    async fn stop_with_error_surfaces_then_closes() {
        let (handle, mut iter) = queued_iterator::<u32>();
        handle.push(1);
        handle.stop(Some(Error::server(ErrorKind::MaxBatchExceeded, "Exceeded MaxBatch")));

        assert_eq!(iter.next().await.unwrap().unwrap(), 1);
        let err = iter.next().await.unwrap().unwrap_err();
        assert_eq!(err.kind(), Some(ErrorKind::MaxBatchExceeded));
        assert!(iter.next().await.is_none());
    }

    #[tokio::test]
    async fn protocol_filter_drops_vetoed_values() {
        let (handle, mut iter) = queued_iterator::<u32>();
        handle.set_protocol_filter(|v| *v % 2 == 0);
        handle.push(1);
        handle.push(2);
        handle.stop(None);

        assert_eq!(iter.next().await.unwrap().unwrap(), 2);
        assert!(iter.next().await.is_none());
    }

    #[tokio::test]
    async fn dispatched_hook_runs_after_each_yield_and_on_close() {
        let (handle, mut iter) = queued_iterator::<u32>();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_cb = seen.clone();
        iter.set_dispatched(move |v| seen_cb.lock().unwrap().push(v.copied()));

        handle.push(10);
        handle.stop(None);
        while iter.next().await.is_some() {}

        assert_eq!(*seen.lock().unwrap(), vec![Some(10), None]);
    }

    #[tokio::test]
    async fn double_stop_is_a_no_op() {
        let (handle, mut iter) = queued_iterator::<u32>();
        handle.stop(Some(Error::server(ErrorKind::ConsumerDeleted, "Consumer Deleted")));
        handle.stop(Some(Error::server(ErrorKind::MaxBatchExceeded, "Exceeded MaxBatch")));

        let err = iter.next().await.unwrap().unwrap_err();
        assert_eq!(err.kind(), Some(ErrorKind::ConsumerDeleted));
    }
}

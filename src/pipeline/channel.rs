//! Rendezvous channel between a push producer and a pull consumer.
//!
//! A producer hands elements over with [`RendezvousChannel::submit`], which
//! returns a [`Delivery`] completion handle. The handle resolves only once the
//! pull side has finished with that element, i.e. when the consumer asks the
//! [`Input`] iterator for the next element or drops it. Writing N elements
//! serially is therefore N acknowledged handoffs, not a burst into a buffer.
//!
//! ```text
//! producer ── submit(x) ──► [ VecDeque<Entry> ] ──► Input::next() ── x
//!    ▲                                                    │
//!    └────────────── Delivery resolves ◄── next pull ─────┘
//! ```
//!
//! The channel supports one live subscriber at a time. A later subscription
//! resumes at the queue head, and every subscription taken after the end
//! marker has been delivered terminates immediately.

use crate::error::{FlowError, Result};
use std::collections::VecDeque;
use std::future::Future;
use std::iter::FusedIterator;
use std::pin::Pin;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use tokio::sync::oneshot;

/// An element travelling through a channel: a payload or the end marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Element<T> {
    Value(T),
    End,
}

impl<T> Element<T> {
    #[inline]
    pub fn is_end(&self) -> bool {
        matches!(self, Element::End)
    }
}

/// Producer side of one entry's completion handle.
///
/// Dropping it without firing resolves the [`Delivery`] to `Closed`.
struct Acknowledger(oneshot::Sender<()>);

impl Acknowledger {
    fn fire(self) {
        // The producer may have stopped waiting; that is not our problem.
        let _ = self.0.send(());
    }
}

struct Entry<T> {
    element: Element<T>,
    ack: Acknowledger,
}

/// Completion handle returned by a submission.
///
/// Resolves to `Ok(())` once the consumer is done with the element, or to
/// [`FlowError::Closed`] if the channel was closed before it was taken.
/// Use [`Delivery::wait`] from plain threads, or `.await` it from async code.
#[must_use = "a submission is only complete once its delivery resolves"]
#[derive(Debug)]
pub struct Delivery {
    rx: oneshot::Receiver<()>,
}

impl Delivery {
    /// Block the current thread until the element is acknowledged.
    ///
    /// Panics if called from within an async runtime; `.await` instead.
    pub fn wait(self) -> Result<()> {
        self.rx.blocking_recv().map_err(|_| FlowError::Closed)
    }

    /// Check for completion without blocking. `None` while still pending.
    pub fn try_wait(&mut self) -> Option<Result<()>> {
        match self.rx.try_recv() {
            Ok(()) => Some(Ok(())),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(FlowError::Closed)),
        }
    }
}

impl Future for Delivery {
    type Output = Result<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|r| r.map_err(|_| FlowError::Closed))
    }
}

struct ChannelState<T> {
    queue: VecDeque<Entry<T>>,
    end_submitted: bool,
    /// End has been taken by a subscriber.
    finished: bool,
    /// Consumer side abandoned the channel.
    closed: bool,
    subscribed: bool,
    submitted: u64,
    delivered: u64,
}

struct Shared<T> {
    state: Mutex<ChannelState<T>>,
    available: Condvar,
}

impl<T> Shared<T> {
    fn lock(&self) -> MutexGuard<'_, ChannelState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Snapshot of a channel's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelStats {
    pub pending: usize,
    pub submitted: u64,
    pub delivered: u64,
}

/// FIFO rendezvous between a push producer and a single pull consumer.
pub struct RendezvousChannel<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for RendezvousChannel<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> Default for RendezvousChannel<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> RendezvousChannel<T> {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(ChannelState {
                    queue: VecDeque::new(),
                    end_submitted: false,
                    finished: false,
                    closed: false,
                    subscribed: false,
                    submitted: 0,
                    delivered: 0,
                }),
                available: Condvar::new(),
            }),
        }
    }

    /// Create a channel together with its one subscription.
    pub fn with_subscriber() -> (Self, Input<T>) {
        let channel = Self::new();
        channel.shared.lock().subscribed = true;
        let input = Input {
            shared: Arc::clone(&channel.shared),
            in_flight: None,
            done: false,
            owns_subscription: true,
        };
        (channel, input)
    }

    /// Hand an element to the consumer.
    ///
    /// The returned handle resolves once the consumer has finished with it.
    pub fn submit(&self, item: T) -> Result<Delivery> {
        self.enqueue(Element::Value(item))
    }

    /// Signal that no further elements will be submitted.
    ///
    /// The returned handle resolves once the consumer has observed the end.
    pub fn submit_end(&self) -> Result<Delivery> {
        self.enqueue(Element::End)
    }

    /// Submit and block until acknowledged.
    pub fn send(&self, item: T) -> Result<()> {
        self.submit(item)?.wait()
    }

    /// Submit the end marker and block until acknowledged.
    pub fn send_end(&self) -> Result<()> {
        self.submit_end()?.wait()
    }

    fn enqueue(&self, element: Element<T>) -> Result<Delivery> {
        let mut state = self.shared.lock();
        if state.end_submitted {
            tracing::error!("Element submitted after end of stream");
            return Err(FlowError::WriteAfterEnd);
        }
        if state.closed {
            return Err(FlowError::Closed);
        }
        if element.is_end() {
            state.end_submitted = true;
        }

        let (tx, rx) = oneshot::channel();
        state.queue.push_back(Entry {
            element,
            ack: Acknowledger(tx),
        });
        state.submitted += 1;
        drop(state);

        self.shared.available.notify_all();
        Ok(Delivery { rx })
    }

    /// Start a pull sequence over the channel.
    ///
    /// Fails with `AlreadySubscribed` while another [`Input`] is live, unless
    /// the end has already been delivered (then the new input is empty).
    pub fn subscribe(&self) -> Result<Input<T>> {
        let mut state = self.shared.lock();
        if state.finished || state.closed {
            return Ok(Input {
                shared: Arc::clone(&self.shared),
                in_flight: None,
                done: true,
                owns_subscription: false,
            });
        }
        if state.subscribed {
            return Err(FlowError::AlreadySubscribed);
        }
        state.subscribed = true;
        Ok(Input {
            shared: Arc::clone(&self.shared),
            in_flight: None,
            done: false,
            owns_subscription: true,
        })
    }

    /// Abandon the consumer side.
    ///
    /// Every queued entry is dropped, so their deliveries resolve to `Closed`,
    /// and further submissions fail with `Closed`. A blocked subscriber wakes
    /// up and terminates.
    pub fn close(&self) {
        let drained = {
            let mut state = self.shared.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            std::mem::take(&mut state.queue)
        };
        if !drained.is_empty() {
            tracing::debug!("Channel closed with {} pending entries", drained.len());
        }
        drop(drained);
        self.shared.available.notify_all();
    }

    /// The end marker has been taken by a subscriber.
    pub fn is_finished(&self) -> bool {
        self.shared.lock().finished
    }

    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }

    /// Number of entries waiting to be taken.
    pub fn pending(&self) -> usize {
        self.shared.lock().queue.len()
    }

    pub fn stats(&self) -> ChannelStats {
        let state = self.shared.lock();
        ChannelStats {
            pending: state.queue.len(),
            submitted: state.submitted,
            delivered: state.delivered,
        }
    }
}

/// Lazy pull sequence over a [`RendezvousChannel`].
///
/// Each call to `next` first acknowledges the previously yielded element,
/// then waits for the next one. Dropping the input acknowledges the element
/// it still holds.
pub struct Input<T> {
    shared: Arc<Shared<T>>,
    in_flight: Option<Acknowledger>,
    done: bool,
    owns_subscription: bool,
}

impl<T> Input<T> {
    /// The sequence has terminated (end marker seen or channel closed).
    pub fn is_done(&self) -> bool {
        self.done
    }

    fn acknowledge(&mut self) {
        if let Some(ack) = self.in_flight.take() {
            ack.fire();
        }
    }

    fn take_next(&self) -> Option<Entry<T>> {
        let mut state = self.shared.lock();
        loop {
            if state.finished || state.closed {
                return None;
            }
            if let Some(entry) = state.queue.pop_front() {
                if entry.element.is_end() {
                    state.finished = true;
                }
                state.delivered += 1;
                return Some(entry);
            }
            state = self
                .shared
                .available
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}

impl<T> Iterator for Input<T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        self.acknowledge();
        if self.done {
            return None;
        }

        match self.take_next() {
            Some(Entry {
                element: Element::Value(value),
                ack,
            }) => {
                self.in_flight = Some(ack);
                Some(value)
            }
            Some(Entry {
                element: Element::End,
                ack,
            }) => {
                ack.fire();
                self.done = true;
                None
            }
            None => {
                self.done = true;
                None
            }
        }
    }
}

impl<T> FusedIterator for Input<T> {}

impl<T> Drop for Input<T> {
    fn drop(&mut self) {
        self.acknowledge();
        if self.owns_subscription {
            self.shared.lock().subscribed = false;
        }
    }
}

//! Push-side stream interface.
//!
//! This is the calling convention of the piping layer: upstream pushes items
//! into a [`Writable`], and a [`Readable`] is asked for output whenever the
//! downstream has room, filling an [`Outlet`] until it reports it is full.
//! Stage adapters implement these traits on top of rendezvous channels.

use crate::error::Result;
use std::collections::VecDeque;

/// Push-side input of a stage.
#[cfg_attr(test, mockall::automock)]
pub trait Writable<T: Send + 'static>: Send {
    /// Accept one item. Returns only once the stage has taken it.
    fn write(&mut self, item: T) -> Result<()>;

    /// End of input. Returns once the stage has observed the end.
    fn finish(&mut self) -> Result<()>;

    /// Stop accepting input and release anyone waiting on it.
    fn abort(&mut self);
}

/// Push-side output of a stage.
#[cfg_attr(test, mockall::automock)]
pub trait Readable<T: Send + 'static>: Send {
    /// Demand callback: push output into `outlet` until it stops wanting more
    /// or the stage has no more output (then call [`Outlet::end`]).
    fn read(&mut self, outlet: &mut Outlet<T>) -> Result<()>;

    /// Stop producing and release the stage's own input.
    fn abort(&mut self);
}

/// Readable-side buffer filled during one demand callback.
#[derive(Debug)]
pub struct Outlet<T> {
    buffer: VecDeque<T>,
    high_water_mark: usize,
    ended: bool,
}

impl<T> Outlet<T> {
    /// Create an outlet that asks for at most `high_water_mark` items (min 1).
    pub fn new(high_water_mark: usize) -> Self {
        let high_water_mark = high_water_mark.max(1);
        Self {
            buffer: VecDeque::with_capacity(high_water_mark.min(64)),
            high_water_mark,
            ended: false,
        }
    }

    /// Buffer an item. Returns `false` once the producer should stop.
    pub fn push(&mut self, item: T) -> bool {
        if self.ended {
            tracing::error!("Item pushed after end of output was dropped");
            return false;
        }
        self.buffer.push_back(item);
        self.wants_more()
    }

    /// Signal end of output.
    pub fn end(&mut self) {
        self.ended = true;
    }

    pub fn wants_more(&self) -> bool {
        !self.ended && self.buffer.len() < self.high_water_mark
    }

    pub fn is_ended(&self) -> bool {
        self.ended
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn high_water_mark(&self) -> usize {
        self.high_water_mark
    }

    /// Take buffered items in push order.
    pub fn drain(&mut self) -> std::collections::vec_deque::Drain<'_, T> {
        self.buffer.drain(..)
    }
}

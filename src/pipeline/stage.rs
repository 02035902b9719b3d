//! Stage adapters: pull-based stage functions behind the push interface.
//!
//! A stage function is ordinary iterator code:
//!
//! - **source**: `FnOnce() -> impl IntoIterator<Item = O>`
//! - **duplex**: `FnOnce(Input<I>) -> impl IntoIterator<Item = O>`
//! - **sink**: `FnOnce(Input<I>)`
//!
//! The `try_*` constructors accept functions yielding `Result<_, E>` instead.
//! Writes into a duplex or sink go through a [`RendezvousChannel`], so a
//! `write` returns only once the stage function has finished with the item.
//!
//! Stage functions are always called lazily on a pipeline thread, never on
//! the thread constructing the adapter. When a stage function fails or
//! panics its input channel is closed, which releases any blocked writer.

use crate::config::{
    FlowConfig, Priming, PrimingConfig, DEFAULT_PREFETCH, DEFAULT_THREAD_NAME_PREFIX,
};
use crate::error::{BoxError, FlowError, Result};
use crate::pipeline::channel::{Input, RendezvousChannel};
use crate::pipeline::stream::{Outlet, Readable, Writable};
use crossbeam_channel::{bounded, Receiver};
use std::convert::Infallible;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::thread::JoinHandle;

type StdResult<T, E> = std::result::Result<T, E>;
type BoxIter<O> = Box<dyn Iterator<Item = StdResult<O, BoxError>> + Send>;
type Start<O> = Box<dyn FnOnce() -> BoxIter<O> + Send>;
type Consume<I> = Box<dyn FnOnce(Input<I>) -> StdResult<(), BoxError> + Send>;

/// Position of a stage in a pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Source,
    Duplex,
    Sink,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Source => write!(f, "source"),
            Role::Duplex => write!(f, "duplex"),
            Role::Sink => write!(f, "sink"),
        }
    }
}

/// Per-stage settings, fixed at construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageOptions {
    /// Name used in errors, logs and thread names.
    pub name: String,
    /// When the stage function is first advanced.
    pub priming: Priming,
    /// Output buffered ahead by an eagerly primed source or duplex.
    pub prefetch: usize,
    /// Prefix for worker thread names.
    pub thread_prefix: String,
}

impl StageOptions {
    /// Defaults for a role: sinks prime eagerly, sources and duplexes on demand.
    pub fn for_role(role: Role) -> Self {
        Self {
            name: role.to_string(),
            priming: PrimingConfig::default().for_role(role),
            prefetch: DEFAULT_PREFETCH,
            thread_prefix: DEFAULT_THREAD_NAME_PREFIX.to_string(),
        }
    }

    pub fn from_config(role: Role, config: &FlowConfig) -> Self {
        Self {
            name: role.to_string(),
            priming: config.priming.for_role(role),
            prefetch: config.prefetch.max(1),
            thread_prefix: config.thread_name_prefix.clone(),
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn priming(mut self, priming: Priming) -> Self {
        self.priming = priming;
        self
    }

    pub fn prefetch(mut self, prefetch: usize) -> Self {
        self.prefetch = prefetch.max(1);
        self
    }

    fn thread_name(&self) -> String {
        format!("{}-{}", self.thread_prefix, self.name)
    }
}

fn erase<O, It, E>(iter: It) -> BoxIter<O>
where
    It: IntoIterator<Item = StdResult<O, E>>,
    It::IntoIter: Send + 'static,
    E: Into<BoxError>,
{
    Box::new(iter.into_iter().map(|r| r.map_err(Into::into)))
}

// ── Output side ──

enum ProducerState<O> {
    Pending(Start<O>),
    Running(BoxIter<O>),
    Prefetching {
        rx: Receiver<Result<O>>,
        worker: Option<JoinHandle<()>>,
    },
    Failed(FlowError),
    Done,
}

/// Advances a stage function's output sequence one step at a time.
struct Producer<O> {
    stage: String,
    state: ProducerState<O>,
}

impl<O: Send + 'static> Producer<O> {
    fn new(start: Start<O>, options: &StageOptions) -> Self {
        let state = match options.priming {
            Priming::OnDemand => ProducerState::Pending(start),
            Priming::Eager => Self::spawn_prefetch(start, options),
        };
        Self {
            stage: options.name.clone(),
            state,
        }
    }

    fn spawn_prefetch(start: Start<O>, options: &StageOptions) -> ProducerState<O> {
        let (tx, rx) = bounded(options.prefetch.max(1));
        let stage = options.name.clone();
        let spawned = std::thread::Builder::new()
            .name(options.thread_name())
            .spawn(move || {
                let mut iter = match catch_unwind(AssertUnwindSafe(start)) {
                    Ok(iter) => iter,
                    Err(payload) => {
                        let _ = tx.send(Err(FlowError::from_panic(&stage, payload)));
                        return;
                    }
                };
                loop {
                    match catch_unwind(AssertUnwindSafe(|| iter.next())) {
                        Ok(Some(Ok(value))) => {
                            if tx.send(Ok(value)).is_err() {
                                // Reader went away
                                break;
                            }
                        }
                        Ok(Some(Err(e))) => {
                            let _ = tx.send(Err(FlowError::transform(&stage, e)));
                            break;
                        }
                        Ok(None) => break,
                        Err(payload) => {
                            let _ = tx.send(Err(FlowError::from_panic(&stage, payload)));
                            break;
                        }
                    }
                }
                tracing::trace!(stage = %stage, "Prefetch worker exiting");
            });

        match spawned {
            Ok(worker) => ProducerState::Prefetching {
                rx,
                worker: Some(worker),
            },
            Err(e) => ProducerState::Failed(e.into()),
        }
    }

    /// Next output, `None` once the stage function is exhausted.
    fn advance(&mut self) -> Result<Option<O>> {
        loop {
            match std::mem::replace(&mut self.state, ProducerState::Done) {
                ProducerState::Pending(start) => match catch_unwind(AssertUnwindSafe(start)) {
                    Ok(iter) => {
                        tracing::debug!(stage = %self.stage, "Stage function started");
                        self.state = ProducerState::Running(iter);
                    }
                    Err(payload) => return Err(FlowError::from_panic(&self.stage, payload)),
                },
                ProducerState::Running(mut iter) => {
                    return match catch_unwind(AssertUnwindSafe(|| iter.next())) {
                        Ok(Some(Ok(value))) => {
                            self.state = ProducerState::Running(iter);
                            Ok(Some(value))
                        }
                        Ok(Some(Err(e))) => Err(FlowError::transform(&self.stage, e)),
                        Ok(None) => {
                            tracing::debug!(stage = %self.stage, "Stage function exhausted");
                            Ok(None)
                        }
                        Err(payload) => Err(FlowError::from_panic(&self.stage, payload)),
                    };
                }
                ProducerState::Prefetching { rx, mut worker } => {
                    return match rx.recv() {
                        Ok(Ok(value)) => {
                            self.state = ProducerState::Prefetching { rx, worker };
                            Ok(Some(value))
                        }
                        Ok(Err(e)) => {
                            join_quietly(worker.take());
                            Err(e)
                        }
                        Err(_) => {
                            join_quietly(worker.take());
                            Ok(None)
                        }
                    };
                }
                ProducerState::Failed(e) => return Err(e),
                ProducerState::Done => return Ok(None),
            }
        }
    }

    /// Fill `outlet` until it is full or the output is exhausted.
    fn fill(&mut self, outlet: &mut Outlet<O>) -> Result<()> {
        while outlet.wants_more() {
            match self.advance()? {
                Some(value) => {
                    outlet.push(value);
                }
                None => {
                    outlet.end();
                    break;
                }
            }
        }
        Ok(())
    }

    fn abort(&mut self) {
        // Dropping the iterator or receiver lets a prefetch worker run out.
        self.state = ProducerState::Done;
    }
}

fn join_quietly(worker: Option<JoinHandle<()>>) {
    if let Some(worker) = worker {
        let _ = worker.join();
    }
}

// ── Source ──

/// A no-input stage whose output is pulled on downstream demand.
pub struct Source<O> {
    producer: Producer<O>,
    options: StageOptions,
}

impl<O: Send + 'static> Source<O> {
    /// Wrap a fallible source function.
    pub fn with_options<F, It, E>(f: F, options: StageOptions) -> Self
    where
        F: FnOnce() -> It + Send + 'static,
        It: IntoIterator<Item = StdResult<O, E>>,
        It::IntoIter: Send + 'static,
        E: Into<BoxError>,
    {
        let start: Start<O> = Box::new(move || erase(f()));
        Self {
            producer: Producer::new(start, &options),
            options,
        }
    }

    pub fn name(&self) -> &str {
        &self.options.name
    }

    pub fn options(&self) -> &StageOptions {
        &self.options
    }
}

impl<O: Send + 'static> Readable<O> for Source<O> {
    fn read(&mut self, outlet: &mut Outlet<O>) -> Result<()> {
        self.producer.fill(outlet)
    }

    fn abort(&mut self) {
        self.producer.abort();
    }
}

// ── Duplex ──

/// Push input half of a [`Duplex`].
pub struct DuplexWriter<I> {
    name: String,
    channel: RendezvousChannel<I>,
    finished: bool,
}

impl<I> DuplexWriter<I> {
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl<I: Send + 'static> Writable<I> for DuplexWriter<I> {
    fn write(&mut self, item: I) -> Result<()> {
        self.channel.submit(item)?.wait()
    }

    fn finish(&mut self) -> Result<()> {
        let delivery = self.channel.submit_end()?;
        self.finished = true;
        delivery.wait()
    }

    fn abort(&mut self) {
        self.channel.close();
    }
}

impl<I> Drop for DuplexWriter<I> {
    fn drop(&mut self) {
        // An input that will never see its end must not leave the stage waiting.
        if !self.finished {
            self.channel.close();
        }
    }
}

/// Push output half of a [`Duplex`].
pub struct DuplexReader<O> {
    producer: Producer<O>,
    close_input: Box<dyn Fn() + Send>,
}

impl<O> DuplexReader<O> {
    pub fn name(&self) -> &str {
        &self.producer.stage
    }
}

impl<O: Send + 'static> Readable<O> for DuplexReader<O> {
    fn read(&mut self, outlet: &mut Outlet<O>) -> Result<()> {
        let filled = self.producer.fill(outlet);
        if filled.is_err() || outlet.is_ended() {
            // Stage function is gone; nothing will take further input.
            (self.close_input)();
        }
        filled
    }

    fn abort(&mut self) {
        (self.close_input)();
        self.producer.abort();
    }
}

impl<O> Drop for DuplexReader<O> {
    fn drop(&mut self) {
        (self.close_input)();
    }
}

/// A transform stage: push input, pull-driven push output.
pub struct Duplex<I, O> {
    writer: DuplexWriter<I>,
    reader: DuplexReader<O>,
    priming: Priming,
}

impl<I: Send + 'static, O: Send + 'static> Duplex<I, O> {
    /// Wrap a fallible transform function.
    pub fn with_options<F, It, E>(f: F, options: StageOptions) -> Self
    where
        F: FnOnce(Input<I>) -> It + Send + 'static,
        It: IntoIterator<Item = StdResult<O, E>>,
        It::IntoIter: Send + 'static,
        E: Into<BoxError>,
    {
        let (channel, input) = RendezvousChannel::with_subscriber();
        let start: Start<O> = Box::new(move || erase(f(input)));
        let closer = channel.clone();

        Self {
            priming: options.priming,
            writer: DuplexWriter {
                name: options.name.clone(),
                channel,
                finished: false,
            },
            reader: DuplexReader {
                producer: Producer::new(start, &options),
                close_input: Box::new(move || closer.close()),
            },
        }
    }

    pub fn name(&self) -> &str {
        self.writer.name()
    }

    pub fn priming(&self) -> Priming {
        self.priming
    }

    /// Separate the halves so they can be driven from different threads.
    pub fn split(self) -> (DuplexWriter<I>, DuplexReader<O>) {
        (self.writer, self.reader)
    }
}

impl<I: Send + 'static, O: Send + 'static> Writable<I> for Duplex<I, O> {
    fn write(&mut self, item: I) -> Result<()> {
        self.writer.write(item)
    }

    fn finish(&mut self) -> Result<()> {
        self.writer.finish()
    }

    fn abort(&mut self) {
        self.writer.abort();
    }
}

impl<I: Send + 'static, O: Send + 'static> Readable<O> for Duplex<I, O> {
    fn read(&mut self, outlet: &mut Outlet<O>) -> Result<()> {
        self.reader.read(outlet)
    }

    fn abort(&mut self) {
        self.reader.abort();
    }
}

// ── Sink ──

enum SinkState<I> {
    Pending(Consume<I>, Input<I>),
    Running(JoinHandle<Result<()>>),
    Failed(FlowError),
    Done,
}

/// Closes the sink's channel when its consumer thread ends, however it ends.
struct CloseOnExit<I>(RendezvousChannel<I>);

impl<I> Drop for CloseOnExit<I> {
    fn drop(&mut self) {
        self.0.close();
    }
}

/// A terminal stage consuming its input on a dedicated thread.
pub struct Sink<I> {
    options: StageOptions,
    channel: RendezvousChannel<I>,
    state: SinkState<I>,
}

impl<I: Send + 'static> Sink<I> {
    /// Wrap a fallible consumer function.
    pub fn with_options<F, E>(f: F, options: StageOptions) -> Self
    where
        F: FnOnce(Input<I>) -> StdResult<(), E> + Send + 'static,
        E: Into<BoxError>,
    {
        let (channel, input) = RendezvousChannel::with_subscriber();
        let consume: Consume<I> = Box::new(move |input| f(input).map_err(Into::into));
        let mut sink = Self {
            options,
            channel,
            state: SinkState::Pending(consume, input),
        };
        if sink.options.priming == Priming::Eager {
            if let Err(e) = sink.start() {
                sink.state = SinkState::Failed(e);
            }
        }
        sink
    }

    pub fn name(&self) -> &str {
        &self.options.name
    }

    pub fn options(&self) -> &StageOptions {
        &self.options
    }

    /// The consumer thread has been started.
    pub fn is_started(&self) -> bool {
        !matches!(self.state, SinkState::Pending(..))
    }

    fn start(&mut self) -> Result<()> {
        match std::mem::replace(&mut self.state, SinkState::Done) {
            SinkState::Pending(consume, input) => {
                let stage = self.options.name.clone();
                let guard = CloseOnExit(self.channel.clone());
                let worker = std::thread::Builder::new()
                    .name(self.options.thread_name())
                    .spawn(move || {
                        let _guard = guard;
                        tracing::debug!(stage = %stage, "Sink consumer started");
                        let result = consume(input).map_err(|e| FlowError::transform(&stage, e));
                        match &result {
                            Ok(()) => tracing::debug!(stage = %stage, "Sink consumer finished"),
                            Err(e) => tracing::warn!(stage = %stage, "Sink consumer failed: {}", e),
                        }
                        result
                    })?;
                self.state = SinkState::Running(worker);
                Ok(())
            }
            SinkState::Failed(e) => Err(e),
            other => {
                self.state = other;
                Ok(())
            }
        }
    }

    /// Wait for the consumer thread and take its outcome.
    fn join(&mut self) -> Result<()> {
        match std::mem::replace(&mut self.state, SinkState::Done) {
            SinkState::Running(worker) => match worker.join() {
                Ok(result) => result,
                Err(payload) => Err(FlowError::from_panic(&self.options.name, payload)),
            },
            SinkState::Failed(e) => Err(e),
            SinkState::Pending(..) | SinkState::Done => Ok(()),
        }
    }
}

impl<I: Send + 'static> Writable<I> for Sink<I> {
    fn write(&mut self, item: I) -> Result<()> {
        self.start()?;
        match self.channel.submit(item).and_then(|d| d.wait()) {
            Ok(()) => Ok(()),
            // The consumer stopped; report why if it failed.
            Err(e) if e.is_closed() => match self.join() {
                Err(failure) => Err(failure),
                Ok(()) => Err(FlowError::Closed),
            },
            Err(e) => Err(e),
        }
    }

    fn finish(&mut self) -> Result<()> {
        self.start()?;
        let ended = self.channel.submit_end().and_then(|d| d.wait());
        let outcome = self.join();
        match (ended, outcome) {
            (_, Err(e)) => Err(e),
            (Err(e), Ok(())) if !e.is_closed() => Err(e),
            _ => Ok(()),
        }
    }

    fn abort(&mut self) {
        self.channel.close();
        if let Err(e) = self.join() {
            tracing::debug!(stage = %self.options.name, "Aborted sink reported: {}", e);
        }
    }
}

impl<I> Drop for Sink<I> {
    fn drop(&mut self) {
        self.channel.close();
    }
}

// ── Constructors ──

/// Source from an infallible generator function.
pub fn readable<O, F, It>(f: F) -> Source<O>
where
    O: Send + 'static,
    F: FnOnce() -> It + Send + 'static,
    It: IntoIterator<Item = O>,
    It::IntoIter: Send + 'static,
{
    readable_with(StageOptions::for_role(Role::Source), f)
}

pub fn readable_with<O, F, It>(options: StageOptions, f: F) -> Source<O>
where
    O: Send + 'static,
    F: FnOnce() -> It + Send + 'static,
    It: IntoIterator<Item = O>,
    It::IntoIter: Send + 'static,
{
    Source::with_options(move || f().into_iter().map(Ok::<O, Infallible>), options)
}

/// Source from a generator yielding `Result`s; an `Err` fails the pipeline.
pub fn try_readable<O, F, It, E>(f: F) -> Source<O>
where
    O: Send + 'static,
    F: FnOnce() -> It + Send + 'static,
    It: IntoIterator<Item = StdResult<O, E>>,
    It::IntoIter: Send + 'static,
    E: Into<BoxError>,
{
    Source::with_options(f, StageOptions::for_role(Role::Source))
}

/// Transform stage from an infallible function over the input sequence.
pub fn duplex<I, O, F, It>(f: F) -> Duplex<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
    F: FnOnce(Input<I>) -> It + Send + 'static,
    It: IntoIterator<Item = O>,
    It::IntoIter: Send + 'static,
{
    duplex_with(StageOptions::for_role(Role::Duplex), f)
}

pub fn duplex_with<I, O, F, It>(options: StageOptions, f: F) -> Duplex<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
    F: FnOnce(Input<I>) -> It + Send + 'static,
    It: IntoIterator<Item = O>,
    It::IntoIter: Send + 'static,
{
    Duplex::with_options(
        move |input| f(input).into_iter().map(Ok::<O, Infallible>),
        options,
    )
}

/// Transform stage whose output items are `Result`s.
pub fn try_duplex<I, O, F, It, E>(f: F) -> Duplex<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
    F: FnOnce(Input<I>) -> It + Send + 'static,
    It: IntoIterator<Item = StdResult<O, E>>,
    It::IntoIter: Send + 'static,
    E: Into<BoxError>,
{
    Duplex::with_options(f, StageOptions::for_role(Role::Duplex))
}

/// Sink from an infallible consumer function.
pub fn writable<I, F>(f: F) -> Sink<I>
where
    I: Send + 'static,
    F: FnOnce(Input<I>) + Send + 'static,
{
    writable_with(StageOptions::for_role(Role::Sink), f)
}

pub fn writable_with<I, F>(options: StageOptions, f: F) -> Sink<I>
where
    I: Send + 'static,
    F: FnOnce(Input<I>) + Send + 'static,
{
    Sink::with_options(
        move |input| {
            f(input);
            Ok::<(), Infallible>(())
        },
        options,
    )
}

/// Sink from a consumer function that may fail.
pub fn try_writable<I, F, E>(f: F) -> Sink<I>
where
    I: Send + 'static,
    F: FnOnce(Input<I>) -> StdResult<(), E> + Send + 'static,
    E: Into<BoxError>,
{
    Sink::with_options(f, StageOptions::for_role(Role::Sink))
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use crossbeam_channel::unbounded;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    /// Drive a readable to exhaustion with the given high-water mark.
    fn drain_readable<O: Send + 'static>(
        readable: &mut dyn Readable<O>,
        hwm: usize,
    ) -> Result<Vec<O>> {
        let mut out = Vec::new();
        loop {
            let mut outlet = Outlet::new(hwm);
            readable.read(&mut outlet)?;
            out.extend(outlet.drain());
            if outlet.is_ended() {
                return Ok(out);
            }
        }
    }

    #[test]
    fn test_source_respects_high_water_mark() {
        let mut source = readable(|| 0..5);
        let mut outlet = Outlet::new(2);
        source.read(&mut outlet).unwrap();
        assert_eq!(outlet.drain().collect::<Vec<_>>(), vec![0, 1]);
        assert!(!outlet.is_ended());

        assert_eq!(drain_readable(&mut source, 2).unwrap(), vec![2, 3, 4]);
    }

    #[test]
    fn test_source_function_called_lazily() {
        let called = Arc::new(AtomicBool::new(false));
        let flag = called.clone();
        let mut source = readable(move || {
            flag.store(true, Ordering::SeqCst);
            vec!["a"]
        });
        assert!(!called.load(Ordering::SeqCst));

        assert_eq!(drain_readable(&mut source, 1).unwrap(), vec!["a"]);
        assert!(called.load(Ordering::SeqCst));
    }

    #[test]
    fn test_source_error_is_transform_failure() {
        let mut source = try_readable(|| vec![Ok(1), Err(anyhow!("bad read"))]);
        let mut outlet = Outlet::new(4);
        let err = source.read(&mut outlet).unwrap_err();
        assert!(matches!(err, FlowError::Transform { .. }));
        // Output produced before the failure stays in the outlet
        assert_eq!(outlet.drain().collect::<Vec<_>>(), vec![1]);
    }

    #[test]
    fn test_duplex_transforms_written_items() {
        let (mut writer, mut reader) = duplex(|input: Input<i32>| input.map(|x| x * 2)).split();

        let producer = thread::spawn(move || {
            for i in 1..=3 {
                writer.write(i).unwrap();
            }
            writer.finish().unwrap();
        });

        assert_eq!(drain_readable(&mut reader, 1).unwrap(), vec![2, 4, 6]);
        producer.join().unwrap();
    }

    #[test]
    fn test_eager_duplex_prefetches_on_worker() {
        let options = StageOptions::for_role(Role::Duplex)
            .name("upper")
            .priming(Priming::Eager);
        let (mut writer, mut reader) =
            duplex_with(options, |input: Input<String>| input.map(|s| s.to_uppercase())).split();

        let producer = thread::spawn(move || {
            for word in ["hello", "world"] {
                writer.write(word.to_string()).unwrap();
            }
            writer.finish().unwrap();
        });

        assert_eq!(drain_readable(&mut reader, 1).unwrap(), vec!["HELLO", "WORLD"]);
        producer.join().unwrap();
    }

    #[test]
    fn test_duplex_failure_releases_writer() {
        let (mut writer, mut reader) =
            try_duplex(|input: Input<i32>| input.map(|x| Err::<i32, _>(anyhow!("rejected {}", x))))
                .split();

        let producer = thread::spawn(move || {
            let first = writer.write(1);
            let second = writer.write(2);
            (first, second)
        });

        let mut outlet = Outlet::new(1);
        let err = reader.read(&mut outlet).unwrap_err();
        assert!(err.to_string().contains("rejected 1"));

        let (first, second) = producer.join().unwrap();
        assert!(first.is_ok());
        assert!(matches!(second, Err(FlowError::Closed)));
    }

    #[test]
    fn test_duplex_panic_is_reported() {
        let (mut writer, mut reader) = duplex(|input: Input<i32>| {
            input.map(|x| {
                if x == 2 {
                    panic!("cannot handle two");
                }
                x
            })
        })
        .split();

        let producer = thread::spawn(move || {
            let _ = writer.write(1);
            let _ = writer.write(2);
        });

        let err = drain_readable(&mut reader, 1).unwrap_err();
        assert!(matches!(err, FlowError::Panicked { ref message, .. } if message.contains("two")));
        producer.join().unwrap();
    }

    fn eager(role: Role) -> StageOptions {
        StageOptions::for_role(role).priming(Priming::Eager)
    }

    /// Iterator that records when it is dropped.
    struct Tracked {
        next: u32,
        dropped: Arc<AtomicBool>,
    }

    impl Iterator for Tracked {
        type Item = u32;

        fn next(&mut self) -> Option<u32> {
            self.next += 1;
            Some(self.next)
        }
    }

    impl Drop for Tracked {
        fn drop(&mut self) {
            self.dropped.store(true, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_eager_source_error_after_prefetched_output() {
        let mut source = Source::with_options(
            || vec![Ok(1), Ok(2), Err(anyhow!("sensor offline"))],
            eager(Role::Source).name("sensor").prefetch(2),
        );
        let mut outlet = Outlet::new(8);
        let err = source.read(&mut outlet).unwrap_err();
        assert!(matches!(err, FlowError::Transform { ref stage, .. } if stage == "sensor"));
        assert_eq!(outlet.drain().collect::<Vec<_>>(), vec![1, 2]);
        // The failure is final
        assert!(drain_readable(&mut source, 1).unwrap().is_empty());
    }

    #[test]
    fn test_eager_source_panic_at_start() {
        let mut source = readable_with(eager(Role::Source), || -> Vec<u32> {
            panic!("cannot open device")
        });
        let err = drain_readable(&mut source, 1).unwrap_err();
        assert!(
            matches!(err, FlowError::Panicked { ref message, .. } if message.contains("open device"))
        );
    }

    #[test]
    fn test_eager_duplex_error_and_panic() {
        let (mut writer, mut reader) = try_duplex_eager(|input: Input<i32>| {
            input.map(|x| match x {
                1 => Ok(x),
                2 => Err(anyhow!("odd value {}", x)),
                _ => unreachable!(),
            })
        })
        .split();
        let producer = thread::spawn(move || {
            let _ = writer.write(1);
            let _ = writer.write(2);
        });
        let mut outlet = Outlet::new(4);
        let err = reader.read(&mut outlet).unwrap_err();
        assert!(err.to_string().contains("odd value 2"));
        assert_eq!(outlet.drain().collect::<Vec<_>>(), vec![1]);
        producer.join().unwrap();

        let (mut writer, mut reader) = duplex_with(eager(Role::Duplex), |input: Input<i32>| {
            input.map(|x| if x > 0 { panic!("positive") } else { x })
        })
        .split();
        let producer = thread::spawn(move || {
            let _ = writer.write(1);
        });
        let err = drain_readable(&mut reader, 1).unwrap_err();
        assert!(matches!(err, FlowError::Panicked { .. }));
        producer.join().unwrap();
    }

    fn try_duplex_eager<F, It>(f: F) -> Duplex<i32, i32>
    where
        F: FnOnce(Input<i32>) -> It + Send + 'static,
        It: IntoIterator<Item = StdResult<i32, anyhow::Error>>,
        It::IntoIter: Send + 'static,
    {
        Duplex::with_options(f, eager(Role::Duplex))
    }

    #[test]
    fn test_eager_source_worker_stops_after_abort() {
        let dropped = Arc::new(AtomicBool::new(false));
        let flag = dropped.clone();
        let mut source = readable_with(eager(Role::Source), move || Tracked {
            next: 0,
            dropped: flag,
        });

        let mut outlet = Outlet::new(1);
        source.read(&mut outlet).unwrap();
        assert_eq!(outlet.drain().collect::<Vec<_>>(), vec![1]);
        source.abort();

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while !dropped.load(Ordering::SeqCst) {
            assert!(std::time::Instant::now() < deadline, "prefetch worker kept running");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_eager_sink_starts_at_construction() {
        let (started_tx, started_rx) = unbounded();
        let (items_tx, items_rx) = unbounded();
        let mut sink = writable(move |input: Input<u32>| {
            started_tx.send(()).unwrap();
            for x in input {
                items_tx.send(x).unwrap();
            }
        });

        assert!(sink.is_started());
        started_rx.recv_timeout(Duration::from_secs(1)).unwrap();

        sink.write(1).unwrap();
        sink.write(2).unwrap();
        sink.finish().unwrap();
        assert_eq!(items_rx.try_iter().collect::<Vec<_>>(), vec![1, 2]);
    }

    #[test]
    fn test_on_demand_sink_waits_for_first_write() {
        let (started_tx, started_rx) = unbounded();
        let options = StageOptions::for_role(Role::Sink).priming(Priming::OnDemand);
        let mut sink = writable_with(options, move |input: Input<u32>| {
            started_tx.send(()).unwrap();
            input.for_each(drop);
        });

        assert!(!sink.is_started());
        assert!(started_rx.recv_timeout(Duration::from_millis(50)).is_err());

        sink.write(7).unwrap();
        assert!(started_rx.try_recv().is_ok());
        sink.finish().unwrap();
    }

    #[test]
    fn test_sink_failure_surfaces_on_write() {
        let mut sink = try_writable(|mut input: Input<u32>| match input.next() {
            Some(x) => Err(anyhow!("bad item {}", x)),
            None => Ok(()),
        });

        // The first item is consumed before the consumer fails
        sink.write(1).unwrap();
        let err = sink.write(2).unwrap_err();
        assert!(matches!(err, FlowError::Transform { ref stage, .. } if stage == "sink"));
        assert!(err.to_string().contains("bad item 1"));
    }

    #[test]
    fn test_sink_panic_surfaces_on_finish() {
        let mut sink = writable(|mut input: Input<u32>| {
            if input.next().is_some() {
                panic!("sink blew up");
            }
        });
        // Unwinding drops the input, which still acknowledges the item
        sink.write(1).unwrap();
        let err = sink.finish().unwrap_err();
        assert!(matches!(err, FlowError::Panicked { .. }));
    }

    #[test]
    fn test_sink_double_finish_is_protocol_violation() {
        let mut sink = writable(|input: Input<u32>| input.for_each(drop));
        sink.finish().unwrap();
        assert!(matches!(sink.finish(), Err(FlowError::WriteAfterEnd)));
    }

    #[test]
    fn test_sink_abort_stops_consumer() {
        let (done_tx, done_rx) = unbounded();
        let mut sink = writable(move |input: Input<u32>| {
            let seen: Vec<_> = input.collect();
            done_tx.send(seen).unwrap();
        });
        sink.write(3).unwrap();
        sink.abort();
        assert_eq!(done_rx.recv_timeout(Duration::from_secs(1)).unwrap(), vec![3]);
    }

    #[test]
    fn test_stage_options_from_config() {
        let mut config = FlowConfig::default();
        config.priming.duplex = Priming::Eager;
        config.thread_name_prefix = "test".to_string();

        let options = StageOptions::from_config(Role::Duplex, &config).name("double");
        assert_eq!(options.priming, Priming::Eager);
        assert_eq!(options.thread_name(), "test-double");
        assert_eq!(StageOptions::for_role(Role::Sink).priming, Priming::Eager);
    }
}

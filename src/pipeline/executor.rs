//! Pipeline executor — pump threads and the pipeline state machine.
//!
//! Every link between two adjacent stages is driven by its own pump thread.
//! Each pump iteration:
//! 1. Bail out if a stage at or below its downstream end has failed.
//! 2. Ask the upstream stage for output (one demand callback).
//! 3. Forward each produced item with a blocking write.
//! 4. On end of output, forward the end exactly once via `finish`.
//!
//! A write that fails with `Closed` means the downstream stage stopped
//! accepting input; the pump stops quietly and aborts its upstream so the
//! shutdown travels towards the source. Any other failure is recorded (first
//! one wins).
//!
//! Output a stage produced before it failed is never dropped: the failing
//! stage's pump flushes it and then ends the next stage's input, so every
//! stage below the failure drains to the sink. Links above the failure are
//! aborted.

use crate::error::{FlowError, Result};
use crate::pipeline::id::{LinkId, StageId};
use crate::pipeline::stream::{Outlet, Readable, Writable};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

/// Lifecycle of a pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelineState {
    /// Built but not started.
    Idle,
    /// Pumps are moving data.
    Running,
    /// Every stage saw its end and every sink flushed.
    Completed,
    /// A stage failed; siblings are being torn down.
    Failed,
}

impl PipelineState {
    pub fn is_terminal(self) -> bool {
        matches!(self, PipelineState::Completed | PipelineState::Failed)
    }
}

impl std::fmt::Display for PipelineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PipelineState::Idle => write!(f, "idle"),
            PipelineState::Running => write!(f, "running"),
            PipelineState::Completed => write!(f, "completed"),
            PipelineState::Failed => write!(f, "failed"),
        }
    }
}

struct StatusInner {
    state: PipelineState,
    failure: Option<FlowError>,
    failure_message: Option<String>,
    live_links: usize,
}

/// Shared pipeline status, updated by the pumps.
pub(crate) struct Status {
    inner: Mutex<StatusInner>,
    changed: Condvar,
    /// First failed stage, `StageId::INVALID` while healthy.
    failed_at: AtomicU32,
}

impl Status {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(StatusInner {
                state: PipelineState::Idle,
                failure: None,
                failure_message: None,
                live_links: 0,
            }),
            changed: Condvar::new(),
            failed_at: AtomicU32::new(StageId::INVALID.0),
        })
    }

    fn lock(&self) -> MutexGuard<'_, StatusInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn set_running(&self, links: usize) {
        let mut inner = self.lock();
        inner.live_links = links;
        if inner.state == PipelineState::Idle {
            inner.state = if links == 0 {
                PipelineState::Completed
            } else {
                PipelineState::Running
            };
        }
        self.changed.notify_all();
    }

    /// Record a failure. Returns `false` if an earlier failure already won.
    pub(crate) fn fail(&self, stage: StageId, error: FlowError) -> bool {
        let mut inner = self.lock();
        if inner.failure_message.is_some() {
            tracing::debug!(stage = %stage, "Further failure after pipeline failed: {}", error);
            return false;
        }
        tracing::error!(stage = %stage, "Pipeline failed: {}", error);
        self.failed_at.store(stage.0, Ordering::Release);
        inner.failure_message = Some(error.to_string());
        inner.failure = Some(error);
        inner.state = PipelineState::Failed;
        self.changed.notify_all();
        true
    }

    pub(crate) fn link_done(&self) {
        let mut inner = self.lock();
        inner.live_links = inner.live_links.saturating_sub(1);
        if inner.live_links == 0 && inner.state == PipelineState::Running {
            inner.state = PipelineState::Completed;
            tracing::info!("Pipeline completed");
        }
        self.changed.notify_all();
    }

    /// A link halts once a stage at or after its downstream end has failed.
    /// Links fed by the failed stage keep draining what it already produced.
    #[inline]
    pub(crate) fn halts(&self, link: LinkId) -> bool {
        let failed = StageId(self.failed_at.load(Ordering::Acquire));
        failed.is_valid() && failed >= link.downstream()
    }

    pub(crate) fn state(&self) -> PipelineState {
        self.lock().state
    }

    pub(crate) fn failure_message(&self) -> Option<String> {
        self.lock().failure_message.clone()
    }

    pub(crate) fn failed_stage(&self) -> Option<StageId> {
        let failed = StageId(self.failed_at.load(Ordering::Acquire));
        failed.is_valid().then_some(failed)
    }

    fn take_failure(&self) -> Option<FlowError> {
        let mut inner = self.lock();
        match inner.failure.take() {
            Some(error) => Some(error),
            // Already taken; keep reporting failure
            None => inner.failure_message.clone().map(FlowError::Aborted),
        }
    }

    /// Block until every pump has exited, or `timeout` elapses.
    fn wait_settled(&self, timeout: Duration) -> Option<PipelineState> {
        let inner = self.lock();
        let (inner, result) = self
            .changed
            .wait_timeout_while(inner, timeout, |inner| inner.live_links > 0)
            .unwrap_or_else(PoisonError::into_inner);
        if result.timed_out() {
            None
        } else {
            Some(inner.state)
        }
    }
}

/// Settings shared by every pump of one pipeline.
pub(crate) struct LinkContext {
    pub(crate) status: Arc<Status>,
    pub(crate) high_water_mark: usize,
    pub(crate) thread_prefix: String,
}

/// A type-erased link waiting to get its pump thread.
pub(crate) type PendingLink =
    Box<dyn FnOnce(&LinkContext) -> std::io::Result<JoinHandle<()>> + Send>;

/// The output of one stage wired to the input of the next.
pub(crate) struct Link<T: Send + 'static> {
    id: LinkId,
    upstream: Box<dyn Readable<T>>,
    downstream: Box<dyn Writable<T>>,
}

impl<T: Send + 'static> Link<T> {
    pub(crate) fn new(
        id: LinkId,
        upstream: Box<dyn Readable<T>>,
        downstream: Box<dyn Writable<T>>,
    ) -> Self {
        Self {
            id,
            upstream,
            downstream,
        }
    }

    pub(crate) fn into_pending(self) -> PendingLink {
        Box::new(move |ctx: &LinkContext| {
            let status = Arc::clone(&ctx.status);
            let high_water_mark = ctx.high_water_mark;
            std::thread::Builder::new()
                .name(format!("{}-link-{}", ctx.thread_prefix, self.id.0))
                .spawn(move || run_link(self, high_water_mark, &status))
        })
    }
}

enum LinkOutcome {
    /// End forwarded downstream.
    Finished,
    /// Downstream stopped accepting input.
    Stopped,
    /// A stage below this link failed.
    Aborted,
    Failed(StageId, FlowError),
}

/// Marks the link done however the pump exits.
struct LinkGuard<'a> {
    id: LinkId,
    status: &'a Status,
}

impl Drop for LinkGuard<'_> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            self.status.fail(
                self.id.upstream(),
                FlowError::Aborted(format!("pump for {} panicked", self.id)),
            );
        }
        self.status.link_done();
    }
}

/// Pump loop for one link. Runs on the link's own thread.
pub(crate) fn run_link<T: Send + 'static>(link: Link<T>, high_water_mark: usize, status: &Status) {
    let Link {
        id,
        mut upstream,
        mut downstream,
    } = link;
    let _guard = LinkGuard { id, status };
    tracing::trace!(link = %id, "Pump started");

    let outcome = loop {
        if status.halts(id) {
            break LinkOutcome::Aborted;
        }

        let mut outlet = Outlet::new(high_water_mark);
        let read = upstream.read(&mut outlet);

        // Output produced before a failure is still delivered.
        if let Some(outcome) = forward(id, &mut outlet, downstream.as_mut(), status) {
            break outcome;
        }
        if let Err(e) = read {
            break LinkOutcome::Failed(id.upstream(), e);
        }
        if outlet.is_ended() {
            if status.halts(id) {
                break LinkOutcome::Aborted;
            }
            break match downstream.finish() {
                Ok(()) => LinkOutcome::Finished,
                Err(e) if e.is_closed() => LinkOutcome::Stopped,
                Err(e) => LinkOutcome::Failed(id.downstream(), e),
            };
        }
    };

    match outcome {
        LinkOutcome::Finished => {
            tracing::trace!(link = %id, "End forwarded");
        }
        LinkOutcome::Stopped => {
            tracing::debug!(link = %id, "Downstream stopped accepting input");
            upstream.abort();
        }
        LinkOutcome::Aborted => {
            tracing::debug!(link = %id, "Tearing down above failed stage");
            downstream.abort();
            upstream.abort();
        }
        LinkOutcome::Failed(stage, error) => {
            status.fail(stage, error);
            if stage == id.upstream() {
                // Stages below drain what was produced before the failure.
                if let Err(e) = downstream.finish() {
                    tracing::debug!(link = %id, "Ending input after failure: {}", e);
                    downstream.abort();
                }
            } else {
                downstream.abort();
            }
            upstream.abort();
        }
    }
}

fn forward<T: Send + 'static>(
    id: LinkId,
    outlet: &mut Outlet<T>,
    downstream: &mut dyn Writable<T>,
    status: &Status,
) -> Option<LinkOutcome> {
    for item in outlet.drain() {
        if status.halts(id) {
            return Some(LinkOutcome::Aborted);
        }
        match downstream.write(item) {
            Ok(()) => {}
            Err(e) if e.is_closed() => return Some(LinkOutcome::Stopped),
            Err(e) => return Some(LinkOutcome::Failed(id.downstream(), e)),
        }
    }
    None
}

/// Handle on a started pipeline, held by whoever waits for its completion.
pub struct PipelineHandle {
    status: Arc<Status>,
    pumps: Vec<JoinHandle<()>>,
    stages: Vec<crate::pipeline::builder::StageInfo>,
}

impl PipelineHandle {
    pub(crate) fn new(
        status: Arc<Status>,
        pumps: Vec<JoinHandle<()>>,
        stages: Vec<crate::pipeline::builder::StageInfo>,
    ) -> Self {
        Self {
            status,
            pumps,
            stages,
        }
    }

    pub fn state(&self) -> PipelineState {
        self.status.state()
    }

    /// Stage that failed first, if any.
    pub fn failed_stage(&self) -> Option<StageId> {
        self.status.failed_stage()
    }

    /// Message of the first failure, if any.
    pub fn failure(&self) -> Option<String> {
        self.status.failure_message()
    }

    pub fn topology(&self) -> &[crate::pipeline::builder::StageInfo] {
        &self.stages
    }

    /// Wait up to `timeout` for every pump to exit. `None` on timeout.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<PipelineState> {
        self.status.wait_settled(timeout)
    }

    /// Wait for the pipeline to settle; `Err` carries the first failure.
    pub fn wait(self) -> Result<()> {
        for (index, pump) in self.pumps.into_iter().enumerate() {
            if pump.join().is_err() {
                // LinkGuard already recorded it; make sure nothing is lost.
                self.status.fail(
                    LinkId(index as u32).upstream(),
                    FlowError::Aborted(format!("pump for {} panicked", LinkId(index as u32))),
                );
            }
        }
        match self.status.take_failure() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

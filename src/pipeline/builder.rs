//! Pipeline composition.
//!
//! Stages are chained with a typed builder, so a stage whose input type does
//! not match its predecessor's output type is rejected at compile time:
//!
//! ```ignore
//! readable(|| 1..=3)
//!     .pipe(duplex(|input| input.map(|x| x * 2)))
//!     .to(writable(|input| input.for_each(|x| println!("{x}"))))
//!     .run()?;
//! ```

use crate::config::{FlowConfig, Priming};
use crate::error::{FlowError, Result, ResultExt};
use crate::pipeline::executor::{Link, LinkContext, PendingLink, PipelineHandle, Status};
use crate::pipeline::id::{LinkId, StageId};
use crate::pipeline::stage::{Duplex, Role, Sink, Source};
use crate::pipeline::stream::Readable;
use std::sync::Arc;

/// Description of one stage in a composed pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageInfo {
    pub id: StageId,
    pub name: String,
    pub role: Role,
    pub priming: Priming,
}

/// A partially composed pipeline whose last stage outputs `T`.
pub struct PipelineBuilder<T: Send + 'static> {
    config: FlowConfig,
    head: Box<dyn Readable<T>>,
    links: Vec<PendingLink>,
    stages: Vec<StageInfo>,
}

impl<T: Send + 'static> PipelineBuilder<T> {
    pub fn new(source: Source<T>) -> Self {
        let stages = vec![StageInfo {
            id: StageId(0),
            name: source.name().to_string(),
            role: Role::Source,
            priming: source.options().priming,
        }];
        Self {
            config: FlowConfig::default(),
            head: Box::new(source),
            links: Vec::new(),
            stages,
        }
    }

    /// Use `config` for the pumps (high-water mark, thread names).
    pub fn with_config(mut self, config: FlowConfig) -> Self {
        self.config = config;
        self
    }

    fn next_ids(&self) -> (StageId, LinkId) {
        let stage = StageId(self.stages.len() as u32);
        (stage, LinkId(stage.0 - 1))
    }

    /// Append a transform stage.
    pub fn pipe<U: Send + 'static>(self, stage: Duplex<T, U>) -> PipelineBuilder<U> {
        let (id, link) = self.next_ids();
        let Self {
            config,
            head,
            mut links,
            mut stages,
        } = self;
        stages.push(StageInfo {
            id,
            name: stage.name().to_string(),
            role: Role::Duplex,
            priming: stage.priming(),
        });

        let (writer, reader) = stage.split();
        links.push(Link::new(link, head, Box::new(writer)).into_pending());

        PipelineBuilder {
            config,
            head: Box::new(reader),
            links,
            stages,
        }
    }

    /// Terminate the chain with a sink.
    pub fn to(mut self, sink: Sink<T>) -> Pipeline {
        let (id, link) = self.next_ids();
        self.stages.push(StageInfo {
            id,
            name: sink.name().to_string(),
            role: Role::Sink,
            priming: sink.options().priming,
        });
        self.links.push(Link::new(link, self.head, Box::new(sink)).into_pending());

        Pipeline {
            config: self.config,
            links: self.links,
            stages: self.stages,
        }
    }
}

impl<O: Send + 'static> Source<O> {
    /// Start a chain with this source and the given pump settings.
    pub fn with_config(self, config: FlowConfig) -> PipelineBuilder<O> {
        PipelineBuilder::new(self).with_config(config)
    }

    pub fn pipe<U: Send + 'static>(self, stage: Duplex<O, U>) -> PipelineBuilder<U> {
        PipelineBuilder::new(self).pipe(stage)
    }

    pub fn to(self, sink: Sink<O>) -> Pipeline {
        PipelineBuilder::new(self).to(sink)
    }
}

/// A fully composed pipeline that has not been started yet.
pub struct Pipeline {
    config: FlowConfig,
    links: Vec<PendingLink>,
    stages: Vec<StageInfo>,
}

impl Pipeline {
    /// Stages in order, source first.
    pub fn topology(&self) -> &[StageInfo] {
        &self.stages
    }

    /// Spawn one pump per link and hand back the terminal handle.
    pub fn start(self) -> Result<PipelineHandle> {
        self.config.validate()?;

        let status = Status::new();
        status.set_running(self.links.len());
        let ctx = LinkContext {
            status: Arc::clone(&status),
            high_water_mark: self.config.high_water_mark,
            thread_prefix: self.config.thread_name_prefix.clone(),
        };

        for stage in &self.stages {
            let configured = self.config.priming.for_role(stage.role);
            if stage.priming != configured {
                tracing::debug!(
                    stage = %stage.name,
                    "Stage primes {} while the pipeline config says {}; stage options apply",
                    stage.priming,
                    configured
                );
            }
        }

        tracing::info!(
            "Starting pipeline: {}",
            self.stages
                .iter()
                .map(|s| s.name.as_str())
                .collect::<Vec<_>>()
                .join(" -> ")
        );

        let total = self.links.len();
        let mut pumps = Vec::with_capacity(total);
        for (index, pending) in self.links.into_iter().enumerate() {
            match pending(&ctx) {
                Ok(pump) => pumps.push(pump),
                Err(e) => {
                    // Unspawned links were dropped with their stages, which
                    // closes their channels and winds down the running pumps.
                    let link = LinkId(index as u32);
                    status.fail(
                        link.upstream(),
                        FlowError::Aborted(format!("failed to spawn pump for {}: {}", link, e)),
                    );
                    for _ in index..total {
                        status.link_done();
                    }
                    return Err(FlowError::Io(e)).context("Failed to start pipeline");
                }
            }
        }

        Ok(PipelineHandle::new(status, pumps, self.stages))
    }

    /// Start and wait for completion.
    pub fn run(self) -> Result<()> {
        self.start()?.wait()
    }
}

/// Compose `source`, a chain of same-typed transforms and `sink`, and start
/// the pipeline immediately.
pub fn pipe<T: Send + 'static>(
    source: Source<T>,
    transforms: Vec<Duplex<T, T>>,
    sink: Sink<T>,
) -> Result<PipelineHandle> {
    transforms
        .into_iter()
        .fold(PipelineBuilder::new(source), |builder, stage| {
            builder.pipe(stage)
        })
        .to(sink)
        .start()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::channel::Input;
    use crate::pipeline::executor::PipelineState;
    use crate::pipeline::stage::{duplex, readable, try_duplex, writable, StageOptions};
    use anyhow::anyhow;
    use std::sync::Mutex;
    use std::time::Duration;

    fn collector<T: Send + 'static>() -> (Sink<T>, Arc<Mutex<Vec<T>>>) {
        let collected = Arc::new(Mutex::new(Vec::new()));
        let out = collected.clone();
        let sink = writable(move |input: Input<T>| {
            for item in input {
                out.lock().unwrap().push(item);
            }
        });
        (sink, collected)
    }

    #[test]
    fn test_topology_lists_stages_in_order() {
        let (sink, _) = collector::<String>();
        let pipeline = readable(|| vec![1u32])
            .pipe(duplex_with_name("stringify", |input: Input<u32>| {
                input.map(|x| x.to_string())
            }))
            .to(sink);

        let roles: Vec<_> = pipeline.topology().iter().map(|s| s.role).collect();
        assert_eq!(roles, vec![Role::Source, Role::Duplex, Role::Sink]);
        assert_eq!(pipeline.topology()[1].name, "stringify");
        assert_eq!(pipeline.topology()[2].id, StageId(2));
        assert_eq!(pipeline.topology()[2].priming, Priming::Eager);
        pipeline.run().unwrap();
    }

    fn duplex_with_name<I, O, F, It>(name: &str, f: F) -> Duplex<I, O>
    where
        I: Send + 'static,
        O: Send + 'static,
        F: FnOnce(Input<I>) -> It + Send + 'static,
        It: IntoIterator<Item = O>,
        It::IntoIter: Send + 'static,
    {
        crate::pipeline::stage::duplex_with(StageOptions::for_role(Role::Duplex).name(name), f)
    }

    #[test]
    fn test_source_straight_to_sink() {
        let (sink, collected) = collector();
        readable(|| vec!["a", "b"]).to(sink).run().unwrap();
        assert_eq!(*collected.lock().unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn test_homogeneous_pipe_runs_every_transform() {
        let (sink, collected) = collector();
        let handle = pipe(
            readable(|| 1..=3),
            vec![
                duplex(|input: Input<i32>| input.map(|x| x + 1)),
                duplex(|input: Input<i32>| input.map(|x| x * 10)),
            ],
            sink,
        )
        .unwrap();

        assert_eq!(
            handle.wait_timeout(Duration::from_secs(5)),
            Some(PipelineState::Completed)
        );
        handle.wait().unwrap();
        assert_eq!(*collected.lock().unwrap(), vec![20, 30, 40]);
    }

    #[test]
    fn test_failure_reports_failing_stage() {
        let (sink, collected) = collector();
        let handle = readable(|| vec![1, 2, 3])
            .pipe(try_duplex(|input: Input<i32>| {
                input.map(|x| {
                    if x == 2 {
                        Err(anyhow!("two is not allowed"))
                    } else {
                        Ok(x)
                    }
                })
            }))
            .to(sink)
            .start()
            .unwrap();

        assert_eq!(
            handle.wait_timeout(Duration::from_secs(5)),
            Some(PipelineState::Failed)
        );
        assert_eq!(handle.failed_stage(), Some(StageId(1)));
        assert!(handle.failure().unwrap().contains("two is not allowed"));
        assert!(handle.wait().is_err());
        assert_eq!(*collected.lock().unwrap(), vec![1]);
    }

    #[test]
    fn test_wait_timeout_expires_while_sink_is_held() {
        let (gate_tx, gate_rx) = crossbeam_channel::bounded::<()>(0);
        let sink = writable(move |input: Input<u8>| {
            let _ = gate_rx.recv();
            input.for_each(drop);
        });
        let handle = readable(|| vec![1u8]).to(sink).start().unwrap();

        assert_eq!(handle.wait_timeout(Duration::from_millis(50)), None);
        assert_eq!(handle.state(), PipelineState::Running);

        gate_tx.send(()).unwrap();
        handle.wait().unwrap();
    }

    #[test]
    fn test_topology_reports_stage_priming_over_config() {
        let (sink, collected) = collector();
        let mut config = FlowConfig::default();
        config.priming.duplex = Priming::Eager;

        let pipeline = readable(|| vec![1, 2])
            .with_config(config)
            .pipe(duplex(|input: Input<i32>| input.map(|x| x + 1)))
            .to(sink);

        // Stages were built with their own options before the config arrived
        assert_eq!(pipeline.topology()[1].priming, Priming::OnDemand);
        pipeline.run().unwrap();
        assert_eq!(*collected.lock().unwrap(), vec![2, 3]);
    }

    #[test]
    fn test_invalid_config_refuses_to_start() {
        let (sink, _) = collector::<u8>();
        let config = FlowConfig {
            high_water_mark: 0,
            ..FlowConfig::default()
        };
        let result = readable(|| vec![1u8]).with_config(config).to(sink).start();
        assert!(matches!(result, Err(FlowError::Config(_))));
    }
}

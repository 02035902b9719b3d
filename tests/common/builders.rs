//! Test stage builders

use flowbridge::pipeline::{writable_with, Input, Role, Sink, StageOptions};
use std::sync::{Arc, Mutex};

/// Collects everything a pipeline delivers
#[derive(Clone)]
pub struct Collected<T>(Arc<Mutex<Vec<T>>>);

impl<T: Clone> Collected<T> {
    pub fn items(&self) -> Vec<T> {
        self.0.lock().unwrap().clone()
    }
}

/// Builder for a sink that records its input
pub struct CollectorBuilder {
    options: StageOptions,
}

impl CollectorBuilder {
    pub fn new() -> Self {
        Self {
            options: StageOptions::for_role(Role::Sink).name("collect"),
        }
    }

    pub fn options(mut self, options: StageOptions) -> Self {
        self.options = options;
        self
    }

    pub fn build<T: Send + 'static>(self) -> (Sink<T>, Collected<T>) {
        let collected = Collected(Arc::new(Mutex::new(Vec::new())));
        let out = collected.0.clone();
        let sink = writable_with(self.options, move |input: Input<T>| {
            for item in input {
                out.lock().unwrap().push(item);
            }
        });
        (sink, collected)
    }
}

/// Shorthand for a default collector
pub fn collector<T: Send + 'static>() -> (Sink<T>, Collected<T>) {
    CollectorBuilder::new().build()
}

//! # flowbridge: push/pull rendezvous pipelines
//!
//! Write pipeline stages as plain iterator code and compose them into a
//! pipeline that pushes data between them with end-to-end backpressure.
//!
//! ## Architecture
//!
//! - **Rendezvous channel**: a push completes once the pulling side has
//!   finished with the item.
//! - **Stage adapters**: wrap source, transform and sink functions behind
//!   the push-side [`Writable`]/[`Readable`] traits.
//! - **Pipeline composer**: wires stages with one pump thread per link and
//!   reports the first failure.
//!
//! ## Example
//!
//! ```ignore
//! use flowbridge::{duplex, readable, writable};
//!
//! readable(|| vec!["hello", "world"])
//!     .pipe(duplex(|input| input.map(|s: &str| s.to_uppercase())))
//!     .to(writable(|input| input.for_each(|s| println!("{s}"))))
//!     .run()?;
//! ```

pub mod config;
pub mod error;
pub mod pipeline;

// Re-export commonly used types
pub use config::{FlowConfig, Priming, PrimingConfig};
pub use error::{FlowError, Result, ResultExt};
pub use pipeline::{
    duplex, pipe, readable, try_duplex, try_readable, try_writable, writable, Input, Pipeline,
    PipelineHandle, PipelineState, Readable, RendezvousChannel, StageOptions, Writable,
};

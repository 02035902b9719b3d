//! Push/pull bridged pipeline architecture.
//!
//! Stage functions are written as pull-based iterator code, while the
//! pipeline moves data by pushing it from stage to stage. The rendezvous
//! channel connects the two: a push returns only once the pulling consumer
//! has finished with the item, so backpressure crosses every stage boundary.
//!
//! # Architecture
//!
//! ```text
//! [Source] ──pump──► [Duplex] ──pump──► [Duplex] ──pump──► [Sink]
//!   read()         write() | read()   write() | read()   write()
//! ```
//!
//! # Design
//!
//! - **One pump thread per link**: reads the upstream, blocks on the downstream write.
//! - **Rendezvous handoff**: `Mutex<VecDeque>` + `Condvar`, acknowledged on the next pull.
//! - **Typed composition**: mismatched stage types fail to compile.
//! - **First failure wins**: the pipeline reports one error and tears down the rest.

pub mod builder;
pub mod channel;
pub mod executor;
pub mod id;
pub mod stage;
pub mod stream;

pub use builder::{pipe, Pipeline, PipelineBuilder, StageInfo};
pub use channel::{ChannelStats, Delivery, Element, Input, RendezvousChannel};
pub use executor::{PipelineHandle, PipelineState};
pub use id::{LinkId, StageId};
pub use stage::{
    duplex, duplex_with, readable, readable_with, try_duplex, try_readable, try_writable, writable,
    writable_with, Duplex, DuplexReader, DuplexWriter, Role, Sink, Source, StageOptions,
};
pub use stream::{Outlet, Readable, Writable};

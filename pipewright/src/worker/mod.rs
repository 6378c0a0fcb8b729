//! Stage processors and the workers that run them.
//!
//! - [`StageProcessor`]: the async contract every agent implements
//! - [`ProcessorRegistry`]: agent name → processor, fixed at startup
//! - [`WorkerPool`]: pulls jobs from queues and invokes processors

pub mod demo;
mod pool;
mod processor;
mod registry;

pub use pool::{PoolError, PoolStats, WorkerPool, WorkerPoolConfig};
pub use processor::{FnProcessor, ProcessorContext, Services, StageProcessor};
pub use registry::ProcessorRegistry;

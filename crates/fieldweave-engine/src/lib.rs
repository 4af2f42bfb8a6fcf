#![doc = include_str!("../README.md")]

pub mod engine;
pub mod exchange;
pub mod fault;
pub mod pool;
pub mod post;
pub mod pre;
pub mod queue;
pub mod state;
#[cfg(any(test, feature = "testutil"))]
pub mod testutil;

pub use engine::Pipeline;
pub use exchange::{EngineStates, FrameSource, OutputFrame, SourceFrame, StreamEvent};
pub use state::{EngineConfig, EngineMetrics, RunMode};

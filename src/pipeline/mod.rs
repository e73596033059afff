//! Frame pipeline: controller, consumer worker and their state

pub mod controller;
pub mod state;
pub mod worker;

pub use controller::{
    CancelHandle, PipelineController, PipelineOptions, PipelineResult, SinkFactory, StopReason,
};
pub use state::{PipelineState, StateCell};
pub use worker::{WorkerExit, WorkerOptions, WorkerReport};

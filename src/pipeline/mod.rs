//! Bounce pipeline: extract → classify → retry, driven by the run controller.

pub mod extract;
pub mod processor;
pub mod retry;
pub mod rules;
pub mod scheduler;
pub mod types;

pub use processor::{BounceProcessor, ProcessorDeps};
pub use scheduler::{BounceWorker, WorkerHandle, spawn_bounce_worker};
pub use types::{RunReport, StateDocument};

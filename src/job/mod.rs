//! sbatchd-local job objects.
//!
//! - [`JobSpec`]: the job description dispatched by mbatchd
//! - [`Job`]: the per-job pipeline state owned by the executor

pub mod model;
pub mod spec;

pub use model::{Job, JobState, PipelineStep};
pub use spec::JobSpec;

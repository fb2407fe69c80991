pub mod aggregate;
pub mod digest;
pub mod job;
pub mod manifest;
pub mod matrix;
pub mod observability;
pub mod presets;
pub mod publish;
pub mod store;
pub mod validation;
pub mod workflow;

pub use aggregate::{AggregateGate, aggregate};
pub use job::{JobResult, JobRunner, run_matrix};
pub use matrix::{MatrixEntry, MatrixSpec};
pub use publish::{PublisherState, ReleasePublisher};
pub use store::ArtifactStore;
pub use workflow::Workflow;

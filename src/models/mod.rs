pub mod artifact;
pub mod attempt;
pub mod checkpoint;
pub mod job;
pub mod loaders;
pub mod resource;
pub mod worker_handle;

pub use artifact::Artifact;
pub use attempt::{Attempt, AttemptOutcome};
pub use checkpoint::Checkpoint;
pub use job::{split_into_batches, Batch, BatchState, InputIdentity, Job};
pub use loaders::{load_codes, parse_codes};
pub use resource::ResourceSample;
pub use worker_handle::{WorkerHandle, WorkerRegistry};

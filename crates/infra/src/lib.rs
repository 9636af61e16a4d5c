//! Infrastructure layer: reminder scheduling, storage backends, workers.

pub mod jobs;

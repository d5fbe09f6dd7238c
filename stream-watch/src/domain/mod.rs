//! Domain types for watched stream targets.

pub mod observation;
pub mod status;
pub mod target;

pub use observation::Observation;
pub use status::StreamStatus;
pub use target::{Target, TargetKey};

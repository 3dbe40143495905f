//! Running estimators fed by the device loops.

pub mod hashrate;
pub mod jobs;

pub use hashrate::HashRateBuckets;
pub use jobs::{JobBuckets, JobSummary};

//! Scheduled background jobs with fleet-wide leader election

pub mod leader;
pub mod runner;

pub use leader::{LeaderElector, LEASE_DURATION, RENEW_DEADLINE, RETRY_PERIOD};
pub use runner::{JobRunner, JobSpec};

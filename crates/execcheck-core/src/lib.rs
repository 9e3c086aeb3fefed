//! Verification harness for stdout isolation of concurrent exec processes.
//!
//! Many processes are started against one shared container [`Task`]; each
//! gets its own [`OutputSink`], and every worker's exit code and output are
//! checked independently. [`harness::verify`] returns the full list of
//! failures once every worker has finished.
//!
//! [`Task`]: runtime::Task
//! [`OutputSink`]: sink::OutputSink

pub mod aggregator;
pub mod error;
pub mod fixture;
pub mod harness;
pub mod report;
pub mod runner;
pub mod runtime;
pub mod sink;
pub mod stress;

pub use error::{FailureKind, VerificationError, WorkerIndex};
pub use harness::{verify, verify_report};
pub use runner::{RunnerConfig, Scenario, run_process};

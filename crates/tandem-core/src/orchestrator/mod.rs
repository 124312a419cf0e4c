//! The scheduling loop and its final report.
//!
//! `Orchestrator` owns the task graph, the ownership registry and the
//! workflow context; workers only talk to it through channels.

pub mod recovery;
pub mod report;
pub mod scheduler;

pub use report::{FailureRecord, FinalReport, RunOutcome};
pub use scheduler::{Orchestrator, WorkerInfo};

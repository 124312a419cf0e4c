pub mod checkpoint;
pub mod config;
pub mod context;
pub mod error;
pub mod graph;
pub mod io;
pub mod migrations;
pub mod orchestrator;
pub mod ownership;
pub mod paths;
pub mod plan;
pub mod store;
pub mod task;
pub mod types;
pub mod worker;
pub mod workflow;

pub use error::{Result, TandemError};

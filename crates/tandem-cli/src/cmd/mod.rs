pub mod checkpoint;
pub mod config;
pub mod context;
pub mod init;
pub mod plan;
pub mod run;
pub mod status;
pub mod task;

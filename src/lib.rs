pub mod aggregate;
pub mod api;
pub mod config;
pub mod dataref;
pub mod dispatch;
pub mod error;
pub mod job;
pub mod orchestrator;
pub mod partition;
pub mod registry;
pub mod tracker;

//! Conveyor: an autonomous enhancement delivery pipeline.
//!
//! Enhancement requests enter a durable SQLite queue, get picked up by a
//! polling orchestrator that plans and implements them with an AI service,
//! pushes a branch, opens a pull request, runs automated review, and hands
//! off to a deployment scheduler that merges on the scheduled date.

pub mod ai;
pub mod codegen;
pub mod config;
pub mod deploy;
pub mod errors;
pub mod host;
pub mod models;
pub mod notify;
pub mod pipeline;
pub mod planner;
pub mod review;
pub mod store;
pub mod workspace;

// Common library: dispatch and scheduling core shared by the server and tests

pub mod address;
pub mod catalog;
pub mod config;
pub mod dispatch;
pub mod errors;
pub mod events;
pub mod hub;
pub mod models;
pub mod schedule;
pub mod scheduler;
pub mod stats;
pub mod store;
pub mod telemetry;

// Connection hub module for live session tracking and push delivery

pub mod membership;
pub mod registry;

pub use membership::{ConnectionInfo, Membership};
pub use registry::{ConnectionHandle, ConnectionHub, OutboundFrame};

// Dispatch module: provider directory, framing and the dispatch engine

pub mod engine;
pub mod frame;
pub mod providers;

pub use engine::DispatchEngine;
pub use frame::{encode_frame, WebsocketConfig};
pub use providers::{OutboundChannel, ProviderRegistry};

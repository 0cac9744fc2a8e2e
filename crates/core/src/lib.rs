pub mod agents;
pub mod bus;
pub mod checkpoint;
pub mod context;
pub mod dispatch;
pub mod events;
pub mod mcp;
pub mod orchestrator;
pub mod plan;
pub mod registry;
pub mod reports;
pub mod routing;
pub mod segmenter;
pub mod voice;

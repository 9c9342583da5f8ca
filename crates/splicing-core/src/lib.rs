pub mod collaborators;
pub mod config;
pub mod conversation;
pub mod error;
pub mod event_bus;
pub mod graph;
pub mod pipeline;
pub mod prompts;
pub mod synchronizer;
pub mod turn_locks;

pub use collaborators::*;
pub use config::*;
pub use conversation::*;
pub use error::*;
pub use event_bus::*;
pub use graph::*;
pub use pipeline::*;
pub use prompts::*;
pub use synchronizer::*;
pub use turn_locks::*;

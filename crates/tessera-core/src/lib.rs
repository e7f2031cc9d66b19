pub mod config;
pub mod error;
pub mod graph;
pub mod state;
pub mod traits;
pub mod types;

pub use config::AppConfig;
pub use error::{Result, TesseraError};
pub use graph::{Edge, Graph, Node, NodeKind};
pub use state::{NeededInput, NodeStatus, ProvidedInput, RunState};
pub use types::*;

pub mod client;
pub mod event;
pub mod projector;

pub use client::{run_to_completion, Client, InputCollector};
pub use event::ProjectedEvent;
pub use projector::{project, ProjectorOptions, RunQueries};

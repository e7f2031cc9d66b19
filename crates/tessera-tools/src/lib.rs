pub mod builtin;
pub mod kind;
pub mod registry;
pub mod store;

pub use kind::ToolKind;
pub use registry::ToolRegistry;
pub use store::LocalFileStore;

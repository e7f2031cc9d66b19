pub mod activities;
pub mod broker;
pub mod engine;
pub mod executor;
pub mod init;
pub mod replay;
pub mod scheduler;
pub mod template;

pub use activities::{Activities, LocalActivities};
pub use broker::InputBroker;
pub use engine::{Engine, ExecutionHandle, RunRequest};
pub use executor::{NodeExecutor, NodeOutcome};
pub use init::init_run_state;
pub use replay::{ReplayClient, ScriptedTurn};
pub use scheduler::{ExecutionStatus, Scheduler};

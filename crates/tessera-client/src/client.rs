use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::stream::{self, BoxStream, StreamExt};
use tracing::{debug, info, warn};

use tessera_core::error::Result;
use tessera_core::state::{NeededInput, ProvidedInput, RunState};
use tessera_core::types::RunId;
use tessera_engine::{Engine, ExecutionHandle, RunRequest};

use crate::event::ProjectedEvent;
use crate::projector::{project, ProjectorOptions};

/// Answers needed input on behalf of a human.
pub trait InputCollector: Send + Sync {
    fn collect(&self, needed: Vec<NeededInput>) -> BoxFuture<'_, Result<Vec<ProvidedInput>>>;
}

/// Convenience front end over an [`Engine`].
pub struct Client {
    engine: Arc<Engine>,
    options: ProjectorOptions,
}

impl Client {
    pub fn new(engine: Arc<Engine>) -> Self {
        let options = ProjectorOptions::from(&engine.config().client);
        Self { engine, options }
    }

    pub fn with_options(mut self, options: ProjectorOptions) -> Self {
        self.options = options;
        self
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    pub fn start(&self, request: RunRequest) -> Result<ExecutionHandle> {
        self.engine.start(request)
    }

    /// Follow a run by id. Unknown runs yield an empty stream.
    pub fn events(&self, run_id: &RunId) -> BoxStream<'static, ProjectedEvent> {
        match self.engine.handle(run_id) {
            Ok(handle) => project(handle, self.options),
            Err(e) => {
                debug!(run_id = %run_id, error = %e, "No execution to follow");
                stream::empty().boxed()
            }
        }
    }

    /// Start a run and drive it to its end, answering input through `collector`.
    pub async fn run(&self, request: RunRequest, collector: &dyn InputCollector) -> Result<RunState> {
        let handle = self.start(request)?;
        run_to_completion(&handle, collector, self.options.poll_interval).await
    }
}

/// Wait for the run's final state while feeding every needed-input request
/// to `collector`.
///
/// After answering, the next look at pending requests waits one
/// `poll_interval`, so answers that match nothing are asked for again at
/// the poll rate.
pub async fn run_to_completion(
    handle: &ExecutionHandle,
    collector: &dyn InputCollector,
    poll_interval: Duration,
) -> Result<RunState> {
    let result = handle.result();
    tokio::pin!(result);
    let mut delay = Duration::ZERO;
    let mut last_asked: Vec<NeededInput> = Vec::new();

    loop {
        tokio::select! {
            state = &mut result => return state,
            needed = next_needed(handle, poll_interval, delay) => {
                let needed = needed?;
                if needed == last_asked {
                    warn!(
                        run_id = %handle.run_id(),
                        count = needed.len(),
                        "Answers matched no pending request, asking again"
                    );
                }
                info!(run_id = %handle.run_id(), count = needed.len(), "Collecting input");
                let answers = collector.collect(needed.clone()).await?;
                handle.receive_input(answers)?;
                last_asked = needed;
                delay = poll_interval;
            }
        }
    }
}

async fn next_needed(
    handle: &ExecutionHandle,
    poll_interval: Duration,
    delay: Duration,
) -> Result<Vec<NeededInput>> {
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
    loop {
        let needed = handle.needed_input().await?;
        if !needed.is_empty() {
            return Ok(needed);
        }
        tokio::time::sleep(poll_interval).await;
    }
}

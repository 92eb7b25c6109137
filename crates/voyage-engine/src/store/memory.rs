use std::collections::HashMap;
use std::sync::Mutex;

use futures::future::BoxFuture;

use voyage_core::context::ExecutionContext;
use voyage_core::error::{Result, VoyageError};
use voyage_core::traits::ContextStore;
use voyage_core::types::RunId;

use super::check_revision;

/// Process-local context store. Contexts are lost when the process exits.
#[derive(Default)]
pub struct MemoryStore {
    runs: Mutex<HashMap<RunId, ExecutionContext>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.runs.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ContextStore for MemoryStore {
    fn load(&self, run_id: &RunId) -> BoxFuture<'_, Result<ExecutionContext>> {
        let run_id = run_id.clone();
        Box::pin(async move {
            let runs = self
                .runs
                .lock()
                .map_err(|e| VoyageError::Database(e.to_string()))?;
            runs.get(&run_id)
                .cloned()
                .ok_or(VoyageError::NotFound(run_id))
        })
    }

    fn save(&self, ctx: &ExecutionContext) -> BoxFuture<'_, Result<()>> {
        let ctx = ctx.clone();
        Box::pin(async move {
            let mut runs = self
                .runs
                .lock()
                .map_err(|e| VoyageError::Database(e.to_string()))?;
            let stored = runs.get(ctx.run_id()).map(|c| c.revision());
            check_revision(ctx.run_id(), stored, ctx.revision())?;
            runs.insert(ctx.run_id().clone(), ctx);
            Ok(())
        })
    }

    fn list(&self) -> BoxFuture<'_, Result<Vec<ExecutionContext>>> {
        Box::pin(async move {
            let runs = self
                .runs
                .lock()
                .map_err(|e| VoyageError::Database(e.to_string()))?;
            let mut all: Vec<ExecutionContext> = runs.values().cloned().collect();
            all.sort_by(|a, b| b.created_at().cmp(&a.created_at()));
            Ok(all)
        })
    }
}

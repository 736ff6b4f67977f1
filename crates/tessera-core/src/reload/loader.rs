//! Sources of unit registries.

use crate::error::Result;
use crate::ipc::{WorkerHandle, WorkerProgram};
use crate::registry::UnitRegistry;

/// Builds a fresh registry from the current user code.
///
/// Called on a blocking thread; implementations may do IO or spawn processes.
pub trait UnitLoader: Send + Sync {
    fn load(&self) -> Result<UnitRegistry>;
}

impl<F> UnitLoader for F
where
    F: Fn() -> Result<UnitRegistry> + Send + Sync,
{
    fn load(&self) -> Result<UnitRegistry> {
        self()
    }
}

/// Loads the registry by asking a short-lived worker for its catalog.
#[derive(Debug, Clone)]
pub struct WorkerCatalogLoader {
    program: WorkerProgram,
}

impl WorkerCatalogLoader {
    pub fn new(program: WorkerProgram) -> Self {
        Self { program }
    }
}

impl UnitLoader for WorkerCatalogLoader {
    fn load(&self) -> Result<UnitRegistry> {
        let mut worker = WorkerHandle::spawn(&self.program)?;
        let catalog = worker.describe()?;
        if let Err(e) = worker.shutdown() {
            tracing::debug!("Catalog worker shutdown: {}", e);
        }
        tracing::debug!("Loaded catalog with {} units", catalog.units.len());
        UnitRegistry::from_catalog(catalog)
    }
}

//! Engine registry: local engines keyed by flavor.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use aigc_common::Flavor;

use super::EngineAdapter;

/// Registry of the local engines this gateway can drive.
pub struct EngineRegistry {
    engines: RwLock<HashMap<Flavor, Arc<dyn EngineAdapter>>>,
}

impl EngineRegistry {
    pub fn new() -> Self {
        Self {
            engines: RwLock::new(HashMap::new()),
        }
    }

    /// Register an engine, replacing any engine of the same flavor.
    pub async fn register(&self, engine: Arc<dyn EngineAdapter>) {
        let mut engines = self.engines.write().await;
        engines.insert(engine.flavor(), engine);
    }

    /// Get the engine serving `flavor`.
    pub async fn get(&self, flavor: Flavor) -> Option<Arc<dyn EngineAdapter>> {
        let engines = self.engines.read().await;
        engines.get(&flavor).cloned()
    }

    /// Get the engine for a flavor name as stored on a provider record.
    pub async fn get_by_name(&self, flavor: &str) -> Option<Arc<dyn EngineAdapter>> {
        let flavor = flavor.parse::<Flavor>().ok()?;
        self.get(flavor).await
    }

    /// Get all registered engines.
    pub async fn all(&self) -> Vec<Arc<dyn EngineAdapter>> {
        let engines = self.engines.read().await;
        engines.values().cloned().collect()
    }
}

impl Default for EngineRegistry {
    fn default() -> Self {
        Self::new()
    }
}

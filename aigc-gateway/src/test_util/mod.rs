//! Fixtures shared by unit and integration tests.

mod fake_engine;

pub use fake_engine::FakeEngine;

use std::sync::Arc;

use crate::auth::Authenticators;
use crate::config::VerifyConfig;
use crate::engine::EngineRegistry;
use crate::registry::ServiceRegistry;
use crate::store::{EntityStore, SqliteStore};
use crate::verify::Verifier;

/// A verifier with the default authenticators and a short timeout.
pub fn test_verifier() -> Verifier {
    Verifier::new(&VerifyConfig { timeout_secs: 5 }, Authenticators::default()).unwrap()
}

/// A registry over a fresh in-memory store with `engine` as the Ollama engine.
pub async fn registry_with(engine: FakeEngine) -> (ServiceRegistry<SqliteStore>, Arc<FakeEngine>) {
    let store = SqliteStore::in_memory().unwrap();
    store.init().unwrap();

    let engine = Arc::new(engine);
    let engines = Arc::new(EngineRegistry::new());
    engines.register(engine.clone()).await;

    let registry = ServiceRegistry::new(Arc::new(store), engines, test_verifier());
    (registry, engine)
}

//! AIGC gateway - runs the registry core with its local engines and health monitor.

use std::env;
use std::sync::Arc;

use aigc_gateway::{
    logging, Authenticators, Config, EngineAdapter, EngineRegistry, EntityStore, HealthMonitor,
    OllamaEngine, ServiceRegistry, SqliteStore, Verifier,
};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().collect();
    if args.iter().any(|a| a == "--version" || a == "-V") {
        println!("aigc-gateway {}", VERSION);
        return Ok(());
    }

    let config = Config::load().map_err(|e| {
        format!(
            "Failed to load configuration: {}. \
             Check config.toml or the AIGC__* environment variables.",
            e
        )
    })?;
    logging::init(&config.logging);
    tracing::info!(version = VERSION, database = %config.database.path, "Starting aigc-gateway");

    let store = Arc::new(SqliteStore::open(&config.database.path)?);
    store.init()?;

    let engines = Arc::new(EngineRegistry::new());
    if let Some(ref ollama) = config.engines.ollama {
        if ollama.enabled {
            engines.register(Arc::new(OllamaEngine::new(ollama.clone()))).await;
            tracing::info!(base_url = %ollama.base_url, "Registered Ollama engine");
        }
    }

    let verifier = Verifier::new(&config.verify, Authenticators::default())?;
    let registry = ServiceRegistry::new(store.clone(), engines.clone(), verifier.clone());
    let mut events = registry.lifecycle().subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            tracing::info!(
                task_id = %event.task_id,
                provider = %event.provider_name,
                model = %event.model_name,
                outcome = ?event.outcome,
                "Pull finished"
            );
        }
    });

    let monitor = HealthMonitor::new(store, engines.clone(), verifier, &config.monitor).spawn();

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");

    if let Some(handle) = monitor {
        handle.abort();
    }
    for engine in engines.all().await {
        if let Err(e) = engine.stop_engine().await {
            tracing::warn!(flavor = %engine.flavor(), error = %e, "Failed to stop engine");
        }
    }
    Ok(())
}

//! AIGC gateway core.
//!
//! Applications address a stable service name (`chat`, `embed`, ...) and the
//! gateway resolves it to a local engine or a remote API. This crate holds
//! the registry of services, providers and models, the verification probes
//! that decide whether a provider is usable, and the background model pulls
//! that bring local providers online.

pub mod auth;
pub mod catalog;
pub mod config;
pub mod engine;
pub mod error;
pub mod lifecycle;
pub mod logging;
pub mod monitor;
pub mod registry;
pub mod store;
pub mod test_util;
pub mod verify;

pub use auth::{ApiKeyAuthenticator, Authenticator, Authenticators};
pub use config::Config;
pub use engine::{EngineAdapter, EngineRegistry, OllamaEngine};
pub use error::{Error, Result};
pub use lifecycle::{ModelLifecycle, PullEvent, PullOutcome, PullTicket};
pub use monitor::HealthMonitor;
pub use registry::{paired_provider_name, ServiceRegistry};
pub use store::{EntityStore, SqliteStore};
pub use verify::{ProviderCheck, Verifier};

//! Local model engine abstraction layer.
//!
//! This module defines the `EngineAdapter` trait through which the registry
//! and the model lifecycle drive a local engine (Ollama, ...): process
//! management, health, and the engine's model store.

mod ollama;
mod registry;

pub use ollama::OllamaEngine;
pub use registry::EngineRegistry;

use aigc_common::Flavor;
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::config::EngineConfig;

/// Error types for engine operations.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EngineError {
    #[error("Engine not installed: {0}")]
    NotInstalled(String),

    #[error("Engine communication error: {0}")]
    Communication(String),

    #[error("Engine returned an error: {0}")]
    Status(String),

    #[error("Engine process error: {0}")]
    Process(String),

    #[error("Operation not supported by engine: {0}")]
    Unsupported(String),
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// A model present in the engine's local store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalModel {
    pub name: String,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub digest: Option<String>,
    #[serde(default)]
    pub modified_at: Option<String>,
}

/// Request to download a model into the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PullModelRequest {
    pub model: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub insecure: bool,
    pub stream: bool,
}

impl PullModelRequest {
    /// Blocking (non-streaming) pull of `model`.
    pub fn new(model: &str) -> Self {
        Self {
            model: model.to_string(),
            insecure: false,
            stream: false,
        }
    }
}

/// Progress report emitted while pulling.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PullProgress {
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed: Option<u64>,
}

impl PullProgress {
    pub fn is_success(&self) -> bool {
        self.status == "success"
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeleteModelRequest {
    pub model: String,
}

impl DeleteModelRequest {
    pub fn new(model: &str) -> Self {
        Self {
            model: model.to_string(),
        }
    }
}

pub type PullStream = BoxStream<'static, EngineResult<PullProgress>>;

/// Primary trait for local model engines.
///
/// The registry treats a passing `health_check` as "the engine is up"; every
/// other operation assumes it.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EngineAdapter: Send + Sync {
    /// Flavor served by this engine.
    fn flavor(&self) -> Flavor;

    fn config(&self) -> &EngineConfig;

    /// Whether the engine binary is present on this machine.
    fn is_installed(&self) -> bool;

    async fn install_engine(&self) -> EngineResult<()>;

    /// Prepares the environment the engine process is started with.
    async fn init_env(&self) -> EngineResult<()>;

    async fn start_engine(&self) -> EngineResult<()>;

    async fn stop_engine(&self) -> EngineResult<()>;

    async fn health_check(&self) -> EngineResult<()>;

    async fn list_models(&self) -> EngineResult<Vec<LocalModel>>;

    /// Downloads a model, returning once the engine reports completion.
    async fn pull_model(&self, request: &PullModelRequest) -> EngineResult<PullProgress>;

    /// Downloads a model, yielding progress reports as they arrive.
    async fn pull_model_stream(&self, request: &PullModelRequest) -> EngineResult<PullStream>;

    async fn delete_model(&self, request: &DeleteModelRequest) -> EngineResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pull_request_serialization() {
        let json = serde_json::to_value(PullModelRequest::new("deepseek-r1:7b")).unwrap();
        assert_eq!(json, serde_json::json!({"model": "deepseek-r1:7b", "stream": false}));
    }

    #[test]
    fn test_pull_progress_success() {
        let progress: PullProgress =
            serde_json::from_str(r#"{"status":"success"}"#).unwrap();
        assert!(progress.is_success());
        let progress: PullProgress = serde_json::from_str(
            r#"{"status":"pulling 6a0746a1ec1a","digest":"sha256:6a07","total":4683073184,"completed":1024}"#,
        )
        .unwrap();
        assert!(!progress.is_success());
        assert_eq!(progress.completed, Some(1024));
    }
}

//! In-process engine with scripted behaviour.

use std::sync::Mutex;

use aigc_common::Flavor;
use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use tokio::sync::Semaphore;

use crate::config::EngineConfig;
use crate::engine::{
    DeleteModelRequest, EngineAdapter, EngineError, EngineResult, LocalModel, PullModelRequest,
    PullProgress, PullStream,
};

#[derive(Debug, Default)]
struct State {
    installed: bool,
    healthy: bool,
    /// Health stays down even after a start.
    unreachable: bool,
    models: Vec<String>,
    pull_error: Option<String>,
    pulled: Vec<String>,
    deleted: Vec<String>,
    starts: usize,
}

/// Ollama stand-in: keeps its model store in memory.
pub struct FakeEngine {
    config: EngineConfig,
    state: Mutex<State>,
    /// When set, pulls block until [`FakeEngine::release_pulls`].
    gate: Option<Semaphore>,
}

impl FakeEngine {
    fn with_state(state: State) -> Self {
        Self {
            config: EngineConfig {
                startup_poll_attempts: 3,
                startup_poll_interval_ms: 1,
                ..Default::default()
            },
            state: Mutex::new(state),
            gate: None,
        }
    }

    /// Installed and answering health checks.
    pub fn running() -> Self {
        Self::with_state(State {
            installed: true,
            healthy: true,
            ..Default::default()
        })
    }

    /// Installed but down until started.
    pub fn stopped() -> Self {
        Self::with_state(State {
            installed: true,
            ..Default::default()
        })
    }

    /// Starts fine but never becomes healthy.
    pub fn unreachable() -> Self {
        Self::with_state(State {
            installed: true,
            unreachable: true,
            ..Default::default()
        })
    }

    /// Address local providers are built on, typically a wiremock server.
    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.config.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    /// Models already present in the engine's store.
    pub fn with_models(self, models: &[&str]) -> Self {
        self.state.lock().unwrap().models = models.iter().map(|m| m.to_string()).collect();
        self
    }

    pub fn failing_pulls(self, reason: &str) -> Self {
        self.state.lock().unwrap().pull_error = Some(reason.to_string());
        self
    }

    pub fn holding_pulls(mut self) -> Self {
        self.gate = Some(Semaphore::new(0));
        self
    }

    pub fn release_pulls(&self) {
        if let Some(gate) = &self.gate {
            gate.add_permits(1024);
        }
    }

    pub fn pulled_models(&self) -> Vec<String> {
        self.state.lock().unwrap().pulled.clone()
    }

    pub fn deleted_models(&self) -> Vec<String> {
        self.state.lock().unwrap().deleted.clone()
    }

    pub fn starts(&self) -> usize {
        self.state.lock().unwrap().starts
    }
}

#[async_trait]
impl EngineAdapter for FakeEngine {
    fn flavor(&self) -> Flavor {
        Flavor::Ollama
    }

    fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn is_installed(&self) -> bool {
        self.state.lock().unwrap().installed
    }

    async fn install_engine(&self) -> EngineResult<()> {
        self.state.lock().unwrap().installed = true;
        Ok(())
    }

    async fn init_env(&self) -> EngineResult<()> {
        Ok(())
    }

    async fn start_engine(&self) -> EngineResult<()> {
        let mut state = self.state.lock().unwrap();
        state.starts += 1;
        if !state.unreachable {
            state.healthy = true;
        }
        Ok(())
    }

    async fn stop_engine(&self) -> EngineResult<()> {
        self.state.lock().unwrap().healthy = false;
        Ok(())
    }

    async fn health_check(&self) -> EngineResult<()> {
        if self.state.lock().unwrap().healthy {
            Ok(())
        } else {
            Err(EngineError::Communication("connection refused".to_string()))
        }
    }

    async fn list_models(&self) -> EngineResult<Vec<LocalModel>> {
        let state = self.state.lock().unwrap();
        if !state.healthy {
            return Err(EngineError::Communication("connection refused".to_string()));
        }
        Ok(state
            .models
            .iter()
            .map(|name| LocalModel {
                name: name.clone(),
                size: None,
                digest: None,
                modified_at: None,
            })
            .collect())
    }

    async fn pull_model(&self, request: &PullModelRequest) -> EngineResult<PullProgress> {
        if let Some(gate) = &self.gate {
            let _permit = gate
                .acquire()
                .await
                .map_err(|e| EngineError::Process(e.to_string()))?;
        }
        let mut state = self.state.lock().unwrap();
        if let Some(reason) = &state.pull_error {
            return Err(EngineError::Status(reason.clone()));
        }
        state.pulled.push(request.model.clone());
        state.models.push(request.model.clone());
        Ok(PullProgress {
            status: "success".to_string(),
            ..Default::default()
        })
    }

    async fn pull_model_stream(&self, request: &PullModelRequest) -> EngineResult<PullStream> {
        let progress = self.pull_model(request).await?;
        Ok(stream::iter(vec![Ok(progress)]).boxed())
    }

    async fn delete_model(&self, request: &DeleteModelRequest) -> EngineResult<()> {
        let mut state = self.state.lock().unwrap();
        state.models.retain(|m| !m.eq_ignore_ascii_case(&request.model));
        state.deleted.push(request.model.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_stopped_engine_comes_up_on_start() {
        let engine = FakeEngine::stopped();
        assert!(engine.health_check().await.is_err());
        engine.start_engine().await.unwrap();
        assert!(engine.health_check().await.is_ok());
        assert_eq!(engine.starts(), 1);
    }

    #[tokio::test]
    async fn test_pull_adds_to_model_store() {
        let engine = FakeEngine::running().with_models(&["bge-m3:latest"]);
        engine
            .pull_model(&PullModelRequest::new("qwen2:7b"))
            .await
            .unwrap();
        let names: Vec<_> = engine
            .list_models()
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.name)
            .collect();
        assert_eq!(names, vec!["bge-m3:latest", "qwen2:7b"]);
        assert_eq!(engine.pulled_models(), vec!["qwen2:7b"]);
    }
}

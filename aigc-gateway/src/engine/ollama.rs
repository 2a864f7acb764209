//! Ollama engine adapter.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use aigc_common::Flavor;
use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use reqwest::{Client, Url};
use serde::Deserialize;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;

use super::{
    DeleteModelRequest, EngineAdapter, EngineError, EngineResult, LocalModel, PullModelRequest,
    PullProgress, PullStream,
};
use crate::config::EngineConfig;

const BINARY_NAME: &str = "ollama";

/// Ollama engine.
///
/// Talks to an Ollama server over HTTP and, when asked to, runs
/// `ollama serve` as a child process.
pub struct OllamaEngine {
    http_client: Client,
    base_url: String,
    config: EngineConfig,
    env: Mutex<HashMap<String, String>>,
    process: Mutex<Option<Child>>,
}

impl OllamaEngine {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            http_client: Client::new(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            config,
            env: Mutex::new(HashMap::new()),
            process: Mutex::new(None),
        }
    }

    /// Binary used to start the engine: the configured path, else the first match on PATH.
    fn binary(&self) -> Option<PathBuf> {
        if !self.config.exec_path.is_empty() {
            let path = PathBuf::from(&self.config.exec_path);
            return path.exists().then_some(path);
        }
        let paths = std::env::var_os("PATH")?;
        std::env::split_paths(&paths)
            .map(|dir| dir.join(BINARY_NAME))
            .find(|candidate| candidate.is_file())
    }

    /// `host:port` the server should listen on, derived from the base URL.
    fn listen_addr(&self) -> EngineResult<String> {
        let url = Url::parse(&self.base_url)
            .map_err(|e| EngineError::Process(format!("invalid base url {}: {}", self.base_url, e)))?;
        let host = url
            .host_str()
            .ok_or_else(|| EngineError::Process(format!("base url {} has no host", self.base_url)))?;
        let port = url.port_or_known_default().unwrap_or(80);
        Ok(format!("{}:{}", host, port))
    }
}

// ============================================================================
// Ollama API types
// ============================================================================

/// Response from /api/tags endpoint.
#[derive(Debug, Deserialize)]
struct OllamaTagsResponse {
    #[serde(default)]
    models: Vec<LocalModel>,
}

/// Error body returned by Ollama, also used inline in pull streams.
#[derive(Debug, Deserialize)]
struct OllamaErrorResponse {
    error: String,
}

/// Parses one line of a pull stream.
fn parse_progress_line(line: &[u8]) -> Option<EngineResult<PullProgress>> {
    let line = std::str::from_utf8(line).ok()?.trim();
    if line.is_empty() {
        return None;
    }
    if let Ok(err) = serde_json::from_str::<OllamaErrorResponse>(line) {
        return Some(Err(EngineError::Status(err.error)));
    }
    Some(
        serde_json::from_str::<PullProgress>(line)
            .map_err(|e| EngineError::Communication(format!("bad progress line: {}", e))),
    )
}

async fn error_message(response: reqwest::Response) -> String {
    let status = response.status();
    match response.json::<OllamaErrorResponse>().await {
        Ok(body) => format!("Ollama returned {}: {}", status, body.error),
        Err(_) => format!("Ollama returned {}", status),
    }
}

// ============================================================================
// EngineAdapter implementation
// ============================================================================

#[async_trait]
impl EngineAdapter for OllamaEngine {
    fn flavor(&self) -> Flavor {
        Flavor::Ollama
    }

    fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn is_installed(&self) -> bool {
        self.binary().is_some()
    }

    async fn install_engine(&self) -> EngineResult<()> {
        // Installers are platform packages; the gateway only detects them.
        Err(EngineError::Unsupported(format!(
            "{} is not installed; install it and set engines.ollama.exec_path",
            BINARY_NAME
        )))
    }

    async fn init_env(&self) -> EngineResult<()> {
        let mut env = HashMap::new();
        env.insert("OLLAMA_HOST".to_string(), self.listen_addr()?);
        env.insert("OLLAMA_ORIGINS".to_string(), "*".to_string());
        if let Some(dir) = &self.config.models_dir {
            std::fs::create_dir_all(dir)
                .map_err(|e| EngineError::Process(format!("cannot create {}: {}", dir, e)))?;
            env.insert("OLLAMA_MODELS".to_string(), dir.clone());
        }

        tracing::debug!(?env, "Ollama environment prepared");
        *self.env.lock().await = env;
        Ok(())
    }

    async fn start_engine(&self) -> EngineResult<()> {
        let binary = self
            .binary()
            .ok_or_else(|| EngineError::NotInstalled(BINARY_NAME.to_string()))?;

        let mut process = self.process.lock().await;
        if let Some(child) = process.as_mut() {
            if matches!(child.try_wait(), Ok(None)) {
                return Ok(());
            }
        }

        let env = self.env.lock().await.clone();
        let child = Command::new(&binary)
            .arg("serve")
            .envs(env)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| {
                EngineError::Process(format!("failed to spawn {}: {}", binary.display(), e))
            })?;

        tracing::info!("Spawned ollama serve (pid: {:?})", child.id());
        *process = Some(child);
        Ok(())
    }

    async fn stop_engine(&self) -> EngineResult<()> {
        let mut process = self.process.lock().await;
        let Some(mut child) = process.take() else {
            return Ok(());
        };

        #[cfg(unix)]
        {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;

            if let Some(pid) = child.id() {
                let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
            }
        }

        let timeout = Duration::from_secs(self.config.shutdown_timeout_secs);
        match tokio::time::timeout(timeout, child.wait()).await {
            Ok(Ok(status)) => {
                tracing::debug!("ollama serve exited with {}", status);
                Ok(())
            }
            Ok(Err(e)) => Err(EngineError::Process(e.to_string())),
            Err(_timeout) => {
                tracing::warn!("ollama serve didn't stop gracefully, killing");
                child
                    .kill()
                    .await
                    .map_err(|e| EngineError::Process(e.to_string()))
            }
        }
    }

    async fn health_check(&self) -> EngineResult<()> {
        let url = format!("{}/", self.base_url);

        let response = self
            .http_client
            .head(&url)
            .send()
            .await
            .map_err(|e| EngineError::Communication(e.to_string()))?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(EngineError::Status(format!(
                "Ollama returned {}",
                response.status()
            )))
        }
    }

    async fn list_models(&self) -> EngineResult<Vec<LocalModel>> {
        let url = format!("{}/api/tags", self.base_url);

        let response = self
            .http_client
            .get(&url)
            .send()
            .await
            .map_err(|e| EngineError::Communication(e.to_string()))?;

        if !response.status().is_success() {
            return Err(EngineError::Status(error_message(response).await));
        }

        let tags: OllamaTagsResponse = response
            .json()
            .await
            .map_err(|e| EngineError::Communication(e.to_string()))?;

        Ok(tags.models)
    }

    async fn pull_model(&self, request: &PullModelRequest) -> EngineResult<PullProgress> {
        let url = format!("{}/api/pull", self.base_url);
        let body = PullModelRequest {
            stream: false,
            ..request.clone()
        };

        let response = self
            .http_client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| EngineError::Communication(e.to_string()))?;

        if !response.status().is_success() {
            return Err(EngineError::Status(error_message(response).await));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| EngineError::Communication(e.to_string()))?;

        match parse_progress_line(&bytes) {
            Some(Ok(progress)) if progress.is_success() => Ok(progress),
            Some(Ok(progress)) => Err(EngineError::Status(format!(
                "pull of {} ended with status {:?}",
                request.model, progress.status
            ))),
            Some(Err(e)) => Err(e),
            None => Err(EngineError::Communication("empty pull response".to_string())),
        }
    }

    async fn pull_model_stream(&self, request: &PullModelRequest) -> EngineResult<PullStream> {
        let url = format!("{}/api/pull", self.base_url);
        let body = PullModelRequest {
            stream: true,
            ..request.clone()
        };

        let response = self
            .http_client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| EngineError::Communication(e.to_string()))?;

        if !response.status().is_success() {
            return Err(EngineError::Status(error_message(response).await));
        }

        // Progress arrives as newline-delimited JSON split across arbitrary chunks.
        let chunks = response.bytes_stream().boxed();
        let lines = stream::unfold(
            (chunks, Vec::<u8>::new(), false),
            |(mut chunks, mut buffer, mut done)| async move {
                loop {
                    if let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                        let line: Vec<u8> = buffer.drain(..=pos).collect();
                        match parse_progress_line(&line) {
                            Some(item) => return Some((item, (chunks, buffer, done))),
                            None => continue,
                        }
                    }
                    if done {
                        let rest = std::mem::take(&mut buffer);
                        return parse_progress_line(&rest).map(|item| (item, (chunks, buffer, done)));
                    }
                    match chunks.next().await {
                        Some(Ok(bytes)) => buffer.extend_from_slice(&bytes),
                        Some(Err(e)) => {
                            done = true;
                            buffer.clear();
                            let err = EngineError::Communication(e.to_string());
                            return Some((Err(err), (chunks, buffer, done)));
                        }
                        None => done = true,
                    }
                }
            },
        );

        Ok(lines.boxed())
    }

    async fn delete_model(&self, request: &DeleteModelRequest) -> EngineResult<()> {
        let url = format!("{}/api/delete", self.base_url);

        let response = self
            .http_client
            .delete(&url)
            .json(request)
            .send()
            .await
            .map_err(|e| EngineError::Communication(e.to_string()))?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(EngineError::Status(error_message(response).await))
        }
    }
}

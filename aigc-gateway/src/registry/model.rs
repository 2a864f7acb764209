use aigc_common::protocol::{CreateModelRequest, DeleteModelRequest, GetModelsRequest, ModelInfo};
use aigc_common::{AuthType, Flavor, Model, ModelStatus, ServiceKind, PROVIDER_ACTIVE};

use super::provider::merge_auth_key;
use super::{auth_type_or, paired_provider_name, require_auth_key, ServiceRegistry};
use crate::engine::{self, PullModelRequest};
use crate::error::{Error, Result};
use crate::store::{EntityStore, ListOptions};

impl<S: EntityStore> ServiceRegistry<S> {
    /// Adds a model to an existing provider.
    ///
    /// Remote models are verified synchronously (with the request's
    /// credentials, if any) and stored downloaded. Local models are pulled
    /// in the background.
    pub async fn create_model(&self, req: CreateModelRequest) -> Result<()> {
        let mut provider = self.provider(&req.provider_name)?;
        if req.model_name.is_empty() {
            return Err(Error::BadRequest("model_name is required".to_string()));
        }
        let model_name = if provider.is_local() {
            req.model_name.to_lowercase()
        } else {
            req.model_name.clone()
        };

        let mut existing = Model::key(&provider.provider_name, &model_name);
        match self.store.get(&mut existing) {
            Ok(()) if existing.has_status(ModelStatus::Downloaded) => {
                return Err(Error::ModelAlreadyExists(format!(
                    "{}/{}",
                    provider.provider_name, model_name
                )));
            }
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.into()),
        }

        if provider.is_local() {
            let model = self.ensure_model(&provider.provider_name, &model_name)?;
            let ticket = self.lifecycle.pull_model_async(
                provider,
                model,
                PullModelRequest::new(&req.model_name),
            );
            tracing::info!(model = %model_name, task_id = %ticket.task_id(), "Model pull started");
            return Ok(());
        }

        if !req.auth_key.is_empty() {
            provider.auth_key = if provider.flavor == Flavor::SmartVision.as_str() {
                merge_auth_key(&provider.auth_key, &req.auth_key)?
            } else {
                req.auth_key.clone()
            };
        }
        require_auth_key(
            auth_type_or(&provider.auth_type, AuthType::None)?,
            &provider.auth_key,
        )?;

        if !self.verifier.verify(&provider, &model_name).await {
            self.upsert_model(&provider.provider_name, &model_name, ModelStatus::Failed)?;
            return Err(Error::ProviderUnavailable(format!(
                "{} failed verification with model {}",
                provider.provider_name, model_name
            )));
        }

        let model = self.upsert_model(&provider.provider_name, &model_name, ModelStatus::Downloaded)?;
        provider.status = PROVIDER_ACTIVE;
        self.store.put(&mut provider)?;
        if provider.is_service(ServiceKind::Chat) {
            self.lifecycle.mirror_generate_model(&provider, &model.model_name);
        }
        tracing::info!(provider = %provider.provider_name, model = %model_name, "Remote model added");
        Ok(())
    }

    /// Removes a model row, and the engine copy when it was downloaded and
    /// nothing else references it. Chat models take their generate mirror along.
    pub async fn delete_model(&self, req: DeleteModelRequest) -> Result<()> {
        let provider = self.provider(&req.provider_name)?;
        let model_name = if provider.is_local() {
            req.model_name.to_lowercase()
        } else {
            req.model_name.clone()
        };

        let mut model = Model::key(&provider.provider_name, &model_name);
        match self.store.get(&mut model) {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                return Err(Error::ModelNotFound(format!(
                    "{}/{}",
                    req.provider_name, model_name
                )))
            }
            Err(e) => return Err(e.into()),
        }

        let mirror = if provider.is_service(ServiceKind::Chat) {
            Some(Model::key(&paired_provider_name(&provider.provider_name), &model.model_name))
        } else {
            None
        };

        if provider.is_local() && model.has_status(ModelStatus::Downloaded) {
            if self.is_shared(&provider, &model.model_name, true)? {
                tracing::info!(model = %model.model_name, "Model shared, keeping engine copy");
            } else if let Some(engine) = self.engines.get_by_name(&provider.flavor).await {
                engine
                    .delete_model(&engine::DeleteModelRequest::new(&model.model_name))
                    .await
                    .map_err(|e| Error::EngineDeleteFailed(e.to_string()))?;
            }
        }

        self.store.delete(&model)?;
        if let Some(mirror) = mirror {
            if self.store.is_exist(&mirror)? {
                self.store.delete(&mirror)?;
            }
        }
        tracing::info!(provider = %provider.provider_name, model = %model.model_name, "Model deleted");
        Ok(())
    }

    pub fn get_models(&self, req: GetModelsRequest) -> Result<Vec<ModelInfo>> {
        let query = Model::key(&req.provider_name, &req.model_name);
        let models = self.store.list(&query, &ListOptions::all())?;
        Ok(models.into_iter().map(ModelInfo::from).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{registry_with, FakeEngine};
    use crate::PullOutcome;
    use aigc_common::protocol::{DeleteServiceProviderRequest, InstallServiceRequest};
    use std::time::Duration;

    fn install_chat(model: &str) -> InstallServiceRequest {
        InstallServiceRequest {
            service_name: "chat".to_string(),
            service_source: "local".to_string(),
            api_flavor: "ollama".to_string(),
            model_name: model.to_string(),
            ..Default::default()
        }
    }

    fn delete(provider: &str, model: &str) -> DeleteModelRequest {
        DeleteModelRequest {
            provider_name: provider.to_string(),
            model_name: model.to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_delete_chat_model_takes_mirror_and_engine_copy() {
        let (registry, engine) = registry_with(FakeEngine::running().with_models(&["qwen2:0.5b"])).await;
        registry.install_service(install_chat("qwen2:0.5b")).await.unwrap();

        let mirrored = registry
            .get_models(GetModelsRequest {
                provider_name: "local_ollama_generate".to_string(),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(mirrored.len(), 1);

        registry
            .delete_model(delete("local_ollama_chat", "qwen2:0.5b"))
            .await
            .unwrap();
        assert_eq!(engine.deleted_models(), vec!["qwen2:0.5b"]);
        assert!(registry.get_models(GetModelsRequest::default()).unwrap().is_empty());

        let err = registry
            .delete_model(delete("local_ollama_chat", "qwen2:0.5b"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ModelNotFound(_)));
    }

    #[tokio::test]
    async fn test_delete_local_model_ignores_case() {
        let (registry, engine) = registry_with(FakeEngine::running().with_models(&["qwen2:0.5b"])).await;
        registry
            .install_service(InstallServiceRequest {
                service_name: "embed".to_string(),
                service_source: "local".to_string(),
                api_flavor: "ollama".to_string(),
                model_name: "Qwen2:0.5b".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();

        registry
            .delete_model(delete("local_ollama_embed", "Qwen2:0.5b"))
            .await
            .unwrap();
        assert_eq!(engine.deleted_models(), vec!["qwen2:0.5b"]);
        assert!(registry.get_models(GetModelsRequest::default()).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_pull_finishing_after_provider_delete_is_dropped() {
        let (registry, engine) = registry_with(FakeEngine::running().holding_pulls()).await;
        let mut events = registry.lifecycle().subscribe();
        registry
            .install_service(InstallServiceRequest {
                service_name: "embed".to_string(),
                service_source: "local".to_string(),
                api_flavor: "ollama".to_string(),
                model_name: "bge-m3".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();

        registry
            .delete_service_provider(DeleteServiceProviderRequest {
                provider_name: "local_ollama_embed".to_string(),
            })
            .await
            .unwrap();
        engine.release_pulls();

        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(event.outcome, PullOutcome::Failed { .. }));
        assert!(registry.get_models(GetModelsRequest::default()).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_create_model_pulls_new_and_rejects_downloaded() {
        let (registry, engine) = registry_with(FakeEngine::running().with_models(&["qwen2:0.5b"])).await;
        registry.install_service(install_chat("qwen2:0.5b")).await.unwrap();
        let mut events = registry.lifecycle().subscribe();

        let err = registry
            .create_model(CreateModelRequest {
                provider_name: "local_ollama_chat".to_string(),
                model_name: "QWEN2:0.5b".to_string(),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ModelAlreadyExists(_)));

        registry
            .create_model(CreateModelRequest {
                provider_name: "local_ollama_chat".to_string(),
                model_name: "llama3.2:1b".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.model_name, "llama3.2:1b");
        assert!(matches!(event.outcome, PullOutcome::Downloaded { .. }));
        assert_eq!(engine.pulled_models(), vec!["llama3.2:1b"]);
    }

    #[tokio::test]
    async fn test_create_model_needs_known_provider() {
        let (registry, _) = registry_with(FakeEngine::running()).await;
        let err = registry
            .create_model(CreateModelRequest {
                provider_name: "ghost".to_string(),
                model_name: "m".to_string(),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ProviderNotFound(_)));
    }
}

//! Service provider CRUD.

use aigc_common::protocol::{
    CreateServiceProviderRequest, DeleteServiceProviderRequest, GetServiceProviderRequest,
    GetServiceProvidersRequest, ModelInfo, ServiceProviderDetail, ServiceProviderInfo,
    UpdateServiceProviderRequest,
};
use aigc_common::{
    AuthType, Flavor, Model, ModelStatus, Service, ServiceKind, ServiceProvider, ServiceSource,
    EMPTY_JSON, PROVIDER_ACTIVE, PROVIDER_INACTIVE,
};
use serde_json::{Map, Value};

use super::{auth_type_or, engine_has_model, or_default, require_auth_key, ServiceRegistry};
use crate::catalog;
use crate::engine::{DeleteModelRequest, PullModelRequest};
use crate::error::{Error, Result};
use crate::store::{EntityStore, ListOptions};

/// Merges a JSON auth key into the stored one, key by key.
///
/// An empty stored key is simply replaced.
pub(super) fn merge_auth_key(stored: &str, incoming: &str) -> Result<String> {
    if stored.is_empty() {
        return Ok(incoming.to_string());
    }
    let parse = |s: &str| {
        serde_json::from_str::<Map<String, Value>>(s)
            .map_err(|e| Error::BadRequest(format!("auth key is not a JSON object: {}", e)))
    };
    let mut merged = parse(stored)?;
    merged.extend(parse(incoming)?);
    serde_json::to_string(&merged).map_err(|e| Error::Internal(e.to_string()))
}

impl<S: EntityStore> ServiceRegistry<S> {
    /// Registers a provider and its models.
    ///
    /// Local models missing from the engine are pulled in the background;
    /// remote models are probed now and kept only if they answer.
    pub async fn create_service_provider(&self, req: CreateServiceProviderRequest) -> Result<()> {
        let kind = req.service_name.parse::<ServiceKind>()?;
        let source = req.service_source.parse::<ServiceSource>()?;
        let flavor = req.api_flavor.parse::<Flavor>()?;
        if req.provider_name.is_empty() {
            return Err(Error::BadRequest("provider_name is required".to_string()));
        }
        if self.store.is_exist(&ServiceProvider::named(&req.provider_name))? {
            return Err(Error::ProviderAlreadyExists(req.provider_name));
        }

        let defaults = catalog::service_defaults(flavor, kind);
        let auth_type = auth_type_or(
            &req.auth_type,
            defaults.map(|d| d.auth_type).unwrap_or(AuthType::None),
        )?;
        require_auth_key(auth_type, &req.auth_key)?;

        let mut provider = ServiceProvider {
            provider_name: req.provider_name.clone(),
            service_name: kind.to_string(),
            service_source: source.to_string(),
            desc: req.desc.clone(),
            method: or_default(&req.method, "POST"),
            url: or_default(&req.url, &defaults.map(|d| d.url()).unwrap_or_default()),
            auth_type: auth_type.to_string(),
            auth_key: req.auth_key.clone(),
            flavor: flavor.to_string(),
            extra_headers: or_default(
                &req.extra_headers,
                defaults.map(|d| d.extra_headers).unwrap_or(EMPTY_JSON),
            ),
            extra_json_body: or_default(&req.extra_json_body, EMPTY_JSON),
            properties: or_default(&req.properties, EMPTY_JSON),
            status: PROVIDER_INACTIVE,
            ..Default::default()
        };

        let mut present = Vec::new();
        let mut missing = Vec::new();
        let mut verified = Vec::new();

        match source {
            ServiceSource::Local => {
                let engine = self.engine_for(flavor).await?;
                engine
                    .health_check()
                    .await
                    .map_err(|e| Error::EngineHealthUnreachable(e.to_string()))?;
                let local_models = engine
                    .list_models()
                    .await
                    .map_err(|e| Error::EngineModelListFailed(e.to_string()))?;
                for name in &req.models {
                    if engine_has_model(&local_models, name) {
                        present.push(name.clone());
                    } else {
                        missing.push(name.clone());
                    }
                }
            }
            ServiceSource::Remote => {
                for name in &req.models {
                    if self.verifier.verify(&provider, name).await {
                        verified.push(name.clone());
                    } else {
                        tracing::warn!(provider = %provider.provider_name, model = %name, "Skipping unverified model");
                    }
                }
                provider.status = PROVIDER_ACTIVE;
            }
        }

        if !self.store.add_if_absent(&mut provider)? {
            return Err(Error::ProviderAlreadyExists(req.provider_name));
        }
        self.reload_provider(&mut provider)?;
        tracing::info!(provider = %provider.provider_name, %source, "Service provider created");

        if kind == ServiceKind::Chat {
            self.ensure_paired_generate(&provider)?;
        }

        for name in &verified {
            self.upsert_model(&provider.provider_name, name, ModelStatus::Downloaded)?;
            if kind == ServiceKind::Chat {
                self.lifecycle.mirror_generate_model(&provider, name);
            }
        }
        for name in &present {
            let model = self.upsert_model(&provider.provider_name, &name.to_lowercase(), ModelStatus::Downloaded)?;
            self.lifecycle.settle_downloaded(&provider, &model.model_name).await;
        }
        for name in &missing {
            let model = self.ensure_model(&provider.provider_name, &name.to_lowercase())?;
            self.lifecycle
                .pull_model_async(provider.clone(), model, PullModelRequest::new(name));
        }

        self.default_provider_process(kind, source, &provider.provider_name)?;
        Ok(())
    }

    /// Updates a provider and re-verifies the named models.
    ///
    /// A chat provider's changes are carried over to its paired generate
    /// provider. The first model that fails verification is recorded as failed and
    /// aborts the update before the provider record is written.
    pub async fn update_service_provider(&self, req: UpdateServiceProviderRequest) -> Result<()> {
        let mut provider = self.provider(&req.provider_name)?;

        if !req.service_name.is_empty() {
            provider.service_name = req.service_name.parse::<ServiceKind>()?.to_string();
        }
        if !req.service_source.is_empty() {
            provider.service_source = req.service_source.parse::<ServiceSource>()?.to_string();
        }
        if !req.api_flavor.is_empty() {
            provider.flavor = req.api_flavor.parse::<Flavor>()?.to_string();
        }
        if !req.auth_type.is_empty() {
            provider.auth_type = req.auth_type.parse::<AuthType>()?.to_string();
        }
        if !req.auth_key.is_empty() {
            provider.auth_key = if provider.flavor == Flavor::SmartVision.as_str() {
                merge_auth_key(&provider.auth_key, &req.auth_key)?
            } else {
                req.auth_key.clone()
            };
        }
        if !req.desc.is_empty() {
            provider.desc = req.desc.clone();
        }
        if !req.method.is_empty() {
            provider.method = req.method.clone();
        }
        if !req.url.is_empty() {
            provider.url = req.url.clone();
        }
        if !req.extra_headers.is_empty() {
            provider.extra_headers = req.extra_headers.clone();
        }
        if !req.extra_json_body.is_empty() {
            provider.extra_json_body = req.extra_json_body.clone();
        }
        if !req.properties.is_empty() {
            provider.properties = req.properties.clone();
        }

        for name in &req.models {
            let name = if provider.is_local() {
                name.to_lowercase()
            } else {
                name.clone()
            };
            if !self.verifier.verify(&provider, &name).await {
                self.upsert_model(&provider.provider_name, &name, ModelStatus::Failed)?;
                return Err(Error::ProviderUnavailable(format!(
                    "{} failed verification with model {}",
                    provider.provider_name, name
                )));
            }
            self.upsert_model(&provider.provider_name, &name, ModelStatus::Downloaded)?;
            provider.status = PROVIDER_ACTIVE;
        }

        self.store.put(&mut provider)?;
        if provider.is_service(ServiceKind::Chat) {
            self.sync_paired_generate(&provider)?;
        }
        tracing::info!(provider = %provider.provider_name, "Service provider updated");
        Ok(())
    }

    /// Deletes a provider, its models and any routing pointer naming it.
    ///
    /// A local model is removed from the engine only when no other provider
    /// still references the same model name.
    pub async fn delete_service_provider(&self, req: DeleteServiceProviderRequest) -> Result<()> {
        if req.provider_name.is_empty() {
            return Err(Error::BadRequest("provider_name is required".to_string()));
        }
        let provider = self.provider(&req.provider_name)?;
        let models = self
            .store
            .list(&Model::key(&provider.provider_name, ""), &ListOptions::all())?;

        if provider.is_local() {
            match self.engines.get_by_name(&provider.flavor).await {
                Some(engine) => {
                    // the paired generate provider outlives this delete and keeps its mirror
                    for model in &models {
                        if self.is_shared(&provider, &model.model_name, false)? {
                            tracing::info!(model = %model.model_name, "Model shared, keeping engine copy");
                            continue;
                        }
                        if model.has_status(ModelStatus::Downloaded) {
                            engine
                                .delete_model(&DeleteModelRequest::new(&model.model_name))
                                .await
                                .map_err(|e| Error::EngineDeleteFailed(e.to_string()))?;
                        }
                    }
                }
                None => tracing::warn!(flavor = %provider.flavor, "No engine registered, keeping engine models"),
            }
        }

        if !models.is_empty() {
            self.store.delete(&Model::key(&provider.provider_name, ""))?;
        }
        self.store.delete(&provider)?;

        let mut service = Service::named(&provider.service_name);
        match self.store.get(&mut service) {
            Ok(()) => {
                let cleared = match provider.service_source.parse::<ServiceSource>() {
                    Ok(ServiceSource::Remote) if service.remote_provider == provider.provider_name => {
                        service.remote_provider.clear();
                        service.local_provider.is_empty()
                    }
                    Ok(ServiceSource::Local) if service.local_provider == provider.provider_name => {
                        service.local_provider.clear();
                        service.remote_provider.is_empty()
                    }
                    _ => false,
                };
                if cleared {
                    service.status = 0;
                }
                self.store.put(&mut service)?;
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.into()),
        }

        tracing::info!(provider = %provider.provider_name, "Service provider deleted");
        Ok(())
    }

    /// One provider with a live status and its models.
    pub async fn get_service_provider(&self, req: GetServiceProviderRequest) -> Result<ServiceProviderDetail> {
        let mut provider = self.provider(&req.provider_name)?;
        let models = self
            .store
            .list(&Model::key(&provider.provider_name, ""), &ListOptions::all())?;

        if provider.is_local() {
            if let Some(engine) = self.engines.get_by_name(&provider.flavor).await {
                if engine.health_check().await.is_ok() {
                    provider.status = PROVIDER_ACTIVE;
                }
            }
        } else if self
            .verifier
            .verify_any(&provider, models.iter().map(|m| m.model_name.as_str()))
            .await
            .is_some()
        {
            provider.status = PROVIDER_ACTIVE;
        }

        Ok(ServiceProviderDetail {
            provider,
            models: models.into_iter().map(ModelInfo::from).collect(),
        })
    }

    /// Providers matching the filter, without `models` and `generate` rows.
    ///
    /// Local providers report their engine's current health as status.
    pub async fn get_service_providers(&self, req: GetServiceProvidersRequest) -> Result<Vec<ServiceProviderInfo>> {
        let query = ServiceProvider {
            provider_name: req.provider_name,
            service_name: req.service_name,
            service_source: req.service_source,
            flavor: req.api_flavor,
            ..Default::default()
        };
        let providers = self.store.list(&query, &ListOptions::all())?;

        let mut infos = Vec::new();
        for provider in providers {
            if provider.is_service(ServiceKind::Models) || provider.is_service(ServiceKind::Generate) {
                continue;
            }
            let status = if provider.is_local() {
                match self.engines.get_by_name(&provider.flavor).await {
                    Some(engine) if engine.health_check().await.is_ok() => PROVIDER_ACTIVE,
                    _ => PROVIDER_INACTIVE,
                }
            } else {
                provider.status
            };
            let models = self
                .store
                .list(&Model::key(&provider.provider_name, ""), &ListOptions::all())?
                .into_iter()
                .map(|m| m.model_name)
                .collect();

            infos.push(ServiceProviderInfo {
                provider_name: provider.provider_name,
                service_name: provider.service_name,
                service_source: provider.service_source,
                desc: provider.desc,
                auth_type: provider.auth_type,
                auth_key: provider.auth_key,
                flavor: provider.flavor,
                properties: provider.properties,
                models,
                status,
                created_at: provider.created_at,
                updated_at: provider.updated_at,
            });
        }
        Ok(infos)
    }

    /// The stored provider named `name`.
    pub(super) fn provider(&self, name: &str) -> Result<ServiceProvider> {
        let mut provider = ServiceProvider::named(name);
        match self.store.get(&mut provider) {
            Ok(()) => Ok(provider),
            Err(e) if e.is_not_found() => Err(Error::ProviderNotFound(name.to_string())),
            Err(e) => Err(e.into()),
        }
    }
}

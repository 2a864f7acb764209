//! Service registry: services, providers and models.
//!
//! The registry validates requests, writes the records, and hands local
//! downloads to the [`ModelLifecycle`]. Routing pointers on a [`Service`]
//! are only ever filled through [`ServiceRegistry::default_provider_process`],
//! so the first provider activated for a source keeps the slot.

mod model;
mod provider;
mod transfer;

use std::sync::Arc;

use aigc_common::protocol::{GetServicesRequest, InstallServiceRequest, ServiceInfo, UpdateServiceRequest};
use aigc_common::{
    AuthType, Flavor, HybridPolicy, Model, ModelStatus, Service, ServiceKind, ServiceProvider,
    ServiceSource, EMPTY_JSON, LOCAL_CHAT_PROPERTIES, PROVIDER_ACTIVE, PROVIDER_INACTIVE,
};

use crate::catalog::{self, ServiceDefaults};
use crate::engine::{EngineAdapter, EngineError, EngineRegistry, LocalModel, PullModelRequest};
use crate::error::{Error, Result};
use crate::lifecycle::ModelLifecycle;
use crate::store::{EntityStore, FilterOptions, ListOptions};
use crate::verify::Verifier;

/// Name of the generate provider paired with chat provider `chat_provider`.
///
/// Every `chat` substring is replaced, not only the service-role segment.
pub fn paired_provider_name(chat_provider: &str) -> String {
    chat_provider.replace("chat", "generate")
}

/// Name used when an install request leaves the provider name empty.
fn conventional_provider_name(source: ServiceSource, flavor: Flavor, kind: ServiceKind) -> String {
    format!("{}_{}_{}", source, flavor, kind)
}

fn or_default(value: &str, fallback: &str) -> String {
    if value.is_empty() {
        fallback.to_string()
    } else {
        value.to_string()
    }
}

/// Parses an auth type, taking `fallback` when the request leaves it empty.
fn auth_type_or(value: &str, fallback: AuthType) -> Result<AuthType> {
    if value.is_empty() {
        Ok(fallback)
    } else {
        Ok(value.parse::<AuthType>()?)
    }
}

fn require_auth_key(auth_type: AuthType, auth_key: &str) -> Result<()> {
    if auth_type != AuthType::None && auth_key.is_empty() {
        return Err(Error::AuthInfoMissing(auth_type.to_string()));
    }
    Ok(())
}

/// Whether the engine's model store already holds `model_name`.
fn engine_has_model(models: &[LocalModel], model_name: &str) -> bool {
    let tagged = format!("{}:latest", model_name);
    models
        .iter()
        .any(|m| m.name.eq_ignore_ascii_case(model_name) || m.name.eq_ignore_ascii_case(&tagged))
}

pub struct ServiceRegistry<S> {
    store: Arc<S>,
    engines: Arc<EngineRegistry>,
    verifier: Verifier,
    lifecycle: ModelLifecycle<S>,
}

impl<S: EntityStore> ServiceRegistry<S> {
    pub fn new(store: Arc<S>, engines: Arc<EngineRegistry>, verifier: Verifier) -> Self {
        let lifecycle = ModelLifecycle::new(Arc::clone(&store), Arc::clone(&engines), verifier.clone());
        Self {
            store,
            engines,
            verifier,
            lifecycle,
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn engines(&self) -> &Arc<EngineRegistry> {
        &self.engines
    }

    pub fn verifier(&self) -> &Verifier {
        &self.verifier
    }

    pub fn lifecycle(&self) -> &ModelLifecycle<S> {
        &self.lifecycle
    }

    // ------------------------------------------------------------------
    // Services
    // ------------------------------------------------------------------

    /// Installs `service_name` backed by a local engine or a remote API.
    ///
    /// Returns once the records are written; a missing local model is
    /// pulled in the background.
    pub async fn install_service(&self, req: InstallServiceRequest) -> Result<()> {
        let kind = req.service_name.parse::<ServiceKind>()?;
        let source = req.service_source.parse::<ServiceSource>()?;
        let flavor = req.api_flavor.parse::<Flavor>()?;
        let defaults = catalog::service_defaults(flavor, kind);
        let provider_name = if req.provider_name.is_empty() {
            conventional_provider_name(source, flavor, kind)
        } else {
            req.provider_name.clone()
        };

        tracing::info!(
            service = %kind,
            %source,
            %flavor,
            provider = %provider_name,
            "Installing service"
        );

        match source {
            ServiceSource::Remote => self.install_remote(&req, kind, &provider_name, defaults).await,
            ServiceSource::Local => {
                self.install_local(&req, kind, flavor, &provider_name, defaults)
                    .await
            }
        }
    }

    async fn install_remote(
        &self,
        req: &InstallServiceRequest,
        kind: ServiceKind,
        provider_name: &str,
        defaults: Option<&'static ServiceDefaults>,
    ) -> Result<()> {
        let auth_type = auth_type_or(
            &req.auth_type,
            defaults.map(|d| d.auth_type).unwrap_or(AuthType::None),
        )?;
        require_auth_key(auth_type, &req.auth_key)?;

        let url = match (req.url.as_str(), defaults) {
            ("", Some(d)) => d.url(),
            ("", None) => return Err(Error::BadRequest(format!("no url for {}", provider_name))),
            (url, _) => url.to_string(),
        };
        let model_name = or_default(&req.model_name, defaults.map(|d| d.default_model).unwrap_or(""));
        self.ensure_not_installed(provider_name, &model_name)?;

        let mut provider = ServiceProvider {
            provider_name: provider_name.to_string(),
            service_name: kind.to_string(),
            service_source: ServiceSource::Remote.to_string(),
            desc: req.desc.clone(),
            method: or_default(&req.method, defaults.map(|d| d.method).unwrap_or("POST")),
            url,
            auth_type: auth_type.to_string(),
            auth_key: req.auth_key.clone(),
            flavor: req.api_flavor.clone(),
            extra_headers: or_default(
                &req.extra_headers,
                defaults.map(|d| d.extra_headers).unwrap_or(EMPTY_JSON),
            ),
            extra_json_body: or_default(&req.extra_json_body, EMPTY_JSON),
            properties: or_default(&req.properties, EMPTY_JSON),
            status: PROVIDER_INACTIVE,
            ..Default::default()
        };
        self.store.add_if_absent(&mut provider)?;
        self.reload_provider(&mut provider)?;

        if kind == ServiceKind::Chat {
            self.ensure_paired_generate(&provider)?;
        }

        if !model_name.is_empty() {
            let model = self.ensure_model(&provider.provider_name, &model_name)?;
            self.lifecycle.pull_model_async(
                provider.clone(),
                model,
                PullModelRequest::new(&model_name),
            );
        }

        self.default_provider_process(kind, ServiceSource::Remote, &provider.provider_name)?;
        Ok(())
    }

    async fn install_local(
        &self,
        req: &InstallServiceRequest,
        kind: ServiceKind,
        flavor: Flavor,
        provider_name: &str,
        defaults: Option<&'static ServiceDefaults>,
    ) -> Result<()> {
        let engine = self.engine_for(flavor).await?;

        let requested = if req.model_name.is_empty() {
            catalog::recommended_model(kind)
                .map(|r| r.model_name.to_string())
                .unwrap_or_default()
        } else {
            req.model_name.clone()
        };
        let pull_model = !req.skip_model && !requested.is_empty();
        let model_name = if pull_model {
            requested.to_lowercase()
        } else {
            String::new()
        };
        self.ensure_not_installed(provider_name, &model_name)?;

        self.ensure_engine(engine.as_ref()).await?;

        let base_url = engine.config().base_url.clone();
        let url = match (req.url.as_str(), defaults) {
            ("", Some(d)) => d.url_on(&base_url),
            ("", None) => base_url.clone(),
            (url, _) => url.to_string(),
        };

        let mut provider = ServiceProvider {
            provider_name: provider_name.to_string(),
            service_name: kind.to_string(),
            service_source: ServiceSource::Local.to_string(),
            desc: req.desc.clone(),
            method: or_default(&req.method, defaults.map(|d| d.method).unwrap_or("POST")),
            url,
            auth_type: AuthType::None.to_string(),
            flavor: flavor.to_string(),
            properties: LOCAL_CHAT_PROPERTIES.to_string(),
            status: PROVIDER_INACTIVE,
            ..Default::default()
        };

        // list before writing anything so an unreachable model store fails cleanly
        let local_models = if pull_model {
            engine
                .list_models()
                .await
                .map_err(|e| Error::EngineModelListFailed(e.to_string()))?
        } else {
            Vec::new()
        };

        if self.store.add_if_absent(&mut provider)? {
            self.ensure_models_provider(flavor, &base_url)?;
        }
        self.reload_provider(&mut provider)?;

        if kind == ServiceKind::Chat {
            self.ensure_paired_generate(&provider)?;
        }

        if pull_model {
            let mut model = self.ensure_model(&provider.provider_name, &model_name)?;
            if engine_has_model(&local_models, &requested) {
                model.set_status(ModelStatus::Downloaded);
                self.store.put(&mut model)?;
                tracing::info!(model = %model_name, "Model already present in engine");
                self.lifecycle.settle_downloaded(&provider, &model_name).await;
            } else {
                let ticket = self.lifecycle.pull_model_async(
                    provider.clone(),
                    model,
                    PullModelRequest::new(&requested),
                );
                tracing::info!(model = %model_name, task_id = %ticket.task_id(), "Model pull started");
            }
        }

        self.default_provider_process(kind, ServiceSource::Local, &provider.provider_name)?;
        Ok(())
    }

    /// Partially updates a service's policy and routing pointers.
    pub fn update_service(&self, req: UpdateServiceRequest) -> Result<()> {
        let mut service = Service::named(&req.service_name);
        match self.store.get(&mut service) {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                return Err(Error::ServiceRecordNotFound(req.service_name))
            }
            Err(e) => return Err(e.into()),
        }

        if !req.hybrid_policy.is_empty() {
            let policy = req.hybrid_policy.parse::<HybridPolicy>()?;
            service.hybrid_policy = policy.to_string();
        }
        if !req.remote_provider.is_empty() {
            service.remote_provider = req.remote_provider;
        }
        if !req.local_provider.is_empty() {
            service.local_provider = req.local_provider;
        }

        self.store.put(&mut service)?;
        tracing::info!(service = %service.name, policy = %service.hybrid_policy, "Service updated");
        Ok(())
    }

    pub fn get_services(&self, req: GetServicesRequest) -> Result<Vec<ServiceInfo>> {
        let query = Service::named(&req.service_name);
        let services = self.store.list(&query, &ListOptions::all())?;
        Ok(services
            .into_iter()
            .map(|s| ServiceInfo {
                service_name: s.name,
                hybrid_policy: s.hybrid_policy,
                remote_provider: s.remote_provider,
                local_provider: s.local_provider,
                status: s.status,
                created_at: s.created_at,
                updated_at: s.updated_at,
            })
            .collect())
    }

    /// Points `service`'s `source` slot at `provider_name` unless it is already set.
    ///
    /// Returns whether the pointer was written.
    pub fn default_provider_process(
        &self,
        service: ServiceKind,
        source: ServiceSource,
        provider_name: &str,
    ) -> Result<bool> {
        let mut record = Service::named(service.as_str());
        self.store.get(&mut record)?;

        let slot = match source {
            ServiceSource::Local => &mut record.local_provider,
            ServiceSource::Remote => &mut record.remote_provider,
        };
        if !slot.is_empty() {
            return Ok(false);
        }
        *slot = provider_name.to_string();
        record.status = PROVIDER_ACTIVE;

        self.store.put(&mut record)?;
        tracing::info!(%service, %source, provider = %provider_name, "Default provider set");
        Ok(true)
    }

    // ------------------------------------------------------------------
    // Shared helpers
    // ------------------------------------------------------------------

    async fn engine_for(&self, flavor: Flavor) -> Result<Arc<dyn EngineAdapter>> {
        self.engines
            .get(flavor)
            .await
            .ok_or_else(|| Error::UnsupportedFlavor(format!("{} has no local engine", flavor)))
    }

    /// Installs, prepares and starts the engine until its health check passes.
    async fn ensure_engine(&self, engine: &dyn EngineAdapter) -> Result<()> {
        if !engine.is_installed() {
            tracing::info!(flavor = %engine.flavor(), "Installing engine");
            engine
                .install_engine()
                .await
                .map_err(|e| Error::EngineInstallFailed(e.to_string()))?;
        }

        engine
            .init_env()
            .await
            .map_err(|e| Error::EngineEnvInitFailed(e.to_string()))?;

        if engine.health_check().await.is_ok() {
            return Ok(());
        }

        engine
            .start_engine()
            .await
            .map_err(|e| Error::EngineStartFailed(e.to_string()))?;

        let config = engine.config();
        let mut last: Option<EngineError> = None;
        for attempt in 1..=config.startup_poll_attempts {
            tokio::time::sleep(config.startup_poll_interval()).await;
            match engine.health_check().await {
                Ok(()) => {
                    tracing::info!(attempt, "Engine is up");
                    return Ok(());
                }
                Err(e) => {
                    tracing::debug!(attempt, error = %e, "Waiting for engine");
                    last = Some(e);
                }
            }
        }

        Err(Error::EngineHealthUnreachable(
            last.map(|e| e.to_string())
                .unwrap_or_else(|| "engine did not come up".to_string()),
        ))
    }

    /// Rejects an install whose provider and live model row both exist.
    ///
    /// With no model name, any model under the provider counts.
    fn ensure_not_installed(&self, provider_name: &str, model_name: &str) -> Result<()> {
        if !self.store.is_exist(&ServiceProvider::named(provider_name))? {
            return Ok(());
        }

        let installed = if model_name.is_empty() {
            self.store
                .count(&Model::key(provider_name, ""), &FilterOptions::default())?
                > 0
        } else {
            let mut model = Model::key(provider_name, model_name);
            match self.store.get(&mut model) {
                Ok(()) => !model.has_status(ModelStatus::Failed),
                Err(e) if e.is_not_found() => false,
                Err(e) => return Err(e.into()),
            }
        };

        if installed {
            return Err(Error::ServiceAlreadyExists(format!("{}/{}", provider_name, model_name)));
        }
        Ok(())
    }

    /// Whether providers other than `provider` still reference `model_name`.
    ///
    /// `with_mirror` says the chat provider's generate mirror row goes away
    /// together with its own row; otherwise the mirror counts as a reference.
    fn is_shared(&self, provider: &ServiceProvider, model_name: &str, with_mirror: bool) -> Result<bool> {
        let references = self
            .store
            .count(&Model::key("", &model_name.to_lowercase()), &FilterOptions::default())?;
        let mut own = 1;
        if with_mirror && provider.is_service(ServiceKind::Chat) {
            let mirror = Model::key(&paired_provider_name(&provider.provider_name), model_name);
            if self.store.is_exist(&mirror)? {
                own += 1;
            }
        }
        Ok(references > own)
    }

    fn reload_provider(&self, provider: &mut ServiceProvider) -> Result<()> {
        let mut stored = ServiceProvider::named(&provider.provider_name);
        self.store.get(&mut stored)?;
        *provider = stored;
        Ok(())
    }

    /// The `(provider, model)` row ready for a pull: created as downloading,
    /// or re-queued when a previous pull failed.
    fn ensure_model(&self, provider_name: &str, model_name: &str) -> Result<Model> {
        let mut model = Model::key(provider_name, model_name);
        match self.store.get(&mut model) {
            Ok(()) => {
                if model.has_status(ModelStatus::Failed) {
                    model.set_status(ModelStatus::Downloading);
                    self.store.put(&mut model)?;
                    tracing::info!(provider = %provider_name, model = %model_name, "Re-queued failed model");
                }
                Ok(model)
            }
            Err(e) if e.is_not_found() => {
                let mut model = Model::new(provider_name, model_name, ModelStatus::Downloading);
                if !self.store.add_if_absent(&mut model)? {
                    // lost the race to a concurrent insert
                    model = Model::key(provider_name, model_name);
                    self.store.get(&mut model)?;
                }
                Ok(model)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Creates or updates a model row with `status`.
    ///
    /// An existing row moves along the lifecycle table, so a failed model
    /// is re-queued as downloading before it is stored downloaded.
    fn upsert_model(&self, provider_name: &str, model_name: &str, status: ModelStatus) -> Result<Model> {
        let mut model = Model::key(provider_name, model_name);
        match self.store.get(&mut model) {
            Ok(()) => {
                let current = model.status.parse::<ModelStatus>()?;
                for step in current.steps_to(status) {
                    model.set_status(step);
                    self.store.put(&mut model)?;
                    tracing::debug!(provider = %provider_name, model = %model_name, status = %step, "Model status changed");
                }
            }
            Err(e) if e.is_not_found() => {
                model = Model::new(provider_name, model_name, status);
                self.store.add(&mut model)?;
            }
            Err(e) => return Err(e.into()),
        }
        Ok(model)
    }

    /// Copies `chat`'s auth, flavor, description, request shape and active
    /// status onto its paired generate provider, if there is one.
    fn sync_paired_generate(&self, chat: &ServiceProvider) -> Result<()> {
        let mut generate = ServiceProvider::named(&paired_provider_name(&chat.provider_name));
        match self.store.get(&mut generate) {
            Ok(()) => {}
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e.into()),
        }

        generate.auth_type = chat.auth_type.clone();
        generate.auth_key = chat.auth_key.clone();
        generate.flavor = chat.flavor.clone();
        generate.desc = chat.desc.replace("chat", "generate");
        generate.method = chat.method.clone();
        generate.extra_headers = chat.extra_headers.clone();
        generate.extra_json_body = chat.extra_json_body.clone();
        if chat.is_active() {
            generate.status = PROVIDER_ACTIVE;
        }
        self.store.put(&mut generate)?;
        tracing::info!(provider = %generate.provider_name, "Paired generate provider synced");
        Ok(())
    }

    /// Creates the generate provider paired with `chat` and claims the
    /// generate routing slot for it.
    fn ensure_paired_generate(&self, chat: &ServiceProvider) -> Result<()> {
        let source = chat.service_source.parse::<ServiceSource>()?;
        let generate_url = chat
            .flavor
            .parse::<Flavor>()
            .ok()
            .and_then(|f| catalog::service_defaults(f, ServiceKind::Generate))
            .map(|d| {
                if chat.is_local() {
                    chat.url
                        .find("/api/")
                        .map(|at| d.url_on(&chat.url[..at]))
                        .unwrap_or_else(|| d.url())
                } else {
                    d.url()
                }
            })
            .unwrap_or_else(|| chat.url.clone());

        let mut generate = ServiceProvider {
            provider_name: paired_provider_name(&chat.provider_name),
            service_name: ServiceKind::Generate.to_string(),
            service_source: chat.service_source.clone(),
            desc: chat.desc.replace("chat", "generate"),
            method: chat.method.clone(),
            url: generate_url,
            auth_type: chat.auth_type.clone(),
            auth_key: chat.auth_key.clone(),
            flavor: chat.flavor.clone(),
            extra_headers: chat.extra_headers.clone(),
            extra_json_body: chat.extra_json_body.clone(),
            properties: chat.properties.clone(),
            status: chat.status,
            ..Default::default()
        };
        if self.store.add_if_absent(&mut generate)? {
            tracing::info!(provider = %generate.provider_name, "Paired generate provider created");
        }
        self.default_provider_process(ServiceKind::Generate, source, &generate.provider_name)?;
        Ok(())
    }

    /// The local `models` listing provider for `flavor`, set as the default
    /// local `models` provider.
    fn ensure_models_provider(&self, flavor: Flavor, base_url: &str) -> Result<()> {
        let Some(defaults) = catalog::service_defaults(flavor, ServiceKind::Models) else {
            return Ok(());
        };
        let mut provider = ServiceProvider {
            provider_name: conventional_provider_name(ServiceSource::Local, flavor, ServiceKind::Models),
            service_name: ServiceKind::Models.to_string(),
            service_source: ServiceSource::Local.to_string(),
            method: defaults.method.to_string(),
            url: defaults.url_on(base_url),
            auth_type: AuthType::None.to_string(),
            flavor: flavor.to_string(),
            status: PROVIDER_ACTIVE,
            ..Default::default()
        };
        self.store.add_if_absent(&mut provider)?;
        self.default_provider_process(ServiceKind::Models, ServiceSource::Local, &provider.provider_name)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{registry_with, FakeEngine};

    #[test]
    fn test_paired_provider_name() {
        assert_eq!(paired_provider_name("local_ollama_chat"), "local_ollama_generate");
        assert_eq!(paired_provider_name("remote_openai_chat"), "remote_openai_generate");
        // substitution is global
        assert_eq!(paired_provider_name("chatbot_chat"), "generatebot_generate");
    }

    #[test]
    fn test_engine_has_model_accepts_latest_tag() {
        let models = vec![LocalModel {
            name: "bge-m3:latest".to_string(),
            size: None,
            digest: None,
            modified_at: None,
        }];
        assert!(engine_has_model(&models, "bge-m3"));
        assert!(engine_has_model(&models, "BGE-M3:latest"));
        assert!(!engine_has_model(&models, "deepseek-r1:7b"));
    }

    #[tokio::test]
    async fn test_first_writer_wins() {
        let (registry, _) = registry_with(FakeEngine::running()).await;

        assert!(registry
            .default_provider_process(ServiceKind::Chat, ServiceSource::Local, "p1")
            .unwrap());
        assert!(!registry
            .default_provider_process(ServiceKind::Chat, ServiceSource::Local, "p2")
            .unwrap());
        assert!(registry
            .default_provider_process(ServiceKind::Chat, ServiceSource::Remote, "r1")
            .unwrap());

        let chat = registry
            .get_services(GetServicesRequest {
                service_name: "chat".to_string(),
            })
            .unwrap();
        assert_eq!(chat.len(), 1);
        assert_eq!(chat[0].local_provider, "p1");
        assert_eq!(chat[0].remote_provider, "r1");
        assert_eq!(chat[0].status, PROVIDER_ACTIVE);
    }

    #[tokio::test]
    async fn test_update_service_partial() {
        let (registry, _) = registry_with(FakeEngine::running()).await;
        registry
            .default_provider_process(ServiceKind::Embed, ServiceSource::Local, "local_ollama_embed")
            .unwrap();

        registry
            .update_service(UpdateServiceRequest {
                service_name: "embed".to_string(),
                hybrid_policy: "always_remote".to_string(),
                remote_provider: "remote_openai_embed".to_string(),
                ..Default::default()
            })
            .unwrap();

        let embed = &registry
            .get_services(GetServicesRequest {
                service_name: "embed".to_string(),
            })
            .unwrap()[0];
        assert_eq!(embed.hybrid_policy, "always_remote");
        assert_eq!(embed.local_provider, "local_ollama_embed");
        assert_eq!(embed.remote_provider, "remote_openai_embed");

        // empty policy keeps the current one
        registry
            .update_service(UpdateServiceRequest {
                service_name: "embed".to_string(),
                ..Default::default()
            })
            .unwrap();
        let embed = &registry
            .get_services(GetServicesRequest {
                service_name: "embed".to_string(),
            })
            .unwrap()[0];
        assert_eq!(embed.hybrid_policy, "always_remote");
    }

    #[tokio::test]
    async fn test_update_service_errors() {
        let (registry, _) = registry_with(FakeEngine::running()).await;
        let err = registry
            .update_service(UpdateServiceRequest {
                service_name: "speech".to_string(),
                ..Default::default()
            })
            .unwrap_err();
        assert!(matches!(err, Error::ServiceRecordNotFound(_)));

        let err = registry
            .update_service(UpdateServiceRequest {
                service_name: "chat".to_string(),
                hybrid_policy: "sometimes".to_string(),
                ..Default::default()
            })
            .unwrap_err();
        assert!(matches!(err, Error::UnsupportedHybridPolicy(_)));
    }

    #[tokio::test]
    async fn test_get_services_lists_seeded_rows() {
        let (registry, _) = registry_with(FakeEngine::running()).await;
        let services = registry.get_services(GetServicesRequest::default()).unwrap();
        assert_eq!(services.len(), ServiceKind::ALL.len());
        assert!(services.iter().all(|s| s.hybrid_policy == "default"));
    }
}

//! Export and import of the whole service graph.

use std::collections::BTreeMap;

use aigc_common::protocol::{
    ExportServicesRequest, ProviderPointers, ServiceEntry, ServiceProviderEntry, ServicesPayload,
};
use aigc_common::{
    AuthType, Flavor, HybridPolicy, Model, ModelStatus, Service, ServiceKind, ServiceProvider,
    ServiceSource, EMPTY_JSON, LOCAL_CHAT_PROPERTIES, PROVIDER_ACTIVE, PROVIDER_INACTIVE,
};

use super::{auth_type_or, or_default, ServiceRegistry};
use crate::catalog;
use crate::engine::PullModelRequest;
use crate::error::{Error, Result};
use crate::store::{EntityStore, ListOptions};

/// Version stamped on exports and required on imports.
pub const PAYLOAD_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Typed view of one provider entry, checked before anything is written.
struct ProviderPlan<'a> {
    name: &'a str,
    entry: &'a ServiceProviderEntry,
    kind: ServiceKind,
    source: ServiceSource,
    flavor: Flavor,
    auth_type: AuthType,
}

fn validate<'a>(payload: &'a ServicesPayload) -> Result<Vec<ProviderPlan<'a>>> {
    if payload.version != PAYLOAD_VERSION {
        return Err(Error::VersionMismatch {
            expected: PAYLOAD_VERSION.to_string(),
            found: payload.version.clone(),
        });
    }

    for (name, entry) in &payload.services {
        name.parse::<ServiceKind>()?;
        HybridPolicy::parse_or_default(&entry.hybrid_policy)?;
        let pointers = &entry.service_providers;
        if pointers.local.is_empty() && pointers.remote.is_empty() {
            return Err(Error::BadRequest(format!("service {} names no provider", name)));
        }
    }

    payload
        .service_providers
        .iter()
        .map(|(name, entry)| -> Result<ProviderPlan<'a>> {
            Ok(ProviderPlan {
                name: name.as_str(),
                entry,
                kind: entry.service_name.parse::<ServiceKind>()?,
                source: entry.service_source.parse::<ServiceSource>()?,
                flavor: entry.api_flavor.parse::<Flavor>()?,
                auth_type: auth_type_or(&entry.auth_type, AuthType::None)?,
            })
        })
        .collect()
}

impl<S: EntityStore> ServiceRegistry<S> {
    /// Snapshot of services, providers and their models, filtered by name.
    ///
    /// Services with neither pointer set are left out.
    pub fn export_services(&self, req: ExportServicesRequest) -> Result<ServicesPayload> {
        let services = self
            .store
            .list(&Service::named(&req.service_name), &ListOptions::all())?;

        let mut query = ServiceProvider::named(&req.provider_name);
        query.service_name = req.service_name.clone();
        let providers = self.store.list(&query, &ListOptions::all())?;

        let mut service_providers = BTreeMap::new();
        for provider in providers {
            let models: Vec<String> = self
                .store
                .list(
                    &Model::key(&provider.provider_name, &req.model_name),
                    &ListOptions::all(),
                )?
                .into_iter()
                .map(|m| m.model_name)
                .collect();
            if !req.model_name.is_empty() && models.is_empty() {
                continue;
            }
            service_providers.insert(
                provider.provider_name,
                ServiceProviderEntry {
                    service_name: provider.service_name,
                    service_source: provider.service_source,
                    desc: provider.desc,
                    api_flavor: provider.flavor,
                    method: provider.method,
                    url: provider.url,
                    auth_type: provider.auth_type,
                    auth_key: provider.auth_key,
                    models,
                },
            );
        }

        Ok(ServicesPayload {
            version: PAYLOAD_VERSION.to_string(),
            services: services
                .into_iter()
                .filter(|s| !s.local_provider.is_empty() || !s.remote_provider.is_empty())
                .map(|s| {
                    (
                        s.name,
                        ServiceEntry {
                            service_providers: ProviderPointers {
                                local: s.local_provider,
                                remote: s.remote_provider,
                            },
                            hybrid_policy: s.hybrid_policy,
                        },
                    )
                })
                .collect(),
            service_providers,
        })
    }

    /// Merges an exported graph into this registry.
    ///
    /// The whole payload is validated first; a remote model that fails its
    /// probe aborts the import with the providers before it already written.
    pub async fn import_services(&self, payload: ServicesPayload) -> Result<()> {
        let plans = validate(&payload)?;
        let existing = self.export_services(ExportServicesRequest::default())?;

        for plan in plans {
            self.import_provider(&plan, existing.service_providers.get(plan.name))
                .await?;
        }

        for (name, entry) in &payload.services {
            let policy = HybridPolicy::parse_or_default(&entry.hybrid_policy)?;
            if policy == HybridPolicy::Default {
                continue;
            }
            let mut service = Service::named(name);
            self.store.get(&mut service)?;
            service.hybrid_policy = policy.to_string();
            self.store.put(&mut service)?;
        }

        tracing::info!(
            services = payload.services.len(),
            providers = payload.service_providers.len(),
            "Services imported"
        );
        Ok(())
    }

    async fn import_provider(
        &self,
        plan: &ProviderPlan<'_>,
        existing: Option<&ServiceProviderEntry>,
    ) -> Result<()> {
        let entry = plan.entry;
        let defaults = catalog::service_defaults(plan.flavor, plan.kind);
        let properties = match plan.kind {
            ServiceKind::Chat | ServiceKind::Generate if plan.source == ServiceSource::Local => {
                LOCAL_CHAT_PROPERTIES
            }
            _ => EMPTY_JSON,
        };

        let mut provider = ServiceProvider {
            provider_name: plan.name.to_string(),
            service_name: plan.kind.to_string(),
            service_source: plan.source.to_string(),
            desc: entry.desc.clone(),
            method: or_default(&entry.method, defaults.map(|d| d.method).unwrap_or("POST")),
            url: or_default(&entry.url, &defaults.map(|d| d.url()).unwrap_or_default()),
            auth_type: plan.auth_type.to_string(),
            auth_key: entry.auth_key.clone(),
            flavor: plan.flavor.to_string(),
            extra_headers: defaults
                .map(|d| d.extra_headers)
                .unwrap_or(EMPTY_JSON)
                .to_string(),
            properties: properties.to_string(),
            status: PROVIDER_INACTIVE,
            ..Default::default()
        };

        let known: &[String] = existing.map(|e| e.models.as_slice()).unwrap_or(&[]);
        let new_models: Vec<String> = entry
            .models
            .iter()
            .map(|m| match plan.source {
                ServiceSource::Local => m.to_lowercase(),
                ServiceSource::Remote => m.clone(),
            })
            .filter(|m| !known.contains(m))
            .collect();

        let mut verified = Vec::new();
        if plan.source == ServiceSource::Remote {
            for name in &new_models {
                if !self.verifier.verify(&provider, name).await {
                    return Err(Error::ProviderUnavailable(format!(
                        "{} failed verification with model {}",
                        plan.name, name
                    )));
                }
                verified.push(name.clone());
            }
            if !verified.is_empty() {
                provider.status = PROVIDER_ACTIVE;
            }
        }

        let mut stored = ServiceProvider::named(plan.name);
        match self.store.get(&mut stored) {
            Ok(()) => {
                provider.id = stored.id;
                provider.created_at = stored.created_at;
                provider.status = provider.status.max(stored.status);
                if plan.auth_type == AuthType::None {
                    provider.auth_type = stored.auth_type;
                    provider.auth_key = stored.auth_key;
                }
                self.store.put(&mut provider)?;
            }
            Err(e) if e.is_not_found() => self.store.add(&mut provider)?,
            Err(e) => return Err(e.into()),
        }
        tracing::info!(provider = %plan.name, new_models = new_models.len(), "Provider imported");

        match plan.source {
            ServiceSource::Remote => {
                for name in &verified {
                    let mut model = Model::new(plan.name, name, ModelStatus::Downloaded);
                    self.store.add_if_absent(&mut model)?;
                }
            }
            ServiceSource::Local => {
                for name in &new_models {
                    let model = self.ensure_model(plan.name, name)?;
                    self.lifecycle
                        .pull_model_async(provider.clone(), model, PullModelRequest::new(name));
                }
            }
        }

        if plan.kind == ServiceKind::Chat && plan.source == ServiceSource::Local {
            self.ensure_paired_generate(&provider)?;
        }
        self.default_provider_process(plan.kind, plan.source, plan.name)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{registry_with, FakeEngine};

    fn payload_with(provider: ServiceProviderEntry) -> ServicesPayload {
        let mut payload = ServicesPayload {
            version: PAYLOAD_VERSION.to_string(),
            ..Default::default()
        };
        payload.service_providers.insert("p".to_string(), provider);
        payload
    }

    #[tokio::test]
    async fn test_import_rejects_other_version() {
        let (registry, _) = registry_with(FakeEngine::running()).await;
        let payload = ServicesPayload {
            version: "0.0.0-other".to_string(),
            ..Default::default()
        };
        let err = registry.import_services(payload).await.unwrap_err();
        assert!(matches!(err, Error::VersionMismatch { found, .. } if found == "0.0.0-other"));
    }

    #[tokio::test]
    async fn test_import_rejects_unknown_flavor_before_writing() {
        let (registry, _) = registry_with(FakeEngine::running()).await;
        let payload = payload_with(ServiceProviderEntry {
            service_name: "chat".to_string(),
            service_source: "remote".to_string(),
            api_flavor: "mistral".to_string(),
            ..Default::default()
        });

        let err = registry.import_services(payload).await.unwrap_err();
        assert!(matches!(err, Error::UnsupportedFlavor(_)));
        assert!(!registry
            .store()
            .is_exist(&ServiceProvider::named("p"))
            .unwrap());
    }

    #[tokio::test]
    async fn test_import_rejects_service_without_pointers() {
        let (registry, _) = registry_with(FakeEngine::running()).await;
        let mut payload = ServicesPayload {
            version: PAYLOAD_VERSION.to_string(),
            ..Default::default()
        };
        payload
            .services
            .insert("chat".to_string(), ServiceEntry::default());

        let err = registry.import_services(payload).await.unwrap_err();
        assert!(matches!(err, Error::BadRequest(_)));
    }

    #[tokio::test]
    async fn test_export_then_import_is_stable() {
        let (registry, _) = registry_with(FakeEngine::running()).await;
        let payload = payload_with(ServiceProviderEntry {
            service_name: "embed".to_string(),
            service_source: "remote".to_string(),
            api_flavor: "openai".to_string(),
            auth_type: "apikey".to_string(),
            auth_key: "sk-test".to_string(),
            ..Default::default()
        });
        registry.import_services(payload).await.unwrap();

        let exported = registry.export_services(ExportServicesRequest::default()).unwrap();
        assert_eq!(exported.version, PAYLOAD_VERSION);
        let entry = &exported.service_providers["p"];
        assert_eq!(entry.api_flavor, "openai");
        assert_eq!(entry.auth_key, "sk-test");
        assert_eq!(exported.services["embed"].service_providers.remote, "p");

        // a second import with no credentials keeps the stored ones
        let mut again = exported.clone();
        let p = again.service_providers.get_mut("p").unwrap();
        p.auth_type = "none".to_string();
        p.auth_key.clear();
        registry.import_services(again).await.unwrap();
        let exported = registry.export_services(ExportServicesRequest::default()).unwrap();
        assert_eq!(exported.service_providers["p"].auth_key, "sk-test");
        assert_eq!(exported.service_providers.len(), 1);
    }
}

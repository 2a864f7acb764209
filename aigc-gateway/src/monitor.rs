//! Periodic re-verification of inactive providers.

use std::sync::Arc;
use std::time::Duration;

use aigc_common::{Flavor, Model, ServiceKind, ServiceProvider};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

use crate::catalog;
use crate::config::MonitorConfig;
use crate::engine::EngineRegistry;
use crate::lifecycle::mark_active;
use crate::store::{EntityStore, ListOptions, StoreResult};
use crate::verify::Verifier;

/// Brings providers back online once they answer again.
pub struct HealthMonitor<S> {
    store: Arc<S>,
    engines: Arc<EngineRegistry>,
    verifier: Verifier,
    period: Duration,
}

impl<S: EntityStore> HealthMonitor<S> {
    pub fn new(
        store: Arc<S>,
        engines: Arc<EngineRegistry>,
        verifier: Verifier,
        config: &MonitorConfig,
    ) -> Self {
        Self {
            store,
            engines,
            verifier,
            period: Duration::from_secs(config.interval_secs),
        }
    }

    /// Starts the sweep loop. `None` when the interval is 0.
    pub fn spawn(self) -> Option<JoinHandle<()>> {
        if self.period.is_zero() {
            tracing::info!("Health monitor disabled");
            return None;
        }
        Some(tokio::spawn(async move {
            let mut ticker = interval(self.period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match self.sweep().await {
                    Ok(0) => {}
                    Ok(activated) => tracing::info!(activated, "Providers back online"),
                    Err(e) => tracing::warn!(error = %e, "Health sweep failed"),
                }
            }
        }))
    }

    /// Checks every inactive provider once and returns how many came back.
    pub async fn sweep(&self) -> StoreResult<usize> {
        let providers: Vec<ServiceProvider> = self
            .store
            .list(&ServiceProvider::default(), &ListOptions::all())?
            .into_iter()
            .filter(|p| !p.is_active())
            .collect();

        let mut activated = 0;
        for mut provider in providers {
            if !self.is_reachable(&provider).await {
                continue;
            }
            mark_active(self.store.as_ref(), &mut provider)?;
            tracing::info!(provider = %provider.provider_name, "Provider reachable again");
            activated += 1;
        }
        Ok(activated)
    }

    async fn is_reachable(&self, provider: &ServiceProvider) -> bool {
        if provider.is_local() {
            return match self.engines.get_by_name(&provider.flavor).await {
                Some(engine) => engine.health_check().await.is_ok(),
                None => false,
            };
        }

        let mut models: Vec<String> = match self
            .store
            .list(&Model::key(&provider.provider_name, ""), &ListOptions::all())
        {
            Ok(models) => models.into_iter().map(|m| m.model_name).collect(),
            Err(e) => {
                tracing::warn!(provider = %provider.provider_name, error = %e, "Failed to list models");
                return false;
            }
        };
        if models.is_empty() {
            let fallback = provider
                .flavor
                .parse::<Flavor>()
                .ok()
                .zip(provider.service_name.parse::<ServiceKind>().ok())
                .and_then(|(flavor, kind)| catalog::service_defaults(flavor, kind))
                .map(|d| d.default_model)
                .unwrap_or("");
            models.push(fallback.to_string());
        }

        self.verifier
            .verify_any(provider, models.iter().map(String::as_str))
            .await
            .is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{registry_with, FakeEngine};
    use aigc_common::{ServiceSource, PROVIDER_ACTIVE, PROVIDER_INACTIVE};

    fn local_provider(name: &str, kind: ServiceKind) -> ServiceProvider {
        ServiceProvider {
            provider_name: name.to_string(),
            service_name: kind.to_string(),
            service_source: ServiceSource::Local.to_string(),
            flavor: "ollama".to_string(),
            auth_type: "none".to_string(),
            status: PROVIDER_INACTIVE,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_sweep_activates_local_provider_and_pair() {
        let (registry, _) = registry_with(FakeEngine::running()).await;
        let store = registry.store().clone();
        store.add(&mut local_provider("local_ollama_chat", ServiceKind::Chat)).unwrap();
        store
            .add(&mut local_provider("local_ollama_generate", ServiceKind::Generate))
            .unwrap();

        let monitor = HealthMonitor::new(
            store.clone(),
            registry.engines().clone(),
            registry.verifier().clone(),
            &MonitorConfig { interval_secs: 60 },
        );
        // the generate provider is reached directly as well as through its pair
        assert_eq!(monitor.sweep().await.unwrap(), 2);

        let mut chat = ServiceProvider::named("local_ollama_chat");
        store.get(&mut chat).unwrap();
        assert_eq!(chat.status, PROVIDER_ACTIVE);
        let mut generate = ServiceProvider::named("local_ollama_generate");
        store.get(&mut generate).unwrap();
        assert_eq!(generate.status, PROVIDER_ACTIVE);

        assert_eq!(monitor.sweep().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_sweep_leaves_unreachable_engine_inactive() {
        let (registry, _) = registry_with(FakeEngine::stopped()).await;
        let store = registry.store().clone();
        store.add(&mut local_provider("local_ollama_embed", ServiceKind::Embed)).unwrap();

        let monitor = HealthMonitor::new(
            store.clone(),
            registry.engines().clone(),
            registry.verifier().clone(),
            &MonitorConfig { interval_secs: 60 },
        );
        assert_eq!(monitor.sweep().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_zero_interval_disables_monitor() {
        let (registry, _) = registry_with(FakeEngine::running()).await;
        let monitor = HealthMonitor::new(
            registry.store().clone(),
            registry.engines().clone(),
            registry.verifier().clone(),
            &MonitorConfig { interval_secs: 0 },
        );
        assert!(monitor.spawn().is_none());
    }
}

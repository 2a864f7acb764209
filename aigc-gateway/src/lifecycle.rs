//! Model lifecycle: background pulls that bring a provider online.
//!
//! A pull moves its model row `downloading -> downloaded | failed`, then
//! tries to activate the owning provider with a verification probe. Each
//! pull runs as its own tokio task and reports completion on a broadcast
//! channel; callers that don't care simply drop the returned ticket.

use std::sync::Arc;

use aigc_common::{Model, ModelStatus, ServiceKind, ServiceProvider, PROVIDER_ACTIVE};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::Instrument;
use uuid::Uuid;

use crate::engine::{EngineRegistry, PullModelRequest};
use crate::registry::paired_provider_name;
use crate::store::{EntityStore, StoreResult};
use crate::verify::Verifier;

const EVENT_CAPACITY: usize = 64;

/// How a pull task ended.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PullOutcome {
    /// The model is downloaded; `provider_active` reports whether its provider is verified.
    Downloaded { provider_active: bool },
    Failed { reason: String },
}

/// Completion notice of one pull task.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PullEvent {
    pub task_id: Uuid,
    pub provider_name: String,
    pub model_name: String,
    #[serde(flatten)]
    pub outcome: PullOutcome,
}

/// Handle to a running pull.
#[derive(Debug)]
pub struct PullTicket {
    task_id: Uuid,
    handle: JoinHandle<PullOutcome>,
}

impl PullTicket {
    pub fn task_id(&self) -> Uuid {
        self.task_id
    }

    /// Waits for the task to finish.
    pub async fn wait(self) -> PullOutcome {
        self.handle
            .await
            .unwrap_or_else(|e| PullOutcome::Failed {
                reason: format!("pull task aborted: {}", e),
            })
    }
}

/// Stores `provider` as active. A chat provider takes its paired generate
/// provider along.
pub(crate) fn mark_active<S: EntityStore>(store: &S, provider: &mut ServiceProvider) -> StoreResult<()> {
    provider.status = PROVIDER_ACTIVE;
    store.put(&mut *provider)?;

    if provider.is_service(ServiceKind::Chat) {
        let mut paired = ServiceProvider::named(&paired_provider_name(&provider.provider_name));
        match store.get(&mut paired) {
            Ok(()) if !paired.is_active() => {
                paired.status = PROVIDER_ACTIVE;
                store.put(&mut paired)?;
            }
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                tracing::debug!(paired = %paired.provider_name, "No paired provider");
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

pub struct ModelLifecycle<S> {
    store: Arc<S>,
    engines: Arc<EngineRegistry>,
    verifier: Verifier,
    events: broadcast::Sender<PullEvent>,
}

impl<S> Clone for ModelLifecycle<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            engines: Arc::clone(&self.engines),
            verifier: self.verifier.clone(),
            events: self.events.clone(),
        }
    }
}

impl<S: EntityStore> ModelLifecycle<S> {
    pub fn new(store: Arc<S>, engines: Arc<EngineRegistry>, verifier: Verifier) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            store,
            engines,
            verifier,
            events,
        }
    }

    /// Receives an event per finished pull from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<PullEvent> {
        self.events.subscribe()
    }

    /// Starts pulling `model` for `provider` in the background.
    ///
    /// The task owns its inputs and runs to completion regardless of what
    /// happens to the caller.
    pub fn pull_model_async(
        &self,
        provider: ServiceProvider,
        model: Model,
        request: PullModelRequest,
    ) -> PullTicket {
        let task_id = Uuid::new_v4();
        let span = tracing::info_span!(
            "pull",
            %task_id,
            provider = %provider.provider_name,
            model = %model.model_name,
        );
        let this = self.clone();
        let handle = tokio::spawn(
            async move {
                let provider_name = provider.provider_name.clone();
                let model_name = model.model_name.clone();
                let outcome = this.run(provider, model, request).await;
                // nobody listening is fine
                let _ = this.events.send(PullEvent {
                    task_id,
                    provider_name,
                    model_name,
                    outcome: outcome.clone(),
                });
                outcome
            }
            .instrument(span),
        );
        PullTicket { task_id, handle }
    }

    async fn run(
        &self,
        provider: ServiceProvider,
        mut model: Model,
        request: PullModelRequest,
    ) -> PullOutcome {
        if provider.is_local() {
            if let Err(reason) = self.pull(&provider, &request).await {
                tracing::error!(%reason, "Pull model failed");
                if self.is_tracked(&model) {
                    model.set_status(ModelStatus::Failed);
                    if let Err(e) = self.store.put(&mut model) {
                        tracing::error!(error = %e, "Failed to record failed pull");
                    }
                }
                return PullOutcome::Failed { reason };
            }
        }

        if !self.is_tracked(&model) {
            tracing::warn!("Model record removed during pull, dropping result");
            return PullOutcome::Failed {
                reason: "model record removed during pull".to_string(),
            };
        }
        model.set_status(ModelStatus::Downloaded);
        if let Err(e) = self.store.put(&mut model) {
            tracing::error!(error = %e, "Failed to record downloaded model");
            return PullOutcome::Failed {
                reason: e.to_string(),
            };
        }
        tracing::info!("Model downloaded");

        let provider_active = self.settle_downloaded(&provider, &model.model_name).await;
        PullOutcome::Downloaded { provider_active }
    }

    /// Whether `model`'s row still exists. A delete racing the pull wins.
    fn is_tracked(&self, model: &Model) -> bool {
        let mut current = Model::key(&model.provider_name, &model.model_name);
        match self.store.get(&mut current) {
            Ok(()) => true,
            Err(e) if e.is_not_found() => false,
            Err(e) => {
                tracing::error!(error = %e, "Failed to reload model");
                false
            }
        }
    }

    /// Post-download steps for a model that is already `downloaded`:
    /// activate the provider and mirror chat models into the paired provider.
    ///
    /// Returns whether the provider is active.
    pub(crate) async fn settle_downloaded(&self, provider: &ServiceProvider, model_name: &str) -> bool {
        let active = self.activate(provider, model_name).await;
        if provider.is_service(ServiceKind::Chat) {
            self.mirror_generate_model(provider, model_name);
        }
        active
    }

    async fn pull(
        &self,
        provider: &ServiceProvider,
        request: &PullModelRequest,
    ) -> Result<(), String> {
        let engine = self
            .engines
            .get_by_name(&provider.flavor)
            .await
            .ok_or_else(|| format!("no engine for flavor {:?}", provider.flavor))?;
        let progress = engine.pull_model(request).await.map_err(|e| e.to_string())?;
        tracing::debug!(status = %progress.status, "Engine finished pull");
        Ok(())
    }

    /// Verifies and activates the provider if it isn't active yet.
    ///
    /// A chat provider that passes also activates its paired generate provider.
    async fn activate(&self, provider: &ServiceProvider, model_name: &str) -> bool {
        let mut current = ServiceProvider::named(&provider.provider_name);
        if let Err(e) = self.store.get(&mut current) {
            tracing::error!(error = %e, "Failed to reload provider");
            return false;
        }
        if current.is_active() {
            return true;
        }

        if !self.verifier.verify(&current, model_name).await {
            tracing::warn!("Provider stays inactive after pull");
            return false;
        }

        if let Err(e) = mark_active(self.store.as_ref(), &mut current) {
            tracing::error!(error = %e, "Failed to activate provider");
            return false;
        }
        tracing::info!("Provider activated");
        true
    }

    pub(crate) fn mirror_generate_model(&self, provider: &ServiceProvider, model_name: &str) {
        let paired = paired_provider_name(&provider.provider_name);
        let mut mirrored = Model::new(&paired, model_name, ModelStatus::Downloaded);
        match self.store.add_if_absent(&mut mirrored) {
            Ok(true) => tracing::debug!(provider = %paired, "Mirrored model into paired provider"),
            Ok(false) => {}
            Err(e) => tracing::error!(error = %e, "Failed to mirror model"),
        }
    }
}

//! Persisted records: services, service providers and models.
//!
//! Field names double as column names in the entity store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::service::{HybridPolicy, ModelStatus, ServiceKind, ServiceSource};

/// Provider has not been verified, or its last verification failed.
pub const PROVIDER_INACTIVE: i64 = 0;
/// Provider answered a verification probe.
pub const PROVIDER_ACTIVE: i64 = 1;

/// Default value of the JSON text columns.
pub const EMPTY_JSON: &str = "{}";

/// Properties advertised by local chat and generate providers.
pub const LOCAL_CHAT_PROPERTIES: &str = r#"{"max_input_tokens":2048,"supported_response_mode":["stream","sync"],"mode_is_changeable":true,"xpu":["GPU"]}"#;

/// A logical capability exposed to callers, pre-seeded per [`ServiceKind`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Service {
    pub name: String,
    pub hybrid_policy: String,
    pub remote_provider: String,
    pub local_provider: String,
    pub status: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Service {
    /// Lookup key for the named service.
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    /// Seed row: default policy, no providers.
    pub fn seed(kind: ServiceKind) -> Self {
        Self {
            name: kind.to_string(),
            hybrid_policy: HybridPolicy::Default.to_string(),
            status: 1,
            ..Default::default()
        }
    }

    /// The routing pointer for `source`.
    pub fn provider_for(&self, source: ServiceSource) -> &str {
        match source {
            ServiceSource::Local => &self.local_provider,
            ServiceSource::Remote => &self.remote_provider,
        }
    }
}

/// One concrete backend offering a service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceProvider {
    #[serde(default)]
    pub id: i64,
    pub provider_name: String,
    pub service_name: String,
    pub service_source: String,
    pub desc: String,
    pub method: String,
    pub url: String,
    pub auth_type: String,
    pub auth_key: String,
    pub flavor: String,
    pub extra_headers: String,
    pub extra_json_body: String,
    pub properties: String,
    pub status: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Default for ServiceProvider {
    fn default() -> Self {
        Self {
            id: 0,
            provider_name: String::new(),
            service_name: String::new(),
            service_source: String::new(),
            desc: String::new(),
            method: String::new(),
            url: String::new(),
            auth_type: String::new(),
            auth_key: String::new(),
            flavor: String::new(),
            extra_headers: EMPTY_JSON.to_string(),
            extra_json_body: EMPTY_JSON.to_string(),
            properties: EMPTY_JSON.to_string(),
            status: PROVIDER_INACTIVE,
            created_at: DateTime::<Utc>::default(),
            updated_at: DateTime::<Utc>::default(),
        }
    }
}

impl ServiceProvider {
    /// Lookup key for the named provider.
    pub fn named(provider_name: &str) -> Self {
        Self {
            provider_name: provider_name.to_string(),
            ..Default::default()
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == PROVIDER_ACTIVE
    }

    pub fn is_local(&self) -> bool {
        self.service_source == ServiceSource::Local.as_str()
    }

    pub fn is_service(&self, kind: ServiceKind) -> bool {
        self.service_name == kind.as_str()
    }
}

/// A named model owned by exactly one provider.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Model {
    #[serde(default)]
    pub id: i64,
    pub model_name: String,
    pub provider_name: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Model {
    pub fn new(provider_name: &str, model_name: &str, status: ModelStatus) -> Self {
        Self {
            model_name: model_name.to_string(),
            provider_name: provider_name.to_string(),
            status: status.to_string(),
            ..Default::default()
        }
    }

    /// Lookup key for `(provider_name, model_name)`; either may be empty.
    pub fn key(provider_name: &str, model_name: &str) -> Self {
        Self {
            model_name: model_name.to_string(),
            provider_name: provider_name.to_string(),
            ..Default::default()
        }
    }

    pub fn has_status(&self, status: ModelStatus) -> bool {
        self.status == status.as_str()
    }

    pub fn set_status(&mut self, status: ModelStatus) {
        self.status = status.to_string();
    }
}

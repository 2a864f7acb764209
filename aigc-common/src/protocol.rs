//! Request and response records exchanged with the HTTP layer.
//!
//! Every response carries a [`ResultCode`]: the HTTP status, a stable
//! business code and a message.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::entity::{Model, ServiceProvider};

/// HTTP status, business code and message attached to every response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultCode {
    #[serde(skip)]
    pub http_code: u16,
    pub business_code: u32,
    pub message: String,
}

impl ResultCode {
    pub fn new(http_code: u16, business_code: u32, message: impl Into<String>) -> Self {
        Self {
            http_code,
            business_code,
            message: message.into(),
        }
    }

    /// Success code for service operations.
    pub fn service_ok() -> Self {
        Self::new(200, 10000, "service interface call success")
    }

    /// Success code for service provider operations.
    pub fn provider_ok() -> Self {
        Self::new(200, 20000, "service provider interface call success")
    }

    /// Success code for model operations.
    pub fn model_ok() -> Self {
        Self::new(200, 30000, "model interface call success")
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.http_code)
    }
}

/// Response envelope: the result code flattened next to an optional payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response<T> {
    #[serde(flatten)]
    pub code: ResultCode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T> Response<T> {
    pub fn ok(code: ResultCode, data: T) -> Self {
        Self {
            code,
            data: Some(data),
        }
    }

    pub fn empty(code: ResultCode) -> Self {
        Self { code, data: None }
    }
}

// ============================================================================
// Services
// ============================================================================

/// Install a service backed by a new or existing provider.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct InstallServiceRequest {
    pub service_name: String,
    pub service_source: String,
    pub api_flavor: String,
    pub provider_name: String,
    pub desc: String,
    pub method: String,
    pub url: String,
    pub auth_type: String,
    pub auth_key: String,
    pub extra_headers: String,
    pub extra_json_body: String,
    pub properties: String,
    /// Local installs only: do not touch the engine's model store.
    pub skip_model: bool,
    /// Local installs only: overrides the recommended model.
    pub model_name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdateServiceRequest {
    pub service_name: String,
    pub hybrid_policy: String,
    pub remote_provider: String,
    pub local_provider: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GetServicesRequest {
    pub service_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceInfo {
    pub service_name: String,
    pub hybrid_policy: String,
    pub remote_provider: String,
    pub local_provider: String,
    pub status: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ============================================================================
// Export / import
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportServicesRequest {
    pub service_name: String,
    pub provider_name: String,
    pub model_name: String,
}

/// The full service graph, keyed by service name and provider name.
///
/// Produced by export and accepted by import.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServicesPayload {
    pub version: String,
    pub services: BTreeMap<String, ServiceEntry>,
    pub service_providers: BTreeMap<String, ServiceProviderEntry>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceEntry {
    pub service_providers: ProviderPointers,
    pub hybrid_policy: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderPointers {
    pub local: String,
    pub remote: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceProviderEntry {
    pub service_name: String,
    pub service_source: String,
    pub desc: String,
    pub api_flavor: String,
    pub method: String,
    pub url: String,
    pub auth_type: String,
    pub auth_key: String,
    pub models: Vec<String>,
}

// ============================================================================
// Service providers
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CreateServiceProviderRequest {
    pub service_name: String,
    pub service_source: String,
    pub api_flavor: String,
    pub provider_name: String,
    pub desc: String,
    pub method: String,
    pub url: String,
    pub auth_type: String,
    pub auth_key: String,
    pub models: Vec<String>,
    pub extra_headers: String,
    pub extra_json_body: String,
    pub properties: String,
}

/// Partial update: empty fields keep the stored value.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdateServiceProviderRequest {
    pub provider_name: String,
    pub service_name: String,
    pub service_source: String,
    pub api_flavor: String,
    pub desc: String,
    pub method: String,
    pub url: String,
    pub auth_type: String,
    pub auth_key: String,
    pub models: Vec<String>,
    pub extra_headers: String,
    pub extra_json_body: String,
    pub properties: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DeleteServiceProviderRequest {
    pub provider_name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GetServiceProviderRequest {
    pub provider_name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GetServiceProvidersRequest {
    pub service_name: String,
    pub service_source: String,
    pub provider_name: String,
    pub api_flavor: String,
}

/// Provider listing entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceProviderInfo {
    pub provider_name: String,
    pub service_name: String,
    pub service_source: String,
    pub desc: String,
    pub auth_type: String,
    pub auth_key: String,
    pub flavor: String,
    pub properties: String,
    pub models: Vec<String>,
    pub status: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A single provider with its live status and its models.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceProviderDetail {
    #[serde(flatten)]
    pub provider: ServiceProvider,
    pub models: Vec<ModelInfo>,
}

// ============================================================================
// Models
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CreateModelRequest {
    pub provider_name: String,
    pub model_name: String,
    pub service_name: String,
    pub service_source: String,
    /// Remote only: credentials replacing (or, for smartvision, merged into) the stored ones.
    pub auth_key: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DeleteModelRequest {
    pub provider_name: String,
    pub model_name: String,
    pub service_name: String,
    pub service_source: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GetModelsRequest {
    pub provider_name: String,
    pub model_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub model_name: String,
    pub provider_name: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Model> for ModelInfo {
    fn from(m: Model) -> Self {
        Self {
            model_name: m.model_name,
            provider_name: m.provider_name,
            status: m.status,
            created_at: m.created_at,
            updated_at: m.updated_at,
        }
    }
}

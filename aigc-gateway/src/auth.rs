//! Outbound request authentication for remote providers.
//!
//! An [`Authenticator`] decorates a built request with the credentials a
//! provider's `auth_type` calls for. Only API keys are handled here; signing
//! schemes plug in through [`Authenticators::register`].

use std::collections::HashMap;
use std::sync::Arc;

use aigc_common::{AuthType, ServiceProvider};
use async_trait::async_trait;
use reqwest::header::{HeaderValue, AUTHORIZATION};
use serde::Deserialize;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AuthError {
    #[error("Provider {0} has no credentials")]
    MissingKey(String),

    #[error("Invalid credentials for provider {provider}: {message}")]
    InvalidKey { provider: String, message: String },
}

#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Adds credentials to `request`; `content` is the serialized body.
    async fn authenticate(
        &self,
        request: &mut reqwest::Request,
        provider: &ServiceProvider,
        content: &[u8],
    ) -> Result<(), AuthError>;
}

#[derive(Debug, Deserialize)]
struct ApiKeyAuthInfo {
    api_key: String,
}

/// Sends the provider's API key as a bearer token.
///
/// The stored key is either `{"api_key": "..."}` or the bare key.
#[derive(Debug, Default)]
pub struct ApiKeyAuthenticator;

impl ApiKeyAuthenticator {
    fn key(provider: &ServiceProvider) -> Result<String, AuthError> {
        let raw = provider.auth_key.trim();
        if raw.is_empty() {
            return Err(AuthError::MissingKey(provider.provider_name.clone()));
        }
        if raw.starts_with('{') {
            let info: ApiKeyAuthInfo =
                serde_json::from_str(raw).map_err(|e| AuthError::InvalidKey {
                    provider: provider.provider_name.clone(),
                    message: e.to_string(),
                })?;
            if info.api_key.is_empty() {
                return Err(AuthError::MissingKey(provider.provider_name.clone()));
            }
            return Ok(info.api_key);
        }
        Ok(raw.to_string())
    }
}

#[async_trait]
impl Authenticator for ApiKeyAuthenticator {
    async fn authenticate(
        &self,
        request: &mut reqwest::Request,
        provider: &ServiceProvider,
        _content: &[u8],
    ) -> Result<(), AuthError> {
        let key = Self::key(provider)?;
        let value = HeaderValue::from_str(&format!("Bearer {}", key)).map_err(|e| {
            AuthError::InvalidKey {
                provider: provider.provider_name.clone(),
                message: e.to_string(),
            }
        })?;
        request.headers_mut().insert(AUTHORIZATION, value);
        Ok(())
    }
}

/// Authenticators keyed by auth type.
#[derive(Clone)]
pub struct Authenticators {
    by_type: HashMap<AuthType, Arc<dyn Authenticator>>,
}

impl Authenticators {
    /// No authenticators at all.
    pub fn empty() -> Self {
        Self {
            by_type: HashMap::new(),
        }
    }

    /// Adds (or replaces) the authenticator for `auth_type`.
    pub fn register(mut self, auth_type: AuthType, authenticator: Arc<dyn Authenticator>) -> Self {
        self.by_type.insert(auth_type, authenticator);
        self
    }

    /// Authenticator for the provider's auth type.
    ///
    /// `None` for `none`, for unknown auth types and for types nobody registered.
    pub fn choose(&self, provider: &ServiceProvider) -> Option<Arc<dyn Authenticator>> {
        let auth_type = provider.auth_type.parse::<AuthType>().ok()?;
        if auth_type == AuthType::None {
            return None;
        }
        self.by_type.get(&auth_type).cloned()
    }
}

impl Default for Authenticators {
    fn default() -> Self {
        Self::empty().register(AuthType::ApiKey, Arc::new(ApiKeyAuthenticator))
    }
}

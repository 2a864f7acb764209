//! Error types for the gateway core.
//!
//! Every variant maps to a stable [`ResultCode`]: services use the 10xxx
//! range, providers 20xxx and models 30xxx.

use aigc_common::{ResultCode, UnknownVariant};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use crate::store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Service already exists: {0}")]
    ServiceAlreadyExists(String),

    #[error("Service provider already exists: {0}")]
    ProviderAlreadyExists(String),

    #[error("Model already exists: {0}")]
    ModelAlreadyExists(String),

    #[error("Provider auth info missing for auth type {0}")]
    AuthInfoMissing(String),

    #[error("Unsupported auth type: {0}")]
    UnsupportedAuthType(String),

    #[error("Unsupported flavor: {0}")]
    UnsupportedFlavor(String),

    #[error("Unsupported hybrid policy: {0}")]
    UnsupportedHybridPolicy(String),

    #[error("Unsupported service: {0}")]
    UnsupportedService(String),

    #[error("Unsupported service source: {0}")]
    UnsupportedSource(String),

    #[error("Engine install failed: {0}")]
    EngineInstallFailed(String),

    #[error("Engine start failed: {0}")]
    EngineStartFailed(String),

    #[error("Engine environment init failed: {0}")]
    EngineEnvInitFailed(String),

    #[error("Engine health unreachable: {0}")]
    EngineHealthUnreachable(String),

    #[error("Engine model list failed: {0}")]
    EngineModelListFailed(String),

    #[error("Engine model delete failed: {0}")]
    EngineDeleteFailed(String),

    #[error("Model pull failed: {0}")]
    ModelPullFailed(String),

    #[error("Service provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("Service record not found: {0}")]
    ServiceRecordNotFound(String),

    #[error("Service provider not found: {0}")]
    ProviderNotFound(String),

    #[error("Model not found: {0}")]
    ModelNotFound(String),

    #[error("Version mismatch: expected {expected}, got {found}")]
    VersionMismatch { expected: String, found: String },

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Result code returned to the caller for this error.
    pub fn code(&self) -> ResultCode {
        let (http, business) = match self {
            Error::Store(e) if e.is_not_found() => (404, 10021),
            Error::Store(StoreError::RecordExist) => (409, 10022),
            Error::Store(_) => (500, 10008),
            Error::BadRequest(_) => (400, 10001),
            Error::EngineEnvInitFailed(_) => (500, 10002),
            Error::EngineInstallFailed(_) => (500, 10003),
            Error::EngineStartFailed(_) => (500, 10004),
            Error::EngineModelListFailed(_) => (500, 10005),
            Error::ModelPullFailed(_) => (500, 10006),
            Error::Internal(_) => (500, 10007),
            Error::ProviderAlreadyExists(_) => (409, 10009),
            Error::ServiceAlreadyExists(_) => (409, 10010),
            Error::ServiceRecordNotFound(_) => (404, 10011),
            Error::VersionMismatch { .. } => (422, 10014),
            Error::UnsupportedService(_) => (400, 10015),
            Error::UnsupportedHybridPolicy(_) => (400, 10016),
            Error::UnsupportedFlavor(_) => (400, 10017),
            Error::UnsupportedAuthType(_) => (400, 10018),
            Error::EngineHealthUnreachable(_) => (500, 10019),
            Error::UnsupportedSource(_) => (400, 10020),
            Error::ProviderNotFound(_) => (404, 20001),
            Error::AuthInfoMissing(_) => (400, 20002),
            Error::ProviderUnavailable(_) => (500, 20003),
            Error::ModelAlreadyExists(_) => (409, 30002),
            Error::ModelNotFound(_) => (404, 30003),
            Error::EngineDeleteFailed(_) => (500, 30006),
        };
        ResultCode::new(http, business, self.to_string())
    }

    /// Whether this is a store miss.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Store(e) if e.is_not_found())
    }

    /// Maps an unknown vocabulary value to its validation error.
    pub fn unsupported(e: UnknownVariant) -> Self {
        match e.kind {
            "service" => Error::UnsupportedService(e.value),
            "service source" => Error::UnsupportedSource(e.value),
            "hybrid policy" => Error::UnsupportedHybridPolicy(e.value),
            "auth type" => Error::UnsupportedAuthType(e.value),
            "flavor" => Error::UnsupportedFlavor(e.value),
            _ => Error::BadRequest(e.to_string()),
        }
    }
}

impl From<UnknownVariant> for Error {
    fn from(e: UnknownVariant) -> Self {
        Error::unsupported(e)
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let code = self.code();
        let status =
            StatusCode::from_u16(code.http_code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        let body = Json(json!({
            "business_code": code.business_code,
            "message": code.message,
        }));

        (status, body).into_response()
    }
}

pub type Result<T> = std::result::Result<T, Error>;

//! AIGC Gateway Common Types
//!
//! Shared vocabularies, persisted records and protocol messages used by the
//! gateway core and the HTTP layer.

pub mod entity;
pub mod protocol;
pub mod service;

pub use entity::{
    Model, Service, ServiceProvider, EMPTY_JSON, LOCAL_CHAT_PROPERTIES, PROVIDER_ACTIVE,
    PROVIDER_INACTIVE,
};
pub use protocol::{Response, ResultCode, ServicesPayload};
pub use service::{
    AuthType, Flavor, HybridPolicy, ModelStatus, ServiceKind, ServiceSource, UnknownVariant,
};

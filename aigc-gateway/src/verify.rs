//! Provider verification: one minimal real request per service kind.
//!
//! [`ProviderCheck::choose`] picks the probe for a provider once; the probe
//! itself never fails loudly. Anything that goes wrong (bad headers, missing
//! credentials, transport error, non-2xx) is logged and reported as `false`.

use std::time::Duration;

use aigc_common::{AuthType, Flavor, ServiceKind, ServiceProvider, EMPTY_JSON};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use reqwest::{Client, Method};
use serde_json::{json, Map, Value};

use crate::auth::{AuthError, Authenticators};
use crate::config::VerifyConfig;
use crate::error::{Error, Result};

const CHAT_PROBE: &str = "你好！";
const EMBED_PROBE: &str = "test text";
const IMAGE_PROBE: &str = "画一只小狗";

#[derive(Debug, thiserror::Error)]
enum ProbeError {
    #[error("invalid method {0:?}")]
    Method(String),
    #[error("invalid extra headers: {0}")]
    Headers(String),
    #[error("no authenticator for auth type {0:?}")]
    NoAuthenticator(String),
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Transport(#[from] reqwest::Error),
    #[error("status {0}")]
    Status(reqwest::StatusCode),
    #[error("unexpected response body: {0}")]
    Body(String),
}

/// Shared probe transport: HTTP client plus authenticators.
#[derive(Clone)]
pub struct Verifier {
    client: Client,
    authenticators: Authenticators,
}

impl Verifier {
    pub fn new(config: &VerifyConfig, authenticators: Authenticators) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| Error::Internal(format!("probe client: {}", e)))?;
        Ok(Self {
            client,
            authenticators,
        })
    }

    /// Chooses and runs the probe for `provider`; `false` when no probe applies.
    pub async fn verify(&self, provider: &ServiceProvider, model_name: &str) -> bool {
        match ProviderCheck::choose(provider, model_name) {
            Some(check) => check.check_server(self).await,
            None => {
                tracing::warn!(
                    provider = %provider.provider_name,
                    service = %provider.service_name,
                    "No verification strategy for service"
                );
                false
            }
        }
    }

    /// First model of `models` that passes verification.
    pub async fn verify_any<'a>(
        &self,
        provider: &ServiceProvider,
        models: impl IntoIterator<Item = &'a str>,
    ) -> Option<&'a str> {
        for model in models {
            if self.verify(provider, model).await {
                return Some(model);
            }
        }
        None
    }

    async fn probe(&self, provider: &ServiceProvider, body: Option<Value>) -> bool {
        match self.send(provider, body).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(
                    provider = %provider.provider_name,
                    url = %provider.url,
                    error = %e,
                    "Provider probe failed"
                );
                false
            }
        }
    }

    async fn send(
        &self,
        provider: &ServiceProvider,
        body: Option<Value>,
    ) -> std::result::Result<(), ProbeError> {
        let method = probe_method(provider, body.is_some())?;
        let content = match &body {
            Some(body) => serde_json::to_vec(body).map_err(|e| ProbeError::Body(e.to_string()))?,
            None => Vec::new(),
        };

        let mut builder = self.client.request(method, &provider.url);
        if body.is_some() {
            builder = builder.body(content.clone());
        }
        let mut request = builder.build()?;

        apply_extra_headers(request.headers_mut(), &provider.extra_headers)?;
        request
            .headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        if requires_auth(&provider.auth_type) {
            let authenticator = self
                .authenticators
                .choose(provider)
                .ok_or_else(|| ProbeError::NoAuthenticator(provider.auth_type.clone()))?;
            authenticator
                .authenticate(&mut request, provider, &content)
                .await?;
        }

        let response = self.client.execute(request).await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ProbeError::Status(status));
        }

        if provider.flavor == Flavor::SmartVision.as_str() {
            let body: Value = response.json().await?;
            match body.get("status_code").and_then(Value::as_f64) {
                Some(code) if code == 200.0 => {}
                other => return Err(ProbeError::Body(format!("status_code {:?}", other))),
            }
        }
        Ok(())
    }
}

fn requires_auth(auth_type: &str) -> bool {
    !(auth_type.is_empty() || auth_type == AuthType::None.as_str())
}

fn probe_method(provider: &ServiceProvider, has_body: bool) -> std::result::Result<Method, ProbeError> {
    if provider.method.is_empty() {
        return Ok(if has_body { Method::POST } else { Method::GET });
    }
    Method::from_bytes(provider.method.to_uppercase().as_bytes())
        .map_err(|_| ProbeError::Method(provider.method.clone()))
}

/// Copies the provider's extra headers (a JSON object of strings) onto `headers`.
fn apply_extra_headers(headers: &mut HeaderMap, extra: &str) -> std::result::Result<(), ProbeError> {
    if extra.is_empty() || extra == EMPTY_JSON {
        return Ok(());
    }
    let map: Map<String, Value> =
        serde_json::from_str(extra).map_err(|e| ProbeError::Headers(e.to_string()))?;
    for (key, value) in map {
        let value = value
            .as_str()
            .ok_or_else(|| ProbeError::Headers(format!("{} is not a string", key)))?;
        let name = HeaderName::from_bytes(key.as_bytes())
            .map_err(|e| ProbeError::Headers(e.to_string()))?;
        let value =
            HeaderValue::from_str(value).map_err(|e| ProbeError::Headers(e.to_string()))?;
        headers.insert(name, value);
    }
    Ok(())
}

/// Verification probe for one provider, one variant per service kind.
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderCheck {
    Models {
        provider: ServiceProvider,
    },
    Chat {
        provider: ServiceProvider,
        model: String,
    },
    Generate {
        provider: ServiceProvider,
        model: String,
    },
    Embed {
        provider: ServiceProvider,
        model: String,
    },
    TextToImage {
        provider: ServiceProvider,
        model: String,
    },
}

impl ProviderCheck {
    /// Probe for the provider's service; `None` for services nobody can verify.
    pub fn choose(provider: &ServiceProvider, model_name: &str) -> Option<Self> {
        let kind = provider.service_name.parse::<ServiceKind>().ok()?;
        let provider = provider.clone();
        let model = model_name.to_string();
        Some(match kind {
            ServiceKind::Models => ProviderCheck::Models { provider },
            ServiceKind::Chat => ProviderCheck::Chat { provider, model },
            ServiceKind::Generate => ProviderCheck::Generate { provider, model },
            ServiceKind::Embed => ProviderCheck::Embed { provider, model },
            ServiceKind::TextToImage => ProviderCheck::TextToImage { provider, model },
        })
    }

    pub fn provider(&self) -> &ServiceProvider {
        match self {
            ProviderCheck::Models { provider }
            | ProviderCheck::Chat { provider, .. }
            | ProviderCheck::Generate { provider, .. }
            | ProviderCheck::Embed { provider, .. }
            | ProviderCheck::TextToImage { provider, .. } => provider,
        }
    }

    /// Request body sent by the probe; `None` for bodiless probes.
    pub fn body(&self) -> Option<Value> {
        match self {
            ProviderCheck::Models { .. } | ProviderCheck::Generate { .. } => None,
            ProviderCheck::Chat { model, .. } => Some(json!({
                "model": model,
                "messages": [{"role": "user", "content": CHAT_PROBE}],
                "stream": false,
            })),
            ProviderCheck::Embed { model, .. } => Some(json!({
                "model": model,
                "input": [EMBED_PROBE],
                "inputs": [EMBED_PROBE],
                "dimensions": 1024,
                "encoding_format": "float",
            })),
            ProviderCheck::TextToImage { provider, model } => {
                Some(match provider.flavor.parse::<Flavor>() {
                    Ok(Flavor::Tencent) => json!({
                        "model": model,
                        "Prompt": IMAGE_PROBE,
                        "RspImgType": "url",
                    }),
                    Ok(Flavor::AliYun) => json!({
                        "model": model,
                        "input": {"prompt": IMAGE_PROBE},
                    }),
                    // baidu and everything else share the flat shape
                    _ => json!({"model": model, "prompt": IMAGE_PROBE}),
                })
            }
        }
    }

    /// Runs the probe. Never errors; failures are logged and yield `false`.
    pub async fn check_server(&self, verifier: &Verifier) -> bool {
        if let ProviderCheck::Generate { provider, .. } = self {
            tracing::debug!(provider = %provider.provider_name, "Generate providers are not verifiable");
            return false;
        }
        verifier.probe(self.provider(), self.body()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn verifier() -> Verifier {
        Verifier::new(&VerifyConfig::default(), Authenticators::default()).unwrap()
    }

    fn provider(service: &str, flavor: &str, url: String) -> ServiceProvider {
        ServiceProvider {
            provider_name: format!("remote_{}_{}", flavor, service),
            service_name: service.to_string(),
            service_source: "remote".to_string(),
            flavor: flavor.to_string(),
            method: "POST".to_string(),
            url,
            auth_type: "none".to_string(),
            ..Default::default()
        }
    }

    #[rstest]
    #[case("models", true)]
    #[case("chat", true)]
    #[case("generate", true)]
    #[case("embed", true)]
    #[case("text_to_image", true)]
    #[case("bogus", false)]
    #[case("", false)]
    fn test_choose_dispatch(#[case] service: &str, #[case] known: bool) {
        let sp = provider(service, "openai", String::new());
        assert_eq!(ProviderCheck::choose(&sp, "m").is_some(), known);
    }

    #[tokio::test]
    async fn test_generate_is_never_reachable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let sp = provider("generate", "ollama", server.uri());
        let check = ProviderCheck::choose(&sp, "deepseek-r1:7b").unwrap();
        assert!(!check.check_server(&verifier()).await);
    }

    #[tokio::test]
    async fn test_chat_probe_body_and_headers() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header("content-type", "application/json"))
            .and(header("x-trace", "probe"))
            .and(header("authorization", "Bearer sk-123"))
            .and(body_json(json!({
                "model": "gpt-4o-mini",
                "messages": [{"role": "user", "content": "你好！"}],
                "stream": false,
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "x"})))
            .expect(1)
            .mount(&server)
            .await;

        let mut sp = provider("chat", "openai", format!("{}/v1/chat/completions", server.uri()));
        sp.extra_headers = r#"{"X-Trace":"probe"}"#.to_string();
        sp.auth_type = "apikey".to_string();
        sp.auth_key = r#"{"api_key":"sk-123"}"#.to_string();

        assert!(verifier().verify(&sp, "gpt-4o-mini").await);
    }

    #[tokio::test]
    async fn test_non_success_status_fails() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let sp = provider("embed", "openai", format!("{}/v1/embeddings", server.uri()));
        assert!(!verifier().verify(&sp, "text-embedding-3-small").await);
    }

    #[tokio::test]
    async fn test_embed_probe_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_json(json!({
                "model": "bge-m3",
                "input": ["test text"],
                "inputs": ["test text"],
                "dimensions": 1024,
                "encoding_format": "float",
            })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let sp = provider("embed", "ollama", format!("{}/api/embed", server.uri()));
        assert!(verifier().verify(&sp, "bge-m3").await);
    }

    #[tokio::test]
    async fn test_models_probe_uses_declared_method() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/tags"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"models": []})))
            .expect(1)
            .mount(&server)
            .await;

        let mut sp = provider("models", "ollama", format!("{}/api/tags", server.uri()));
        sp.method = "GET".to_string();
        assert!(verifier().verify(&sp, "").await);
    }

    #[rstest]
    #[case(json!({"status_code": 200, "output": "hi"}), true)]
    #[case(json!({"status_code": 500}), false)]
    #[case(json!({"output": "hi"}), false)]
    #[tokio::test]
    async fn test_smartvision_requires_embedded_status(#[case] body: Value, #[case] ok: bool) {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(body))
            .mount(&server)
            .await;

        let sp = provider("chat", "smartvision", server.uri());
        assert_eq!(verifier().verify(&sp, "sv-chat").await, ok);
    }

    #[tokio::test]
    async fn test_auth_failures_are_probe_failures() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let mut sp = provider("chat", "openai", server.uri());
        sp.auth_type = "apikey".to_string();
        assert!(!verifier().verify(&sp, "gpt-4o-mini").await);

        sp.auth_type = "token".to_string();
        sp.auth_key = "t".to_string();
        assert!(!verifier().verify(&sp, "gpt-4o-mini").await);
    }

    #[tokio::test]
    async fn test_invalid_extra_headers_fail_the_probe() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let mut sp = provider("chat", "openai", server.uri());
        sp.extra_headers = "{not json".to_string();
        assert!(!verifier().verify(&sp, "m").await);
    }

    #[test]
    fn test_text_to_image_body_per_flavor() {
        let body = |flavor: &str| {
            ProviderCheck::choose(&provider("text_to_image", flavor, String::new()), "img")
                .unwrap()
                .body()
                .unwrap()
        };
        assert_eq!(
            body("tencent"),
            json!({"model": "img", "Prompt": "画一只小狗", "RspImgType": "url"})
        );
        assert_eq!(body("aliyun"), json!({"model": "img", "input": {"prompt": "画一只小狗"}}));
        assert_eq!(body("baidu"), json!({"model": "img", "prompt": "画一只小狗"}));
        assert_eq!(body("openai"), body("baidu"));
    }

    #[tokio::test]
    async fn test_verify_any_returns_first_passing_model() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_json(json!({
                "model": "good",
                "messages": [{"role": "user", "content": "你好！"}],
                "stream": false,
            })))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let sp = provider("chat", "deepseek", server.uri());
        let v = verifier();
        assert_eq!(v.verify_any(&sp, ["bad", "good"]).await, Some("good"));
        assert_eq!(v.verify_any(&sp, ["bad"]).await, None);
    }
}

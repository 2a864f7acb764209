//! Built-in defaults per flavor and service.
//!
//! Install and import fall back to these when a request leaves the URL,
//! method, headers or model empty. Local installs also take their model
//! from [`recommended_model`].

use aigc_common::{AuthType, Flavor, ServiceKind, EMPTY_JSON};

/// Defaults for one `(flavor, service)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceDefaults {
    pub flavor: Flavor,
    pub service: ServiceKind,
    pub method: &'static str,
    /// Scheme and host; local engines replace this with their configured base URL.
    pub base_url: &'static str,
    pub path: &'static str,
    pub default_model: &'static str,
    pub auth_type: AuthType,
    pub extra_headers: &'static str,
}

impl ServiceDefaults {
    pub fn url(&self) -> String {
        self.url_on(self.base_url)
    }

    /// The endpoint rooted at `base_url`.
    pub fn url_on(&self, base_url: &str) -> String {
        format!("{}{}", base_url.trim_end_matches('/'), self.path)
    }
}

/// Model installed when a local service is requested without one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecommendedModel {
    pub engine: Flavor,
    pub model_name: &'static str,
}

const OLLAMA: &str = "http://127.0.0.1:16677";

macro_rules! defaults {
    ($flavor:ident, $service:ident, $method:literal, $base:expr, $path:literal, $model:literal, $auth:ident) => {
        defaults!($flavor, $service, $method, $base, $path, $model, $auth, EMPTY_JSON)
    };
    ($flavor:ident, $service:ident, $method:literal, $base:expr, $path:literal, $model:literal, $auth:ident, $headers:expr) => {
        ServiceDefaults {
            flavor: Flavor::$flavor,
            service: ServiceKind::$service,
            method: $method,
            base_url: $base,
            path: $path,
            default_model: $model,
            auth_type: AuthType::$auth,
            extra_headers: $headers,
        }
    };
}

static CATALOG: &[ServiceDefaults] = &[
    defaults!(Ollama, Chat, "POST", OLLAMA, "/api/chat", "deepseek-r1:7b", None),
    defaults!(Ollama, Generate, "POST", OLLAMA, "/api/generate", "deepseek-r1:7b", None),
    defaults!(Ollama, Embed, "POST", OLLAMA, "/api/embed", "bge-m3", None),
    defaults!(Ollama, Models, "GET", OLLAMA, "/api/tags", "", None),
    defaults!(OpenAi, Chat, "POST", "https://api.openai.com", "/v1/chat/completions", "gpt-4o-mini", ApiKey),
    defaults!(OpenAi, Embed, "POST", "https://api.openai.com", "/v1/embeddings", "text-embedding-3-small", ApiKey),
    defaults!(OpenAi, TextToImage, "POST", "https://api.openai.com", "/v1/images/generations", "dall-e-3", ApiKey),
    defaults!(DeepSeek, Chat, "POST", "https://api.deepseek.com", "/v1/chat/completions", "deepseek-chat", ApiKey),
    defaults!(Tencent, Chat, "POST", "https://api.hunyuan.cloud.tencent.com", "/v1/chat/completions", "hunyuan-turbo", ApiKey),
    defaults!(
        Tencent,
        TextToImage,
        "POST",
        "https://hunyuan.tencentcloudapi.com",
        "/",
        "hunyuan-image",
        Token,
        r#"{"X-TC-Action":"TextToImageLite","X-TC-Version":"2023-09-01","X-TC-Region":"ap-guangzhou"}"#
    ),
    defaults!(AliYun, Chat, "POST", "https://dashscope.aliyuncs.com", "/compatible-mode/v1/chat/completions", "qwen-plus", ApiKey),
    defaults!(AliYun, Embed, "POST", "https://dashscope.aliyuncs.com", "/compatible-mode/v1/embeddings", "text-embedding-v3", ApiKey),
    defaults!(
        AliYun,
        TextToImage,
        "POST",
        "https://dashscope.aliyuncs.com",
        "/api/v1/services/aigc/text2image/image-synthesis",
        "wanx-v1",
        ApiKey,
        r#"{"X-DashScope-Async":"enable"}"#
    ),
    defaults!(Baidu, Chat, "POST", "https://qianfan.baidubce.com", "/v2/chat/completions", "ernie-speed-128k", ApiKey),
    defaults!(Baidu, Embed, "POST", "https://qianfan.baidubce.com", "/v2/embeddings", "bge-large-zh", ApiKey),
    defaults!(Baidu, TextToImage, "POST", "https://qianfan.baidubce.com", "/v2/images/generations", "irag-1.0", ApiKey),
];

/// Defaults for `service` offered by `flavor`, if the flavor offers it.
pub fn service_defaults(flavor: Flavor, service: ServiceKind) -> Option<&'static ServiceDefaults> {
    CATALOG
        .iter()
        .find(|d| d.flavor == flavor && d.service == service)
}

/// Every service `flavor` has defaults for.
pub fn services_of(flavor: Flavor) -> impl Iterator<Item = &'static ServiceDefaults> {
    CATALOG.iter().filter(move |d| d.flavor == flavor)
}

/// Recommended local model for `service`, `None` when the service has no local model.
pub fn recommended_model(service: ServiceKind) -> Option<RecommendedModel> {
    let model_name = match service {
        ServiceKind::Chat | ServiceKind::Generate => "deepseek-r1:7b",
        ServiceKind::Embed => "bge-m3",
        ServiceKind::Models | ServiceKind::TextToImage => return None,
    };
    Some(RecommendedModel {
        engine: Flavor::Ollama,
        model_name,
    })
}

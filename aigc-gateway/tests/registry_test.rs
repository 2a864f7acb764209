use std::time::Duration;

use aigc_common::protocol::{
    CreateServiceProviderRequest, DeleteServiceProviderRequest, GetModelsRequest,
    GetServiceProvidersRequest, GetServicesRequest, InstallServiceRequest, ServicesPayload,
    UpdateServiceProviderRequest,
};
use aigc_common::{ServiceProvider, PROVIDER_ACTIVE, PROVIDER_INACTIVE};
use aigc_gateway::test_util::{registry_with, FakeEngine};
use aigc_gateway::{EntityStore, Error, PullEvent, PullOutcome, ServiceRegistry, SqliteStore};
use serde_json::json;
use tokio::sync::broadcast;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn next_event(events: &mut broadcast::Receiver<PullEvent>) -> PullEvent {
    tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("pull did not finish in time")
        .expect("event channel closed")
}

fn model_status(registry: &ServiceRegistry<SqliteStore>, provider: &str, model: &str) -> Option<String> {
    registry
        .get_models(GetModelsRequest {
            provider_name: provider.to_string(),
            model_name: model.to_string(),
        })
        .unwrap()
        .into_iter()
        .next()
        .map(|m| m.status)
}

fn provider(registry: &ServiceRegistry<SqliteStore>, name: &str) -> ServiceProvider {
    let mut sp = ServiceProvider::named(name);
    registry.store().get(&mut sp).unwrap();
    sp
}

fn pointers(registry: &ServiceRegistry<SqliteStore>, service: &str) -> (String, String) {
    let services = registry
        .get_services(GetServicesRequest {
            service_name: service.to_string(),
        })
        .unwrap();
    (services[0].local_provider.clone(), services[0].remote_provider.clone())
}

fn local_install(service: &str, model: &str) -> InstallServiceRequest {
    InstallServiceRequest {
        service_name: service.to_string(),
        service_source: "local".to_string(),
        api_flavor: "ollama".to_string(),
        model_name: model.to_string(),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_local_chat_install_end_to_end() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/chat"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"done": true})))
        .mount(&server)
        .await;

    let engine = FakeEngine::stopped()
        .with_base_url(&server.uri())
        .holding_pulls();
    let (registry, engine) = registry_with(engine).await;
    let mut events = registry.lifecycle().subscribe();

    registry
        .install_service(local_install("chat", "Qwen2:0.5b"))
        .await
        .unwrap();

    // the call returns while the pull is still running
    assert_eq!(engine.starts(), 1);
    assert_eq!(
        model_status(&registry, "local_ollama_chat", "qwen2:0.5b").as_deref(),
        Some("downloading")
    );
    assert_eq!(provider(&registry, "local_ollama_chat").status, PROVIDER_INACTIVE);
    assert_eq!(
        provider(&registry, "local_ollama_chat").url,
        format!("{}/api/chat", server.uri())
    );

    engine.release_pulls();
    let event = next_event(&mut events).await;
    assert_eq!(event.provider_name, "local_ollama_chat");
    assert_eq!(event.outcome, PullOutcome::Downloaded { provider_active: true });
    assert_eq!(engine.pulled_models(), vec!["Qwen2:0.5b"]);

    assert_eq!(
        model_status(&registry, "local_ollama_chat", "qwen2:0.5b").as_deref(),
        Some("downloaded")
    );
    assert_eq!(provider(&registry, "local_ollama_chat").status, PROVIDER_ACTIVE);

    // paired generate provider follows the chat provider
    let generate = provider(&registry, "local_ollama_generate");
    assert_eq!(generate.status, PROVIDER_ACTIVE);
    assert_eq!(generate.url, format!("{}/api/generate", server.uri()));
    assert_eq!(
        model_status(&registry, "local_ollama_generate", "qwen2:0.5b").as_deref(),
        Some("downloaded")
    );

    assert_eq!(pointers(&registry, "chat").0, "local_ollama_chat");
    assert_eq!(pointers(&registry, "generate").0, "local_ollama_generate");
    assert_eq!(pointers(&registry, "models").0, "local_ollama_models");

    // listing hides the generate and models rows
    let listed = registry
        .get_service_providers(GetServiceProvidersRequest::default())
        .await
        .unwrap();
    let names: Vec<_> = listed.iter().map(|p| p.provider_name.as_str()).collect();
    assert_eq!(names, vec!["local_ollama_chat"]);
    assert_eq!(listed[0].models, vec!["qwen2:0.5b"]);

    let err = registry
        .install_service(local_install("chat", "qwen2:0.5b"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ServiceAlreadyExists(_)));
}

#[tokio::test]
async fn test_local_install_skips_pull_when_engine_has_model() {
    let engine = FakeEngine::running().with_models(&["bge-m3:latest"]);
    let (registry, engine) = registry_with(engine).await;

    registry
        .install_service(local_install("embed", ""))
        .await
        .unwrap();

    assert_eq!(
        model_status(&registry, "local_ollama_embed", "bge-m3").as_deref(),
        Some("downloaded")
    );
    assert!(engine.pulled_models().is_empty());
    assert_eq!(pointers(&registry, "embed").0, "local_ollama_embed");
}

#[tokio::test]
async fn test_failed_pull_marks_model_failed() {
    let engine = FakeEngine::running().failing_pulls("manifest unknown");
    let (registry, _) = registry_with(engine).await;
    let mut events = registry.lifecycle().subscribe();

    registry
        .install_service(local_install("embed", "no-such-model"))
        .await
        .unwrap();

    let event = next_event(&mut events).await;
    assert!(matches!(event.outcome, PullOutcome::Failed { .. }));
    assert_eq!(
        model_status(&registry, "local_ollama_embed", "no-such-model").as_deref(),
        Some("failed")
    );
    assert_eq!(provider(&registry, "local_ollama_embed").status, PROVIDER_INACTIVE);

    // a failed model may be installed again
    registry
        .install_service(local_install("embed", "no-such-model"))
        .await
        .unwrap();
    next_event(&mut events).await;
}

#[tokio::test]
async fn test_unreachable_engine_fails_install_cleanly() {
    let (registry, engine) = registry_with(FakeEngine::unreachable()).await;

    let err = registry
        .install_service(local_install("chat", "qwen2:0.5b"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::EngineHealthUnreachable(_)));
    assert_eq!(engine.starts(), 1);
    assert!(!registry
        .store()
        .is_exist(&ServiceProvider::named("local_ollama_chat"))
        .unwrap());
}

fn local_embed_provider(name: &str) -> CreateServiceProviderRequest {
    CreateServiceProviderRequest {
        service_name: "embed".to_string(),
        service_source: "local".to_string(),
        api_flavor: "ollama".to_string(),
        provider_name: name.to_string(),
        models: vec!["bge-m3".to_string()],
        ..Default::default()
    }
}

#[tokio::test]
async fn test_shared_model_survives_first_provider_delete() {
    let engine = FakeEngine::running().with_models(&["bge-m3"]);
    let (registry, engine) = registry_with(engine).await;

    registry.create_service_provider(local_embed_provider("p1")).await.unwrap();
    registry.create_service_provider(local_embed_provider("p2")).await.unwrap();
    assert_eq!(model_status(&registry, "p2", "bge-m3").as_deref(), Some("downloaded"));
    assert_eq!(pointers(&registry, "embed").0, "p1");

    registry
        .delete_service_provider(DeleteServiceProviderRequest {
            provider_name: "p1".to_string(),
        })
        .await
        .unwrap();
    assert!(engine.deleted_models().is_empty());
    assert!(pointers(&registry, "embed").0.is_empty());
    assert_eq!(model_status(&registry, "p1", "bge-m3"), None);

    registry
        .delete_service_provider(DeleteServiceProviderRequest {
            provider_name: "p2".to_string(),
        })
        .await
        .unwrap();
    assert_eq!(engine.deleted_models(), vec!["bge-m3"]);
}

#[tokio::test]
async fn test_duplicate_provider_conflicts() {
    let engine = FakeEngine::running().with_models(&["bge-m3"]);
    let (registry, _) = registry_with(engine).await;

    registry.create_service_provider(local_embed_provider("p1")).await.unwrap();
    let err = registry
        .create_service_provider(local_embed_provider("p1"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ProviderAlreadyExists(_)));
    assert_eq!(err.code().business_code, 10009);
}

#[tokio::test]
async fn test_remote_provider_keeps_only_verified_models() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(body_partial_json(json!({"model": "gpt-retired"})))
        .respond_with(ResponseTemplate::new(404))
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(header("Authorization", "Bearer sk-test"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let (registry, _) = registry_with(FakeEngine::running()).await;
    registry
        .create_service_provider(CreateServiceProviderRequest {
            service_name: "chat".to_string(),
            service_source: "remote".to_string(),
            api_flavor: "openai".to_string(),
            provider_name: "remote_openai_chat".to_string(),
            url: format!("{}/v1/chat/completions", server.uri()),
            auth_type: "apikey".to_string(),
            auth_key: "sk-test".to_string(),
            models: vec!["gpt-4o-mini".to_string(), "gpt-retired".to_string()],
            ..Default::default()
        })
        .await
        .unwrap();

    assert_eq!(provider(&registry, "remote_openai_chat").status, PROVIDER_ACTIVE);
    assert_eq!(
        model_status(&registry, "remote_openai_chat", "gpt-4o-mini").as_deref(),
        Some("downloaded")
    );
    assert_eq!(model_status(&registry, "remote_openai_chat", "gpt-retired"), None);
    assert_eq!(pointers(&registry, "chat").1, "remote_openai_chat");
    assert_eq!(pointers(&registry, "generate").1, "remote_openai_generate");

    // re-verifying a dead model records it as failed
    let err = registry
        .update_service_provider(UpdateServiceProviderRequest {
            provider_name: "remote_openai_chat".to_string(),
            models: vec!["gpt-retired".to_string()],
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ProviderUnavailable(_)));
    assert_eq!(
        model_status(&registry, "remote_openai_chat", "gpt-retired").as_deref(),
        Some("failed")
    );
}

#[tokio::test]
async fn test_remote_provider_requires_credentials() {
    let (registry, _) = registry_with(FakeEngine::running()).await;
    let err = registry
        .create_service_provider(CreateServiceProviderRequest {
            service_name: "chat".to_string(),
            service_source: "remote".to_string(),
            api_flavor: "openai".to_string(),
            provider_name: "remote_openai_chat".to_string(),
            auth_type: "apikey".to_string(),
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::AuthInfoMissing(_)));
}

#[tokio::test]
async fn test_import_fails_closed() {
    let (registry, _) = registry_with(FakeEngine::running()).await;

    let err = registry
        .import_services(ServicesPayload {
            version: "9.9.9".to_string(),
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::VersionMismatch { .. }));

    let payload: ServicesPayload = serde_json::from_value(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "services": {"chat": {"service_providers": {"remote": "x"}, "hybrid_policy": "sometimes"}}
    }))
    .unwrap();
    let err = registry.import_services(payload).await.unwrap_err();
    assert!(matches!(err, Error::UnsupportedHybridPolicy(_)));
}

#[tokio::test]
async fn test_unknown_records_are_reported() {
    let (registry, _) = registry_with(FakeEngine::running()).await;

    let err = registry
        .update_service_provider(UpdateServiceProviderRequest {
            provider_name: "ghost".to_string(),
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ProviderNotFound(_)));

    let err = registry
        .install_service(InstallServiceRequest {
            service_name: "speech".to_string(),
            service_source: "local".to_string(),
            api_flavor: "ollama".to_string(),
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::UnsupportedService(_)));
}

#[tokio::test]
async fn test_chat_provider_delete_keeps_model_for_generate_pair() {
    let engine = FakeEngine::running().with_models(&["qwen2:0.5b"]);
    let (registry, engine) = registry_with(engine).await;
    registry
        .install_service(local_install("chat", "qwen2:0.5b"))
        .await
        .unwrap();
    assert_eq!(
        model_status(&registry, "local_ollama_generate", "qwen2:0.5b").as_deref(),
        Some("downloaded")
    );

    registry
        .delete_service_provider(DeleteServiceProviderRequest {
            provider_name: "local_ollama_chat".to_string(),
        })
        .await
        .unwrap();
    assert!(engine.deleted_models().is_empty());
    assert_eq!(
        model_status(&registry, "local_ollama_generate", "qwen2:0.5b").as_deref(),
        Some("downloaded")
    );

    registry
        .delete_service_provider(DeleteServiceProviderRequest {
            provider_name: "local_ollama_generate".to_string(),
        })
        .await
        .unwrap();
    assert_eq!(engine.deleted_models(), vec!["qwen2:0.5b"]);
}

#[tokio::test]
async fn test_failed_remote_model_recovers_on_reverify() {
    let dead = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&dead)
        .await;
    let live = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&live)
        .await;

    let (registry, _) = registry_with(FakeEngine::running()).await;
    registry
        .create_service_provider(CreateServiceProviderRequest {
            service_name: "embed".to_string(),
            service_source: "remote".to_string(),
            api_flavor: "openai".to_string(),
            provider_name: "remote_openai_embed".to_string(),
            url: live.uri(),
            auth_type: "apikey".to_string(),
            auth_key: "sk-test".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();

    let update = |url: String| UpdateServiceProviderRequest {
        provider_name: "remote_openai_embed".to_string(),
        url,
        models: vec!["m".to_string()],
        ..Default::default()
    };

    let err = registry
        .update_service_provider(update(dead.uri()))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ProviderUnavailable(_)));
    assert_eq!(
        model_status(&registry, "remote_openai_embed", "m").as_deref(),
        Some("failed")
    );

    registry
        .update_service_provider(update(live.uri()))
        .await
        .unwrap();
    assert_eq!(
        model_status(&registry, "remote_openai_embed", "m").as_deref(),
        Some("downloaded")
    );
    assert_eq!(provider(&registry, "remote_openai_embed").url, live.uri());
}

#[tokio::test]
async fn test_chat_provider_update_carries_over_to_generate_pair() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let (registry, _) = registry_with(FakeEngine::running()).await;
    registry
        .create_service_provider(CreateServiceProviderRequest {
            service_name: "chat".to_string(),
            service_source: "remote".to_string(),
            api_flavor: "openai".to_string(),
            provider_name: "remote_openai_chat".to_string(),
            url: format!("{}/v1/chat/completions", server.uri()),
            auth_type: "apikey".to_string(),
            auth_key: "sk-old".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(provider(&registry, "remote_openai_generate").auth_key, "sk-old");

    registry
        .update_service_provider(UpdateServiceProviderRequest {
            provider_name: "remote_openai_chat".to_string(),
            auth_key: "sk-new".to_string(),
            desc: "team chat".to_string(),
            extra_headers: r#"{"X-Team":"a"}"#.to_string(),
            ..Default::default()
        })
        .await
        .unwrap();

    let generate = provider(&registry, "remote_openai_generate");
    assert_eq!(generate.auth_key, "sk-new");
    assert_eq!(generate.desc, "team generate");
    assert_eq!(generate.extra_headers, r#"{"X-Team":"a"}"#);
    assert_eq!(generate.flavor, "openai");
    // the generate endpoint is its own
    assert_ne!(generate.url, provider(&registry, "remote_openai_chat").url);
}

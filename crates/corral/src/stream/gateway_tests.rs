// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use crate::backend::BackendKind;

use super::*;

#[tokio::test]
async fn opencode_always_routes_to_its_cli() {
    let gateway = StreamingGateway::new(Some("http://127.0.0.1:9999/v1".to_owned()), None);
    let route = gateway.resolve_route(BackendKind::Opencode, None).await;
    assert_eq!(route, StreamRoute::OpencodeCli);
}

#[tokio::test]
async fn explicit_proxy_base_wins() {
    let gateway = StreamingGateway::new(
        Some("http://127.0.0.1:9999/v1".to_owned()),
        Some("key-1".to_owned()),
    );
    let route = gateway.resolve_route(BackendKind::Codex, None).await;
    assert_eq!(
        route,
        StreamRoute::Proxy {
            base_url: "http://127.0.0.1:9999/v1".to_owned(),
            api_key: Some("key-1".to_owned()),
        }
    );
}

#[tokio::test]
async fn codex_without_proxy_is_unavailable() {
    let gateway = StreamingGateway::new(None, None);
    // No local proxy is listening on the conventional port in tests.
    let route = gateway.resolve_route(BackendKind::Codex, None).await;
    assert!(matches!(route, StreamRoute::Unavailable { .. }), "got {route:?}");
}

#[tokio::test]
async fn claude_without_proxy_or_key_falls_back_to_cli() {
    let gateway = StreamingGateway::new(None, None);
    std::env::remove_var("ANTHROPIC_API_KEY");
    let route = gateway.resolve_route(BackendKind::Claude, None).await;
    assert_eq!(route, StreamRoute::ClaudeCli);
}

#[test]
fn default_models_cover_every_backend() {
    for backend in [
        BackendKind::Claude,
        BackendKind::Codex,
        BackendKind::Gemini,
        BackendKind::Opencode,
    ] {
        assert!(!default_model(backend).is_empty());
    }
}

#[tokio::test]
async fn unavailable_route_streams_single_error_chunk() {
    let gateway = StreamingGateway::new(None, None);
    let mut rx = gateway
        .stream_text(
            vec![ChatMessage::new("user", "hi")],
            BackendKind::Gemini,
            None,
            None,
        )
        .await;
    let chunk = rx.recv().await.unwrap_or_default();
    assert!(chunk.contains("[Error:"), "got: {chunk}");
    assert!(rx.recv().await.is_none());
}

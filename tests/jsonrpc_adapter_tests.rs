//! JSON-RPC adapter against a mocked backend.

use std::collections::HashMap;
use std::time::Duration;

use serde_json::json;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use odoo_mcp::rpc::{JsonRpcAdapter, RpcError, TlsOptions, WireAdapter};

fn adapter(uri: &str) -> JsonRpcAdapter {
    JsonRpcAdapter::new(uri, Duration::from_secs(5), &TlsOptions::default()).unwrap()
}

#[tokio::test]
async fn authenticate_returns_uid() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/web/session/authenticate"))
        .and(body_partial_json(json!({
            "jsonrpc": "2.0",
            "method": "call",
            "params": {"db": "prod", "login": "svc", "password": "secret"},
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "jsonrpc": "2.0",
            "id": 1,
            "result": {"uid": 7, "server_version": "17.0"},
        })))
        .mount(&server)
        .await;

    let uid = adapter(&server.uri())
        .authenticate("prod", "svc", "secret")
        .await
        .unwrap();
    assert_eq!(uid, 7);
}

#[tokio::test]
async fn false_uid_is_rejected_credentials() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/web/session/authenticate"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "jsonrpc": "2.0",
            "id": 1,
            "result": {"uid": false},
        })))
        .mount(&server)
        .await;

    let err = adapter(&server.uri())
        .authenticate("prod", "svc", "wrong")
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::AuthenticationFailed(_)));
}

#[tokio::test]
async fn execute_posts_call_kw_envelope() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/web/dataset/call_kw/res.partner/search_read"))
        .and(body_partial_json(json!({
            "method": "call",
            "params": {
                "model": "res.partner",
                "method": "search_read",
                "args": [[["name", "ilike", "acme"]]],
            },
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "jsonrpc": "2.0",
            "id": 2,
            "result": [{"id": 1, "name": "Acme Corp"}],
        })))
        .mount(&server)
        .await;

    let result = adapter(&server.uri())
        .execute(
            "res.partner",
            "search_read",
            vec![json!([["name", "ilike", "acme"]])],
            HashMap::new(),
            None,
        )
        .await
        .unwrap();
    assert_eq!(result[0]["name"], "Acme Corp");
}

#[tokio::test]
async fn per_call_context_overlays_base() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/web/dataset/call_kw/res.partner/read"))
        .and(body_partial_json(json!({
            "params": {"kwargs": {"context": {"lang": "en_US", "tz": "Europe/Berlin"}}},
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "jsonrpc": "2.0",
            "id": 3,
            "result": [],
        })))
        .expect(1)
        .mount(&server)
        .await;

    let mut base = odoo_mcp::rpc::Context::new();
    base.insert("lang".to_string(), json!("en_US"));
    base.insert("tz".to_string(), json!("UTC"));
    let adapter = JsonRpcAdapter::new(server.uri(), Duration::from_secs(5), &TlsOptions::default())
        .unwrap()
        .with_base_context(base);

    let mut call = odoo_mcp::rpc::Context::new();
    call.insert("tz".to_string(), json!("Europe/Berlin"));
    adapter
        .execute("res.partner", "read", vec![json!([1])], HashMap::new(), Some(&call))
        .await
        .unwrap();
}

#[tokio::test]
async fn backend_fault_carries_structured_fields() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/web/dataset/call_kw/sale.order/create"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "jsonrpc": "2.0",
            "id": 4,
            "error": {
                "code": 200,
                "message": "Odoo Server Error",
                "data": {
                    "name": "odoo.exceptions.ValidationError",
                    "message": "The following fields are required: Customer (partner_id)",
                    "debug": "Traceback (most recent call last):\n...",
                },
            },
        })))
        .mount(&server)
        .await;

    let err = adapter(&server.uri())
        .execute("sale.order", "create", vec![json!({})], HashMap::new(), None)
        .await
        .unwrap_err();
    match err {
        RpcError::Fault(fault) => {
            assert_eq!(
                fault.error_class.as_deref(),
                Some("odoo.exceptions.ValidationError")
            );
            assert!(fault.message.contains("partner_id"));
            assert_eq!(fault.model.as_deref(), Some("sale.order"));
            assert_eq!(fault.method.as_deref(), Some("create"));
            assert!(fault.traceback.is_some());
        }
        other => panic!("expected fault, got {:?}", other),
    }
}

#[tokio::test]
async fn error_code_100_signals_session_expiry() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/web/dataset/call_kw/res.partner/read"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "jsonrpc": "2.0",
            "id": 5,
            "error": {"code": 100, "message": "Odoo Session Expired"},
        })))
        .mount(&server)
        .await;

    let err = adapter(&server.uri())
        .execute("res.partner", "read", vec![json!([1])], HashMap::new(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::SessionExpired));
}

#[tokio::test]
async fn http_401_signals_session_expiry() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/web/dataset/call_kw/res.partner/read"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;

    let err = adapter(&server.uri())
        .execute("res.partner", "read", vec![json!([1])], HashMap::new(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::SessionExpired));
}

//! Modern-REST adapter against a mocked backend.

use std::collections::HashMap;
use std::time::Duration;

use serde_json::json;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use odoo_mcp::rpc::{RestAdapter, RpcError, TlsOptions, WireAdapter};

fn adapter(uri: &str) -> RestAdapter {
    RestAdapter::new(uri, Duration::from_secs(5), &TlsOptions::default()).unwrap()
}

#[tokio::test]
async fn authenticate_stores_key_and_resolves_uid() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/json/2/res.users/search_read"))
        .and(header("authorization", "Bearer key-123"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "result": [{"id": 9}],
        })))
        .mount(&server)
        .await;

    let uid = adapter(&server.uri())
        .authenticate("prod", "svc", "key-123")
        .await
        .unwrap();
    assert_eq!(uid, 9);
}

#[tokio::test]
async fn execute_spreads_kwargs_into_body() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/json/2/res.partner/search_read"))
        .and(body_partial_json(json!({
            "args": [[["name", "ilike", "acme"]]],
            "fields": ["name"],
            "limit": 5,
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "result": [{"id": 1, "name": "Acme Corp"}],
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/json/2/res.users/search_read"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"result": [{"id": 2}]})))
        .mount(&server)
        .await;

    let adapter = adapter(&server.uri());
    adapter.authenticate("prod", "svc", "key").await.unwrap();

    let mut kwargs = HashMap::new();
    kwargs.insert("fields".to_string(), json!(["name"]));
    kwargs.insert("limit".to_string(), json!(5));
    let result = adapter
        .execute(
            "res.partner",
            "search_read",
            vec![json!([["name", "ilike", "acme"]])],
            kwargs,
            None,
        )
        .await
        .unwrap();
    assert_eq!(result[0]["id"], 1);
}

#[tokio::test]
async fn http_401_is_rejected_key() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;

    let err = adapter(&server.uri())
        .authenticate("prod", "svc", "bad-key")
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::AuthenticationFailed(_)));
}

#[tokio::test]
async fn error_envelope_becomes_fault() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/json/2/account.move/unlink"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "error": {
                "name": "odoo.exceptions.UserError",
                "message": "You cannot delete a posted journal entry",
            },
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/json/2/res.users/search_read"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"result": [{"id": 2}]})))
        .mount(&server)
        .await;

    let adapter = adapter(&server.uri());
    adapter.authenticate("prod", "svc", "key").await.unwrap();
    let err = adapter
        .execute("account.move", "unlink", vec![json!([42])], HashMap::new(), None)
        .await
        .unwrap_err();
    match err {
        RpcError::Fault(fault) => {
            assert_eq!(fault.error_class.as_deref(), Some("odoo.exceptions.UserError"));
            assert_eq!(fault.model.as_deref(), Some("account.move"));
        }
        other => panic!("expected fault, got {:?}", other),
    }
}

#[tokio::test]
async fn close_drops_the_key() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/json/2/res.users/search_read"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"result": [{"id": 2}]})))
        .mount(&server)
        .await;

    let adapter = adapter(&server.uri());
    adapter.authenticate("prod", "svc", "key").await.unwrap();
    adapter.close().await;
    let err = adapter
        .execute("res.partner", "read", vec![json!([1])], HashMap::new(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::AuthenticationFailed(_)));
}

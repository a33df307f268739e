mod common;

use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use common::{mint_for, read_json, test_app};
use eztrip_api::store::{DirectoryStore, PolicyStore};
use eztrip_authz::{ROLE_ADMIN, RoleAssignment};
use serde_json::json;
use tower::ServiceExt;

fn get(uri: &str, token: Option<&str>) -> Request<Body> {
    let mut builder = Request::get(uri);
    if let Some(token) = token {
        builder = builder.header("authorization", format!("Bearer {token}"));
    }
    builder.body(Body::empty()).expect("request")
}

fn send_json(method: Method, uri: &str, token: &str, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("authorization", format!("Bearer {token}"))
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .expect("request")
}

#[tokio::test]
async fn anonymous_request_to_guarded_route_is_unauthorized() {
    let app = test_app().await;
    let response = app.router.oneshot(get("/v1/users", None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body = read_json(response).await;
    assert_eq!(body["code"], "unauthorized");
    assert_eq!(body["message"], "unauthorized");
}

#[tokio::test]
async fn anonymous_request_to_public_route_succeeds() {
    let app = test_app().await;
    let response = app.router.oneshot(get("/health", None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = read_json(response).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["storage"], "memory");
}

#[tokio::test]
async fn non_bearer_authorization_is_rejected() {
    let app = test_app().await;
    let request = Request::get("/health")
        .header("authorization", "Basic dXNlcjpwYXNz")
        .body(Body::empty())
        .unwrap();
    let response = app.router.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn invalid_token_is_rejected_even_on_public_routes() {
    let app = test_app().await;
    let response = app
        .router
        .oneshot(get("/health", Some("not.a.jwt")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn preflight_bypasses_authentication() {
    let app = test_app().await;
    let request = Request::builder()
        .method(Method::OPTIONS)
        .uri("/v1/users")
        .header("authorization", "Bearer garbage")
        .body(Body::empty())
        .unwrap();
    let response = app.router.oneshot(request).await.unwrap();
    assert_ne!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn first_login_provisions_user_with_default_role() {
    let app = test_app().await;
    let token = mint_for(&app.idp, "auth0|bob");

    let response = app
        .router
        .clone()
        .oneshot(get("/v1/users/me", Some(&token)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let me = read_json(response).await;
    assert_eq!(me["first_name"], "Test");
    assert!(me.get("external_id").is_none());

    let principal = app
        .store
        .find_by_external_id("auth0|bob")
        .await
        .unwrap()
        .expect("provisioned");
    assert_eq!(me["id"], principal.id.to_string());
    assert_eq!(
        app.store.roles_for_principal(&principal.policy_id()).await.unwrap(),
        vec!["user".to_string()]
    );
}

#[tokio::test]
async fn user_may_read_but_not_delete() {
    let app = test_app().await;
    let token = mint_for(&app.idp, "auth0|bob");

    let response = app
        .router
        .clone()
        .oneshot(get("/v1/users", Some(&token)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let list = read_json(response).await;
    let bob_id = list["items"][0]["id"].as_str().expect("id").to_string();

    let request = Request::delete(format!("/v1/users/{bob_id}"))
        .header("authorization", format!("Bearer {token}"))
        .body(Body::empty())
        .unwrap();
    let response = app.router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let body = read_json(response).await;
    assert_eq!(body["code"], "forbidden");
    assert_eq!(body["message"], "forbidden: insufficient permissions");
}

#[tokio::test]
async fn user_may_update_own_profile() {
    let app = test_app().await;
    let token = mint_for(&app.idp, "auth0|bob");
    let response = app
        .router
        .clone()
        .oneshot(send_json(
            Method::PATCH,
            "/v1/users/me",
            &token,
            json!({ "first_name": "Robert" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(read_json(response).await["first_name"], "Robert");

    let response = app
        .router
        .oneshot(send_json(
            Method::PATCH,
            "/v1/users/me",
            &token,
            json!({ "first_name": "x".repeat(101) }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn admin_may_delete_and_create_users() {
    let app = test_app().await;
    let admin_token = mint_for(&app.idp, "auth0|admin1");
    let bob_token = mint_for(&app.idp, "auth0|bob");

    // Provision both, then promote admin1.
    for token in [&admin_token, &bob_token] {
        let response = app
            .router
            .clone()
            .oneshot(get("/v1/users/me", Some(token)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
    let admin = app
        .store
        .find_by_external_id("auth0|admin1")
        .await
        .unwrap()
        .unwrap();
    let bob = app
        .store
        .find_by_external_id("auth0|bob")
        .await
        .unwrap()
        .unwrap();
    app.state
        .enforcer
        .add_role(RoleAssignment::new(admin.policy_id(), ROLE_ADMIN).unwrap())
        .await
        .unwrap();

    let response = app
        .router
        .clone()
        .oneshot(send_json(
            Method::POST,
            "/v1/users",
            &admin_token,
            json!({ "email": "carol@example.com", "first_name": "Carol", "last_name": "Danvers" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);

    let request = Request::delete(format!("/v1/users/{}?hard=true", bob.id))
        .header("authorization", format!("Bearer {admin_token}"))
        .body(Body::empty())
        .unwrap();
    let response = app.router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert!(
        app.store
            .roles_for_principal(&bob.policy_id())
            .await
            .unwrap()
            .is_empty()
    );

    let response = app
        .router
        .oneshot(get(&format!("/v1/users/{}", bob.id), Some(&admin_token)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn soft_deleted_user_is_not_resurrected() {
    let app = test_app().await;
    let token = mint_for(&app.idp, "auth0|gone");
    let response = app
        .router
        .clone()
        .oneshot(get("/v1/users/me", Some(&token)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let principal = app
        .store
        .find_by_external_id("auth0|gone")
        .await
        .unwrap()
        .unwrap();
    app.store.delete_principal(principal.id, false).await.unwrap();

    let response = app
        .router
        .oneshot(get("/v1/users/me", Some(&token)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(app.store.list_principals().await.unwrap().len(), 0);
}

#[tokio::test]
async fn provisioning_disabled_leaves_identity_unset() {
    use eztrip_api::app::{AppState, build_router};
    use eztrip_api::config::IdentityConfig;
    use eztrip_api::store::memory::InMemoryStore;
    use std::sync::Arc;
    use std::time::Duration;

    let app = test_app().await;
    let store = Arc::new(InMemoryStore::new());
    let state = AppState::from_store(
        store.clone(),
        Duration::from_secs(30),
        &IdentityConfig {
            auto_provision: false,
            default_role: None,
        },
        app.state.token_validator.clone(),
    );
    let router = build_router(state);
    let token = mint_for(&app.idp, "auth0|stranger");
    let response = router
        .oneshot(get("/v1/users/me", Some(&token)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert!(store.list_principals().await.unwrap().is_empty());
}

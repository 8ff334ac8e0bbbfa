//! End-to-end CORS behavior through the assembled router.

use axum::body::Body;
use axum::extract::Request;
use axum::http::header::{
    ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS, ACCESS_CONTROL_ALLOW_ORIGIN,
    ACCESS_CONTROL_EXPOSE_HEADERS, ACCESS_CONTROL_MAX_AGE, ACCESS_CONTROL_REQUEST_METHOD, ORIGIN,
    VARY,
};
use axum::http::{Method, StatusCode};
use axum::response::Response;
use axum::routing::get;
use pretty_assertions::assert_eq;
use serde_json::{Value, json};
use tower::ServiceExt;

use harbor_app::{AppError, ApplicationCore, ApplicationOptions};

fn app_with_cors(config: Value) -> ApplicationCore {
    let app = ApplicationCore::new(ApplicationOptions::new());
    app.server()
        .route("/resource", get(|| async { "resource" }))
        .unwrap();
    app.enable_cors(config).unwrap();
    app
}

async fn send(app: &ApplicationCore, request: Request) -> Response {
    app.server().router().oneshot(request).await.unwrap()
}

fn preflight(origin: &str) -> Request {
    Request::builder()
        .method(Method::OPTIONS)
        .uri("/resource")
        .header(ORIGIN, origin)
        .header(ACCESS_CONTROL_REQUEST_METHOD, "PUT")
        .body(Body::empty())
        .unwrap()
}

fn header<'a>(response: &'a Response, name: axum::http::HeaderName) -> Option<&'a str> {
    response
        .headers()
        .get(name)
        .map(|value| value.to_str().unwrap())
}

#[tokio::test]
async fn test_preflight_from_allowed_origin() {
    let app = app_with_cors(json!({
        "origins": ["https://a.com"],
        "allowedHeaders": ["X-Request-Id"],
    }));

    let response = send(&app, preflight("https://a.com")).await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert_eq!(header(&response, ACCESS_CONTROL_ALLOW_ORIGIN), Some("https://a.com"));
    assert_eq!(header(&response, ACCESS_CONTROL_ALLOW_METHODS), Some("PUT"));
    assert_eq!(
        header(&response, ACCESS_CONTROL_ALLOW_HEADERS),
        Some("X-Api-Key, Access-Control-Allow-Origin, Authorization, X-Request-Id")
    );
    assert_eq!(header(&response, ACCESS_CONTROL_MAX_AGE), Some("5"));
    assert_eq!(header(&response, VARY), Some("Origin"));
}

#[tokio::test]
async fn test_preflight_from_other_origin_is_not_answered() {
    let app = app_with_cors(json!({"origins": ["https://a.com"]}));

    let response = send(&app, preflight("https://b.com")).await;
    assert_ne!(response.status(), StatusCode::NO_CONTENT);
    assert_eq!(header(&response, ACCESS_CONTROL_ALLOW_ORIGIN), None);
}

#[tokio::test]
async fn test_preflight_for_unrouted_path() {
    let app = app_with_cors(Value::Null);

    let request = Request::builder()
        .method(Method::OPTIONS)
        .uri("/nowhere")
        .header(ORIGIN, "https://anyone.dev")
        .header(ACCESS_CONTROL_REQUEST_METHOD, "DELETE")
        .body(Body::empty())
        .unwrap();
    let response = send(&app, request).await;

    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert_eq!(header(&response, ACCESS_CONTROL_ALLOW_ORIGIN), Some("*"));
    assert_eq!(header(&response, VARY), None);
}

#[tokio::test]
async fn test_actual_request_is_decorated() {
    let app = app_with_cors(json!({
        "origins": ["https://a.com"],
        "exposedHeaders": ["X-Trace-Id", "X-Rate-Limit"],
    }));

    let request = Request::get("/resource")
        .header(ORIGIN, "https://a.com")
        .body(Body::empty())
        .unwrap();
    let response = send(&app, request).await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(header(&response, ACCESS_CONTROL_ALLOW_ORIGIN), Some("https://a.com"));
    assert_eq!(
        header(&response, ACCESS_CONTROL_EXPOSE_HEADERS),
        Some("X-Trace-Id, X-Rate-Limit")
    );
}

#[tokio::test]
async fn test_same_origin_request_is_untouched() {
    let app = app_with_cors(json!({"origins": ["https://a.com"]}));

    let response = send(&app, Request::get("/resource").body(Body::empty()).unwrap()).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(header(&response, ACCESS_CONTROL_ALLOW_ORIGIN), None);
}

#[test]
fn test_activation_is_recorded() {
    let app = app_with_cors(json!({"origins": ["https://a.com"]}));

    assert_eq!(
        app.get("extension-cors"),
        Some(json!({
            "origins": ["https://a.com"],
            "allowedHeaders": ["X-Api-Key", "Access-Control-Allow-Origin", "Authorization"],
            "exposedHeaders": [],
            "preflightMaxAge": 5,
        }))
    );
}

#[test]
fn test_misconfiguration_surfaces() {
    let app = ApplicationCore::new(ApplicationOptions::new());
    let err = app
        .enable_cors(json!({"exposedHeaders": "X-Trace-Id"}))
        .unwrap_err();
    assert!(matches!(err, AppError::MisconfiguredExtension { name: "cors", .. }));
}

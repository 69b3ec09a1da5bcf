mod support;

use std::sync::Arc;

use axum::{
    Router,
    body::Body,
    http::{Method, Request, StatusCode, header},
};
use http_body_util::BodyExt;
use serde_json::Value;
use texrender::infra::http::{AppState, build_router};
use tower::ServiceExt;

use support::{API_KEY, BROKEN_DOC, FakeCompiler, HELLO_DOC};

const BOUNDARY: &str = "texrender-test-boundary";

fn app(scratch: &std::path::Path, runner: Arc<FakeCompiler>) -> Router {
    let pipeline = support::pipeline(scratch, runner);
    build_router(AppState::new(Arc::new(pipeline), API_KEY, 1024 * 1024))
}

fn raw_request(uri: &str, auth: Option<&str>, body: &str) -> Request<Body> {
    let mut builder = Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header(header::CONTENT_TYPE, "text/plain");
    if let Some(auth) = auth {
        builder = builder.header(header::AUTHORIZATION, auth);
    }
    builder
        .body(Body::from(body.to_string()))
        .expect("request should build")
}

fn multipart_request(uri: &str, fields: &[(&str, &str)]) -> Request<Body> {
    let mut body = String::new();
    for (name, value) in fields {
        body.push_str(&format!(
            "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n"
        ));
    }
    body.push_str(&format!("--{BOUNDARY}--\r\n"));

    Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={BOUNDARY}"),
        )
        .header(header::AUTHORIZATION, format!("Bearer {API_KEY}"))
        .body(Body::from(body))
        .expect("request should build")
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Option<String>, Vec<u8>) {
    let response = app
        .clone()
        .oneshot(request)
        .await
        .expect("router should respond");
    let status = response.status();
    let content_type = response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned);
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("body should collect")
        .to_bytes()
        .to_vec();
    (status, content_type, bytes)
}

fn json(bytes: &[u8]) -> Value {
    serde_json::from_slice(bytes).expect("json body")
}

#[tokio::test]
async fn healthz_needs_no_credentials() {
    let (_root, scratch) = support::scratch_dir();
    let app = app(&scratch, FakeCompiler::new());

    let request = Request::builder()
        .uri("/healthz")
        .body(Body::empty())
        .expect("request should build");
    let (status, _, _) = send(&app, request).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn authorization_failures_are_distinguished() {
    let (_root, scratch) = support::scratch_dir();
    let runner = FakeCompiler::new();
    let app = app(&scratch, runner.clone());

    let cases = [
        (None, "missing Authorization header"),
        (Some("Token test123"), "invalid Authorization format"),
        (Some("Bearer wrong"), "invalid API key"),
    ];
    for (auth, expected) in cases {
        let (status, _, body) = send(&app, raw_request("/render", auth, HELLO_DOC)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(json(&body)["error"], expected);
    }
    assert_eq!(runner.calls(), 0);
}

#[tokio::test]
async fn raw_body_renders_html_fragment_with_stylesheet() {
    let (_root, scratch) = support::scratch_dir();
    let app = app(&scratch, FakeCompiler::new());

    let (status, content_type, body) = send(
        &app,
        raw_request("/render", Some("Bearer test123"), HELLO_DOC),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(content_type.as_deref(), Some("text/html; charset=utf-8"));
    let text = String::from_utf8(body).expect("utf-8");
    assert!(text.starts_with("<style>\n"));
    assert!(text.contains("</style>\n<div class=\"ltx_page_main\">"));
    assert!(text.contains("Hi"));
    assert!(support::scratch_entries(&scratch).is_empty());
}

#[tokio::test]
async fn empty_raw_body_is_rejected() {
    let (_root, scratch) = support::scratch_dir();
    let runner = FakeCompiler::new();
    let app = app(&scratch, runner.clone());

    let (status, _, body) = send(&app, raw_request("/render", Some("Bearer test123"), "")).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json(&body)["error"], "empty body");
    assert_eq!(runner.calls(), 0);
}

#[tokio::test]
async fn multipart_without_content_is_rejected() {
    let (_root, scratch) = support::scratch_dir();
    let runner = FakeCompiler::new();
    let app = app(&scratch, runner.clone());

    let (status, _, body) = send(&app, multipart_request("/render/pdf", &[("images", "")])).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json(&body)["error"], "content is required");
    assert_eq!(runner.calls(), 0);
}

#[tokio::test]
async fn malformed_images_json_is_rejected() {
    let (_root, scratch) = support::scratch_dir();
    let app = app(&scratch, FakeCompiler::new());

    let (status, _, body) = send(
        &app,
        multipart_request("/render", &[("content", HELLO_DOC), ("images", "{not json")]),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json(&body)["error"], "invalid images json");
}

#[tokio::test]
async fn multipart_pdf_downloads_assets_into_workspace() {
    let (_root, scratch) = support::scratch_dir();
    let runner = FakeCompiler::new();
    let app = app(&scratch, runner.clone());
    let base = support::spawn_asset_server().await;
    let images = format!(r#"{{"../figure.png":{{"url":"{base}/figure.png"}}}}"#);

    let (status, content_type, body) = send(
        &app,
        multipart_request(
            "/render/pdf",
            &[("content", HELLO_DOC), ("images", images.as_str())],
        ),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(content_type.as_deref(), Some("application/pdf"));
    assert!(body.starts_with(b"%PDF-"));
    assert!(
        runner.last_listing().contains(&"figure.png".to_string()),
        "{:?}",
        runner.last_listing()
    );
    assert!(support::scratch_entries(&scratch).is_empty());
}

#[tokio::test]
async fn failed_asset_download_names_the_asset() {
    let (_root, scratch) = support::scratch_dir();
    let runner = FakeCompiler::new();
    let app = app(&scratch, runner.clone());
    let base = support::spawn_asset_server().await;
    let images = format!(r#"{{"missing.png":{{"url":"{base}/missing.png"}}}}"#);

    let (status, _, body) = send(
        &app,
        multipart_request(
            "/render",
            &[("content", HELLO_DOC), ("images", images.as_str())],
        ),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    let body = json(&body);
    assert_eq!(body["error"], "asset fetch failed");
    assert!(
        body["detail"]
            .as_str()
            .is_some_and(|detail| detail.contains("missing.png"))
    );
    assert_eq!(runner.calls(), 0);
    assert!(support::scratch_entries(&scratch).is_empty());
}

#[tokio::test]
async fn compilation_errors_return_marker_lines() {
    let (_root, scratch) = support::scratch_dir();
    let app = app(&scratch, FakeCompiler::new());

    let (status, _, body) = send(
        &app,
        raw_request("/render/pdf", Some("Bearer test123"), BROKEN_DOC),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    let body = json(&body);
    assert_eq!(body["error"], "pdf render failed");
    let detail = body["detail"].as_str().expect("detail present");
    assert!(detail.starts_with("! LaTeX Error"));
    assert!(!detail.contains("This is pdfTeX"));
    assert!(support::scratch_entries(&scratch).is_empty());
}

#[tokio::test]
async fn missing_output_is_an_internal_error_without_detail() {
    let (_root, scratch) = support::scratch_dir();
    let app = app(&scratch, FakeCompiler::without_output());

    let (status, _, body) = send(
        &app,
        raw_request("/render", Some("Bearer test123"), HELLO_DOC),
    )
    .await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    let body = json(&body);
    assert_eq!(body["error"], "cannot read output");
    assert!(body.get("detail").is_none());
    assert!(support::scratch_entries(&scratch).is_empty());
}

#[tokio::test]
async fn oversized_body_is_rejected() {
    let (_root, scratch) = support::scratch_dir();
    let runner = FakeCompiler::new();
    let pipeline = support::pipeline(&scratch, runner.clone());
    let app = build_router(AppState::new(Arc::new(pipeline), API_KEY, 64));

    let source = "x".repeat(1024);
    let (status, _, _) = send(
        &app,
        raw_request("/render", Some("Bearer test123"), &source),
    )
    .await;

    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(runner.calls(), 0);
}

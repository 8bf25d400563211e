use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode, header};
use foodvision::analysis::{Analyzer, AnalyzerSettings};
use foodvision::config::StorageDir;
use foodvision::escalate::{
    Description, EscalationError, EscalationPolicy, EscalationRequest, Escalator,
};
use foodvision::matcher::Matcher;
use foodvision::model::{FeatureModel, ModelManifest};
use foodvision::server::{AppState, create_app};
use foodvision::storage::StorageManager;
use image::{ImageFormat, Rgb, RgbImage};
use rstest::*;
use serde_json::Value;
use tempfile::TempDir;
use tower::ServiceExt;

const TOKEN: &str = "secret";
const BOUNDARY: &str = "foodvision-test-boundary";

struct FailingEscalator;

#[async_trait]
impl Escalator for FailingEscalator {
    async fn describe(&self, _: &EscalationRequest) -> Result<Description, EscalationError> {
        Err(EscalationError::Status { status: 500, body: "overloaded".to_string() })
    }

    fn model_name(&self) -> &str {
        "failing"
    }
}

struct TestApp {
    dir: TempDir,
    app: Router,
}

impl TestApp {
    fn new(escalator: Option<Arc<dyn Escalator>>, always: bool, report_failure: bool) -> Self {
        let dir = TempDir::new().unwrap();
        let layout = StorageDir::new(dir.path().join("storage"), dir.path().join("models"));
        let storage = Arc::new(StorageManager::open(&layout, Duration::from_secs(60)).unwrap());

        let manifest_path = layout.model_manifest("food");
        ModelManifest::new("food").write(&manifest_path).unwrap();
        let model = Arc::new(FeatureModel::load(&manifest_path).unwrap());
        let matcher = Arc::new(Matcher::new(model.version()));

        let analyzer = Analyzer {
            model,
            matcher,
            storage,
            escalator,
            policy: EscalationPolicy { confidence_threshold: 0.5, always },
            settings: AnalyzerSettings {
                threshold: 0.85,
                top_k: 3,
                inference_deadline: Duration::from_secs(5),
                assessment_weight: 0.25,
                max_upload_bytes: 1024 * 1024,
            },
        };
        let state = AppState::new(analyzer, TOKEN.to_string(), false, report_failure);
        let app = create_app(state, &["*".to_string()]);
        Self { dir, app }
    }

    fn temp_files(&self) -> usize {
        std::fs::read_dir(self.dir.path().join("storage/temp")).unwrap().count()
    }

    async fn send(&self, request: Request<Body>) -> (StatusCode, Value) {
        let response = self.app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json = serde_json::from_slice(&body).unwrap_or(Value::Null);
        (status, json)
    }

    async fn get(&self, uri: &str) -> (StatusCode, Value) {
        self.send(Request::get(uri).body(Body::empty()).unwrap()).await
    }

    async fn post_form(&self, uri: &str, parts: &[Part<'_>], token: Option<&str>) -> (StatusCode, Value) {
        let mut request = Request::post(uri)
            .header(header::CONTENT_TYPE, format!("multipart/form-data; boundary={BOUNDARY}"));
        if let Some(token) = token {
            request = request.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        self.send(request.body(Body::from(multipart(parts))).unwrap()).await
    }
}

#[fixture]
fn app() -> TestApp {
    TestApp::new(None, false, false)
}

enum Part<'a> {
    File { name: &'a str, file_name: &'a str, content_type: &'a str, data: Vec<u8> },
    Text { name: &'a str, value: &'a str },
}

fn multipart(parts: &[Part]) -> Vec<u8> {
    let mut body = vec![];
    for part in parts {
        body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
        match part {
            Part::File { name, file_name, content_type, data } => {
                body.extend_from_slice(
                    format!(
                        "Content-Disposition: form-data; name=\"{name}\"; filename=\"{file_name}\"\r\nContent-Type: {content_type}\r\n\r\n"
                    )
                    .as_bytes(),
                );
                body.extend_from_slice(data);
            }
            Part::Text { name, value } => {
                body.extend_from_slice(
                    format!("Content-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}").as_bytes(),
                );
            }
        }
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
    body
}

fn solid_png(color: [u8; 3]) -> Vec<u8> {
    let mut buf = Cursor::new(vec![]);
    RgbImage::from_pixel(16, 16, Rgb(color)).write_to(&mut buf, ImageFormat::Png).unwrap();
    buf.into_inner()
}

fn png_file(color: [u8; 3]) -> Part<'static> {
    Part::File { name: "file", file_name: "dish.png", content_type: "image/png", data: solid_png(color) }
}

#[rstest]
#[tokio::test]
async fn classify_without_references_is_no_match(app: TestApp) {
    let (status, body) = app.post_form("/classify", &[png_file([255, 0, 0])], None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["decision"], "no_match");
    assert_eq!(body["escalation"]["status"], "skipped");
    assert_eq!(body["escalation_failed"], false);
    assert_eq!(body["score"]["quality_label"], "Poor");
    assert_eq!(app.temp_files(), 0);
}

#[rstest]
#[case::unsupported(
    Part::File { name: "file", file_name: "notes.txt", content_type: "text/plain", data: b"hello".to_vec() },
    StatusCode::UNSUPPORTED_MEDIA_TYPE
)]
#[case::corrupt(
    Part::File { name: "file", file_name: "dish.png", content_type: "image/png", data: b"not a png".to_vec() },
    StatusCode::UNPROCESSABLE_ENTITY
)]
#[case::empty(
    Part::File { name: "file", file_name: "dish.png", content_type: "image/png", data: vec![] },
    StatusCode::BAD_REQUEST
)]
#[case::too_large(
    Part::File { name: "file", file_name: "dish.png", content_type: "image/png", data: vec![0; 1024 * 1024 + 1] },
    StatusCode::PAYLOAD_TOO_LARGE
)]
#[tokio::test]
async fn classify_rejects_invalid_uploads(app: TestApp, #[case] part: Part<'static>, #[case] expected: StatusCode) {
    let (status, body) = app.post_form("/classify", &[part], None).await;
    assert_eq!(status, expected);
    assert!(body["error"].is_string());
    assert_eq!(app.temp_files(), 0);
}

#[rstest]
#[tokio::test]
async fn classify_rejects_bad_threshold(app: TestApp) {
    let parts = [png_file([0, 0, 255]), Part::Text { name: "threshold", value: "5" }];
    let (status, body) = app.post_form("/classify", &parts, None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "validation");
}

#[rstest]
#[tokio::test]
async fn classify_requires_file(app: TestApp) {
    let parts = [Part::Text { name: "rich", value: "true" }];
    let (status, _) = app.post_form("/classify", &parts, None).await;
    assert!(status.is_client_error());
}

#[rstest]
#[tokio::test]
async fn mutating_routes_require_token(app: TestApp) {
    let parts = [png_file([255, 0, 0]), Part::Text { name: "label", value: "番茄炒蛋" }];
    let (status, body) = app.post_form("/references", &parts, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "unauthorized");

    let (status, _) = app.post_form("/references", &parts, Some("wrong")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let request = Request::post("/reload").body(Body::empty()).unwrap();
    let (status, _) = app.send(request).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[rstest]
#[tokio::test]
async fn add_reference_then_match(app: TestApp) {
    let (status, _) = app.get("/ready").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

    let parts = [
        png_file([255, 0, 0]),
        Part::Text { name: "label", value: "番茄炒蛋" },
        Part::Text { name: "ingredients", value: "tomato, egg" },
    ];
    let (status, body) = app.post_form("/references", &parts, Some(TOKEN)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["added"].as_array().unwrap().len(), 1);
    assert_eq!(body["index"]["indexed"], 1);

    let (status, body) = app.get("/ready").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ready"], true);

    let (status, body) = app.post_form("/classify", &[png_file([255, 0, 0])], None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["decision"], "matched");
    assert_eq!(body["label"], "番茄炒蛋");
    assert_eq!(body["matched_reference"]["ingredients"][1], "egg");
    assert!(body["similarity"].as_f64().unwrap() > 0.99);
    assert_eq!(app.temp_files(), 0);

    let (status, body) = app.get("/references").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["references"][0]["label"], "番茄炒蛋");
    assert_eq!(body["references"][0]["stale"], false);

    // 相同内容再次添加
    let (status, body) = app.post_form("/references", &parts, Some(TOKEN)).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "duplicate_reference");
}

#[rstest]
#[tokio::test]
async fn add_reference_is_all_or_nothing(app: TestApp) {
    let parts = [
        png_file([255, 0, 0]),
        Part::File { name: "file", file_name: "broken.png", content_type: "image/png", data: b"xx".to_vec() },
        Part::Text { name: "label", value: "soup" },
    ];
    let (status, body) = app.post_form("/references", &parts, Some(TOKEN)).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["error"], "invalid_image");

    // 第一张合法图片也不应该被保存
    let (status, body) = app.get("/references").await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["references"].as_array().unwrap().is_empty());
    let references = std::fs::read_dir(app.dir.path().join("storage/references")).unwrap().count();
    assert_eq!(references, 0);

    let (status, _) = app.get("/ready").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
}

#[rstest]
#[tokio::test]
async fn delete_reference(app: TestApp) {
    let parts = [png_file([0, 255, 0]), Part::Text { name: "label", value: "salad" }];
    let (_, body) = app.post_form("/references", &parts, Some(TOKEN)).await;
    let id = body["added"][0]["id"].as_str().unwrap().to_string();

    let delete = |id: &str| {
        Request::delete(format!("/references/{id}"))
            .header(header::AUTHORIZATION, format!("Bearer {TOKEN}"))
            .body(Body::empty())
            .unwrap()
    };
    let (status, body) = app.send(delete(&id)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["deleted"]["id"], id.as_str());
    assert_eq!(body["index"]["indexed"], 0);

    let (status, body) = app.send(delete(&id)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "not_found");
}

impl TestApp {
    async fn add(&self, color: [u8; 3], label: &str) {
        let parts = [png_file(color), Part::Text { name: "label", value: label }];
        let (status, _) = self.post_form("/references", &parts, Some(TOKEN)).await;
        assert_eq!(status, StatusCode::OK);
    }

    fn authorized(request: axum::http::request::Builder) -> axum::http::request::Builder {
        request.header(header::AUTHORIZATION, format!("Bearer {TOKEN}"))
    }
}

#[rstest]
#[tokio::test]
async fn classify_within_label(app: TestApp) {
    app.add([20, 160, 40], "salad").await;
    app.add([200, 40, 30], "soup").await;

    let parts = [png_file([20, 160, 40]), Part::Text { name: "label", value: "soup" }];
    let (status, body) = app.post_form("/classify", &parts, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["decision"], "no_match");
    let candidates = body["candidates"].as_array().unwrap();
    assert_eq!(candidates.len(), 1);
    assert_eq!(candidates[0]["label"], "soup");
    assert!(body["score"]["color_score"].is_number());
    assert!(body["score"]["structure_score"].is_number());

    let parts = [png_file([20, 160, 40]), Part::Text { name: "label", value: "pizza" }];
    let (status, body) = app.post_form("/classify", &parts, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "not_found");
    assert_eq!(app.temp_files(), 0);
}

#[rstest]
#[tokio::test]
async fn delete_label(app: TestApp) {
    app.add([200, 40, 30], "soup").await;
    app.add([210, 50, 20], "soup").await;
    app.add([20, 160, 40], "salad").await;

    let request = || TestApp::authorized(Request::delete("/labels/soup")).body(Body::empty()).unwrap();
    let (status, body) = app.send(request()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["label"], "soup");
    assert_eq!(body["references"].as_array().unwrap().len(), 2);
    assert_eq!(body["index"]["indexed"], 1);
    assert_eq!(body["index"]["labels"], 1);

    let (status, body) = app.send(request()).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "not_found");

    let unauthorized = Request::delete("/labels/salad").body(Body::empty()).unwrap();
    let (status, _) = app.send(unauthorized).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[rstest]
#[tokio::test]
async fn update_ingredients(app: TestApp) {
    app.add([200, 40, 30], "soup").await;

    let request = |label: &str, body: &str| {
        TestApp::authorized(Request::put(format!("/labels/{label}/ingredients")))
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    };
    let (status, body) = app.send(request("soup", r#"{"ingredients": ["tomato", " basil "]}"#)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["references"][0]["ingredients"][1], "basil");

    // 匹配结果使用新的配料
    let (_, body) = app.post_form("/classify", &[png_file([200, 40, 30])], None).await;
    assert_eq!(body["decision"], "matched");
    assert_eq!(body["matched_reference"]["ingredients"][0], "tomato");

    let (status, _) = app.send(request("pizza", r#"{"ingredients": []}"#)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, body) = app.send(request("soup", "not json")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "validation");
}

#[rstest]
#[tokio::test]
async fn batch_reports_each_file(app: TestApp) {
    let parts = [
        png_file([255, 0, 0]),
        Part::File { name: "file", file_name: "broken.png", content_type: "image/png", data: b"xx".to_vec() },
    ];
    let (status, body) = app.post_form("/classify/batch", &parts, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], 2);
    assert_eq!(body["successful"], 1);
    assert!(body["results"][0]["result"].is_object());
    assert!(body["results"][1]["error"].is_string());
    assert_eq!(app.temp_files(), 0);
}

#[tokio::test]
async fn escalation_failure_is_absorbed() {
    let app = TestApp::new(Some(Arc::new(FailingEscalator)), true, false);
    let (status, body) = app.post_form("/classify", &[png_file([255, 0, 0])], None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["escalation_failed"], true);
    assert_eq!(body["escalation"]["status"], "failed");
    assert_eq!(body["decision"], "no_match");
}

#[tokio::test]
async fn escalation_failure_can_be_reported() {
    let app = TestApp::new(Some(Arc::new(FailingEscalator)), true, true);
    let (status, body) = app.post_form("/classify", &[png_file([255, 0, 0])], None).await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(body["escalation_failed"], true);
    assert_eq!(app.temp_files(), 0);
}

#[rstest]
#[case("/health")]
#[case("/")]
#[case("/api-docs/openapi.json")]
#[tokio::test]
async fn public_json_routes(app: TestApp, #[case] uri: &str) {
    let (status, body) = app.get(uri).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.is_object());
}

#[rstest]
#[case("/docs/")]
#[case("/redoc")]
#[case("/metrics")]
#[tokio::test]
async fn public_pages(app: TestApp, #[case] uri: &str) {
    let response = app.app.clone().oneshot(Request::get(uri).body(Body::empty()).unwrap()).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[rstest]
#[tokio::test]
async fn openapi_lists_routes(app: TestApp) {
    let (_, body) = app.get("/api-docs/openapi.json").await;
    let paths = body["paths"].as_object().unwrap();
    let expected = [
        "/classify",
        "/classify/batch",
        "/references",
        "/references/{id}",
        "/labels/{label}",
        "/labels/{label}/ingredients",
        "/health",
        "/ready",
    ];
    for path in expected {
        assert!(paths.contains_key(path), "missing {path}");
    }
}

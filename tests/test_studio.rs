mod common;

use std::{fs, time::Duration};

use axum::http::StatusCode;
use common::*;
use kuangxuan::{manifest::DataManifest, server::studio};
use serde_json::json;

const LIMIT: usize = 50 * 1024 * 1024;

/// 轮询训练状态直到结束
async fn wait_for_training(router: &axum::Router) -> serde_json::Value {
  for _ in 0..500 {
    let status = send(router, get("/api/train/status")).await.json()["status"].clone();
    if status["state"] != "running" {
      return status;
    }
    tokio::time::sleep(Duration::from_millis(10)).await;
  }
  panic!("training did not finish");
}

fn test_request(png: &[u8]) -> axum::http::Request<axum::body::Body> {
  MultipartBody::new()
    .file("image", "t.png", "image/png", png)
    .into_request("/api/test")
}

async fn add_class(router: &axum::Router, name: &str) -> TestResponse {
  send(
    router,
    json_request("POST", "/api/classes", &json!({ "name": name })),
  )
  .await
}

#[tokio::test]
async fn test_class_registry_routes() {
  let app = TestApp::new();
  let router = studio::router(app.state.clone(), LIMIT);

  let res = add_class(&router, " person ").await;
  assert_eq!(res.status, StatusCode::OK);
  assert_eq!(res.json()["classes"], json!(["person"]));

  let res = add_class(&router, "狗").await;
  assert_eq!(res.json()["id"], 1);

  let res = add_class(&router, "person").await;
  assert_eq!(res.status, StatusCode::BAD_REQUEST);
  assert_eq!(res.json()["success"], false);

  let res = send(
    &router,
    json_request("PUT", "/api/classes/1", &json!({ "name": "dog" })),
  )
  .await;
  assert_eq!(res.status, StatusCode::OK);
  assert_eq!(res.json()["classes"], json!(["person", "dog"]));

  let res = send(
    &router,
    json_request("PUT", "/api/classes/9", &json!({ "name": "cat" })),
  )
  .await;
  assert_eq!(res.status, StatusCode::NOT_FOUND);

  let res = send(&router, get("/api/classes")).await;
  assert_eq!(res.json()["classes"], json!(["person", "dog"]));

  let saved = fs::read_to_string(app.root().join("classes.json")).unwrap();
  let saved: Vec<String> = serde_json::from_str(&saved).unwrap();
  assert_eq!(saved, ["person", "dog"]);
}

#[tokio::test]
async fn test_save_annotation_writes_image_and_label() {
  let app = TestApp::new();
  let router = studio::router(app.state.clone(), LIMIT);
  add_class(&router, "cat").await;

  // 400x300 的图片显示在 200x150 的画布上
  let request = MultipartBody::new()
    .file("image", "my cat.png", "image/png", &png_bytes(400, 300))
    .text("dataset_type", "train")
    .text(
      "annotations",
      r#"[{"classId": 0, "x": 0, "y": 0, "width": 200, "height": 150},
          {"classId": 0, "x": 150, "y": 100, "width": -100, "height": -50}]"#,
    )
    .text("image_width", "200")
    .text("image_height", "150")
    .into_request("/api/save-annotation");
  let res = send(&router, request).await;
  assert_eq!(res.status, StatusCode::OK, "{}", res.text());
  assert_eq!(res.json()["image"], "my_cat.png");
  assert_eq!(res.json()["boxes"], 2);

  let dataset = app.root().join("dataset");
  assert!(dataset.join("images/train/my_cat.png").is_file());
  let label = fs::read_to_string(dataset.join("labels/train/my_cat.txt")).unwrap();
  assert_eq!(
    label,
    "0 0.500000 0.500000 1.000000 1.000000\n0 0.500000 0.500000 0.500000 0.333333\n"
  );

  let res = send(&router, get("/api/stats")).await;
  let stats = res.json();
  assert_eq!(stats["classes"], 1);
  assert_eq!(stats["train_images"], 1);
  assert_eq!(stats["train_labeled"], 1);
  assert_eq!(stats["val_images"], 0);

  let res = send(&router, get("/api/images?split=train")).await;
  assert_eq!(
    res.json()["images"],
    json!([{ "name": "my_cat.png", "labeled": true }])
  );

  let res = send(&router, get("/api/images/train/my_cat.png")).await;
  assert_eq!(res.status, StatusCode::OK);
  assert_eq!(res.content_type.as_deref(), Some("image/png"));
  assert_eq!(res.body.as_ref(), png_bytes(400, 300).as_slice());

  let res = send(
    &router,
    get("/api/annotations/train/my_cat.png?width=400&height=300"),
  )
  .await;
  let body = res.json();
  assert_eq!(body["labeled"], true);
  let first = &body["boxes"][0];
  assert_eq!(first["classId"], 0);
  assert!((first["width"].as_f64().unwrap() - 400.0).abs() < 1e-3);
  assert!((first["height"].as_f64().unwrap() - 300.0).abs() < 1e-3);
}

#[tokio::test]
async fn test_save_annotation_rejects_invalid_input() {
  let app = TestApp::new();
  let router = studio::router(app.state.clone(), LIMIT);
  add_class(&router, "cat").await;

  let request = MultipartBody::new()
    .file("image", "a.png", "image/png", &png_bytes(40, 30))
    .text("dataset_type", "train")
    .text(
      "annotations",
      r#"[{"classId": 3, "x": 0, "y": 0, "width": 10, "height": 10}]"#,
    )
    .text("image_width", "40")
    .text("image_height", "30")
    .into_request("/api/save-annotation");
  let res = send(&router, request).await;
  assert_eq!(res.status, StatusCode::BAD_REQUEST);
  assert_eq!(res.json()["success"], false);
  assert!(!app.root().join("dataset/images/train/a.png").exists());
  assert!(!app.root().join("dataset/labels/train/a.txt").exists());

  let request = MultipartBody::new()
    .file("image", "a.png", "image/png", &png_bytes(40, 30))
    .text("dataset_type", "test")
    .text("annotations", "[]")
    .text("image_width", "40")
    .text("image_height", "30")
    .into_request("/api/save-annotation");
  assert_eq!(send(&router, request).await.status, StatusCode::BAD_REQUEST);

  let request = MultipartBody::new()
    .file("image", "a.png", "image/png", b"not an image")
    .text("dataset_type", "val")
    .text("annotations", "[]")
    .text("image_width", "40")
    .text("image_height", "30")
    .into_request("/api/save-annotation");
  assert_eq!(send(&router, request).await.status, StatusCode::BAD_REQUEST);

  let request = MultipartBody::new()
    .file("image", "a.png", "image/png", &png_bytes(40, 30))
    .text("dataset_type", "val")
    .text("annotations", "[]")
    .text("image_width", "0")
    .text("image_height", "30")
    .into_request("/api/save-annotation");
  assert_eq!(send(&router, request).await.status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_image_routes_reject_traversal_and_missing_files() {
  let app = TestApp::new();
  let router = studio::router(app.state.clone(), LIMIT);

  let res = send(&router, get("/api/images/train/..%2Fclasses.json")).await;
  assert_eq!(res.status, StatusCode::BAD_REQUEST);

  let res = send(&router, get("/api/images/train/missing.jpg")).await;
  assert_eq!(res.status, StatusCode::NOT_FOUND);
  assert!(res.text().contains("missing.jpg"));

  let res = send(&router, get("/api/images?split=holdout")).await;
  assert_eq!(res.status, StatusCode::BAD_REQUEST);

  let res = send(&router, get("/api/annotations/val/none.jpg")).await;
  assert_eq!(res.status, StatusCode::OK);
  assert_eq!(res.json()["labeled"], false);
}

#[tokio::test]
async fn test_dataset_path_configuration() {
  let app = TestApp::new();
  let router = studio::router(app.state.clone(), LIMIT);

  let res = send(
    &router,
    json_request("POST", "/api/dataset-path", &json!({ "path": "other_dataset" })),
  )
  .await;
  assert_eq!(res.status, StatusCode::OK, "{}", res.text());

  let other = app.root().join("other_dataset");
  assert!(other.join("images/train").is_dir());
  assert!(other.join("labels/val").is_dir());
  assert!(app.root().join("settings.json").is_file());

  let res = send(&router, get("/api/dataset-path")).await;
  assert_eq!(
    res.json()["dataset_dir"],
    other.display().to_string().as_str()
  );

  // 重新打开工作目录时沿用已保存的路径
  let reopened = Workspace::open(app.root()).unwrap();
  assert_eq!(reopened.dataset_dir(), other);

  fs::write(app.root().join("plain_file"), "x").unwrap();
  let res = send(
    &router,
    json_request("POST", "/api/dataset-path", &json!({ "path": "plain_file" })),
  )
  .await;
  assert_eq!(res.status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_training_lifecycle() {
  let app = TestApp::new();
  let router = studio::router(app.state.clone(), LIMIT);
  let params = json!({ "model": "yolov8n.pt", "epochs": 1, "batch": 2 });

  let res = send(&router, json_request("POST", "/api/train", &params)).await;
  assert_eq!(res.status, StatusCode::BAD_REQUEST, "没有类别时不能训练");

  add_class(&router, "cat").await;
  add_class(&router, "dog").await;

  let res = send(&router, json_request("POST", "/api/train", &params)).await;
  assert_eq!(res.status, StatusCode::OK, "{}", res.text());

  let manifest = DataManifest::read(app.root().join("dataset/data.yaml")).unwrap();
  assert_eq!(manifest.nc, 2);
  assert_eq!(manifest.names, ["cat", "dog"]);

  let res = send(&router, json_request("POST", "/api/train", &params)).await;
  assert_eq!(res.status, StatusCode::CONFLICT);

  let res = send(&router, get("/api/train/status")).await;
  assert_eq!(res.json()["status"]["state"], "running");

  let res = send(
    &router,
    json_request("POST", "/api/dataset-path", &json!({ "path": "elsewhere" })),
  )
  .await;
  assert_eq!(res.status, StatusCode::CONFLICT);
  assert_eq!(res.json()["success"], false);
  assert!(!app.root().join("elsewhere").exists());

  app.trainer.release();
  assert_eq!(wait_for_training(&router).await["state"], "succeeded");

  let res = send(
    &router,
    json_request("POST", "/api/dataset-path", &json!({ "path": "elsewhere" })),
  )
  .await;
  assert_eq!(res.status, StatusCode::OK, "{}", res.text());

  let status = app.state.training().status();
  assert!(status.message.unwrap().contains("训练完成"));
  assert!(status.onnx.unwrap().ends_with("best.onnx"));
  assert!(status.log.iter().any(|line| line == "Epoch 1/1"));

  let specs = app.trainer.specs.lock().unwrap();
  assert_eq!(specs.len(), 1);
  assert_eq!(specs[0].params.imgsz, 640);
  assert_eq!(specs[0].project, app.root().join("models"));
}

#[tokio::test]
async fn test_model_test_prefers_trained_weights() {
  let app = TestApp::new();
  let router = studio::router(app.state.clone(), LIMIT);

  let request = MultipartBody::new()
    .file("image", "t.png", "image/png", &png_bytes(64, 48))
    .into_request("/api/test");
  let res = send(&router, request).await;
  assert_eq!(res.status, StatusCode::OK, "{}", res.text());
  assert_eq!(res.content_type.as_deref(), Some("image/jpeg"));
  assert!(res.is_jpeg());
  assert_eq!(
    app.loader.loaded(),
    [app.root().join("weights").join("yolov8n.onnx")]
  );

  let trained = app.root().join("models/custom_model/weights/best.onnx");
  fs::create_dir_all(trained.parent().unwrap()).unwrap();
  fs::write(&trained, b"onnx").unwrap();

  for _ in 0..2 {
    let request = MultipartBody::new()
      .file("image", "t.png", "image/png", &png_bytes(64, 48))
      .into_request("/api/test");
    assert_eq!(send(&router, request).await.status, StatusCode::OK);
  }
  // 训练好的模型只加载一次
  assert_eq!(app.loader.loaded().len(), 2);
  assert_eq!(app.loader.loaded()[1], trained);

  let request = MultipartBody::new()
    .text("note", "no image")
    .into_request("/api/test");
  let res = send(&router, request).await;
  assert_eq!(res.status, StatusCode::BAD_REQUEST);
  assert_eq!(res.content_type.as_deref(), Some("text/plain; charset=utf-8"));
}

#[tokio::test]
async fn test_index_page_is_served() {
  let app = TestApp::new();
  let router = studio::router(app.state.clone(), LIMIT);
  let res = send(&router, get("/")).await;
  assert_eq!(res.status, StatusCode::OK);
  assert!(res.text().contains("annotationCanvas"));
}

#[tokio::test]
async fn test_training_failure_is_reported_in_status() {
  let app = TestApp::with_trainer(FakeTrainer::failing());
  let router = studio::router(app.state.clone(), LIMIT);
  add_class(&router, "cat").await;

  let params = json!({ "model": "yolov8n.pt", "epochs": 1, "batch": 2 });
  let res = send(&router, json_request("POST", "/api/train", &params)).await;
  assert_eq!(res.status, StatusCode::OK, "{}", res.text());

  app.trainer.release();
  let status = wait_for_training(&router).await;
  assert_eq!(status["state"], "failed");
  assert!(status["message"].as_str().unwrap().starts_with("训练失败: "));
  assert!(status["finished_at"].is_string());

  // 失败后可以重新开始
  let res = send(&router, json_request("POST", "/api/train", &params)).await;
  assert_eq!(res.status, StatusCode::OK);
}

#[tokio::test]
async fn test_retrained_model_is_reloaded() {
  let app = TestApp::new();
  let router = studio::router(app.state.clone(), LIMIT);
  add_class(&router, "cat").await;
  let png = png_bytes(64, 48);

  let trained = app.root().join("models/custom_model/weights/best.onnx");
  fs::create_dir_all(trained.parent().unwrap()).unwrap();
  fs::write(&trained, b"onnx").unwrap();
  assert_eq!(send(&router, test_request(&png)).await.status, StatusCode::OK);
  assert_eq!(app.loader.loaded(), [trained.clone()]);

  let params = json!({ "model": "yolov8n.pt", "epochs": 1, "batch": 2 });
  let res = send(&router, json_request("POST", "/api/train", &params)).await;
  assert_eq!(res.status, StatusCode::OK, "{}", res.text());
  app.trainer.release();
  assert_eq!(wait_for_training(&router).await["state"], "succeeded");

  assert_eq!(send(&router, test_request(&png)).await.status, StatusCode::OK);
  assert_eq!(app.loader.loaded(), [trained.clone(), trained.clone()]);

  // 没有新的训练时沿用已加载的模型
  assert_eq!(send(&router, test_request(&png)).await.status, StatusCode::OK);
  assert_eq!(app.loader.loaded().len(), 2);
}

#[tokio::test]
async fn test_malformed_json_bodies_get_json_errors() {
  let app = TestApp::new();
  let router = studio::router(app.state.clone(), LIMIT);
  add_class(&router, "cat").await;

  let bodies = [
    ("POST", "/api/train", json!({ "model": "m", "epochs": null, "batch": 2 })),
    ("POST", "/api/classes", json!({ "label": "dog" })),
    ("PUT", "/api/classes/0", json!({ "name": 3 })),
    ("POST", "/api/dataset-path", json!({})),
  ];
  for (method, uri, body) in bodies {
    let res = send(&router, json_request(method, uri, &body)).await;
    assert_eq!(res.status, StatusCode::BAD_REQUEST, "{method} {uri}");
    let body = res.json();
    assert_eq!(body["success"], false);
    assert!(body["error"].as_str().unwrap().starts_with("请求数据格式错误"));
  }

  let request = axum::http::Request::post("/api/classes")
    .body(axum::body::Body::from("name=dog"))
    .unwrap();
  let res = send(&router, request).await;
  assert_eq!(res.status, StatusCode::BAD_REQUEST);
  assert_eq!(res.json()["success"], false);

  assert!(!app.state.training().is_running());
}

use std::{
  io::Cursor,
  path::{Path, PathBuf},
  sync::{Arc, Condvar, Mutex},
};

use axum::{
  Router,
  body::{Body, Bytes},
  http::{Request, StatusCode, header},
};
use http_body_util::BodyExt;
use image::{ImageFormat, Rgb, RgbImage};
use kuangxuan::{
  model::{DetectItem, DetectResult, Detector, DetectorLoader, ModelError, ModelRef, Thresholds},
  server::{AppState, SharedState},
  train::{self, TrainError, TrainJobSpec, TrainOutcome, Trainer, TrainingJob},
  workspace::Workspace,
};
use serde_json::Value;
use tower::ServiceExt;

pub const BOUNDARY: &str = "kuangxuan-test-boundary";

/// 固定返回一个 person 框的检测器
pub struct FakeDetector;

impl Detector for FakeDetector {
  fn detect(&self, image: &RgbImage, thresholds: Thresholds) -> Result<DetectResult, ModelError> {
    let score = 0.876_54;
    let items = if score >= thresholds.confidence {
      vec![DetectItem {
        class_id: 0,
        class_name: "person".to_string(),
        score,
        bbox: [10.0, 10.0, 50.0, (image.height() as f32).min(40.0)],
      }]
    } else {
      Vec::new()
    };
    Ok(DetectResult {
      items: items.into_boxed_slice(),
    })
  }
}

/// 记录加载过哪些模型文件
#[derive(Default)]
pub struct FakeLoader {
  pub loaded: Mutex<Vec<PathBuf>>,
  /// 为 true 时模型文件必须存在
  pub strict: bool,
}

impl FakeLoader {
  pub fn strict() -> Self {
    Self {
      strict: true,
      ..Self::default()
    }
  }

  pub fn loaded(&self) -> Vec<PathBuf> {
    self.loaded.lock().unwrap().clone()
  }
}

impl DetectorLoader for FakeLoader {
  fn load(&self, model: &ModelRef) -> Result<Arc<dyn Detector>, ModelError> {
    if self.strict && !model.path.is_file() {
      return Err(ModelError::NotFound(model.path.display().to_string()));
    }
    self.loaded.lock().unwrap().push(model.path.clone());
    Ok(Arc::new(FakeDetector))
  }
}

/// 在 `release` 之前一直阻塞的训练器
#[derive(Default)]
pub struct FakeTrainer {
  gate: (Mutex<bool>, Condvar),
  pub specs: Mutex<Vec<TrainJobSpec>>,
  /// 为 true 时放行后返回训练失败
  pub fail: bool,
}

impl FakeTrainer {
  pub fn failing() -> Self {
    Self {
      fail: true,
      ..Self::default()
    }
  }

  pub fn release(&self) {
    let (lock, cvar) = &self.gate;
    *lock.lock().unwrap() = true;
    cvar.notify_all();
  }
}

impl Trainer for FakeTrainer {
  fn train(&self, spec: &TrainJobSpec, log: &TrainingJob) -> Result<TrainOutcome, TrainError> {
    self.specs.lock().unwrap().push(spec.clone());
    log.push_log("Epoch 1/1");

    let (lock, cvar) = &self.gate;
    let mut released = lock.lock().unwrap();
    while !*released {
      released = cvar.wait(released).unwrap();
    }

    if self.fail {
      return Err(TrainError::ProcessFailed(Some(1)));
    }
    let onnx = train::best_onnx(&spec.project);
    std::fs::create_dir_all(onnx.parent().unwrap())?;
    std::fs::write(&onnx, format!("onnx run {}", self.specs.lock().unwrap().len()))?;
    Ok(TrainOutcome {
      weights: train::best_weights(&spec.project),
      onnx: Some(onnx),
    })
  }
}

pub struct TestApp {
  pub state: SharedState,
  pub loader: Arc<FakeLoader>,
  pub trainer: Arc<FakeTrainer>,
  pub dir: tempfile::TempDir,
}

impl TestApp {
  pub fn new() -> Self {
    Self::with_loader(FakeLoader::default())
  }

  pub fn with_loader(loader: FakeLoader) -> Self {
    Self::build(loader, FakeTrainer::default())
  }

  pub fn with_trainer(trainer: FakeTrainer) -> Self {
    Self::build(FakeLoader::default(), trainer)
  }

  fn build(loader: FakeLoader, trainer: FakeTrainer) -> Self {
    let dir = tempfile::TempDir::new().expect("Failed to create temp directory");
    let workspace = Workspace::open(dir.path()).expect("Failed to open workspace");
    let loader = Arc::new(loader);
    let trainer = Arc::new(trainer);
    let state = AppState::new(workspace, loader.clone())
      .expect("Failed to create state")
      .with_trainer(trainer.clone())
      .into_shared();
    Self {
      state,
      loader,
      trainer,
      dir,
    }
  }

  pub fn root(&self) -> &Path {
    self.dir.path()
  }
}

// 运行时关闭时会等待阻塞任务，确保训练线程能结束
impl Drop for TestApp {
  fn drop(&mut self) {
    self.trainer.release();
  }
}

/// 编码为 PNG 的纯色图片
pub fn png_bytes(width: u32, height: u32) -> Vec<u8> {
  let image = RgbImage::from_pixel(width, height, Rgb([120, 80, 200]));
  let mut buffer = Cursor::new(Vec::new());
  image
    .write_to(&mut buffer, ImageFormat::Png)
    .expect("Failed to encode test image");
  buffer.into_inner()
}

/// 手工拼装 multipart/form-data 请求体
#[derive(Default)]
pub struct MultipartBody {
  body: Vec<u8>,
}

impl MultipartBody {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn text(mut self, name: &str, value: &str) -> Self {
    self.body.extend_from_slice(
      format!(
        "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n"
      )
      .as_bytes(),
    );
    self
  }

  pub fn file(mut self, name: &str, file_name: &str, content_type: &str, bytes: &[u8]) -> Self {
    self.body.extend_from_slice(
      format!(
        "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{name}\"; filename=\"{file_name}\"\r\nContent-Type: {content_type}\r\n\r\n"
      )
      .as_bytes(),
    );
    self.body.extend_from_slice(bytes);
    self.body.extend_from_slice(b"\r\n");
    self
  }

  pub fn into_request(mut self, uri: &str) -> Request<Body> {
    self
      .body
      .extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
    Request::post(uri)
      .header(
        header::CONTENT_TYPE,
        format!("multipart/form-data; boundary={BOUNDARY}"),
      )
      .body(Body::from(self.body))
      .unwrap()
  }
}

pub fn json_request(method: &str, uri: &str, body: &Value) -> Request<Body> {
  Request::builder()
    .method(method)
    .uri(uri)
    .header(header::CONTENT_TYPE, "application/json")
    .body(Body::from(body.to_string()))
    .unwrap()
}

pub fn get(uri: &str) -> Request<Body> {
  Request::get(uri).body(Body::empty()).unwrap()
}

pub struct TestResponse {
  pub status: StatusCode,
  pub content_type: Option<String>,
  pub headers: axum::http::HeaderMap,
  pub body: Bytes,
}

impl TestResponse {
  pub fn json(&self) -> Value {
    serde_json::from_slice(&self.body).expect("Response is not JSON")
  }

  pub fn text(&self) -> String {
    String::from_utf8_lossy(&self.body).into_owned()
  }

  pub fn is_jpeg(&self) -> bool {
    self.body.starts_with(&[0xFF, 0xD8])
  }
}

pub async fn send(router: &Router, request: Request<Body>) -> TestResponse {
  let response = router
    .clone()
    .oneshot(request)
    .await
    .expect("Router failed");
  let status = response.status();
  let headers = response.headers().clone();
  let content_type = headers
    .get(header::CONTENT_TYPE)
    .and_then(|v| v.to_str().ok())
    .map(str::to_string);
  let body = response
    .into_body()
    .collect()
    .await
    .expect("Failed to read body")
    .to_bytes();
  TestResponse {
    status,
    content_type,
    headers,
    body,
  }
}

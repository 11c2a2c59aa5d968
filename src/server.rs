// 该文件是 Kuangxuan （框选） 项目的一部分。
// src/server.rs - HTTP 服务公共部分
//
// 本文件根据 Apache 许可证第 2.0 版（以下简称“许可证”）授权使用；
// 除非遵守该许可证条款，否则您不得使用本文件。
// 您可通过以下网址获取许可证副本：
// http://www.apache.org/licenses/LICENSE-2.0
// 除非适用法律要求或书面同意，根据本许可协议分发的软件均按“原样”提供，
// 不附带任何形式的明示或暗示的保证或条件。
// 有关许可权限与限制的具体条款，请参阅本许可协议。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, Wareless Group

pub mod api;
pub mod simple;
pub mod studio;

use std::{
  collections::HashMap,
  fs,
  net::SocketAddr,
  path::{Path, PathBuf},
  str::FromStr,
  sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard},
  time::SystemTime,
};

use axum::{
  Json, Router,
  body::Bytes,
  extract::{Multipart, multipart::MultipartError, rejection::JsonRejection},
  http::StatusCode,
  response::{IntoResponse, Response},
};
use serde_json::json;
use tokio::{net::TcpListener, task::JoinError};
use tracing::{error, info, warn};

use crate::{
  annotation::AnnotationError,
  classes::{ClassRegistry, ClassRegistryError},
  manifest::ManifestError,
  model::{DetectResult, Detector, DetectorLoader, ModelError, ModelRef, Thresholds},
  render::{self, Draw, RenderError},
  train::{TrainError, Trainer, TrainingJob, YoloCliTrainer},
  workspace::{Workspace, WorkspaceError},
};

pub const STUDIO_PORT: u16 = 7864;
pub const API_PORT: u16 = 8000;
pub const SIMPLE_PORT: u16 = 7863;

pub const DEFAULT_UPLOAD_MB: usize = 50;
pub const SIMPLE_UPLOAD_MB: usize = 16;

pub const DEFAULT_MODEL: &str = "yolov8n.pt";

/// 请求处理错误
///
/// JSON 接口返回 `{success: false, error}`，图片接口返回纯文本。
#[derive(Debug)]
pub struct ApiError {
  status: StatusCode,
  message: String,
  plain: bool,
}

impl ApiError {
  pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
    Self {
      status,
      message: message.into(),
      plain: false,
    }
  }

  pub fn bad_request(message: impl Into<String>) -> Self {
    Self::new(StatusCode::BAD_REQUEST, message)
  }

  pub fn not_found(message: impl Into<String>) -> Self {
    Self::new(StatusCode::NOT_FOUND, message)
  }

  pub fn internal(message: impl Into<String>) -> Self {
    Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
  }

  /// 以纯文本形式返回
  pub fn plain(mut self) -> Self {
    self.plain = true;
    self
  }

  pub fn status(&self) -> StatusCode {
    self.status
  }

  pub fn message(&self) -> &str {
    &self.message
  }
}

impl IntoResponse for ApiError {
  fn into_response(self) -> Response {
    if self.status.is_server_error() {
      error!("{}", self.message);
    } else {
      warn!("{}", self.message);
    }
    if self.plain {
      (self.status, self.message).into_response()
    } else {
      (
        self.status,
        Json(json!({ "success": false, "error": self.message })),
      )
        .into_response()
    }
  }
}

fn io_status(err: &std::io::Error) -> StatusCode {
  match err.kind() {
    std::io::ErrorKind::NotFound => StatusCode::NOT_FOUND,
    _ => StatusCode::INTERNAL_SERVER_ERROR,
  }
}

impl From<WorkspaceError> for ApiError {
  fn from(err: WorkspaceError) -> Self {
    let status = match &err {
      WorkspaceError::UnknownSplit(_)
      | WorkspaceError::InvalidFileName(_)
      | WorkspaceError::InvalidDatasetPath(_) => StatusCode::BAD_REQUEST,
      WorkspaceError::IoError(e) => io_status(e),
      WorkspaceError::SettingsError(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    Self::new(status, err.to_string())
  }
}

impl From<ClassRegistryError> for ApiError {
  fn from(err: ClassRegistryError) -> Self {
    let status = match &err {
      ClassRegistryError::EmptyName | ClassRegistryError::Duplicate(_) => StatusCode::BAD_REQUEST,
      ClassRegistryError::OutOfRange { .. } => StatusCode::NOT_FOUND,
      _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    Self::new(status, err.to_string())
  }
}

impl From<AnnotationError> for ApiError {
  fn from(err: AnnotationError) -> Self {
    let status = match &err {
      AnnotationError::InvalidCanvas { .. } | AnnotationError::ClassOutOfRange { .. } => {
        StatusCode::BAD_REQUEST
      }
      AnnotationError::IoError(e) => io_status(e),
      AnnotationError::MalformedLine { .. } => StatusCode::INTERNAL_SERVER_ERROR,
    };
    Self::new(status, err.to_string())
  }
}

impl From<ManifestError> for ApiError {
  fn from(err: ManifestError) -> Self {
    Self::internal(err.to_string())
  }
}

impl From<ModelError> for ApiError {
  fn from(err: ModelError) -> Self {
    let status = match &err {
      ModelError::InvalidReference(_) | ModelError::UnsupportedScheme(_) => StatusCode::BAD_REQUEST,
      ModelError::NotFound(_) => StatusCode::NOT_FOUND,
      _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    Self::new(status, err.to_string())
  }
}

impl From<JsonRejection> for ApiError {
  fn from(err: JsonRejection) -> Self {
    Self::bad_request(format!("请求数据格式错误: {}", err.body_text()))
  }
}

impl From<TrainError> for ApiError {
  fn from(err: TrainError) -> Self {
    let status = match &err {
      TrainError::InvalidParams(_) => StatusCode::BAD_REQUEST,
      TrainError::AlreadyRunning => StatusCode::CONFLICT,
      _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    Self::new(status, err.to_string())
  }
}

impl From<RenderError> for ApiError {
  fn from(err: RenderError) -> Self {
    match err {
      RenderError::ImageError(e) => Self::bad_request(format!("无法解析图片: {}", e)),
      RenderError::IoError(e) if e.kind() == std::io::ErrorKind::InvalidData => {
        Self::bad_request(format!("无法解析图片: {}", e))
      }
      other => Self::internal(other.to_string()),
    }
  }
}

impl From<MultipartError> for ApiError {
  fn from(err: MultipartError) -> Self {
    Self::new(err.status(), format!("表单解析失败: {}", err.body_text()))
  }
}

impl From<JoinError> for ApiError {
  fn from(err: JoinError) -> Self {
    Self::internal(format!("后台任务异常: {}", err))
  }
}

/// 上传的文件字段
#[derive(Debug, Clone)]
pub struct Upload {
  pub file_name: Option<String>,
  pub bytes: Bytes,
}

/// 读取完毕的 multipart 表单
#[derive(Debug, Default)]
pub struct UploadForm {
  fields: HashMap<String, String>,
  files: Vec<(String, Upload)>,
}

impl UploadForm {
  pub async fn read(mut multipart: Multipart) -> Result<Self, ApiError> {
    let mut form = UploadForm::default();
    while let Some(field) = multipart.next_field().await? {
      let Some(name) = field.name().map(str::to_string) else {
        continue;
      };
      match field.file_name().map(str::to_string) {
        Some(file_name) => {
          let bytes = field.bytes().await?;
          let file_name = (!file_name.is_empty()).then_some(file_name);
          form.files.push((name, Upload { file_name, bytes }));
        }
        None => {
          let text = field.text().await?;
          form.fields.insert(name, text);
        }
      }
    }
    Ok(form)
  }

  pub fn text(&self, name: &str) -> Option<&str> {
    self.fields.get(name).map(String::as_str)
  }

  /// 解析可选字段，缺省或为空时返回 `default`
  pub fn parse_or<T: FromStr>(&self, name: &str, default: T) -> Result<T, ApiError> {
    match self.text(name).map(str::trim) {
      None | Some("") => Ok(default),
      Some(raw) => raw
        .parse()
        .map_err(|_| ApiError::bad_request(format!("字段 {} 无效: {}", name, raw))),
    }
  }

  pub fn require<T: FromStr>(&self, name: &str) -> Result<T, ApiError> {
    let raw = self
      .text(name)
      .map(str::trim)
      .ok_or_else(|| ApiError::bad_request(format!("缺少字段: {}", name)))?;
    raw
      .parse()
      .map_err(|_| ApiError::bad_request(format!("字段 {} 无效: {}", name, raw)))
  }

  pub fn file(&self, name: &str) -> Option<&Upload> {
    self.files.iter().find(|(n, _)| n == name).map(|(_, f)| f)
  }

  pub fn files<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Upload> + 'a {
    self
      .files
      .iter()
      .filter(move |(n, _)| n == name)
      .map(|(_, f)| f)
  }
}

/// 表单中的布尔值，兼容 `true/1/yes/on`
pub fn parse_flag(raw: Option<&str>) -> bool {
  raw
    .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "true" | "1" | "yes" | "on"))
    .unwrap_or(false)
}

#[derive(Clone)]
pub struct LoadedModel {
  pub name: String,
  pub path: PathBuf,
  pub detector: Arc<dyn Detector>,
  /// 加载时权重文件的修改时间
  pub modified: Option<SystemTime>,
  /// 加载时已成功完成的训练次数
  pub training_round: u64,
}

fn modified_time(path: &Path) -> Option<SystemTime> {
  fs::metadata(path).and_then(|m| m.modified()).ok()
}

/// 一次检测的结果
pub struct Detection {
  pub width: u32,
  pub height: u32,
  pub result: DetectResult,
  /// 绘制了检测框的 JPEG
  pub annotated: Option<Vec<u8>>,
}

/// 三个前端共享的服务状态
pub struct AppState {
  workspace: RwLock<Workspace>,
  classes: Mutex<ClassRegistry>,
  loader: Arc<dyn DetectorLoader>,
  model: RwLock<Option<LoadedModel>>,
  default_model: String,
  thresholds: Thresholds,
  trainer: Arc<dyn Trainer>,
  training: TrainingJob,
  draw: Arc<Draw>,
}

pub type SharedState = Arc<AppState>;

impl AppState {
  pub fn new(workspace: Workspace, loader: Arc<dyn DetectorLoader>) -> Result<Self, ClassRegistryError> {
    let classes = ClassRegistry::load(workspace.classes_file())?;
    info!("已加载 {} 个类别", classes.len());
    Ok(Self {
      workspace: RwLock::new(workspace),
      classes: Mutex::new(classes),
      loader,
      model: RwLock::new(None),
      default_model: DEFAULT_MODEL.to_string(),
      thresholds: Thresholds::default(),
      trainer: Arc::new(YoloCliTrainer::default()),
      training: TrainingJob::default(),
      draw: Arc::new(Draw::default()),
    })
  }

  pub fn with_trainer(mut self, trainer: Arc<dyn Trainer>) -> Self {
    self.trainer = trainer;
    self
  }

  pub fn with_draw(mut self, draw: Draw) -> Self {
    self.draw = Arc::new(draw);
    self
  }

  pub fn with_default_model(mut self, model: impl Into<String>) -> Self {
    self.default_model = model.into();
    self
  }

  pub fn with_thresholds(mut self, thresholds: Thresholds) -> Self {
    self.thresholds = thresholds;
    self
  }

  pub fn into_shared(self) -> SharedState {
    Arc::new(self)
  }

  pub fn workspace(&self) -> RwLockReadGuard<'_, Workspace> {
    self.workspace.read().unwrap_or_else(PoisonError::into_inner)
  }

  pub fn workspace_mut(&self) -> RwLockWriteGuard<'_, Workspace> {
    self.workspace.write().unwrap_or_else(PoisonError::into_inner)
  }

  /// 类别表锁，同时串行化标注写入
  pub fn classes(&self) -> MutexGuard<'_, ClassRegistry> {
    self.classes.lock().unwrap_or_else(PoisonError::into_inner)
  }

  pub fn default_model(&self) -> &str {
    &self.default_model
  }

  pub fn thresholds(&self) -> Thresholds {
    self.thresholds
  }

  pub fn trainer(&self) -> Arc<dyn Trainer> {
    self.trainer.clone()
  }

  pub fn training(&self) -> &TrainingJob {
    &self.training
  }

  pub fn current_model(&self) -> Option<LoadedModel> {
    self
      .model
      .read()
      .unwrap_or_else(PoisonError::into_inner)
      .clone()
  }

  /// 加载模型并替换当前模型
  pub async fn load_model(&self, spec: &str) -> Result<LoadedModel, ApiError> {
    let weights_dir = self.workspace().weights_dir();
    let model_ref = ModelRef::resolve(spec, &weights_dir)?;
    let path = model_ref.path.clone();
    info!("正在加载模型 {} ({})", spec, path.display());
    let training_round = self.training.succeeded_runs();
    let modified = modified_time(&path);

    let loader = self.loader.clone();
    let detector = tokio::task::spawn_blocking(move || loader.load(&model_ref)).await??;

    let loaded = LoadedModel {
      name: spec.to_string(),
      path,
      detector,
      modified,
      training_round,
    };
    *self.model.write().unwrap_or_else(PoisonError::into_inner) = Some(loaded.clone());
    info!("模型加载完成: {}", spec);
    Ok(loaded)
  }

  /// 当前模型不是 `spec`，或权重在加载后被训练或改写时重新加载
  pub async fn ensure_model(&self, spec: &str) -> Result<LoadedModel, ApiError> {
    if let Some(model) = self.current_model()
      && model.name == spec
      && model.training_round == self.training.succeeded_runs()
      && model.modified == modified_time(&model.path)
    {
      return Ok(model);
    }
    self.load_model(spec).await
  }

  /// 在阻塞线程池中解码、推理，按需绘制
  pub async fn detect(
    &self,
    detector: Arc<dyn Detector>,
    bytes: Bytes,
    thresholds: Thresholds,
    annotate: bool,
  ) -> Result<Detection, ApiError> {
    let draw = annotate.then(|| self.draw.clone());
    tokio::task::spawn_blocking(move || {
      let mut image = render::decode_image(&bytes)?;
      let (width, height) = image.dimensions();
      let result = detector.detect(&image, thresholds)?;
      let annotated = match draw {
        Some(draw) => {
          draw.draw_detections(&mut image, &result);
          Some(render::encode_jpeg(&image)?)
        }
        None => None,
      };
      Ok::<_, ApiError>(Detection {
        width,
        height,
        result,
        annotated,
      })
    })
    .await?
  }
}

/// 绑定地址并运行，Ctrl-C 时优雅退出
pub async fn serve(router: Router, addr: SocketAddr) -> std::io::Result<()> {
  let listener = TcpListener::bind(addr).await?;
  info!("服务已启动: http://{}", listener.local_addr()?);
  axum::serve(listener, router)
    .with_graceful_shutdown(shutdown_signal())
    .await?;
  info!("服务已停止");
  Ok(())
}

async fn shutdown_signal() {
  match tokio::signal::ctrl_c().await {
    Ok(()) => info!("收到中断信号，正在退出..."),
    Err(e) => {
      warn!("无法监听中断信号: {}", e);
      std::future::pending::<()>().await;
    }
  }
}

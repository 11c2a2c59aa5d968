// 该文件是 Kuangxuan （框选） 项目的一部分。
// src/server/studio.rs - 训练工作台接口
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

use std::{fs, path::PathBuf};

use axum::{
  Json, Router,
  extract::{DefaultBodyLimit, Multipart, Path, Query, State, rejection::JsonRejection},
  http::header,
  response::{Html, IntoResponse, Response},
  routing::{get, post, put},
};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{info, warn};

use super::{ApiError, SharedState, UploadForm};
use crate::{
  annotation::{self, CanvasBox, CanvasSize},
  manifest::DataManifest,
  render,
  train::{self, TrainJobSpec, TrainParams},
  workspace::{Split, fallback_upload_name, is_image_file, sanitize_filename},
};

const PAGE: &str = include_str!("../../assets/studio.html");

/// 画布与图片宽高比偏差超过该值时记录警告
const ASPECT_TOLERANCE: f64 = 0.02;

pub fn router(state: SharedState, upload_limit: usize) -> Router {
  Router::new()
    .route("/", get(index))
    .route("/api/stats", get(stats))
    .route("/api/classes", get(list_classes).post(add_class))
    .route("/api/classes/:id", put(rename_class))
    .route("/api/save-annotation", post(save_annotation))
    .route("/api/images", get(list_images))
    .route("/api/images/:split/:name", get(image_file))
    .route("/api/annotations/:split/:name", get(annotations))
    .route("/api/dataset-path", get(dataset_path).post(set_dataset_path))
    .route("/api/train", post(start_training))
    .route("/api/train/status", get(training_status))
    .route("/api/test", post(test_model))
    .layer(DefaultBodyLimit::max(upload_limit))
    .with_state(state)
}

async fn index() -> Html<&'static str> {
  Html(PAGE)
}

fn trained_onnx(state: &SharedState) -> PathBuf {
  train::best_onnx(&state.workspace().models_dir())
}

async fn stats(State(state): State<SharedState>) -> Result<Json<Value>, ApiError> {
  let classes = state.classes().len();
  let workspace = state.workspace();
  let stats = workspace.stats()?;
  Ok(Json(json!({
    "success": true,
    "classes": classes,
    "train_images": stats.train.images,
    "train_labeled": stats.train.labeled,
    "val_images": stats.val.images,
    "val_labeled": stats.val.labeled,
    "paths": {
      "workspace": workspace.root().display().to_string(),
      "dataset": workspace.dataset_dir().display().to_string(),
      "images_train": workspace.images_dir(Split::Train).display().to_string(),
      "images_val": workspace.images_dir(Split::Val).display().to_string(),
      "labels_train": workspace.labels_dir(Split::Train).display().to_string(),
      "labels_val": workspace.labels_dir(Split::Val).display().to_string(),
      "model": train::best_weights(&workspace.models_dir()).display().to_string(),
    },
  })))
}

async fn list_classes(State(state): State<SharedState>) -> Json<Value> {
  let classes = state.classes().names().to_vec();
  Json(json!({ "success": true, "classes": classes }))
}

#[derive(Debug, Deserialize)]
struct ClassRequest {
  name: String,
}

async fn add_class(
  State(state): State<SharedState>,
  request: Result<Json<ClassRequest>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
  let Json(request) = request?;
  let classes_file = state.workspace().classes_file();
  let mut classes = state.classes();
  let mut added = classes.clone();
  let id = added.add(&request.name)?;
  added.save(&classes_file)?;
  *classes = added;
  Ok(Json(json!({
    "success": true,
    "id": id,
    "classes": classes.names(),
  })))
}

async fn rename_class(
  State(state): State<SharedState>,
  Path(id): Path<usize>,
  request: Result<Json<ClassRequest>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
  let Json(request) = request?;
  let classes_file = state.workspace().classes_file();
  let mut classes = state.classes();
  let mut renamed = classes.clone();
  renamed.rename(id, &request.name)?;
  renamed.save(&classes_file)?;
  *classes = renamed;
  Ok(Json(json!({ "success": true, "classes": classes.names() })))
}

/// 客户端文件名收敛为安全的图片文件名
fn stored_name(original: Option<&str>) -> String {
  original
    .and_then(sanitize_filename)
    .filter(|name| is_image_file(std::path::Path::new(name)))
    .unwrap_or_else(|| fallback_upload_name(original.unwrap_or_default()))
}

async fn save_annotation(
  State(state): State<SharedState>,
  multipart: Multipart,
) -> Result<Json<Value>, ApiError> {
  let form = UploadForm::read(multipart).await?;
  let upload = form
    .file("image")
    .ok_or_else(|| ApiError::bad_request("缺少图片字段 image"))?;
  let split: Split = form.require::<String>("dataset_type")?.parse()?;
  let boxes: Vec<CanvasBox> = serde_json::from_str(form.text("annotations").unwrap_or("[]"))
    .map_err(|e| ApiError::bad_request(format!("标注数据格式错误: {}", e)))?;
  let canvas = CanvasSize::new(form.require("image_width")?, form.require("image_height")?)?;

  let (image_width, image_height) = render::image_dimensions(&upload.bytes)?;
  if canvas.aspect_deviation(image_width, image_height) > ASPECT_TOLERANCE {
    warn!(
      "画布 {}x{} 与图片 {}x{} 宽高比不一致，标注可能变形",
      canvas.width, canvas.height, image_width, image_height
    );
  }

  let name = stored_name(upload.file_name.as_deref());

  // 类别只增不删，校验通过的编号在写入时仍然有效
  let labels = annotation::convert_annotations(&boxes, canvas, state.classes().len())?;
  let (image_path, label_path) = {
    let workspace = state.workspace();
    (
      workspace.image_path(split, &name)?,
      workspace.label_path(split, &name)?,
    )
  };

  let bytes = upload.bytes.clone();
  let written = labels.clone();
  let image_path = tokio::task::spawn_blocking(move || {
    fs::write(&image_path, &bytes).map_err(|e| ApiError::internal(e.to_string()))?;
    annotation::write_label_file(&label_path, &written)?;
    Ok::<_, ApiError>(image_path)
  })
  .await??;
  info!(
    "保存标注: {} ({} 集, {} 个目标)",
    image_path.display(),
    split,
    labels.len()
  );

  Ok(Json(json!({
    "success": true,
    "image": name,
    "split": split,
    "boxes": labels.len(),
    "dropped": boxes.len() - labels.len(),
  })))
}

#[derive(Debug, Deserialize)]
struct ImagesQuery {
  split: Option<String>,
}

async fn list_images(
  State(state): State<SharedState>,
  Query(query): Query<ImagesQuery>,
) -> Result<Json<Value>, ApiError> {
  let split = match query.split.as_deref() {
    Some(raw) => raw.parse()?,
    None => Split::Train,
  };
  let images = state.workspace().list_images(split)?;
  Ok(Json(json!({ "success": true, "split": split, "images": images })))
}

fn content_type(name: &str) -> &'static str {
  let ext = name
    .rsplit_once('.')
    .map(|(_, ext)| ext.to_ascii_lowercase())
    .unwrap_or_default();
  match ext.as_str() {
    "jpg" | "jpeg" => "image/jpeg",
    "png" => "image/png",
    "bmp" => "image/bmp",
    "gif" => "image/gif",
    "webp" => "image/webp",
    _ => "application/octet-stream",
  }
}

fn read_image(state: &SharedState, split: &str, name: &str) -> Result<Vec<u8>, ApiError> {
  let split: Split = split.parse()?;
  let path = state.workspace().image_path(split, name)?;
  fs::read(&path).map_err(|e| match e.kind() {
    std::io::ErrorKind::NotFound => ApiError::not_found(format!("图片不存在: {}", name)),
    _ => ApiError::internal(e.to_string()),
  })
}

async fn image_file(
  State(state): State<SharedState>,
  Path((split, name)): Path<(String, String)>,
) -> Response {
  match read_image(&state, &split, &name) {
    Ok(bytes) => ([(header::CONTENT_TYPE, content_type(&name))], bytes).into_response(),
    Err(e) => e.plain().into_response(),
  }
}

#[derive(Debug, Deserialize)]
struct CanvasQuery {
  width: Option<f64>,
  height: Option<f64>,
}

async fn annotations(
  State(state): State<SharedState>,
  Path((split, name)): Path<(String, String)>,
  Query(query): Query<CanvasQuery>,
) -> Result<Json<Value>, ApiError> {
  let split: Split = split.parse()?;
  let label_path = state.workspace().label_path(split, &name)?;
  let labels = if label_path.is_file() {
    annotation::read_label_file(&label_path)?
  } else {
    Vec::new()
  };

  let boxes = match (query.width, query.height) {
    (Some(width), Some(height)) => {
      let canvas = CanvasSize::new(width, height)?;
      Some(
        labels
          .iter()
          .map(|label| label.to_canvas(canvas))
          .collect::<Vec<_>>(),
      )
    }
    _ => None,
  };

  Ok(Json(json!({
    "success": true,
    "labeled": label_path.is_file(),
    "labels": labels,
    "boxes": boxes,
  })))
}

async fn dataset_path(State(state): State<SharedState>) -> Json<Value> {
  let workspace = state.workspace();
  Json(json!({
    "success": true,
    "workspace": workspace.root().display().to_string(),
    "dataset_dir": workspace.dataset_dir().display().to_string(),
  }))
}

#[derive(Debug, Deserialize)]
struct DatasetPathRequest {
  path: PathBuf,
}

async fn set_dataset_path(
  State(state): State<SharedState>,
  request: Result<Json<DatasetPathRequest>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
  let Json(request) = request?;
  if state.training().is_running() {
    return Err(ApiError::new(
      axum::http::StatusCode::CONFLICT,
      "训练进行中，不能修改数据集路径",
    ));
  }
  let mut workspace = state.workspace_mut();
  workspace.set_dataset_dir(&request.path)?;
  Ok(Json(json!({
    "success": true,
    "dataset_dir": workspace.dataset_dir().display().to_string(),
  })))
}

async fn start_training(
  State(state): State<SharedState>,
  params: Result<Json<TrainParams>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
  let Json(params) = params?;
  params.validate()?;

  let (manifest, spec) = {
    let classes = state.classes();
    if classes.is_empty() {
      return Err(ApiError::bad_request("请先设置类别"));
    }
    let workspace = state.workspace();
    let manifest = DataManifest::new(&workspace, &classes);
    let spec = TrainJobSpec {
      params: params.clone(),
      data: workspace.manifest_file(),
      project: workspace.models_dir(),
    };
    (manifest, spec)
  };

  let job = state.training().clone();
  job.try_start(&params)?;
  if let Err(e) = manifest.write(&spec.data) {
    job.abort(format!("训练失败: {}", e));
    return Err(e.into());
  }

  train::spawn_training(job, state.trainer(), spec.clone());
  Ok(Json(json!({
    "success": true,
    "message": format!(
      "训练已开始\n数据集配置: {}\n模型将保存在: {}",
      spec.data.display(),
      train::best_weights(&spec.project).display()
    ),
  })))
}

async fn training_status(State(state): State<SharedState>) -> Json<Value> {
  Json(json!({ "success": true, "status": state.training().status() }))
}

async fn run_test(state: &SharedState, multipart: Multipart) -> Result<Vec<u8>, ApiError> {
  let form = UploadForm::read(multipart).await?;
  let upload = form
    .file("image")
    .ok_or_else(|| ApiError::bad_request("缺少图片字段 image"))?;

  // 有训练产物时优先使用训练好的模型
  let trained = trained_onnx(state);
  let spec = if trained.is_file() {
    trained.display().to_string()
  } else {
    state.default_model().to_string()
  };
  let model = state.ensure_model(&spec).await?;

  let detection = state
    .detect(model.detector, upload.bytes.clone(), state.thresholds(), true)
    .await?;
  info!(
    "测试模型 {}: 检测到 {} 个目标",
    model.name,
    detection.result.items.len()
  );
  detection
    .annotated
    .ok_or_else(|| ApiError::internal("未生成标注图片"))
}

async fn test_model(State(state): State<SharedState>, multipart: Multipart) -> Response {
  match run_test(&state, multipart).await {
    Ok(jpeg) => ([(header::CONTENT_TYPE, "image/jpeg")], jpeg).into_response(),
    Err(e) => e.plain().into_response(),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn stored_names_are_safe_image_names() {
    assert_eq!(stored_name(Some("../cat 1.png")), "cat_1.png");
    assert!(stored_name(Some("小猫.jpg")).starts_with("upload_"));
    assert!(stored_name(Some("notes.txt")).ends_with(".jpg"));
    assert!(stored_name(None).starts_with("upload_"));
  }

  #[test]
  fn content_type_follows_extension() {
    assert_eq!(content_type("a.JPG"), "image/jpeg");
    assert_eq!(content_type("a.webp"), "image/webp");
    assert_eq!(content_type("a"), "application/octet-stream");
  }
}

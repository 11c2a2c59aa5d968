// 该文件是 Kuangxuan （框选） 项目的一部分。
// src/server/api.rs - 目标检测 JSON 接口
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

use axum::{
  Form, Json, Router,
  extract::{DefaultBodyLimit, FromRequest, Multipart, Request, State},
  http::header,
  response::{IntoResponse, Response},
  routing::{get, post},
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tower_http::cors::CorsLayer;
use tracing::info;

use super::{ApiError, LoadedModel, SharedState, UploadForm, parse_flag};
use crate::{
  model::{DetectResult, ModelError, PRETRAINED_MODELS, Thresholds},
  render::encode_base64,
};

pub fn router(state: SharedState, upload_limit: usize) -> Router {
  Router::new()
    .route("/", get(index))
    .route("/health", get(health))
    .route("/models", get(models))
    .route("/detect", post(detect))
    .route("/detect_image", post(detect_image))
    .route("/detect_batch", post(detect_batch))
    .route("/load_model", post(load_model))
    .layer(DefaultBodyLimit::max(upload_limit))
    .layer(CorsLayer::permissive())
    .with_state(state)
}

fn round_to(value: f32, places: i32) -> f64 {
  let factor = 10f64.powi(places);
  (value as f64 * factor).round() / factor
}

#[derive(Debug, Serialize)]
struct BoxJson {
  x1: f64,
  y1: f64,
  x2: f64,
  y2: f64,
  #[serde(skip_serializing_if = "Option::is_none")]
  width: Option<f64>,
  #[serde(skip_serializing_if = "Option::is_none")]
  height: Option<f64>,
}

#[derive(Debug, Serialize)]
struct DetectionJson {
  id: usize,
  class: String,
  confidence: f64,
  bbox: BoxJson,
}

fn detections_json(result: &DetectResult, with_size: bool) -> Vec<DetectionJson> {
  result
    .items
    .iter()
    .enumerate()
    .map(|(i, item)| DetectionJson {
      id: i + 1,
      class: item.class_name.clone(),
      confidence: round_to(item.score, 4),
      bbox: BoxJson {
        x1: round_to(item.bbox[0], 2),
        y1: round_to(item.bbox[1], 2),
        x2: round_to(item.bbox[2], 2),
        y2: round_to(item.bbox[3], 2),
        width: with_size.then(|| round_to(item.width(), 2)),
        height: with_size.then(|| round_to(item.height(), 2)),
      },
    })
    .collect()
}

fn loaded_model(state: &SharedState) -> Result<LoadedModel, ApiError> {
  state
    .current_model()
    .ok_or_else(|| ModelError::NotLoaded.into())
}

fn thresholds(form: &UploadForm, defaults: Thresholds) -> Result<Thresholds, ApiError> {
  let confidence = form.parse_or("conf_threshold", defaults.confidence)?;
  let iou = form.parse_or("iou_threshold", defaults.iou)?;
  for (name, value) in [("conf_threshold", confidence), ("iou_threshold", iou)] {
    if !(0.0..=1.0).contains(&value) {
      return Err(ApiError::bad_request(format!(
        "{} 必须在 0 到 1 之间: {}",
        name, value
      )));
    }
  }
  Ok(Thresholds { confidence, iou })
}

async fn index(State(state): State<SharedState>) -> Json<Value> {
  let model = state.current_model().map(|m| m.name);
  Json(json!({
    "name": "Kuangxuan 目标检测 API",
    "version": env!("CARGO_PKG_VERSION"),
    "model": model,
    "endpoints": {
      "/detect": "POST - 检测图片中的物体（返回JSON）",
      "/detect_image": "POST - 检测并返回标注后的图片",
      "/detect_batch": "POST - 批量检测多张图片",
      "/health": "GET - 健康检查",
      "/models": "GET - 查看可用模型",
      "/load_model": "POST - 加载指定模型",
    },
    "example": {
      "curl": "curl -X POST -F 'image=@test.jpg' http://localhost:8000/detect",
    },
  }))
}

async fn health(State(state): State<SharedState>) -> Json<Value> {
  let model = state.current_model();
  Json(json!({
    "status": "healthy",
    "model_loaded": model.is_some(),
    "model_path": model.map(|m| m.path.display().to_string()),
  }))
}

async fn models(State(state): State<SharedState>) -> Result<Json<Value>, ApiError> {
  let local = state.workspace().list_weights()?;
  Ok(Json(json!({
    "current_model": state.current_model().map(|m| m.name),
    "available_models": PRETRAINED_MODELS,
    "local_models": local,
  })))
}

async fn detect(
  State(state): State<SharedState>,
  multipart: Multipart,
) -> Result<Json<Value>, ApiError> {
  let model = loaded_model(&state)?;
  let form = UploadForm::read(multipart).await?;
  let upload = form
    .file("image")
    .ok_or_else(|| ApiError::bad_request("缺少图片字段 image"))?;
  let thresholds = thresholds(&form, state.thresholds())?;
  let return_image = parse_flag(form.text("return_image"));

  let detection = state
    .detect(model.detector, upload.bytes.clone(), thresholds, return_image)
    .await?;
  info!(
    "检测完成: {} 个目标 ({}x{})",
    detection.result.items.len(),
    detection.width,
    detection.height
  );

  let mut body = json!({
    "success": true,
    "count": detection.result.items.len(),
    "detections": detections_json(&detection.result, true),
    "image_size": { "width": detection.width, "height": detection.height },
    "parameters": {
      "conf_threshold": round_to(thresholds.confidence, 4),
      "iou_threshold": round_to(thresholds.iou, 4),
    },
  });
  if let Some(jpeg) = &detection.annotated {
    body["image_base64"] = Value::String(encode_base64(jpeg));
  }
  Ok(Json(body))
}

async fn annotated_jpeg(state: &SharedState, multipart: Multipart) -> Result<Vec<u8>, ApiError> {
  let model = loaded_model(state)?;
  let form = UploadForm::read(multipart).await?;
  let upload = form
    .file("image")
    .ok_or_else(|| ApiError::bad_request("缺少图片字段 image"))?;
  let thresholds = thresholds(&form, state.thresholds())?;
  let detection = state
    .detect(model.detector, upload.bytes.clone(), thresholds, true)
    .await?;
  detection
    .annotated
    .ok_or_else(|| ApiError::internal("未生成标注图片"))
}

async fn detect_image(State(state): State<SharedState>, multipart: Multipart) -> Response {
  match annotated_jpeg(&state, multipart).await {
    Ok(jpeg) => (
      [
        (header::CONTENT_TYPE, "image/jpeg"),
        (header::CONTENT_DISPOSITION, "inline; filename=detected.jpg"),
      ],
      jpeg,
    )
      .into_response(),
    Err(e) => e.plain().into_response(),
  }
}

async fn detect_batch(
  State(state): State<SharedState>,
  multipart: Multipart,
) -> Result<Json<Value>, ApiError> {
  let model = loaded_model(&state)?;
  let form = UploadForm::read(multipart).await?;
  let thresholds = thresholds(&form, state.thresholds())?;
  let uploads: Vec<_> = form.files("images").collect();
  if uploads.is_empty() {
    return Err(ApiError::bad_request("缺少图片字段 images"));
  }

  let mut results = Vec::with_capacity(uploads.len());
  for (index, upload) in uploads.iter().enumerate() {
    let detection = state
      .detect(model.detector.clone(), upload.bytes.clone(), thresholds, false)
      .await;
    results.push(match detection {
      Ok(detection) => json!({
        "image_index": index,
        "image_name": upload.file_name,
        "count": detection.result.items.len(),
        "detections": detections_json(&detection.result, false),
      }),
      Err(e) => json!({
        "image_index": index,
        "image_name": upload.file_name,
        "error": e.message(),
      }),
    });
  }

  info!("批量检测完成: {} 张图片", uploads.len());
  Ok(Json(json!({
    "success": true,
    "total_images": uploads.len(),
    "results": results,
  })))
}

#[derive(Debug, Deserialize)]
struct LoadModelForm {
  model_name: String,
}

/// `model_name` 可以来自 multipart 表单或 urlencoded 表单
async fn model_name_from(request: Request) -> Result<String, ApiError> {
  let is_multipart = request
    .headers()
    .get(header::CONTENT_TYPE)
    .and_then(|v| v.to_str().ok())
    .is_some_and(|v| v.starts_with("multipart/form-data"));

  let name = if is_multipart {
    let multipart = Multipart::from_request(request, &())
      .await
      .map_err(|e| ApiError::bad_request(e.body_text()))?;
    UploadForm::read(multipart).await?.require::<String>("model_name")?
  } else {
    let Form(form) = Form::<LoadModelForm>::from_request(request, &())
      .await
      .map_err(|e| ApiError::bad_request(e.body_text()))?;
    form.model_name
  };

  let name = name.trim();
  if name.is_empty() {
    return Err(ApiError::bad_request("模型名称为空"));
  }
  Ok(name.to_string())
}

async fn load_model(
  State(state): State<SharedState>,
  request: Request,
) -> Result<Json<Value>, ApiError> {
  let model_name = model_name_from(request).await?;
  let loaded = state
    .load_model(&model_name)
    .await
    .map_err(|e| ApiError::new(e.status(), format!("加载模型失败: {}", e.message())))?;
  Ok(Json(json!({
    "success": true,
    "message": format!("模型 {} 加载成功", model_name),
    "current_model": loaded.name,
  })))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn rounding_matches_response_precision() {
    assert_eq!(round_to(0.876_54, 4), 0.8765);
    assert_eq!(round_to(12.345_6, 2), 12.35);
    assert_eq!(round_to(0.45, 4), 0.45);
  }
}

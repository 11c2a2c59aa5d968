// 该文件是 Kuangxuan （框选） 项目的一部分。
// src/server/simple.rs - 单页检测应用
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
  Router,
  extract::{DefaultBodyLimit, Multipart, State},
  http::header,
  response::{Html, IntoResponse, Response},
  routing::{get, post},
};
use tracing::info;

use super::{ApiError, SharedState, UploadForm};

const PAGE: &str = include_str!("../../assets/simple.html");

pub fn router(state: SharedState, upload_limit: usize) -> Router {
  Router::new()
    .route("/", get(index))
    .route("/detect", post(detect))
    .layer(DefaultBodyLimit::max(upload_limit))
    .with_state(state)
}

async fn index() -> Html<&'static str> {
  Html(PAGE)
}

async fn run(state: &SharedState, multipart: Multipart) -> Result<Vec<u8>, ApiError> {
  let form = UploadForm::read(multipart).await?;
  let upload = form
    .file("image")
    .ok_or_else(|| ApiError::bad_request("没有上传图片"))?;
  let name = upload
    .file_name
    .clone()
    .ok_or_else(|| ApiError::bad_request("没有选择文件"))?;

  // 首次请求时才加载模型
  let model = state.ensure_model(state.default_model()).await?;
  let detection = state
    .detect(model.detector, upload.bytes.clone(), state.thresholds(), true)
    .await?;
  info!("{}: 检测到 {} 个目标", name, detection.result.items.len());

  detection
    .annotated
    .ok_or_else(|| ApiError::internal("未生成标注图片"))
}

async fn detect(State(state): State<SharedState>, multipart: Multipart) -> Response {
  match run(&state, multipart).await {
    Ok(jpeg) => ([(header::CONTENT_TYPE, "image/jpeg")], jpeg).into_response(),
    Err(e) => e.plain().into_response(),
  }
}

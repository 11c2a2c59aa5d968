// 该文件是 Kuangxuan （框选） 项目的一部分。
// src/client.rs - 检测 API 客户端
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

use std::{
  collections::BTreeMap,
  path::{Path, PathBuf},
};

use base64::{Engine, engine::general_purpose::STANDARD};
use reqwest::{
  Client, Response,
  multipart::{Form, Part},
};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;
use url::Url;

use crate::{FromUrl, FromUrlWithScheme};

#[derive(Error, Debug)]
pub enum ClientError {
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("请求失败: {0}")]
  HttpError(#[from] reqwest::Error),
  #[error("地址无效: {0}")]
  InvalidUrl(String),
  #[error("不支持的协议: {0}")]
  UnsupportedScheme(String),
  #[error("服务返回错误 {status}: {message}")]
  Api { status: u16, message: String },
  #[error("图片数据无效: {0}")]
  InvalidImage(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct Health {
  pub status: String,
  pub model_loaded: bool,
  pub model_path: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BoundingBox {
  pub x1: f64,
  pub y1: f64,
  pub x2: f64,
  pub y2: f64,
  pub width: Option<f64>,
  pub height: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Detection {
  pub id: usize,
  pub class: String,
  pub confidence: f64,
  pub bbox: BoundingBox,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ImageSize {
  pub width: u32,
  pub height: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DetectResponse {
  pub count: usize,
  pub detections: Vec<Detection>,
  pub image_size: ImageSize,
  pub image_base64: Option<String>,
}

impl DetectResponse {
  /// 只保留指定类别
  pub fn of_class<'a>(&'a self, class: &'a str) -> impl Iterator<Item = &'a Detection> + 'a {
    self.detections.iter().filter(move |d| d.class == class)
  }

  /// 各类别的目标数
  pub fn class_counts(&self) -> BTreeMap<&str, usize> {
    let mut counts = BTreeMap::new();
    for detection in &self.detections {
      *counts.entry(detection.class.as_str()).or_insert(0) += 1;
    }
    counts
  }

  /// 解码 `return_image` 时附带的标注图片
  pub fn annotated_image(&self) -> Result<Option<Vec<u8>>, ClientError> {
    self
      .image_base64
      .as_deref()
      .map(|data| {
        STANDARD
          .decode(data)
          .map_err(|e| ClientError::InvalidImage(e.to_string()))
      })
      .transpose()
  }
}

/// 批量检测中一张图片的结果，失败时只有 `error`
#[derive(Debug, Clone, Deserialize)]
pub struct BatchItem {
  pub image_index: usize,
  pub image_name: Option<String>,
  pub count: Option<usize>,
  #[serde(default)]
  pub detections: Vec<Detection>,
  pub error: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BatchResponse {
  pub total_images: usize,
  pub results: Vec<BatchItem>,
}

impl BatchResponse {
  pub fn total_detections(&self) -> usize {
    self.results.iter().filter_map(|r| r.count).sum()
  }
}

#[derive(Debug, Clone, Copy)]
pub struct DetectOptions {
  pub confidence: f32,
  pub iou: f32,
  pub return_image: bool,
}

impl Default for DetectOptions {
  fn default() -> Self {
    Self {
      confidence: 0.25,
      iou: 0.45,
      return_image: false,
    }
  }
}

/// `kuangxuan-api` 的 HTTP 客户端
#[derive(Debug, Clone)]
pub struct ApiClient {
  base: Url,
  http: Client,
}

impl FromUrlWithScheme for ApiClient {
  const SCHEME: &'static str = "http";
}

impl FromUrl for ApiClient {
  type Error = ClientError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(ClientError::UnsupportedScheme(url.scheme().to_string()));
    }
    if url.cannot_be_a_base() || url.host().is_none() {
      return Err(ClientError::InvalidUrl(url.to_string()));
    }
    Ok(Self {
      base: url.clone(),
      http: Client::new(),
    })
  }
}

impl ApiClient {
  pub fn new(base: &str) -> Result<Self, ClientError> {
    let url = Url::parse(base).map_err(|e| ClientError::InvalidUrl(format!("{}: {}", base, e)))?;
    Self::from_url(&url)
  }

  fn endpoint(&self, path: &str) -> Result<Url, ClientError> {
    self
      .base
      .join(path)
      .map_err(|e| ClientError::InvalidUrl(format!("{}: {}", path, e)))
  }

  /// 非 2xx 响应转为错误，优先取 JSON 中的 `error`
  async fn check(response: Response) -> Result<Response, ClientError> {
    let status = response.status();
    if status.is_success() {
      return Ok(response);
    }
    let body = response.text().await?;
    let message = serde_json::from_str::<Value>(&body)
      .ok()
      .and_then(|v| v.get("error").and_then(Value::as_str).map(str::to_string))
      .unwrap_or(body);
    Err(ClientError::Api {
      status: status.as_u16(),
      message,
    })
  }

  async fn image_part(path: &Path) -> Result<Part, ClientError> {
    let bytes = tokio::fs::read(path).await?;
    let name = path
      .file_name()
      .map(|n| n.to_string_lossy().into_owned())
      .unwrap_or_else(|| "image.jpg".to_string());
    Ok(Part::bytes(bytes).file_name(name))
  }

  pub async fn health(&self) -> Result<Health, ClientError> {
    let response = self.http.get(self.endpoint("health")?).send().await?;
    Ok(Self::check(response).await?.json().await?)
  }

  pub async fn detect(
    &self,
    image: impl AsRef<Path>,
    options: DetectOptions,
  ) -> Result<DetectResponse, ClientError> {
    let form = Form::new()
      .part("image", Self::image_part(image.as_ref()).await?)
      .text("conf_threshold", options.confidence.to_string())
      .text("iou_threshold", options.iou.to_string())
      .text("return_image", options.return_image.to_string());
    debug!("检测图片: {}", image.as_ref().display());
    let response = self
      .http
      .post(self.endpoint("detect")?)
      .multipart(form)
      .send()
      .await?;
    Ok(Self::check(response).await?.json().await?)
  }

  pub async fn detect_batch(
    &self,
    images: &[PathBuf],
    confidence: f32,
  ) -> Result<BatchResponse, ClientError> {
    let mut form = Form::new().text("conf_threshold", confidence.to_string());
    for image in images {
      form = form.part("images", Self::image_part(image).await?);
    }
    let response = self
      .http
      .post(self.endpoint("detect_batch")?)
      .multipart(form)
      .send()
      .await?;
    Ok(Self::check(response).await?.json().await?)
  }

  /// 返回绘制了检测框的 JPEG
  pub async fn detect_image(&self, image: impl AsRef<Path>) -> Result<Vec<u8>, ClientError> {
    let form = Form::new().part("image", Self::image_part(image.as_ref()).await?);
    let response = self
      .http
      .post(self.endpoint("detect_image")?)
      .multipart(form)
      .send()
      .await?;
    Ok(Self::check(response).await?.bytes().await?.to_vec())
  }

  pub async fn load_model(&self, name: &str) -> Result<String, ClientError> {
    let form = Form::new().text("model_name", name.to_string());
    let response = self
      .http
      .post(self.endpoint("load_model")?)
      .multipart(form)
      .send()
      .await?;
    let body: Value = Self::check(response).await?.json().await?;
    Ok(
      body
        .get("current_model")
        .and_then(Value::as_str)
        .unwrap_or(name)
        .to_string(),
    )
  }
}

// 该文件是 Kuangxuan （框选） 项目的一部分。
// src/model.rs - 检测模型接口
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
  path::{Path, PathBuf},
  sync::Arc,
};

use image::RgbImage;
use serde::Serialize;
use thiserror::Error;
use url::Url;

use crate::{FromUrl, FromUrlWithScheme};

#[cfg(feature = "onnx")]
mod onnx;
#[cfg(feature = "onnx")]
pub use self::onnx::{OnnxDetector, OnnxLoader};

#[derive(Error, Debug)]
pub enum ModelError {
  #[error("模型引用无效: {0}")]
  InvalidReference(String),
  #[error("不支持的模型方案: {0}")]
  UnsupportedScheme(String),
  #[error("模型文件不存在: {0}")]
  NotFound(String),
  #[error("模型未加载")]
  NotLoaded,
  #[error("推理后端错误: {0}")]
  Backend(String),
  #[error("模型输出格式错误: {0}")]
  InvalidOutput(String),
}

/// 置信度与 NMS IoU 阈值
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Thresholds {
  pub confidence: f32,
  pub iou: f32,
}

impl Default for Thresholds {
  fn default() -> Self {
    Self {
      confidence: 0.25,
      iou: 0.45,
    }
  }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DetectItem {
  pub class_id: u32,
  pub class_name: String,
  pub score: f32,
  pub bbox: [f32; 4], // 原图像素坐标 [x_min, y_min, x_max, y_max]
}

impl DetectItem {
  pub fn width(&self) -> f32 {
    self.bbox[2] - self.bbox[0]
  }

  pub fn height(&self) -> f32 {
    self.bbox[3] - self.bbox[1]
  }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DetectResult {
  pub items: Box<[DetectItem]>,
}

pub trait Detector: Send + Sync {
  fn detect(&self, image: &RgbImage, thresholds: Thresholds) -> Result<DetectResult, ModelError>;
}

pub trait DetectorLoader: Send + Sync {
  fn load(&self, model: &ModelRef) -> Result<Arc<dyn Detector>, ModelError>;
}

/// 创建默认推理后端的加载器
pub fn default_loader() -> Result<Arc<dyn DetectorLoader>, ModelError> {
  #[cfg(feature = "onnx")]
  {
    Ok(Arc::new(OnnxLoader::new()?))
  }
  #[cfg(not(feature = "onnx"))]
  {
    Err(ModelError::Backend("未启用 onnx 特性，没有可用的推理后端".to_string()))
  }
}

/// 模型引用
///
/// 支持三种写法：
/// - `onnx:///path/to/model.onnx`
/// - 带路径的文件名，如 `runs/best.onnx`
/// - 裸模型名，如 `yolov8n` 或 `yolov8n.pt`，在权重目录中查找同名 `.onnx`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelRef {
  pub name: String,
  pub path: PathBuf,
}

const ONNX_SCHEME: &str = "onnx";
const ONNX_EXTENSION: &str = "onnx";

impl FromUrlWithScheme for ModelRef {
  const SCHEME: &'static str = ONNX_SCHEME;
}

impl FromUrl for ModelRef {
  type Error = ModelError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(ModelError::UnsupportedScheme(url.scheme().to_string()));
    }
    let path = urlencoding::decode(url.path())
      .map_err(|e| ModelError::InvalidReference(format!("{}: {}", url, e)))?;
    if path.is_empty() || path == "/" {
      return Err(ModelError::InvalidReference(url.to_string()));
    }
    Ok(ModelRef {
      name: url.to_string(),
      path: PathBuf::from(path.as_ref()),
    })
  }
}

impl ModelRef {
  pub fn resolve(spec: &str, weights_dir: &Path) -> Result<Self, ModelError> {
    let spec = spec.trim();
    if spec.is_empty() {
      return Err(ModelError::InvalidReference("模型名称为空".to_string()));
    }

    // 单字母方案视为 Windows 盘符
    if let Ok(url) = Url::parse(spec)
      && url.scheme().len() > 1
    {
      return Self::from_url(&url);
    }

    let given = Path::new(spec);
    let path = if given.components().count() > 1 {
      given.with_extension(ONNX_EXTENSION)
    } else {
      let stem = given
        .file_stem()
        .and_then(|s| s.to_str())
        .ok_or_else(|| ModelError::InvalidReference(spec.to_string()))?;
      weights_dir.join(format!("{stem}.{ONNX_EXTENSION}"))
    };

    Ok(ModelRef {
      name: spec.to_string(),
      path,
    })
  }
}

/// 预训练模型目录条目
#[derive(Debug, Clone, Serialize)]
pub struct PretrainedModel {
  pub name: &'static str,
  pub size: &'static str,
  #[serde(rename = "mAP")]
  pub map: &'static str,
  pub speed: &'static str,
  pub description: &'static str,
}

pub const PRETRAINED_MODELS: [PretrainedModel; 5] = [
  PretrainedModel {
    name: "yolov8n.pt",
    size: "6MB",
    map: "37.3",
    speed: "最快",
    description: "纳米版，适合边缘设备",
  },
  PretrainedModel {
    name: "yolov8s.pt",
    size: "22MB",
    map: "44.9",
    speed: "快",
    description: "小型版，平衡速度和精度",
  },
  PretrainedModel {
    name: "yolov8m.pt",
    size: "52MB",
    map: "50.2",
    speed: "中等",
    description: "中型版，服务器部署",
  },
  PretrainedModel {
    name: "yolov8l.pt",
    size: "87MB",
    map: "52.9",
    speed: "慢",
    description: "大型版，高精度",
  },
  PretrainedModel {
    name: "yolov8x.pt",
    size: "136MB",
    map: "53.9",
    speed: "最慢",
    description: "超大版，最高精度",
  },
];

/// 计算两个 xyxy 边界框的 IoU
pub fn iou(a: &[f32; 4], b: &[f32; 4]) -> f32 {
  let x1 = a[0].max(b[0]);
  let y1 = a[1].max(b[1]);
  let x2 = a[2].min(b[2]);
  let y2 = a[3].min(b[3]);

  let intersection = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
  let area_a = (a[2] - a[0]) * (a[3] - a[1]);
  let area_b = (b[2] - b[0]) * (b[3] - b[1]);
  let union = area_a + area_b - intersection;

  if union > 0.0 {
    intersection / union
  } else {
    0.0
  }
}

/// 按类别的非极大值抑制，结果按置信度降序
pub fn non_max_suppression(mut items: Vec<DetectItem>, iou_threshold: f32) -> Vec<DetectItem> {
  items.sort_by(|a, b| b.score.total_cmp(&a.score));

  let mut result: Vec<DetectItem> = Vec::new();
  for item in items {
    let suppressed = result
      .iter()
      .any(|kept| kept.class_id == item.class_id && iou(&kept.bbox, &item.bbox) > iou_threshold);
    if !suppressed {
      result.push(item);
    }
  }
  result
}

#[cfg(test)]
mod tests {
  use super::*;

  fn item(class_id: u32, score: f32, bbox: [f32; 4]) -> DetectItem {
    DetectItem {
      class_id,
      class_name: format!("class_{class_id}"),
      score,
      bbox,
    }
  }

  #[test]
  fn nms_keeps_best_of_overlapping_same_class() {
    let items = vec![
      item(0, 0.6, [0.0, 0.0, 100.0, 100.0]),
      item(0, 0.9, [5.0, 5.0, 105.0, 105.0]),
      item(1, 0.5, [0.0, 0.0, 100.0, 100.0]),
      item(0, 0.4, [300.0, 300.0, 350.0, 350.0]),
    ];
    let kept = non_max_suppression(items, 0.45);
    let scores: Vec<f32> = kept.iter().map(|i| i.score).collect();
    assert_eq!(scores, vec![0.9, 0.5, 0.4]);
  }

  #[test]
  fn iou_of_disjoint_and_identical_boxes() {
    let a = [0.0, 0.0, 10.0, 10.0];
    assert_eq!(iou(&a, &[20.0, 20.0, 30.0, 30.0]), 0.0);
    assert!((iou(&a, &a) - 1.0).abs() < f32::EPSILON);
  }

  #[test]
  fn model_refs_resolve_against_weights_dir() {
    let weights = Path::new("/srv/weights");
    let bare = ModelRef::resolve("yolov8s.pt", weights).unwrap();
    assert_eq!(bare.path, Path::new("/srv/weights/yolov8s.onnx"));
    assert_eq!(bare.name, "yolov8s.pt");

    let nested = ModelRef::resolve("runs/custom/best.pt", weights).unwrap();
    assert_eq!(nested.path, Path::new("runs/custom/best.onnx"));

    let url = ModelRef::resolve("onnx:///opt/models/my%20model.onnx", weights).unwrap();
    assert_eq!(url.path, Path::new("/opt/models/my model.onnx"));

    assert!(matches!(
      ModelRef::resolve("rknn:///x.rknn", weights),
      Err(ModelError::UnsupportedScheme(_))
    ));
    assert!(ModelRef::resolve("  ", weights).is_err());
  }
}

// 该文件是 Kuangxuan （框选） 项目的一部分。
// src/annotation.rs - 画布标注与 YOLO 标签格式转换
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

use std::{fmt, fs, path::Path, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum AnnotationError {
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("画布尺寸无效: {width}x{height}")]
  InvalidCanvas { width: f64, height: f64 },
  #[error("类别 ID 越界: {class_id}，当前共有 {classes} 个类别")]
  ClassOutOfRange { class_id: usize, classes: usize },
  #[error("第 {line} 行标签格式错误: {content}")]
  MalformedLine { line: usize, content: String },
}

/// 浏览器画布上绘制的矩形，单位为画布像素
///
/// 宽高可以为负，表示从右下往左上拖动。
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CanvasBox {
  #[serde(rename = "classId")]
  pub class_id: usize,
  pub x: f64,
  pub y: f64,
  pub width: f64,
  pub height: f64,
}

/// 画布显示尺寸
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CanvasSize {
  pub width: f64,
  pub height: f64,
}

impl CanvasSize {
  pub fn new(width: f64, height: f64) -> Result<Self, AnnotationError> {
    if !(width.is_finite() && height.is_finite() && width > 0.0 && height > 0.0) {
      return Err(AnnotationError::InvalidCanvas { width, height });
    }
    Ok(Self { width, height })
  }

  /// 画布宽高比与图片宽高比的相对偏差
  pub fn aspect_deviation(&self, image_width: u32, image_height: u32) -> f64 {
    if image_width == 0 || image_height == 0 {
      return f64::INFINITY;
    }
    let canvas = self.width / self.height;
    let image = image_width as f64 / image_height as f64;
    ((canvas - image) / image).abs()
  }
}

/// 一行 YOLO 标签：类别 ID 与归一化的中心点、宽、高
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct YoloLabel {
  pub class_id: usize,
  pub x_center: f64,
  pub y_center: f64,
  pub width: f64,
  pub height: f64,
}

impl CanvasBox {
  /// 转换为归一化标签，面积为零的框返回 `None`
  ///
  /// 归一化以画布尺寸为基准。画布是原图的等比缩放，
  /// 因此结果同样适用于原图。
  pub fn to_label(&self, canvas: CanvasSize) -> Option<YoloLabel> {
    let (x0, x1) = ordered(self.x, self.x + self.width);
    let (y0, y1) = ordered(self.y, self.y + self.height);
    let x0 = x0.clamp(0.0, canvas.width);
    let x1 = x1.clamp(0.0, canvas.width);
    let y0 = y0.clamp(0.0, canvas.height);
    let y1 = y1.clamp(0.0, canvas.height);

    let (w, h) = (x1 - x0, y1 - y0);
    if !(w > 0.0 && h > 0.0) {
      return None;
    }

    Some(YoloLabel {
      class_id: self.class_id,
      x_center: ((x0 + w / 2.0) / canvas.width).clamp(0.0, 1.0),
      y_center: ((y0 + h / 2.0) / canvas.height).clamp(0.0, 1.0),
      width: (w / canvas.width).clamp(0.0, 1.0),
      height: (h / canvas.height).clamp(0.0, 1.0),
    })
  }
}

impl YoloLabel {
  /// 投影回画布像素，供标注界面重新显示
  pub fn to_canvas(&self, canvas: CanvasSize) -> CanvasBox {
    let width = self.width * canvas.width;
    let height = self.height * canvas.height;
    CanvasBox {
      class_id: self.class_id,
      x: self.x_center * canvas.width - width / 2.0,
      y: self.y_center * canvas.height - height / 2.0,
      width,
      height,
    }
  }
}

impl fmt::Display for YoloLabel {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(
      f,
      "{} {:.6} {:.6} {:.6} {:.6}",
      self.class_id, self.x_center, self.y_center, self.width, self.height
    )
  }
}

impl FromStr for YoloLabel {
  type Err = ();

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let fields: Vec<&str> = s.split_whitespace().collect();
    let [class_id, x, y, w, h] = fields.as_slice() else {
      return Err(());
    };
    let number = |v: &str| v.parse::<f64>().map_err(|_| ());
    Ok(YoloLabel {
      class_id: class_id.parse().map_err(|_| ())?,
      x_center: number(x)?,
      y_center: number(y)?,
      width: number(w)?,
      height: number(h)?,
    })
  }
}

fn ordered(a: f64, b: f64) -> (f64, f64) {
  if a <= b { (a, b) } else { (b, a) }
}

/// 校验并转换一张图片的全部标注
pub fn convert_annotations(
  boxes: &[CanvasBox],
  canvas: CanvasSize,
  num_classes: usize,
) -> Result<Vec<YoloLabel>, AnnotationError> {
  if let Some(bad) = boxes.iter().find(|b| b.class_id >= num_classes) {
    return Err(AnnotationError::ClassOutOfRange {
      class_id: bad.class_id,
      classes: num_classes,
    });
  }

  let labels: Vec<YoloLabel> = boxes.iter().filter_map(|b| b.to_label(canvas)).collect();
  if labels.len() != boxes.len() {
    debug!("丢弃 {} 个面积为零的标注框", boxes.len() - labels.len());
  }
  Ok(labels)
}

pub fn write_label_file(path: impl AsRef<Path>, labels: &[YoloLabel]) -> Result<(), AnnotationError> {
  let mut content = String::new();
  for label in labels {
    content.push_str(&label.to_string());
    content.push('\n');
  }
  fs::write(path, content)?;
  Ok(())
}

pub fn read_label_file(path: impl AsRef<Path>) -> Result<Vec<YoloLabel>, AnnotationError> {
  let text = fs::read_to_string(path)?;
  text
    .lines()
    .enumerate()
    .filter(|(_, line)| !line.trim().is_empty())
    .map(|(i, line)| {
      line.parse().map_err(|_| AnnotationError::MalformedLine {
        line: i + 1,
        content: line.to_string(),
      })
    })
    .collect()
}

// 该文件是 Kuangxuan （框选） 项目的一部分。
// src/model/onnx.rs - ONNX Runtime 推理后端
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
  collections::HashMap,
  sync::{Arc, Mutex},
};

use image::{
  RgbImage,
  imageops::{self, FilterType},
};
use ndarray::{Array, ArrayViewD, CowArray, IxDyn};
use ort::{Environment, Session, SessionBuilder, Value};
use tracing::{debug, info};

use super::{
  DetectItem, DetectResult, Detector, DetectorLoader, ModelError, ModelRef, Thresholds,
  non_max_suppression,
};

const DEFAULT_INPUT_SIZE: u32 = 640;
const BOX_CHANNELS: usize = 4;

fn backend(err: ort::OrtError) -> ModelError {
  ModelError::Backend(err.to_string())
}

pub struct OnnxLoader {
  environment: Arc<Environment>,
}

impl OnnxLoader {
  pub fn new() -> Result<Self, ModelError> {
    let environment = Environment::builder()
      .with_name("kuangxuan")
      .build()
      .map_err(backend)?;
    Ok(Self {
      environment: Arc::new(environment),
    })
  }
}

impl DetectorLoader for OnnxLoader {
  fn load(&self, model: &ModelRef) -> Result<Arc<dyn Detector>, ModelError> {
    Ok(Arc::new(OnnxDetector::new(&self.environment, model)?))
  }
}

/// YOLOv8 检测模型的 ONNX 导出
///
/// 输入 `[1, 3, H, W]`，输出 `[1, 4 + nc, N]`，类别名称取自模型元数据 `names`。
pub struct OnnxDetector {
  session: Mutex<Session>,
  names: HashMap<u32, String>,
  input_width: u32,
  input_height: u32,
}

impl OnnxDetector {
  pub fn new(environment: &Arc<Environment>, model: &ModelRef) -> Result<Self, ModelError> {
    if !model.path.is_file() {
      return Err(ModelError::NotFound(model.path.display().to_string()));
    }

    info!("加载模型文件: {}", model.path.display());
    let session = SessionBuilder::new(environment)
      .map_err(backend)?
      .with_model_from_file(&model.path)
      .map_err(backend)?;

    let names = {
      let metadata = session.metadata().map_err(backend)?;
      metadata
        .custom("names")
        .map_err(backend)?
        .map(|raw| parse_names(&raw))
        .unwrap_or_default()
    };

    let dims: Vec<Option<usize>> = session
      .inputs
      .first()
      .ok_or_else(|| ModelError::InvalidOutput("模型没有输入".to_string()))?
      .dimensions()
      .collect();
    if dims.len() != 4 {
      return Err(ModelError::InvalidOutput(format!(
        "预期输入为 4 维，实际为 {} 维",
        dims.len()
      )));
    }
    if session.outputs.is_empty() {
      return Err(ModelError::InvalidOutput("模型没有输出".to_string()));
    }

    let input_height = dims[2].map(|v| v as u32).unwrap_or(DEFAULT_INPUT_SIZE);
    let input_width = dims[3].map(|v| v as u32).unwrap_or(DEFAULT_INPUT_SIZE);
    info!(
      "模型加载完成: 输入 {}x{}, {} 个类别",
      input_width,
      input_height,
      names.len()
    );

    Ok(Self {
      session: Mutex::new(session),
      names,
      input_width,
      input_height,
    })
  }

  fn preprocess<'a>(&self, image: &RgbImage) -> CowArray<'a, f32, IxDyn> {
    let resized = imageops::resize(
      image,
      self.input_width,
      self.input_height,
      FilterType::Triangle,
    );

    let mut input = Array::<f32, _>::zeros((
      1,
      3,
      self.input_height as usize,
      self.input_width as usize,
    ))
    .into_dyn();
    for (x, y, pixel) in resized.enumerate_pixels() {
      for c in 0..3 {
        input[[0, c, y as usize, x as usize]] = pixel[c] as f32 / 255.0;
      }
    }
    CowArray::from(input)
  }

  fn decode(
    &self,
    output: &ArrayViewD<f32>,
    confidence: f32,
    image_width: u32,
    image_height: u32,
  ) -> Result<Vec<DetectItem>, ModelError> {
    let shape = output.shape();
    if shape.len() != 3 || shape[0] == 0 {
      return Err(ModelError::InvalidOutput(format!("输出形状 {:?}", shape)));
    }

    // 标准导出为 [1, 4 + nc, N]，部分导出会转置为 [1, N, 4 + nc]
    let transposed = shape[1] > shape[2];
    let (channels, anchors) = if transposed {
      (shape[2], shape[1])
    } else {
      (shape[1], shape[2])
    };
    if channels <= BOX_CHANNELS {
      return Err(ModelError::InvalidOutput(format!("输出形状 {:?}", shape)));
    }
    let at = |c: usize, i: usize| {
      if transposed {
        output[[0, i, c]]
      } else {
        output[[0, c, i]]
      }
    };

    let scale_x = image_width as f32 / self.input_width as f32;
    let scale_y = image_height as f32 / self.input_height as f32;
    let (max_x, max_y) = (image_width as f32, image_height as f32);

    let mut items = Vec::new();
    for i in 0..anchors {
      let (class_id, score) = (BOX_CHANNELS..channels)
        .map(|c| (c - BOX_CHANNELS, at(c, i)))
        .fold((0usize, f32::MIN), |best, cur| {
          if cur.1 > best.1 { cur } else { best }
        });
      if score < confidence {
        continue;
      }

      let (cx, cy, w, h) = (at(0, i), at(1, i), at(2, i), at(3, i));
      let bbox = [
        ((cx - w / 2.0) * scale_x).clamp(0.0, max_x),
        ((cy - h / 2.0) * scale_y).clamp(0.0, max_y),
        ((cx + w / 2.0) * scale_x).clamp(0.0, max_x),
        ((cy + h / 2.0) * scale_y).clamp(0.0, max_y),
      ];

      let class_id = class_id as u32;
      items.push(DetectItem {
        class_id,
        class_name: self
          .names
          .get(&class_id)
          .cloned()
          .unwrap_or_else(|| format!("class_{class_id}")),
        score,
        bbox,
      });
    }
    Ok(items)
  }
}

impl Detector for OnnxDetector {
  fn detect(&self, image: &RgbImage, thresholds: Thresholds) -> Result<DetectResult, ModelError> {
    let (width, height) = image.dimensions();
    let input = self.preprocess(image);

    let session = self
      .session
      .lock()
      .map_err(|_| ModelError::Backend("推理会话锁已损坏".to_string()))?;
    let tensor = Value::from_array(session.allocator(), &input).map_err(backend)?;
    let outputs = session.run(vec![tensor]).map_err(backend)?;
    let output = outputs
      .first()
      .ok_or_else(|| ModelError::InvalidOutput("模型没有输出".to_string()))?
      .try_extract::<f32>()
      .map_err(backend)?;

    let candidates = self.decode(&output.view(), thresholds.confidence, width, height)?;
    debug!("候选框 {} 个", candidates.len());
    let items = non_max_suppression(candidates, thresholds.iou);
    debug!("NMS 后保留 {} 个", items.len());

    Ok(DetectResult {
      items: items.into_boxed_slice(),
    })
  }
}

/// 解析 YOLOv8 导出的 `names` 元数据
///
/// 形如 `{0: 'person', 1: 'bicycle', 2: 'traffic, light'}`。
fn parse_names(raw: &str) -> HashMap<u32, String> {
  let body = raw.trim().trim_start_matches('{').trim_end_matches('}');
  let mut names = HashMap::new();
  let mut last: Option<u32> = None;

  for piece in body.split(", ") {
    let parsed = piece
      .split_once(": ")
      .and_then(|(id, name)| id.trim().parse::<u32>().ok().map(|id| (id, name)));
    match (parsed, last) {
      (Some((id, name)), _) => {
        names.insert(id, strip_quotes(name));
        last = Some(id);
      }
      // 名称内部含有 ", " 时拼接回上一个条目
      (None, Some(id)) => {
        if let Some(name) = names.get_mut(&id) {
          name.push_str(", ");
          name.push_str(&strip_quotes(piece));
        }
      }
      (None, None) => {}
    }
  }
  names
}

fn strip_quotes(s: &str) -> String {
  s.trim().trim_matches(|c| c == '\'' || c == '"').to_string()
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn parses_names_metadata() {
    let names = parse_names("{0: 'person', 1: \"traffic light\", 2: 'a, b'}");
    assert_eq!(names.get(&0).map(String::as_str), Some("person"));
    assert_eq!(names.get(&1).map(String::as_str), Some("traffic light"));
    assert_eq!(names.get(&2).map(String::as_str), Some("a, b"));
  }
}

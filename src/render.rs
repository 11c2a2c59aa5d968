// 该文件是 Kuangxuan （框选） 项目的一部分。
// src/render.rs - 目标检测结果可视化与图像编解码
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

use std::{io::Cursor, path::Path};

use ab_glyph::{FontVec, PxScale};
use base64::{Engine, engine::general_purpose::STANDARD};
use image::{ImageReader, Rgb, RgbImage, codecs::jpeg::JpegEncoder};
use imageproc::{
  drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut, text_size},
  rect::Rect,
};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::model::{DetectItem, DetectResult};

// 文本渲染常量
const LABEL_FONT_SIZE: f32 = 20.0;
const LABEL_TEXT_VERTICAL_PADDING: i32 = 2;
const BOX_THICKNESS: i32 = 2;
const JPEG_QUALITY: u8 = 90;

/// 常见系统字体，按顺序尝试，优先可显示中文的字体
const FONT_CANDIDATES: [&str; 8] = [
  "/usr/share/fonts/opentype/noto/NotoSansCJK-Regular.ttc",
  "/usr/share/fonts/noto-cjk/NotoSansCJK-Regular.ttc",
  "/usr/share/fonts/truetype/wqy/wqy-microhei.ttc",
  "/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf",
  "/usr/share/fonts/TTF/DejaVuSans.ttf",
  "/System/Library/Fonts/PingFang.ttc",
  "/Library/Fonts/Arial Unicode.ttf",
  "C:\\Windows\\Fonts\\msyh.ttc",
];

// 与常见检测可视化一致的调色板
const PALETTE: [[u8; 3]; 10] = [
  [255, 56, 56],
  [255, 157, 151],
  [255, 112, 31],
  [255, 178, 29],
  [207, 210, 49],
  [72, 249, 10],
  [26, 147, 52],
  [0, 212, 187],
  [0, 194, 255],
  [52, 69, 147],
];

#[derive(Error, Debug)]
pub enum RenderError {
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("图像错误: {0}")]
  ImageError(#[from] image::ImageError),
  #[error("字体无效: {0}")]
  InvalidFont(String),
}

pub fn palette_color(class_id: u32) -> [u8; 3] {
  PALETTE[class_id as usize % PALETTE.len()]
}

pub struct Draw {
  font: Option<FontVec>,
  font_size: f32,
  label_text_vertical_padding: i32,
  thickness: i32,
}

impl Default for Draw {
  fn default() -> Self {
    Self::new(None)
  }
}

impl Draw {
  pub fn new(font: Option<FontVec>) -> Self {
    Self {
      font,
      font_size: LABEL_FONT_SIZE,
      label_text_vertical_padding: LABEL_TEXT_VERTICAL_PADDING,
      thickness: BOX_THICKNESS,
    }
  }

  pub fn with_font_file(path: impl AsRef<Path>) -> Result<Self, RenderError> {
    let data = std::fs::read(path.as_ref())?;
    let font = FontVec::try_from_vec_and_index(data, 0)
      .map_err(|e| RenderError::InvalidFont(format!("{}: {}", path.as_ref().display(), e)))?;
    Ok(Self::new(Some(font)))
  }

  /// 使用指定字体，未指定时在系统字体中查找；都找不到时只画框
  pub fn discover(font: Option<&Path>) -> Self {
    if let Some(path) = font {
      match Self::with_font_file(path) {
        Ok(draw) => {
          info!("使用字体: {}", path.display());
          return draw;
        }
        Err(e) => warn!("无法加载字体 {}: {}", path.display(), e),
      }
    }

    for candidate in FONT_CANDIDATES {
      let path = Path::new(candidate);
      if !path.is_file() {
        continue;
      }
      if let Ok(draw) = Self::with_font_file(path) {
        info!("使用字体: {}", candidate);
        return draw;
      }
    }

    warn!("未找到可用字体，检测结果只绘制边框");
    Self::new(None)
  }

  pub fn has_font(&self) -> bool {
    self.font.is_some()
  }

  pub fn draw_detections(&self, image: &mut RgbImage, result: &DetectResult) {
    for item in result.items.iter() {
      self.draw_bbox_with_label(image, item);
    }
    debug!("绘制 {} 个检测框", result.items.len());
  }

  fn draw_bbox_with_label(&self, image: &mut RgbImage, item: &DetectItem) {
    let (w, h) = (image.width() as i32, image.height() as i32);
    if w == 0 || h == 0 {
      return;
    }

    let x_min = (item.bbox[0].floor() as i32).clamp(0, w - 1);
    let y_min = (item.bbox[1].floor() as i32).clamp(0, h - 1);
    let x_max = (item.bbox[2].ceil() as i32).clamp(0, w - 1);
    let y_max = (item.bbox[3].ceil() as i32).clamp(0, h - 1);
    if x_min >= x_max || y_min >= y_max {
      return;
    }

    let color = Rgb(palette_color(item.class_id));
    for t in 0..self.thickness {
      let width = x_max - x_min - 2 * t;
      let height = y_max - y_min - 2 * t;
      if width <= 0 || height <= 0 {
        break;
      }
      let rect = Rect::at(x_min + t, y_min + t).of_size(width as u32, height as u32);
      draw_hollow_rect_mut(image, rect, color);
    }

    let Some(font) = &self.font else {
      return;
    };

    let label = format!("{} {:.2}", item.class_name, item.score);
    let scale = PxScale::from(self.font_size);
    let (text_width, text_height) = text_size(scale, font, &label);
    let label_height = text_height as i32 + 2 * self.label_text_vertical_padding;

    // 标签放在边框上方，空间不足时放在框内
    let label_x = x_min;
    let label_y = if y_min - label_height >= 0 {
      y_min - label_height
    } else {
      y_min
    };
    let label_width = (text_width as i32 + 4).min(w - label_x);
    if label_width <= 0 || label_height <= 0 {
      return;
    }

    let background = Rect::at(label_x, label_y).of_size(label_width as u32, label_height as u32);
    draw_filled_rect_mut(image, background, color);
    draw_text_mut(
      image,
      Rgb([255u8, 255u8, 255u8]),
      label_x + 2,
      label_y + self.label_text_vertical_padding,
      scale,
      font,
      &label,
    );
  }
}

pub fn decode_image(bytes: &[u8]) -> Result<RgbImage, RenderError> {
  let image = ImageReader::new(Cursor::new(bytes))
    .with_guessed_format()?
    .decode()?;
  Ok(image.to_rgb8())
}

/// 只读取图片头部获得尺寸
pub fn image_dimensions(bytes: &[u8]) -> Result<(u32, u32), RenderError> {
  Ok(
    ImageReader::new(Cursor::new(bytes))
      .with_guessed_format()?
      .into_dimensions()?,
  )
}

pub fn encode_jpeg(image: &RgbImage) -> Result<Vec<u8>, RenderError> {
  let mut buffer = Vec::new();
  JpegEncoder::new_with_quality(&mut buffer, JPEG_QUALITY).encode_image(image)?;
  Ok(buffer)
}

pub fn encode_base64(bytes: &[u8]) -> String {
  STANDARD.encode(bytes)
}

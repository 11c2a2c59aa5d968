// 该文件是 Kuangxuan （框选） 项目的一部分。
// src/config.rs - 命令行参数配置
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
  net::{IpAddr, SocketAddr},
  path::PathBuf,
};

use clap::Args;

use crate::{model::Thresholds, workspace::DEFAULT_WORKSPACE};

/// 各服务共用的监听与工作目录参数
#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
  /// 监听地址
  #[arg(long, default_value = "0.0.0.0", value_name = "ADDR")]
  pub host: IpAddr,

  /// 监听端口（不指定时使用各服务的默认端口）
  #[arg(long, value_name = "PORT")]
  pub port: Option<u16>,

  /// 工作目录，保存数据集、类别、模型权重
  #[arg(long, default_value = DEFAULT_WORKSPACE, value_name = "DIR")]
  pub workspace: PathBuf,

  /// 标签字体文件（TTF/OTF/TTC），不指定时在系统字体中查找
  #[arg(long, value_name = "FILE")]
  pub font: Option<PathBuf>,

  /// 上传大小上限（MB）
  #[arg(long, value_name = "MB")]
  pub max_upload_mb: Option<usize>,
}

impl ServeArgs {
  pub fn socket_addr(&self, default_port: u16) -> SocketAddr {
    SocketAddr::new(self.host, self.port.unwrap_or(default_port))
  }

  /// 上传大小上限（字节）
  pub fn upload_limit(&self, default_mb: usize) -> usize {
    self.max_upload_mb.unwrap_or(default_mb) * 1024 * 1024
  }
}

/// 检测模型参数
#[derive(Args, Debug, Clone)]
pub struct ModelArgs {
  /// 默认模型：模型名（在 weights 目录中查找同名 .onnx）、文件路径或 onnx:// URL
  #[arg(long, default_value = "yolov8n.pt", value_name = "MODEL")]
  pub model: String,

  /// 默认置信度阈值 (0.0 - 1.0)
  #[arg(long, default_value = "0.25", value_name = "THRESHOLD")]
  pub confidence: f32,

  /// 默认 NMS IOU 阈值 (0.0 - 1.0)
  #[arg(long, default_value = "0.45", value_name = "THRESHOLD")]
  pub nms_threshold: f32,
}

impl ModelArgs {
  pub fn thresholds(&self) -> Thresholds {
    Thresholds {
      confidence: self.confidence,
      iou: self.nms_threshold,
    }
  }
}

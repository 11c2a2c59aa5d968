// 该文件是 Kuangxuan （框选） 项目的一部分。
// src/bin/client.rs - 检测 API 命令行客户端
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

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use kuangxuan::client::{ApiClient, DetectOptions};

/// 框选检测 API 客户端
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 服务地址
  #[arg(short, long, value_name = "URL", default_value = "http://localhost:8000")]
  pub server: String,

  #[command(subcommand)]
  pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
  /// 健康检查
  Health,
  /// 检测单张图片
  Detect {
    image: PathBuf,
    #[arg(long, default_value_t = 0.25)]
    conf: f32,
    #[arg(long, default_value_t = 0.45)]
    iou: f32,
    /// 只显示该类别
    #[arg(long, value_name = "NAME")]
    class: Option<String>,
    /// 保存服务端绘制的标注图片
    #[arg(long, value_name = "FILE")]
    save: Option<PathBuf>,
  },
  /// 批量检测
  Batch {
    #[arg(required = true)]
    images: Vec<PathBuf>,
    #[arg(long, default_value_t = 0.25)]
    conf: f32,
  },
  /// 获取标注后的图片
  Annotate {
    image: PathBuf,
    #[arg(short, long, default_value = "result.jpg")]
    output: PathBuf,
  },
  /// 加载模型
  Load { model: String },
}

#[tokio::main]
async fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();
  let client = ApiClient::new(&args.server)?;

  match args.command {
    Command::Health => {
      let health = client.health().await?;
      info!(
        "服务状态: {}, 模型已加载: {}, 模型路径: {}",
        health.status,
        health.model_loaded,
        health.model_path.as_deref().unwrap_or("-")
      );
    }
    Command::Detect {
      image,
      conf,
      iou,
      class,
      save,
    } => {
      let options = DetectOptions {
        confidence: conf,
        iou,
        return_image: save.is_some(),
      };
      let result = client.detect(&image, options).await?;
      info!(
        "{} ({}x{}): 检测到 {} 个物体",
        image.display(),
        result.image_size.width,
        result.image_size.height,
        result.count
      );
      let shown: Vec<_> = match &class {
        Some(class) => result.of_class(class).collect(),
        None => result.detections.iter().collect(),
      };
      for d in shown {
        info!(
          "  - {}: {:.2}% at ({:.1}, {:.1}, {:.1}, {:.1})",
          d.class,
          d.confidence * 100.0,
          d.bbox.x1,
          d.bbox.y1,
          d.bbox.x2,
          d.bbox.y2
        );
      }
      for (class, count) in result.class_counts() {
        info!("类别统计 {}: {}", class, count);
      }
      if let Some(path) = save {
        match result.annotated_image()? {
          Some(jpeg) => {
            std::fs::write(&path, jpeg)?;
            info!("标注图片已保存: {}", path.display());
          }
          None => warn!("服务未返回标注图片"),
        }
      }
    }
    Command::Batch { images, conf } => {
      let results = client.detect_batch(&images, conf).await?;
      info!(
        "总共处理 {} 张图片，检测到 {} 个物体",
        results.total_images,
        results.total_detections()
      );
      for item in &results.results {
        let name = item.image_name.as_deref().unwrap_or("-");
        match &item.error {
          Some(error) => warn!("{}: 检测失败: {}", name, error),
          None => info!("{}: {} 个物体", name, item.count.unwrap_or_default()),
        }
      }
    }
    Command::Annotate { image, output } => {
      let jpeg = client.detect_image(&image).await?;
      std::fs::write(&output, &jpeg)?;
      info!("标注图片已保存: {} ({} 字节)", output.display(), jpeg.len());
    }
    Command::Load { model } => {
      let current = client.load_model(&model).await?;
      info!("当前模型: {}", current);
    }
  }

  Ok(())
}

// 该文件是 Kuangxuan （框选） 项目的一部分。
// src/bin/studio.rs - 训练工作台
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

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::info;

use kuangxuan::{
  config::{ModelArgs, ServeArgs},
  launcher::{BROWSER_DELAY, browser_url, open_browser_later},
  model::default_loader,
  render::Draw,
  server::{self, AppState, DEFAULT_UPLOAD_MB, STUDIO_PORT, studio},
  train::YoloCliTrainer,
  workspace::Workspace,
};

/// 框选训练工作台：类别管理、数据标注、模型训练与测试
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  #[command(flatten)]
  pub serve: ServeArgs,

  #[command(flatten)]
  pub model: ModelArgs,

  /// 启动后自动打开浏览器
  #[arg(long)]
  pub open_browser: bool,

  /// Ultralytics 命令行程序
  #[arg(long, default_value = "yolo", value_name = "PROGRAM")]
  pub trainer_program: String,
}

#[tokio::main]
async fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();
  let addr = args.serve.socket_addr(STUDIO_PORT);

  info!("框选 YOLO 训练工作台");
  info!("工作目录: {}", args.serve.workspace.display());
  info!("训练程序: {}", args.trainer_program);

  let workspace = Workspace::open(&args.serve.workspace)?;
  let state = AppState::new(workspace, default_loader()?)?
    .with_trainer(Arc::new(YoloCliTrainer::new(args.trainer_program)))
    .with_draw(Draw::discover(args.serve.font.as_deref()))
    .with_default_model(args.model.model.clone())
    .with_thresholds(args.model.thresholds())
    .into_shared();

  let router = studio::router(state, args.serve.upload_limit(DEFAULT_UPLOAD_MB));

  if args.open_browser {
    open_browser_later(browser_url(addr), BROWSER_DELAY);
  }
  info!("请在浏览器访问: {}", browser_url(addr));
  server::serve(router, addr).await?;

  Ok(())
}

// 该文件是 Kuangxuan （框选） 项目的一部分。
// src/bin/api.rs - 目标检测 API 服务
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

use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};

use kuangxuan::{
  config::{ModelArgs, ServeArgs},
  model::default_loader,
  render::Draw,
  server::{self, API_PORT, AppState, DEFAULT_UPLOAD_MB, api},
  workspace::Workspace,
};

/// 框选目标检测 API
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  #[command(flatten)]
  pub serve: ServeArgs,

  #[command(flatten)]
  pub model: ModelArgs,
}

#[tokio::main]
async fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();
  let addr = args.serve.socket_addr(API_PORT);

  let workspace = Workspace::open(&args.serve.workspace)?;
  let state = AppState::new(workspace, default_loader()?)?
    .with_draw(Draw::discover(args.serve.font.as_deref()))
    .with_default_model(args.model.model.clone())
    .with_thresholds(args.model.thresholds())
    .into_shared();

  info!("正在加载默认模型: {}", args.model.model);
  if let Err(e) = state.load_model(&args.model.model).await {
    warn!("默认模型加载失败，检测接口将返回错误: {}", e.message());
  }

  let router = api::router(state, args.serve.upload_limit(DEFAULT_UPLOAD_MB));
  info!("测试命令: curl -X POST -F \"image=@test.jpg\" http://localhost:{}/detect", addr.port());
  server::serve(router, addr).await?;

  Ok(())
}

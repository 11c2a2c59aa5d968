// 该文件是 Kuangxuan （框选） 项目的一部分。
// src/bin/simple.rs - 单页检测应用
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
use tracing::info;

use kuangxuan::{
  config::{ModelArgs, ServeArgs},
  model::default_loader,
  render::Draw,
  server::{self, AppState, SIMPLE_PORT, SIMPLE_UPLOAD_MB, simple},
  workspace::Workspace,
};

/// 框选单页检测：上传图片，返回标注结果
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
  let addr = args.serve.socket_addr(SIMPLE_PORT);

  info!("模型: {}（首次检测时加载）", args.model.model);

  let workspace = Workspace::open(&args.serve.workspace)?;
  let state = AppState::new(workspace, default_loader()?)?
    .with_draw(Draw::discover(args.serve.font.as_deref()))
    .with_default_model(args.model.model.clone())
    .with_thresholds(args.model.thresholds())
    .into_shared();

  let router = simple::router(state, args.serve.upload_limit(SIMPLE_UPLOAD_MB));
  server::serve(router, addr).await?;

  Ok(())
}

// 该文件是 Kuangxuan （框选） 项目的一部分。
// src/launcher.rs - 启动后自动打开浏览器
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
  net::SocketAddr,
  process::{Command, Stdio},
  thread,
  time::Duration,
};

use tracing::{info, warn};

/// 服务启动到打开浏览器之间的等待时间
pub const BROWSER_DELAY: Duration = Duration::from_secs(2);

/// 浏览器访问地址，未指定监听地址时使用 localhost
pub fn browser_url(addr: SocketAddr) -> String {
  if addr.ip().is_unspecified() || addr.ip().is_loopback() {
    format!("http://localhost:{}", addr.port())
  } else {
    format!("http://{}", addr)
  }
}

fn opener(url: &str) -> Command {
  if cfg!(target_os = "windows") {
    let mut cmd = Command::new("cmd");
    cmd.args(["/C", "start", "", url]);
    cmd
  } else if cfg!(target_os = "macos") {
    let mut cmd = Command::new("open");
    cmd.arg(url);
    cmd
  } else {
    let mut cmd = Command::new("xdg-open");
    cmd.arg(url);
    cmd
  }
}

/// 在独立线程中等待 `delay` 后打开浏览器
pub fn open_browser_later(url: String, delay: Duration) -> thread::JoinHandle<()> {
  thread::spawn(move || {
    thread::sleep(delay);
    info!("正在打开浏览器: {}", url);
    let result = opener(&url)
      .stdin(Stdio::null())
      .stdout(Stdio::null())
      .stderr(Stdio::null())
      .spawn();
    if let Err(e) = result {
      warn!("无法自动打开浏览器，请手动访问 {}: {}", url, e);
    }
  })
}

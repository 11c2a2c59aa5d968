// 该文件是 Kuangxuan （框选） 项目的一部分。
// src/classes.rs - 类别注册表
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

use std::{fs, path::Path};

use thiserror::Error;
use tracing::info;

#[derive(Error, Debug)]
pub enum ClassRegistryError {
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("类别文件解析错误: {0}")]
  ParseError(#[from] serde_json::Error),
  #[error("类别名称不能为空")]
  EmptyName,
  #[error("类别已存在: {0}")]
  Duplicate(String),
  #[error("类别 ID 越界: {id}，当前共有 {len} 个类别")]
  OutOfRange { id: usize, len: usize },
}

/// 有序的类别列表，下标即类别 ID
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClassRegistry {
  names: Vec<String>,
}

impl ClassRegistry {
  /// 读取类别文件，文件不存在时返回空列表
  pub fn load(path: impl AsRef<Path>) -> Result<Self, ClassRegistryError> {
    let path = path.as_ref();
    if !path.exists() {
      return Ok(Self::default());
    }
    let text = fs::read_to_string(path)?;
    let names: Vec<String> = serde_json::from_str(&text)?;
    Ok(Self { names })
  }

  pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ClassRegistryError> {
    fs::write(path, serde_json::to_string_pretty(&self.names)?)?;
    Ok(())
  }

  pub fn names(&self) -> &[String] {
    &self.names
  }

  pub fn len(&self) -> usize {
    self.names.len()
  }

  pub fn is_empty(&self) -> bool {
    self.names.is_empty()
  }

  pub fn get(&self, id: usize) -> Option<&str> {
    self.names.get(id).map(String::as_str)
  }

  pub fn contains_id(&self, id: usize) -> bool {
    id < self.names.len()
  }

  /// 追加类别，返回新类别的 ID
  pub fn add(&mut self, name: &str) -> Result<usize, ClassRegistryError> {
    let name = self.validate(name, None)?;
    self.names.push(name);
    let id = self.names.len() - 1;
    info!("新增类别 {}: {}", id, self.names[id]);
    Ok(id)
  }

  /// 重命名类别，ID 不变，已有标注仍然有效
  pub fn rename(&mut self, id: usize, name: &str) -> Result<(), ClassRegistryError> {
    if !self.contains_id(id) {
      return Err(ClassRegistryError::OutOfRange {
        id,
        len: self.names.len(),
      });
    }
    let name = self.validate(name, Some(id))?;
    info!("类别 {} 重命名: {} -> {}", id, self.names[id], name);
    self.names[id] = name;
    Ok(())
  }

  fn validate(&self, name: &str, except: Option<usize>) -> Result<String, ClassRegistryError> {
    let name = name.trim();
    if name.is_empty() {
      return Err(ClassRegistryError::EmptyName);
    }
    let taken = self
      .names
      .iter()
      .enumerate()
      .any(|(i, existing)| Some(i) != except && existing == name);
    if taken {
      return Err(ClassRegistryError::Duplicate(name.to_string()));
    }
    Ok(name.to_string())
  }
}

impl From<Vec<String>> for ClassRegistry {
  fn from(names: Vec<String>) -> Self {
    Self { names }
  }
}

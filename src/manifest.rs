// 该文件是 Kuangxuan （框选） 项目的一部分。
// src/manifest.rs - 训练数据集描述文件 (data.yaml)
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

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::{
  classes::ClassRegistry,
  workspace::{Split, Workspace},
};

#[derive(Error, Debug)]
pub enum ManifestError {
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("YAML 错误: {0}")]
  YamlError(#[from] serde_yaml::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataManifest {
  pub path: String,
  pub train: String,
  pub val: String,
  pub nc: usize,
  pub names: Vec<String>,
}

impl DataManifest {
  pub fn new(workspace: &Workspace, classes: &ClassRegistry) -> Self {
    let dataset = workspace.dataset_dir();
    let path = fs::canonicalize(dataset).unwrap_or_else(|_| dataset.to_path_buf());
    DataManifest {
      path: path.display().to_string(),
      train: format!("images/{}", Split::Train),
      val: format!("images/{}", Split::Val),
      nc: classes.len(),
      names: classes.names().to_vec(),
    }
  }

  pub fn write(&self, path: impl AsRef<Path>) -> Result<(), ManifestError> {
    let path = path.as_ref();
    fs::write(path, serde_yaml::to_string(self)?)?;
    info!("数据集描述文件已写入: {}", path.display());
    Ok(())
  }

  pub fn read(path: impl AsRef<Path>) -> Result<Self, ManifestError> {
    let text = fs::read_to_string(path)?;
    Ok(serde_yaml::from_str(&text)?)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn manifest_lists_classes_in_registry_order() {
    let dir = tempfile::tempdir().unwrap();
    let workspace = Workspace::open(dir.path()).unwrap();
    let classes = ClassRegistry::from(vec!["行人".to_string(), "car".to_string()]);

    let manifest = DataManifest::new(&workspace, &classes);
    manifest.write(workspace.manifest_file()).unwrap();

    let read = DataManifest::read(workspace.manifest_file()).unwrap();
    assert_eq!(read, manifest);
    assert_eq!(read.nc, 2);
    assert_eq!(read.names, ["行人", "car"]);
    assert_eq!(read.train, "images/train");
    assert!(Path::new(&read.path).is_absolute());
  }
}

// 该文件是 Kuangxuan （框选） 项目的一部分。
// src/workspace.rs - 工作目录与数据集布局
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
  fmt,
  fs,
  path::{Path, PathBuf},
  str::FromStr,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

/// 默认工作目录
pub const DEFAULT_WORKSPACE: &str = "yolo_workspace";

/// 可识别的图片扩展名
pub const IMAGE_EXTENSIONS: [&str; 6] = ["jpg", "jpeg", "png", "bmp", "gif", "webp"];

const DATASET_DIR: &str = "dataset";
const UPLOADS_DIR: &str = "uploads";
const MODELS_DIR: &str = "models";
const WEIGHTS_DIR: &str = "weights";
const CLASSES_FILE: &str = "classes.json";
const SETTINGS_FILE: &str = "settings.json";
const MANIFEST_FILE: &str = "data.yaml";

#[derive(Error, Debug)]
pub enum WorkspaceError {
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("配置文件解析错误: {0}")]
  SettingsError(#[from] serde_json::Error),
  #[error("未知的数据集类型: {0}，只支持 train 或 val")]
  UnknownSplit(String),
  #[error("非法文件名: {0}")]
  InvalidFileName(String),
  #[error("数据集路径无效: {0}")]
  InvalidDatasetPath(String),
}

/// 数据集划分
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Split {
  Train,
  Val,
}

impl Split {
  pub const ALL: [Split; 2] = [Split::Train, Split::Val];

  pub fn as_str(&self) -> &'static str {
    match self {
      Split::Train => "train",
      Split::Val => "val",
    }
  }
}

impl fmt::Display for Split {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for Split {
  type Err = WorkspaceError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.trim() {
      "train" => Ok(Split::Train),
      "val" => Ok(Split::Val),
      other => Err(WorkspaceError::UnknownSplit(other.to_string())),
    }
  }
}

/// 持久化在 settings.json 中的工作目录配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkspaceSettings {
  #[serde(default)]
  pub dataset_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct SplitStats {
  pub images: usize,
  pub labeled: usize,
}

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct DatasetStats {
  pub train: SplitStats,
  pub val: SplitStats,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ImageEntry {
  pub name: String,
  pub labeled: bool,
}

/// 工作目录
///
/// ```text
/// <root>/
/// ├── classes.json
/// ├── settings.json
/// ├── uploads/
/// ├── models/
/// ├── weights/
/// └── dataset/            (可通过 settings.json 指向其他位置)
///     ├── data.yaml
///     ├── images/{train,val}/
///     └── labels/{train,val}/
/// ```
#[derive(Debug, Clone)]
pub struct Workspace {
  root: PathBuf,
  dataset_dir: PathBuf,
}

impl Workspace {
  /// 打开（必要时创建）工作目录
  pub fn open(root: impl AsRef<Path>) -> Result<Self, WorkspaceError> {
    let root = root.as_ref().to_path_buf();
    fs::create_dir_all(&root)?;

    let settings = load_settings(&root.join(SETTINGS_FILE))?;
    let dataset_dir = match settings.dataset_dir {
      Some(dir) => resolve_against(&root, &dir),
      None => root.join(DATASET_DIR),
    };

    let workspace = Workspace { root, dataset_dir };
    workspace.ensure_layout()?;
    info!("工作目录: {}", workspace.root.display());
    info!("数据集目录: {}", workspace.dataset_dir.display());
    Ok(workspace)
  }

  fn ensure_layout(&self) -> Result<(), WorkspaceError> {
    for dir in [self.uploads_dir(), self.models_dir(), self.weights_dir()] {
      fs::create_dir_all(dir)?;
    }
    ensure_dataset_layout(&self.dataset_dir)
  }

  pub fn root(&self) -> &Path {
    &self.root
  }

  pub fn dataset_dir(&self) -> &Path {
    &self.dataset_dir
  }

  pub fn images_dir(&self, split: Split) -> PathBuf {
    self.dataset_dir.join("images").join(split.as_str())
  }

  pub fn labels_dir(&self, split: Split) -> PathBuf {
    self.dataset_dir.join("labels").join(split.as_str())
  }

  pub fn uploads_dir(&self) -> PathBuf {
    self.root.join(UPLOADS_DIR)
  }

  pub fn models_dir(&self) -> PathBuf {
    self.root.join(MODELS_DIR)
  }

  /// 预训练 ONNX 权重所在目录
  pub fn weights_dir(&self) -> PathBuf {
    self.root.join(WEIGHTS_DIR)
  }

  pub fn classes_file(&self) -> PathBuf {
    self.root.join(CLASSES_FILE)
  }

  pub fn settings_file(&self) -> PathBuf {
    self.root.join(SETTINGS_FILE)
  }

  pub fn manifest_file(&self) -> PathBuf {
    self.dataset_dir.join(MANIFEST_FILE)
  }

  /// 修改数据集目录，相对路径以工作目录为基准
  pub fn set_dataset_dir(&mut self, dir: impl AsRef<Path>) -> Result<(), WorkspaceError> {
    let dir = dir.as_ref();
    if dir.as_os_str().is_empty() {
      return Err(WorkspaceError::InvalidDatasetPath("路径为空".to_string()));
    }
    let resolved = resolve_against(&self.root, dir);
    if resolved.exists() && !resolved.is_dir() {
      return Err(WorkspaceError::InvalidDatasetPath(format!(
        "{} 不是目录",
        resolved.display()
      )));
    }

    ensure_dataset_layout(&resolved)?;
    let settings = WorkspaceSettings {
      dataset_dir: Some(dir.to_path_buf()),
    };
    fs::write(
      self.settings_file(),
      serde_json::to_string_pretty(&settings)?,
    )?;

    info!("数据集目录已切换到: {}", resolved.display());
    self.dataset_dir = resolved;
    Ok(())
  }

  /// 图片在某个划分下的存储路径，文件名必须已经是安全文件名
  pub fn image_path(&self, split: Split, name: &str) -> Result<PathBuf, WorkspaceError> {
    match sanitize_filename(name) {
      Some(clean) if clean == name => Ok(self.images_dir(split).join(clean)),
      _ => Err(WorkspaceError::InvalidFileName(name.to_string())),
    }
  }

  /// 与图片同名的标注文件路径
  pub fn label_path(&self, split: Split, image_name: &str) -> Result<PathBuf, WorkspaceError> {
    let image = self.image_path(split, image_name)?;
    let stem = image
      .file_stem()
      .and_then(|s| s.to_str())
      .ok_or_else(|| WorkspaceError::InvalidFileName(image_name.to_string()))?;
    Ok(self.labels_dir(split).join(format!("{stem}.txt")))
  }

  /// 按文件名排序列出某个划分下的图片
  pub fn list_images(&self, split: Split) -> Result<Vec<ImageEntry>, WorkspaceError> {
    let labels_dir = self.labels_dir(split);
    let mut entries = Vec::new();

    for entry in fs::read_dir(self.images_dir(split))? {
      let path = entry?.path();
      if !path.is_file() || !is_image_file(&path) {
        continue;
      }
      let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        continue;
      };
      let labeled = path
        .file_stem()
        .and_then(|s| s.to_str())
        .map(|stem| labels_dir.join(format!("{stem}.txt")).is_file())
        .unwrap_or(false);
      entries.push(ImageEntry {
        name: name.to_string(),
        labeled,
      });
    }

    entries.sort_by(|a, b| a.name.cmp(&b.name));
    debug!("{} 集共有 {} 张图片", split, entries.len());
    Ok(entries)
  }

  /// weights 目录下可直接加载的 ONNX 模型
  pub fn list_weights(&self) -> Result<Vec<String>, WorkspaceError> {
    let mut names = Vec::new();
    for entry in fs::read_dir(self.weights_dir())? {
      let path = entry?.path();
      if path.is_file()
        && path.extension().is_some_and(|ext| ext == "onnx")
        && let Some(name) = path.file_name().and_then(|n| n.to_str())
      {
        names.push(name.to_string());
      }
    }
    names.sort();
    Ok(names)
  }

  pub fn stats(&self) -> Result<DatasetStats, WorkspaceError> {
    Ok(DatasetStats {
      train: self.split_stats(Split::Train)?,
      val: self.split_stats(Split::Val)?,
    })
  }

  fn split_stats(&self, split: Split) -> Result<SplitStats, WorkspaceError> {
    let images = self.list_images(split)?.len();
    let mut labeled = 0;
    for entry in fs::read_dir(self.labels_dir(split))? {
      let path = entry?.path();
      if path.is_file() && path.extension().is_some_and(|ext| ext == "txt") {
        labeled += 1;
      }
    }
    Ok(SplitStats { images, labeled })
  }
}

fn load_settings(path: &Path) -> Result<WorkspaceSettings, WorkspaceError> {
  if !path.exists() {
    return Ok(WorkspaceSettings::default());
  }
  let text = fs::read_to_string(path)?;
  Ok(serde_json::from_str(&text)?)
}

fn ensure_dataset_layout(dataset_dir: &Path) -> Result<(), WorkspaceError> {
  for kind in ["images", "labels"] {
    for split in Split::ALL {
      fs::create_dir_all(dataset_dir.join(kind).join(split.as_str()))?;
    }
  }
  Ok(())
}

fn resolve_against(base: &Path, path: &Path) -> PathBuf {
  if path.is_absolute() {
    path.to_path_buf()
  } else {
    base.join(path)
  }
}

pub fn is_image_file(path: &Path) -> bool {
  path
    .extension()
    .and_then(|ext| ext.to_str())
    .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
    .unwrap_or(false)
}

/// 把客户端提供的文件名收敛为安全的单层文件名
///
/// 只保留最后一级路径、ASCII 字母数字与 `.-_`，空白替换为 `_`，
/// 去掉首尾的 `.` 和 `_`。主文件名为空时返回 `None`。
pub fn sanitize_filename(name: &str) -> Option<String> {
  let base = name.rsplit(['/', '\\']).next().unwrap_or_default();
  let (stem, ext) = match base.rsplit_once('.') {
    Some((stem, ext)) if !stem.trim_matches('.').is_empty() => (stem, Some(ext)),
    _ => (base, None),
  };

  let stem: String = stem
    .chars()
    .filter_map(|c| match c {
      c if c.is_ascii_alphanumeric() => Some(c),
      '.' | '-' | '_' => Some(c),
      c if c.is_whitespace() => Some('_'),
      _ => None,
    })
    .collect();
  let stem = stem.trim_matches(|c| c == '.' || c == '_');
  if stem.is_empty() {
    return None;
  }

  let ext: String = ext
    .unwrap_or_default()
    .chars()
    .filter(|c| c.is_ascii_alphanumeric())
    .collect();
  if ext.is_empty() {
    Some(stem.to_string())
  } else {
    Some(format!("{stem}.{ext}"))
  }
}

/// 文件名无法收敛时使用的时间戳文件名，尽量保留原扩展名
pub fn fallback_upload_name(original: &str) -> String {
  let ext = Path::new(original)
    .extension()
    .and_then(|ext| ext.to_str())
    .map(|ext| ext.to_ascii_lowercase())
    .filter(|ext| IMAGE_EXTENSIONS.contains(&ext.as_str()))
    .unwrap_or_else(|| "jpg".to_string());
  format!(
    "upload_{}.{}",
    chrono::Local::now().format("%Y%m%d_%H%M%S_%3f"),
    ext
  )
}

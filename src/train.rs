// 该文件是 Kuangxuan （框选） 项目的一部分。
// src/train.rs - 模型训练任务
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
  collections::VecDeque,
  io::{BufRead, BufReader, Read},
  path::{Path, PathBuf},
  process::{Command, Stdio},
  sync::{
    Arc, Mutex, MutexGuard,
    atomic::{AtomicU64, Ordering},
  },
  thread,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// 训练产物所在的运行名称
pub const RUN_NAME: &str = "custom_model";

const LOG_TAIL: usize = 200;

#[derive(Error, Debug)]
pub enum TrainError {
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("训练参数无效: {0}")]
  InvalidParams(String),
  #[error("已有训练任务正在运行")]
  AlreadyRunning,
  #[error("无法启动训练程序 {program}: {source}")]
  SpawnFailed {
    program: String,
    source: std::io::Error,
  },
  #[error("训练进程异常退出，退出码: {0:?}")]
  ProcessFailed(Option<i32>),
  #[error("导出 ONNX 失败，退出码: {0:?}")]
  ExportFailed(Option<i32>),
  #[error("训练完成但未找到权重文件: {0}")]
  MissingWeights(String),
  #[error("训练任务异常终止: {0}")]
  Panicked(String),
}

fn default_imgsz() -> u32 {
  640
}

fn default_patience() -> u32 {
  50
}

fn default_device() -> String {
  "cpu".to_string()
}

/// 训练超参数
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainParams {
  pub model: String,
  pub epochs: u32,
  pub batch: u32,
  #[serde(default = "default_imgsz")]
  pub imgsz: u32,
  #[serde(default = "default_patience")]
  pub patience: u32,
  #[serde(default = "default_device")]
  pub device: String,
}

impl TrainParams {
  pub fn validate(&self) -> Result<(), TrainError> {
    if self.model.trim().is_empty() {
      return Err(TrainError::InvalidParams("模型名称为空".to_string()));
    }
    if self.epochs == 0 {
      return Err(TrainError::InvalidParams("训练轮数必须大于 0".to_string()));
    }
    if self.batch == 0 {
      return Err(TrainError::InvalidParams("批次大小必须大于 0".to_string()));
    }
    if self.imgsz == 0 || self.imgsz % 32 != 0 {
      return Err(TrainError::InvalidParams(format!(
        "图像尺寸必须是 32 的正整数倍: {}",
        self.imgsz
      )));
    }
    Ok(())
  }
}

/// 一次训练所需的全部输入
#[derive(Debug, Clone)]
pub struct TrainJobSpec {
  pub params: TrainParams,
  /// data.yaml 路径
  pub data: PathBuf,
  /// 训练输出根目录
  pub project: PathBuf,
}

impl TrainJobSpec {
  pub fn run_dir(&self) -> PathBuf {
    self.project.join(RUN_NAME)
  }
}

/// `<project>/custom_model/weights/best.pt`
pub fn best_weights(project: &Path) -> PathBuf {
  project.join(RUN_NAME).join("weights").join("best.pt")
}

/// 训练后导出的 ONNX 权重
pub fn best_onnx(project: &Path) -> PathBuf {
  best_weights(project).with_extension("onnx")
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrainOutcome {
  pub weights: PathBuf,
  pub onnx: Option<PathBuf>,
}

pub trait Trainer: Send + Sync {
  /// 阻塞执行训练，过程输出写入 `log`
  fn train(&self, spec: &TrainJobSpec, log: &TrainingJob) -> Result<TrainOutcome, TrainError>;
}

/// 调用 Ultralytics 命令行训练，并导出 ONNX 供推理后端加载
#[derive(Debug, Clone)]
pub struct YoloCliTrainer {
  program: String,
}

impl Default for YoloCliTrainer {
  fn default() -> Self {
    Self::new("yolo")
  }
}

impl YoloCliTrainer {
  pub fn new(program: impl Into<String>) -> Self {
    Self {
      program: program.into(),
    }
  }

  pub fn train_args(spec: &TrainJobSpec) -> Vec<String> {
    let p = &spec.params;
    vec![
      "detect".to_string(),
      "train".to_string(),
      format!("data={}", spec.data.display()),
      format!("model={}", p.model),
      format!("epochs={}", p.epochs),
      format!("batch={}", p.batch),
      format!("imgsz={}", p.imgsz),
      format!("name={}", RUN_NAME),
      format!("patience={}", p.patience),
      format!("device={}", p.device),
      format!("project={}", spec.project.display()),
      "save=True".to_string(),
      "exist_ok=True".to_string(),
    ]
  }

  pub fn export_args(weights: &Path, imgsz: u32) -> Vec<String> {
    vec![
      "export".to_string(),
      format!("model={}", weights.display()),
      "format=onnx".to_string(),
      format!("imgsz={}", imgsz),
    ]
  }

  fn run(&self, args: &[String], log: &TrainingJob) -> Result<Option<i32>, TrainError> {
    info!("执行: {} {}", self.program, args.join(" "));
    let mut child = Command::new(&self.program)
      .args(args)
      .stdout(Stdio::piped())
      .stderr(Stdio::piped())
      .spawn()
      .map_err(|source| TrainError::SpawnFailed {
        program: self.program.clone(),
        source,
      })?;

    // Ultralytics 的进度条写在 stderr
    let stderr = child
      .stderr
      .take()
      .map(|stderr| forward_lines(stderr, log.clone()));
    if let Some(stdout) = child.stdout.take() {
      for line in BufReader::new(stdout).lines() {
        log.push_log(line?);
      }
    }
    if let Some(handle) = stderr
      && handle.join().is_err()
    {
      warn!("stderr 读取线程异常退出");
    }

    let status = child.wait()?;
    Ok(if status.success() {
      None
    } else {
      Some(status.code().unwrap_or(-1))
    })
  }
}

fn forward_lines(source: impl Read + Send + 'static, log: TrainingJob) -> thread::JoinHandle<()> {
  thread::spawn(move || {
    for line in BufReader::new(source).lines() {
      match line {
        Ok(line) => log.push_log(line),
        Err(_) => break,
      }
    }
  })
}

impl Trainer for YoloCliTrainer {
  fn train(&self, spec: &TrainJobSpec, log: &TrainingJob) -> Result<TrainOutcome, TrainError> {
    if let Some(code) = self.run(&Self::train_args(spec), log)? {
      return Err(TrainError::ProcessFailed(Some(code)));
    }

    let weights = best_weights(&spec.project);
    if !weights.is_file() {
      return Err(TrainError::MissingWeights(weights.display().to_string()));
    }

    log.push_log(format!("导出 ONNX: {}", weights.display()));
    let onnx = match self.run(&Self::export_args(&weights, spec.params.imgsz), log)? {
      None if best_onnx(&spec.project).is_file() => Some(best_onnx(&spec.project)),
      None => None,
      Some(code) => {
        warn!("{}", TrainError::ExportFailed(Some(code)));
        None
      }
    };

    Ok(TrainOutcome { weights, onnx })
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TrainingState {
  Idle,
  Running,
  Succeeded,
  Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct TrainingStatus {
  pub state: TrainingState,
  pub params: Option<TrainParams>,
  pub started_at: Option<String>,
  pub finished_at: Option<String>,
  pub message: Option<String>,
  pub weights: Option<String>,
  pub onnx: Option<String>,
  pub log: VecDeque<String>,
}

impl Default for TrainingStatus {
  fn default() -> Self {
    Self {
      state: TrainingState::Idle,
      params: None,
      started_at: None,
      finished_at: None,
      message: None,
      weights: None,
      onnx: None,
      log: VecDeque::new(),
    }
  }
}

/// 进程内唯一的训练任务状态
#[derive(Debug, Clone, Default)]
pub struct TrainingJob {
  inner: Arc<Mutex<TrainingStatus>>,
  succeeded: Arc<AtomicU64>,
}

impl TrainingJob {
  fn lock(&self) -> MutexGuard<'_, TrainingStatus> {
    self.inner.lock().unwrap_or_else(|e| e.into_inner())
  }

  /// 标记为运行中；已有任务运行时返回错误
  pub fn try_start(&self, params: &TrainParams) -> Result<(), TrainError> {
    let mut status = self.lock();
    if status.state == TrainingState::Running {
      return Err(TrainError::AlreadyRunning);
    }
    *status = TrainingStatus {
      state: TrainingState::Running,
      params: Some(params.clone()),
      started_at: Some(chrono::Local::now().to_rfc3339()),
      message: Some("训练进行中".to_string()),
      ..TrainingStatus::default()
    };
    Ok(())
  }

  pub fn push_log(&self, line: impl Into<String>) {
    let line = line.into();
    info!(target: "kuangxuan::train", "{}", line);
    let mut status = self.lock();
    if status.log.len() == LOG_TAIL {
      status.log.pop_front();
    }
    status.log.push_back(line);
  }

  pub fn finish(&self, result: &Result<TrainOutcome, TrainError>) {
    let mut status = self.lock();
    status.finished_at = Some(chrono::Local::now().to_rfc3339());
    match result {
      Ok(outcome) => {
        // 先于状态变化计数，轮询到成功时计数已可见
        self.succeeded.fetch_add(1, Ordering::SeqCst);
        status.state = TrainingState::Succeeded;
        status.weights = Some(outcome.weights.display().to_string());
        status.onnx = outcome.onnx.as_ref().map(|p| p.display().to_string());
        status.message = Some(match &outcome.onnx {
          Some(onnx) => format!("训练完成！\n模型保存在: {}", onnx.display()),
          None => format!(
            "训练完成！\n模型保存在: {}\n未能导出 ONNX，测试将使用预训练模型",
            outcome.weights.display()
          ),
        });
      }
      Err(e) => {
        status.state = TrainingState::Failed;
        status.message = Some(format!("训练失败: {}", e));
      }
    }
  }

  /// 训练进程启动前就失败时使用
  pub fn abort(&self, message: impl Into<String>) {
    let mut status = self.lock();
    status.state = TrainingState::Failed;
    status.finished_at = Some(chrono::Local::now().to_rfc3339());
    status.message = Some(message.into());
  }

  pub fn status(&self) -> TrainingStatus {
    self.lock().clone()
  }

  pub fn is_running(&self) -> bool {
    self.lock().state == TrainingState::Running
  }

  /// 成功完成的训练次数，新权重产生时递增
  pub fn succeeded_runs(&self) -> u64 {
    self.succeeded.load(Ordering::SeqCst)
  }
}

/// 在阻塞线程池中执行训练，调用前须已 `try_start`
///
/// 训练器 panic 时任务标记为失败，不会一直停留在运行中。
pub fn spawn_training(
  job: TrainingJob,
  trainer: Arc<dyn Trainer>,
  spec: TrainJobSpec,
) -> JoinHandle<()> {
  tokio::spawn(async move {
    info!("开始训练: {:?}", spec.params);
    let worker = {
      let job = job.clone();
      tokio::task::spawn_blocking(move || trainer.train(&spec, &job))
    };
    let result = worker
      .await
      .unwrap_or_else(|e| Err(TrainError::Panicked(e.to_string())));
    match &result {
      Ok(outcome) => info!("训练完成: {}", outcome.weights.display()),
      Err(e) => error!("训练失败: {}", e),
    }
    job.finish(&result);
  })
}

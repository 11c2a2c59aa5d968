mod fixtures;
pub use fixtures::*;

// 测试中常用的类型
pub use kuangxuan::{
  model::{DetectItem, DetectResult, Detector, DetectorLoader, ModelError, ModelRef, Thresholds},
  server::{AppState, SharedState},
  train::{TrainError, TrainJobSpec, TrainOutcome, Trainer, TrainingJob, TrainingState},
  workspace::{Split, Workspace},
};

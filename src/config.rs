// 该文件是 Shanan （山南西风） 项目的一部分。
// src/config.rs - 管道配置
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

use std::{collections::BTreeSet, str::FromStr, time::Duration};

use thiserror::Error;

use crate::{
  error::{Classify, ErrorKind},
  retry::RetryPolicy,
};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
  #[error("队列容量必须大于 0")]
  ZeroCapacity,
  #[error("工作线程数必须大于 0")]
  ZeroWorkers,
  #[error("标签过滤集合不能为空")]
  EmptyLabelFilter,
  #[error("置信度下限必须位于 [0, 1]: {0}")]
  InvalidConfidence(f32),
  #[error("重试参数无效: {0}")]
  InvalidRetry(String),
  #[error("未知的溢出策略: {0}（可选 reject-newest / drop-oldest）")]
  UnknownOverflowPolicy(String),
  #[error("未知的嵌入区域: {0}（可选 frame / crop）")]
  UnknownEmbedRegion(String),
  #[error("缺少凭据: {0}")]
  MissingCredential(String),
  #[error("向量维度不匹配: 提取器 {extractor}, 向量库 {store}")]
  DimensionMismatch { extractor: usize, store: usize },
}

impl Classify for ConfigError {
  fn kind(&self) -> ErrorKind {
    ErrorKind::Configuration
  }
}

/// 队列已满时的处理方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverflowPolicy {
  /// 拒绝新事件，保留队列中较早的事件
  #[default]
  RejectNewest,
  /// 丢弃最早的事件，为新事件腾出位置
  DropOldest,
}

impl FromStr for OverflowPolicy {
  type Err = ConfigError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.trim().to_ascii_lowercase().as_str() {
      "reject-newest" | "reject_newest" => Ok(OverflowPolicy::RejectNewest),
      "drop-oldest" | "drop_oldest" => Ok(OverflowPolicy::DropOldest),
      other => Err(ConfigError::UnknownOverflowPolicy(other.to_string())),
    }
  }
}

impl std::fmt::Display for OverflowPolicy {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      OverflowPolicy::RejectNewest => f.write_str("reject-newest"),
      OverflowPolicy::DropOldest => f.write_str("drop-oldest"),
    }
  }
}

/// 嵌入向量取自整帧还是检测框裁剪
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EmbedRegion {
  #[default]
  Frame,
  Crop,
}

impl FromStr for EmbedRegion {
  type Err = ConfigError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.trim().to_ascii_lowercase().as_str() {
      "frame" => Ok(EmbedRegion::Frame),
      "crop" => Ok(EmbedRegion::Crop),
      other => Err(ConfigError::UnknownEmbedRegion(other.to_string())),
    }
  }
}

/// 标签过滤集合，精确匹配
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelFilter {
  labels: BTreeSet<String>,
}

impl LabelFilter {
  pub fn new<I, S>(labels: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    Self {
      labels: labels
        .into_iter()
        .map(Into::into)
        .map(|l: String| l.trim().to_string())
        .filter(|l| !l.is_empty())
        .collect(),
    }
  }

  pub fn contains(&self, label: &str) -> bool {
    self.labels.contains(label)
  }

  pub fn is_empty(&self) -> bool {
    self.labels.is_empty()
  }

  pub fn iter(&self) -> impl Iterator<Item = &str> {
    self.labels.iter().map(String::as_str)
  }
}

impl Default for LabelFilter {
  fn default() -> Self {
    LabelFilter::new(["person"])
  }
}

impl FromStr for LabelFilter {
  type Err = ConfigError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let filter = LabelFilter::new(s.split(','));
    if filter.is_empty() {
      return Err(ConfigError::EmptyLabelFilter);
    }
    Ok(filter)
  }
}

/// 整个检测事件子系统的运行参数
#[derive(Debug, Clone)]
pub struct PipelineConfig {
  pub queue_capacity: usize,
  pub overflow: OverflowPolicy,
  pub workers: usize,
  pub labels: LabelFilter,
  pub min_confidence: f32,
  /// 同一标签两次入队之间的最短间隔，`None` 表示不去重
  pub debounce: Option<Duration>,
  pub notify_retry: RetryPolicy,
  pub insert_retry: RetryPolicy,
  pub embed_region: EmbedRegion,
  /// 是否在快照上绘制检测框
  pub annotate: bool,
  /// 工作线程取队列的轮询间隔
  pub poll_interval: Duration,
  /// 关闭时等待队列排空的时间
  pub grace_period: Duration,
  /// 放弃剩余事件后等待工作线程退出的时间
  pub abandon_timeout: Duration,
}

impl Default for PipelineConfig {
  fn default() -> Self {
    Self {
      queue_capacity: 64,
      overflow: OverflowPolicy::default(),
      workers: 2,
      labels: LabelFilter::default(),
      min_confidence: 0.0,
      debounce: None,
      notify_retry: RetryPolicy::default(),
      insert_retry: RetryPolicy::default(),
      embed_region: EmbedRegion::default(),
      annotate: true,
      poll_interval: Duration::from_millis(200),
      grace_period: Duration::from_secs(10),
      abandon_timeout: Duration::from_secs(5),
    }
  }
}

impl PipelineConfig {
  pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
    self.queue_capacity = capacity;
    self
  }

  pub fn with_overflow(mut self, overflow: OverflowPolicy) -> Self {
    self.overflow = overflow;
    self
  }

  pub fn with_workers(mut self, workers: usize) -> Self {
    self.workers = workers;
    self
  }

  pub fn with_labels(mut self, labels: LabelFilter) -> Self {
    self.labels = labels;
    self
  }

  pub fn with_min_confidence(mut self, min_confidence: f32) -> Self {
    self.min_confidence = min_confidence;
    self
  }

  pub fn with_debounce(mut self, debounce: Option<Duration>) -> Self {
    self.debounce = debounce.filter(|d| !d.is_zero());
    self
  }

  pub fn with_notify_retry(mut self, retry: RetryPolicy) -> Self {
    self.notify_retry = retry;
    self
  }

  pub fn with_insert_retry(mut self, retry: RetryPolicy) -> Self {
    self.insert_retry = retry;
    self
  }

  pub fn with_embed_region(mut self, region: EmbedRegion) -> Self {
    self.embed_region = region;
    self
  }

  pub fn with_annotate(mut self, annotate: bool) -> Self {
    self.annotate = annotate;
    self
  }

  pub fn with_poll_interval(mut self, interval: Duration) -> Self {
    self.poll_interval = interval;
    self
  }

  pub fn with_grace_period(mut self, grace: Duration) -> Self {
    self.grace_period = grace;
    self
  }

  pub fn with_abandon_timeout(mut self, timeout: Duration) -> Self {
    self.abandon_timeout = timeout;
    self
  }

  pub fn validate(&self) -> Result<(), ConfigError> {
    if self.queue_capacity == 0 {
      return Err(ConfigError::ZeroCapacity);
    }
    if self.workers == 0 {
      return Err(ConfigError::ZeroWorkers);
    }
    if self.labels.is_empty() {
      return Err(ConfigError::EmptyLabelFilter);
    }
    if !(0.0..=1.0).contains(&self.min_confidence) {
      return Err(ConfigError::InvalidConfidence(self.min_confidence));
    }
    self.notify_retry.validate()?;
    self.insert_retry.validate()?;
    Ok(())
  }
}

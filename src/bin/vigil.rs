// 该文件是 Shanan （山南西风） 项目的一部分。
// src/bin/vigil.rs - 回放录制帧并驱动检测事件子系统
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

use std::{sync::Arc, time::Duration};

use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use url::Url;

use shanan_vigil::{
  FromUrl,
  adapter::PipelineAdapter,
  config::{EmbedRegion, LabelFilter, OverflowPolicy, PipelineConfig},
  input::ReplayInput,
  model::{FeatureExtractor, ModelExtractor},
  output::{ImageStore, NotifierWrapper, StoreWrapper, VectorStore, schema_for},
  pool::{SinkPool, Sinks},
  queue::EventQueue,
  retry::RetryPolicy,
  stats::Stats,
  task::{ContinuousTask, StopReason, interrupt_channel},
};

/// Vigil 参数配置
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 回放输入
  #[arg(long, value_name = "SOURCE", env = "VIGIL_INPUT")]
  pub input: Url,
  /// 嵌入模型
  #[arg(long, value_name = "MODEL", env = "VIGIL_MODEL", default_value = "histogram://?bins=8")]
  pub model: Url,
  /// 向量库
  #[arg(long, value_name = "STORE", env = "VIGIL_STORE", default_value = "memory:///detections")]
  pub store: Url,
  /// 通知渠道
  #[arg(long, value_name = "NOTIFIER", env = "VIGIL_NOTIFIER", default_value = "log://detections")]
  pub notifier: Url,
  /// 快照保存目录，不指定则不保存
  #[arg(long, value_name = "IMAGES", env = "VIGIL_IMAGES")]
  pub images: Option<Url>,
  /// 关注的标签，逗号分隔
  #[arg(long, env = "VIGIL_LABELS", default_value = "person")]
  pub labels: LabelFilter,
  #[arg(long, env = "VIGIL_MIN_CONFIDENCE", default_value_t = 0.0)]
  pub min_confidence: f32,
  /// 同一标签的去重窗口（毫秒）
  #[arg(long, env = "VIGIL_DEBOUNCE_MS")]
  pub debounce_ms: Option<u64>,
  #[arg(long, env = "VIGIL_QUEUE_CAPACITY", default_value_t = 64)]
  pub queue_capacity: usize,
  /// reject-newest 或 drop-oldest
  #[arg(long, env = "VIGIL_OVERFLOW", default_value = "reject-newest")]
  pub overflow: OverflowPolicy,
  #[arg(long, env = "VIGIL_WORKERS", default_value_t = 2)]
  pub workers: usize,
  /// 通知与写入的最大尝试次数
  #[arg(long, env = "VIGIL_RETRY_ATTEMPTS", default_value_t = 3)]
  pub retry_attempts: u32,
  #[arg(long, env = "VIGIL_RETRY_BASE_MS", default_value_t = 500)]
  pub retry_base_ms: u64,
  #[arg(long, env = "VIGIL_RETRY_MAX_MS", default_value_t = 8000)]
  pub retry_max_ms: u64,
  /// frame 或 crop
  #[arg(long, env = "VIGIL_EMBED_REGION", default_value = "frame")]
  pub embed_region: EmbedRegion,
  /// 不在快照上绘制检测框
  #[arg(long, env = "VIGIL_NO_ANNOTATE")]
  pub no_annotate: bool,
  /// 关闭时等待队列排空的秒数
  #[arg(long, env = "VIGIL_GRACE_SECS", default_value_t = 10)]
  pub grace_secs: u64,
  /// 回放帧率，覆盖输入 URL 中的 fps
  #[arg(long, env = "VIGIL_FPS")]
  pub fps: Option<f64>,
  /// 处理的帧数
  #[arg(long, env = "VIGIL_FRAMES")]
  pub frames: Option<usize>,
}

impl Args {
  fn pipeline_config(&self) -> PipelineConfig {
    let retry = RetryPolicy::new(
      self.retry_attempts,
      Duration::from_millis(self.retry_base_ms),
      Duration::from_millis(self.retry_max_ms),
    );
    PipelineConfig::default()
      .with_labels(self.labels.clone())
      .with_min_confidence(self.min_confidence)
      .with_debounce(self.debounce_ms.map(Duration::from_millis))
      .with_queue_capacity(self.queue_capacity)
      .with_overflow(self.overflow)
      .with_workers(self.workers)
      .with_notify_retry(retry)
      .with_insert_retry(retry)
      .with_embed_region(self.embed_region)
      .with_annotate(!self.no_annotate)
      .with_grace_period(Duration::from_secs(self.grace_secs))
  }
}

fn main() -> Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .init();

  let args = Args::parse();

  info!("输入来源: {}", args.input);
  info!("嵌入模型: {}", args.model);
  info!("向量库: {}", args.store);
  info!("通知渠道: {}", args.notifier);

  let config = args.pipeline_config();
  config.validate()?;

  let input = ReplayInput::from_url(&args.input)?;
  let extractor = ModelExtractor::from_url(&args.model)?;
  let store = StoreWrapper::from_url(&args.store)?;
  let schema = schema_for(&store, extractor.dimension())?;
  store.ensure_collection(&schema)?;
  let notifier = NotifierWrapper::from_url(&args.notifier)?;
  let images = args.images.as_ref().map(ImageStore::from_url).transpose()?;
  if let Some(images) = &images {
    info!("快照保存到: {}", images.directory().display());
  }

  let stats = Arc::new(Stats::new());
  let queue = Arc::new(EventQueue::new(config.queue_capacity, config.overflow)?);
  let adapter = PipelineAdapter::new(&config, queue.clone(), stats.clone());
  let sinks = Arc::new(Sinks {
    images,
    notifier,
    extractor,
    store,
  });
  let pool = SinkPool::spawn(&config, queue, sinks, stats.clone())?;

  let stop = interrupt_channel()?;
  let fps = args.fps.or(input.fps());
  let summary = ContinuousTask::default()
    .with_frame_number(args.frames)
    .with_fps(fps)
    .run(input, &adapter, &stop, || pool.fatal().is_some());
  if summary.stopped == StopReason::Interrupted {
    warn!("任务被中断，开始关闭");
  }

  let report = pool.shutdown(config.grace_period, config.abandon_timeout);
  info!("统计: {}", stats.snapshot().to_json());
  if !report.drained {
    warn!(
      "关闭时放弃 {} 个事件，{} 个工作线程被分离",
      report.abandoned, report.detached
    );
  }

  if let Some(fatal) = report.fatal {
    return Err(fatal.into());
  }
  Ok(())
}

// 该文件是 Shanan （山南西风） 项目的一部分。
// src/pool.rs - 事件处理工作线程池
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

//! # 工作线程池
//!
//! 每个工作线程依次处理一个事件，步骤之间相互隔离：
//!
//! 1. 保存快照（失败则跳过附件，继续后续步骤）
//! 2. 通知：先文本，快照保存成功时再发附件，两者互不影响；仅瞬时错误重试
//! 3. 提取嵌入（失败则该事件终止）
//! 4. 写入向量库：有界重试，之后放弃，不重新入队
//!
//! 提取或写入遇到配置类错误（如维度不匹配）时整个线程池停止。
//! 下游 panic 只丢失当前事件，工作线程继续处理队列。

use std::{
  borrow::Cow,
  panic::{self, AssertUnwindSafe},
  path::PathBuf,
  sync::{Arc, OnceLock},
  thread::{self, JoinHandle},
  time::{Duration, Instant},
};

use crossbeam_channel::{Sender, unbounded};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::{
  config::{ConfigError, EmbedRegion, PipelineConfig},
  error::{Classify, ErrorKind},
  event::{DetectionEvent, EventId},
  model::FeatureExtractor,
  output::{ImageStore, Notifier, VectorRecord, VectorStore},
  queue::{Dequeued, EventQueue},
  retry::{CancelToken, GiveUp, RetryError, RetryPolicy},
  stats::{Counter, Stats},
};

/// 附件的说明文字
pub const IMAGE_CAPTION: &str = "Live Camera image";

#[derive(Error, Debug)]
pub enum PoolError {
  #[error("配置错误: {0}")]
  Config(#[from] ConfigError),
  #[error("无法启动工作线程: {0}")]
  Spawn(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
  Persist,
  Notify,
  Extract,
  Insert,
}

impl std::fmt::Display for Step {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let name = match self {
      Step::Persist => "persist",
      Step::Notify => "notify",
      Step::Extract => "extract",
      Step::Insert => "insert",
    };
    f.write_str(name)
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepFailure {
  pub step: Step,
  pub kind: ErrorKind,
  pub attempts: u32,
  pub message: String,
}

/// 单个事件的处理结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventReport {
  pub id: EventId,
  pub image_path: Option<PathBuf>,
  pub notified: bool,
  pub record_id: Option<i64>,
  pub failures: Vec<StepFailure>,
  pub abandoned: bool,
}

impl EventReport {
  fn new(id: EventId) -> Self {
    Self {
      id,
      image_path: None,
      notified: false,
      record_id: None,
      failures: Vec::new(),
      abandoned: false,
    }
  }

  pub fn failed(&self, step: Step) -> Option<&StepFailure> {
    self.failures.iter().find(|f| f.step == step)
  }
}

/// 导致线程池停止的配置错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("事件 {id} 的 {step} 步骤遇到配置错误: {message}")]
pub struct FatalError {
  pub id: EventId,
  pub step: Step,
  pub message: String,
}

/// 注入到工作线程的下游客户端
pub struct Sinks<N, E, S> {
  /// 为空时不保存快照，也不发送附件
  pub images: Option<ImageStore>,
  pub notifier: N,
  pub extractor: E,
  pub store: S,
}

struct Shared<N, E, S> {
  sinks: Arc<Sinks<N, E, S>>,
  stats: Arc<Stats>,
  queue: Arc<EventQueue>,
  cancel: CancelToken,
  fatal: OnceLock<FatalError>,
  notify_retry: RetryPolicy,
  insert_retry: RetryPolicy,
  embed_region: EmbedRegion,
  poll_interval: Duration,
}

impl<N, E, S> Shared<N, E, S>
where
  N: Notifier,
  E: FeatureExtractor,
  S: VectorStore,
{
  fn raise_fatal(&self, id: EventId, step: Step, message: String) {
    let fatal = FatalError { id, step, message };
    error!(frame_id = id.frame_id, seq = id.seq, "{}，线程池停止", fatal);
    let _ = self.fatal.set(fatal);
    self.queue.close();
  }

  fn fail<X: Classify + std::fmt::Display>(
    &self,
    report: &mut EventReport,
    step: Step,
    err: &RetryError<X>,
    counter: Counter,
  ) {
    self.record_failure(report, step, err);
    self.stats.incr(counter);
  }

  fn record_failure<X: Classify + std::fmt::Display>(
    &self,
    report: &mut EventReport,
    step: Step,
    err: &RetryError<X>,
  ) {
    let id = report.id;
    warn!(
      frame_id = id.frame_id,
      seq = id.seq,
      step = %step,
      kind = %err.error.kind(),
      "事件处理步骤失败: {}",
      err
    );
    report.failures.push(StepFailure {
      step,
      kind: err.error.kind(),
      attempts: err.attempts,
      message: err.error.to_string(),
    });
    if err.give_up == GiveUp::Cancelled {
      report.abandoned = true;
    }
  }

  fn abandon(&self, report: &mut EventReport) -> bool {
    if self.cancel.is_cancelled() || self.fatal.get().is_some() {
      debug!(frame_id = report.id.frame_id, seq = report.id.seq, "放弃剩余步骤");
      report.abandoned = true;
      return true;
    }
    false
  }

  fn persist(&self, event: &DetectionEvent, report: &mut EventReport) {
    let Some(images) = &self.sinks.images else {
      return;
    };
    match images.persist(event) {
      Ok(path) => {
        self.stats.incr(Counter::Persisted);
        report.image_path = Some(path);
      }
      Err(e) => self.fail(
        report,
        Step::Persist,
        &RetryError {
          error: e,
          attempts: 1,
          give_up: GiveUp::NotRetryable,
        },
        Counter::PersistFailed,
      ),
    }
  }

  /// 文本与附件互不依赖：文本失败时仍尝试上传已保存的快照
  fn notify(&self, event: &DetectionEvent, report: &mut EventReport) {
    let notifier = &self.sinks.notifier;
    let channel = notifier.channel();
    let text = format!("Detection: {} {:.2}", event.label(), event.confidence());

    let mut sent = true;
    if let Err(e) = self
      .notify_retry
      .run(&self.cancel, "发送通知文本", |_| notifier.post_text(channel, &text))
    {
      self.record_failure(report, Step::Notify, &e);
      sent = false;
    }

    if let Some(path) = report.image_path.clone() {
      if !self.abandon(report) {
        let uploaded = self.notify_retry.run(&self.cancel, "发送通知附件", |_| {
          notifier.post_image(channel, &path, event.label(), IMAGE_CAPTION)
        });
        if let Err(e) = uploaded {
          self.record_failure(report, Step::Notify, &e);
          sent = false;
        }
      }
    }

    if sent && !report.abandoned {
      self.stats.incr(Counter::Notified);
      report.notified = true;
    } else if !sent {
      self.stats.incr(Counter::NotifyFailed);
    }
  }

  fn extract(&self, event: &DetectionEvent, report: &mut EventReport) -> Option<Vec<f32>> {
    let image = match self.embed_region {
      EmbedRegion::Frame => Cow::Borrowed(event.frame()),
      EmbedRegion::Crop => match event.crop() {
        Some(crop) => Cow::Owned(crop),
        None => Cow::Borrowed(event.frame()),
      },
    };

    match self.sinks.extractor.extract(&image) {
      Ok(vector) => Some(vector),
      Err(e) => {
        let fatal = e.kind() == ErrorKind::Configuration;
        let message = e.to_string();
        self.fail(
          report,
          Step::Extract,
          &RetryError {
            error: e,
            attempts: 1,
            give_up: GiveUp::NotRetryable,
          },
          Counter::ExtractFailed,
        );
        if fatal {
          self.raise_fatal(report.id, Step::Extract, message);
        }
        None
      }
    }
  }

  fn insert(&self, event: &DetectionEvent, vector: Vec<f32>, report: &mut EventReport) {
    let record = VectorRecord::new(vector, event.label(), event.confidence());
    let store = &self.sinks.store;
    match self
      .insert_retry
      .run(&self.cancel, "写入向量库", |_| store.insert(&record))
    {
      Ok(id) => {
        self.stats.incr(Counter::Indexed);
        report.record_id = Some(id);
        info!(
          frame_id = report.id.frame_id,
          seq = report.id.seq,
          "{} {:.2} 已写入向量库，主键 {}",
          event.label(),
          event.confidence(),
          id
        );
      }
      Err(e) => {
        let fatal = e.error.kind() == ErrorKind::Configuration;
        let message = e.error.to_string();
        self.fail(report, Step::Insert, &e, Counter::InsertFailed);
        if fatal {
          self.raise_fatal(report.id, Step::Insert, message);
        }
      }
    }
  }

  fn process(&self, event: &DetectionEvent) -> EventReport {
    let mut report = EventReport::new(event.id());

    if !self.abandon(&mut report) {
      self.persist(event, &mut report);
    }
    if !self.abandon(&mut report) {
      self.notify(event, &mut report);
    }
    if !self.abandon(&mut report) {
      if let Some(vector) = self.extract(event, &mut report) {
        if !self.abandon(&mut report) {
          self.insert(event, vector, &mut report);
        }
      }
    }

    if report.abandoned {
      self.stats.incr(Counter::Abandoned);
    } else {
      self.stats.incr(Counter::Processed);
    }
    report
  }

  fn run_worker(&self, n: usize) {
    debug!("工作线程 {} 启动", n);
    loop {
      if self.fatal.get().is_some() || self.cancel.is_cancelled() {
        break;
      }
      match self.queue.dequeue_timeout(self.poll_interval) {
        Dequeued::Event(event) => {
          let id = event.id();
          match panic::catch_unwind(AssertUnwindSafe(|| self.process(&event))) {
            Ok(report) => debug!(
              frame_id = id.frame_id,
              seq = id.seq,
              "事件处理完成: {:?}",
              report
            ),
            Err(_) => {
              self.stats.incr(Counter::Panicked);
              error!(
                frame_id = id.frame_id,
                seq = id.seq,
                "工作线程 {} 处理事件时 panic，事件丢失",
                n
              );
            }
          }
        }
        Dequeued::Timeout => continue,
        Dequeued::Closed => break,
      }
    }
    debug!("工作线程 {} 退出", n);
  }
}

/// 线程退出（含 panic）时通知线程池
struct DoneGuard {
  done: Sender<usize>,
  n: usize,
}

impl Drop for DoneGuard {
  fn drop(&mut self) {
    let _ = self.done.send(self.n);
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ShutdownReport {
  /// 宽限期内队列已排空，全部线程正常退出
  pub drained: bool,
  /// 被放弃的排队事件数
  pub abandoned: usize,
  /// 超时后仍未退出、被分离的线程数
  pub detached: usize,
  pub fatal: Option<FatalError>,
}

pub struct SinkPool<N, E, S> {
  shared: Arc<Shared<N, E, S>>,
  workers: Vec<Option<JoinHandle<()>>>,
  done: crossbeam_channel::Receiver<usize>,
}

impl<N, E, S> Drop for SinkPool<N, E, S> {
  fn drop(&mut self) {
    self.shared.queue.close();
    self.shared.cancel.cancel();
  }
}

impl<N, E, S> SinkPool<N, E, S>
where
  N: Notifier + 'static,
  E: FeatureExtractor + 'static,
  S: VectorStore + 'static,
{
  pub fn spawn(
    config: &PipelineConfig,
    queue: Arc<EventQueue>,
    sinks: Arc<Sinks<N, E, S>>,
    stats: Arc<Stats>,
  ) -> Result<Self, PoolError> {
    config.validate()?;

    let shared = Arc::new(Shared {
      sinks,
      stats,
      queue,
      cancel: CancelToken::new(),
      fatal: OnceLock::new(),
      notify_retry: config.notify_retry,
      insert_retry: config.insert_retry,
      embed_region: config.embed_region,
      poll_interval: config.poll_interval,
    });

    let (done_tx, done_rx) = unbounded();
    let mut workers = Vec::with_capacity(config.workers);
    for n in 0..config.workers {
      let worker_shared = shared.clone();
      let guard = DoneGuard {
        done: done_tx.clone(),
        n,
      };
      let spawned = thread::Builder::new()
        .name(format!("vigil-sink-{}", n))
        .spawn(move || {
          let _guard = guard;
          worker_shared.run_worker(n);
        });
      match spawned {
        Ok(handle) => workers.push(Some(handle)),
        Err(e) => {
          shared.queue.close();
          shared.cancel.cancel();
          return Err(PoolError::Spawn(e));
        }
      }
    }
    info!("启动 {} 个工作线程", config.workers);

    Ok(Self {
      shared,
      workers,
      done: done_rx,
    })
  }

  pub fn queue(&self) -> &Arc<EventQueue> {
    &self.shared.queue
  }

  /// 线程池因配置错误停止时返回原因
  pub fn fatal(&self) -> Option<&FatalError> {
    self.shared.fatal.get()
  }

  pub fn process_event(&self, event: &DetectionEvent) -> EventReport {
    self.shared.process(event)
  }

  fn wait_until(&mut self, deadline: Instant) -> usize {
    let mut running = self.workers.iter().filter(|w| w.is_some()).count();
    while running > 0 {
      let Ok(n) = self.done.recv_deadline(deadline) else {
        break;
      };
      if let Some(handle) = self.workers.get_mut(n).and_then(Option::take) {
        if handle.join().is_err() {
          error!("工作线程 {} 异常退出", n);
        }
        running -= 1;
      }
    }
    running
  }

  /// 停止接收事件；宽限期内排空队列，之后取消在途操作并放弃剩余事件
  pub fn shutdown(mut self, grace: Duration, abandon_timeout: Duration) -> ShutdownReport {
    info!("关闭线程池，剩余 {} 个事件", self.shared.queue.len());
    self.shared.queue.close();

    let mut report = ShutdownReport::default();
    let running = self.wait_until(Instant::now() + grace);
    report.drained = running == 0 && self.shared.queue.is_empty();

    if running > 0 || !self.shared.queue.is_empty() {
      self.shared.cancel.cancel();
      let left = self.shared.queue.drain();
      report.abandoned = left.len();
      self.shared.stats.add(Counter::Abandoned, left.len() as u64);
      for event in &left {
        warn!(frame_id = event.frame_id(), seq = event.id().seq, "关闭超时，放弃事件");
      }

      report.detached = self.wait_until(Instant::now() + abandon_timeout);
      if report.detached > 0 {
        error!("{} 个工作线程未能按时退出，已分离", report.detached);
      }
    }

    report.fatal = self.shared.fatal.get().cloned();
    report
  }
}

#[cfg(test)]
mod tests {
  use std::{
    path::Path,
    sync::atomic::{AtomicU32, Ordering},
  };

  use chrono::Utc;
  use image::RgbImage;
  use parking_lot::Mutex;

  use super::*;
  use crate::{
    config::OverflowPolicy,
    event::{BoundingBox, Detection},
    model::ExtractError,
    output::{CollectionSchema, LogNotifier, MemoryStore, NotifyError},
  };

  struct Unit;

  impl FeatureExtractor for Unit {
    fn dimension(&self) -> usize {
      2
    }

    fn extract(&self, _: &RgbImage) -> Result<Vec<f32>, ExtractError> {
      Ok(vec![0.6, 0.8])
    }
  }

  #[derive(Default)]
  struct Recording {
    calls: Mutex<Vec<String>>,
  }

  impl Notifier for Recording {
    fn channel(&self) -> &str {
      "C1"
    }

    fn post_text(&self, _: &str, text: &str) -> Result<(), NotifyError> {
      self.calls.lock().push(text.to_string());
      Ok(())
    }

    fn post_image(&self, _: &str, _: &Path, title: &str, _: &str) -> Result<(), NotifyError> {
      self.calls.lock().push(format!("image:{}", title));
      Ok(())
    }
  }

  fn fast_retry() -> RetryPolicy {
    RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(5))
  }

  fn config() -> PipelineConfig {
    PipelineConfig::default()
      .with_workers(1)
      .with_notify_retry(fast_retry())
      .with_insert_retry(fast_retry())
      .with_poll_interval(Duration::from_millis(10))
  }

  fn event(frame_id: u64) -> DetectionEvent {
    DetectionEvent::new(
      EventId { frame_id, seq: 0 },
      &Detection::new("person", 0.91, BoundingBox::new(0.25, 0.25, 0.5, 0.5)),
      Arc::new(RgbImage::new(8, 8)),
      Utc::now(),
    )
  }

  /// 第一次发送文本时被限流
  #[derive(Default)]
  struct Throttled {
    texts: AtomicU32,
  }

  impl Notifier for Throttled {
    fn channel(&self) -> &str {
      "C1"
    }

    fn post_text(&self, _: &str, _: &str) -> Result<(), NotifyError> {
      match self.texts.fetch_add(1, Ordering::SeqCst) {
        0 => Err(NotifyError::RateLimited { retry_after: None }),
        _ => Ok(()),
      }
    }

    fn post_image(&self, _: &str, _: &Path, _: &str, _: &str) -> Result<(), NotifyError> {
      Ok(())
    }
  }

  struct Broken;

  impl FeatureExtractor for Broken {
    fn dimension(&self) -> usize {
      2
    }

    fn extract(&self, _: &RgbImage) -> Result<Vec<f32>, ExtractError> {
      Err(ExtractError::Extraction("模型输出为空".to_string()))
    }
  }

  struct Slow(Duration);

  impl FeatureExtractor for Slow {
    fn dimension(&self) -> usize {
      2
    }

    fn extract(&self, _: &RgbImage) -> Result<Vec<f32>, ExtractError> {
      thread::sleep(self.0);
      Ok(vec![0.6, 0.8])
    }
  }

  /// 第一次调用时 panic
  #[derive(Default)]
  struct Panicky {
    calls: AtomicU32,
  }

  impl FeatureExtractor for Panicky {
    fn dimension(&self) -> usize {
      2
    }

    fn extract(&self, _: &RgbImage) -> Result<Vec<f32>, ExtractError> {
      if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
        panic!("推理库崩溃");
      }
      Ok(vec![0.6, 0.8])
    }
  }

  fn store(dimension: usize) -> MemoryStore {
    let store = MemoryStore::new("detections");
    store
      .ensure_collection(&CollectionSchema::new("detections", dimension))
      .unwrap();
    store
  }

  #[test]
  fn all_steps_run_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let queue = Arc::new(EventQueue::new(4, OverflowPolicy::RejectNewest).unwrap());
    let sinks = Arc::new(Sinks {
      images: Some(ImageStore::new(dir.path())),
      notifier: Recording::default(),
      extractor: Unit,
      store: store(2),
    });
    let stats = Arc::new(Stats::new());
    let pool = SinkPool::spawn(&config(), queue, sinks.clone(), stats.clone()).unwrap();

    let report = pool.process_event(&event(1));
    assert!(report.failures.is_empty());
    assert!(report.image_path.as_ref().unwrap().exists());
    assert!(report.notified);
    assert_eq!(report.record_id, Some(1));
    assert_eq!(
      *sinks.notifier.calls.lock(),
      vec!["Detection: person 0.91".to_string(), "image:person".to_string()]
    );
    assert_eq!(stats.get(Counter::Processed), 1);

    let shutdown = pool.shutdown(Duration::from_secs(1), Duration::from_secs(1));
    assert!(shutdown.drained);
  }

  #[test]
  fn image_is_not_attached_without_persistence() {
    let queue = Arc::new(EventQueue::new(4, OverflowPolicy::RejectNewest).unwrap());
    let sinks = Arc::new(Sinks {
      images: None,
      notifier: Recording::default(),
      extractor: Unit,
      store: store(2),
    });
    let pool = SinkPool::spawn(&config(), queue, sinks.clone(), Arc::new(Stats::new())).unwrap();
    let report = pool.process_event(&event(1));
    assert!(report.notified);
    assert_eq!(sinks.notifier.calls.lock().len(), 1);
    pool.shutdown(Duration::from_secs(1), Duration::from_secs(1));
  }

  #[test]
  fn dimension_mismatch_stops_the_pool() {
    let queue = Arc::new(EventQueue::new(4, OverflowPolicy::RejectNewest).unwrap());
    let sinks = Arc::new(Sinks {
      images: None,
      notifier: LogNotifier::new("test"),
      extractor: Unit,
      store: store(3),
    });
    let stats = Arc::new(Stats::new());
    let pool = SinkPool::spawn(&config(), queue.clone(), sinks, stats.clone()).unwrap();

    queue.enqueue(event(1));
    let deadline = Instant::now() + Duration::from_secs(5);
    while pool.fatal().is_none() && Instant::now() < deadline {
      thread::sleep(Duration::from_millis(5));
    }

    let fatal = pool.fatal().cloned().unwrap();
    assert_eq!(fatal.step, Step::Insert);
    assert!(queue.is_closed());
    assert_eq!(stats.get(Counter::InsertFailed), 1);

    let shutdown = pool.shutdown(Duration::from_secs(1), Duration::from_secs(1));
    assert_eq!(shutdown.fatal, Some(fatal));
  }

  #[test]
  fn shutdown_drains_queue_within_grace() {
    let queue = Arc::new(EventQueue::new(16, OverflowPolicy::RejectNewest).unwrap());
    let sinks = Arc::new(Sinks {
      images: None,
      notifier: LogNotifier::new("test"),
      extractor: Unit,
      store: store(2),
    });
    let stats = Arc::new(Stats::new());
    let pool = SinkPool::spawn(&config().with_workers(3), queue.clone(), sinks.clone(), stats.clone())
      .unwrap();
    for id in 1..=10 {
      queue.enqueue(event(id));
    }

    let report = pool.shutdown(Duration::from_secs(5), Duration::from_secs(1));
    assert!(report.drained);
    assert_eq!(report.abandoned, 0);
    assert_eq!(stats.get(Counter::Indexed), 10);
    assert_eq!(sinks.store.len(), 10);
  }

  #[test]
  fn zero_workers_is_refused() {
    let queue = Arc::new(EventQueue::new(1, OverflowPolicy::RejectNewest).unwrap());
    let sinks = Arc::new(Sinks {
      images: None,
      notifier: LogNotifier::new("test"),
      extractor: Unit,
      store: store(2),
    });
    let result = SinkPool::spawn(&config().with_workers(0), queue, sinks, Arc::new(Stats::new()));
    assert!(matches!(result, Err(PoolError::Config(ConfigError::ZeroWorkers))));
  }

  #[test]
  fn rate_limited_text_is_retried() {
    let queue = Arc::new(EventQueue::new(4, OverflowPolicy::RejectNewest).unwrap());
    let sinks = Arc::new(Sinks {
      images: None,
      notifier: Throttled::default(),
      extractor: Unit,
      store: store(2),
    });
    let stats = Arc::new(Stats::new());
    let pool = SinkPool::spawn(&config(), queue, sinks.clone(), stats.clone()).unwrap();

    let report = pool.process_event(&event(1));
    assert!(report.notified);
    assert!(report.failures.is_empty());
    assert_eq!(sinks.notifier.texts.load(Ordering::SeqCst), 2);
    assert_eq!(stats.get(Counter::Notified), 1);
    assert_eq!(stats.get(Counter::NotifyFailed), 0);
    pool.shutdown(Duration::from_secs(1), Duration::from_secs(1));
  }

  #[test]
  fn extraction_failure_skips_insert_and_keeps_running() {
    let queue = Arc::new(EventQueue::new(4, OverflowPolicy::RejectNewest).unwrap());
    let sinks = Arc::new(Sinks {
      images: None,
      notifier: Recording::default(),
      extractor: Broken,
      store: store(2),
    });
    let stats = Arc::new(Stats::new());
    let pool = SinkPool::spawn(&config(), queue.clone(), sinks.clone(), stats.clone()).unwrap();

    let report = pool.process_event(&event(1));
    assert!(report.notified);
    assert_eq!(report.record_id, None);
    assert_eq!(report.failed(Step::Extract).unwrap().kind, ErrorKind::Permanent);
    assert!(report.failed(Step::Insert).is_none());
    assert!(!report.abandoned);
    assert_eq!(stats.get(Counter::ExtractFailed), 1);
    assert_eq!(stats.get(Counter::Processed), 1);
    assert_eq!(sinks.store.len(), 0);
    assert!(pool.fatal().is_none());
    assert!(!queue.is_closed());

    let shutdown = pool.shutdown(Duration::from_secs(1), Duration::from_secs(1));
    assert!(shutdown.drained);
    assert_eq!(shutdown.fatal, None);
  }

  #[test]
  fn shutdown_abandons_queue_after_grace() {
    let queue = Arc::new(EventQueue::new(8, OverflowPolicy::RejectNewest).unwrap());
    let sinks = Arc::new(Sinks {
      images: None,
      notifier: LogNotifier::new("test"),
      extractor: Slow(Duration::from_millis(200)),
      store: store(2),
    });
    let stats = Arc::new(Stats::new());
    let pool = SinkPool::spawn(&config(), queue.clone(), sinks, stats.clone()).unwrap();
    for id in 1..=5 {
      queue.enqueue(event(id));
    }

    let report = pool.shutdown(Duration::from_millis(50), Duration::from_secs(5));
    assert!(!report.drained);
    assert!(report.abandoned >= 4);
    assert_eq!(report.detached, 0);
    assert!(queue.is_empty());

    // 宽限期结束时正在提取的事件也计入放弃
    let abandoned = stats.get(Counter::Abandoned);
    let counted = report.abandoned as u64;
    assert!(abandoned == counted || abandoned == counted + 1);
    assert_eq!(stats.get(Counter::Indexed), 0);
  }

  #[test]
  fn panicking_sink_loses_only_its_event() {
    let queue = Arc::new(EventQueue::new(4, OverflowPolicy::RejectNewest).unwrap());
    let sinks = Arc::new(Sinks {
      images: None,
      notifier: LogNotifier::new("test"),
      extractor: Panicky::default(),
      store: store(2),
    });
    let stats = Arc::new(Stats::new());
    let pool = SinkPool::spawn(&config(), queue.clone(), sinks.clone(), stats.clone()).unwrap();
    queue.enqueue(event(1));
    queue.enqueue(event(2));

    let report = pool.shutdown(Duration::from_secs(5), Duration::from_secs(1));
    assert!(report.drained);
    assert_eq!(stats.get(Counter::Panicked), 1);
    assert_eq!(stats.get(Counter::Indexed), 1);
    assert_eq!(sinks.store.len(), 1);
  }
}

// 该文件是 Shanan （山南西风） 项目的一部分。
// tests/pipeline.rs - 适配器到工作线程池的端到端测试
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
  path::Path,
  sync::{
    Arc,
    atomic::{AtomicU32, Ordering},
  },
  time::Duration,
};

use chrono::Utc;
use image::{Rgb, RgbImage};
use parking_lot::Mutex;
use url::Url;

use shanan_vigil::{
  FromUrl,
  adapter::PipelineAdapter,
  config::{OverflowPolicy, PipelineConfig},
  error::ErrorKind,
  event::{BoundingBox, Detection, DetectionEvent, EventId},
  frame::FrameView,
  model::{FeatureExtractor, ModelExtractor},
  output::{
    CollectionSchema, ImageStore, IndexedRecord, MemoryStore, Notifier, NotifyError, SearchHit,
    StoreError, VectorRecord, VectorStore, schema_for,
  },
  pool::{SinkPool, Sinks, Step},
  queue::EventQueue,
  retry::RetryPolicy,
  stats::{Counter, Stats},
};

/// 按脚本返回结果的通知渠道
#[derive(Default)]
struct Scripted {
  fail_text: Option<fn() -> NotifyError>,
  calls: Mutex<Vec<String>>,
}

impl Notifier for Scripted {
  fn channel(&self) -> &str {
    "C-alerts"
  }

  fn post_text(&self, _: &str, text: &str) -> Result<(), NotifyError> {
    self.calls.lock().push(text.to_string());
    match self.fail_text {
      Some(fail) => Err(fail()),
      None => Ok(()),
    }
  }

  fn post_image(&self, _: &str, _: &Path, title: &str, caption: &str) -> Result<(), NotifyError> {
    self.calls.lock().push(format!("{} / {}", title, caption));
    Ok(())
  }
}

/// 前若干次写入返回网络错误的向量库
struct Flaky {
  inner: MemoryStore,
  failures_left: AtomicU32,
  calls: AtomicU32,
}

impl Flaky {
  fn new(failures: u32) -> Self {
    Self {
      inner: MemoryStore::new("detections"),
      failures_left: AtomicU32::new(failures),
      calls: AtomicU32::new(0),
    }
  }
}

impl VectorStore for Flaky {
  fn collection(&self) -> &str {
    self.inner.collection()
  }

  fn schema(&self) -> Option<&CollectionSchema> {
    self.inner.schema()
  }

  fn ensure_collection(&self, schema: &CollectionSchema) -> Result<(), StoreError> {
    self.inner.ensure_collection(schema)
  }

  fn insert(&self, record: &VectorRecord) -> Result<i64, StoreError> {
    self.calls.fetch_add(1, Ordering::SeqCst);
    let left = self.failures_left.load(Ordering::SeqCst);
    if left > 0 {
      self.failures_left.store(left - 1, Ordering::SeqCst);
      return Err(StoreError::Transport("connection reset".to_string()));
    }
    self.inner.insert(record)
  }

  fn get(&self, id: i64) -> Result<Option<IndexedRecord>, StoreError> {
    self.inner.get(id)
  }

  fn search(&self, vector: &[f32], limit: usize) -> Result<Vec<SearchHit>, StoreError> {
    self.inner.search(vector, limit)
  }
}

fn histogram() -> ModelExtractor {
  ModelExtractor::from_url(&Url::parse("histogram://?bins=8").unwrap()).unwrap()
}

fn config() -> PipelineConfig {
  let retry = RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(10));
  PipelineConfig::default()
    .with_workers(1)
    .with_notify_retry(retry)
    .with_insert_retry(retry)
    .with_poll_interval(Duration::from_millis(10))
}

fn gradient(width: u32, height: u32) -> Vec<u8> {
  RgbImage::from_fn(width, height, |x, y| Rgb([(x * 16) as u8, (y * 16) as u8, 128])).into_raw()
}

fn person(confidence: f32) -> Detection {
  Detection::new("person", confidence, BoundingBox::new(0.25, 0.25, 0.5, 0.5))
}

struct Harness<N, S> {
  adapter: PipelineAdapter,
  pool: SinkPool<N, ModelExtractor, S>,
  sinks: Arc<Sinks<N, ModelExtractor, S>>,
  stats: Arc<Stats>,
}

fn harness<N, S>(config: PipelineConfig, images: Option<ImageStore>, notifier: N, store: S) -> Harness<N, S>
where
  N: Notifier + 'static,
  S: VectorStore + 'static,
{
  let extractor = histogram();
  let schema = schema_for(&store, extractor.dimension()).unwrap();
  store.ensure_collection(&schema).unwrap();

  let stats = Arc::new(Stats::new());
  let queue = Arc::new(EventQueue::new(config.queue_capacity, config.overflow).unwrap());
  let adapter = PipelineAdapter::new(&config, queue.clone(), stats.clone());
  let sinks = Arc::new(Sinks {
    images,
    notifier,
    extractor,
    store,
  });
  let pool = SinkPool::spawn(&config, queue, sinks.clone(), stats.clone()).unwrap();
  Harness {
    adapter,
    pool,
    sinks,
    stats,
  }
}

#[test]
fn only_matching_labels_are_enqueued_in_order() {
  let config = PipelineConfig::default();
  let queue = Arc::new(EventQueue::new(config.queue_capacity, config.overflow).unwrap());
  let adapter = PipelineAdapter::new(&config, queue.clone(), Arc::new(Stats::new()));
  let buffer = gradient(8, 8);
  let frame = FrameView::rgb(8, 8, &buffer);

  adapter.on_frame(&frame, &[person(0.91)]);
  adapter.on_frame(&frame, &[person(0.40)]);
  adapter.on_frame(
    &frame,
    &[Detection::new("car", 0.99, BoundingBox::new(0.0, 0.0, 1.0, 1.0))],
  );

  let first = queue.try_dequeue().unwrap();
  let second = queue.try_dequeue().unwrap();
  assert_eq!((first.frame_id(), first.confidence()), (1, 0.91));
  assert_eq!((second.frame_id(), second.confidence()), (2, 0.40));
  assert!(queue.try_dequeue().is_none());
}

#[test]
fn permanent_notify_failure_still_indexes() {
  let notifier = Scripted {
    fail_text: Some(|| NotifyError::Permanent("channel_not_found".to_string())),
    ..Scripted::default()
  };
  let h = harness(config(), None, notifier, MemoryStore::new("detections"));
  let buffer = gradient(8, 8);
  h.adapter.on_frame(&FrameView::rgb(8, 8, &buffer), &[person(0.91)]);

  let report = h.pool.shutdown(Duration::from_secs(5), Duration::from_secs(1));
  assert!(report.drained);

  // 永久错误不重试
  assert_eq!(h.sinks.notifier.calls.lock().len(), 1);
  assert_eq!(h.stats.get(Counter::NotifyFailed), 1);
  assert_eq!(h.stats.get(Counter::Indexed), 1);

  let stored = h.sinks.store.get(1).unwrap().unwrap();
  assert_eq!(stored.label, "person");
  assert!((stored.confidence - 0.91).abs() < 1e-6);
  assert_eq!(stored.vector.len(), 512);
}

#[test]
fn failed_text_still_uploads_snapshot() {
  let notifier = Scripted {
    fail_text: Some(|| NotifyError::Permanent("not_in_channel".to_string())),
    ..Scripted::default()
  };
  let dir = tempfile::tempdir().unwrap();
  let h = harness(
    config(),
    Some(ImageStore::new(dir.path())),
    notifier,
    MemoryStore::new("detections"),
  );
  let event = DetectionEvent::new(
    EventId { frame_id: 7, seq: 0 },
    &person(0.91),
    Arc::new(RgbImage::from_raw(8, 8, gradient(8, 8)).unwrap()),
    Utc::now(),
  );

  let report = h.pool.process_event(&event);
  assert_eq!(report.id, event.id());
  let failure = report.failed(Step::Notify).unwrap();
  assert_eq!(failure.kind, ErrorKind::Permanent);
  assert_eq!(failure.attempts, 1);
  assert_eq!(report.failures.len(), 1);
  assert!(!report.notified);
  assert!(report.image_path.unwrap().exists());
  assert!(report.record_id.is_some());
  assert!(!report.abandoned);

  assert_eq!(
    *h.sinks.notifier.calls.lock(),
    vec![
      "Detection: person 0.91".to_string(),
      "person / Live Camera image".to_string()
    ]
  );
  assert_eq!(h.stats.get(Counter::NotifyFailed), 1);
  assert_eq!(h.stats.get(Counter::Notified), 0);
}

#[test]
fn flaky_store_is_written_exactly_once() {
  let h = harness(config(), None, Scripted::default(), Flaky::new(2));
  let buffer = gradient(8, 8);
  h.adapter.on_frame(&FrameView::rgb(8, 8, &buffer), &[person(0.91)]);

  let report = h.pool.shutdown(Duration::from_secs(5), Duration::from_secs(1));
  assert!(report.drained);
  assert_eq!(h.sinks.store.calls.load(Ordering::SeqCst), 3);
  assert_eq!(h.sinks.store.inner.len(), 1);
  assert_eq!(h.stats.get(Counter::Indexed), 1);
  assert_eq!(h.stats.get(Counter::InsertFailed), 0);
}

#[test]
fn exhausted_insert_retries_give_up_without_requeue() {
  let h = harness(config(), None, Scripted::default(), Flaky::new(5));
  let buffer = gradient(8, 8);
  h.adapter.on_frame(&FrameView::rgb(8, 8, &buffer), &[person(0.91)]);

  let report = h.pool.shutdown(Duration::from_secs(5), Duration::from_secs(1));
  assert!(report.drained);
  assert!(report.fatal.is_none());
  assert_eq!(h.sinks.store.calls.load(Ordering::SeqCst), 3);
  assert!(h.sinks.store.inner.is_empty());
  assert_eq!(h.stats.get(Counter::InsertFailed), 1);
}

#[test]
fn stored_vectors_have_unit_norm() {
  let h = harness(config(), None, Scripted::default(), MemoryStore::new("detections"));
  let buffer = gradient(16, 16);
  for confidence in [0.9, 0.8, 0.7] {
    h.adapter.on_frame(&FrameView::rgb(16, 16, &buffer), &[person(confidence)]);
  }

  h.pool.shutdown(Duration::from_secs(5), Duration::from_secs(1));
  let records = h.sinks.store.records();
  assert_eq!(records.len(), 3);
  for record in records {
    let norm = record.vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    assert!((norm - 1.0).abs() < 1e-5, "norm = {}", norm);
  }
}

#[test]
fn indexed_frame_is_found_by_search() {
  let h = harness(config().with_annotate(false), None, Scripted::default(), MemoryStore::new("detections"));
  let buffer = gradient(16, 16);
  h.adapter.on_frame(&FrameView::rgb(16, 16, &buffer), &[person(0.9)]);
  h.pool.shutdown(Duration::from_secs(5), Duration::from_secs(1));

  let query = RgbImage::from_raw(16, 16, buffer).unwrap();
  let vector = h.sinks.extractor.extract(&query).unwrap();
  let hits = h.sinks.store.search(&vector, 1).unwrap();
  assert_eq!(hits[0].id, 1);
  assert!(hits[0].score > 0.99);
}

#[test]
fn each_event_is_processed_by_one_worker() {
  let config = config().with_workers(4).with_queue_capacity(64);
  let h = harness(config, None, Scripted::default(), Flaky::new(0));
  let buffer = gradient(8, 8);
  for _ in 0..40 {
    h.adapter.on_frame(&FrameView::rgb(8, 8, &buffer), &[person(0.9)]);
  }

  let report = h.pool.shutdown(Duration::from_secs(10), Duration::from_secs(1));
  assert!(report.drained);
  assert_eq!(h.stats.get(Counter::Enqueued), 40);
  assert_eq!(h.sinks.store.calls.load(Ordering::SeqCst), 40);
  assert_eq!(h.sinks.store.inner.len(), 40);
  assert_eq!(h.sinks.notifier.calls.lock().len(), 40);
}

#[test]
fn full_queue_rejects_newest_and_counts() {
  let config = PipelineConfig::default()
    .with_queue_capacity(2)
    .with_overflow(OverflowPolicy::RejectNewest);
  let queue = Arc::new(EventQueue::new(config.queue_capacity, config.overflow).unwrap());
  let stats = Arc::new(Stats::new());
  let adapter = PipelineAdapter::new(&config, queue.clone(), stats.clone());
  let buffer = gradient(8, 8);
  let frame = FrameView::rgb(8, 8, &buffer);

  for _ in 0..5 {
    adapter.on_frame(&frame, &[person(0.9)]);
  }
  assert_eq!(queue.len(), 2);
  assert_eq!(stats.get(Counter::Rejected), 3);
  assert_eq!(queue.try_dequeue().unwrap().frame_id(), 1);
}

// 该文件是 Shanan （山南西风） 项目的一部分。
// src/adapter.rs - 逐帧回调适配
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

//! # 管道适配器
//!
//! 运行在上游实时线程上：筛选检测、复制帧快照、入队。
//! 不做网络 I/O，不做模型推理，也从不向上游返回错误。

use std::{
  collections::HashMap,
  sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
  },
  time::{Duration, Instant},
};

use chrono::Utc;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::{
  config::{LabelFilter, PipelineConfig},
  event::{Detection, DetectionEvent, EventId},
  frame::FrameView,
  output::draw::Draw,
  queue::{EnqueueOutcome, EventQueue},
  stats::{Counter, Stats},
};

/// 单帧处理结果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameOutcome {
  pub frame_id: u64,
  pub enqueued: usize,
  pub rejected: usize,
  pub evicted: usize,
  pub filtered: usize,
  pub debounced: usize,
  pub invalid: usize,
  /// 队列已关闭时到达的事件，不计入溢出
  pub closed: usize,
}

pub struct PipelineAdapter {
  labels: LabelFilter,
  min_confidence: f32,
  debounce: Option<Duration>,
  annotate: bool,
  draw: Draw,
  queue: Arc<EventQueue>,
  stats: Arc<Stats>,
  next_frame: AtomicU64,
  last_accepted: Mutex<HashMap<String, Instant>>,
}

impl PipelineAdapter {
  pub fn new(config: &PipelineConfig, queue: Arc<EventQueue>, stats: Arc<Stats>) -> Self {
    Self {
      labels: config.labels.clone(),
      min_confidence: config.min_confidence,
      debounce: config.debounce,
      annotate: config.annotate,
      draw: Draw::default(),
      queue,
      stats,
      next_frame: AtomicU64::new(1),
      last_accepted: Mutex::new(HashMap::new()),
    }
  }

  pub fn with_draw(mut self, draw: Draw) -> Self {
    self.draw = draw;
    self
  }

  /// 已处理的帧数
  pub fn frames_seen(&self) -> u64 {
    self.next_frame.load(Ordering::Relaxed) - 1
  }

  fn is_debounced(&self, label: &str, now: Instant) -> bool {
    let Some(window) = self.debounce else {
      return false;
    };
    self
      .last_accepted
      .lock()
      .get(label)
      .is_some_and(|last| now.duration_since(*last) < window)
  }

  /// 上游每帧调用一次；`frame` 只在调用期间有效
  pub fn on_frame(&self, frame: &FrameView<'_>, detections: &[Detection]) -> FrameOutcome {
    let frame_id = self.next_frame.fetch_add(1, Ordering::Relaxed);
    let captured_at = Utc::now();
    let now = Instant::now();
    let mut outcome = FrameOutcome {
      frame_id,
      ..FrameOutcome::default()
    };

    let mut qualifying: Vec<&Detection> = Vec::new();
    for detection in detections {
      if !(0.0..=1.0).contains(&detection.confidence) || !detection.bbox.is_finite() {
        debug!(frame_id, "检测结果无效: {:?}", detection);
        outcome.invalid += 1;
      } else if !self.labels.contains(&detection.label) || detection.confidence < self.min_confidence {
        outcome.filtered += 1;
      } else if self.is_debounced(&detection.label, now) {
        outcome.debounced += 1;
      } else {
        qualifying.push(detection);
      }
    }

    if !qualifying.is_empty() {
      self.enqueue_all(frame, &qualifying, captured_at, now, &mut outcome);
      if outcome.rejected + outcome.evicted > 0 {
        warn!(
          frame_id,
          "队列已满: 拒绝 {} 个，挤出 {} 个",
          outcome.rejected, outcome.evicted
        );
      }
    }

    self.stats.add(Counter::InvalidInput, outcome.invalid as u64);
    self.stats.add(Counter::Filtered, outcome.filtered as u64);
    self.stats.add(Counter::Debounced, outcome.debounced as u64);
    self.stats.add(Counter::Enqueued, outcome.enqueued as u64);
    self.stats.add(Counter::Rejected, outcome.rejected as u64);
    self.stats.add(Counter::Evicted, outcome.evicted as u64);
    outcome
  }

  fn enqueue_all(
    &self,
    frame: &FrameView<'_>,
    qualifying: &[&Detection],
    captured_at: chrono::DateTime<Utc>,
    now: Instant,
    outcome: &mut FrameOutcome,
  ) {
    let frame_id = outcome.frame_id;
    // 快照在回调返回前复制出来
    let mut image = match frame.to_rgb_image() {
      Ok(image) => image,
      Err(e) => {
        warn!(frame_id, "帧缓冲无效，丢弃 {} 条检测: {}", qualifying.len(), e);
        outcome.invalid += qualifying.len();
        return;
      }
    };
    if self.annotate {
      self.draw.draw_boxes(&mut image, qualifying.iter().map(|d| &d.bbox));
    }
    let snapshot = Arc::new(image);

    for (index, detection) in qualifying.iter().enumerate() {
      let Ok(seq) = u16::try_from(index) else {
        warn!(frame_id, "单帧检测数超过上限，其余 {} 条被丢弃", qualifying.len() - index);
        outcome.rejected += qualifying.len() - index;
        break;
      };
      let id = EventId { frame_id, seq };
      let event = DetectionEvent::new(id, detection, snapshot.clone(), captured_at);

      match self.queue.enqueue(event) {
        EnqueueOutcome::Accepted => outcome.enqueued += 1,
        EnqueueOutcome::AcceptedEvicting(evicted) => {
          outcome.enqueued += 1;
          outcome.evicted += 1;
          debug!(frame_id, seq, "队列已满，丢弃最早的事件 {}", evicted);
        }
        EnqueueOutcome::Rejected => {
          outcome.rejected += 1;
          debug!(frame_id, seq, "队列已满，拒绝新事件: {}", detection.label);
          continue;
        }
        EnqueueOutcome::Closed => {
          outcome.closed += 1;
          debug!(frame_id, seq, "队列已关闭，拒绝新事件");
          continue;
        }
      }

      if self.debounce.is_some() {
        self.last_accepted.lock().insert(detection.label.clone(), now);
      }
    }
  }
}

// 该文件是 Shanan （山南西风） 项目的一部分。
// src/queue.rs - 检测事件有界队列
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

//! 实时生产者线程与工作线程之间唯一的共享可变结构。
//!
//! 生产者侧的 [`EventQueue::enqueue`] 只持锁做 O(1) 的入队或出队，
//! 从不等待消费者；队列满时按 [`OverflowPolicy`] 处理并计数。

use std::{
  collections::VecDeque,
  sync::atomic::{AtomicU64, Ordering},
  time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex};
use thiserror::Error;

use crate::{
  config::OverflowPolicy,
  error::{Classify, ErrorKind},
  event::{DetectionEvent, EventId},
};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
  #[error("队列容量必须大于 0")]
  ZeroCapacity,
}

impl Classify for QueueError {
  fn kind(&self) -> ErrorKind {
    ErrorKind::Configuration
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
  Accepted,
  /// 已入队，但挤出了最早的事件
  AcceptedEvicting(EventId),
  /// 队列已满，新事件被丢弃
  Rejected,
  /// 队列已关闭，不再接收事件
  Closed,
}

impl EnqueueOutcome {
  pub fn is_accepted(&self) -> bool {
    matches!(
      self,
      EnqueueOutcome::Accepted | EnqueueOutcome::AcceptedEvicting(_)
    )
  }
}

#[derive(Debug)]
pub enum Dequeued {
  Event(DetectionEvent),
  /// 等待超时，队列仍为空
  Timeout,
  /// 队列已关闭且为空
  Closed,
}

#[derive(Debug)]
struct Slots {
  items: VecDeque<DetectionEvent>,
  closed: bool,
}

#[derive(Debug)]
pub struct EventQueue {
  slots: Mutex<Slots>,
  not_empty: Condvar,
  capacity: usize,
  policy: OverflowPolicy,
  dropped: AtomicU64,
}

impl EventQueue {
  pub fn new(capacity: usize, policy: OverflowPolicy) -> Result<Self, QueueError> {
    if capacity == 0 {
      return Err(QueueError::ZeroCapacity);
    }
    Ok(Self {
      slots: Mutex::new(Slots {
        items: VecDeque::with_capacity(capacity),
        closed: false,
      }),
      not_empty: Condvar::new(),
      capacity,
      policy,
      dropped: AtomicU64::new(0),
    })
  }

  /// 非阻塞入队
  pub fn enqueue(&self, event: DetectionEvent) -> EnqueueOutcome {
    let outcome = {
      let mut slots = self.slots.lock();
      if slots.closed {
        return EnqueueOutcome::Closed;
      }

      if slots.items.len() < self.capacity {
        slots.items.push_back(event);
        EnqueueOutcome::Accepted
      } else {
        match self.policy {
          OverflowPolicy::RejectNewest => {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return EnqueueOutcome::Rejected;
          }
          OverflowPolicy::DropOldest => {
            let evicted = slots.items.pop_front().map(|e| e.id());
            slots.items.push_back(event);
            self.dropped.fetch_add(1, Ordering::Relaxed);
            match evicted {
              Some(id) => EnqueueOutcome::AcceptedEvicting(id),
              None => EnqueueOutcome::Accepted,
            }
          }
        }
      }
    };

    self.not_empty.notify_one();
    outcome
  }

  /// 按 FIFO 顺序取出一个事件，最多等待 `timeout`
  pub fn dequeue_timeout(&self, timeout: Duration) -> Dequeued {
    let deadline = Instant::now() + timeout;
    let mut slots = self.slots.lock();
    loop {
      if let Some(event) = slots.items.pop_front() {
        return Dequeued::Event(event);
      }
      if slots.closed {
        return Dequeued::Closed;
      }
      if self.not_empty.wait_until(&mut slots, deadline).timed_out() {
        return match slots.items.pop_front() {
          Some(event) => Dequeued::Event(event),
          None if slots.closed => Dequeued::Closed,
          None => Dequeued::Timeout,
        };
      }
    }
  }

  /// 非阻塞取出
  pub fn try_dequeue(&self) -> Option<DetectionEvent> {
    self.slots.lock().items.pop_front()
  }

  /// 停止接收新事件；已排队的事件仍可被取出
  pub fn close(&self) {
    self.slots.lock().closed = true;
    self.not_empty.notify_all();
  }

  pub fn is_closed(&self) -> bool {
    self.slots.lock().closed
  }

  /// 取走全部剩余事件
  pub fn drain(&self) -> Vec<DetectionEvent> {
    self.slots.lock().items.drain(..).collect()
  }

  pub fn len(&self) -> usize {
    self.slots.lock().items.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  pub fn capacity(&self) -> usize {
    self.capacity
  }

  pub fn policy(&self) -> OverflowPolicy {
    self.policy
  }

  /// 因溢出而丢弃的事件数（拒绝的新事件或被挤出的旧事件）
  pub fn dropped(&self) -> u64 {
    self.dropped.load(Ordering::Relaxed)
  }
}

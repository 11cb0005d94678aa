// 该文件是 Shanan （山南西风） 项目的一部分。
// src/stats.rs - 事件计数器
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

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counter {
  /// 入队成功
  Enqueued,
  /// 标签或置信度不满足过滤条件
  Filtered,
  /// 去重窗口内被抑制
  Debounced,
  /// 队列满，新事件被拒绝
  Rejected,
  /// 队列满，旧事件被挤出
  Evicted,
  /// 帧缓冲或检测数据损坏
  InvalidInput,
  Processed,
  Persisted,
  PersistFailed,
  Notified,
  NotifyFailed,
  ExtractFailed,
  Indexed,
  InsertFailed,
  /// 处理过程中下游 panic，事件丢失
  Panicked,
  /// 关闭时未处理完被放弃
  Abandoned,
}

const COUNTERS: usize = Counter::Abandoned as usize + 1;

/// 线程安全的计数器集合，生产者与工作线程共享
#[derive(Debug, Default)]
pub struct Stats {
  counters: [AtomicU64; COUNTERS],
}

impl Stats {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn incr(&self, counter: Counter) {
    self.add(counter, 1);
  }

  pub fn add(&self, counter: Counter, n: u64) {
    self.counters[counter as usize].fetch_add(n, Ordering::Relaxed);
  }

  pub fn get(&self, counter: Counter) -> u64 {
    self.counters[counter as usize].load(Ordering::Relaxed)
  }

  pub fn snapshot(&self) -> StatsSnapshot {
    StatsSnapshot {
      enqueued: self.get(Counter::Enqueued),
      filtered: self.get(Counter::Filtered),
      debounced: self.get(Counter::Debounced),
      rejected: self.get(Counter::Rejected),
      evicted: self.get(Counter::Evicted),
      invalid_input: self.get(Counter::InvalidInput),
      processed: self.get(Counter::Processed),
      persisted: self.get(Counter::Persisted),
      persist_failed: self.get(Counter::PersistFailed),
      notified: self.get(Counter::Notified),
      notify_failed: self.get(Counter::NotifyFailed),
      extract_failed: self.get(Counter::ExtractFailed),
      indexed: self.get(Counter::Indexed),
      insert_failed: self.get(Counter::InsertFailed),
      panicked: self.get(Counter::Panicked),
      abandoned: self.get(Counter::Abandoned),
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct StatsSnapshot {
  pub enqueued: u64,
  pub filtered: u64,
  pub debounced: u64,
  pub rejected: u64,
  pub evicted: u64,
  pub invalid_input: u64,
  pub processed: u64,
  pub persisted: u64,
  pub persist_failed: u64,
  pub notified: u64,
  pub notify_failed: u64,
  pub extract_failed: u64,
  pub indexed: u64,
  pub insert_failed: u64,
  pub panicked: u64,
  pub abandoned: u64,
}

impl StatsSnapshot {
  pub fn to_json(&self) -> String {
    serde_json::to_string(self).unwrap_or_default()
  }
}

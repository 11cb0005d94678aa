// 该文件是 Shanan （山南西风） 项目的一部分。
// src/retry.rs - 指数退避重试与取消
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

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::warn;

use crate::{config::ConfigError, error::Classify};

/// 取消令牌，可在等待中被唤醒
#[derive(Debug, Default)]
pub struct CancelToken {
  cancelled: Mutex<bool>,
  cond: Condvar,
}

impl CancelToken {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn cancel(&self) {
    let mut cancelled = self.cancelled.lock();
    *cancelled = true;
    self.cond.notify_all();
  }

  pub fn is_cancelled(&self) -> bool {
    *self.cancelled.lock()
  }

  /// 等待指定时长，返回 `true` 表示等待期间已被取消
  pub fn sleep(&self, duration: Duration) -> bool {
    let deadline = Instant::now() + duration;
    let mut cancelled = self.cancelled.lock();
    while !*cancelled {
      if self.cond.wait_until(&mut cancelled, deadline).timed_out() {
        break;
      }
    }
    *cancelled
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GiveUp {
  /// 非瞬时错误，不重试
  NotRetryable,
  /// 重试次数耗尽
  Exhausted,
  /// 等待重试期间被取消
  Cancelled,
}

#[derive(Debug)]
pub struct RetryError<E> {
  pub error: E,
  pub attempts: u32,
  pub give_up: GiveUp,
}

impl<E> RetryError<E> {
  pub fn into_inner(self) -> E {
    self.error
  }
}

impl<E: std::fmt::Display> std::fmt::Display for RetryError<E> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{} (尝试 {} 次, {:?})", self.error, self.attempts, self.give_up)
  }
}

/// 有界次数的指数退避
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
  pub max_attempts: u32,
  pub base_delay: Duration,
  pub max_delay: Duration,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self {
      max_attempts: 3,
      base_delay: Duration::from_millis(500),
      max_delay: Duration::from_secs(8),
    }
  }
}

impl RetryPolicy {
  pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
    Self {
      max_attempts,
      base_delay,
      max_delay,
    }
  }

  pub fn validate(&self) -> Result<(), ConfigError> {
    if self.max_attempts == 0 {
      return Err(ConfigError::InvalidRetry("最大尝试次数必须大于 0".to_string()));
    }
    if self.base_delay > self.max_delay {
      return Err(ConfigError::InvalidRetry(format!(
        "基础退避 {:?} 大于最大退避 {:?}",
        self.base_delay, self.max_delay
      )));
    }
    Ok(())
  }

  /// 第 `attempt` 次失败后的等待时间（`attempt` 从 1 开始）
  pub fn delay_for(&self, attempt: u32, hint: Option<Duration>) -> Duration {
    let shift = attempt.saturating_sub(1).min(16);
    let backoff = self.base_delay.saturating_mul(1u32 << shift);
    let delay = match hint {
      Some(hint) => backoff.max(hint),
      None => backoff,
    };
    delay.min(self.max_delay)
  }

  /// 执行 `op`，瞬时错误按退避重试，其余错误立即返回
  pub fn run<T, E, F>(&self, cancel: &CancelToken, what: &str, mut op: F) -> Result<T, RetryError<E>>
  where
    E: Classify + std::fmt::Display,
    F: FnMut(u32) -> Result<T, E>,
  {
    let max_attempts = self.max_attempts.max(1);
    let mut attempt = 1;
    loop {
      let error = match op(attempt) {
        Ok(value) => return Ok(value),
        Err(error) => error,
      };

      if !error.is_transient() {
        return Err(RetryError {
          error,
          attempts: attempt,
          give_up: GiveUp::NotRetryable,
        });
      }
      if attempt >= max_attempts {
        return Err(RetryError {
          error,
          attempts: attempt,
          give_up: GiveUp::Exhausted,
        });
      }

      let delay = self.delay_for(attempt, error.retry_after());
      warn!(
        "{} 第 {}/{} 次失败: {}，{:.2?} 后重试",
        what, attempt, max_attempts, error, delay
      );
      if cancel.sleep(delay) {
        return Err(RetryError {
          error,
          attempts: attempt,
          give_up: GiveUp::Cancelled,
        });
      }
      attempt += 1;
    }
  }
}

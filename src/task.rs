// 该文件是 Shanan （山南西风） 项目的一部分。
// src/task.rs - 任务定义
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
  thread,
  time::{Duration, Instant},
};

use crossbeam_channel::{Receiver, RecvTimeoutError, bounded};
use tracing::{debug, info, warn};

use crate::{
  adapter::PipelineAdapter,
  input::{ReplayError, ReplayFrame},
};

/// 中断后强制退出前的等待时间
pub const FORCE_EXIT_AFTER: Duration = Duration::from_secs(30);

/// 安装 Ctrl-C 处理：首次中断时通知返回的接收端，并在 30 秒后强制退出进程
pub fn interrupt_channel() -> Result<Receiver<()>, ctrlc::Error> {
  let (tx, rx) = bounded(1);
  ctrlc::set_handler(move || {
    info!("收到中断信号，准备退出...");
    let _ = tx.try_send(());
    thread::spawn(|| {
      thread::sleep(FORCE_EXIT_AFTER);
      warn!("强制退出程序");
      std::process::exit(1);
    });
  })?;
  Ok(rx)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
  /// 输入耗尽
  Exhausted,
  /// 达到指定帧数
  FrameLimit,
  Interrupted,
  /// 线程池因配置错误停止
  Fatal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskSummary {
  pub frames: usize,
  pub skipped: usize,
  pub enqueued: usize,
  pub stopped: StopReason,
}

/// 按帧率把输入逐帧送入适配器，直到输入耗尽、收到中断或线程池停止
#[derive(Default, Debug)]
pub struct ContinuousTask {
  frame_number: Option<usize>,
  fps: Option<f64>,
}

impl ContinuousTask {
  pub fn with_frame_number(mut self, frame_number: Option<usize>) -> Self {
    self.frame_number = frame_number;
    self
  }

  pub fn with_fps(mut self, fps: Option<f64>) -> Self {
    self.fps = fps.filter(|f| f.is_finite() && *f > 0.0);
    self
  }

  pub fn run<I, F>(
    &self,
    input: I,
    adapter: &PipelineAdapter,
    stop: &Receiver<()>,
    is_fatal: F,
  ) -> TaskSummary
  where
    I: Iterator<Item = Result<ReplayFrame, ReplayError>>,
    F: Fn() -> bool,
  {
    info!("开始任务...");
    let period = self.fps.map(|fps| Duration::from_secs_f64(1.0 / fps));
    let mut summary = TaskSummary {
      frames: 0,
      skipped: 0,
      enqueued: 0,
      stopped: StopReason::Exhausted,
    };
    let mut next_due = Instant::now();

    for frame in input {
      if is_fatal() {
        summary.stopped = StopReason::Fatal;
        break;
      }

      match frame {
        Ok(frame) => {
          let outcome = adapter.on_frame(&frame.view(), &frame.detections);
          summary.enqueued += outcome.enqueued;
          debug!(
            frame_id = outcome.frame_id,
            "{}: {} 条检测，入队 {}",
            frame.path.display(),
            frame.detections.len(),
            outcome.enqueued
          );
        }
        Err(e) => {
          warn!("跳过无法读取的帧: {}", e);
          summary.skipped += 1;
        }
      }
      summary.frames += 1;

      if self.frame_number.is_some_and(|n| summary.frames >= n) {
        info!("达到指定帧数 {}, 退出任务循环", summary.frames);
        summary.stopped = StopReason::FrameLimit;
        break;
      }

      // 按帧率等待，同时响应中断
      let wait = match period {
        Some(period) => {
          next_due += period;
          next_due.saturating_duration_since(Instant::now())
        }
        None => Duration::ZERO,
      };
      let interrupted = match stop.recv_timeout(wait) {
        Ok(()) => true,
        Err(RecvTimeoutError::Timeout) => false,
        Err(RecvTimeoutError::Disconnected) => {
          thread::sleep(wait);
          false
        }
      };
      if interrupted {
        warn!("中断信号接收，退出任务循环");
        summary.stopped = StopReason::Interrupted;
        break;
      }
    }

    if summary.stopped == StopReason::Exhausted && is_fatal() {
      summary.stopped = StopReason::Fatal;
    }
    info!(
      "任务完成: {} 帧，跳过 {}，入队 {} 个事件",
      summary.frames, summary.skipped, summary.enqueued
    );
    summary
  }
}

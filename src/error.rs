// 该文件是 Shanan （山南西风） 项目的一部分。
// src/error.rs - 错误分类
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

use std::time::Duration;

use serde::Serialize;

/// 外部错误的处理分类
///
/// - `Transient`: 网络、超时、限流，按退避策略重试
/// - `Permanent`: 鉴权、校验失败，记录并放弃当前步骤
/// - `InvalidInput`: 帧或图像损坏，丢弃事件并计数
/// - `Configuration`: 维度不匹配、缺少凭据，启动即失败
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
  Transient,
  Permanent,
  InvalidInput,
  Configuration,
}

impl std::fmt::Display for ErrorKind {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let name = match self {
      ErrorKind::Transient => "transient",
      ErrorKind::Permanent => "permanent",
      ErrorKind::InvalidInput => "invalid_input",
      ErrorKind::Configuration => "configuration",
    };
    f.write_str(name)
  }
}

pub trait Classify {
  fn kind(&self) -> ErrorKind;

  /// 服务端给出的最短等待时间（例如 HTTP `Retry-After`）
  fn retry_after(&self) -> Option<Duration> {
    None
  }

  fn is_transient(&self) -> bool {
    self.kind() == ErrorKind::Transient
  }
}

/// 根据 reqwest 错误判断是否可以重试
pub(crate) fn classify_transport(err: &reqwest::Error) -> ErrorKind {
  if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
    ErrorKind::Transient
  } else if err.is_decode() {
    ErrorKind::Permanent
  } else {
    match err.status() {
      Some(status) if status.as_u16() == 429 || status.is_server_error() => ErrorKind::Transient,
      _ => ErrorKind::Permanent,
    }
  }
}

/// 解析 `Retry-After` 头（仅支持秒数）
pub(crate) fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
  headers
    .get(reqwest::header::RETRY_AFTER)
    .and_then(|v| v.to_str().ok())
    .and_then(|v| v.trim().parse::<u64>().ok())
    .map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
  use super::*;
  use reqwest::header::{HeaderMap, HeaderValue, RETRY_AFTER};

  #[test]
  fn retry_after_seconds() {
    let mut headers = HeaderMap::new();
    headers.insert(RETRY_AFTER, HeaderValue::from_static("3"));
    assert_eq!(parse_retry_after(&headers), Some(Duration::from_secs(3)));
  }

  #[test]
  fn retry_after_http_date_is_ignored() {
    let mut headers = HeaderMap::new();
    headers.insert(
      RETRY_AFTER,
      HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT"),
    );
    assert_eq!(parse_retry_after(&headers), None);
  }

  #[test]
  fn kind_display_is_snake_case() {
    assert_eq!(ErrorKind::InvalidInput.to_string(), "invalid_input");
    assert_eq!(
      serde_json::to_string(&ErrorKind::Configuration).unwrap(),
      "\"configuration\""
    );
  }
}
